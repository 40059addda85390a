use scaf_dsl::ast::{SetupClause, Span, Suite, Test, TestOrGroup};
use tower_lsp::lsp_types::{FoldingRange, FoldingRangeKind};

// Source lines are 1-indexed, folding lines are not.
fn push_region(ranges: &mut Vec<FoldingRange>, span: Span, collapsed: impl FnOnce() -> String) {
    if span.end.line > span.start.line {
        ranges.push(FoldingRange {
            start_line: span.start.line.saturating_sub(1),
            start_character: None,
            end_line: span.end.line.saturating_sub(1),
            end_character: None,
            kind: Some(FoldingRangeKind::Region),
            collapsed_text: Some(collapsed()),
        });
    }
}

fn push_setup(ranges: &mut Vec<FoldingRange>, setup: Option<&SetupClause>) {
    if let Some(setup) = setup.filter(|s| s.is_block) {
        push_region(ranges, setup.span, || "setup { ... }".to_string());
    }
}

fn push_test(ranges: &mut Vec<FoldingRange>, test: &Test) {
    push_region(ranges, test.span, || match &test.name {
        Some(name) => format!("test \"{}\" {{ ... }}", name.value),
        None => "test { ... }".to_string(),
    });
    push_setup(ranges, test.setup.as_ref());
    for assert in &test.asserts {
        push_region(ranges, assert.span, || "assert { ... }".to_string());
    }
}

fn push_items(ranges: &mut Vec<FoldingRange>, items: &[TestOrGroup]) {
    for item in items {
        match item {
            TestOrGroup::Test(test) => push_test(ranges, test),
            TestOrGroup::Group(group) => {
                push_region(ranges, group.span, || match &group.name {
                    Some(name) => format!("group \"{}\" {{ ... }}", name.value),
                    None => "group { ... }".to_string(),
                });
                push_setup(ranges, group.setup.as_ref());
                push_items(ranges, &group.items);
            }
        }
    }
}

pub fn folding_ranges(suite: &Suite) -> Vec<FoldingRange> {
    let mut ranges = Vec::new();

    // Multi-line query bodies
    for query in &suite.queries {
        push_region(&mut ranges, query.span, || format!("query {} `...`", query.name.name));
    }

    push_setup(&mut ranges, suite.setup.as_ref());

    for scope in &suite.scopes {
        push_region(&mut ranges, scope.span, || format!("{} {{ ... }}", scope.query.name));
        push_setup(&mut ranges, scope.setup.as_ref());
        push_items(&mut ranges, &scope.items);
    }

    ranges.sort_by_key(|r| (r.start_line, r.end_line));
    ranges
}

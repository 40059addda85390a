//! Cursor position to token, AST node and enclosing scope.
//!
//! Scope detection has two strategies. The AST strategy walks node spans and
//! is exact; the token strategy replays braces over the token stream and is
//! used when the tree has nothing at the cursor, which happens mid-edit.

use scaf_dsl::ast::*;
use scaf_dsl::lexer::{Keyword, Token, TokenKind};
use tower_lsp::lsp_types::Position;

use crate::analysis::AnalyzedFile;
use crate::utils::to_source_pos;

/// A span-carrying AST node.
#[derive(Debug, Clone, Copy)]
pub enum NodeRef<'a> {
    Import(&'a Import),
    Query(&'a Query),
    Setup(&'a SetupClause),
    SetupCall(&'a SetupCall),
    Teardown(&'a TeardownClause),
    Scope(&'a QueryScope),
    Group(&'a Group),
    Test(&'a Test),
    Statement(&'a Statement),
    Assert(&'a Assert),
    Argument(&'a Argument),
}

impl<'a> NodeRef<'a> {
    pub fn span(&self) -> Span {
        match self {
            NodeRef::Import(n) => n.span,
            NodeRef::Query(n) => n.span,
            NodeRef::Setup(n) => n.span,
            NodeRef::SetupCall(n) => n.span,
            NodeRef::Teardown(n) => n.span,
            NodeRef::Scope(n) => n.span,
            NodeRef::Group(n) => n.span,
            NodeRef::Test(n) => n.span,
            NodeRef::Statement(n) => n.span,
            NodeRef::Assert(n) => n.span,
            NodeRef::Argument(n) => n.span,
        }
    }

    /// Direct children in source order.
    pub fn children(&self) -> Vec<NodeRef<'a>> {
        let mut out = Vec::new();
        match *self {
            NodeRef::Setup(setup) => {
                for item in &setup.items {
                    if let SetupItem::Call(call) = item {
                        out.push(NodeRef::SetupCall(call));
                    }
                }
            }
            NodeRef::SetupCall(call) => out.extend(call.args.iter().map(NodeRef::Argument)),
            NodeRef::Scope(scope) => {
                out.extend(scope.setup.as_ref().map(NodeRef::Setup));
                out.extend(scope.teardown.as_ref().map(NodeRef::Teardown));
                out.extend(scope.items.iter().map(item_ref));
            }
            NodeRef::Group(group) => {
                out.extend(group.setup.as_ref().map(NodeRef::Setup));
                out.extend(group.teardown.as_ref().map(NodeRef::Teardown));
                out.extend(group.items.iter().map(item_ref));
            }
            NodeRef::Test(test) => {
                out.extend(test.setup.as_ref().map(NodeRef::Setup));
                out.extend(test.statements.iter().map(NodeRef::Statement));
                out.extend(test.asserts.iter().map(NodeRef::Assert));
            }
            NodeRef::Assert(assert) => {
                if let Some(AssertQuery::Named { args, .. }) = &assert.query {
                    out.extend(args.iter().map(NodeRef::Argument));
                }
            }
            NodeRef::Import(_)
            | NodeRef::Query(_)
            | NodeRef::Teardown(_)
            | NodeRef::Statement(_)
            | NodeRef::Argument(_) => {}
        }
        out.sort_by_key(|n| n.span().start.offset);
        out
    }
}

fn item_ref(item: &TestOrGroup) -> NodeRef<'_> {
    match item {
        TestOrGroup::Test(test) => NodeRef::Test(test),
        TestOrGroup::Group(group) => NodeRef::Group(group),
    }
}

fn suite_children(suite: &Suite) -> Vec<NodeRef<'_>> {
    let mut out = Vec::new();
    out.extend(suite.imports.iter().map(NodeRef::Import));
    out.extend(suite.queries.iter().map(NodeRef::Query));
    out.extend(suite.setup.as_ref().map(NodeRef::Setup));
    out.extend(suite.teardown.as_ref().map(NodeRef::Teardown));
    out.extend(suite.scopes.iter().map(NodeRef::Scope));
    out.sort_by_key(|n| n.span().start.offset);
    out
}

/// Most deeply nested node containing `pos`. Among overlapping siblings the
/// later one wins.
pub fn node_at(suite: &Suite, pos: SourcePos) -> Option<NodeRef<'_>> {
    let mut found = None;
    let mut children = suite_children(suite);
    while let Some(next) = children.iter().rev().find(|c| c.span().contains(pos)).copied() {
        children = next.children();
        found = Some(next);
    }
    found
}

/// Positional flags for a cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeFlags {
    /// Query name of the enclosing scope; empty outside any scope.
    pub scope_name: String,
    pub in_scope: bool,
    pub in_test: bool,
    pub in_setup: bool,
    pub in_assert: bool,
}

pub trait ScopeStrategy {
    fn locate(&self, file: &AnalyzedFile, pos: SourcePos) -> Option<ScopeFlags>;
}

/// Span-based scope detection over the parsed tree.
pub struct AstStrategy;

/// Brace replay over the token stream.
pub struct TokenStrategy;

/// True if `span` covers `pos`, treating a block left open at end of input
/// as extending to the end of the file.
fn encloses(file: &AnalyzedFile, span: Span, pos: SourcePos) -> bool {
    if pos.offset < span.start.offset {
        return false;
    }
    if span.contains(pos) {
        return true;
    }
    match file.tokens.last() {
        Some(last) => span.end.offset >= last.span.end.offset && last.kind != TokenKind::RBrace,
        None => false,
    }
}

impl ScopeStrategy for AstStrategy {
    fn locate(&self, file: &AnalyzedFile, pos: SourcePos) -> Option<ScopeFlags> {
        if file.has_parse_errors()
            && node_at(&file.suite, pos).is_none()
            && !suite_children(&file.suite)
                .iter()
                .any(|n| encloses(file, n.span(), pos))
        {
            return None;
        }
        let mut flags = ScopeFlags::default();

        if let Some(setup) = &file.suite.setup {
            flags.in_setup |= encloses(file, setup.span, pos);
        }

        let Some(scope) = file
            .suite
            .scopes
            .iter()
            .rev()
            .find(|s| encloses(file, s.span, pos))
        else {
            return Some(flags);
        };
        flags.in_scope = true;
        flags.scope_name = scope.query.name.clone();
        if let Some(setup) = &scope.setup {
            flags.in_setup |= encloses(file, setup.span, pos);
        }
        locate_in_items(file, &scope.items, pos, &mut flags);
        Some(flags)
    }
}

fn locate_in_items(file: &AnalyzedFile, items: &[TestOrGroup], pos: SourcePos, flags: &mut ScopeFlags) {
    for item in items.iter().rev() {
        if !encloses(file, item.span(), pos) {
            continue;
        }
        match item {
            TestOrGroup::Group(group) => {
                if let Some(setup) = &group.setup {
                    flags.in_setup |= encloses(file, setup.span, pos);
                }
                locate_in_items(file, &group.items, pos, flags);
            }
            TestOrGroup::Test(test) => {
                flags.in_test = true;
                if let Some(setup) = &test.setup {
                    flags.in_setup |= encloses(file, setup.span, pos);
                }
                if !flags.in_setup {
                    flags.in_assert = test.asserts.iter().any(|a| encloses(file, a.span, pos));
                }
            }
        }
        return;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Frame {
    Scope(String),
    Group,
    Test,
    Setup,
    Assert,
    Other,
}

impl ScopeStrategy for TokenStrategy {
    fn locate(&self, file: &AnalyzedFile, pos: SourcePos) -> Option<ScopeFlags> {
        let tokens: Vec<&Token> = file
            .tokens
            .iter()
            .take_while(|t| t.span.start.offset < pos.offset)
            .collect();
        let mut stack: Vec<Frame> = Vec::new();

        for (i, token) in tokens.iter().enumerate() {
            match token.kind {
                TokenKind::LBrace => {
                    let frame = frame_for_brace(&tokens[..i], stack.is_empty());
                    stack.push(frame);
                }
                TokenKind::RBrace => {
                    stack.pop();
                }
                _ => {}
            }
        }

        let mut flags = ScopeFlags::default();
        for frame in &stack {
            match frame {
                Frame::Scope(name) => {
                    flags.in_scope = true;
                    flags.scope_name = name.clone();
                }
                Frame::Test => flags.in_test = true,
                Frame::Setup => flags.in_setup = true,
                Frame::Assert => flags.in_assert = true,
                Frame::Group | Frame::Other => {}
            }
        }

        // A line-level clause without braces: `setup fixtures.Cr|`.
        let line = pos.line;
        let line_keyword = tokens
            .iter()
            .rev()
            .take_while(|t| t.span.start.line == line)
            .filter_map(|t| match t.kind {
                TokenKind::Keyword(k) => Some(k),
                _ => None,
            })
            .last();
        match line_keyword {
            Some(Keyword::Setup) => flags.in_setup = true,
            Some(Keyword::Assert) => flags.in_assert = true,
            _ => {}
        }
        if flags.in_setup {
            flags.in_assert = false;
        }
        Some(flags)
    }
}

fn frame_for_brace(before: &[&Token], top_level: bool) -> Frame {
    let prev = before.last().map(|t| t.kind);
    let prev2 = before.len().checked_sub(2).map(|i| before[i].kind);
    match (prev2, prev) {
        (_, Some(TokenKind::Keyword(Keyword::Setup))) => Frame::Setup,
        (_, Some(TokenKind::Keyword(Keyword::Assert))) => Frame::Assert,
        (_, Some(TokenKind::Keyword(Keyword::Test))) => Frame::Test,
        (_, Some(TokenKind::Keyword(Keyword::Group))) => Frame::Group,
        (Some(TokenKind::Keyword(Keyword::Test)), Some(TokenKind::String)) => Frame::Test,
        (Some(TokenKind::Keyword(Keyword::Group)), Some(TokenKind::String)) => Frame::Group,
        (_, Some(TokenKind::Ident)) if top_level => {
            Frame::Scope(before.last().map(|t| t.text.clone()).unwrap_or_default())
        }
        _ => {
            // `assert Name(...) {` and `assert \`...\` {`
            let brace_line = before.last().map(|t| t.span.end.line);
            let assert_on_line = before
                .iter()
                .rev()
                .take_while(|t| Some(t.span.start.line) == brace_line)
                .any(|t| t.is_keyword(Keyword::Assert));
            if assert_on_line {
                Frame::Assert
            } else {
                Frame::Other
            }
        }
    }
}

/// Flags from the first strategy that has an answer.
pub fn locate_scope(file: &AnalyzedFile, pos: SourcePos) -> ScopeFlags {
    let strategies: [&dyn ScopeStrategy; 2] = [&AstStrategy, &TokenStrategy];
    strategies
        .iter()
        .find_map(|s| s.locate(file, pos))
        .unwrap_or_default()
}

/// Everything known about a cursor position.
#[derive(Debug, Clone)]
pub struct TokenContext<'a> {
    pub position: SourcePos,
    /// Last token starting at or before the cursor.
    pub token: Option<&'a Token>,
    pub node: Option<NodeRef<'a>>,
    pub flags: ScopeFlags,
}

pub fn resolve(file: &AnalyzedFile, position: Position) -> TokenContext<'_> {
    resolve_at(file, to_source_pos(&file.source, position))
}

pub fn resolve_at(file: &AnalyzedFile, pos: SourcePos) -> TokenContext<'_> {
    TokenContext {
        position: pos,
        token: preceding_token(&file.tokens, pos),
        node: node_at(&file.suite, pos),
        flags: locate_scope(file, pos),
    }
}

pub fn preceding_token(tokens: &[Token], pos: SourcePos) -> Option<&Token> {
    let idx = tokens.partition_point(|t| t.span.start.offset <= pos.offset);
    idx.checked_sub(1).map(|i| &tokens[i])
}

fn is_word(kind: TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::Ident
            | TokenKind::Param
            | TokenKind::Keyword(_)
            | TokenKind::String
            | TokenKind::RawString
    )
}

/// Token under the cursor. A word the cursor sits directly after counts, so
/// `name|:` selects `name`.
pub fn token_at(tokens: &[Token], pos: SourcePos) -> Option<&Token> {
    let touching: Vec<&Token> = tokens.iter().filter(|t| t.span.touches(pos)).collect();
    touching
        .iter()
        .find(|t| is_word(t.kind) && t.span.contains(pos))
        .or_else(|| touching.iter().find(|t| is_word(t.kind)))
        .or_else(|| touching.iter().find(|t| t.span.contains(pos)))
        .copied()
}

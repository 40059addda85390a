/// A location in source text.
///
/// `line` and `column` are 1-indexed; `column` counts characters, not bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourcePos {
    pub offset: usize,
    pub line: u32,
    pub column: u32,
}

impl SourcePos {
    pub fn new(offset: usize, line: u32, column: u32) -> Self {
        Self {
            offset,
            line,
            column,
        }
    }
}

/// Half-open source range `[start, end)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Span {
    pub start: SourcePos,
    pub end: SourcePos,
}

impl Span {
    pub fn new(start: SourcePos, end: SourcePos) -> Self {
        Self { start, end }
    }

    /// Strict containment used for AST nodes: `start <= pos < end`.
    pub fn contains(&self, pos: SourcePos) -> bool {
        self.start.offset <= pos.offset && pos.offset < self.end.offset
    }

    /// Inclusive containment used for tokens, so a cursor placed directly
    /// after an identifier still selects it.
    pub fn touches(&self, pos: SourcePos) -> bool {
        self.start.offset <= pos.offset && pos.offset <= self.end.offset
    }

    pub fn len(&self) -> usize {
        self.end.offset.saturating_sub(self.start.offset)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Smallest span covering both `self` and `other`.
    pub fn merge(self, other: Span) -> Span {
        let start = if other.start.offset < self.start.offset {
            other.start
        } else {
            self.start
        };
        let end = if other.end.offset > self.end.offset {
            other.end
        } else {
            self.end
        };
        Span { start, end }
    }
}

/// An identifier with its exact source span.
///
/// Parameter identifiers keep their leading `$` in `name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ident {
    pub name: String,
    pub span: Span,
}

/// A double-quoted string literal. `value` has the quotes and escapes removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringLit {
    pub value: String,
    pub span: Span,
}

/// A backtick-delimited query body.
///
/// `text` is the raw text between the backticks; `span` covers the backticks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryBody {
    pub text: String,
    pub span: Span,
}

impl QueryBody {
    /// Byte offset of the first character of `text` in the source file.
    pub fn text_offset(&self) -> usize {
        self.span.start.offset + 1
    }
}

/// Root of one source file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Suite {
    pub imports: Vec<Import>,
    pub queries: Vec<Query>,
    pub setup: Option<SetupClause>,
    pub teardown: Option<TeardownClause>,
    pub scopes: Vec<QueryScope>,
    pub span: Span,
}

/// `import [alias] "path"`
#[derive(Debug, Clone, PartialEq)]
pub struct Import {
    pub alias: Option<Ident>,
    pub path: Option<StringLit>,
    pub span: Span,
}

/// `query Name \`body\``
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub name: Ident,
    pub body: Option<QueryBody>,
    pub span: Span,
}

/// A block of tests bound to one declared query: `Name { ... }`.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryScope {
    pub query: Ident,
    pub setup: Option<SetupClause>,
    pub teardown: Option<TeardownClause>,
    pub items: Vec<TestOrGroup>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TestOrGroup {
    Test(Test),
    Group(Group),
}

impl TestOrGroup {
    pub fn span(&self) -> Span {
        match self {
            TestOrGroup::Test(t) => t.span,
            TestOrGroup::Group(g) => g.span,
        }
    }
}

/// `group "name" { ... }`
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub name: Option<StringLit>,
    pub setup: Option<SetupClause>,
    pub teardown: Option<TeardownClause>,
    pub items: Vec<TestOrGroup>,
    pub span: Span,
}

/// `test "name" { ... }`
#[derive(Debug, Clone, PartialEq)]
pub struct Test {
    pub name: Option<StringLit>,
    pub setup: Option<SetupClause>,
    pub statements: Vec<Statement>,
    pub asserts: Vec<Assert>,
    pub span: Span,
}

impl Test {
    pub fn is_empty(&self) -> bool {
        self.setup.is_none() && self.statements.is_empty() && self.asserts.is_empty()
    }
}

/// `key: value` inside a test.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub key: StatementKey,
    pub value: Option<Value>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatementKey {
    /// `$name` query input.
    Param(Ident),
    /// `a` or `a.b` expected output field.
    Field(FieldPath),
}

impl StatementKey {
    pub fn span(&self) -> Span {
        match self {
            StatementKey::Param(ident) => ident.span,
            StatementKey::Field(path) => path.span,
        }
    }
}

/// Dotted identifier path such as `u.name`.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldPath {
    pub parts: Vec<Ident>,
    pub span: Span,
}

impl FieldPath {
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .map(|p| p.name.as_str())
            .collect::<Vec<_>>()
            .join(".")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    pub kind: ValueKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValueKind {
    String(String),
    /// Numeric literal kept as written.
    Number(String),
    Bool(bool),
    Null,
    List(Vec<Value>),
    Map(Vec<(Ident, Value)>),
    Expr(Expr),
}

/// Parenthesised expression kept as raw text (parentheses included).
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub text: String,
    pub span: Span,
}

/// `setup <item>` or `setup { <item>, ... }`
#[derive(Debug, Clone, PartialEq)]
pub struct SetupClause {
    pub items: Vec<SetupItem>,
    pub is_block: bool,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SetupItem {
    Inline(QueryBody),
    Module(Ident),
    Call(SetupCall),
}

impl SetupItem {
    pub fn span(&self) -> Span {
        match self {
            SetupItem::Inline(body) => body.span,
            SetupItem::Module(ident) => ident.span,
            SetupItem::Call(call) => call.span,
        }
    }

    /// The import alias this item refers to, if any.
    pub fn module(&self) -> Option<&Ident> {
        match self {
            SetupItem::Inline(_) => None,
            SetupItem::Module(ident) => Some(ident),
            SetupItem::Call(call) => Some(&call.module),
        }
    }
}

/// `alias.Query($arg: value, ...)`
#[derive(Debug, Clone, PartialEq)]
pub struct SetupCall {
    pub module: Ident,
    pub query: Option<Ident>,
    pub args: Vec<Argument>,
    pub span: Span,
}

/// `$name: value` in an argument list.
#[derive(Debug, Clone, PartialEq)]
pub struct Argument {
    pub name: Ident,
    pub value: Option<Value>,
    pub span: Span,
}

/// `teardown \`body\``
#[derive(Debug, Clone, PartialEq)]
pub struct TeardownClause {
    pub body: Option<QueryBody>,
    pub span: Span,
}

/// `assert [query] { (cond) ... }`
#[derive(Debug, Clone, PartialEq)]
pub struct Assert {
    pub query: Option<AssertQuery>,
    pub conditions: Vec<Expr>,
    /// Span of the `{ ... }` condition block, if present.
    pub block: Option<Span>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AssertQuery {
    Named { name: Ident, args: Vec<Argument> },
    Inline(QueryBody),
}

impl Suite {
    /// Every setup clause in the file, at any nesting level.
    pub fn all_setups(&self) -> Vec<&SetupClause> {
        fn walk<'a>(items: &'a [TestOrGroup], out: &mut Vec<&'a SetupClause>) {
            for item in items {
                match item {
                    TestOrGroup::Test(test) => out.extend(test.setup.as_ref()),
                    TestOrGroup::Group(group) => {
                        out.extend(group.setup.as_ref());
                        walk(&group.items, out);
                    }
                }
            }
        }

        let mut out = Vec::new();
        out.extend(self.setup.as_ref());
        for scope in &self.scopes {
            out.extend(scope.setup.as_ref());
            walk(&scope.items, &mut out);
        }
        out
    }

    /// Every setup call (`alias.Query(...)`) in the file.
    pub fn all_setup_calls(&self) -> Vec<&SetupCall> {
        self.all_setups()
            .into_iter()
            .flat_map(|clause| clause.items.iter())
            .filter_map(|item| match item {
                SetupItem::Call(call) => Some(call),
                _ => None,
            })
            .collect()
    }

    /// Every test in a scope, with its nesting flattened.
    pub fn tests_in(scope: &QueryScope) -> Vec<&Test> {
        fn walk<'a>(items: &'a [TestOrGroup], out: &mut Vec<&'a Test>) {
            for item in items {
                match item {
                    TestOrGroup::Test(test) => out.push(test),
                    TestOrGroup::Group(group) => walk(&group.items, out),
                }
            }
        }
        let mut out = Vec::new();
        walk(&scope.items, &mut out);
        out
    }

    /// Every group in a scope, with its nesting flattened.
    pub fn groups_in(scope: &QueryScope) -> Vec<&Group> {
        fn walk<'a>(items: &'a [TestOrGroup], out: &mut Vec<&'a Group>) {
            for item in items {
                if let TestOrGroup::Group(group) = item {
                    out.push(group);
                    walk(&group.items, out);
                }
            }
        }
        let mut out = Vec::new();
        walk(&scope.items, &mut out);
        out
    }
}

/// Maps byte offsets to 1-indexed line/column positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineIndex {
    line_starts: Vec<usize>,
}

impl LineIndex {
    pub fn new(source: &str) -> Self {
        let mut line_starts = vec![0];
        for (i, b) in source.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i + 1);
            }
        }
        Self { line_starts }
    }

    pub fn line_count(&self) -> usize {
        self.line_starts.len()
    }

    /// Byte offset where the 1-indexed `line` starts, if it exists.
    pub fn line_start(&self, line: u32) -> Option<usize> {
        let idx = (line as usize).checked_sub(1)?;
        self.line_starts.get(idx).copied()
    }

    /// Position of `offset`, clamped to the end of `source`.
    pub fn position(&self, source: &str, offset: usize) -> SourcePos {
        let offset = clamp_to_char_boundary(source, offset);
        let line_idx = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        let line_start = self.line_starts[line_idx];
        let column = source[line_start..offset].chars().count() as u32 + 1;
        SourcePos::new(offset, line_idx as u32 + 1, column)
    }

    pub fn span(&self, source: &str, start: usize, end: usize) -> Span {
        Span::new(self.position(source, start), self.position(source, end))
    }
}

fn clamp_to_char_boundary(source: &str, offset: usize) -> usize {
    let mut offset = offset.min(source.len());
    while offset > 0 && !source.is_char_boundary(offset) {
        offset -= 1;
    }
    offset
}

//! Hand-written recovering parser over the token stream.
//!
//! Errors are collected instead of aborting: every `parse_*` method consumes
//! at least one token or returns, and blocks left open at end of input end at
//! the last consumed token.

use crate::ast::*;
use crate::errors::ParseError;
use crate::lexer::{tokenize_with_index, Keyword, Token, TokenKind};

/// Result of a recovering parse.
#[derive(Debug)]
pub struct ParseOutput {
    /// Best-effort tree. Always present, possibly partial.
    pub suite: Suite,
    pub tokens: Vec<Token>,
    pub errors: Vec<ParseError>,
    pub line_index: LineIndex,
}

impl ParseOutput {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Parse a scaf source file, failing on the first syntax error.
pub fn parse(source: &str, filename: &str) -> Result<Suite, ParseError> {
    let mut output = parse_with_recovery(source);
    if output.errors.is_empty() {
        Ok(output.suite)
    } else {
        Err(output.errors.remove(0).with_source_context(source, filename))
    }
}

/// Parse a scaf source file, recording errors and recovering where possible.
pub fn parse_with_recovery(source: &str) -> ParseOutput {
    let line_index = LineIndex::new(source);
    let tokens = tokenize_with_index(source, &line_index);
    let end = line_index.position(source, source.len());
    let (suite, errors) = {
        let mut parser = Parser::new(source, &tokens, end);
        let suite = parser.parse_suite();
        (suite, parser.errors)
    };
    tracing::trace!(
        tokens = tokens.len(),
        errors = errors.len(),
        "parsed scaf source"
    );
    ParseOutput {
        suite,
        tokens,
        errors,
        line_index,
    }
}

struct Parser<'a> {
    source: &'a str,
    tokens: &'a [Token],
    pos: usize,
    eof: SourcePos,
    errors: Vec<ParseError>,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str, tokens: &'a [Token], eof: SourcePos) -> Self {
        Self {
            source,
            tokens,
            pos: 0,
            eof,
            errors: Vec::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Token stream helpers
    // -----------------------------------------------------------------------

    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn peek_kind(&self) -> Option<TokenKind> {
        self.peek().map(|t| t.kind)
    }

    fn peek_nth_kind(&self, n: usize) -> Option<TokenKind> {
        self.tokens.get(self.pos + n).map(|t| t.kind)
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.peek_kind() == Some(kind)
    }

    fn advance(&mut self) -> Option<&'a Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, kind: TokenKind) -> Option<&'a Token> {
        if self.at(kind) {
            self.advance()
        } else {
            None
        }
    }

    /// Consume `kind` or record an error without consuming anything.
    fn expect(&mut self, kind: TokenKind) -> Option<&'a Token> {
        if let Some(token) = self.eat(kind) {
            return Some(token);
        }
        self.error_expected(kind.describe());
        None
    }

    /// End of the last consumed token.
    fn prev_end(&self) -> SourcePos {
        self.pos
            .checked_sub(1)
            .and_then(|i| self.tokens.get(i))
            .map(|t| t.span.end)
            .unwrap_or_default()
    }

    fn current_span(&self) -> Span {
        self.peek()
            .map(|t| t.span)
            .unwrap_or(Span::new(self.eof, self.eof))
    }

    fn start_pos(&self) -> SourcePos {
        self.peek().map(|t| t.span.start).unwrap_or(self.eof)
    }

    fn span_from(&self, start: SourcePos) -> Span {
        let end = self.prev_end();
        if end.offset < start.offset {
            Span::new(start, start)
        } else {
            Span::new(start, end)
        }
    }

    fn error_expected(&mut self, expected: &str) {
        let found = self
            .peek()
            .map(|t| t.kind.describe().to_string())
            .unwrap_or_else(|| "end of file".to_string());
        let location = self.current_span();
        self.errors
            .push(ParseError::unexpected(expected, found, location));
    }

    /// Skip tokens until `stop` matches at the current nesting level or a
    /// closing brace of the enclosing block is reached. Nested `{ ... }`
    /// blocks are skipped whole.
    fn recover_until(&mut self, stop: impl Fn(&Token) -> bool) {
        while let Some(token) = self.peek() {
            match token.kind {
                TokenKind::RBrace => return,
                TokenKind::LBrace => self.skip_block(),
                _ if stop(token) => return,
                _ => {
                    self.advance();
                }
            }
        }
    }

    fn skip_block(&mut self) {
        let mut depth = 0usize;
        while let Some(token) = self.advance() {
            match token.kind {
                TokenKind::LBrace => depth += 1,
                TokenKind::RBrace => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        return;
                    }
                }
                _ => {}
            }
        }
    }

    fn set_clause<T>(&mut self, slot: &mut Option<T>, clause: T, span: Span, name: &str) {
        if slot.is_some() {
            self.errors.push(ParseError::duplicate_clause(name, span));
        }
        *slot = Some(clause);
    }

    // -----------------------------------------------------------------------
    // Leaves
    // -----------------------------------------------------------------------

    fn ident(token: &Token) -> Ident {
        Ident {
            name: token.text.clone(),
            span: token.span,
        }
    }

    fn string_lit(&mut self, token: &Token) -> StringLit {
        if token.is_unterminated() {
            self.errors
                .push(ParseError::unterminated("string", token.span));
        }
        StringLit {
            value: unescape(&token.text),
            span: token.span,
        }
    }

    fn query_body(&mut self, token: &Token) -> QueryBody {
        let unterminated = token.is_unterminated();
        if unterminated {
            self.errors
                .push(ParseError::unterminated("query body", token.span));
        }
        let inner = token.text.strip_prefix('`').unwrap_or(&token.text);
        let inner = if unterminated {
            inner
        } else {
            inner.strip_suffix('`').unwrap_or(inner)
        };
        QueryBody {
            text: inner.to_string(),
            span: token.span,
        }
    }

    // -----------------------------------------------------------------------
    // Top level
    // -----------------------------------------------------------------------

    fn parse_suite(&mut self) -> Suite {
        let mut suite = Suite {
            span: Span::new(SourcePos::new(0, 1, 1), self.eof),
            ..Suite::default()
        };

        while let Some(token) = self.peek() {
            let before = self.pos;
            match token.kind {
                TokenKind::Keyword(Keyword::Import) => {
                    let import = self.parse_import();
                    suite.imports.push(import);
                }
                TokenKind::Keyword(Keyword::Query) => {
                    if let Some(query) = self.parse_query() {
                        suite.queries.push(query);
                    }
                }
                TokenKind::Keyword(Keyword::Setup) => {
                    let clause = self.parse_setup();
                    let span = clause.span;
                    self.set_clause(&mut suite.setup, clause, span, "setup");
                }
                TokenKind::Keyword(Keyword::Teardown) => {
                    let clause = self.parse_teardown();
                    let span = clause.span;
                    self.set_clause(&mut suite.teardown, clause, span, "teardown");
                }
                TokenKind::Ident => {
                    if self.peek_nth_kind(1) == Some(TokenKind::LBrace) {
                        let scope = self.parse_scope();
                        suite.scopes.push(scope);
                    } else {
                        self.advance();
                        self.error_expected("'{' after scope name");
                        self.recover_top_level();
                    }
                }
                TokenKind::RBrace => {
                    self.errors.push(ParseError::syntax(
                        "unmatched '}'",
                        token.span,
                    ));
                    self.advance();
                }
                _ => {
                    self.error_expected("import, query, setup, teardown or a query scope");
                    self.advance();
                    self.recover_top_level();
                }
            }
            if self.pos == before {
                self.advance();
            }
        }

        suite
    }

    fn recover_top_level(&mut self) {
        loop {
            self.recover_until(|t| {
                matches!(
                    t.kind,
                    TokenKind::Keyword(
                        Keyword::Import | Keyword::Query | Keyword::Setup | Keyword::Teardown
                    ) | TokenKind::Ident
                )
            });
            // A stray '}' at top level is reported by the main loop.
            if self.at(TokenKind::Ident) && self.peek_nth_kind(1) != Some(TokenKind::LBrace) {
                self.advance();
                continue;
            }
            return;
        }
    }

    fn parse_import(&mut self) -> Import {
        let start = self.start_pos();
        self.advance();
        let alias = self.eat(TokenKind::Ident).map(Self::ident);
        let path = match self.eat(TokenKind::String) {
            Some(token) => Some(self.string_lit(token)),
            None => {
                self.error_expected("import path string");
                None
            }
        };
        Import {
            alias,
            path,
            span: self.span_from(start),
        }
    }

    fn parse_query(&mut self) -> Option<Query> {
        let start = self.start_pos();
        self.advance();
        let Some(name) = self.expect(TokenKind::Ident).map(Self::ident) else {
            return None;
        };
        let body = match self.eat(TokenKind::RawString) {
            Some(token) => Some(self.query_body(token)),
            None => {
                self.error_expected("query body in backticks");
                None
            }
        };
        Some(Query {
            name,
            body,
            span: self.span_from(start),
        })
    }

    fn parse_scope(&mut self) -> QueryScope {
        let start = self.start_pos();
        let query = self
            .advance()
            .map(Self::ident)
            .unwrap_or_else(|| Ident {
                name: String::new(),
                span: Span::new(start, start),
            });
        self.advance(); // '{'

        let mut scope = QueryScope {
            query,
            setup: None,
            teardown: None,
            items: Vec::new(),
            span: Span::default(),
        };
        let (setup, teardown, items) = self.parse_container_body("query scope");
        scope.setup = setup;
        scope.teardown = teardown;
        scope.items = items;
        scope.span = self.span_from(start);
        scope
    }

    /// Body shared by scopes and groups, after the opening brace.
    fn parse_container_body(
        &mut self,
        what: &str,
    ) -> (Option<SetupClause>, Option<TeardownClause>, Vec<TestOrGroup>) {
        let mut setup = None;
        let mut teardown = None;
        let mut items = Vec::new();

        loop {
            let Some(token) = self.peek() else {
                self.error_expected(&format!("'}}' to close {what}"));
                break;
            };
            let before = self.pos;
            match token.kind {
                TokenKind::RBrace => {
                    self.advance();
                    break;
                }
                TokenKind::Keyword(Keyword::Setup) => {
                    let clause = self.parse_setup();
                    let span = clause.span;
                    self.set_clause(&mut setup, clause, span, "setup");
                }
                TokenKind::Keyword(Keyword::Teardown) => {
                    let clause = self.parse_teardown();
                    let span = clause.span;
                    self.set_clause(&mut teardown, clause, span, "teardown");
                }
                TokenKind::Keyword(Keyword::Test) => {
                    items.push(TestOrGroup::Test(self.parse_test()));
                }
                TokenKind::Keyword(Keyword::Group) => {
                    items.push(TestOrGroup::Group(self.parse_group()));
                }
                _ => {
                    self.error_expected("test, group, setup or teardown");
                    self.advance();
                    self.recover_until(|t| {
                        matches!(
                            t.kind,
                            TokenKind::Keyword(
                                Keyword::Test
                                    | Keyword::Group
                                    | Keyword::Setup
                                    | Keyword::Teardown
                            )
                        )
                    });
                }
            }
            if self.pos == before {
                self.advance();
            }
        }

        (setup, teardown, items)
    }

    fn parse_group(&mut self) -> Group {
        let start = self.start_pos();
        self.advance();
        let name = match self.eat(TokenKind::String) {
            Some(token) => Some(self.string_lit(token)),
            None => {
                self.error_expected("group name string");
                None
            }
        };
        let mut group = Group {
            name,
            setup: None,
            teardown: None,
            items: Vec::new(),
            span: Span::default(),
        };
        if self.expect(TokenKind::LBrace).is_some() {
            let (setup, teardown, items) = self.parse_container_body("group");
            group.setup = setup;
            group.teardown = teardown;
            group.items = items;
        }
        group.span = self.span_from(start);
        group
    }

    fn parse_test(&mut self) -> Test {
        let start = self.start_pos();
        self.advance();
        let name = match self.eat(TokenKind::String) {
            Some(token) => Some(self.string_lit(token)),
            None => {
                self.error_expected("test name string");
                None
            }
        };
        let mut test = Test {
            name,
            setup: None,
            statements: Vec::new(),
            asserts: Vec::new(),
            span: Span::default(),
        };
        if self.expect(TokenKind::LBrace).is_none() {
            test.span = self.span_from(start);
            return test;
        }

        loop {
            let Some(token) = self.peek() else {
                self.error_expected("'}' to close test");
                break;
            };
            let before = self.pos;
            match token.kind {
                TokenKind::RBrace => {
                    self.advance();
                    break;
                }
                TokenKind::Keyword(Keyword::Setup) => {
                    let clause = self.parse_setup();
                    let span = clause.span;
                    self.set_clause(&mut test.setup, clause, span, "setup");
                }
                TokenKind::Keyword(Keyword::Assert) => {
                    test.asserts.push(self.parse_assert());
                }
                TokenKind::Param | TokenKind::Ident => {
                    test.statements.push(self.parse_statement());
                }
                _ => {
                    self.error_expected("statement, setup or assert");
                    self.advance();
                    self.recover_until(|t| {
                        matches!(
                            t.kind,
                            TokenKind::Param
                                | TokenKind::Ident
                                | TokenKind::Keyword(Keyword::Setup | Keyword::Assert)
                        )
                    });
                }
            }
            if self.pos == before {
                self.advance();
            }
        }

        test.span = self.span_from(start);
        test
    }

    fn parse_statement(&mut self) -> Statement {
        let start = self.start_pos();
        let key = match self.peek_kind() {
            Some(TokenKind::Param) => {
                let token = self.advance().map(Self::ident);
                StatementKey::Param(token.unwrap_or_else(|| Ident {
                    name: String::new(),
                    span: Span::new(start, start),
                }))
            }
            _ => StatementKey::Field(self.parse_field_path()),
        };

        if self.expect(TokenKind::Colon).is_none() {
            return Statement {
                key,
                value: None,
                span: self.span_from(start),
            };
        }

        let value = if self.at_value_start() {
            self.parse_value()
        } else {
            self.error_expected("value");
            None
        };
        Statement {
            key,
            value,
            span: self.span_from(start),
        }
    }

    fn parse_field_path(&mut self) -> FieldPath {
        let start = self.start_pos();
        let mut parts = Vec::new();
        if let Some(token) = self.eat(TokenKind::Ident) {
            parts.push(Self::ident(token));
        }
        while self.at(TokenKind::Dot) {
            self.advance();
            match self.peek_kind() {
                Some(TokenKind::Ident) | Some(TokenKind::Keyword(_)) => {
                    if let Some(token) = self.advance() {
                        parts.push(Self::ident(token));
                    }
                }
                _ => {
                    self.error_expected("field name after '.'");
                    break;
                }
            }
        }
        FieldPath {
            parts,
            span: self.span_from(start),
        }
    }

    // -----------------------------------------------------------------------
    // Values
    // -----------------------------------------------------------------------

    fn at_value_start(&self) -> bool {
        match self.peek() {
            Some(token) => match token.kind {
                TokenKind::String
                | TokenKind::Number
                | TokenKind::LBracket
                | TokenKind::LBrace
                | TokenKind::LParen
                | TokenKind::Keyword(Keyword::True | Keyword::False | Keyword::Null) => true,
                TokenKind::Operator => {
                    token.text == "-" && self.peek_nth_kind(1) == Some(TokenKind::Number)
                }
                _ => false,
            },
            None => false,
        }
    }

    fn parse_value(&mut self) -> Option<Value> {
        let token = self.peek()?;
        let start = token.span.start;
        let kind = match token.kind {
            TokenKind::String => {
                self.advance();
                ValueKind::String(self.string_lit(token).value)
            }
            TokenKind::Number => {
                self.advance();
                ValueKind::Number(token.text.clone())
            }
            TokenKind::Operator if token.text == "-" => {
                self.advance();
                let number = self.expect(TokenKind::Number)?;
                ValueKind::Number(format!("-{}", number.text))
            }
            TokenKind::Keyword(Keyword::True) => {
                self.advance();
                ValueKind::Bool(true)
            }
            TokenKind::Keyword(Keyword::False) => {
                self.advance();
                ValueKind::Bool(false)
            }
            TokenKind::Keyword(Keyword::Null) => {
                self.advance();
                ValueKind::Null
            }
            TokenKind::LBracket => ValueKind::List(self.parse_list()),
            TokenKind::LBrace => ValueKind::Map(self.parse_map()),
            TokenKind::LParen => ValueKind::Expr(self.parse_expr()?),
            _ => {
                self.error_expected("value");
                return None;
            }
        };
        Some(Value {
            kind,
            span: self.span_from(start),
        })
    }

    fn parse_list(&mut self) -> Vec<Value> {
        self.advance(); // '['
        let mut values = Vec::new();
        loop {
            match self.peek_kind() {
                Some(TokenKind::RBracket) => {
                    self.advance();
                    break;
                }
                Some(TokenKind::Comma) => {
                    self.advance();
                }
                Some(_) if self.at_value_start() => match self.parse_value() {
                    Some(value) => values.push(value),
                    None => break,
                },
                _ => {
                    self.error_expected("']'");
                    break;
                }
            }
        }
        values
    }

    fn parse_map(&mut self) -> Vec<(Ident, Value)> {
        self.advance(); // '{'
        let mut entries = Vec::new();
        loop {
            match self.peek_kind() {
                Some(TokenKind::RBrace) => {
                    self.advance();
                    break;
                }
                Some(TokenKind::Comma) => {
                    self.advance();
                }
                Some(TokenKind::Ident) | Some(TokenKind::String) => {
                    let Some(token) = self.advance() else { break };
                    let key = Ident {
                        name: unescape(&token.text),
                        span: token.span,
                    };
                    if self.expect(TokenKind::Colon).is_none() {
                        break;
                    }
                    match self.parse_value() {
                        Some(value) => entries.push((key, value)),
                        None => break,
                    }
                }
                _ => {
                    self.error_expected("'}' to close map");
                    break;
                }
            }
        }
        entries
    }

    /// Balanced `( ... )`, kept as raw source text.
    fn parse_expr(&mut self) -> Option<Expr> {
        let open = self.advance()?;
        let start = open.span.start;
        let mut depth = 1usize;
        while let Some(token) = self.peek() {
            match token.kind {
                TokenKind::LParen => depth += 1,
                TokenKind::RParen => {
                    depth -= 1;
                    if depth == 0 {
                        self.advance();
                        let span = self.span_from(start);
                        return Some(Expr {
                            text: self.source[span.start.offset..span.end.offset].to_string(),
                            span,
                        });
                    }
                }
                // A brace never belongs to an expression; stop so the
                // enclosing block can recover.
                TokenKind::RBrace | TokenKind::LBrace => break,
                _ => {}
            }
            self.advance();
        }
        self.errors
            .push(ParseError::unterminated("expression", open.span));
        let span = self.span_from(start);
        Some(Expr {
            text: self.source[span.start.offset..span.end.offset].to_string(),
            span,
        })
    }

    // -----------------------------------------------------------------------
    // Clauses
    // -----------------------------------------------------------------------

    fn parse_setup(&mut self) -> SetupClause {
        let start = self.start_pos();
        self.advance(); // 'setup'

        if self.at(TokenKind::LBrace) {
            self.advance();
            let mut items = Vec::new();
            loop {
                match self.peek_kind() {
                    Some(TokenKind::RBrace) => {
                        self.advance();
                        break;
                    }
                    Some(TokenKind::Comma) => {
                        self.advance();
                    }
                    Some(TokenKind::RawString) | Some(TokenKind::Ident) => {
                        if let Some(item) = self.parse_setup_item() {
                            items.push(item);
                        }
                    }
                    None => {
                        self.error_expected("'}' to close setup block");
                        break;
                    }
                    Some(_) => {
                        self.error_expected("setup item");
                        break;
                    }
                }
            }
            return SetupClause {
                items,
                is_block: true,
                span: self.span_from(start),
            };
        }

        let items = match self.peek_kind() {
            Some(TokenKind::RawString) | Some(TokenKind::Ident) => {
                self.parse_setup_item().into_iter().collect()
            }
            _ => {
                self.error_expected("setup query, module or call");
                Vec::new()
            }
        };
        SetupClause {
            items,
            is_block: false,
            span: self.span_from(start),
        }
    }

    fn parse_setup_item(&mut self) -> Option<SetupItem> {
        let token = self.advance()?;
        if token.kind == TokenKind::RawString {
            return Some(SetupItem::Inline(self.query_body(token)));
        }

        let module = Self::ident(token);
        if !self.at(TokenKind::Dot) {
            return Some(SetupItem::Module(module));
        }
        self.advance(); // '.'

        let start = module.span.start;
        let query = match self.eat(TokenKind::Ident) {
            Some(token) => Some(Self::ident(token)),
            None => {
                self.error_expected("query name after '.'");
                None
            }
        };
        let args = if query.is_some() {
            if self.at(TokenKind::LParen) {
                self.parse_arguments()
            } else {
                self.error_expected("'(' to start setup call arguments");
                Vec::new()
            }
        } else {
            Vec::new()
        };
        Some(SetupItem::Call(SetupCall {
            module,
            query,
            args,
            span: self.span_from(start),
        }))
    }

    fn parse_arguments(&mut self) -> Vec<Argument> {
        self.advance(); // '('
        let mut args = Vec::new();
        loop {
            match self.peek_kind() {
                Some(TokenKind::RParen) => {
                    self.advance();
                    break;
                }
                Some(TokenKind::Comma) => {
                    self.advance();
                }
                Some(TokenKind::Param) => {
                    let Some(token) = self.advance() else { break };
                    let name = Self::ident(token);
                    let start = name.span.start;
                    let value = if self.expect(TokenKind::Colon).is_some() {
                        self.parse_value()
                    } else {
                        None
                    };
                    args.push(Argument {
                        name,
                        value,
                        span: self.span_from(start),
                    });
                }
                _ => {
                    self.error_expected("')' to close arguments");
                    break;
                }
            }
        }
        args
    }

    fn parse_teardown(&mut self) -> TeardownClause {
        let start = self.start_pos();
        self.advance();
        let body = match self.eat(TokenKind::RawString) {
            Some(token) => Some(self.query_body(token)),
            None => {
                self.error_expected("teardown query in backticks");
                None
            }
        };
        TeardownClause {
            body,
            span: self.span_from(start),
        }
    }

    fn parse_assert(&mut self) -> Assert {
        let start = self.start_pos();
        self.advance(); // 'assert'

        let query = match self.peek_kind() {
            Some(TokenKind::Ident) => {
                let name = self.advance().map(Self::ident);
                let args = if self.at(TokenKind::LParen) {
                    self.parse_arguments()
                } else {
                    Vec::new()
                };
                name.map(|name| AssertQuery::Named { name, args })
            }
            Some(TokenKind::RawString) => {
                let token = self.advance();
                token.map(|t| AssertQuery::Inline(self.query_body(t)))
            }
            _ => None,
        };

        let mut conditions = Vec::new();
        let mut block = None;
        if self.at(TokenKind::LBrace) {
            let block_start = self.start_pos();
            self.advance();
            loop {
                match self.peek_kind() {
                    Some(TokenKind::RBrace) => {
                        self.advance();
                        break;
                    }
                    Some(TokenKind::LParen) => {
                        if let Some(expr) = self.parse_expr() {
                            conditions.push(expr);
                        }
                    }
                    None => {
                        self.error_expected("'}' to close assert block");
                        break;
                    }
                    Some(_) => {
                        self.error_expected("parenthesised condition");
                        self.advance();
                    }
                }
            }
            block = Some(self.span_from(block_start));
        } else if query.is_none() {
            self.error_expected("assert block");
        }

        Assert {
            query,
            conditions,
            block,
            span: self.span_from(start),
        }
    }
}

fn unescape(raw: &str) -> String {
    let inner = raw.strip_prefix('"').unwrap_or(raw);
    let inner = inner.strip_suffix('"').unwrap_or(inner);
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

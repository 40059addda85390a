//! Token stream for scaf source files.

use pest::Parser;
use pest_derive::Parser;

use crate::ast::{LineIndex, Span};

#[derive(Parser)]
#[grammar = "grammar.pest"]
struct ScafLexer;

type Pair<'a> = pest::iterators::Pair<'a, Rule>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyword {
    Import,
    Query,
    Setup,
    Teardown,
    Test,
    Group,
    Assert,
    True,
    False,
    Null,
}

impl Keyword {
    pub const ALL: [Keyword; 10] = [
        Keyword::Import,
        Keyword::Query,
        Keyword::Setup,
        Keyword::Teardown,
        Keyword::Test,
        Keyword::Group,
        Keyword::Assert,
        Keyword::True,
        Keyword::False,
        Keyword::Null,
    ];

    pub fn from_word(word: &str) -> Option<Keyword> {
        Some(match word {
            "import" => Keyword::Import,
            "query" => Keyword::Query,
            "setup" => Keyword::Setup,
            "teardown" => Keyword::Teardown,
            "test" => Keyword::Test,
            "group" => Keyword::Group,
            "assert" => Keyword::Assert,
            "true" => Keyword::True,
            "false" => Keyword::False,
            "null" => Keyword::Null,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Keyword::Import => "import",
            Keyword::Query => "query",
            Keyword::Setup => "setup",
            Keyword::Teardown => "teardown",
            Keyword::Test => "test",
            Keyword::Group => "group",
            Keyword::Assert => "assert",
            Keyword::True => "true",
            Keyword::False => "false",
            Keyword::Null => "null",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Keyword(Keyword),
    Ident,
    /// `$name`
    Param,
    /// A lone `$`, usually mid-edit.
    Dollar,
    String,
    RawString,
    Number,
    LBrace,
    RBrace,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Colon,
    Comma,
    Dot,
    Operator,
    Unknown,
}

impl TokenKind {
    pub fn describe(self) -> &'static str {
        match self {
            TokenKind::Keyword(k) => k.as_str(),
            TokenKind::Ident => "identifier",
            TokenKind::Param => "parameter",
            TokenKind::Dollar => "'$'",
            TokenKind::String => "string",
            TokenKind::RawString => "query body",
            TokenKind::Number => "number",
            TokenKind::LBrace => "'{'",
            TokenKind::RBrace => "'}'",
            TokenKind::LParen => "'('",
            TokenKind::RParen => "')'",
            TokenKind::LBracket => "'['",
            TokenKind::RBracket => "']'",
            TokenKind::Colon => "':'",
            TokenKind::Comma => "','",
            TokenKind::Dot => "'.'",
            TokenKind::Operator => "operator",
            TokenKind::Unknown => "unknown character",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub span: Span,
}

impl Token {
    pub fn is_keyword(&self, keyword: Keyword) -> bool {
        self.kind == TokenKind::Keyword(keyword)
    }

    /// True for a string or raw string whose closing delimiter is missing.
    pub fn is_unterminated(&self) -> bool {
        let delim = match self.kind {
            TokenKind::String => '"',
            TokenKind::RawString => '`',
            _ => return false,
        };
        if self.text.len() < 2 || !self.text.ends_with(delim) {
            return true;
        }
        if self.kind == TokenKind::RawString {
            return false;
        }
        // An odd run of backslashes escapes the final quote.
        let body = &self.text[..self.text.len() - 1];
        let slashes = body.chars().rev().take_while(|c| *c == '\\').count();
        slashes % 2 == 1
    }
}

/// Split `source` into tokens. Comments and whitespace are dropped.
pub fn tokenize(source: &str) -> Vec<Token> {
    let index = LineIndex::new(source);
    tokenize_with_index(source, &index)
}

pub(crate) fn tokenize_with_index(source: &str, index: &LineIndex) -> Vec<Token> {
    let pairs = match ScafLexer::parse(Rule::tokens, source) {
        Ok(pairs) => pairs,
        Err(err) => {
            // The grammar has a catch-all rule, so this is not expected.
            tracing::warn!(error = %err, "tokenizer rejected input");
            return Vec::new();
        }
    };

    let mut tokens = Vec::new();
    for pair in pairs.flatten() {
        if let Some(kind) = token_kind(&pair) {
            let s = pair.as_span();
            tokens.push(Token {
                kind,
                text: pair.as_str().to_string(),
                span: index.span(source, s.start(), s.end()),
            });
        }
    }
    tokens
}

fn token_kind(pair: &Pair<'_>) -> Option<TokenKind> {
    let kind = match pair.as_rule() {
        Rule::raw_string => TokenKind::RawString,
        Rule::string => TokenKind::String,
        Rule::number => TokenKind::Number,
        Rule::param => TokenKind::Param,
        Rule::dollar => TokenKind::Dollar,
        Rule::ident => Keyword::from_word(pair.as_str())
            .map(TokenKind::Keyword)
            .unwrap_or(TokenKind::Ident),
        Rule::punct => match pair.as_str() {
            "{" => TokenKind::LBrace,
            "}" => TokenKind::RBrace,
            "(" => TokenKind::LParen,
            ")" => TokenKind::RParen,
            "[" => TokenKind::LBracket,
            "]" => TokenKind::RBracket,
            ":" => TokenKind::Colon,
            "," => TokenKind::Comma,
            _ => TokenKind::Dot,
        },
        Rule::operator => TokenKind::Operator,
        Rule::unknown => TokenKind::Unknown,
        _ => return None,
    };
    Some(kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn keywords_and_identifiers() {
        assert_eq!(
            kinds("import fixtures \"./f\""),
            vec![
                TokenKind::Keyword(Keyword::Import),
                TokenKind::Ident,
                TokenKind::String
            ]
        );
    }

    #[test]
    fn params_and_lone_dollar() {
        assert_eq!(
            kinds("$id: $"),
            vec![TokenKind::Param, TokenKind::Colon, TokenKind::Dollar]
        );
    }

    #[test]
    fn comments_are_dropped() {
        let tokens = tokenize("// heading\nquery A `x`");
        assert_eq!(tokens.len(), 3);
        assert_eq!(tokens[0].text, "query");
        assert_eq!(tokens[0].span.start.line, 2);
    }

    #[test]
    fn raw_string_spans_lines() {
        let tokens = tokenize("query A `MATCH (n)\nRETURN n`");
        let body = &tokens[2];
        assert_eq!(body.kind, TokenKind::RawString);
        assert_eq!(body.span.start.line, 1);
        assert_eq!(body.span.end.line, 2);
        assert!(!body.is_unterminated());
    }

    #[test]
    fn unterminated_raw_string_runs_to_end() {
        let tokens = tokenize("query A `MATCH (n)");
        assert_eq!(tokens.len(), 3);
        assert!(tokens[2].is_unterminated());
    }

    #[test]
    fn escaped_backslash_before_closing_quote() {
        let tokens = tokenize(r#""a\\" "b\""#);
        assert!(!tokens[0].is_unterminated());
        assert!(tokens[1].is_unterminated());
    }

    #[test]
    fn unknown_characters_do_not_stop_lexing() {
        assert_eq!(
            kinds("a @ b"),
            vec![TokenKind::Ident, TokenKind::Unknown, TokenKind::Ident]
        );
    }

    #[test]
    fn dotted_access_splits_into_tokens() {
        assert_eq!(
            kinds("u.name"),
            vec![TokenKind::Ident, TokenKind::Dot, TokenKind::Ident]
        );
    }
}

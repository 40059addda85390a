//! Query-body analysis for embedded database queries.
//!
//! A dialect analyzer extracts the parameters a query reads and the fields
//! its final `RETURN` produces. It never sees scaf syntax, only the text
//! between the backticks.

use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryAnalysisError {
    #[error("unbalanced '{bracket}' at offset {offset}")]
    UnbalancedBracket { bracket: char, offset: usize },

    #[error("unterminated string starting at offset {offset}")]
    UnterminatedString { offset: usize },
}

/// One `$name` occurrence. `name` excludes the `$`; `position` is the byte
/// offset of the `$` inside the query body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryParameter {
    pub name: String,
    pub position: usize,
}

/// One item of the final `RETURN` clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnItem {
    pub expression: String,
    pub alias: Option<String>,
    pub is_aggregate: bool,
    /// Byte offset of the item inside the query body.
    pub position: usize,
    /// Byte offset of the alias text, past any opening backtick.
    pub alias_position: Option<usize>,
}

impl ReturnItem {
    /// Name a test statement uses to refer to this field.
    pub fn field_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.expression)
    }

    /// Span of `field_name()` relative to the query body.
    pub fn field_range(&self) -> (usize, usize) {
        match (&self.alias, self.alias_position) {
            (Some(alias), Some(start)) => (start, start + alias.len()),
            _ => (self.position, self.position + self.expression.len()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryMetadata {
    pub parameters: Vec<QueryParameter>,
    pub returns: Vec<ReturnItem>,
}

impl QueryMetadata {
    /// Distinct parameter names in first-occurrence order.
    pub fn parameter_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for p in &self.parameters {
            if !names.contains(&p.name.as_str()) {
                names.push(&p.name);
            }
        }
        names
    }

    pub fn occurrences<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a QueryParameter> {
        self.parameters.iter().filter(move |p| p.name == name)
    }

    pub fn return_item(&self, field: &str) -> Option<&ReturnItem> {
        self.returns.iter().find(|r| r.field_name() == field)
    }
}

pub trait QueryAnalyzer: Send + Sync {
    fn name(&self) -> &'static str;

    fn analyze_query(&self, body: &str) -> Result<QueryMetadata, QueryAnalysisError>;
}

/// Look up an analyzer by dialect name.
pub fn analyzer_for(dialect: &str) -> Option<Arc<dyn QueryAnalyzer>> {
    match dialect.to_ascii_lowercase().as_str() {
        "cypher" | "neo4j" => Some(Arc::new(CypherAnalyzer)),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CypherAnalyzer;

const AGGREGATES: &[&str] = &["count", "sum", "avg", "min", "max", "collect", "stdev", "stdevp"];

const RETURN_TERMINATORS: &[&str] = &["ORDER", "SKIP", "LIMIT", "UNION"];

impl QueryAnalyzer for CypherAnalyzer {
    fn name(&self) -> &'static str {
        "cypher"
    }

    fn analyze_query(&self, body: &str) -> Result<QueryMetadata, QueryAnalysisError> {
        let scan = scan(body)?;
        let returns = extract_returns(body, &scan.top_level);
        Ok(QueryMetadata {
            parameters: scan.parameters,
            returns,
        })
    }
}

struct Scan {
    parameters: Vec<QueryParameter>,
    /// Per byte: true when the byte is code at bracket depth zero, outside
    /// strings and comments.
    top_level: Vec<bool>,
}

#[derive(Clone, Copy)]
enum State {
    Code,
    Str { quote: u8, start: usize },
    LineComment,
    BlockComment,
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn scan(body: &str) -> Result<Scan, QueryAnalysisError> {
    let bytes = body.as_bytes();
    let mut top_level = vec![false; bytes.len()];
    let mut parameters = Vec::new();
    let mut stack: Vec<(u8, usize)> = Vec::new();
    let mut state = State::Code;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        let next = bytes.get(i + 1).copied();
        match state {
            State::Code => match b {
                b'\'' | b'"' => state = State::Str { quote: b, start: i },
                b'/' if next == Some(b'/') => {
                    state = State::LineComment;
                    i += 1;
                }
                b'/' if next == Some(b'*') => {
                    state = State::BlockComment;
                    i += 1;
                }
                b'(' | b'[' | b'{' => stack.push((b, i)),
                b')' | b']' | b'}' => {
                    let open = match b {
                        b')' => b'(',
                        b']' => b'[',
                        _ => b'{',
                    };
                    match stack.pop() {
                        Some((o, _)) if o == open => {}
                        _ => {
                            return Err(QueryAnalysisError::UnbalancedBracket {
                                bracket: b as char,
                                offset: i,
                            })
                        }
                    }
                }
                b'$' if next.is_some_and(is_ident_start) => {
                    let mut end = i + 1;
                    while end < bytes.len() && is_ident_char(bytes[end]) {
                        end += 1;
                    }
                    parameters.push(QueryParameter {
                        name: body[i + 1..end].to_string(),
                        position: i,
                    });
                    if stack.is_empty() {
                        top_level[i..end].fill(true);
                    }
                    i = end;
                    continue;
                }
                _ => top_level[i] = stack.is_empty(),
            },
            State::Str { quote, .. } => {
                if b == b'\\' {
                    i += 1;
                } else if b == quote {
                    state = State::Code;
                }
            }
            State::LineComment => {
                if b == b'\n' {
                    state = State::Code;
                }
            }
            State::BlockComment => {
                if b == b'*' && next == Some(b'/') {
                    state = State::Code;
                    i += 1;
                }
            }
        }
        i += 1;
    }

    if let State::Str { start, .. } = state {
        return Err(QueryAnalysisError::UnterminatedString { offset: start });
    }
    if let Some(&(bracket, offset)) = stack.last() {
        return Err(QueryAnalysisError::UnbalancedBracket {
            bracket: bracket as char,
            offset,
        });
    }

    Ok(Scan {
        parameters,
        top_level,
    })
}

/// Words made only of top-level bytes. Property names after `.` are skipped.
fn top_level_words<'a>(body: &'a str, top: &[bool]) -> Vec<(usize, &'a str)> {
    let bytes = body.as_bytes();
    let mut words = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let boundary = i == 0 || !(is_ident_char(bytes[i - 1]) || bytes[i - 1] == b'.');
        if top[i] && boundary && is_ident_start(bytes[i]) {
            let mut end = i;
            while end < bytes.len() && top[end] && is_ident_char(bytes[end]) {
                end += 1;
            }
            words.push((i, &body[i..end]));
            i = end;
        } else {
            i += 1;
        }
    }
    words
}

fn extract_returns(body: &str, top: &[bool]) -> Vec<ReturnItem> {
    let words = top_level_words(body, top);
    let Some(ret) = words
        .iter()
        .rposition(|(_, w)| w.eq_ignore_ascii_case("RETURN"))
    else {
        return Vec::new();
    };

    let (ret_offset, ret_word) = words[ret];
    let mut start = ret_offset + ret_word.len();
    let mut rest = ret + 1;
    if let Some((offset, word)) = words.get(rest) {
        if word.eq_ignore_ascii_case("DISTINCT") {
            start = offset + word.len();
            rest += 1;
        }
    }

    let mut end = words[rest.min(words.len())..]
        .iter()
        .find(|(_, w)| RETURN_TERMINATORS.iter().any(|t| w.eq_ignore_ascii_case(t)))
        .map(|(offset, _)| *offset)
        .unwrap_or(body.len());
    if let Some(semi) = (start..end).find(|&i| top[i] && body.as_bytes()[i] == b';') {
        end = semi;
    }

    let mut items = Vec::new();
    let mut piece_start = start;
    for i in start..=end {
        let at_comma = i < end && top[i] && body.as_bytes()[i] == b',';
        if i == end || at_comma {
            if let Some(item) = return_item(body, &words, piece_start, i) {
                items.push(item);
            }
            piece_start = i + 1;
        }
    }
    items
}

fn return_item(body: &str, words: &[(usize, &str)], start: usize, end: usize) -> Option<ReturnItem> {
    let raw = &body[start..end];
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let item_start = start + (raw.len() - raw.trim_start().len());
    let item_end = item_start + trimmed.len();

    let alias_word = words
        .iter()
        .rev()
        .find(|(offset, w)| *offset > item_start && *offset < item_end && w.eq_ignore_ascii_case("AS"));

    let (expression, alias, alias_position) = match alias_word {
        Some(&(offset, word)) => {
            let expression = body[item_start..offset].trim_end().to_string();
            let tail = body[offset + word.len()..item_end].trim_start().trim_start_matches('`');
            let alias_start = item_end - tail.len();
            let alias = tail.trim_end().trim_end_matches('`').to_string();
            if alias.is_empty() {
                (expression, None, None)
            } else {
                (expression, Some(alias), Some(alias_start))
            }
        }
        None => (trimmed.to_string(), None, None),
    };

    Some(ReturnItem {
        is_aggregate: is_aggregate(&expression),
        expression,
        alias,
        position: item_start,
        alias_position,
    })
}

fn is_aggregate(expression: &str) -> bool {
    let bytes = expression.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if is_ident_start(bytes[i]) && (i == 0 || !is_ident_char(bytes[i - 1])) {
            let mut end = i;
            while end < bytes.len() && is_ident_char(bytes[end]) {
                end += 1;
            }
            let word = expression[i..end].to_ascii_lowercase();
            let called = expression[end..].trim_start().starts_with('(');
            if called && (AGGREGATES.contains(&word.as_str()) || word.starts_with("percentile")) {
                return true;
            }
            i = end;
        } else {
            i += 1;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyze(body: &str) -> QueryMetadata {
        CypherAnalyzer.analyze_query(body).unwrap()
    }

    #[test]
    fn parameters_in_order_with_offsets() {
        let meta = analyze("MATCH (u:User {id: $id}) WHERE u.name = $name OR u.id = $id RETURN u");
        let names: Vec<_> = meta.parameters.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["id", "name", "id"]);
        assert_eq!(meta.parameters[0].position, 19);
        assert_eq!(meta.parameter_names(), vec!["id", "name"]);
        assert_eq!(meta.occurrences("id").count(), 2);
    }

    #[test]
    fn parameters_inside_strings_are_ignored() {
        let meta = analyze("MATCH (n) WHERE n.x = '$nope' // $also\nRETURN n");
        assert!(meta.parameters.is_empty());
    }

    #[test]
    fn return_items_with_alias_and_aggregate() {
        let meta = analyze("MATCH (u:User) RETURN u.name, u.email AS email, count(u) AS total");
        assert_eq!(meta.returns.len(), 3);
        assert_eq!(meta.returns[0].field_name(), "u.name");
        assert_eq!(meta.returns[1].expression, "u.email");
        assert_eq!(meta.returns[1].field_name(), "email");
        assert!(!meta.returns[1].is_aggregate);
        assert!(meta.returns[2].is_aggregate);
        assert_eq!(meta.returns[0].position, 22);
    }

    #[test]
    fn return_stops_at_order_by_and_limit() {
        let meta = analyze("MATCH (n) RETURN DISTINCT n.a AS a, n.b ORDER BY a LIMIT 3");
        let fields: Vec<_> = meta.returns.iter().map(|r| r.field_name()).collect();
        assert_eq!(fields, vec!["a", "n.b"]);
    }

    #[test]
    fn commas_inside_calls_do_not_split() {
        let meta = analyze("RETURN coalesce(n.a, n.b) AS v, [1, 2] AS xs");
        assert_eq!(meta.returns.len(), 2);
        assert_eq!(meta.returns[0].expression, "coalesce(n.a, n.b)");
    }

    #[test]
    fn last_top_level_return_wins() {
        let meta = analyze("CALL { MATCH (x) RETURN x } WITH x MATCH (y) RETURN y.id AS id");
        assert_eq!(meta.returns.len(), 1);
        assert_eq!(meta.returns[0].field_name(), "id");
    }

    #[test]
    fn field_range_points_at_alias() {
        let body = "RETURN u.email AS email";
        let meta = analyze(body);
        let (start, end) = meta.returns[0].field_range();
        assert_eq!(&body[start..end], "email");
        assert_eq!(start, 18);
    }

    #[test]
    fn field_range_skips_letters_of_the_as_keyword() {
        let body = "MATCH (u) RETURN u.name as a, u.id AS `s`";
        let meta = analyze(body);
        let (start, end) = meta.returns[0].field_range();
        assert_eq!((start, end), (27, 28));
        assert_eq!(&body[start..end], "a");
        let (start, end) = meta.returns[1].field_range();
        assert_eq!(&body[start..end], "s");
        assert_eq!(start, body.len() - 2);
    }

    #[test]
    fn field_range_without_alias_covers_the_expression() {
        let body = "RETURN n.age, n";
        let meta = analyze(body);
        let (start, end) = meta.returns[1].field_range();
        assert_eq!(&body[start..end], "n");
        assert_eq!(start, 14);
    }

    #[test]
    fn unbalanced_brackets_are_errors() {
        assert!(matches!(
            CypherAnalyzer.analyze_query("MATCH (n RETURN n"),
            Err(QueryAnalysisError::UnbalancedBracket { bracket: '(', offset: 6 })
        ));
        assert!(matches!(
            CypherAnalyzer.analyze_query("RETURN n)"),
            Err(QueryAnalysisError::UnbalancedBracket { bracket: ')', .. })
        ));
    }

    #[test]
    fn unterminated_string_is_an_error() {
        assert_eq!(
            CypherAnalyzer.analyze_query("RETURN 'abc"),
            Err(QueryAnalysisError::UnterminatedString { offset: 7 })
        );
    }

    #[test]
    fn analyzer_lookup_by_dialect() {
        assert_eq!(analyzer_for("Cypher").map(|a| a.name()), Some("cypher"));
        assert!(analyzer_for("sql").is_none());
    }
}

use scaf_dsl::ast::{SourcePos, Span};
use tower_lsp::lsp_types::*;

/// Convert a byte offset into an LSP `Position` (0-indexed line, UTF-16
/// character).
pub fn offset_to_position(text: &str, offset: usize) -> Position {
    let mut line = 0u32;
    let mut col = 0u32;
    for (i, ch) in text.char_indices() {
        if i >= offset {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 0;
        } else {
            col += ch.len_utf16() as u32;
        }
    }
    Position::new(line, col)
}

/// Convert an LSP `Position` into a byte offset.
///
/// Columns past the end of a line clamp to the line end; lines past the end
/// of the text clamp to the text end.
pub fn position_to_offset(text: &str, pos: Position) -> usize {
    let mut current_line = 0u32;
    let mut current_col = 0u32;
    for (i, ch) in text.char_indices() {
        if current_line == pos.line && current_col >= pos.character {
            return i;
        }
        if ch == '\n' {
            if current_line == pos.line {
                return i;
            }
            current_line += 1;
            current_col = 0;
        } else {
            current_col += ch.len_utf16() as u32;
        }
    }
    text.len()
}

/// Editor position to the parser's 1-indexed coordinate.
pub fn to_source_pos(text: &str, pos: Position) -> SourcePos {
    let offset = position_to_offset(text, pos);
    let line_start = text[..offset].rfind('\n').map(|i| i + 1).unwrap_or(0);
    let column = text[line_start..offset].chars().count() as u32 + 1;
    SourcePos::new(offset, pos.line + 1, column)
}

pub fn offset_to_range(text: &str, start: usize, end: usize) -> Range {
    Range::new(offset_to_position(text, start), offset_to_position(text, end))
}

pub fn span_to_range(text: &str, span: Span) -> Range {
    offset_to_range(text, span.start.offset, span.end.offset)
}

pub fn is_ident_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

pub fn is_valid_identifier(name: &str) -> bool {
    let mut bytes = name.bytes();
    match bytes.next() {
        Some(b) if b.is_ascii_alphabetic() || b == b'_' => bytes.all(is_ident_char),
        _ => false,
    }
}

/// The text being typed just before `offset`: identifier characters plus
/// `$` and `.`.
pub fn prefix_before(text: &str, offset: usize) -> &str {
    let offset = offset.min(text.len());
    let bytes = text.as_bytes();
    let mut start = offset;
    while start > 0 {
        let b = bytes[start - 1];
        if is_ident_char(b) || b == b'$' || b == b'.' {
            start -= 1;
        } else {
            break;
        }
    }
    &text[start..offset]
}

/// Text of the line containing `offset`, up to `offset`.
pub fn line_before(text: &str, offset: usize) -> &str {
    let offset = offset.min(text.len());
    let line_start = text[..offset].rfind('\n').map(|i| i + 1).unwrap_or(0);
    &text[line_start..offset]
}

/// Leading whitespace of the 0-indexed line `line`.
pub fn line_indent(text: &str, line: u32) -> &str {
    let Some(content) = text.lines().nth(line as usize) else {
        return "";
    };
    let trimmed = content.trim_start();
    &content[..content.len() - trimmed.len()]
}

pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=b.len() {
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Closest candidate within edit distance 2, ties going to the first.
pub fn find_closest<'a>(name: &str, candidates: &'a [String]) -> Option<&'a str> {
    candidates
        .iter()
        .filter(|c| c.as_str() != name)
        .map(|c| (levenshtein(name, c), c))
        .filter(|(d, _)| *d <= 2)
        .min_by_key(|(d, _)| *d)
        .map(|(_, c)| c.as_str())
}

/// First single-quoted name in a diagnostic message.
pub fn extract_quoted_name(message: &str) -> Option<&str> {
    let start = message.find('\'')? + 1;
    let end = start + message[start..].find('\'')?;
    Some(&message[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_round_trip_with_utf16_columns() {
        let text = "a😀b\nxy";
        // The emoji is two UTF-16 units and four bytes.
        assert_eq!(offset_to_position(text, 5), Position::new(0, 3));
        assert_eq!(position_to_offset(text, Position::new(0, 3)), 5);
        assert_eq!(position_to_offset(text, Position::new(1, 1)), 8);
    }

    #[test]
    fn out_of_range_columns_clamp() {
        let text = "ab\ncd";
        assert_eq!(position_to_offset(text, Position::new(0, 99)), 2);
        assert_eq!(position_to_offset(text, Position::new(9, 0)), text.len());
    }

    #[test]
    fn source_pos_is_one_indexed() {
        let text = "ab\ncd";
        assert_eq!(to_source_pos(text, Position::new(1, 1)), SourcePos::new(4, 2, 2));
    }

    #[test]
    fn prefix_includes_dollar_and_dots() {
        let text = "  $id u.na";
        assert_eq!(prefix_before(text, 5), "$id");
        assert_eq!(prefix_before(text, text.len()), "u.na");
        assert_eq!(line_before("x\n  setup ", 10), "  setup ");
    }

    #[test]
    fn closest_name_within_distance_two() {
        let names = vec!["GetUser".to_string(), "CreatePost".to_string()];
        assert_eq!(find_closest("GetUsr", &names), Some("GetUser"));
        assert_eq!(find_closest("Unrelated", &names), None);
    }

    #[test]
    fn identifier_rules() {
        assert!(is_valid_identifier("_a1"));
        assert!(!is_valid_identifier("1a"));
        assert!(!is_valid_identifier("$a"));
        assert!(!is_valid_identifier(""));
    }

    #[test]
    fn quoted_name_extraction() {
        assert_eq!(extract_quoted_name("undefined query 'Foo'"), Some("Foo"));
        assert_eq!(extract_quoted_name("no quotes"), None);
    }
}

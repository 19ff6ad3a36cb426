/// Free-text search → boolean-mode full-text query.
///
/// Every term becomes required (`+term`) unless the user already gave it an
/// operator. The one exception is a leading word shorter than the engine's
/// minimum word length, which is kept as typed (`at base` → `at+base`).
/// Dotted numbers such as ICD codes (`001.1`) are quoted so the
/// full-text engine does not split them on the dot. Terms are joined with
/// no separator; the operators mark the boundaries.
///
/// ```
/// use cohortsql::keyword::sanitize;
///
/// assert_eq!(sanitize("lun* -can"), "+lun*-can");
/// assert_eq!(sanitize("001.1"), "+\"001.1\"");
/// ```
pub fn sanitize(text: &str) -> String {
    let mut query = String::new();

    for token in text.split_whitespace() {
        let (operator, term) = split_operator(token);
        if term.is_empty() {
            continue;
        }

        if query.is_empty() && operator.is_none() && is_short_word(term) {
            query.push_str(term);
            continue;
        }

        query.push(operator.unwrap_or('+'));
        if is_decimal(term) {
            query.push('"');
            query.push_str(term);
            query.push('"');
        } else {
            query.push_str(term);
        }
    }

    query
}

/// Minimum indexed word length of the full-text engine.
const MIN_WORD_LEN: usize = 3;

/// Operators a user may already have put in front of a term.
const OPERATORS: [char; 6] = ['+', '-', '~', '<', '>', '('];

fn split_operator(token: &str) -> (Option<char>, &str) {
    match token.chars().next() {
        Some(c) if OPERATORS.contains(&c) => (Some(c), &token[c.len_utf8()..]),
        _ => (None, token),
    }
}

/// A plain word below [`MIN_WORD_LEN`]. Wildcards and quoted phrases are
/// never short words.
fn is_short_word(term: &str) -> bool {
    !term.starts_with('"') && !term.ends_with('*') && term.chars().count() < MIN_WORD_LEN
}

/// `001.1`, `250.00`: digits with at least one interior dot.
fn is_decimal(term: &str) -> bool {
    term.contains('.')
        && !term.starts_with('.')
        && !term.ends_with('.')
        && term.chars().all(|c| c.is_ascii_digit() || c == '.')
}

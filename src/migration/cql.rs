//! Splitting CQL scripts into individually executable statements
//!
//! Cassandra does not accept several DDL statements in one request, so a
//! migration script is split on `;`. The scanner only recognizes comments,
//! quoted strings and delimiters, which is enough to avoid splitting on a
//! semicolon that sits inside a string or a comment.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    /// `--` or `//` up to the end of the line
    LineComment,
    /// `/* ... */`
    BlockComment,
    /// `'...'`, `"..."` or `$$...$$`, copied verbatim
    Quoted,
    Semicolon,
    Whitespace,
    Other,
}

struct Scanner<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    /// Length of a quoted run opened by `quote`, honouring backslash escapes.
    /// Unterminated quotes extend to the end of input.
    fn quoted_len(rest: &str, quote: &str) -> usize {
        let body_start = quote.len();
        let mut chars = rest[body_start..].char_indices();
        while let Some((i, c)) = chars.next() {
            if c == '\\' {
                chars.next();
            } else if rest[body_start + i..].starts_with(quote) {
                return body_start + i + quote.len();
            }
        }
        rest.len()
    }

    fn next_token(&mut self) -> Option<(Token, &'a str)> {
        let rest = self.rest();
        let first = rest.chars().next()?;

        let (token, len) = if rest.starts_with("--") || rest.starts_with("//") {
            (Token::LineComment, rest.find('\n').unwrap_or(rest.len()))
        } else if rest.starts_with("/*") {
            let len = rest[2..].find("*/").map_or(rest.len(), |end| end + 4);
            (Token::BlockComment, len)
        } else if rest.starts_with("$$") {
            (Token::Quoted, Self::quoted_len(rest, "$$"))
        } else if first == '\'' || first == '"' {
            (Token::Quoted, Self::quoted_len(rest, &rest[..1]))
        } else if first == ';' {
            (Token::Semicolon, 1)
        } else if first.is_whitespace() {
            let len = rest
                .char_indices()
                .find(|(_, c)| !c.is_whitespace())
                .map_or(rest.len(), |(i, _)| i);
            (Token::Whitespace, len)
        } else {
            (Token::Other, first.len_utf8())
        };

        let text = &rest[..len];
        self.pos += len;
        Some((token, text))
    }
}

/// Split a CQL script into statements
///
/// Comments are dropped, runs of whitespace (and block comments) collapse to a
/// single space, and empty statements are skipped. The trailing statement does
/// not need a terminating `;`.
///
/// # Example
///
/// ```
/// use harbormaster::migration::cql::split_statements;
///
/// let statements = split_statements("CREATE TABLE a (k int PRIMARY KEY);\n-- done\nDROP TABLE b");
/// assert_eq!(statements, vec!["CREATE TABLE a (k int PRIMARY KEY)", "DROP TABLE b"]);
/// ```
pub fn split_statements(script: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut scanner = Scanner::new(script);

    let mut flush = |current: &mut String| {
        let statement = current.trim();
        if !statement.is_empty() {
            statements.push(collapse_spaces(statement));
        }
        current.clear();
    };

    while let Some((token, text)) = scanner.next_token() {
        match token {
            Token::LineComment => {}
            Token::Semicolon => flush(&mut current),
            Token::Whitespace | Token::BlockComment => current.push(' '),
            Token::Quoted | Token::Other => current.push_str(text),
        }
    }
    flush(&mut current);

    statements
}

// Whitespace tokens each become one space; adjacent comment/whitespace runs can
// still leave doubles, which are squeezed here outside of quoted text.
fn collapse_spaces(statement: &str) -> String {
    let mut out = String::with_capacity(statement.len());
    let mut scanner = Scanner::new(statement);
    while let Some((token, text)) = scanner.next_token() {
        match token {
            Token::Whitespace => {
                if !out.ends_with(' ') {
                    out.push(' ');
                }
            }
            _ => out.push_str(text),
        }
    }
    out
}

//! Shell quoting for the wrapped command string.
//!
//! Everything embedded into the final shell command passes through here;
//! the compilers never concatenate raw strings into the wrapper.

/// A token destined for the wrapped shell command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellToken {
    /// Quoted so the shell sees it as a single word, byte for byte.
    Literal(String),
    /// Emitted verbatim so it keeps its operator function (`&&`, `|`, …).
    Operator(&'static str),
}

impl ShellToken {
    pub fn literal(value: impl Into<String>) -> Self {
        ShellToken::Literal(value.into())
    }
}

/// Join tokens into a single string a POSIX shell parses back into the
/// same words and operators.
pub fn join_tokens(tokens: &[ShellToken]) -> String {
    tokens
        .iter()
        .map(|token| match token {
            ShellToken::Literal(value) => quote(value),
            ShellToken::Operator(op) => (*op).to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Quote a single word for a POSIX shell.
pub fn quote(token: &str) -> String {
    if token.is_empty() {
        return "''".to_string();
    }
    if token.chars().all(is_plain_char) {
        return token.to_string();
    }
    if token.contains('\'') {
        return double_quote(token);
    }
    if token
        .chars()
        .any(|c| c.is_whitespace() || c == '"' || c == '\\')
    {
        return format!("'{token}'");
    }
    // Bare metacharacters only: escape each one individually.
    token
        .chars()
        .map(|c| {
            if is_plain_char(c) {
                c.to_string()
            } else {
                format!("\\{c}")
            }
        })
        .collect()
}

fn is_plain_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-' | '+' | ':' | ',' | '=' | '@' | '%')
}

fn double_quote(token: &str) -> String {
    let mut out = String::with_capacity(token.len() + 2);
    out.push('"');
    for c in token.chars() {
        if matches!(c, '"' | '\\' | '$' | '`' | '!') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

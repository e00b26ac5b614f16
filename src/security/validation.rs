use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

/// Reasons a report template is rejected by the safety validator.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyQuery,
    OnlyComments,
    NotSelect,
    ForbiddenKeyword(String),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::EmptyQuery => write!(f, "Query must not be empty"),
            ValidationError::OnlyComments => write!(f, "Query must not contain only comments"),
            ValidationError::NotSelect => write!(f, "Query must start with SELECT"),
            ValidationError::ForbiddenKeyword(keyword) => {
                write!(f, "Command {} is not allowed", keyword)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Keywords that may not appear anywhere in a report template, as whole words.
pub const BLOCKED_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "TRUNCATE", "ALTER", "CREATE", "EXEC", "EXECUTE",
    "GRANT", "REVOKE", "BACKUP", "RESTORE", "SHUTDOWN",
];

fn line_comment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"--[^\n]*").expect("valid line comment pattern"))
}

fn block_comment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)/\*.*?\*/").expect("valid block comment pattern"))
}

fn blocked_keyword_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let pattern = format!(r"(?i)\b(?:{})\b", BLOCKED_KEYWORDS.join("|"));
        Regex::new(&pattern).expect("valid keyword pattern")
    })
}

/// Remove `-- ...` and `/* ... */` comments.
///
/// Line comments go first, so a `--` inside a block comment ends that line's
/// analysis the same way it would for the backend parser in most dialects.
pub fn strip_comments(query: &str) -> String {
    let without_lines = line_comment_re().replace_all(query, "");
    block_comment_re().replace_all(&without_lines, "").into_owned()
}

/// Check that a report template is a single read-only statement.
///
/// This is a keyword denylist, not a SQL parser: keywords inside string
/// literals are rejected too, and dialect-specific side-effecting constructs
/// outside the list (e.g. `SELECT ... INTO`) are not detected.
pub fn validate_query(query: &str) -> Result<(), ValidationError> {
    if query.trim().is_empty() {
        return Err(ValidationError::EmptyQuery);
    }

    let stripped = strip_comments(query);
    let stripped = stripped.trim();
    if stripped.is_empty() {
        return Err(ValidationError::OnlyComments);
    }

    if !stripped.to_uppercase().starts_with("SELECT") {
        return Err(ValidationError::NotSelect);
    }

    if let Some(found) = blocked_keyword_re().find(stripped) {
        return Err(ValidationError::ForbiddenKeyword(found.as_str().to_uppercase()));
    }

    Ok(())
}

/// Strip control characters from a string for safe display.
/// Preserves newlines, carriage returns, and tabs.
pub fn sanitize_for_display(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\r' || *c == '\t')
        .collect()
}

/// Replace every occurrence of `secret` in `input` with a fixed mask.
pub fn redact_secret(input: &str, secret: &str) -> String {
    if secret.is_empty() {
        return input.to_string();
    }
    input.replace(secret, "******")
}

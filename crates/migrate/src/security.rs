//! Identifier quoting for generated SQL
//!
//! Every table, column and constraint name that reaches a DDL statement goes
//! through [`escape_identifier`]; statements are never assembled from raw names.

/// Escape a SQL identifier (table name, column name, etc.)
///
/// Doubles any embedded double quote and wraps the result in double quotes,
/// which is the PostgreSQL quoted-identifier form.
///
/// # Examples
/// ```
/// use elif_migrate::security::escape_identifier;
///
/// assert_eq!(escape_identifier("user_table"), "\"user_table\"");
/// assert_eq!(escape_identifier("table\"name"), "\"table\"\"name\"");
/// ```
pub fn escape_identifier(identifier: &str) -> String {
    let escaped = identifier.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

/// Escape and comma-join a list of identifiers
pub fn escape_identifier_list<S: AsRef<str>>(identifiers: &[S]) -> String {
    identifiers
        .iter()
        .map(|identifier| escape_identifier(identifier.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}

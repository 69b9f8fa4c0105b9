//! SQL identifier and literal quoting.
//!
//! Every table, view and schema name the engine splices into generated SQL
//! goes through these helpers.

/// Quote a SQL identifier using ANSI double-quoting.
///
/// Embedded double-quotes are escaped by doubling them (`"` → `""`).
///
/// # Examples
///
/// ```
/// use tidesql_core::quote_ident;
///
/// assert_eq!(quote_ident("users"), "\"users\"");
/// assert_eq!(quote_ident("user\"name"), "\"user\"\"name\"");
/// ```
#[inline]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a schema-qualified name: `"schema"."name"`.
#[inline]
pub fn quote_qualified(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(name))
}

/// Quote a string literal using single quotes.
///
/// ```
/// use tidesql_core::quote_literal;
///
/// assert_eq!(quote_literal("/tmp/it's.db"), "'/tmp/it''s.db'");
/// ```
#[inline]
pub fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// Sanitize a SQL identifier by removing non-alphanumeric/underscore characters.
///
/// Used where quoting is not possible, such as generated object names.
///
/// ```
/// use tidesql_core::sanitize_identifier;
///
/// assert_eq!(sanitize_identifier("user;DROP TABLE--"), "userDROPTABLE");
/// ```
#[inline]
pub fn sanitize_identifier(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect()
}

/// Strip one level of identifier quoting (`"x"`, `` `x` ``, `[x]`) and unescape.
pub fn unquote_ident(raw: &str) -> String {
    let bytes = raw.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        let inner = &raw[1..raw.len() - 1];
        match (first, last) {
            (b'"', b'"') => return inner.replace("\"\"", "\""),
            (b'`', b'`') => return inner.replace("``", "`"),
            (b'[', b']') => return inner.to_string(),
            _ => {}
        }
    }
    raw.to_string()
}

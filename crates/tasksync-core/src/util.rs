//! Shared utility functions used across multiple modules.

/// Normalize optional text by trimming whitespace and removing empties.
///
/// Returns `None` when the input is `None` or the trimmed value is empty.
pub fn normalize_text_option(value: Option<String>) -> Option<String> {
    let value = value?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Check if a string starts with `http://` or `https://`.
pub fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

/// Truncate text to at most 180 characters for error messages.
pub fn compact_text(value: &str) -> String {
    value.trim().chars().take(180).collect()
}

/// Convert an optional string into a libSQL value, mapping `None` to NULL.
pub(crate) fn text_or_null(value: Option<String>) -> libsql::Value {
    value.map_or(libsql::Value::Null, libsql::Value::Text)
}

/// Convert an optional integer into a libSQL value, mapping `None` to NULL.
pub(crate) fn integer_or_null(value: Option<i64>) -> libsql::Value {
    value.map_or(libsql::Value::Null, libsql::Value::Integer)
}

/// Read a nullable TEXT column.
pub(crate) fn column_text(row: &libsql::Row, idx: i32) -> crate::Result<Option<String>> {
    match row.get_value(idx)? {
        libsql::Value::Text(text) => Ok(Some(text)),
        _ => Ok(None),
    }
}

/// Read a nullable INTEGER column.
pub(crate) fn column_integer(row: &libsql::Row, idx: i32) -> crate::Result<Option<i64>> {
    match row.get_value(idx)? {
        libsql::Value::Integer(value) => Ok(Some(value)),
        _ => Ok(None),
    }
}

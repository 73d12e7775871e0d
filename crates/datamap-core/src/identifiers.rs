//! Identifier validation and quoting for table, column and member names.

use std::sync::OnceLock;

use regex::Regex;

/// Plain or schema-qualified identifier (`orders`, `sales.orders`, `Order_Line2`).
const IDENTIFIER_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$";

fn identifier_regex() -> Option<&'static Regex> {
    static REGEX: OnceLock<Option<Regex>> = OnceLock::new();
    REGEX
        .get_or_init(|| match Regex::new(IDENTIFIER_PATTERN) {
            Ok(regex) => Some(regex),
            Err(e) => {
                tracing::warn!(
                    pattern = IDENTIFIER_PATTERN,
                    error = %e,
                    "Invalid identifier pattern, identifier validation disabled"
                );
                None
            }
        })
        .as_ref()
}

/// Check whether `name` is usable as a table, column or member name.
pub fn is_valid_identifier(name: &str) -> bool {
    match identifier_regex() {
        Some(regex) => regex.is_match(name),
        None => !name.is_empty(),
    }
}

/// Quote an identifier for trace output, quoting each dotted part.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('.', "\".\""))
}

//! Field-name normalisation.

use regex::Regex;
use std::sync::OnceLock;

fn separators() -> Option<&'static Regex> {
    static SEPARATORS: OnceLock<Option<Regex>> = OnceLock::new();
    SEPARATORS
        .get_or_init(|| Regex::new(r"[^a-z0-9]+").ok())
        .as_ref()
}

/// Normalises a raw header into an identifier-safe field name.
///
/// Lowercases, collapses every run of non-alphanumeric characters into a
/// single `_`, trims leading and trailing underscores and prefixes names
/// that would start with a digit. `"Customer ID"` becomes `customer_id`.
#[must_use]
pub fn normalize_field_name(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    let collapsed = match separators() {
        Some(re) => re.replace_all(&lowered, "_").into_owned(),
        None => lowered
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect(),
    };
    let trimmed = collapsed.trim_matches('_');

    if trimmed.is_empty() {
        return "_".to_string();
    }
    if trimmed.starts_with(|c: char| c.is_ascii_digit()) {
        return format!("_{trimmed}");
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalizes_headers() {
        assert_eq!(normalize_field_name("Customer ID"), "customer_id");
        assert_eq!(normalize_field_name("  Order--Total ($) "), "order_total");
        assert_eq!(normalize_field_name("already_fine"), "already_fine");
    }

    #[test]
    fn test_leading_digit_and_empty() {
        assert_eq!(normalize_field_name("2nd place"), "_2nd_place");
        assert_eq!(normalize_field_name("???"), "_");
    }
}

//! SQL identifier validation.
//!
//! Every table, partition, and index name interpolated into DDL must pass
//! through here first; literal values always go through bind parameters.

use crate::error::{Result, StratumError};

pub const MAX_IDENT_LEN: usize = 64;

/// Validates an identifier against the allow-list
/// `[A-Za-z_][A-Za-z0-9_]*`, at most 64 characters.
pub fn validate_identifier(ident: &str) -> Result<()> {
    if ident.is_empty() || ident.len() > MAX_IDENT_LEN {
        return Err(StratumError::Identifier(format!(
            "'{}' must be 1..={} characters",
            ident, MAX_IDENT_LEN
        )));
    }
    let mut chars = ident.chars();
    let first = chars.next().unwrap();
    if !(first.is_ascii_alphabetic() || first == '_') {
        return Err(StratumError::Identifier(format!(
            "'{}' must start with a letter or underscore",
            ident
        )));
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(StratumError::Identifier(format!(
            "'{}' contains characters outside [A-Za-z0-9_]",
            ident
        )));
    }
    Ok(())
}

/// Normalizes a component class name into a partition-safe identifier:
/// lowercased, with every non-alphanumeric character mapped to `_`.
/// The result is re-validated before use.
pub fn normalize_component_name(name: &str) -> Result<String> {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else {
            out.push('_');
        }
    }
    if out
        .chars()
        .next()
        .map(|c| c.is_ascii_digit())
        .unwrap_or(true)
    {
        out.insert(0, '_');
    }
    out.truncate(MAX_IDENT_LEN);
    validate_identifier(&out)?;
    Ok(out)
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn normalize_never_produces_invalid_idents(name in ".{1,120}") {
            if let Ok(normalized) = normalize_component_name(&name) {
                prop_assert!(validate_identifier(&normalized).is_ok());
            }
        }
    }
}

//! Validation trait and shared field validators.

use crate::error::{ConfigError, ConfigResult};

/// Implemented by every configuration domain that can be validated.
pub trait Validatable {
    fn validate(&self) -> ConfigResult<()>;

    /// Domain name used in error messages.
    fn domain_name(&self) -> &'static str;
}

/// Validate that a name is non-empty and safe to use in tool prefixes and
/// URL path segments.
pub fn validate_identifier(value: &str, field: &str, domain: &str) -> ConfigResult<()> {
    if value.trim().is_empty() {
        return Err(ConfigError::domain(domain, format!("{} must not be empty", field)));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(ConfigError::domain(
            domain,
            format!(
                "{} '{}' may only contain alphanumerics, '-', '_' and '.'",
                field, value
            ),
        ));
    }
    Ok(())
}

/// Validate a TCP port is usable.
pub fn validate_port(port: u16, field: &str, domain: &str) -> ConfigResult<()> {
    if port == 0 {
        return Err(ConfigError::domain(domain, format!("{} must not be 0", field)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_reject_separator_characters() {
        assert!(validate_identifier("weather-api", "name", "upstream").is_ok());
        assert!(validate_identifier("a_b.c", "name", "upstream").is_ok());
        assert!(validate_identifier("", "name", "upstream").is_err());
        assert!(validate_identifier("has space", "name", "upstream").is_err());
        assert!(validate_identifier("slash/name", "name", "upstream").is_err());
    }

    #[test]
    fn port_zero_is_rejected() {
        assert!(validate_port(0, "port", "server").is_err());
        assert!(validate_port(8080, "port", "server").is_ok());
    }
}

use std::collections::HashMap;

use crate::error::Error;

/// Validate an entity name.
/// Rules: lowercase `[a-z0-9-]`, max 63 chars, no leading/trailing hyphens.
pub fn validate_name(name: &str) -> Result<(), Error> {
    if name.is_empty() {
        return Err(Error::Validation("name must not be empty".into()));
    }
    if name.len() > 63 {
        return Err(Error::Validation(format!(
            "name '{}' exceeds 63 characters (got {})",
            name,
            name.len()
        )));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(Error::Validation(format!(
            "name '{}' must not start or end with a hyphen",
            name
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(Error::Validation(format!(
            "name '{}' must contain only lowercase letters, digits, and hyphens [a-z0-9-]",
            name
        )));
    }
    Ok(())
}

/// Label keys are capped at 253 chars, values at 63.
pub fn validate_labels(labels: &HashMap<String, String>) -> Result<(), Error> {
    for (key, value) in labels {
        if key.is_empty() || key.len() > 253 {
            return Err(Error::Validation(format!(
                "label key '{}' must be 1..=253 characters",
                key
            )));
        }
        if value.len() > 63 {
            return Err(Error::Validation(format!(
                "label value for '{}' exceeds 63 characters",
                key
            )));
        }
    }
    Ok(())
}

/// Loose semver check: `major.minor.patch`, numeric segments.
pub fn validate_version(version: &str) -> Result<(), Error> {
    let parts: Vec<&str> = version.split('.').collect();
    if parts.len() != 3 || parts.iter().any(|p| p.is_empty() || p.parse::<u64>().is_err()) {
        return Err(Error::Validation(format!(
            "version '{}' is not of the form major.minor.patch",
            version
        )));
    }
    Ok(())
}

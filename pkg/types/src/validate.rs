use anyhow::{Result, bail};

/// Validate a quota resource name such as `gigabytes` or `volumes_ssd-tier`.
/// Rules: lowercase `[a-z0-9_-]`, max 255 chars, must start with a letter.
pub fn validate_resource_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("resource name must not be empty");
    }
    if name.len() > 255 {
        bail!("resource name '{}' exceeds 255 characters (got {})", name, name.len());
    }
    if !name.starts_with(|c: char| c.is_ascii_lowercase()) {
        bail!("resource name '{}' must start with a lowercase letter", name);
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    {
        bail!(
            "resource name '{}' must contain only lowercase letters, digits, '_' and '-'",
            name
        );
    }
    Ok(())
}

/// Validate an identifier used as a key segment (project ids, class names,
/// cluster names). `/` is rejected because it separates key segments.
pub fn validate_key_segment(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        bail!("{} must not be empty", kind);
    }
    if value.len() > 255 {
        bail!("{} '{}' exceeds 255 characters (got {})", kind, value, value.len());
    }
    if value.contains('/') || value.chars().any(char::is_control) {
        bail!("{} '{}' must not contain '/' or control characters", kind, value);
    }
    Ok(())
}

use once_cell::sync::Lazy;
use regex::Regex;
use validator::ValidationError;

/// Input validation for lifecycle requests

// Compile regex patterns once at startup
static USERNAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9][a-z0-9._-]{0,63}$")
        .expect("hardcoded username regex is invalid - fix source code")
});

/// Validate username format (1-64 characters of `[a-z0-9._-]`, alphanumeric first)
pub fn is_valid_username(username: &str) -> bool {
    USERNAME_REGEX.is_match(username)
}

/// validator crate compatible custom validator for usernames
pub fn validate_username(username: &str) -> Result<(), ValidationError> {
    if is_valid_username(username) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_username"))
    }
}

/// Directory uidNumber: a positive integer carried as a string
pub fn validate_uid_number(user_uid: &str) -> Result<(), ValidationError> {
    match user_uid.trim().parse::<u32>() {
        Ok(n) if n > 0 => Ok(()),
        _ => Err(ValidationError::new("uid_not_positive_integer")),
    }
}

/// Every name in the list must be non-empty
pub fn validate_names(names: &[String]) -> Result<(), ValidationError> {
    if names.iter().any(|n| n.trim().is_empty()) {
        Err(ValidationError::new("empty_name"))
    } else {
        Ok(())
    }
}

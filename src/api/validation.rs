//! Input validation for API requests.
//!
//! For collecting multiple validation errors and returning them as an
//! ApiError, use the `ValidationErrorBuilder` from the `error` module.

use lazy_static::lazy_static;
use regex::Regex;

use crate::api::error::ApiError;
use crate::db::models::TeamRole;

lazy_static! {
    /// Pragmatic email check: local@domain.tld
    static ref EMAIL_REGEX: Regex =
        Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
}

pub const MAX_TITLE_LENGTH: usize = 300;
pub const MAX_QUERY_LENGTH: usize = 500;
pub const MIN_QUERY_LENGTH: usize = 3;

pub fn require_non_empty(field: &str, value: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::validation_field(
            field,
            format!("{} is required", field),
        ));
    }
    if value.len() > MAX_TITLE_LENGTH {
        return Err(ApiError::validation_field(
            field,
            format!("{} is too long (max {} characters)", field, MAX_TITLE_LENGTH),
        ));
    }
    Ok(())
}

pub fn validate_email(email: &str) -> Result<(), ApiError> {
    if !EMAIL_REGEX.is_match(email) {
        return Err(ApiError::validation_field("email", "Invalid email address"));
    }
    Ok(())
}

/// Search queries must carry at least a few characters; trimmed and capped.
pub fn validate_query(query: &str) -> Result<String, ApiError> {
    let trimmed = query.trim();
    if trimmed.len() < MIN_QUERY_LENGTH {
        return Err(ApiError::validation_field(
            "query",
            format!("Query must be at least {} characters", MIN_QUERY_LENGTH),
        ));
    }
    Ok(trimmed.chars().take(MAX_QUERY_LENGTH).collect())
}

pub fn validate_team_role(role: &str) -> Result<TeamRole, ApiError> {
    TeamRole::parse(role)
        .ok_or_else(|| ApiError::validation_field("role", "Role must be owner, admin, or member"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_non_empty() {
        assert!(require_non_empty("title", "A title").is_ok());
        assert!(require_non_empty("title", "   ").is_err());
        assert!(require_non_empty("title", &"x".repeat(400)).is_err());
    }

    #[test]
    fn test_validate_email() {
        assert!(validate_email("user@example.org").is_ok());
        assert!(validate_email("no-at-sign").is_err());
        assert!(validate_email("two@@example.org").is_err());
        assert!(validate_email("user@nodot").is_err());
    }

    #[test]
    fn test_validate_query_bounds() {
        assert!(validate_query("ml").is_err());
        assert_eq!(validate_query("  graph neural nets  ").unwrap(), "graph neural nets");
        let long = "q".repeat(900);
        assert_eq!(validate_query(&long).unwrap().len(), MAX_QUERY_LENGTH);
    }

    #[test]
    fn test_validate_team_role() {
        assert_eq!(validate_team_role("admin").unwrap(), TeamRole::Admin);
        assert!(validate_team_role("superuser").is_err());
    }
}

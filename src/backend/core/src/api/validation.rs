//! Request validation.
//!
//! Bodies are checked field by field against the raw JSON so that every
//! problem is reported at once as `issues: [{path, message}]`, rather than
//! failing on the first serde error.

use axum::extract::rejection::JsonRejection;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;
use uuid::Uuid;

use crate::error::{PerchError, ValidationIssue};
use crate::users::NewUser;

// ═══════════════════════════════════════════════════════════════════════════════
// Pre-compiled Regex Patterns
// ═══════════════════════════════════════════════════════════════════════════════

/// Email validation regex (RFC 5322 simplified, dotted domain required).
static EMAIL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)+$"
    ).expect("Invalid email regex")
});

const MAX_NAME_LEN: usize = 255;
const MAX_LANGUAGE_CODE_LEN: usize = 35;

// ═══════════════════════════════════════════════════════════════════════════════
// Field Reader
// ═══════════════════════════════════════════════════════════════════════════════

/// Reads typed fields out of a JSON object, collecting issues as it goes.
struct FieldReader<'a> {
    object: &'a Map<String, Value>,
    issues: Vec<ValidationIssue>,
}

impl<'a> FieldReader<'a> {
    fn new(object: &'a Map<String, Value>) -> Self {
        Self {
            object,
            issues: Vec::new(),
        }
    }

    fn issue(&mut self, path: &str, message: impl Into<String>) {
        self.issues.push(ValidationIssue::new(path, message));
    }

    /// Absent and `null` both read as `None`.
    fn present(&self, field: &str) -> Option<&'a Value> {
        self.object.get(field).filter(|v| !v.is_null())
    }

    fn positive_int(&mut self, field: &str) -> Option<i64> {
        match self.present(field) {
            None => {
                self.issue(field, "Required");
                None
            }
            Some(value) => match value.as_i64() {
                Some(n) if n > 0 => Some(n),
                _ => {
                    self.issue(field, "Expected a positive integer");
                    None
                }
            },
        }
    }

    fn string(&mut self, field: &str, required: bool, max_len: usize) -> Option<String> {
        let Some(value) = self.present(field) else {
            if required {
                self.issue(field, "Required");
            }
            return None;
        };
        let Some(s) = value.as_str() else {
            self.issue(field, "Expected a string");
            return None;
        };

        let len = s.chars().count();
        if len == 0 {
            self.issue(field, "Must not be empty");
            None
        } else if len > max_len {
            self.issue(field, format!("Must be at most {} characters", max_len));
            None
        } else {
            Some(s.to_string())
        }
    }

    fn boolean(&mut self, field: &str) -> Option<bool> {
        let value = self.present(field)?;
        match value.as_bool() {
            Some(b) => Some(b),
            None => {
                self.issue(field, "Expected a boolean");
                None
            }
        }
    }

    fn email(&mut self, field: &str) -> Option<String> {
        let email = self.string(field, false, MAX_NAME_LEN)?;
        if EMAIL_REGEX.is_match(&email) {
            Some(email)
        } else {
            self.issue(field, "Invalid email");
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Validators
// ═══════════════════════════════════════════════════════════════════════════════

/// Validate a create-user body.
pub fn validate_new_user(body: &Value) -> Result<NewUser, PerchError> {
    let Some(object) = body.as_object() else {
        return Err(PerchError::validation(vec![ValidationIssue::new(
            "body",
            "Expected an object",
        )]));
    };

    let mut reader = FieldReader::new(object);
    let telegram_id = reader.positive_int("telegramId");
    let username = reader.string("username", false, MAX_NAME_LEN);
    let first_name = reader.string("firstName", true, MAX_NAME_LEN);
    let last_name = reader.string("lastName", false, MAX_NAME_LEN);
    let language_code = reader.string("languageCode", false, MAX_LANGUAGE_CODE_LEN);
    let is_bot = reader.boolean("isBot");
    let is_premium = reader.boolean("isPremium");
    let email = reader.email("email");

    match (telegram_id, first_name) {
        (Some(telegram_id), Some(first_name)) if reader.issues.is_empty() => Ok(NewUser {
            telegram_id,
            username,
            first_name,
            last_name,
            language_code,
            is_bot,
            is_premium,
            email,
        }),
        _ => Err(PerchError::validation(reader.issues)),
    }
}

/// Validate a path id.
pub fn parse_user_id(raw: &str) -> Result<Uuid, PerchError> {
    Uuid::parse_str(raw)
        .map_err(|_| PerchError::validation(vec![ValidationIssue::new("params.id", "Invalid uuid")]))
}

/// Report an unreadable body the same way as a field failure.
pub fn json_rejection(rejection: JsonRejection) -> PerchError {
    PerchError::validation(vec![ValidationIssue::new("body", rejection.body_text())])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn issues(err: PerchError) -> Vec<String> {
        err.details().issues.iter().map(|i| i.path.clone()).collect()
    }

    #[test]
    fn test_minimal_user() {
        let user = validate_new_user(&json!({"telegramId": 5, "firstName": "Ada"})).unwrap();
        assert_eq!(user.telegram_id, 5);
        assert_eq!(user.first_name, "Ada");
        assert!(user.email.is_none());
    }

    #[test]
    fn test_all_issues_reported() {
        let err = validate_new_user(&json!({
            "telegramId": -1,
            "firstName": "",
            "languageCode": "x".repeat(36),
            "email": "not-an-email",
            "isBot": "yes",
        }))
        .unwrap_err();
        let paths = issues(err);
        assert_eq!(paths, vec!["telegramId", "firstName", "languageCode", "isBot", "email"]);
    }

    #[test]
    fn test_telegram_id_must_be_integer() {
        let err = validate_new_user(&json!({"telegramId": 1.5, "firstName": "Ada"})).unwrap_err();
        assert_eq!(issues(err), vec!["telegramId"]);
        let err = validate_new_user(&json!({"telegramId": "12", "firstName": "Ada"})).unwrap_err();
        assert_eq!(issues(err), vec!["telegramId"]);
    }

    #[test]
    fn test_name_length_bounds() {
        let ok = validate_new_user(&json!({"telegramId": 1, "firstName": "x".repeat(255)}));
        assert!(ok.is_ok());
        let err = validate_new_user(&json!({"telegramId": 1, "firstName": "x".repeat(256)})).unwrap_err();
        assert_eq!(issues(err), vec!["firstName"]);
    }

    #[test]
    fn test_email_format() {
        assert!(validate_new_user(&json!({"telegramId": 1, "firstName": "A", "email": "a@b.co"})).is_ok());
        assert!(validate_new_user(&json!({"telegramId": 1, "firstName": "A", "email": "a@b"})).is_err());
    }

    #[test]
    fn test_parse_user_id() {
        assert!(parse_user_id("2f1b1f9e-7f3c-4a53-9d5c-3a1e2b9c7d10").is_ok());
        let err = parse_user_id("42").unwrap_err();
        assert_eq!(err.http_status(), axum::http::StatusCode::BAD_REQUEST);
    }
}

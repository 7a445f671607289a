//! Typed error types for the Runbox script execution core.
//!
//! Provides [`CoreError`], the error type returned to collaborators (CLI,
//! HTTP layer, scheduler) by the script service. Sandbox-origin failures are
//! never represented here: they are folded into an execution record's
//! `error` status instead.

use thiserror::Error;

/// Canonical error type for Runbox core operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// No script exists with the given id.
    #[error("script not found: {0}")]
    ScriptNotFound(u64),

    /// No script exists with the given name.
    #[error("script not found: '{name}'")]
    ScriptNameNotFound {
        /// The name that was looked up.
        name: String,
        /// The closest existing script name, if any is close enough.
        suggestion: Option<String>,
    },

    /// No execution exists with the given id.
    #[error("execution not found: {0}")]
    ExecutionNotFound(u64),

    /// No schedule exists with the given id.
    #[error("schedule not found: {0}")]
    ScheduleNotFound(u64),

    /// A script with this name already exists.
    #[error("script with name '{0}' already exists")]
    DuplicateName(String),

    /// An uploaded script file was rejected.
    #[error("invalid upload: {0}")]
    InvalidUpload(String),

    /// An internal error (catch-all for unexpected failures).
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    /// Build a [`CoreError::ScriptNameNotFound`], suggesting the closest of
    /// `known_names` when one is within edit distance 3.
    pub fn script_name_not_found<'a>(
        name: &str,
        known_names: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        Self::ScriptNameNotFound {
            name: name.to_string(),
            suggestion: find_similar_name(name, known_names),
        }
    }

    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ScriptNotFound(_) | Self::ScriptNameNotFound { .. } => "SCRIPT_NOT_FOUND",
            Self::ExecutionNotFound(_) => "EXECUTION_NOT_FOUND",
            Self::ScheduleNotFound(_) => "SCHEDULE_NOT_FOUND",
            Self::DuplicateName(_) => "DUPLICATE_NAME",
            Self::InvalidUpload(_) => "INVALID_UPLOAD",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Whether this error means the addressed entity does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ScriptNotFound(_)
                | Self::ScriptNameNotFound { .. }
                | Self::ExecutionNotFound(_)
                | Self::ScheduleNotFound(_)
        )
    }

    /// The HTTP status an HTTP collaborator should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::ScriptNotFound(_)
            | Self::ScriptNameNotFound { .. }
            | Self::ExecutionNotFound(_)
            | Self::ScheduleNotFound(_) => 404,
            Self::DuplicateName(_) => 409,
            Self::InvalidUpload(_) => 400,
            Self::Internal(_) => 500,
        }
    }

    /// Convert to a structured JSON error body.
    ///
    /// Returns a JSON object with `error`, `code`, `message`, and optionally
    /// `suggested_fix`.
    pub fn to_structured_error(&self) -> serde_json::Value {
        let suggested_fix = match self {
            Self::ScriptNameNotFound {
                suggestion: Some(s),
                ..
            } => Some(format!("Did you mean '{s}'?")),
            Self::DuplicateName(_) => Some("Choose a different script name".to_string()),
            _ => None,
        };

        let mut obj = serde_json::json!({
            "error": true,
            "code": self.code(),
            "message": self.to_string(),
        });

        if let Some(fix) = suggested_fix {
            obj["suggested_fix"] = serde_json::Value::String(fix);
        }

        obj
    }
}

/// Find the closest matching name using Levenshtein distance.
fn find_similar_name<'a>(
    name: &str,
    known_names: impl IntoIterator<Item = &'a str>,
) -> Option<String> {
    let mut best: Option<(usize, &str)> = None;

    for candidate in known_names {
        let dist = strsim::levenshtein(name, candidate);
        if dist <= 3 && best.is_none_or(|(d, _)| dist < d) {
            best = Some((dist, candidate));
        }
    }

    best.map(|(_, s)| s.to_string())
}

// Compile-time assertion: CoreError must be Send + Sync + 'static
const _: fn() = || {
    fn assert_bounds<T: Send + Sync + 'static>() {}
    assert_bounds::<CoreError>();
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_script_not_found() {
        let err = CoreError::ScriptNotFound(7);
        assert_eq!(err.to_string(), "script not found: 7");
    }

    #[test]
    fn display_duplicate_name() {
        let err = CoreError::DuplicateName("hello.js".into());
        assert_eq!(
            err.to_string(),
            "script with name 'hello.js' already exists"
        );
    }

    #[test]
    fn display_internal() {
        let err = CoreError::Internal(anyhow::anyhow!("something broke"));
        assert_eq!(err.to_string(), "something broke");
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(CoreError::ScriptNotFound(1).http_status(), 404);
        assert_eq!(CoreError::ExecutionNotFound(1).http_status(), 404);
        assert_eq!(CoreError::ScheduleNotFound(1).http_status(), 404);
        assert_eq!(CoreError::DuplicateName("a".into()).http_status(), 409);
        assert_eq!(CoreError::InvalidUpload("a".into()).http_status(), 400);
        assert_eq!(
            CoreError::Internal(anyhow::anyhow!("x")).http_status(),
            500
        );
    }

    #[test]
    fn not_found_classification() {
        assert!(CoreError::ScriptNotFound(1).is_not_found());
        assert!(CoreError::script_name_not_found("x", []).is_not_found());
        assert!(!CoreError::DuplicateName("x".into()).is_not_found());
    }

    #[test]
    fn suggestion_picks_closest_name() {
        let err = CoreError::script_name_not_found("helo.js", ["hello.js", "world.js"]);
        match &err {
            CoreError::ScriptNameNotFound { suggestion, .. } => {
                assert_eq!(suggestion.as_deref(), Some("hello.js"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        let json = err.to_structured_error();
        assert_eq!(json["code"], "SCRIPT_NOT_FOUND");
        assert_eq!(json["suggested_fix"], "Did you mean 'hello.js'?");
    }

    #[test]
    fn suggestion_absent_when_nothing_close() {
        let err = CoreError::script_name_not_found("report.js", ["a.js"]);
        let json = err.to_structured_error();
        assert!(json.get("suggested_fix").is_none());
    }

    #[test]
    fn structured_error_has_required_fields() {
        let json = CoreError::ScriptNotFound(3).to_structured_error();
        assert_eq!(json["error"], true);
        assert_eq!(json["code"], "SCRIPT_NOT_FOUND");
        assert_eq!(json["message"], "script not found: 3");
    }
}

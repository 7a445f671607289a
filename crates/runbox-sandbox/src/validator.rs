//! Pre-execution checks for script source.
//!
//! The V8 isolate and the capability context are the security boundary.
//! These checks only reject input that should never reach the runtime.

use crate::error::SandboxError;

/// Default maximum script size in bytes (1 MiB, the upload limit).
pub const DEFAULT_MAX_CODE_SIZE: usize = 1024 * 1024;

/// Validates script source before sandbox execution.
///
/// Empty scripts are valid: they run and succeed with no output.
pub fn validate_code(code: &str, max_size: Option<usize>) -> Result<(), SandboxError> {
    let max = max_size.unwrap_or(DEFAULT_MAX_CODE_SIZE);

    if code.len() > max {
        return Err(SandboxError::CodeTooLarge {
            max,
            actual: code.len(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_script() {
        assert!(validate_code(r#"console.log("hi")"#, None).is_ok());
    }

    #[test]
    fn accepts_empty_script() {
        assert!(validate_code("", None).is_ok());
        assert!(validate_code("   \n", None).is_ok());
    }

    #[test]
    fn accepts_require_calls() {
        // Module access is decided at runtime by the capability context.
        assert!(validate_code(r#"const p = require("path");"#, None).is_ok());
    }

    #[test]
    fn rejects_oversized_code() {
        let big = "x".repeat(DEFAULT_MAX_CODE_SIZE + 1);
        let err = validate_code(&big, None).unwrap_err();
        assert!(matches!(err, SandboxError::CodeTooLarge { .. }));
    }

    #[test]
    fn custom_max_size() {
        let code = "x".repeat(100);
        assert!(validate_code(&code, Some(50)).is_err());
        assert!(validate_code(&code, Some(200)).is_ok());
    }
}

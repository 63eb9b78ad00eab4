//! Environment variable substitution for configuration text
//!
//! References use `${VAR_NAME}`, or `${VAR_NAME:-fallback}` to supply a
//! value when the variable is unset.

use std::env;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::config::ConfigError;

/// `${NAME}` or `${NAME:-default}`
static ENV_VAR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
        .expect("environment variable pattern is valid")
});

/// Substitute environment variable references in a string.
///
/// Returns an error listing every variable that is unset and has no
/// fallback.
///
/// ```
/// use mergefs::env::substitute_env_vars;
///
/// let out = substitute_env_vars("level: ${MERGEFS_DOC_UNSET_LEVEL:-info}").unwrap();
/// assert_eq!(out, "level: info");
/// ```
pub fn substitute_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut missing_vars: Vec<String> = Vec::new();

    let result = ENV_VAR_PATTERN.replace_all(input, |caps: &Captures<'_>| {
        let var_name = &caps[1];
        match (env::var(var_name), caps.get(2)) {
            (Ok(value), _) => value,
            (Err(_), Some(fallback)) => fallback.as_str().to_string(),
            (Err(_), None) => {
                if !missing_vars.iter().any(|v| v == var_name) {
                    missing_vars.push(var_name.to_string());
                }
                String::new()
            }
        }
    });

    if !missing_vars.is_empty() {
        return Err(ConfigError::ValidationError(format!(
            "Missing environment variables: {}",
            missing_vars.join(", ")
        )));
    }

    Ok(result.into_owned())
}

//! Substitution engine for `$(arg ...)`, `$(env ...)` and `${NAME}` patterns
//!
//! `$$` stands for a literal `$`, so shell commands can still use `$$(nproc)`
//! or `$${f}` and reach the shell as `$(nproc)` and `${f}`.

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::LazyLock;

/// Matches `$(type value)`, `$(type)`, `${NAME}`, `${NAME:-default}` and `$$`
static SUBSTITUTION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\((\w+)\s+([^)]+)\)|\$\((\w+)\)|\$\{(\w+)(?::-([^}]*))?\}|(\$\$)")
        .expect("substitution pattern is a valid regex")
});

/// Stands in for an escaped `$` until every pass is done, so the escape
/// never forms a new pattern with the text around it
const ESCAPED_DOLLAR: char = '\u{E000}';

/// Nested substitutions deeper than this are treated as a loop
const MAX_PASSES: usize = 10;

/// Variables available to manifest strings
#[derive(Debug, Clone, Default)]
pub struct SubstitutionContext {
    /// Manifest arguments (defaults merged with `-a key:=value` overrides)
    pub args: HashMap<String, String>,
    /// Values that shadow the supervisor's own environment
    pub env: HashMap<String, String>,
}

impl SubstitutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_arg(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(name.into(), value.into());
        self
    }

    pub fn with_args(mut self, args: HashMap<String, String>) -> Self {
        self.args.extend(args);
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    /// Substitute every pattern in `input`, following nested references
    pub fn substitute(&self, input: &str) -> Result<String, SubstitutionError> {
        let mut current = input.to_string();

        for _ in 0..MAX_PASSES {
            let next = self.substitute_once(&current)?;
            if next == current {
                return Ok(unescape(next));
            }
            current = next;
        }

        if SUBSTITUTION_PATTERN.is_match(&current) {
            return Err(SubstitutionError::MaxIterationsExceeded(input.to_string()));
        }
        Ok(unescape(current))
    }

    /// Substitute every string in a list
    pub fn substitute_all(&self, inputs: &[String]) -> Result<Vec<String>, SubstitutionError> {
        inputs.iter().map(|s| self.substitute(s)).collect()
    }

    fn substitute_once(&self, input: &str) -> Result<String, SubstitutionError> {
        let mut error: Option<SubstitutionError> = None;

        let result = SUBSTITUTION_PATTERN.replace_all(input, |caps: &Captures| {
            if error.is_some() {
                return String::new();
            }
            match self.resolve_capture(caps) {
                Ok(value) => value,
                Err(e) => {
                    error = Some(e);
                    String::new()
                }
            }
        });

        match error {
            Some(e) => Err(e),
            None => Ok(result.into_owned()),
        }
    }

    fn resolve_capture(&self, caps: &Captures) -> Result<String, SubstitutionError> {
        if caps.get(6).is_some() {
            return Ok(ESCAPED_DOLLAR.to_string());
        }

        // $(arg web_port)
        if let (Some(kind), Some(value)) = (caps.get(1), caps.get(2)) {
            return self.resolve_typed(kind.as_str(), value.as_str().trim());
        }

        // $(something) with no operand
        if let Some(kind) = caps.get(3) {
            return self.resolve_typed(kind.as_str(), "");
        }

        // ${NAME} / ${NAME:-default}
        if let Some(name) = caps.get(4) {
            return match (self.lookup_env(name.as_str()), caps.get(5)) {
                (Some(value), _) if !value.is_empty() => Ok(value),
                (_, Some(default)) => Ok(default.as_str().to_string()),
                (Some(value), None) => Ok(value),
                (None, None) => Err(SubstitutionError::UndefinedEnv(name.as_str().to_string())),
            };
        }

        Err(SubstitutionError::InvalidPattern(
            caps.get(0).map(|m| m.as_str().to_string()).unwrap_or_default(),
        ))
    }

    fn resolve_typed(&self, kind: &str, value: &str) -> Result<String, SubstitutionError> {
        match kind {
            "arg" => self
                .args
                .get(value)
                .cloned()
                .ok_or_else(|| SubstitutionError::UndefinedArg(value.to_string())),
            "env" => self
                .lookup_env(value)
                .ok_or_else(|| SubstitutionError::UndefinedEnv(value.to_string())),
            _ => Err(SubstitutionError::UnknownType(kind.to_string())),
        }
    }

    fn lookup_env(&self, name: &str) -> Option<String> {
        self.env
            .get(name)
            .cloned()
            .or_else(|| std::env::var(name).ok())
    }
}

fn unescape(value: String) -> String {
    if value.contains(ESCAPED_DOLLAR) {
        value.replace(ESCAPED_DOLLAR, "$")
    } else {
        value
    }
}

/// Errors that can occur during substitution
#[derive(Debug, thiserror::Error)]
pub enum SubstitutionError {
    #[error("Unknown substitution type: {0}")]
    UnknownType(String),

    #[error("Undefined argument: {0}")]
    UndefinedArg(String),

    #[error("Undefined environment variable: {0}")]
    UndefinedEnv(String),

    #[error("Invalid substitution pattern: {0}")]
    InvalidPattern(String),

    #[error("Maximum substitution iterations exceeded for: {0}")]
    MaxIterationsExceeded(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arg_substitution() {
        let ctx = SubstitutionContext::new().with_arg("web_port", "8000");
        assert_eq!(ctx.substitute("--port $(arg web_port)").unwrap(), "--port 8000");
    }

    #[test]
    fn test_env_substitution_prefers_overrides() {
        let ctx = SubstitutionContext::new().with_env("PATH", "/opt/stack/bin");
        assert_eq!(ctx.substitute("$(env PATH)").unwrap(), "/opt/stack/bin");
    }

    #[test]
    fn test_braced_env_with_default() {
        let ctx = SubstitutionContext::new().with_env("PGHOST", "db");

        assert_eq!(ctx.substitute("${PGHOST}:5432").unwrap(), "db:5432");
        assert_eq!(
            ctx.substitute("${STACKVISOR_TEST_UNSET_VAR:-localhost}").unwrap(),
            "localhost"
        );
    }

    #[test]
    fn test_braced_env_missing_without_default() {
        let ctx = SubstitutionContext::new();
        let result = ctx.substitute("${STACKVISOR_TEST_UNSET_VAR}");
        assert!(matches!(result, Err(SubstitutionError::UndefinedEnv(_))));
    }

    #[test]
    fn test_undefined_arg_error() {
        let ctx = SubstitutionContext::new();
        assert!(matches!(
            ctx.substitute("$(arg undefined)"),
            Err(SubstitutionError::UndefinedArg(_))
        ));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let ctx = SubstitutionContext::new();
        assert!(matches!(
            ctx.substitute("$(timestamp)"),
            Err(SubstitutionError::UnknownType(_))
        ));
    }

    #[test]
    fn test_nested_substitution() {
        let ctx = SubstitutionContext::new()
            .with_arg("outer", "$(arg inner)")
            .with_arg("inner", "resolved");
        assert_eq!(ctx.substitute("$(arg outer)").unwrap(), "resolved");
    }

    #[test]
    fn test_self_reference_is_reported() {
        let ctx = SubstitutionContext::new().with_arg("loop", "x$(arg loop)");
        assert!(matches!(
            ctx.substitute("$(arg loop)"),
            Err(SubstitutionError::MaxIterationsExceeded(_))
        ));
    }

    #[test]
    fn test_double_dollar_reaches_the_shell() {
        let ctx = SubstitutionContext::new();
        assert_eq!(
            ctx.substitute("gunicorn --workers $$(nproc)").unwrap(),
            "gunicorn --workers $(nproc)"
        );
        assert_eq!(
            ctx.substitute("for f in a b; do echo $${f}; done").unwrap(),
            "for f in a b; do echo ${f}; done"
        );
        assert_eq!(ctx.substitute("echo $$HOME").unwrap(), "echo $HOME");
    }

    #[test]
    fn test_escaped_dollar_is_not_substituted_again() {
        let ctx = SubstitutionContext::new()
            .with_arg("web_port", "8000")
            .with_arg("price", "$$(arg web_port)");

        assert_eq!(ctx.substitute("$$$(arg web_port)").unwrap(), "$8000");
        assert_eq!(ctx.substitute("$$(arg web_port)").unwrap(), "$(arg web_port)");
        assert_eq!(ctx.substitute("$(arg price)").unwrap(), "$(arg web_port)");
    }

    #[test]
    fn test_no_substitution_needed() {
        let ctx = SubstitutionContext::new();
        assert_eq!(ctx.substitute("plain string").unwrap(), "plain string");
    }
}

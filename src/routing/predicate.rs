//! Evaluation of routing filters and integration templates against alert
//! payloads.

use dashmap::DashMap;
use minijinja::{Environment, UndefinedBehavior, context};
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::models::RouteFilter;

/// Errors raised while compiling or evaluating a predicate.
#[derive(Debug, Error)]
pub enum PredicateError {
    /// The expression or template does not parse.
    #[error("Invalid expression '{expression}': {source}")]
    Compile {
        /// The offending expression.
        expression: String,
        /// Parser error.
        #[source]
        source: minijinja::Error,
    },

    /// The expression parsed but failed at evaluation time.
    #[error("Failed to evaluate '{expression}': {source}")]
    Evaluate {
        /// The offending expression.
        expression: String,
        /// Runtime error.
        #[source]
        source: minijinja::Error,
    },

    /// The regex does not compile.
    #[error("Invalid regex '{pattern}': {source}")]
    InvalidRegex {
        /// The offending pattern.
        pattern: String,
        /// Regex error.
        #[source]
        source: regex::Error,
    },

    /// The payload could not be serialized for regex matching.
    #[error("Failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Evaluates filter expressions, regex filters and grouping templates.
///
/// Expressions see the alert under `payload`. Missing fields are undefined
/// rather than errors, so `payload.labels.severity == "critical"` is simply
/// false for an alert without labels.
pub struct PredicateEvaluator {
    env: Environment<'static>,
    regex_cache: DashMap<String, Regex>,
}

impl Default for PredicateEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PredicateEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredicateEvaluator")
            .field("cached_regexes", &self.regex_cache.len())
            .finish()
    }
}

/// Compiled expressions borrow their source for the environment's lifetime,
/// so runtime expressions compile in an environment of their own.
fn environment<'source>() -> Environment<'source> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Chainable);
    env
}

/// Accepts both `payload.x == 1` and `{{ payload.x == 1 }}`.
fn strip_expression_delimiters(expression: &str) -> &str {
    let trimmed = expression.trim();
    trimmed
        .strip_prefix("{{")
        .and_then(|rest| rest.strip_suffix("}}"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

impl PredicateEvaluator {
    /// Creates an evaluator with chainable undefined values.
    pub fn new() -> Self {
        Self { env: environment(), regex_cache: DashMap::new() }
    }

    /// Checks that a filter compiles.
    pub fn validate_filter(&self, filter: &RouteFilter) -> Result<(), PredicateError> {
        match filter {
            RouteFilter::MatchAll => Ok(()),
            RouteFilter::Template(expression) => self.validate_expression(expression),
            RouteFilter::Regex(pattern) => self.regex(pattern).map(|_| ()),
        }
    }

    /// Checks that a boolean expression compiles.
    pub fn validate_expression(&self, expression: &str) -> Result<(), PredicateError> {
        let source = strip_expression_delimiters(expression);
        environment().compile_expression(source).map(|_| ()).map_err(|source| {
            PredicateError::Compile { expression: expression.to_string(), source }
        })
    }

    /// Checks that a template compiles.
    pub fn validate_template(&self, template: &str) -> Result<(), PredicateError> {
        environment().template_from_str(template).map(|_| ()).map_err(|source| {
            PredicateError::Compile { expression: template.to_string(), source }
        })
    }

    /// Whether `payload` satisfies `filter`.
    pub fn matches(&self, filter: &RouteFilter, payload: &Value) -> Result<bool, PredicateError> {
        match filter {
            RouteFilter::MatchAll => Ok(true),
            RouteFilter::Template(expression) => self.evaluate_expression(expression, payload),
            RouteFilter::Regex(pattern) => {
                let serialized = serde_json::to_string(payload)?;
                Ok(self.regex(pattern)?.is_match(&serialized))
            }
        }
    }

    /// Evaluates a boolean expression with Jinja truthiness.
    pub fn evaluate_expression(
        &self,
        expression: &str,
        payload: &Value,
    ) -> Result<bool, PredicateError> {
        let source = strip_expression_delimiters(expression);
        let env = environment();
        let compiled = env.compile_expression(source).map_err(|source| {
            PredicateError::Compile { expression: expression.to_string(), source }
        })?;
        let value = compiled.eval(context! { payload => payload }).map_err(|source| {
            PredicateError::Evaluate { expression: expression.to_string(), source }
        })?;
        Ok(value.is_true())
    }

    /// Renders a template against the payload.
    pub fn render(&self, template: &str, payload: &Value) -> Result<String, PredicateError> {
        self.env.render_str(template, context! { payload => payload }).map_err(|source| {
            PredicateError::Evaluate { expression: template.to_string(), source }
        })
    }

    fn regex(&self, pattern: &str) -> Result<Regex, PredicateError> {
        if let Some(cached) = self.regex_cache.get(pattern) {
            return Ok(cached.clone());
        }
        let compiled = Regex::new(pattern).map_err(|source| PredicateError::InvalidRegex {
            pattern: pattern.to_string(),
            source,
        })?;
        self.regex_cache.insert(pattern.to_string(), compiled.clone());
        Ok(compiled)
    }
}

//! Expression engines for interlock conditions.
//!
//! The watchdog talks to its expression through the small
//! [`ExpressionEngine`] capability (parse / bind / evaluate), so the control
//! loop does not depend on a particular grammar.
//!
//! - [`RhaiExpressionEngine`]: production engine backed by Rhai, with an
//!   operation limit to stop runaway expressions.
//! - [`ScriptedExpressionEngine`]: deterministic double returning queued
//!   results, for exercising control flow without a grammar.

use parking_lot::Mutex;
use regex::Regex;
use rhai::{Dynamic, Engine, EvalAltResult, Scope, AST};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;

use crate::points::position::Scalar;

/// Errors raised while parsing or evaluating an interlock expression.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("Cannot parse expression '{expression}': {message}")]
    Parse { expression: String, message: String },

    #[error("Cannot evaluate expression: {0}")]
    Evaluation(String),

    #[error("Expression produced {found}, expected a boolean")]
    NotBoolean { found: String },

    #[error("Variable '{0}' has no bound value")]
    UnboundVariable(String),

    #[error("No expression has been parsed")]
    NotParsed,
}

/// Parse / bind / evaluate capability used by the watchdog.
pub trait ExpressionEngine: Send {
    /// Compile the expression text, replacing any previous expression.
    fn parse(&mut self, expression: &str) -> Result<(), ExpressionError>;

    /// Free variable names of the parsed expression, in first-use order.
    fn variable_names(&self) -> Vec<String>;

    /// Set (or replace) the value of one variable.
    fn bind(&mut self, name: &str, value: &Scalar);

    /// Evaluate the parsed expression against the current bindings.
    fn evaluate(&mut self) -> Result<bool, ExpressionError>;
}

/// Factory handing out a fresh engine for every arming.
pub trait ExpressionService: Send + Sync {
    /// Create an engine with no expression and no bindings.
    fn create_engine(&self) -> Box<dyn ExpressionEngine>;
}

// =============================================================================
// Rhai
// =============================================================================

const KEYWORDS: &[&str] = &[
    "true", "false", "let", "const", "if", "else", "switch", "while", "loop", "for", "in", "do",
    "until", "return", "throw", "try", "catch", "fn", "private", "import", "export", "as", "this",
    "break", "continue", "global",
];

/// Rhai-backed expression engine.
///
/// Numbers are bound as floats and text as strings, so conditions such as
/// `beamcurrent >= 1.0 && portshutter != "Closed"` work directly.
pub struct RhaiExpressionEngine {
    engine: Engine,
    ast: Option<AST>,
    variables: Vec<String>,
    scope: Scope<'static>,
}

impl RhaiExpressionEngine {
    /// Engine with the default limit of 10,000 operations per evaluation.
    pub fn new() -> Self {
        Self::with_limit(10_000)
    }

    /// Engine with a custom operation limit per evaluation.
    pub fn with_limit(max_operations: u64) -> Self {
        let mut engine = Engine::new();

        engine.on_progress(move |count| {
            if count > max_operations {
                Some(
                    format!(
                        "Safety limit exceeded: maximum {} operations",
                        max_operations
                    )
                    .into(),
                )
            } else {
                None
            }
        });

        Self {
            engine,
            ast: None,
            variables: Vec::new(),
            scope: Scope::new(),
        }
    }
}

impl Default for RhaiExpressionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RhaiExpressionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RhaiExpressionEngine")
            .field("parsed", &self.ast.is_some())
            .field("variables", &self.variables)
            .finish()
    }
}

/// Free identifiers of an expression: not keywords, not function calls and
/// not property or method names after a `.`.
pub fn free_variables(expression: &str) -> Result<Vec<String>, ExpressionError> {
    let parse_error = |e: regex::Error| ExpressionError::Parse {
        expression: expression.to_string(),
        message: e.to_string(),
    };
    let literals = Regex::new(r#""(?:[^"\\]|\\.)*"|'(?:[^'\\]|\\.)*'|`[^`]*`"#)
        .map_err(parse_error)?;
    let identifier = Regex::new(r"\b[A-Za-z_][A-Za-z0-9_]*\b").map_err(parse_error)?;

    let text = literals.replace_all(expression, " ");
    let mut names: Vec<String> = Vec::new();
    for m in identifier.find_iter(&text) {
        let name = m.as_str();
        let after_dot = text[..m.start()].trim_end().ends_with('.');
        let is_call = text[m.end()..].trim_start().starts_with('(');
        if after_dot || is_call || KEYWORDS.contains(&name) {
            continue;
        }
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

fn to_dynamic(value: &Scalar) -> Dynamic {
    match value {
        Scalar::Number(v) => Dynamic::from(*v),
        Scalar::Text(s) => Dynamic::from(s.clone()),
    }
}

impl ExpressionEngine for RhaiExpressionEngine {
    fn parse(&mut self, expression: &str) -> Result<(), ExpressionError> {
        let ast = self
            .engine
            .compile_expression(expression)
            .map_err(|e| ExpressionError::Parse {
                expression: expression.to_string(),
                message: e.to_string(),
            })?;
        self.variables = free_variables(expression)?;
        self.ast = Some(ast);
        Ok(())
    }

    fn variable_names(&self) -> Vec<String> {
        self.variables.clone()
    }

    fn bind(&mut self, name: &str, value: &Scalar) {
        self.scope.set_or_push(name.to_string(), to_dynamic(value));
    }

    fn evaluate(&mut self) -> Result<bool, ExpressionError> {
        let ast = self.ast.as_ref().ok_or(ExpressionError::NotParsed)?;
        let result: Dynamic = self
            .engine
            .eval_ast_with_scope(&mut self.scope, ast)
            .map_err(|e| match *e {
                EvalAltResult::ErrorVariableNotFound(name, _) => {
                    ExpressionError::UnboundVariable(name)
                }
                other => ExpressionError::Evaluation(other.to_string()),
            })?;
        result.as_bool().map_err(|found| ExpressionError::NotBoolean {
            found: found.to_string(),
        })
    }
}

/// Hands out [`RhaiExpressionEngine`]s.
#[derive(Debug, Clone)]
pub struct RhaiExpressionService {
    max_operations: u64,
}

impl RhaiExpressionService {
    /// Service whose engines stop after `max_operations` per evaluation.
    pub fn with_limit(max_operations: u64) -> Self {
        Self { max_operations }
    }
}

impl Default for RhaiExpressionService {
    fn default() -> Self {
        Self::with_limit(10_000)
    }
}

impl ExpressionService for RhaiExpressionService {
    fn create_engine(&self) -> Box<dyn ExpressionEngine> {
        Box::new(RhaiExpressionEngine::with_limit(self.max_operations))
    }
}

// =============================================================================
// Scripted double
// =============================================================================

#[derive(Debug, Default)]
struct Script {
    variables: Vec<String>,
    results: VecDeque<Result<bool, ExpressionError>>,
    default: bool,
    parse_error: Option<String>,
    parsed: Option<String>,
    bindings: Vec<(String, Scalar)>,
    evaluations: usize,
}

/// Expression engine returning scripted results.
///
/// Clones share the same script, so a test can keep one handle while the
/// watchdog owns another. Queued results are returned first; after that
/// every evaluation returns the default.
#[derive(Debug, Clone, Default)]
pub struct ScriptedExpressionEngine {
    script: Arc<Mutex<Script>>,
}

impl ScriptedExpressionEngine {
    /// Engine reporting `variables` as the expression's free variables and
    /// evaluating to `true` unless told otherwise.
    pub fn new(variables: &[&str]) -> Self {
        let engine = Self::default();
        {
            let mut script = engine.script.lock();
            script.variables = variables.iter().map(|v| v.to_string()).collect();
            script.default = true;
        }
        engine
    }

    /// Queue the result of a future evaluation.
    pub fn push_result(&self, result: Result<bool, ExpressionError>) {
        self.script.lock().results.push_back(result);
    }

    /// Result used once the queue is empty.
    pub fn set_default(&self, value: bool) {
        self.script.lock().default = value;
    }

    /// Make the next `parse` fail with this message.
    pub fn fail_parse(&self, message: impl Into<String>) {
        self.script.lock().parse_error = Some(message.into());
    }

    /// Every `bind` call so far, in order.
    pub fn bindings(&self) -> Vec<(String, Scalar)> {
        self.script.lock().bindings.clone()
    }

    /// Number of `evaluate` calls so far.
    pub fn evaluations(&self) -> usize {
        self.script.lock().evaluations
    }

    /// The last successfully parsed expression.
    pub fn parsed(&self) -> Option<String> {
        self.script.lock().parsed.clone()
    }
}

impl ExpressionEngine for ScriptedExpressionEngine {
    fn parse(&mut self, expression: &str) -> Result<(), ExpressionError> {
        let mut script = self.script.lock();
        if let Some(message) = script.parse_error.take() {
            return Err(ExpressionError::Parse {
                expression: expression.to_string(),
                message,
            });
        }
        script.parsed = Some(expression.to_string());
        Ok(())
    }

    fn variable_names(&self) -> Vec<String> {
        self.script.lock().variables.clone()
    }

    fn bind(&mut self, name: &str, value: &Scalar) {
        self.script
            .lock()
            .bindings
            .push((name.to_string(), value.clone()));
    }

    fn evaluate(&mut self) -> Result<bool, ExpressionError> {
        let mut script = self.script.lock();
        if script.parsed.is_none() {
            return Err(ExpressionError::NotParsed);
        }
        script.evaluations += 1;
        let default = script.default;
        script.results.pop_front().unwrap_or(Ok(default))
    }
}

impl ExpressionService for ScriptedExpressionEngine {
    fn create_engine(&self) -> Box<dyn ExpressionEngine> {
        Box::new(self.clone())
    }
}

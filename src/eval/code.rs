//! The restricted imperative code form of a model function.
//!
//! Compilation lexes and parses the block under the restricted grammar,
//! rejects anything outside the sandbox, and statically verifies that the
//! result variable is assigned somewhere in module scope. Execution seeds a
//! scope with the curated numerical builtins and the scenario bindings, runs
//! the block, and extracts a finite scalar result.

mod ast;
mod builtins;
mod interp;
mod lexer;
mod parser;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::error::EvalError;

use self::ast::Stmt;
use self::interp::{Env, Interp, Value};

/// A compiled, validated code block. Cheap to clone and shared across
/// evaluations.
#[derive(Debug, Clone)]
pub struct CodeProgram {
    body: Arc<Vec<Stmt>>,
    result_name: String,
}

impl CodeProgram {
    pub fn compile(source: &str, result_name: &str) -> Result<Self, EvalError> {
        let tokens = lexer::lex(source)?;
        let body = parser::parse_module(tokens)?;
        if !assigns_in_module_scope(&body, result_name) {
            return Err(EvalError::ResultMissing(result_name.to_string()));
        }
        Ok(Self {
            body: Arc::new(body),
            result_name: result_name.to_string(),
        })
    }

    /// Runs the block against the scenario bindings. The deadline is a hard
    /// stop checked at loop and call boundaries.
    pub fn run(
        &self,
        bindings: &HashMap<String, f64>,
        deadline: Option<Instant>,
    ) -> Result<f64, EvalError> {
        let mut globals: HashMap<String, Value> = builtins::seed_scope().into_iter().collect();
        for (name, value) in bindings {
            globals.insert(name.clone(), Value::Float(*value));
        }

        let mut env = Env::new(globals);
        Interp::new(deadline).run(&self.body, &mut env)?;

        let result = env
            .global(&self.result_name)
            .ok_or_else(|| EvalError::ResultMissing(self.result_name.clone()))?;
        let value = match result {
            Value::Bool(b) => f64::from(*b as u8),
            Value::Int(i) => *i as f64,
            Value::Float(f) => *f,
            other => {
                return Err(EvalError::ResultType(format!(
                    "expected a number, got {}",
                    other.type_name()
                )));
            }
        };
        if !value.is_finite() {
            return Err(EvalError::ResultType(format!("non-finite value {value}")));
        }
        Ok(value)
    }
}

/// Static check: the result variable must be the target of at least one
/// assignment reachable in module scope. Function bodies assign locals, so
/// they do not count.
fn assigns_in_module_scope(stmts: &[Stmt], name: &str) -> bool {
    stmts.iter().any(|stmt| match stmt {
        Stmt::Assign { target, .. } | Stmt::AugAssign { target, .. } => target.assigns(name),
        Stmt::For { target, body, .. } => {
            target.assigns(name) || assigns_in_module_scope(body, name)
        }
        Stmt::If { branches, orelse } => {
            branches
                .iter()
                .any(|(_, body)| assigns_in_module_scope(body, name))
                || assigns_in_module_scope(orelse, name)
        }
        Stmt::While { body, .. } => assigns_in_module_scope(body, name),
        _ => false,
    })
}

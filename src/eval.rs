//! Safe evaluation of model functions.
//!
//! A [`CompiledFunction`] is built once per worker process and evaluated for
//! every scenario. Evaluation is bounded by a wall-clock timeout: the work
//! runs on a blocking task carrying a deadline, and the caller waits at most
//! the timeout before returning [`EvalError::Timeout`]. Cancellation is
//! best-effort — the abandoned task notices the expired deadline at its next
//! loop or call boundary and stops on its own, but the caller never waits
//! for it.

pub mod code;
pub mod expr;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::EvalError;
use crate::model::{FunctionSpec, RESULT_VARIABLE};

pub use self::code::CodeProgram;
pub use self::expr::ExprProgram;

/// A validated model function, polymorphic over the two function forms.
#[derive(Debug, Clone)]
pub enum CompiledFunction {
    Expression(ExprProgram),
    Code(CodeProgram),
}

impl CompiledFunction {
    /// Compiles and validates a function spec. Disallowed constructs are
    /// rejected here; evaluation never sees them.
    pub fn compile(spec: &FunctionSpec) -> Result<Self, EvalError> {
        match spec {
            FunctionSpec::Expression { text } => {
                Ok(Self::Expression(ExprProgram::compile(text)?))
            }
            FunctionSpec::Code { text } => {
                Ok(Self::Code(CodeProgram::compile(text, RESULT_VARIABLE)?))
            }
        }
    }

    /// Synchronous evaluation against a deadline. Used by the async harness
    /// and directly by tests.
    pub fn evaluate_blocking(
        &self,
        bindings: &HashMap<String, f64>,
        deadline: Option<Instant>,
    ) -> Result<f64, EvalError> {
        match self {
            Self::Expression(program) => program.eval(bindings),
            Self::Code(program) => program.run(bindings, deadline),
        }
    }

    /// Evaluates with a hard wall-clock bound. The caller gets an answer —
    /// value or error — within `timeout` plus scheduling noise.
    pub async fn evaluate(
        &self,
        bindings: &HashMap<String, f64>,
        timeout: Duration,
    ) -> Result<f64, EvalError> {
        let program = self.clone();
        let bindings = bindings.clone();
        let deadline = Instant::now() + timeout;

        let handle =
            tokio::task::spawn_blocking(move || program.evaluate_blocking(&bindings, Some(deadline)));

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(result)) => result.map_err(|e| match e {
                // The interpreter reports deadline expiry without knowing the
                // configured timeout; stamp it here.
                EvalError::Timeout(_) => EvalError::Timeout(timeout),
                other => other,
            }),
            Ok(Err(join_error)) => Err(EvalError::Evaluation(format!(
                "evaluation task failed: {join_error}"
            ))),
            Err(_) => Err(EvalError::Timeout(timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FunctionSpec;

    fn bindings(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn compile_selects_the_right_variant() {
        let expr = CompiledFunction::compile(&FunctionSpec::Expression {
            text: "x + y".into(),
        })
        .unwrap();
        assert!(matches!(expr, CompiledFunction::Expression(_)));

        let code = CompiledFunction::compile(&FunctionSpec::Code {
            text: "resultado = x + y\n".into(),
        })
        .unwrap();
        assert!(matches!(code, CompiledFunction::Code(_)));
    }

    #[tokio::test]
    async fn both_forms_agree_on_simple_arithmetic() {
        let binding = bindings(&[("x", 3.0), ("y", 4.0)]);
        let timeout = Duration::from_secs(5);

        let expr = CompiledFunction::compile(&FunctionSpec::Expression {
            text: "sqrt(x ** 2 + y ** 2)".into(),
        })
        .unwrap();
        let code = CompiledFunction::compile(&FunctionSpec::Code {
            text: "import math\nresultado = math.sqrt(x ** 2 + y ** 2)\n".into(),
        })
        .unwrap();

        assert_eq!(expr.evaluate(&binding, timeout).await.unwrap(), 5.0);
        assert_eq!(code.evaluate(&binding, timeout).await.unwrap(), 5.0);
    }

    #[tokio::test]
    async fn infinite_loop_times_out_within_budget() {
        let code = CompiledFunction::compile(&FunctionSpec::Code {
            text: "while True: pass\nresultado = 1\n".into(),
        })
        .unwrap();

        let started = Instant::now();
        let err = code
            .evaluate(&HashMap::new(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, EvalError::Timeout(_)));
        // The caller must not wait meaningfully past the timeout.
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn evaluation_errors_pass_through() {
        let expr = CompiledFunction::compile(&FunctionSpec::Expression {
            text: "1 / x".into(),
        })
        .unwrap();
        let err = expr
            .evaluate(&bindings(&[("x", 0.0)]), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, EvalError::Evaluation(_)));
    }

    #[test]
    fn compile_failures_never_execute() {
        let err = CompiledFunction::compile(&FunctionSpec::Code {
            text: "import os\nresultado = 1\n".into(),
        })
        .unwrap_err();
        assert!(matches!(err, EvalError::Security(_)));
    }
}

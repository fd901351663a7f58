use std::time::Duration;

use indicatif::style::TemplateError;
use thiserror::Error;

pub type MontebusResult<T> = Result<T, MontebusError>;

#[derive(Debug, Error)]
pub enum MontebusError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    System(#[from] SystemError),
}

impl MontebusError {
    /// Process exit code for producer and consumer binaries wrapping this
    /// library: 1 configuration or model-parse error, 2 broker unreachable,
    /// 3 model unavailable on the consumer side, 4 internal invariant
    /// violation.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Parse(_) => 1,
            Self::Broker(BrokerError::ModelUnavailable(_)) => 3,
            Self::Broker(_) => 2,
            Self::Eval(_) | Self::System(_) => 4,
        }
    }
}

/// Errors raised while assembling runtime configuration or validating
/// distribution parameters.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {msg}")]
    InvalidEnv { key: String, msg: String },

    #[error("Missing parameter '{param}' for distribution '{distribution}'")]
    MissingParam {
        distribution: String,
        param: String,
    },

    #[error("Invalid parameters for distribution '{distribution}': {msg}")]
    InvalidDistribution { distribution: String, msg: String },

    #[error("Progress bar error")]
    ProgressBar(#[from] TemplateError),
}

/// Errors raised while parsing or validating a declarative model file.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Syntax error in [{section}] line {line}: {msg}")]
    Syntax {
        section: String,
        line: usize,
        msg: String,
    },

    #[error("Missing section [{0}]")]
    MissingSection(String),

    #[error("Missing key '{key}' in section [{section}]")]
    MissingKey { section: String, key: String },

    #[error("Duplicate variable name '{0}'")]
    DuplicateVariable(String),

    #[error("Validation error at line {line}: {msg}")]
    Validation { line: usize, msg: String },

    #[error("Failed to decode model payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Errors produced by the safe evaluator, either while compiling a model
/// function or while executing it against a scenario binding.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("Evaluation exceeded the {}s timeout", .0.as_secs())]
    Timeout(Duration),

    #[error("Forbidden construct: {0}")]
    Security(String),

    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    #[error("Result variable '{0}' was never assigned")]
    ResultMissing(String),

    #[error("Result is not a finite number: {0}")]
    ResultType(String),
}

impl EvalError {
    /// Stable label used as the `errors_by_kind` key in consumer telemetry
    /// and as the `x-last-error` prefix on dead-lettered envelopes.
    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Security(_) => "security",
            Self::Evaluation(_) => "evaluation",
            Self::ResultMissing(_) => "result_missing",
            Self::ResultType(_) => "result_type",
        }
    }

    /// Only plain evaluation failures (overflow, bad operand types on valid
    /// code) are worth redelivering. Timeouts, security rejections and
    /// result-shape errors are deterministic for a given scenario.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Evaluation(_))
    }
}

/// Errors related to broker connectivity, queue operations and the
/// connection pool.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Broker unreachable after {attempts} attempts: {last}")]
    Unreachable { attempts: u32, last: String },

    #[error("Connection failure: {0}")]
    Connection(String),

    #[error("Publish to '{queue}' failed: {msg}")]
    Publish { queue: String, msg: String },

    #[error("Consume from '{queue}' failed: {msg}")]
    Consume { queue: String, msg: String },

    #[error("Acknowledgement failed: {0}")]
    Ack(String),

    #[error("Connection pool exhausted after {}s", .0.as_secs())]
    PoolExhausted(Duration),

    #[error("No model available on '{0}'")]
    ModelUnavailable(String),

    #[error("Unknown queue '{0}'")]
    UnknownQueue(String),
}

/// Errors related to internal invariants and task plumbing.
#[derive(Debug, Error)]
pub enum SystemError {
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Background task failed: {0}")]
    TaskJoin(String),

    #[error("Serialization failed")]
    Json(#[from] serde_json::Error),

    #[error("IO operation failed")]
    Io(#[from] std::io::Error),
}

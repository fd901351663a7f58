// === Public Modules (The Canonical Paths) ===
pub mod aggregator;
pub mod broker;
pub mod config;
pub mod consumer;
pub mod distribution;
pub mod error;
pub mod eval;
pub mod message;
pub mod model;
pub mod producer;

// === Facades (Re-exporting internals) ===
pub use crate::broker::{Broker, Queue};
pub use crate::consumer::ConsumerWorker;
pub use crate::error::{MontebusError, MontebusResult};
pub use crate::eval::CompiledFunction;
pub use crate::model::parser::parse_model;

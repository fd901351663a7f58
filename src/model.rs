//! The declarative simulation model and its broker wire shape.
//!
//! A [`Model`] is immutable once parsed: metadata, an ordered list of random
//! variables, one scalar function (expression or code form) and the
//! simulation parameters. Publishing stamps it into a [`PublishedModel`]
//! with a globally identifying `modelID`.

pub mod parser;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

/// Supported probability distributions for model variables.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DistributionKind {
    Normal,
    Uniform,
    Exponential,
    Lognormal,
    Triangular,
    Binomial,
}

impl DistributionKind {
    /// The kind of value a draw from this distribution naturally produces.
    pub fn natural_kind(&self) -> VariableKind {
        match self {
            Self::Binomial => VariableKind::Int,
            _ => VariableKind::Float,
        }
    }

    /// Required parameter names, in declaration order.
    pub fn required_params(&self) -> &'static [&'static str] {
        match self {
            Self::Normal => &["media", "std"],
            Self::Uniform => &["min", "max"],
            Self::Exponential => &["lambda"],
            Self::Lognormal => &["mu", "sigma"],
            Self::Triangular => &["left", "mode", "right"],
            Self::Binomial => &["n", "p"],
        }
    }
}

/// Numeric kind of a model variable.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum VariableKind {
    Int,
    Float,
}

/// One random input variable of the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSpec {
    #[serde(rename = "nombre")]
    pub name: String,
    #[serde(rename = "tipo")]
    pub kind: VariableKind,
    #[serde(rename = "distribucion")]
    pub distribution: DistributionKind,
    #[serde(rename = "parametros")]
    pub params: BTreeMap<String, f64>,
}

/// The scalar model function in one of its two validated forms.
///
/// The code form's distinguished result variable is always `resultado`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tipo", rename_all = "lowercase")]
pub enum FunctionSpec {
    Expression {
        #[serde(rename = "expression")]
        text: String,
    },
    Code {
        #[serde(rename = "codigo")]
        text: String,
    },
}

impl FunctionSpec {
    pub fn text(&self) -> &str {
        match self {
            Self::Expression { text } | Self::Code { text } => text,
        }
    }
}

/// Name of the variable a code-form function must assign its result to.
pub const RESULT_VARIABLE: &str = "resultado";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationSpec {
    #[serde(rename = "numero_escenarios")]
    pub num_scenarios: u64,
    #[serde(rename = "semilla_aleatoria", skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    #[serde(rename = "creationDate")]
    pub creation_date: String,
}

/// A parsed, validated model. Immutable by convention: nothing in the crate
/// mutates a model after the parser returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub metadata: ModelMetadata,
    pub variables: Vec<VariableSpec>,
    #[serde(rename = "funcion")]
    pub function: FunctionSpec,
    #[serde(rename = "simulacion")]
    pub simulation: SimulationSpec,
}

impl Model {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn num_scenarios(&self) -> u64 {
        self.simulation.num_scenarios
    }
}

/// Wire shape of a model resident on `cola_modelo`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedModel {
    #[serde(rename = "modelID")]
    pub model_id: String,
    pub version: String,
    #[serde(rename = "publishedAtUnixSec")]
    pub published_at_unix_sec: f64,
    pub metadata: ModelMetadata,
    pub variables: Vec<VariableSpec>,
    #[serde(rename = "funcion")]
    pub function: FunctionSpec,
    #[serde(rename = "simulacion")]
    pub simulation: SimulationSpec,
}

impl PublishedModel {
    /// Stamps a model for publication. The `modelID` is
    /// `name + "_" + publishEpochSeconds`, identifying the active model
    /// version across all consumers.
    pub fn stamp(model: Model, published_at_unix_sec: f64) -> Self {
        let model_id = format!(
            "{}_{}",
            model.metadata.name, published_at_unix_sec as i64
        );
        Self {
            model_id,
            version: model.metadata.version.clone(),
            published_at_unix_sec,
            metadata: model.metadata,
            variables: model.variables,
            function: model.function,
            simulation: model.simulation,
        }
    }

    /// Strips the publication stamp, recovering the plain model.
    pub fn into_model(self) -> Model {
        Model {
            metadata: self.metadata,
            variables: self.variables,
            function: self.function,
            simulation: self.simulation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_model() -> Model {
        Model {
            metadata: ModelMetadata {
                name: "sum_normal".into(),
                version: "1.0".into(),
                description: "Sum of two standard normals".into(),
                author: "qa".into(),
                creation_date: "2025-11-02".into(),
            },
            variables: vec![VariableSpec {
                name: "x".into(),
                kind: VariableKind::Float,
                distribution: DistributionKind::Normal,
                params: BTreeMap::from([("media".into(), 0.0), ("std".into(), 1.0)]),
            }],
            function: FunctionSpec::Expression {
                text: "x + 1".into(),
            },
            simulation: SimulationSpec {
                num_scenarios: 100,
                seed: Some(42),
            },
        }
    }

    #[test]
    fn model_id_embeds_name_and_epoch() {
        let published = PublishedModel::stamp(sample_model(), 1_762_000_000.25);
        assert_eq!(published.model_id, "sum_normal_1762000000");
        assert_eq!(published.published_at_unix_sec, 1_762_000_000.25);
    }

    #[test]
    fn published_model_round_trips_through_json() {
        let published = PublishedModel::stamp(sample_model(), 1_762_000_000.0);
        let json = serde_json::to_string(&published).unwrap();
        assert!(json.contains("\"modelID\":\"sum_normal_1762000000\""));
        assert!(json.contains("\"tipo\":\"expression\""));
        assert!(json.contains("\"numero_escenarios\":100"));

        let back: PublishedModel = serde_json::from_str(&json).unwrap();
        assert_eq!(back, published);
        assert_eq!(back.into_model(), sample_model());
    }

    #[test]
    fn code_function_serializes_with_codigo_key() {
        let function = FunctionSpec::Code {
            text: "resultado = 1".into(),
        };
        let json = serde_json::to_string(&function).unwrap();
        assert_eq!(json, r#"{"tipo":"code","codigo":"resultado = 1"}"#);
    }

    #[test]
    fn seed_is_omitted_when_absent() {
        let sim = SimulationSpec {
            num_scenarios: 5,
            seed: None,
        };
        assert_eq!(
            serde_json::to_string(&sim).unwrap(),
            r#"{"numero_escenarios":5}"#
        );
    }

    #[test]
    fn binomial_is_the_only_integer_distribution() {
        use strum::IntoEnumIterator;
        for kind in DistributionKind::iter() {
            let expected = if kind == DistributionKind::Binomial {
                VariableKind::Int
            } else {
                VariableKind::Float
            };
            assert_eq!(kind.natural_kind(), expected);
        }
    }
}

//! Job type definitions and parameter binding
//!
//! Job types form a registry keyed by type name; selection is a table
//! lookup, never a type switch. Each type declares its parameter schema,
//! whether instances may overlap, and the handler that runs them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::docker::CallError;

use super::context::JobContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterKind {
    String,
    Bool,
    Int,
    Float,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobParameterDef {
    pub name: String,
    pub kind: ParameterKind,
    pub required: bool,
}

impl JobParameterDef {
    pub fn required(name: impl Into<String>, kind: ParameterKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, kind: ParameterKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSchema {
    pub parameters: Vec<JobParameterDef>,
}

impl JobSchema {
    pub fn new(parameters: Vec<JobParameterDef>) -> Self {
        Self { parameters }
    }

    /// Check required bindings and convertibility. Runs right before the
    /// instance starts; a violation fails the instance.
    pub fn validate(&self, parameters: &JobParameters) -> Result<(), String> {
        for def in &self.parameters {
            let present = parameters.contains(&def.name);
            if def.required && !present {
                return Err(format!("required parameter {} is missing", def.name));
            }
            if !present {
                continue;
            }
            let ok = match def.kind {
                ParameterKind::String => parameters.get_str(&def.name).is_ok(),
                ParameterKind::Bool => parameters.get_bool(&def.name).is_ok(),
                ParameterKind::Int => parameters.get_i64(&def.name).is_ok(),
                ParameterKind::Float => parameters.get_f64(&def.name).is_ok(),
            };
            if !ok {
                return Err(format!(
                    "parameter {} is not a valid {:?}",
                    def.name, def.kind
                ));
            }
        }
        Ok(())
    }
}

/// Whether a non-repeatable type is gated fleet-wide or per cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobScope {
    Unrestricted,
    /// Singleton within the cluster named by the `cluster` parameter.
    Cluster,
}

/// Bound job parameters. Values arrive as JSON; typed getters convert,
/// accepting the native JSON type or its string rendition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobParameters(pub HashMap<String, serde_json::Value>);

impl JobParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn get_str(&self, name: &str) -> Result<Option<String>, String> {
        match self.0.get(name) {
            None => Ok(None),
            Some(serde_json::Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => Err(format!("parameter {} is not a string: {}", name, other)),
        }
    }

    pub fn get_bool(&self, name: &str) -> Result<Option<bool>, String> {
        match self.0.get(name) {
            None => Ok(None),
            Some(serde_json::Value::Bool(b)) => Ok(Some(*b)),
            Some(serde_json::Value::String(s)) => s
                .parse::<bool>()
                .map(Some)
                .map_err(|_| format!("parameter {} is not a bool: {}", name, s)),
            Some(other) => Err(format!("parameter {} is not a bool: {}", name, other)),
        }
    }

    pub fn get_i64(&self, name: &str) -> Result<Option<i64>, String> {
        match self.0.get(name) {
            None => Ok(None),
            Some(serde_json::Value::Number(n)) => n
                .as_i64()
                .map(Some)
                .ok_or_else(|| format!("parameter {} is not an integer: {}", name, n)),
            Some(serde_json::Value::String(s)) => s
                .parse::<i64>()
                .map(Some)
                .map_err(|_| format!("parameter {} is not an integer: {}", name, s)),
            Some(other) => Err(format!("parameter {} is not an integer: {}", name, other)),
        }
    }

    pub fn get_f64(&self, name: &str) -> Result<Option<f64>, String> {
        match self.0.get(name) {
            None => Ok(None),
            Some(serde_json::Value::Number(n)) => Ok(n.as_f64()),
            Some(serde_json::Value::String(s)) => s
                .parse::<f64>()
                .map(Some)
                .map_err(|_| format!("parameter {} is not a number: {}", name, s)),
            Some(other) => Err(format!("parameter {} is not a number: {}", name, other)),
        }
    }
}

/// Why a job (or one of its tasklets) stopped short of completion.
#[derive(Debug, Clone, Error)]
pub enum JobError {
    #[error("{0}")]
    Failed(String),

    #[error("cancelled")]
    Cancelled,
}

impl From<CallError> for JobError {
    fn from(e: CallError) -> Self {
        JobError::Failed(e.to_string())
    }
}

pub type JobOutcome = Result<(), JobError>;

/// The work a job type performs. Handlers report progress through the
/// context and cooperate with its cancellation token.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, ctx: &JobContext) -> JobOutcome;
}

/// A registered job type.
pub struct JobType {
    pub name: String,
    pub schema: JobSchema,
    pub repeatable: bool,
    pub scope: JobScope,
    pub handler: Arc<dyn JobHandler>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> JobSchema {
        JobSchema::new(vec![
            JobParameterDef::required("cluster", ParameterKind::String),
            JobParameterDef::optional("time_before_kill", ParameterKind::Int),
            JobParameterDef::optional("health_check_enabled", ParameterKind::Bool),
        ])
    }

    #[test]
    fn test_required_parameter_missing() {
        let err = schema().validate(&JobParameters::new()).unwrap_err();
        assert!(err.contains("cluster"));
    }

    #[test]
    fn test_conversion_from_strings() {
        let params = JobParameters::new()
            .with("cluster", "edge")
            .with("time_before_kill", "15")
            .with("health_check_enabled", "true");
        schema().validate(&params).unwrap();
        assert_eq!(params.get_i64("time_before_kill").unwrap(), Some(15));
        assert_eq!(params.get_bool("health_check_enabled").unwrap(), Some(true));
    }

    #[test]
    fn test_conversion_failure_is_fatal() {
        let params = JobParameters::new()
            .with("cluster", "edge")
            .with("time_before_kill", "soon");
        assert!(schema().validate(&params).is_err());
    }

    #[test]
    fn test_unknown_parameters_pass_through() {
        let params = JobParameters::new()
            .with("cluster", "edge")
            .with("percentage", 50.0);
        schema().validate(&params).unwrap();
        assert_eq!(params.get_f64("percentage").unwrap(), Some(50.0));
    }
}

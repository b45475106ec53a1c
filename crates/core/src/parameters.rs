//! Job parameters and the identity key derived from them.
//!
//! Parameters are typed and flagged *identifying* or *non-identifying*. Only
//! identifying parameters contribute to the [`JobKey`], so two launches that
//! differ only in non-identifying values address the same job instance.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{DomainError, DomainResult};

/// A typed parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterValue {
    String(String),
    Long(i64),
    Double(f64),
    Date(DateTime<Utc>),
    Bool(bool),
}

impl ParameterValue {
    fn type_name(&self) -> &'static str {
        match self {
            ParameterValue::String(_) => "string",
            ParameterValue::Long(_) => "long",
            ParameterValue::Double(_) => "double",
            ParameterValue::Date(_) => "date",
            ParameterValue::Bool(_) => "bool",
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::String(v) => f.write_str(v),
            ParameterValue::Long(v) => write!(f, "{v}"),
            ParameterValue::Double(v) => write!(f, "{v}"),
            ParameterValue::Date(v) => f.write_str(&v.to_rfc3339()),
            ParameterValue::Bool(v) => write!(f, "{v}"),
        }
    }
}

/// A single job parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParameter {
    pub value: ParameterValue,
    pub identifying: bool,
}

/// Immutable, ordered set of job parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobParameters {
    parameters: BTreeMap<String, JobParameter>,
}

impl JobParameters {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builder() -> JobParametersBuilder {
        JobParametersBuilder::default()
    }

    pub fn get(&self, key: &str) -> Option<&JobParameter> {
        self.parameters.get(key)
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.get(key).map(|p| &p.value) {
            Some(ParameterValue::String(v)) => Some(v),
            _ => None,
        }
    }

    pub fn get_long(&self, key: &str) -> Option<i64> {
        match self.get(key).map(|p| &p.value) {
            Some(ParameterValue::Long(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_double(&self, key: &str) -> Option<f64> {
        match self.get(key).map(|p| &p.value) {
            Some(ParameterValue::Double(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_date(&self, key: &str) -> Option<DateTime<Utc>> {
        match self.get(key).map(|p| &p.value) {
            Some(ParameterValue::Date(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key).map(|p| &p.value) {
            Some(ParameterValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &JobParameter)> {
        self.parameters.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Identifying parameters in key order.
    pub fn identifying(&self) -> impl Iterator<Item = (&str, &JobParameter)> {
        self.iter().filter(|(_, p)| p.identifying)
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }
}

/// Builder for [`JobParameters`].
#[derive(Debug, Clone, Default)]
pub struct JobParametersBuilder {
    parameters: BTreeMap<String, JobParameter>,
    errors: Vec<String>,
}

impl JobParametersBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter, replacing any previous value for the key.
    pub fn parameter(
        mut self,
        key: impl Into<String>,
        value: ParameterValue,
        identifying: bool,
    ) -> Self {
        let key = key.into();
        if key.trim().is_empty() {
            self.errors.push("parameter key must not be blank".to_string());
            return self;
        }
        self.parameters
            .insert(key, JobParameter { value, identifying });
        self
    }

    pub fn string(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameter(key, ParameterValue::String(value.into()), true)
    }

    pub fn long(self, key: impl Into<String>, value: i64) -> Self {
        self.parameter(key, ParameterValue::Long(value), true)
    }

    pub fn double(self, key: impl Into<String>, value: f64) -> Self {
        self.parameter(key, ParameterValue::Double(value), true)
    }

    pub fn date(self, key: impl Into<String>, value: DateTime<Utc>) -> Self {
        self.parameter(key, ParameterValue::Date(value), true)
    }

    pub fn bool(self, key: impl Into<String>, value: bool) -> Self {
        self.parameter(key, ParameterValue::Bool(value), true)
    }

    /// Add a parameter that does not take part in instance identity.
    pub fn non_identifying(self, key: impl Into<String>, value: ParameterValue) -> Self {
        self.parameter(key, value, false)
    }

    pub fn build(self) -> DomainResult<JobParameters> {
        if let Some(first) = self.errors.into_iter().next() {
            return Err(DomainError::validation(first));
        }
        Ok(JobParameters {
            parameters: self.parameters,
        })
    }
}

/// Deterministic identity digest of a job name plus its identifying parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobKey(String);

impl JobKey {
    /// SHA-256 over `name` followed by `key=type:value;` for each identifying
    /// parameter in key order.
    pub fn generate(job_name: &str, parameters: &JobParameters) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(job_name.as_bytes());
        hasher.update(b"\n");
        for (key, parameter) in parameters.identifying() {
            let rendered = format!(
                "{key}={}:{};",
                parameter.value.type_name(),
                parameter.value
            );
            hasher.update(rendered.as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn builder_rejects_blank_keys() {
        let err = JobParameters::builder().string(" ", "x").build().unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn typed_getters_respect_type() {
        let params = JobParameters::builder()
            .string("name", "foo")
            .long("run", 3)
            .non_identifying("shouldfail", ParameterValue::Bool(true))
            .build()
            .unwrap();

        assert_eq!(params.get_string("name"), Some("foo"));
        assert_eq!(params.get_long("run"), Some(3));
        assert_eq!(params.get_string("run"), None);
        assert_eq!(params.get_bool("shouldfail"), Some(true));
        assert_eq!(params.identifying().count(), 2);
    }

    #[test]
    fn key_depends_on_job_name_and_type() {
        let long = JobParameters::builder().long("id", 1).build().unwrap();
        let string = JobParameters::builder().string("id", "1").build().unwrap();

        assert_ne!(JobKey::generate("a", &long), JobKey::generate("b", &long));
        assert_ne!(JobKey::generate("a", &long), JobKey::generate("a", &string));
        assert_eq!(JobKey::generate("a", &long).as_str().len(), 64);
    }

    proptest! {
        /// Property: non-identifying values never influence the job key.
        #[test]
        fn non_identifying_values_do_not_change_key(
            name in "[a-z]{1,8}",
            id in any::<i64>(),
            first in any::<bool>(),
            second in ".{0,16}",
        ) {
            let a = JobParameters::builder()
                .long("id", id)
                .non_identifying("shouldfail", ParameterValue::Bool(first))
                .build()
                .unwrap();
            let b = JobParameters::builder()
                .long("id", id)
                .non_identifying("shouldfail", ParameterValue::String(second))
                .build()
                .unwrap();

            prop_assert_eq!(JobKey::generate(&name, &a), JobKey::generate(&name, &b));
        }
    }
}

//! Constructor parameter records built from spec keyword arguments

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};

use crate::error::{Result, RunnerError};
use crate::problem_info::ProblemInfo;

/// Keyword arguments for one constructor
///
/// Adapters read the keys they declare through the typed getters; whatever
/// is left unread afterwards is carried as opaque extra options.
#[derive(Debug, Clone, Default)]
pub struct Params {
    values: Map<String, Value>,
    consumed: BTreeSet<String>,
    problem_info: Option<ProblemInfo>,
}

impl Params {
    pub fn new(values: Map<String, Value>) -> Self {
        Self {
            values,
            consumed: BTreeSet::new(),
            problem_info: None,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
    }

    /// Set `key` only when absent
    pub fn set_default(&mut self, key: &str, value: Value) {
        self.values.entry(key.to_string()).or_insert(value);
    }

    /// Move `from` to `to` unless `to` is already set
    pub fn rename(&mut self, from: &str, to: &str) {
        if let Some(v) = self.values.remove(from) {
            self.values.entry(to.to_string()).or_insert(v);
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn attach_problem_info(&mut self, info: ProblemInfo) {
        self.problem_info = Some(info);
    }

    pub fn problem_info(&self) -> Option<&ProblemInfo> {
        self.problem_info.as_ref()
    }

    /// Raw value of a declared key, marking it read; JSON null reads as absent
    pub fn take(&mut self, key: &str) -> Option<Value> {
        self.consumed.insert(key.to_string());
        match self.values.get(key) {
            Some(Value::Null) | None => None,
            Some(v) => Some(v.clone()),
        }
    }

    pub fn opt_f64(&mut self, key: &str) -> Result<Option<f64>> {
        match self.take(key) {
            None => Ok(None),
            Some(v) => parse_f64(key, &v).map(Some),
        }
    }

    pub fn f64_or(&mut self, key: &str, default: f64) -> Result<f64> {
        Ok(self.opt_f64(key)?.unwrap_or(default))
    }

    pub fn opt_usize(&mut self, key: &str) -> Result<Option<usize>> {
        match self.take(key) {
            None => Ok(None),
            Some(v) => match v.as_u64() {
                Some(n) => Ok(Some(n as usize)),
                None => match v.as_f64() {
                    Some(f) if f >= 0.0 && f.fract() == 0.0 => Ok(Some(f as usize)),
                    _ => Err(RunnerError::invalid_option(key, v, "expected a non-negative integer")),
                },
            },
        }
    }

    pub fn usize_or(&mut self, key: &str, default: usize) -> Result<usize> {
        Ok(self.opt_usize(key)?.unwrap_or(default))
    }

    pub fn opt_u64(&mut self, key: &str) -> Result<Option<u64>> {
        Ok(self.opt_usize(key)?.map(|n| n as u64))
    }

    pub fn bool_or(&mut self, key: &str, default: bool) -> Result<bool> {
        match self.take(key) {
            None => Ok(default),
            Some(Value::Bool(b)) => Ok(b),
            Some(v) => Err(RunnerError::invalid_option(key, v, "expected a boolean")),
        }
    }

    pub fn opt_string(&mut self, key: &str) -> Result<Option<String>> {
        match self.take(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(v) => Err(RunnerError::invalid_option(key, v, "expected a string")),
        }
    }

    pub fn string_or(&mut self, key: &str, default: &str) -> Result<String> {
        Ok(self.opt_string(key)?.unwrap_or_else(|| default.to_string()))
    }

    pub fn opt_f64_vec(&mut self, key: &str) -> Result<Option<Vec<f64>>> {
        match self.take(key) {
            None => Ok(None),
            Some(Value::Array(items)) => items.iter().map(|v| parse_f64(key, v)).collect::<Result<_>>().map(Some),
            Some(v) => Err(RunnerError::invalid_option(key, v, "expected a list of numbers")),
        }
    }

    /// Unread keys rendered as JSON text
    pub fn into_extra_options(self) -> BTreeMap<String, String> {
        let consumed = self.consumed;
        self.values
            .into_iter()
            .filter(|(k, _)| !consumed.contains(k))
            .map(|(k, v)| (k, v.to_string()))
            .collect()
    }
}

/// Numbers, or the strings `nan`, `inf`, `-inf` and numeric text
fn parse_f64(key: &str, value: &Value) -> Result<f64> {
    if let Some(f) = value.as_f64() {
        return Ok(f);
    }
    if let Value::String(s) = value {
        match s.trim().to_ascii_lowercase().as_str() {
            "nan" => return Ok(f64::NAN),
            "inf" | "infinity" | "+inf" => return Ok(f64::INFINITY),
            "-inf" | "-infinity" => return Ok(f64::NEG_INFINITY),
            other => {
                if let Ok(f) = other.parse::<f64>() {
                    return Ok(f);
                }
            }
        }
    }
    Err(RunnerError::invalid_option(key, value, "expected a number"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(v: Value) -> Params {
        match v {
            Value::Object(map) => Params::new(map),
            _ => Params::default(),
        }
    }

    #[test]
    fn test_typed_reads_and_extras() {
        let mut p = params(json!({"alpha": 0.5, "max_iter": 10, "verbose": true, "flavour": "x"}));
        assert_eq!(p.f64_or("alpha", 1.0).unwrap(), 0.5);
        assert_eq!(p.usize_or("max_iter", 1).unwrap(), 10);
        assert_eq!(p.f64_or("tol", 1e-4).unwrap(), 1e-4);
        let extras = p.into_extra_options();
        assert_eq!(extras.len(), 2);
        assert_eq!(extras["flavour"], "\"x\"");
    }

    #[test]
    fn test_special_float_strings() {
        let mut p = params(json!({"constant": "nan", "cap": "-inf"}));
        assert!(p.f64_or("constant", 0.0).unwrap().is_nan());
        assert_eq!(p.f64_or("cap", 0.0).unwrap(), f64::NEG_INFINITY);
    }

    #[test]
    fn test_rename_keeps_existing_target() {
        let mut p = params(json!({"n_iter": 5, "max_iter": 9}));
        p.rename("n_iter", "max_iter");
        assert_eq!(p.usize_or("max_iter", 0).unwrap(), 9);
        assert!(!p.contains("n_iter"));
    }

    #[test]
    fn test_wrong_type_is_config_error() {
        let mut p = params(json!({"fit_intercept": 3}));
        assert!(matches!(p.bool_or("fit_intercept", true), Err(RunnerError::ConfigError(_))));
    }
}

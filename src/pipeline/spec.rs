//! Declarative, language-neutral pipeline descriptions

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ConfigErrorKind, Result, RunnerError};

/// Role of one object in a pipeline spec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpecClass {
    #[serde(rename = "preproc")]
    Preprocessor,
    #[serde(rename = "sklearn")]
    Estimator,
    #[serde(rename = "y_transformer")]
    YTransformer,
    #[serde(rename = "tf")]
    TfEstimator,
    #[serde(rename = "ensemble")]
    Ensemble,
    #[serde(rename = "sdk_ensemble")]
    SdkEnsemble,
    #[serde(rename = "nimbus")]
    Streaming,
    #[serde(rename = "timeseries")]
    Timeseries,
}

impl SpecClass {
    pub fn as_str(self) -> &'static str {
        match self {
            SpecClass::Preprocessor => "preproc",
            SpecClass::Estimator => "sklearn",
            SpecClass::YTransformer => "y_transformer",
            SpecClass::TfEstimator => "tf",
            SpecClass::Ensemble => "ensemble",
            SpecClass::SdkEnsemble => "sdk_ensemble",
            SpecClass::Streaming => "nimbus",
            SpecClass::Timeseries => "timeseries",
        }
    }

    /// Kinds that end a chain
    pub fn is_estimator(self) -> bool {
        !matches!(self, SpecClass::Preprocessor | SpecClass::YTransformer)
    }

    pub fn is_ensemble(self) -> bool {
        matches!(self, SpecClass::Ensemble | SpecClass::SdkEnsemble)
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// One constructor call: locator plus arguments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectSpec {
    pub spec_class: SpecClass,
    pub module: String,
    pub class_name: String,
    #[serde(default)]
    pub param_args: Vec<Value>,
    #[serde(default)]
    pub param_kwargs: Map<String, Value>,
    /// The estimator can stop itself on a deadline
    #[serde(default, skip_serializing_if = "is_false")]
    pub supports_constrained_fit: bool,
}

impl ObjectSpec {
    pub fn new(spec_class: SpecClass, module: impl Into<String>, class_name: impl Into<String>) -> Self {
        Self {
            spec_class,
            module: module.into(),
            class_name: class_name.into(),
            param_args: Vec::new(),
            param_kwargs: Map::new(),
            supports_constrained_fit: false,
        }
    }

    pub fn with_kwarg(mut self, key: &str, value: Value) -> Self {
        self.param_kwargs.insert(key.to_string(), value);
        self
    }

    pub fn with_constrained_fit(mut self) -> Self {
        self.supports_constrained_fit = true;
        self
    }

    /// `module.class_name`
    pub fn class_string(&self) -> String {
        format!("{}.{}", self.module, self.class_name)
    }
}

/// Ordered object list plus the chain container that holds them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub pipeline_id: String,
    pub objects: Vec<ObjectSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
}

impl PipelineSpec {
    pub fn new(pipeline_id: impl Into<String>, objects: Vec<ObjectSpec>) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            objects,
            module: None,
            class_name: None,
        }
    }

    pub fn with_container(mut self, module: impl Into<String>, class_name: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self.class_name = Some(class_name.into());
        self
    }

    /// Parse and validate the dict form
    pub fn from_dict(value: &Value) -> Result<Self> {
        let spec: PipelineSpec = serde_json::from_value(value.clone())
            .map_err(|e| RunnerError::ConfigError(ConfigErrorKind::Other(format!("malformed pipeline spec: {}", e))))?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn to_dict(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_dict(&value)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    fn validate(&self) -> Result<()> {
        if self.objects.is_empty() {
            return Err(RunnerError::ConfigError(ConfigErrorKind::Other(format!(
                "pipeline {} has no objects",
                self.pipeline_id
            ))));
        }
        let y_count = self.objects.iter().filter(|o| o.spec_class == SpecClass::YTransformer).count();
        if y_count > 1 {
            return Err(RunnerError::invalid_option(
                "objects",
                format!("{} y_transformers", y_count),
                "at most one y_transformer per pipeline",
            ));
        }
        Ok(())
    }

    /// True iff any object can stop itself on a deadline
    pub fn supports_constrained_fit(&self) -> bool {
        self.objects.iter().any(|o| o.supports_constrained_fit)
    }

    /// `module.class_name` of every object, in order
    pub fn class_strings(&self) -> Vec<String> {
        self.objects.iter().map(ObjectSpec::class_string).collect()
    }

    /// Class name of the final non-y-transformer object
    pub fn terminal_class_name(&self) -> Option<&str> {
        self.objects
            .iter()
            .rev()
            .find(|o| o.spec_class != SpecClass::YTransformer)
            .map(|o| o.class_name.as_str())
    }

    pub fn is_ensemble(&self) -> bool {
        self.objects.iter().any(|o| o.spec_class.is_ensemble())
    }

    /// One-line description for logs
    pub fn summary(&self) -> String {
        let steps: Vec<String> = self
            .objects
            .iter()
            .map(|o| {
                if o.param_kwargs.is_empty() {
                    o.class_name.clone()
                } else {
                    let keys: Vec<&str> = o.param_kwargs.keys().map(String::as_str).collect();
                    format!("{}({})", o.class_name, keys.join(", "))
                }
            })
            .collect();
        format!("{}: {}", self.pipeline_id, steps.join(" -> "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_minimal_dict_round_trips() {
        let dict = json!({
            "pipeline_id": "p1",
            "objects": [
                {"spec_class": "preproc", "module": "M", "class_name": "Identity", "param_args": [], "param_kwargs": {}},
                {"spec_class": "sklearn", "module": "M", "class_name": "Ridge", "param_args": [], "param_kwargs": {"alpha": 1.0}}
            ]
        });
        let spec = PipelineSpec::from_dict(&dict).unwrap();
        assert_eq!(spec.to_dict().unwrap(), dict);
        assert_eq!(spec.class_strings(), vec!["M.Identity", "M.Ridge"]);
        assert!(!spec.supports_constrained_fit());
    }

    #[test]
    fn test_two_y_transformers_rejected() {
        let y = ObjectSpec::new(SpecClass::YTransformer, "m", "Log1pTransformer");
        let est = ObjectSpec::new(SpecClass::Estimator, "m", "Ridge");
        let spec = PipelineSpec::new("p", vec![y.clone(), y, est]);
        assert!(PipelineSpec::from_dict(&spec.to_dict().unwrap()).is_err());
    }

    #[test]
    fn test_summary_and_terminal() {
        let spec = PipelineSpec::new(
            "p9",
            vec![
                ObjectSpec::new(SpecClass::Preprocessor, "m", "StandardScaler"),
                ObjectSpec::new(SpecClass::Estimator, "m", "Ridge").with_kwarg("alpha", json!(0.5)),
                ObjectSpec::new(SpecClass::YTransformer, "m", "Log1pTransformer"),
            ],
        );
        assert_eq!(spec.summary(), "p9: StandardScaler -> Ridge(alpha) -> Log1pTransformer");
        assert_eq!(spec.terminal_class_name(), Some("Ridge"));
    }

    #[test]
    fn test_unknown_spec_class_is_config_error() {
        let dict = json!({"pipeline_id": "p", "objects": [{"spec_class": "mystery", "module": "m", "class_name": "X"}]});
        assert!(matches!(PipelineSpec::from_dict(&dict), Err(RunnerError::ConfigError(_))));
    }
}

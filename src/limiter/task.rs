//! Tasks that can run on either side of the process boundary
//!
//! Closures cannot cross into a freshly exec'd child, so work is named: the
//! parent sends a task name plus a bincode payload, and the child looks the
//! name up in its [`TaskRegistry`].

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, RunnerError};

/// `(value, inner_error)`; a task reports its own failures in the second slot
pub type TaskReturn<T> = (Option<T>, Option<RunnerError>);

/// A unit of work the limiter can run in a child process
pub trait RemoteTask: Send + Sync {
    type Input: Serialize + DeserializeOwned + Send;
    type Output: Serialize + DeserializeOwned + Send;

    /// Registry key; must be identical in parent and child
    fn name(&self) -> &'static str;

    fn call(&self, input: Self::Input) -> TaskReturn<Self::Output>;
}

/// Byte-level view of a task, used by the registry
trait ErasedTask: Send + Sync {
    fn call_bytes(&self, payload: &[u8]) -> Result<(Option<Vec<u8>>, Option<RunnerError>)>;
}

impl<T: RemoteTask> ErasedTask for T {
    fn call_bytes(&self, payload: &[u8]) -> Result<(Option<Vec<u8>>, Option<RunnerError>)> {
        let input: T::Input = bincode::deserialize(payload)?;
        let (value, error) = self.call(input);
        let bytes = value.map(|v| bincode::serialize(&v)).transpose()?;
        Ok((bytes, error))
    }
}

/// Name-to-task lookup table held by the spawn server
#[derive(Default)]
pub struct TaskRegistry {
    tasks: BTreeMap<&'static str, Box<dyn ErasedTask>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `task` under its name, replacing any previous entry
    pub fn register<T: RemoteTask + 'static>(&mut self, task: T) -> &mut Self {
        self.tasks.insert(task.name(), Box::new(task));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tasks.keys().copied().collect()
    }

    /// Decode `payload`, run the named task and encode its value
    pub fn call(&self, name: &str, payload: &[u8]) -> Result<(Option<Vec<u8>>, Option<RunnerError>)> {
        let task = self.tasks.get(name).ok_or_else(|| RunnerError::PipelineError {
            message: format!("no task named '{}' is registered in the spawn server", name),
            traceback: None,
        })?;
        task.call_bytes(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Double;

    impl RemoteTask for Double {
        type Input = i64;
        type Output = i64;

        fn name(&self) -> &'static str {
            "double"
        }

        fn call(&self, input: i64) -> TaskReturn<i64> {
            if input < 0 {
                (None, Some(RunnerError::DataError("negative".into())))
            } else {
                (Some(input * 2), None)
            }
        }
    }

    #[test]
    fn test_registry_dispatch() {
        let mut registry = TaskRegistry::new();
        registry.register(Double);
        assert!(registry.contains("double"));

        let (value, error) = registry.call("double", &bincode::serialize(&21i64).unwrap()).unwrap();
        let value: i64 = bincode::deserialize(&value.unwrap()).unwrap();
        assert_eq!(value, 42);
        assert!(error.is_none());

        let (value, error) = registry.call("double", &bincode::serialize(&-1i64).unwrap()).unwrap();
        assert!(value.is_none());
        assert!(matches!(error, Some(RunnerError::DataError(_))));
    }

    #[test]
    fn test_unknown_task() {
        let registry = TaskRegistry::new();
        assert!(matches!(registry.call("nope", &[]), Err(RunnerError::PipelineError { .. })));
    }
}

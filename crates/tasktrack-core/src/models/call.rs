use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::{TaskError, TaskErrorKind, TaskOutcome, TaskValue};

pub type TaskFunctionError = Box<dyn std::error::Error + Send + Sync>;

pub type TaskFunction =
    Arc<dyn Fn(&TaskArguments) -> Result<TaskValue, TaskFunctionError> + Send + Sync>;

/// Positional and keyword arguments of one invocation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskArguments {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl TaskArguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    pub fn positional(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    pub fn keyword(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }

    /// Looks a parameter up by keyword first, then by position.
    pub fn get(&self, index: usize, name: &str) -> Option<&Value> {
        self.keyword(name).or_else(|| self.positional(index))
    }

    pub fn require_i64(&self, index: usize, name: &str) -> Result<i64, TaskFunctionError> {
        self.get(index, name)
            .and_then(Value::as_i64)
            .ok_or_else(|| format!("missing integer argument '{name}'").into())
    }
}

/// A resolved function invocation handed to an executor.
#[derive(Clone)]
pub struct TaskCall {
    pub func_name: String,
    pub function: TaskFunction,
    pub arguments: TaskArguments,
}

impl TaskCall {
    pub fn new<F>(func_name: impl Into<String>, function: F, arguments: TaskArguments) -> Self
    where
        F: Fn(&TaskArguments) -> Result<TaskValue, TaskFunctionError> + Send + Sync + 'static,
    {
        Self {
            func_name: func_name.into(),
            function: Arc::new(function),
            arguments,
        }
    }

    pub fn from_function(
        func_name: impl Into<String>,
        function: TaskFunction,
        arguments: TaskArguments,
    ) -> Self {
        Self {
            func_name: func_name.into(),
            function,
            arguments,
        }
    }

    pub fn invoke(&self) -> TaskOutcome {
        match (self.function)(&self.arguments) {
            Ok(value) => TaskOutcome::Completed(value),
            Err(error) => TaskOutcome::Failed(error.to_string()),
        }
    }
}

impl Debug for TaskCall {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskCall")
            .field("func_name", &self.func_name)
            .field("arguments", &self.arguments)
            .finish_non_exhaustive()
    }
}

/// Named functions that can be invoked by name, e.g. inside worker processes.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: BTreeMap<String, TaskFunction>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, function: F) -> Result<(), TaskError>
    where
        F: Fn(&TaskArguments) -> Result<TaskValue, TaskFunctionError> + Send + Sync + 'static,
    {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(TaskError::new(
                TaskErrorKind::InvalidInput,
                "function name must not be empty",
            ));
        }
        if self.functions.contains_key(&name) {
            return Err(TaskError::new(
                TaskErrorKind::InvalidInput,
                format!("duplicate function registration for '{name}'"),
            ));
        }
        self.functions.insert(name, Arc::new(function));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<TaskFunction> {
        self.functions.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    pub fn call(&self, name: &str, arguments: TaskArguments) -> Result<TaskCall, TaskError> {
        let function = self.get(name).ok_or_else(|| {
            TaskError::new(
                TaskErrorKind::InvalidInput,
                format!("no function is registered under '{name}'"),
            )
        })?;
        Ok(TaskCall::from_function(name, function, arguments))
    }
}

impl Debug for FunctionRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.functions.keys()).finish()
    }
}

//! In-memory implementations of the host collaborator traits.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use tracing::debug;

use crate::error::{ErrorKind, HostError, HostResult};
use crate::traits::{
    ExecutionContext, FunctionDelegate, FunctionMetadata, FunctionRegistry, RegisteredFunction,
};
use crate::value::{DataType, Value};

/// Function registry keyed by case-insensitive name, allowing overloads.
#[derive(Default)]
pub struct SimpleFunctionRegistry {
    functions: RwLock<HashMap<String, Vec<RegisteredFunction>>>,
}

impl SimpleFunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered overloads across all names.
    pub fn len(&self) -> usize {
        let functions = self.functions.read().unwrap_or_else(PoisonError::into_inner);
        functions.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl FunctionRegistry for SimpleFunctionRegistry {
    fn register(
        &self,
        signature: &str,
        delegate: FunctionDelegate,
        metadata: FunctionMetadata,
    ) -> HostResult<()> {
        let function = RegisteredFunction::new(signature, delegate, metadata);
        if function.name.is_empty() {
            return Err(HostError::data(
                ErrorKind::InvalidArguments,
                format!("invalid function signature '{signature}'"),
            ));
        }
        let mut functions = self.functions.write().unwrap_or_else(PoisonError::into_inner);
        let overloads = functions.entry(function.name.to_lowercase()).or_default();
        // Re-registering a signature replaces the previous delegate.
        overloads.retain(|f| f.signature != function.signature);
        debug!(function = %function.signature, "Function registered");
        overloads.push(function);
        Ok(())
    }

    fn find_by_name(&self, name: &str, arg_types: Option<&[DataType]>) -> Option<RegisteredFunction> {
        let functions = self.functions.read().unwrap_or_else(PoisonError::into_inner);
        let overloads = functions.get(&name.to_lowercase())?;
        match arg_types {
            Some(types) => overloads.iter().find(|f| f.accepts(types)).cloned(),
            None => overloads.first().cloned(),
        }
    }
}

/// Execution context with an in-memory config store and no query engine.
#[derive(Default)]
pub struct MemoryExecutionContext {
    config: RwLock<HashMap<String, Value>>,
}

impl MemoryExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionContext for MemoryExecutionContext {
    async fn run_query(&self, query: &str, _parameters: HashMap<String, Value>) -> HostResult<Value> {
        Err(HostError::data(
            ErrorKind::NotSupported,
            format!("no query engine attached, cannot run '{query}'"),
        ))
    }

    async fn get_config_value(&self, key: &str) -> HostResult<Value> {
        let config = self.config.read().unwrap_or_else(PoisonError::into_inner);
        Ok(config.get(key).cloned().unwrap_or(Value::Null))
    }

    async fn set_config_value(&self, key: &str, value: Value) -> HostResult<()> {
        let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
        if value.is_null() {
            config.remove(key);
        } else {
            config.insert(key.to_string(), value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::FutureExt;

    use super::*;
    use crate::traits::FunctionCall;

    fn sum_delegate() -> FunctionDelegate {
        Arc::new(|call: FunctionCall| {
            async move {
                let total = call.args.iter().filter_map(Value::as_integer).sum::<i64>();
                Ok(Value::Integer(total))
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn registers_and_calls_function() {
        let registry = SimpleFunctionRegistry::new();
        registry
            .register("add(a: integer, b: integer): integer", sum_delegate(), FunctionMetadata::default())
            .unwrap();

        let f = registry
            .find_by_name("ADD", Some(&[DataType::Integer, DataType::Integer]))
            .unwrap();
        let result = registry.call(&f, vec![Value::Integer(2), Value::Integer(3)]).await.unwrap();
        assert_eq!(result, Value::Integer(5));
        assert!(registry.find_by_name("add", Some(&[DataType::String])).is_none());
    }

    #[test]
    fn same_signature_registers_once() {
        let registry = SimpleFunctionRegistry::new();
        for _ in 0..3 {
            registry
                .register("add(a: integer, b: integer): integer", sum_delegate(), FunctionMetadata::default())
                .unwrap();
        }
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn config_store_round_trips_and_clears() {
        let context = MemoryExecutionContext::new();
        context.set_config_value("k", Value::from("v")).await.unwrap();
        assert_eq!(context.get_config_value("k").await.unwrap(), Value::from("v"));
        context.set_config_value("k", Value::Null).await.unwrap();
        assert!(context.get_config_value("k").await.unwrap().is_null());
        let err = context.run_query("select 1", HashMap::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
    }
}

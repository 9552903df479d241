use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::HostResult;
use crate::protocol::function_name;
use crate::value::{DataType, Value};

/// Arguments of one host function invocation.
#[derive(Debug, Clone)]
pub struct FunctionCall {
    pub function_name: String,
    pub args: Vec<Value>,
}

pub type FunctionFuture = BoxFuture<'static, HostResult<Value>>;

/// Callable body of a registered function.
pub type FunctionDelegate = Arc<dyn Fn(FunctionCall) -> FunctionFuture + Send + Sync>;

/// Descriptive flags attached to a registered function.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionMetadata {
    pub description: String,
    pub is_safe: bool,
    pub is_aggregate: bool,
    pub formatter_ids: Vec<String>,
}

/// A function as stored by a [`FunctionRegistry`].
#[derive(Clone)]
pub struct RegisteredFunction {
    pub name: String,
    pub signature: String,
    pub arg_types: Vec<DataType>,
    pub metadata: FunctionMetadata,
    pub delegate: FunctionDelegate,
}

impl RegisteredFunction {
    pub fn new(signature: &str, delegate: FunctionDelegate, metadata: FunctionMetadata) -> Self {
        Self {
            name: function_name(signature).to_string(),
            signature: signature.to_string(),
            arg_types: signature_arg_types(signature),
            metadata,
            delegate,
        }
    }

    /// Whether this overload accepts the given argument types.
    pub fn accepts(&self, arg_types: &[DataType]) -> bool {
        self.arg_types.len() == arg_types.len()
            && self.arg_types.iter().zip(arg_types).all(|(expected, actual)| {
                *expected == DataType::Dynamic || *actual == DataType::Null || expected == actual
            })
    }
}

impl fmt::Debug for RegisteredFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredFunction")
            .field("signature", &self.signature)
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// Argument types declared in a signature like `add(a: integer, b: integer): integer`.
/// Unknown type names are treated as dynamic.
pub fn signature_arg_types(signature: &str) -> Vec<DataType> {
    let Some(open) = signature.find('(') else {
        return Vec::new();
    };
    let Some(close) = signature[open..].find(')') else {
        return Vec::new();
    };
    let inner = &signature[open + 1..open + close];
    inner
        .split(',')
        .map(str::trim)
        .filter(|arg| !arg.is_empty())
        .map(|arg| {
            arg.split_once(':')
                .map(|(_, ty)| ty.trim().trim_end_matches('?').parse().unwrap_or(DataType::Dynamic))
                .unwrap_or(DataType::Dynamic)
        })
        .collect()
}

/// The host's function manager, injected into the plugin layer.
#[async_trait]
pub trait FunctionRegistry: Send + Sync {
    fn register(
        &self,
        signature: &str,
        delegate: FunctionDelegate,
        metadata: FunctionMetadata,
    ) -> HostResult<()>;

    /// Find a function by name; with `arg_types` only a matching overload is returned.
    fn find_by_name(&self, name: &str, arg_types: Option<&[DataType]>) -> Option<RegisteredFunction>;

    async fn call(&self, function: &RegisteredFunction, args: Vec<Value>) -> HostResult<Value> {
        (function.delegate)(FunctionCall {
            function_name: function.name.clone(),
            args,
        })
        .await
    }
}

/// The host's query engine and configuration store.
#[async_trait]
pub trait ExecutionContext: Send + Sync {
    async fn run_query(&self, query: &str, parameters: HashMap<String, Value>) -> HostResult<Value>;

    async fn get_config_value(&self, key: &str) -> HostResult<Value>;

    async fn set_config_value(&self, key: &str, value: Value) -> HostResult<()>;
}

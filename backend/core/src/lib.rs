pub mod data;
pub mod error;
pub mod functions;
pub mod protocol;
pub mod traits;
pub mod value;

pub use data::{
    BlobData, Column, CompareOperation, KeyColumn, QueryContextInfo, RowsFormatter, RowsIterator,
    RowsOutput,
};
pub use error::{ErrorKind, HostError, HostResult, PluginException};
pub use functions::{MemoryExecutionContext, SimpleFunctionRegistry};
pub use traits::{
    ExecutionContext, FunctionCall, FunctionDelegate, FunctionFuture, FunctionMetadata,
    FunctionRegistry, RegisteredFunction,
};
pub use value::{DataType, HostObject, Value};

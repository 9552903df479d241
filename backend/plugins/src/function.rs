//! Host functions whose bodies run inside a plugin.

use std::sync::Arc;

use futures::FutureExt;
use tether_core::protocol::PluginFunction;
use tether_core::{FunctionCall, FunctionDelegate, FunctionMetadata, FunctionRegistry};
use tracing::warn;

use crate::context::PluginContext;

pub fn metadata_of(function: &PluginFunction) -> FunctionMetadata {
    FunctionMetadata {
        description: function.description.clone(),
        is_safe: function.is_safe,
        is_aggregate: function.is_aggregate,
        formatter_ids: function.formatter_ids.clone(),
    }
}

/// Delegate that forwards every call to `context`.
pub fn forwarding_delegate(context: Arc<PluginContext>) -> FunctionDelegate {
    Arc::new(move |call: FunctionCall| {
        let context = Arc::clone(&context);
        async move {
            let cancel = context.cancel_token();
            context
                .call_function(&call.function_name, &call.args, &cancel)
                .await
        }
        .boxed()
    })
}

/// Register every function `context` advertises. Returns how many were
/// accepted by the registry.
pub fn register_forwarding(registry: &dyn FunctionRegistry, context: &Arc<PluginContext>) -> usize {
    let mut registered = 0;
    for function in context.functions() {
        match registry.register(
            &function.signature,
            forwarding_delegate(Arc::clone(context)),
            metadata_of(function),
        ) {
            Ok(()) => registered += 1,
            Err(e) => warn!(
                plugin = %context.name(),
                function = %function.signature,
                error = %e,
                "Cannot register plugin function"
            ),
        }
    }
    registered
}

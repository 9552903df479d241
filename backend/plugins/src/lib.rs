//! `tether-plugins`: out-of-process plugins for the host.
//!
//! Plugins are discovered on disk, started as libraries, executables or
//! packages, and register back over a local RPC endpoint. Their functions
//! become host functions; objects they return are used through proxies.

pub mod cache;
pub mod context;
pub mod descriptor;
pub mod function;
pub mod launcher;
pub mod loader;
pub mod native;
pub mod objects;
pub mod proxy_file;
pub mod registration;
pub mod remote;
pub mod rpc;
pub mod server;
pub mod session;
pub mod transport;
pub mod wait_queue;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::FunctionsCache;
pub use context::PluginContext;
pub use descriptor::{PluginDescriptor, PluginKind};
pub use loader::{LoadReport, LoaderOptions, PluginsLoader};
pub use native::{DynamicLibraryLoader, NativeLibrary, PlatformLibraryLoader};
pub use objects::{ObjectStorage, RemoteObject};
pub use registration::TokenRegistry;
pub use server::{PluginsServer, ServerOptions};
pub use session::{PluginSession, SessionPool};
pub use transport::Endpoint;
pub use wait_queue::WaitQueue;

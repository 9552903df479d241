//! Framed request/response RPC over a [`crate::transport::Connection`].

pub mod client;
pub mod framing;
pub mod server;

pub use client::RpcClient;
pub use server::{ConnectionScope, RpcServer, RpcService};

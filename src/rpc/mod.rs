//! Method invocation over an established, authenticated byte stream.
//!
//! The envelope is line-delimited JSON: one [`wire::Request`] or
//! [`wire::Response`] object per line, paired by id. Host and child must use
//! the same crate version; nothing about the envelope is negotiated.

pub(crate) mod client;
pub(crate) mod server;
pub(crate) mod wire;

pub use server::{RpcError, Service};

pub(crate) use client::RpcClient;

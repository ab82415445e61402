//! Child-side runtime: what a plugin executable runs in its `main`.
//!
//! A plugin registers its exported [`Service`]s on a [`PluginServer`] and
//! calls [`PluginServer::run`], which binds a listener, prints the
//! handshake the supervisor is waiting for, and serves authenticated
//! connections until the host tells it to exit:
//!
//! ```no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use serde_json::Value;
//! use pingo::{PluginServer, RpcError, Service};
//!
//! struct Greeter;
//!
//! #[async_trait]
//! impl Service for Greeter {
//!     fn name(&self) -> &'static str {
//!         "Greeter"
//!     }
//!
//!     async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
//!         match method {
//!             "Hello" => {
//!                 let name: String = serde_json::from_value(params)
//!                     .map_err(|e| RpcError::InvalidParams(e.to_string()))?;
//!                 Ok(Value::String(format!("hello, {name}")))
//!             }
//!             m => Err(RpcError::UnknownMethod(m.to_string())),
//!         }
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut server = PluginServer::new();
//!     server.register(Arc::new(Greeter));
//!     if server.run().await.is_err() {
//!         std::process::exit(1);
//!     }
//! }
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::BufReader;
use tokio::io::{AsyncBufReadExt, ReadHalf};

use crate::error::{self, ServeError};
use crate::frame::{randstr, Prefix};
use crate::rpc::server::{serve_stream, Registry};
use crate::rpc::{RpcError, Service};
use crate::transport::{self, BoxedStream, Proto};

/// Type name of the built-in control object. Filtered from `Objects()`.
pub(crate) const CONTROL_OBJECT: &str = "PingoRpc";
/// Method the supervisor invokes for graceful shutdown.
pub(crate) const EXIT_METHOD: &str = "PingoRpc.Exit";

const TOKEN_LEN: usize = 64;

/// Child configuration, taken from the `-pingo:*` argv contract.
///
/// Any argv entry outside the contract is user-defined and ignored here.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Transport to bind, `-pingo:proto={unix|tcp}`. Defaults to unix.
    pub proto: Proto,
    /// Unix socket directory, `-pingo:unixdir=<dir>`. Defaults to the OS
    /// temp directory.
    pub unix_dir: Option<PathBuf>,
    /// Handshake line prefix, `-pingo:prefix=<string>`.
    pub prefix: Prefix,
}

impl ServerConfig {
    /// Reads the configuration from the process argv.
    pub fn from_args() -> Self {
        Self::parse(std::env::args().skip(1))
    }

    fn parse(args: impl IntoIterator<Item = String>) -> Self {
        let mut conf = Self {
            proto: Proto::Unix,
            unix_dir: None,
            prefix: Prefix::new("pingo"),
        };

        for arg in args {
            if let Some(v) = arg.strip_prefix("-pingo:proto=") {
                conf.proto = Proto::from_flag(v);
            } else if let Some(v) = arg.strip_prefix("-pingo:unixdir=") {
                if !v.is_empty() {
                    conf.unix_dir = Some(PathBuf::from(v));
                }
            } else if let Some(v) = arg.strip_prefix("-pingo:prefix=") {
                conf.prefix = Prefix::new(v);
            }
        }

        conf
    }
}

/// The in-process RPC server of one plugin executable.
pub struct PluginServer {
    registry: Registry,
    secret: String,
    conf: ServerConfig,
    running: bool,
}

impl PluginServer {
    /// Creates a server configured from argv, with the control object
    /// pre-registered and a fresh auth token.
    pub fn new() -> Self {
        Self::with_config(ServerConfig::from_args())
    }

    /// Creates a server with an explicit configuration.
    pub fn with_config(conf: ServerConfig) -> Self {
        let mut registry = Registry::default();
        registry.register(Arc::new(PingoRpc));

        Self {
            registry,
            secret: randstr(TOKEN_LEN),
            conf,
            running: false,
        }
    }

    /// Registers an exported object.
    ///
    /// Panics if called after [`run`](Self::run); the object list is
    /// announced once, at startup.
    pub fn register(&mut self, service: Arc<dyn Service>) {
        assert!(!self.running, "do not call register after run");
        self.registry.register(service);
    }

    /// Binds, performs the handshake, and accepts connections indefinitely.
    ///
    /// Returns only if no listener could be bound, after reporting
    /// `fatal: err-connection-failed` on the handshake stream. Accept
    /// failures are reported as `fatal: err-http-serve` and the loop
    /// continues.
    pub async fn run(&mut self) -> Result<(), ServeError> {
        self.running = true;
        let prefix = self.conf.prefix.clone();

        prefix.output("objects", &self.registry.names().join(", "));

        let unix_dir = self
            .conf
            .unix_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);

        let (listener, addr) = match transport::bind(self.conf.proto, &unix_dir).await {
            Ok(bound) => bound,
            Err(e) => {
                prefix.output("fatal", &format!("{}: {}", error::CODE_CONNECTION_FAILED, e));
                return Err(e);
            }
        };

        prefix.output("auth-token", &self.secret);
        prefix.output("ready", &format!("proto={} addr={}", self.conf.proto, addr));

        let registry = Arc::new(self.registry.clone());
        loop {
            match listener.accept().await {
                Ok(stream) => {
                    tokio::spawn(handle_conn(
                        registry.clone(),
                        self.secret.clone(),
                        stream,
                    ));
                }
                Err(e) => {
                    prefix.output("fatal", &format!("{}: {}", error::CODE_HTTP_SERVE, e));
                    continue;
                }
            }
        }
    }
}

impl Default for PluginServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Built-in control object every plugin exports.
struct PingoRpc;

#[async_trait]
impl Service for PingoRpc {
    fn name(&self) -> &'static str {
        CONTROL_OBJECT
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            // Terminates immediately; the caller observes EOF, not a reply.
            "Exit" => {
                let status: i32 = serde_json::from_value(params)
                    .map_err(|e| RpcError::InvalidParams(e.to_string()))?;
                std::process::exit(status);
            }
            m => Err(RpcError::UnknownMethod(m.to_string())),
        }
    }
}

/// Authenticates one accepted connection, then serves RPC on it.
///
/// Connections that present no token or the wrong token are dropped without
/// a reply.
async fn handle_conn(registry: Arc<Registry>, secret: String, stream: BoxedStream) {
    let (reader, writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);

    let token = match read_auth_token(&mut reader).await {
        Some(token) => token,
        None => return,
    };
    if token.is_empty() || token != secret {
        return;
    }

    serve_stream(registry, reader, writer).await;
}

/// Reads the `Key: Value` header block terminated by a blank line and
/// returns the `Auth-Token` value.
async fn read_auth_token(reader: &mut BufReader<ReadHalf<BoxedStream>>) -> Option<String> {
    let mut token = String::new();
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => {}
        }

        let header = line.trim_end_matches(['\r', '\n']);
        if header.is_empty() {
            break;
        }
        if let Some((key, value)) = header.split_once(": ") {
            if key == "Auth-Token" {
                token = value.to_string();
            }
        }
    }

    Some(token)
}

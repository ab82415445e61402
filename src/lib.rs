//! # pingo
//!
//! **Pingo** implements the basics for creating and running subprocesses as
//! plugins. Because a statically linked host cannot load code at runtime,
//! plugins are ordinary executables: the host launches one as a child, the
//! child binds a local listener (unix socket or TCP loopback) and announces
//! it on stdout, and from then on the host calls the child's exported
//! objects over a small RPC protocol.
//!
//! ## Features
//!
//! | Area            | Description                                                        | Key types / traits               |
//! |-----------------|--------------------------------------------------------------------|----------------------------------|
//! | **Host handle** | Start, call, inspect and stop one plugin subprocess.               | [`Plugin`], [`PluginConfig`]     |
//! | **Child runtime** | Register exported objects and serve them from the plugin's main. | [`PluginServer`], [`Service`]    |
//! | **Transports**  | Unix socket or TCP loopback, authenticated with a shared secret.   | [`Proto`]                        |
//! | **Log sink**    | Hook non-fatal errors and raw child output.                        | [`ErrorHandler`], [`LogHandler`] |
//! | **Errors**      | Typed errors for both sides of the channel.                        | [`PluginError`], [`ServeError`]  |
//!
//! ## Host side
//!
//! ```no_run
//! use pingo::{Plugin, Proto};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), pingo::PluginError> {
//!     let plugin = Plugin::new(Proto::Unix, "./hello-plugin");
//!     plugin.start();
//!
//!     let objects = plugin.objects().await?;
//!     println!("exported: {objects:?}");
//!
//!     let greeting: String = plugin.call("Greeter.Hello", "world").await?;
//!     println!("{greeting}");
//!
//!     plugin.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! `start` returns immediately; the handshake races a registration timeout
//! in the background, and any startup failure surfaces on the first `call`
//! or `objects`. Once a fatal error is latched, every request on the handle
//! returns it until `stop`.
//!
//! The child side of the contract lives in [`PluginServer`].
//!
//! ---

mod config;
mod error;
mod frame;
mod observer;
mod plugin;
mod rpc;
mod runtime;
mod supervisor;
mod transport;

// ---- Public re-exports ----

pub use config::PluginConfig;
pub use error::{PluginError, ServeError};
pub use frame::Prefix;
pub use observer::{ErrorHandler, LogHandler};
pub use plugin::Plugin;
pub use rpc::{RpcError, Service};
pub use runtime::{PluginServer, ServerConfig};
pub use transport::{ParseProtoError, Proto};

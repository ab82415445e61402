//! Log sink for non-fatal plugin errors and raw child output.
//!
//! The supervisor never owns a logging policy; everything a child prints
//! outside the handshake protocol, plus every non-fatal error, is handed to
//! an [`ErrorHandler`]. A println-based [`LogHandler`] is the default.

use async_trait::async_trait;

use crate::error::PluginError;

/// Sink for non-fatal errors and passthrough output of one plugin.
///
/// Handlers are called from the supervisor loop; implementations should
/// return quickly and never block on the plugin they observe.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    /// Called for non-fatal failures the supervisor itself recovers from,
    /// such as a socket cleanup or child-wait failure.
    async fn on_error(&self, err: &PluginError);

    /// Called for each output line that is not a protocol message, and for
    /// the parsed value of every non-fatal `error:` line the child prints.
    async fn on_output(&self, line: &str);
}

/// Base handler that logs to stdout. Used when no custom handler is set.
pub struct LogHandler;

#[async_trait]
impl ErrorHandler for LogHandler {
    async fn on_error(&self, err: &PluginError) {
        println!("[plugin-error] {} ({})", err, err.as_label());
    }

    async fn on_output(&self, line: &str) {
        println!("{line}");
    }
}

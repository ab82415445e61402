//! # Per-handle plugin configuration.
//!
//! [`PluginConfig`] defines how a handle supervises its child: how long the
//! handshake may take, how long a graceful shutdown may take before the
//! process is force-killed, and where unix sockets are placed.
//!
//! # Example
//! ```
//! use std::time::Duration;
//! use pingo::PluginConfig;
//!
//! let mut cfg = PluginConfig::default();
//! cfg.init_timeout = Duration::from_secs(5);
//!
//! assert_eq!(cfg.exit_timeout, Duration::from_secs(2));
//! assert!(cfg.unix_dir.is_none());
//! ```

use std::path::PathBuf;
use std::time::Duration;

/// Default for both the registration and the shutdown deadline.
pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Configuration for a single plugin handle.
///
/// Mutable only before `start`; the handle's setters enforce this.
#[derive(Clone, Debug)]
pub struct PluginConfig {
    /// Maximum time from process spawn to a completed handshake. Also used
    /// as the dial timeout for the advertised transport.
    pub init_timeout: Duration,
    /// Maximum time a child gets to obey `Exit` before it is force-killed.
    pub exit_timeout: Duration,
    /// Directory for unix sockets. `None` means the OS temp directory.
    pub unix_dir: Option<PathBuf>,
}

impl Default for PluginConfig {
    /// Provides the default configuration:
    /// - `init_timeout = 2s`
    /// - `exit_timeout = 2s`
    /// - `unix_dir = None` (OS temp directory)
    fn default() -> Self {
        Self {
            init_timeout: DEFAULT_TIMEOUT,
            exit_timeout: DEFAULT_TIMEOUT,
            unix_dir: None,
        }
    }
}

//! The public plugin handle.
//!
//! A [`Plugin`] is a thin facade: every operation is a message to the
//! supervisor task through one of four mailboxes. Callers never touch the
//! process, the transport, or the RPC client directly; they send an
//! envelope carrying a oneshot waiter and block on it until the supervisor
//! pairs with them. That pairing is the only admission control in the
//! system and is what serializes the whole handshake.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::config::PluginConfig;
use crate::error::PluginError;
use crate::frame::Prefix;
use crate::observer::{ErrorHandler, LogHandler};
use crate::rpc::RpcClient;
use crate::supervisor::{ChildSpec, Supervisor};
use crate::transport::Proto;

/// Envelope for one `call` admission: the supervisor answers with the RPC
/// client or the latched error.
pub(crate) struct CallRequest {
    pub reply: oneshot::Sender<Result<RpcClient, PluginError>>,
}

/// Envelope for one `objects` request.
pub(crate) struct ObjectsRequest {
    pub reply: oneshot::Sender<Result<Vec<String>, PluginError>>,
}

/// Envelope for a shutdown request; `done` closes once the child is reaped.
pub(crate) struct KillRequest {
    pub done: oneshot::Sender<()>,
}

/// Envelope confirming shutdown; `done` closes once the event loop has
/// exited and the handle is idle again.
pub(crate) struct ExitRequest {
    pub done: oneshot::Sender<()>,
}

/// The receiving ends of the handle's mailboxes. Owned by the supervisor
/// while it runs and parked in [`Shared`] while the handle is idle.
pub(crate) struct Mailboxes {
    pub call: mpsc::Receiver<CallRequest>,
    pub objects: mpsc::Receiver<ObjectsRequest>,
    pub kill: mpsc::Receiver<KillRequest>,
    pub exit: mpsc::Receiver<ExitRequest>,
}

/// State shared between the handle and its supervisor task.
pub(crate) struct Shared {
    pub mailboxes: Mutex<Option<Mailboxes>>,
    pub running: AtomicBool,
}

/// Represents a plugin. After being created the plugin is not started or
/// ready to run.
///
/// Additional configuration (error handler, timeouts, socket directory) can
/// be set after initialization and before [`start`](Self::start).
///
/// ```no_run
/// use pingo::{Plugin, Proto};
///
/// # async fn demo() -> Result<(), pingo::PluginError> {
/// let plugin = Plugin::new(Proto::Unix, "./hello-plugin");
/// plugin.start();
///
/// let greeting: String = plugin.call("Greeter.Hello", "world").await?;
/// assert_eq!(greeting, "hello, world");
///
/// plugin.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct Plugin {
    exe: PathBuf,
    proto: Proto,
    params: Vec<String>,
    config: PluginConfig,
    handler: Arc<dyn ErrorHandler>,
    prefix: Prefix,
    call_tx: mpsc::Sender<CallRequest>,
    objects_tx: mpsc::Sender<ObjectsRequest>,
    kill_tx: mpsc::Sender<KillRequest>,
    exit_tx: mpsc::Sender<ExitRequest>,
    shared: Arc<Shared>,
}

impl Plugin {
    /// Creates a new plugin ready to be started.
    ///
    /// The path should point at the plugin executable; any path accepted by
    /// the OS for execution is accepted here, with the same rules applied.
    pub fn new(proto: Proto, exe: impl Into<PathBuf>) -> Self {
        let (call_tx, call_rx) = mpsc::channel(1);
        let (objects_tx, objects_rx) = mpsc::channel(1);
        let (kill_tx, kill_rx) = mpsc::channel(1);
        let (exit_tx, exit_rx) = mpsc::channel(1);

        Self {
            exe: exe.into(),
            proto,
            params: Vec::new(),
            config: PluginConfig::default(),
            handler: Arc::new(LogHandler),
            prefix: Prefix::generate(),
            call_tx,
            objects_tx,
            kill_tx,
            exit_tx,
            shared: Arc::new(Shared {
                mailboxes: Mutex::new(Some(Mailboxes {
                    call: call_rx,
                    objects: objects_rx,
                    kill: kill_rx,
                    exit: exit_rx,
                })),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Appends user-defined argv entries, forwarded to the child untouched
    /// after the `-pingo:*` contract flags.
    ///
    /// Panics if the plugin is running.
    pub fn with_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        assert!(
            !self.is_running(),
            "cannot change params after start"
        );
        self.params.extend(params.into_iter().map(Into::into));
        self
    }

    /// Whether a supervisor task currently backs this handle.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Sets the error and output handler implementation. By default,
    /// [`LogHandler`] is used.
    ///
    /// Panics if called after [`start`](Self::start).
    pub fn set_error_handler(&mut self, handler: impl ErrorHandler + 'static) {
        assert!(
            !self.is_running(),
            "cannot call set_error_handler after start"
        );
        self.handler = Arc::new(handler);
    }

    /// Sets the maximum time the plugin is allowed to start up and to shut
    /// down. A zero duration is ignored and the default of two seconds is
    /// kept.
    ///
    /// Panics if called after [`start`](Self::start).
    pub fn set_timeout(&mut self, timeout: Duration) {
        assert!(!self.is_running(), "cannot call set_timeout after start");
        if timeout.is_zero() {
            return;
        }
        self.config.init_timeout = timeout;
        self.config.exit_timeout = timeout;
    }

    /// Sets the directory the child is told to place its unix socket in.
    ///
    /// Panics if called after [`start`](Self::start).
    pub fn set_socket_directory(&mut self, dir: impl Into<PathBuf>) {
        assert!(
            !self.is_running(),
            "cannot call set_socket_directory after start"
        );
        self.config.unix_dir = Some(dir.into());
    }

    /// Executes the plugin as a subprocess and returns immediately. Errors
    /// that happen during initialization surface on the first
    /// [`call`](Self::call) or [`objects`](Self::objects).
    ///
    /// Must be called within a tokio runtime. Panics if the plugin is
    /// already running.
    pub fn start(&self) {
        let mailboxes = self
            .shared
            .mailboxes
            .lock()
            .expect("mailbox mutex poisoned")
            .take()
            .expect("plugin already started");
        self.shared.running.store(true, Ordering::SeqCst);

        let spec = ChildSpec {
            exe: self.exe.clone(),
            proto: self.proto,
            params: self.params.clone(),
            unix_dir: self.config.unix_dir.clone(),
            init_timeout: self.config.init_timeout,
            exit_timeout: self.config.exit_timeout,
            prefix: self.prefix.clone(),
        };

        tokio::spawn(Supervisor::run(
            spec,
            mailboxes,
            self.handler.clone(),
            self.shared.clone(),
        ));
    }

    /// Stops the plugin, cleanly if possible, and frees all resources.
    ///
    /// When this returns, the child has been reaped and the supervisor task
    /// has exited. Calling it on an idle handle returns immediately.
    pub async fn stop(&self) {
        if !self.is_running() {
            return;
        }

        let (done, reaped) = oneshot::channel();
        if self
            .kill_tx
            .send(KillRequest { done })
            .await
            .is_err()
        {
            return;
        }
        let _ = reaped.await;

        let (done, exited) = oneshot::channel();
        if self.exit_tx.send(ExitRequest { done }).await.is_err() {
            return;
        }
        let _ = exited.await;
    }

    /// Performs an RPC call to the plugin. The plugin must have been
    /// started first; on an idle handle this fails with
    /// [`PluginError::Stopped`].
    ///
    /// Waits until the plugin has finished initializing, then runs the RPC
    /// on the caller's task. Returns any error that happened either during
    /// initialization or while performing the call.
    pub async fn call<A, R>(&self, name: &str, args: A) -> Result<R, PluginError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        if !self.is_running() {
            return Err(PluginError::Stopped);
        }

        let (reply, admitted) = oneshot::channel();
        self.call_tx
            .send(CallRequest { reply })
            .await
            .map_err(|_| PluginError::Stopped)?;

        let client = admitted.await.map_err(|_| PluginError::Stopped)??;
        client.call(name, args).await
    }

    /// Returns the list of objects the plugin exports. Objects used
    /// internally by the harness are not reported.
    ///
    /// Like [`call`](Self::call), waits for initialization and returns any
    /// error that happened during it.
    pub async fn objects(&self) -> Result<Vec<String>, PluginError> {
        if !self.is_running() {
            return Err(PluginError::Stopped);
        }

        let (reply, admitted) = oneshot::channel();
        self.objects_tx
            .send(ObjectsRequest { reply })
            .await
            .map_err(|_| PluginError::Stopped)?;

        admitted.await.map_err(|_| PluginError::Stopped)?
    }
}

impl fmt::Display for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.exe.display(), self.params.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_keeps_default() {
        let mut plugin = Plugin::new(Proto::Unix, "/bin/true");
        plugin.set_timeout(Duration::ZERO);

        assert_eq!(plugin.config.init_timeout, Duration::from_secs(2));
        assert_eq!(plugin.config.exit_timeout, Duration::from_secs(2));
    }

    #[test]
    fn timeout_sets_both_deadlines() {
        let mut plugin = Plugin::new(Proto::Unix, "/bin/true");
        plugin.set_timeout(Duration::from_millis(300));

        assert_eq!(plugin.config.init_timeout, Duration::from_millis(300));
        assert_eq!(plugin.config.exit_timeout, Duration::from_millis(300));
    }

    #[test]
    fn display_is_exe_and_params() {
        let plugin =
            Plugin::new(Proto::Tcp, "/usr/bin/worker").with_params(["--level", "3"]);
        assert_eq!(plugin.to_string(), "/usr/bin/worker --level 3");
    }

    #[tokio::test]
    #[should_panic(expected = "after start")]
    async fn setters_reject_running_plugin() {
        let mut plugin = Plugin::new(Proto::Unix, "/nonexistent/plugin");
        plugin.start();
        plugin.set_timeout(Duration::from_secs(1));
    }

    #[tokio::test]
    #[should_panic(expected = "already started")]
    async fn double_start_panics() {
        let plugin = Plugin::new(Proto::Unix, "/nonexistent/plugin");
        plugin.start();
        plugin.start();
    }

    #[tokio::test]
    async fn stop_on_idle_handle_returns() {
        let plugin = Plugin::new(Proto::Unix, "/nonexistent/plugin");
        plugin.stop().await;
        assert!(!plugin.is_running());
    }
}

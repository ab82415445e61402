//! The per-plugin supervisor: a single-writer event loop owning one child.
//!
//! All control state (the latched error, the RPC client, the exported
//! object list) is owned by this task alone. Callers synchronize with it by
//! sending request envelopes; completion of the envelope's waiter is the
//! memory barrier. There is no lock anywhere on this path.
//!
//! # High-level architecture
//!
//! ```text
//!  caller ──► handle mailbox ──► select loop ──► RPC client ──► child
//!                                   ▲  ▲  ▲
//!                 stdout/stderr ────┘  │  └──── registration deadline
//!                 (line readers)       └─────── child wait task
//! ```
//!
//! The loop admits `call`/`objects` requests only while `accepting` is set:
//! after a valid `ready` line and an authenticated dial, or after a fatal
//! error was latched (so every caller observes it). Disabled select
//! branches stand in for closed mailboxes.

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Sleep};
use tokio_util::sync::CancellationToken;

use crate::error::PluginError;
use crate::frame::Prefix;
use crate::observer::ErrorHandler;
use crate::plugin::{CallRequest, ExitRequest, KillRequest, Mailboxes, ObjectsRequest, Shared};
use crate::rpc::RpcClient;
use crate::runtime::{CONTROL_OBJECT, EXIT_METHOD};
use crate::transport::{self, Proto};

/// Everything the supervisor needs to spawn and talk to one child.
pub(crate) struct ChildSpec {
    pub exe: PathBuf,
    pub proto: Proto,
    pub params: Vec<String>,
    pub unix_dir: Option<PathBuf>,
    pub init_timeout: Duration,
    pub exit_timeout: Duration,
    pub prefix: Prefix,
}

/// One loop iteration's event, extracted from the select so handlers can
/// borrow the whole supervisor.
enum Tick {
    Deadline,
    Call(CallRequest),
    Objects(ObjectsRequest),
    Line(String),
    LinesClosed,
    Wait(io::Result<ExitStatus>),
    WaitClosed,
    Kill(KillRequest),
    Exit(ExitRequest),
    /// Every handle sender is gone; nobody can stop us anymore.
    Detached,
}

pub(crate) struct Supervisor {
    spec: ChildSpec,
    handler: Arc<dyn ErrorHandler>,
    shared: Arc<Shared>,
    boxes: Mailboxes,

    objs: Vec<String>,
    secret: String,
    err: Option<PluginError>,
    accepting: bool,
    client: Option<RpcClient>,
    over: Option<oneshot::Sender<()>>,

    kill: CancellationToken,
    deadline: Pin<Box<Sleep>>,
    deadline_armed: bool,
    lines: mpsc::Receiver<String>,
    lines_open: bool,
    wait: oneshot::Receiver<io::Result<ExitStatus>>,
    wait_open: bool,
}

impl Supervisor {
    /// Spawns the child and drives it until the handle confirms exit.
    pub(crate) async fn run(
        spec: ChildSpec,
        mut boxes: Mailboxes,
        handler: Arc<dyn ErrorHandler>,
        shared: Arc<Shared>,
    ) {
        // A previous lifetime of this handle may have left a stale shutdown
        // request behind; it must not kill the child we are about to spawn.
        while boxes.kill.try_recv().is_ok() {}
        while boxes.exit.try_recv().is_ok() {}

        let (lines_tx, lines_rx) = mpsc::channel(1);
        let (wait_tx, wait_rx) = oneshot::channel();
        let kill = CancellationToken::new();

        let argv = build_argv(&spec);
        match Command::new(&spec.exe)
            .args(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(mut child) => {
                if let Some(stdout) = child.stdout.take() {
                    spawn_line_reader(stdout, lines_tx.clone());
                }
                if let Some(stderr) = child.stderr.take() {
                    spawn_line_reader(stderr, lines_tx.clone());
                }
                drop(lines_tx);
                spawn_wait(child, kill.clone(), wait_tx);
            }
            Err(e) => {
                drop(lines_tx);
                let _ = wait_tx.send(Err(e));
            }
        }

        let deadline = Box::pin(time::sleep(spec.init_timeout));
        let supervisor = Supervisor {
            spec,
            handler,
            shared,
            boxes,
            objs: Vec::new(),
            secret: String::new(),
            err: None,
            accepting: false,
            client: None,
            over: None,
            kill,
            deadline,
            deadline_armed: true,
            lines: lines_rx,
            lines_open: true,
            wait: wait_rx,
            wait_open: true,
        };

        supervisor.event_loop().await;
    }

    async fn event_loop(mut self) {
        loop {
            let tick = tokio::select! {
                _ = self.deadline.as_mut(), if self.deadline_armed => Tick::Deadline,
                req = self.boxes.call.recv(), if self.accepting => {
                    req.map_or(Tick::Detached, Tick::Call)
                }
                req = self.boxes.objects.recv(), if self.accepting => {
                    req.map_or(Tick::Detached, Tick::Objects)
                }
                line = self.lines.recv(), if self.lines_open => {
                    line.map_or(Tick::LinesClosed, Tick::Line)
                }
                res = &mut self.wait, if self.wait_open => {
                    res.map(Tick::Wait).unwrap_or(Tick::WaitClosed)
                }
                req = self.boxes.kill.recv() => req.map_or(Tick::Detached, Tick::Kill),
                req = self.boxes.exit.recv() => req.map_or(Tick::Detached, Tick::Exit),
            };

            match tick {
                Tick::Deadline => {
                    // A fired deadline stays ready; disarm it or the select
                    // would spin on it.
                    self.deadline_armed = false;
                    self.fatal(PluginError::RegistrationTimeout);
                }
                Tick::Call(req) => {
                    let _ = req.reply.send(self.admit());
                }
                Tick::Objects(req) => {
                    let outcome = match &self.err {
                        Some(err) => Err(err.clone()),
                        None => Ok(self.objects()),
                    };
                    let _ = req.reply.send(outcome);
                }
                Tick::Line(line) => self.dispatch_line(line).await,
                Tick::LinesClosed => self.lines_open = false,
                Tick::Wait(res) => self.child_exited(res).await,
                Tick::WaitClosed => self.wait_open = false,
                Tick::Kill(req) => self.shutdown(req).await,
                Tick::Exit(req) => {
                    self.finish(Some(req.done));
                    return;
                }
                Tick::Detached => {
                    self.kill.cancel();
                    self.finish(None);
                    return;
                }
            }
        }
    }

    /// Outcome of one call admission: the live client, or the latched
    /// error.
    fn admit(&self) -> Result<RpcClient, PluginError> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        match &self.client {
            Some(client) => Ok(client.clone()),
            None => Err(PluginError::Stopped),
        }
    }

    /// Copies the object list for a requester, without the control object.
    fn objects(&self) -> Vec<String> {
        self.objs
            .iter()
            .filter(|name| name.as_str() != CONTROL_OBJECT)
            .cloned()
            .collect()
    }

    /// Latches a fatal error (first write wins), opens the mailboxes so
    /// every caller observes it, and kills the child.
    fn fatal(&mut self, err: PluginError) {
        if self.err.is_none() {
            self.err = Some(err);
        }
        self.accepting = true;
        self.kill.cancel();
    }

    async fn dispatch_line(&mut self, line: String) {
        match self.spec.prefix.parse(&line) {
            Some(("auth-token", val)) => self.secret = val.to_string(),
            Some(("objects", val)) => {
                self.objs = val.split(", ").map(str::to_string).collect();
            }
            Some(("ready", val)) => self.ready(val).await,
            Some(("fatal", val)) => self.fatal(PluginError::parse_line(val)),
            Some(("error", val)) => {
                // Non-fatal child errors go to the output sink, parsed;
                // on_error is reserved for the supervisor's own failures.
                let err = PluginError::parse_line(val);
                self.handler.on_output(&err.to_string()).await;
            }
            _ => self.handler.on_output(&line).await,
        }
    }

    /// Handles the `ready` line: strict parse, authenticated dial, socket
    /// cleanup, then opens the mailboxes for callers.
    async fn ready(&mut self, val: &str) {
        let (proto, addr) = match parse_ready(val) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.fatal(e);
                return;
            }
        };

        let stream = match transport::dial_auth(
            proto,
            &addr,
            &self.secret,
            self.spec.init_timeout,
        )
        .await
        {
            Ok(stream) => stream,
            Err(e) => {
                self.fatal(e);
                return;
            }
        };

        // The connected socket keeps working through its open descriptor;
        // removing the path now means no stale socket file can outlive a
        // crashed host.
        if proto == Proto::Unix {
            if let Err(e) = std::fs::remove_file(&addr) {
                let err = PluginError::Generic {
                    detail: format!("cannot remove temporary socket: {e}"),
                };
                self.handler.on_error(&err).await;
            }
        }

        self.client = Some(RpcClient::new(stream));
        self.deadline_armed = false;
        self.accepting = true;
    }

    async fn child_exited(&mut self, res: io::Result<ExitStatus>) {
        self.wait_open = false;

        match res {
            Err(e) => {
                let err = PluginError::Generic {
                    detail: e.to_string(),
                };
                self.handler.on_error(&err).await;
                self.fatal(err);
            }
            Ok(status) if !status.success() => {
                self.fatal(PluginError::Exited {
                    detail: status.to_string(),
                });
            }
            Ok(_) => {}
        }

        if let Some(over) = self.over.take() {
            let _ = over.send(());
        }
    }

    /// Begins shutdown: ask the child to exit, guarantee progress with a
    /// force-kill deadline, refuse all further work, and park the requester
    /// until the child is reaped.
    async fn shutdown(&mut self, req: KillRequest) {
        if !self.wait_open {
            let _ = req.done.send(());
            return;
        }

        if !self.accepting || self.client.is_none() {
            self.kill.cancel();
        } else if let Some(client) = &self.client {
            let kill = self.kill.clone();
            let grace = self.spec.exit_timeout;
            tokio::spawn(async move {
                time::sleep(grace).await;
                kill.cancel();
            });

            // Best effort: the child normally dies before replying, so the
            // call resolves by EOF rather than by result.
            let _ = client.call::<i32, i32>(EXIT_METHOD, 0).await;
        }

        if let Some(client) = self.client.take() {
            client.close();
        }
        self.accepting = false;
        self.over = Some(req.done);
    }

    /// Hands the mailboxes back to the handle, marks it idle, and only then
    /// confirms exit, so a handle that saw `stop` return can start again.
    ///
    /// Envelopes that raced into the mailboxes while shutdown completed are
    /// answered here; no caller is left blocked on a dead loop.
    fn finish(self, ack: Option<oneshot::Sender<()>>) {
        let Supervisor {
            mut boxes,
            shared,
            err,
            ..
        } = self;

        let fallback = err.unwrap_or(PluginError::Stopped);
        while let Ok(req) = boxes.call.try_recv() {
            let _ = req.reply.send(Err(fallback.clone()));
        }
        while let Ok(req) = boxes.objects.try_recv() {
            let _ = req.reply.send(Err(fallback.clone()));
        }

        *shared
            .mailboxes
            .lock()
            .expect("mailbox mutex poisoned") = Some(boxes);
        shared
            .running
            .store(false, std::sync::atomic::Ordering::SeqCst);
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }
}

fn build_argv(spec: &ChildSpec) -> Vec<String> {
    let unix_dir = spec
        .unix_dir
        .clone()
        .unwrap_or_else(std::env::temp_dir);

    let mut argv = vec![
        format!("-pingo:prefix={}", spec.prefix),
        format!("-pingo:proto={}", spec.proto),
    ];
    if spec.proto == Proto::Unix {
        argv.push(format!("-pingo:unixdir={}", unix_dir.display()));
    }
    argv.extend(spec.params.iter().cloned());
    argv
}

/// Parses a `ready` value of the form `proto=<unix|tcp> addr=<addr>`.
///
/// The address may be empty; the dial then fails and latches, which is
/// observable but not pretty.
fn parse_ready(val: &str) -> Result<(Proto, String), PluginError> {
    let rest = val.strip_prefix("proto=").ok_or(PluginError::InvalidMessage)?;
    let (proto, rest) = rest.split_once(' ').ok_or(PluginError::InvalidMessage)?;
    let proto: Proto = proto.parse().map_err(|_| PluginError::InvalidMessage)?;
    let addr = rest.strip_prefix("addr=").ok_or(PluginError::InvalidMessage)?;
    Ok((proto, addr.to_string()))
}

fn spawn_line_reader(
    stream: impl AsyncRead + Send + Unpin + 'static,
    tx: mpsc::Sender<String>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
}

/// Reaps the child on its own task. The kill token fires at most one kill;
/// cancelling an already-exited child is a no-op.
fn spawn_wait(
    mut child: Child,
    kill: CancellationToken,
    done: oneshot::Sender<io::Result<ExitStatus>>,
) {
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill.cancelled() => {
                let _ = child.start_kill();
                child.wait().await
            }
        };
        let _ = done.send(status);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_parses_both_protocols() {
        assert_eq!(
            parse_ready("proto=unix addr=/tmp/abcdefgh").unwrap(),
            (Proto::Unix, "/tmp/abcdefgh".to_string())
        );
        assert_eq!(
            parse_ready("proto=tcp addr=127.0.0.1:1024").unwrap(),
            (Proto::Tcp, "127.0.0.1:1024".to_string())
        );
    }

    #[test]
    fn ready_rejects_deviations() {
        assert!(parse_ready("").is_err());
        assert!(parse_ready("proto=sctp addr=x").is_err());
        assert!(parse_ready("proto=unix").is_err());
        assert!(parse_ready("proto=unix /tmp/x").is_err());
        assert!(parse_ready("addr=/tmp/x proto=unix").is_err());
    }

    #[test]
    fn ready_allows_empty_addr() {
        // The dial on an empty address fails later and latches; the parser
        // keeps the original behavior of accepting it.
        assert_eq!(
            parse_ready("proto=tcp addr=").unwrap(),
            (Proto::Tcp, String::new())
        );
    }

    #[test]
    fn argv_contract_for_unix() {
        let spec = ChildSpec {
            exe: "/bin/plugin".into(),
            proto: Proto::Unix,
            params: vec!["--verbose".to_string()],
            unix_dir: Some("/run/sockets".into()),
            init_timeout: Duration::from_secs(2),
            exit_timeout: Duration::from_secs(2),
            prefix: Prefix::new("pingoABCDE"),
        };

        assert_eq!(
            build_argv(&spec),
            vec![
                "-pingo:prefix=pingoABCDE",
                "-pingo:proto=unix",
                "-pingo:unixdir=/run/sockets",
                "--verbose",
            ]
        );
    }

    #[test]
    fn argv_contract_for_tcp_omits_unixdir() {
        let spec = ChildSpec {
            exe: "/bin/plugin".into(),
            proto: Proto::Tcp,
            params: Vec::new(),
            unix_dir: None,
            init_timeout: Duration::from_secs(2),
            exit_timeout: Duration::from_secs(2),
            prefix: Prefix::new("pingoABCDE"),
        };

        let argv = build_argv(&spec);
        assert_eq!(argv, vec!["-pingo:prefix=pingoABCDE", "-pingo:proto=tcp"]);
    }
}

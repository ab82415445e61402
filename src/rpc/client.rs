//! RPC client half, host side.
//!
//! One client exists per plugin and is handed out to every caller the
//! supervisor admits. Calls run on the caller's task: the client serializes
//! the request, parks a oneshot in the pending table, and a pair of
//! connection tasks (writer, reader) move frames. The supervisor only ever
//! clones and closes the client; it never waits on a call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::PluginError;
use crate::rpc::wire::{self, Request, Response};
use crate::transport::BoxedStream;

const OUTBOUND_CAPACITY: usize = 64;

type PendingMap = DashMap<u64, oneshot::Sender<Result<Value, PluginError>>>;

#[derive(Clone)]
pub(crate) struct RpcClient {
    inner: Arc<Inner>,
}

struct Inner {
    outbound: mpsc::Sender<Vec<u8>>,
    pending: PendingMap,
    next_id: AtomicU64,
    stop: CancellationToken,
}

impl RpcClient {
    /// Takes ownership of an authenticated stream and spawns its connection
    /// tasks.
    pub(crate) fn new(stream: BoxedStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);

        let inner = Arc::new(Inner {
            outbound,
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            stop: CancellationToken::new(),
        });

        tokio::spawn(write_loop(writer, outbound_rx, inner.stop.clone()));
        tokio::spawn(read_loop(reader, inner.clone()));

        Self { inner }
    }

    /// Performs one RPC call and decodes the result.
    ///
    /// `method` is `<TypeName>.<MethodName>`. Any number of calls may be in
    /// flight at once; responses pair by id.
    pub(crate) async fn call<A, R>(&self, method: &str, args: A) -> Result<R, PluginError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(args).map_err(|e| PluginError::Call {
            detail: format!("encode params: {e}"),
        })?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = wire::encode(&Request {
            id,
            method: method.to_string(),
            params,
        })?;

        let (reply, completion) = oneshot::channel();
        self.inner.pending.insert(id, reply);

        if self.inner.outbound.send(frame).await.is_err() {
            self.inner.pending.remove(&id);
            return Err(closed());
        }

        let outcome = tokio::select! {
            res = completion => res,
            _ = self.inner.stop.cancelled() => {
                self.inner.pending.remove(&id);
                return Err(closed());
            }
        };

        match outcome {
            Ok(Ok(value)) => serde_json::from_value(value).map_err(|e| PluginError::Call {
                detail: format!("decode result: {e}"),
            }),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(closed()),
        }
    }

    /// Tears down the connection tasks and fails every pending call.
    pub(crate) fn close(&self) {
        self.inner.stop.cancel();
    }
}

fn closed() -> PluginError {
    PluginError::Call {
        detail: "connection closed".to_string(),
    }
}

async fn write_loop(
    mut writer: WriteHalf<BoxedStream>,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if writer.write_all(&frame).await.is_err() {
                        stop.cancel();
                        break;
                    }
                }
                None => break,
            },
        }
    }
}

async fn read_loop(reader: ReadHalf<BoxedStream>, inner: Arc<Inner>) {
    let mut lines = BufReader::new(reader).lines();

    loop {
        tokio::select! {
            _ = inner.stop.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => deliver(&inner.pending, &line),
                // EOF or read failure; either way the stream is done.
                _ => break,
            },
        }
    }

    inner.stop.cancel();
    fail_all(&inner.pending);
}

fn deliver(pending: &PendingMap, line: &str) {
    let resp: Response = match serde_json::from_str(line) {
        Ok(resp) => resp,
        Err(_) => return,
    };

    if let Some((_, reply)) = pending.remove(&resp.id) {
        let outcome = match resp.error {
            Some(detail) => Err(PluginError::Call { detail }),
            None => Ok(resp.result.unwrap_or(Value::Null)),
        };
        let _ = reply.send(outcome);
    }
}

fn fail_all(pending: &PendingMap) {
    let ids: Vec<u64> = pending.iter().map(|entry| *entry.key()).collect();
    for id in ids {
        if let Some((_, reply)) = pending.remove(&id) {
            let _ = reply.send(Err(closed()));
        }
    }
}

//! RPC server half, child side.
//!
//! Plugins export objects by implementing [`Service`] and registering it
//! with the runtime. The serve loop reads request frames off an
//! authenticated connection and dispatches each on its own task, so one
//! slow method does not stall the connection; responses funnel through a
//! single writer task.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

use crate::rpc::wire::{self, Request, Response};
use crate::transport::BoxedStream;

const RESPONSE_CAPACITY: usize = 64;

/// Errors a service dispatch can produce. The text travels to the caller in
/// the response envelope.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum RpcError {
    /// No registered object has this type name.
    #[error("unknown object: {0}")]
    UnknownObject(String),

    /// The object exists but does not expose this method.
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// The params payload did not decode into what the method expects.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// The method itself failed.
    #[error("{0}")]
    Handler(String),
}

/// An object a plugin exports over RPC.
///
/// `name` is the type name callers address; a call to
/// `"<TypeName>.<MethodName>"` dispatches to the service registered under
/// `<TypeName>` with `method = <MethodName>`.
#[async_trait]
pub trait Service: Send + Sync {
    /// Exported type name, as announced on the `objects:` handshake line.
    fn name(&self) -> &'static str;

    /// Invokes one method with JSON-encoded params.
    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError>;
}

/// Registered services, in registration order.
#[derive(Clone, Default)]
pub(crate) struct Registry {
    services: Vec<Arc<dyn Service>>,
}

impl Registry {
    /// Adds a service. A later registration under the same name is
    /// unreachable; first one wins.
    pub(crate) fn register(&mut self, service: Arc<dyn Service>) {
        self.services.push(service);
    }

    /// Exported type names in registration order.
    pub(crate) fn names(&self) -> Vec<&'static str> {
        self.services.iter().map(|s| s.name()).collect()
    }

    fn get(&self, name: &str) -> Option<&Arc<dyn Service>> {
        self.services.iter().find(|s| s.name() == name)
    }

    pub(crate) async fn dispatch(&self, req: Request) -> Response {
        let outcome = match req.method.split_once('.') {
            None => Err(RpcError::UnknownMethod(req.method.clone())),
            Some((object, method)) => match self.get(object) {
                None => Err(RpcError::UnknownObject(object.to_string())),
                Some(service) => service.call(method, req.params).await,
            },
        };

        match outcome {
            Ok(result) => Response {
                id: req.id,
                result: Some(result),
                error: None,
            },
            Err(err) => Response {
                id: req.id,
                result: None,
                error: Some(err.to_string()),
            },
        }
    }
}

/// Serves RPC frames on one authenticated connection until EOF.
///
/// Takes the buffered reader that already consumed the auth header block so
/// no bytes are lost between the prologue and the first frame.
pub(crate) async fn serve_stream(
    registry: Arc<Registry>,
    reader: BufReader<ReadHalf<BoxedStream>>,
    mut writer: WriteHalf<BoxedStream>,
) {
    let (response_tx, mut response_rx) = mpsc::channel::<Vec<u8>>(RESPONSE_CAPACITY);

    let write_task = tokio::spawn(async move {
        while let Some(frame) = response_rx.recv().await {
            if writer.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    let mut lines = reader.lines();
    while let Ok(Some(line)) = lines.next_line().await {
        // A frame that is not valid JSON means the peer is not speaking our
        // envelope; drop the connection.
        let req: Request = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(_) => break,
        };

        let registry = registry.clone();
        let response_tx = response_tx.clone();
        tokio::spawn(async move {
            let resp = registry.dispatch(req).await;
            if let Ok(frame) = wire::encode(&resp) {
                let _ = response_tx.send(frame).await;
            }
        });
    }

    drop(response_tx);
    let _ = write_task.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::RpcClient;
    use crate::transport::BoxedStream;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Service for Echo {
        fn name(&self) -> &'static str {
            "Echo"
        }

        async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
            match method {
                "Say" => Ok(params),
                "Fail" => Err(RpcError::Handler("boom".to_string())),
                m => Err(RpcError::UnknownMethod(m.to_string())),
            }
        }
    }

    fn wired_pair() -> (RpcClient, tokio::task::JoinHandle<()>) {
        let (host_end, plugin_end) = tokio::io::duplex(4096);

        let mut registry = Registry::default();
        registry.register(Arc::new(Echo));
        let registry = Arc::new(registry);

        let server = tokio::spawn(async move {
            let stream: BoxedStream = Box::new(plugin_end);
            let (reader, writer) = tokio::io::split(stream);
            serve_stream(registry, BufReader::new(reader), writer).await;
        });

        (RpcClient::new(Box::new(host_end)), server)
    }

    #[tokio::test]
    async fn call_roundtrip() {
        let (client, _server) = wired_pair();

        let reply: String = client.call("Echo.Say", "hello").await.unwrap();
        assert_eq!(reply, "hello");
    }

    #[tokio::test]
    async fn handler_error_travels_back() {
        let (client, _server) = wired_pair();

        let err = client.call::<_, Value>("Echo.Fail", json!(null)).await.unwrap_err();
        assert_eq!(
            err,
            crate::PluginError::Call {
                detail: "boom".to_string()
            }
        );
    }

    #[tokio::test]
    async fn unknown_object_and_method() {
        let (client, _server) = wired_pair();

        let err = client.call::<_, Value>("Nope.Say", json!(1)).await.unwrap_err();
        assert_eq!(
            err,
            crate::PluginError::Call {
                detail: "unknown object: Nope".to_string()
            }
        );

        let err = client.call::<_, Value>("Echo.Nope", json!(1)).await.unwrap_err();
        assert_eq!(
            err,
            crate::PluginError::Call {
                detail: "unknown method: Nope".to_string()
            }
        );
    }

    #[tokio::test]
    async fn concurrent_calls_pair_by_id() {
        let (client, _server) = wired_pair();

        let mut handles = Vec::new();
        for i in 0..16 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                let reply: i64 = client.call("Echo.Say", i).await.unwrap();
                (i, reply)
            }));
        }

        for handle in handles {
            let (sent, got) = handle.await.unwrap();
            assert_eq!(sent, got);
        }
    }

    #[tokio::test]
    async fn close_fails_pending_calls() {
        struct Hang;

        #[async_trait]
        impl Service for Hang {
            fn name(&self) -> &'static str {
                "Hang"
            }

            async fn call(&self, _method: &str, _params: Value) -> Result<Value, RpcError> {
                std::future::pending().await
            }
        }

        let (host_end, plugin_end) = tokio::io::duplex(4096);
        let mut registry = Registry::default();
        registry.register(Arc::new(Hang));
        let registry = Arc::new(registry);

        tokio::spawn(async move {
            let stream: BoxedStream = Box::new(plugin_end);
            let (reader, writer) = tokio::io::split(stream);
            serve_stream(registry, BufReader::new(reader), writer).await;
        });

        let client = RpcClient::new(Box::new(host_end));
        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.call::<_, Value>("Hang.Forever", json!(null)).await })
        };

        // Give the call a chance to get in flight before tearing down.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        client.close();

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(
            err,
            crate::PluginError::Call {
                detail: "connection closed".to_string()
            }
        );
    }
}

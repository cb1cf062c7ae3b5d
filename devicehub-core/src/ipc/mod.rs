//! Local method-invocation bus.
//!
//! Hub services expose named interfaces over Unix domain sockets. Frames are
//! newline-delimited JSON: requests carry `{id, interface, method, args}`,
//! responses `{id, ok, result?, error?}`. Failures are returned in-band as
//! `{ok: false, error: <code>}`; transport faults surface only when the peer
//! is unreachable.

pub mod interfaces;

use crate::{IpcError, IpcResult};

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, error, info, warn};

#[derive(Debug, Serialize, Deserialize)]
pub struct IpcRequest {
    pub id: u64,
    pub interface: String,
    pub method: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IpcResponse {
    pub id: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Async handler for one interface method. The returned error string is the
/// in-band error code.
pub type MethodHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// Registry of interfaces served on one socket
#[derive(Default)]
pub struct IpcServer {
    handlers: HashMap<(String, String), MethodHandler>,
}

impl IpcServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `interface.method`.
    pub fn register<F, Fut>(&mut self, interface: &str, method: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        let handler: MethodHandler = Arc::new(move |args| {
            Box::pin(handler(args)) as BoxFuture<'static, Result<Value, String>>
        });
        self.handlers
            .insert((interface.to_string(), method.to_string()), handler);
    }

    /// Bind the socket and serve until the task is dropped.
    pub async fn serve(self: Arc<Self>, path: &Path) -> IpcResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| IpcError::Transport(format!("Cannot create socket dir: {}", e)))?;
        }
        // A stale socket from a previous run blocks bind
        let _ = std::fs::remove_file(path);

        let listener = UnixListener::bind(path)
            .map_err(|e| IpcError::Transport(format!("Cannot bind {}: {}", path.display(), e)))?;
        info!("IPC listening on {}", path.display());

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        server.handle_connection(stream).await;
                    });
                }
                Err(e) => {
                    warn!("IPC accept failed: {}", e);
                }
            }
        }
    }

    async fn handle_connection(&self, stream: UnixStream) {
        let mut framed = Framed::new(stream, LinesCodec::new());

        while let Some(line) = framed.next().await {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    debug!("IPC connection closed: {}", e);
                    return;
                }
            };

            let response = match serde_json::from_str::<IpcRequest>(&line) {
                Ok(request) => self.dispatch(request).await,
                Err(e) => IpcResponse {
                    id: 0,
                    ok: false,
                    result: None,
                    error: Some(format!("bad_request: {}", e)),
                },
            };

            let encoded = match serde_json::to_string(&response) {
                Ok(encoded) => encoded,
                Err(e) => {
                    error!("IPC response serialization failed: {}", e);
                    continue;
                }
            };
            if framed.send(encoded).await.is_err() {
                return;
            }
        }
    }

    async fn dispatch(&self, request: IpcRequest) -> IpcResponse {
        let key = (request.interface.clone(), request.method.clone());
        let Some(handler) = self.handlers.get(&key) else {
            let known_interface = self
                .handlers
                .keys()
                .any(|(interface, _)| *interface == request.interface);
            let error = if known_interface {
                "unknown_method"
            } else {
                "unknown_interface"
            };
            return IpcResponse {
                id: request.id,
                ok: false,
                result: None,
                error: Some(error.to_string()),
            };
        };

        debug!("IPC call {}.{}", request.interface, request.method);
        match handler(request.args).await {
            Ok(result) => IpcResponse {
                id: request.id,
                ok: true,
                result: Some(result),
                error: None,
            },
            Err(error) => IpcResponse {
                id: request.id,
                ok: false,
                result: None,
                error: Some(error),
            },
        }
    }
}

/// Client side of the bus. Connects per call; the sockets are local and the
/// call pattern is low-rate request/response.
#[derive(Clone)]
pub struct IpcClient {
    path: PathBuf,
}

impl IpcClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Invoke `interface.method` and return the result value. In-band
    /// `{ok: false}` responses become `IpcError::Remote` with the error code.
    pub async fn call(&self, interface: &str, method: &str, args: Value) -> IpcResult<Value> {
        let stream = UnixStream::connect(&self.path).await.map_err(|e| {
            IpcError::Transport(format!("Cannot connect {}: {}", self.path.display(), e))
        })?;
        let mut framed = Framed::new(stream, LinesCodec::new());

        let request = IpcRequest {
            id: 1,
            interface: interface.to_string(),
            method: method.to_string(),
            args,
        };
        let encoded = serde_json::to_string(&request)
            .map_err(|e| IpcError::Decode(format!("Request encoding failed: {}", e)))?;
        framed
            .send(encoded)
            .await
            .map_err(|e| IpcError::Transport(format!("Send failed: {}", e)))?;

        let line = framed
            .next()
            .await
            .ok_or_else(|| IpcError::Transport("Connection closed before response".to_string()))?
            .map_err(|e| IpcError::Transport(format!("Receive failed: {}", e)))?;

        let response: IpcResponse = serde_json::from_str(&line)
            .map_err(|e| IpcError::Decode(format!("Response decoding failed: {}", e)))?;

        if response.ok {
            Ok(response.result.unwrap_or(Value::Null))
        } else {
            Err(IpcError::Remote(
                response.error.unwrap_or_else(|| "unknown".to_string()),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("test.sock");

        let mut server = IpcServer::new();
        server.register("Echo", "Say", |args| async move { Ok(args) });
        let server = Arc::new(server);
        let serve_path = path.clone();
        tokio::spawn(async move {
            server.serve(&serve_path).await.unwrap();
        });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let client = IpcClient::new(&path);
        let result = client
            .call("Echo", "Say", json!({"hello": "world"}))
            .await
            .unwrap();
        assert_eq!(result["hello"], "world");
    }

    #[tokio::test]
    async fn test_in_band_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("test.sock");

        let mut server = IpcServer::new();
        server.register("Echo", "Fail", |_args| async move {
            Err("not_found".to_string())
        });
        let server = Arc::new(server);
        let serve_path = path.clone();
        tokio::spawn(async move {
            server.serve(&serve_path).await.unwrap();
        });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let client = IpcClient::new(&path);

        match client.call("Echo", "Fail", Value::Null).await {
            Err(IpcError::Remote(code)) => assert_eq!(code, "not_found"),
            other => panic!("expected remote error, got {:?}", other),
        }
        match client.call("Echo", "Nope", Value::Null).await {
            Err(IpcError::Remote(code)) => assert_eq!(code, "unknown_method"),
            other => panic!("expected unknown method, got {:?}", other),
        }
        match client.call("Nope", "Nope", Value::Null).await {
            Err(IpcError::Remote(code)) => assert_eq!(code, "unknown_interface"),
            other => panic!("expected unknown interface, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_socket_is_transport_error() {
        let client = IpcClient::new("/tmp/devicehub-test-does-not-exist.sock");
        match client.call("A", "B", Value::Null).await {
            Err(IpcError::Transport(_)) => {}
            other => panic!("expected transport error, got {:?}", other),
        }
    }
}

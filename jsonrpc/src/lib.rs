//! json-rpc protocol client over a unix domain socket as described in spec:
//! https://www.jsonrpc.org/specification.
//!
//! The target engine is single-threaded for command intake so the client
//! keeps one persistent connection and serializes calls on it: one request
//! outstanding at a time, matched to its reply by a monotonically increasing
//! id. Requests and replies are framed as single newline-terminated lines.

pub mod error;

use self::error::{Error, RpcCode};
use nix::errno::Errno;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        unix::{OwnedReadHalf, OwnedWriteHalf},
        UnixStream,
    },
    sync::Mutex,
};
use tracing::{error, trace, warn};

/// Default per-call deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
/// Default number of connect attempts before the engine is declared
/// unreachable.
pub const DEFAULT_CONN_RETRIES: u32 = 3;

#[derive(Debug, Serialize, Deserialize)]
/// A JSONRPC request object
pub struct Request<'a> {
    /// The name of the RPC call
    pub method: &'a str,
    /// Parameters to the RPC call
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    /// Identifier for this Request, which must appear in the response
    pub id: u64,
    /// jsonrpc field, MUST be "2.0"
    pub jsonrpc: Option<&'a str>,
}

#[derive(Debug, Serialize, Deserialize)]
/// A JSONRPC response object
pub struct Response {
    /// A result if there is one, or null
    pub result: Option<serde_json::Value>,
    /// An error if there is one, or null
    pub error: Option<RpcError>,
    /// Identifier for this Response, which must match that of the request
    pub id: serde_json::Value,
    /// jsonrpc field, MUST be "2.0"
    pub jsonrpc: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
/// A JSONRPC error object
pub struct RpcError {
    /// The integer identifier of the error
    pub code: i32,
    /// A string describing the error
    pub message: String,
    /// Additional data specific to the error
    pub data: Option<serde_json::Value>,
}

/// One established connection to the engine socket.
struct Conn {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Conn {
    async fn open(sock_path: &str) -> Result<Self, Error> {
        let stream = UnixStream::connect(sock_path).await.map_err(|err| {
            Error::ConnectError {
                sock: sock_path.to_string(),
                err,
            }
        })?;
        let (rd, wr) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(rd),
            writer: wr,
        })
    }

    /// Send one request line and read one reply line.
    async fn roundtrip(&mut self, line: &[u8]) -> Result<String, Error> {
        self.writer.write_all(line).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        let mut reply = String::new();
        let n = self.reader.read_line(&mut reply).await?;
        if n == 0 {
            return Err(Error::IoError(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "engine closed the connection",
            )));
        }
        Ok(reply)
    }
}

/// State behind the client lock: the connection (if any) and the id counter.
/// `in_flight` marks a roundtrip that may have been abandoned mid-way (the
/// caller's future was dropped); such a connection may still deliver the
/// stale reply and must not be reused.
struct Inner {
    conn: Option<Conn>,
    next_id: u64,
    in_flight: bool,
}

/// Persistent json-rpc client for the engine socket. Cloneable handles are
/// obtained by wrapping the client in an `Arc`; the internal mutex serializes
/// all calls.
pub struct RpcClient {
    sock_path: String,
    timeout: Duration,
    conn_retries: u32,
    inner: Mutex<Inner>,
}

impl RpcClient {
    /// Create a client for the given socket path. No connection is made until
    /// the first call.
    pub fn new(
        sock_path: impl Into<String>,
        timeout: Duration,
        conn_retries: u32,
    ) -> Self {
        Self {
            sock_path: sock_path.into(),
            timeout,
            conn_retries,
            inner: Mutex::new(Inner {
                conn: None,
                next_id: 0,
                in_flight: false,
            }),
        }
    }

    /// Socket path this client talks to.
    pub fn sock_path(&self) -> &str {
        &self.sock_path
    }

    /// Eagerly establish the connection, with the configured retry budget.
    pub async fn connect(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        if inner.conn.is_none() {
            inner.conn = Some(self.reconnect().await?);
        }
        Ok(())
    }

    async fn reconnect(&self) -> Result<Conn, Error> {
        let mut last_err = None;
        for attempt in 1 ..= self.conn_retries {
            match Conn::open(&self.sock_path).await {
                Ok(conn) => return Ok(conn),
                Err(err) => {
                    warn!(
                        "connect attempt {}/{} to {} failed: {}",
                        attempt, self.conn_retries, self.sock_path, err
                    );
                    last_err = Some(err);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
        error!("engine on {} declared unreachable", self.sock_path);
        Err(last_err.unwrap_or(Error::Unreachable {
            sock: self.sock_path.clone(),
            attempts: self.conn_retries,
        }))
    }

    /// Make a json-rpc request, parse the reply and return the user data
    /// embedded in it. The reply must carry the id of this request.
    pub async fn call<A, R>(
        &self,
        method: &str,
        args: Option<A>,
    ) -> Result<R, Error>
    where
        A: Serialize,
        R: 'static + DeserializeOwned + Send,
    {
        let params = match args {
            Some(val) => Some(serde_json::to_value(val)?),
            None => None,
        };

        let mut inner = self.inner.lock().await;
        if inner.in_flight {
            // a previous call was cancelled mid-roundtrip
            inner.conn = None;
            inner.in_flight = false;
        }
        let id = inner.next_id;
        inner.next_id += 1;

        let request = Request {
            method,
            params,
            id,
            jsonrpc: Some("2.0"),
        };
        let buf = serde_json::to_vec(&request)?;
        trace!("JSON request: {}", String::from_utf8_lossy(&buf));

        // One reconnect cycle is allowed per call: a stale connection is
        // detected by the first write/read failing.
        let mut reconnected = false;
        loop {
            if inner.conn.is_none() {
                inner.conn = Some(self.reconnect().await?);
            }
            inner.in_flight = true;
            let result = {
                let conn = inner.conn.as_mut().unwrap();
                tokio::time::timeout(self.timeout, conn.roundtrip(&buf)).await
            };
            match result {
                Ok(Ok(reply)) => {
                    inner.in_flight = false;
                    return parse_reply::<R>(id, reply.as_bytes());
                }
                Ok(Err(err)) => {
                    inner.in_flight = false;
                    // A late reply on a reused connection would desync the id
                    // matching, so the connection is dropped.
                    inner.conn = None;
                    if reconnected {
                        return Err(err);
                    }
                    reconnected = true;
                }
                Err(_) => {
                    inner.in_flight = false;
                    inner.conn = None;
                    return Err(Error::Timeout {
                        method: method.to_string(),
                        timeout: self.timeout,
                    });
                }
            }
        }
    }
}

/// Parse json-rpc reply (defined by spec) and return user data embedded in
/// the reply.
fn parse_reply<T>(expected_id: u64, reply_raw: &[u8]) -> Result<T, Error>
where
    T: DeserializeOwned,
{
    trace!("JSON response: {}", String::from_utf8_lossy(reply_raw));

    let reply = serde_json::from_slice::<Response>(reply_raw)?;
    if let Some(vers) = reply.jsonrpc {
        if vers != "2.0" {
            return Err(Error::InvalidVersion);
        }
    }
    if reply.id.as_u64() != Some(expected_id) {
        return Err(Error::ReplyIdMismatch {
            expected: expected_id,
            actual: reply.id.to_string(),
        });
    }

    if let Some(err) = reply.error {
        Err(Error::RpcError {
            code: match err.code {
                -32700 => RpcCode::ParseError,
                -32600 => RpcCode::InvalidRequest,
                -32601 => RpcCode::MethodNotFound,
                -32602 => RpcCode::InvalidParams,
                -32603 => RpcCode::InternalError,
                val => {
                    if val == -(Errno::ENOENT as i32) {
                        RpcCode::NotFound
                    } else if val == -(Errno::EEXIST as i32) {
                        RpcCode::AlreadyExists
                    } else if val == -(Errno::ENOSPC as i32) {
                        RpcCode::NoSpace
                    } else {
                        error!("Unknown json-rpc error code {}", val);
                        RpcCode::InternalError
                    }
                }
            },
            msg: err.message,
        })
    } else {
        match reply.result {
            Some(result) => Ok(serde_json::from_value::<T>(result)?),
            // if there is no result fabricate null value == ()
            None => Ok(serde_json::from_value::<T>(
                serde_json::value::Value::Null,
            )?),
        }
    }
}

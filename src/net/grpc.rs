//! gRPC over HTTP/2 client transport.
//!
//! One [`GrpcChannel`] wraps one HTTP/2 connection (plaintext or rustls) driven by a
//! background connection task. Unary calls and bidirectional streams are multiplexed
//! over it; `SendRequest` handles are cloned per call so concurrent callers never
//! lock each other out.
//!
//! Messages use the standard 5-byte length-prefixed framing:
//!
//! ```text
//! ┌──────────────┬───────────────────┬──────────────────────┐
//! │ compressed:1 │ length: u32 (BE)  │ message bytes ...    │
//! └──────────────┴───────────────────┴──────────────────────┘
//! ```
//!
//! Call status travels in the `grpc-status` / `grpc-message` trailers (or headers,
//! for trailers-only responses). Servers that reject a leader-only request may name
//! the current leader in the [`LEADER_HINT_HEADER`] trailer.

use crate::core::error::{ClientError, ClientResult, GrpcCode, RpcStatus};
use crate::net::compression::parse_accept_encoding;
use crate::net::tls::SecurityContext;
use crate::net::transport::{Connector, RpcChannel, RpcStream, UnaryReply, WireMessage};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{Future, StreamExt};
use http::header::{CONTENT_TYPE, USER_AGENT};
use http::{HeaderMap, Method, Request, Response};
use http_body::Frame;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Incoming;
use hyper::client::conn::http2;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls_pki_types::ServerName;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tokio_stream::wrappers::ReceiverStream;

/// Trailer a server may use to name the current leader.
pub const LEADER_HINT_HEADER: &str = "x-leader-endpoint";

const GRPC_STATUS: &str = "grpc-status";
const GRPC_MESSAGE: &str = "grpc-message";
const GRPC_ENCODING: &str = "grpc-encoding";
const GRPC_ACCEPT_ENCODING: &str = "grpc-accept-encoding";
const GRPC_TIMEOUT: &str = "grpc-timeout";
const FRAME_HEADER_LEN: usize = 5;
const OUTBOUND_BUFFER: usize = 16;

type RequestBody = BoxBody<Bytes, Infallible>;

// ============================================================================
// Framing
// ============================================================================

/// Encode a wire message into a length-prefixed gRPC frame.
pub fn encode_grpc_frame(msg: &WireMessage) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + msg.payload.len());
    buf.put_u8(u8::from(msg.encoding.is_some()));
    buf.put_u32(msg.payload.len() as u32);
    buf.put_slice(&msg.payload);
    buf.freeze()
}

/// Split one complete frame off the front of `buf`, if one is buffered.
///
/// `encoding` is the response's `grpc-encoding`; a compressed frame without one is
/// corrupt.
pub fn decode_grpc_frame(
    buf: &mut BytesMut,
    encoding: Option<&str>,
) -> ClientResult<Option<WireMessage>> {
    if buf.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }
    let compressed = buf[0];
    let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    if buf.len() < FRAME_HEADER_LEN + len {
        return Ok(None);
    }
    buf.advance(FRAME_HEADER_LEN);
    let payload = buf.split_to(len).freeze();
    let encoding = match (compressed, encoding) {
        (0, _) => None,
        (1, Some(enc)) if enc != "identity" => Some(enc.to_string()),
        (1, _) => {
            return Err(ClientError::corrupt(
                "identity",
                "compressed frame without grpc-encoding",
            ))
        }
        (flag, _) => {
            return Err(ClientError::corrupt(
                "identity",
                format!("invalid compressed flag {}", flag),
            ))
        }
    };
    Ok(Some(WireMessage { payload, encoding }))
}

/// Format a `grpc-timeout` header value.
pub fn format_grpc_timeout(timeout: Duration) -> String {
    const MAX_DIGITS: u128 = 99_999_999;
    let millis = timeout.as_millis();
    if millis <= MAX_DIGITS {
        format!("{}m", millis.max(1))
    } else {
        format!("{}S", timeout.as_secs().min(MAX_DIGITS as u64))
    }
}

/// Extract a non-OK status from headers or trailers.
fn status_from(map: &HeaderMap) -> Option<RpcStatus> {
    let code = map
        .get(GRPC_STATUS)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i32>().ok())?;
    if code == 0 {
        return None;
    }
    let message = map
        .get(GRPC_MESSAGE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let mut status = RpcStatus::new(GrpcCode::from_i32(code), message);
    if let Some(hint) = map.get(LEADER_HINT_HEADER).and_then(|v| v.to_str().ok()) {
        status = status.with_leader_hint(hint);
    }
    Some(status)
}

fn header_str<'a>(map: &'a HeaderMap, name: &str) -> Option<&'a str> {
    map.get(name).and_then(|v| v.to_str().ok())
}

fn check_response_head(response: &Response<Incoming>) -> ClientResult<()> {
    if let Some(status) = status_from(response.headers()) {
        return Err(status.into());
    }
    if !response.status().is_success() {
        return Err(ClientError::transient(format!(
            "http status {}",
            response.status()
        )));
    }
    Ok(())
}

// ============================================================================
// Connector
// ============================================================================

/// Connector configuration.
#[derive(Debug, Clone)]
pub struct GrpcConnectorConfig {
    /// TCP + TLS + HTTP/2 handshake timeout.
    pub connect_timeout: Duration,
    /// Value sent in `grpc-accept-encoding`.
    pub accept_encoding: String,
    /// User agent string.
    pub user_agent: String,
}

impl Default for GrpcConnectorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            accept_encoding: "identity".to_string(),
            user_agent: format!("lattice-client/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Production connector: gRPC over HTTP/2.
#[derive(Debug, Clone, Default)]
pub struct GrpcConnector {
    config: GrpcConnectorConfig,
}

impl GrpcConnector {
    /// Create a connector.
    pub fn new(config: GrpcConnectorConfig) -> Self {
        Self { config }
    }

    async fn dial(&self, address: &str, security: &SecurityContext) -> ClientResult<GrpcChannel> {
        let tcp = TcpStream::connect(address)
            .await
            .map_err(|e| ClientError::unreachable(address, e.to_string()))?;
        let _ = tcp.set_nodelay(true);

        let (scheme, sender) = match &security.tls {
            Some(tls) => {
                let host = security
                    .server_name
                    .clone()
                    .unwrap_or_else(|| host_of(address).to_string());
                let server_name = ServerName::try_from(host.clone())
                    .map_err(|e| ClientError::tls(format!("invalid server name {}: {}", host, e)))?;
                let stream = TlsConnector::from(Arc::clone(tls))
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| ClientError::unreachable(address, format!("tls handshake: {}", e)))?;
                ("https", handshake(stream, address).await?)
            }
            None => ("http", handshake(tcp, address).await?),
        };

        tracing::debug!(endpoint = %address, scheme, "channel established");
        Ok(GrpcChannel {
            address: address.to_string(),
            scheme,
            sender,
            accept_encoding: self.config.accept_encoding.clone(),
            user_agent: self.config.user_agent.clone(),
        })
    }
}

#[async_trait]
impl Connector for GrpcConnector {
    async fn connect(
        &self,
        address: &str,
        security: &SecurityContext,
    ) -> ClientResult<Arc<dyn RpcChannel>> {
        let channel = tokio::time::timeout(self.config.connect_timeout, self.dial(address, security))
            .await
            .map_err(|_| ClientError::unreachable(address, "connect timed out"))??;
        Ok(Arc::new(channel))
    }
}

async fn handshake<T>(io: T, address: &str) -> ClientResult<http2::SendRequest<RequestBody>>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, connection) = http2::Builder::new(TokioExecutor::new())
        .handshake(TokioIo::new(io))
        .await
        .map_err(|e| ClientError::unreachable(address, format!("http2 handshake: {}", e)))?;
    let endpoint = address.to_string();
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::debug!(endpoint = %endpoint, error = %e, "connection closed");
        }
    });
    Ok(sender)
}

fn host_of(address: &str) -> &str {
    if let Some(rest) = address.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    address.rsplit_once(':').map_or(address, |(host, _)| host)
}

// ============================================================================
// Channel
// ============================================================================

/// A gRPC channel to one endpoint.
pub struct GrpcChannel {
    address: String,
    scheme: &'static str,
    sender: http2::SendRequest<RequestBody>,
    accept_encoding: String,
    user_agent: String,
}

impl GrpcChannel {
    fn request(
        &self,
        path: &str,
        encoding: Option<&str>,
        timeout: Option<Duration>,
        body: RequestBody,
    ) -> ClientResult<Request<RequestBody>> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(format!("{}://{}{}", self.scheme, self.address, path))
            .header(CONTENT_TYPE, "application/grpc")
            .header("te", "trailers")
            .header(USER_AGENT, self.user_agent.as_str())
            .header(GRPC_ACCEPT_ENCODING, self.accept_encoding.as_str());
        if let Some(enc) = encoding {
            builder = builder.header(GRPC_ENCODING, enc);
        }
        if let Some(timeout) = timeout {
            builder = builder.header(GRPC_TIMEOUT, format_grpc_timeout(timeout));
        }
        builder
            .body(body)
            .map_err(|e| ClientError::invalid_request(format!("bad request for {}: {}", path, e)))
    }

    async fn ready_sender(&self) -> ClientResult<http2::SendRequest<RequestBody>> {
        let mut sender = self.sender.clone();
        sender
            .ready()
            .await
            .map_err(|e| ClientError::unreachable(&self.address, e.to_string()))?;
        Ok(sender)
    }
}

#[async_trait]
impl RpcChannel for GrpcChannel {
    async fn unary(
        &self,
        path: &'static str,
        request: WireMessage,
        timeout: Option<Duration>,
    ) -> ClientResult<UnaryReply> {
        let mut sender = self.ready_sender().await?;
        let body = Full::new(encode_grpc_frame(&request)).boxed();
        let req = self.request(path, request.encoding.as_deref(), timeout, body)?;

        let exchange = async move {
            let response = sender
                .send_request(req)
                .await
                .map_err(|e| ClientError::transient(e.to_string()))?;
            check_response_head(&response)?;
            let (parts, body) = response.into_parts();
            let encoding = header_str(&parts.headers, GRPC_ENCODING).map(str::to_string);
            let accept_encoding = header_str(&parts.headers, GRPC_ACCEPT_ENCODING)
                .map(parse_accept_encoding)
                .unwrap_or_default();

            let collected = body
                .collect()
                .await
                .map_err(|e| ClientError::transient(e.to_string()))?;
            if let Some(status) = collected.trailers().and_then(status_from) {
                return Err(status.into());
            }
            let mut buf = BytesMut::from(&collected.to_bytes()[..]);
            let message = decode_grpc_frame(&mut buf, encoding.as_deref())?
                .ok_or_else(|| ClientError::transient("response ended without a message"))?;
            Ok(UnaryReply {
                message,
                accept_encoding,
            })
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, exchange)
                .await
                .map_err(|_| ClientError::transient(format!("{} timed out", path)))?,
            None => exchange.await,
        }
    }

    async fn open_stream(
        &self,
        path: &'static str,
        encoding: Option<&str>,
    ) -> ClientResult<RpcStream> {
        let mut sender = self.ready_sender().await?;
        let (outbound, rx) = mpsc::channel::<WireMessage>(OUTBOUND_BUFFER);
        let declared = encoding.map(str::to_string);
        let frames = ReceiverStream::new(rx).map(move |msg| {
            if msg.encoding != declared {
                tracing::warn!(
                    path,
                    declared = ?declared,
                    encoding = ?msg.encoding,
                    "stream message encoding differs from the stream's grpc-encoding"
                );
            }
            Ok::<_, Infallible>(Frame::data(encode_grpc_frame(&msg)))
        });
        let req = self.request(path, encoding, None, BodyExt::boxed(StreamBody::new(frames)))?;

        // The request is dispatched to the connection task here; the returned future
        // only resolves the response head.
        let response: ResponseFuture = Box::pin(sender.send_request(req));
        let inbound = futures::stream::unfold(Inbound::Awaiting(response), next_inbound).boxed();
        Ok(RpcStream { outbound, inbound })
    }

    fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

type ResponseFuture =
    Pin<Box<dyn Future<Output = Result<Response<Incoming>, hyper::Error>> + Send>>;

enum Inbound {
    Awaiting(ResponseFuture),
    Reading {
        body: Incoming,
        buf: BytesMut,
        encoding: Option<String>,
    },
    Done,
}

async fn next_inbound(mut state: Inbound) -> Option<(ClientResult<WireMessage>, Inbound)> {
    loop {
        state = match state {
            Inbound::Done => return None,
            Inbound::Awaiting(response) => match response.await {
                Err(e) => return Some((Err(ClientError::transient(e.to_string())), Inbound::Done)),
                Ok(response) => {
                    if let Err(e) = check_response_head(&response) {
                        return Some((Err(e), Inbound::Done));
                    }
                    let (parts, body) = response.into_parts();
                    Inbound::Reading {
                        body,
                        buf: BytesMut::new(),
                        encoding: header_str(&parts.headers, GRPC_ENCODING).map(str::to_string),
                    }
                }
            },
            Inbound::Reading {
                mut body,
                mut buf,
                encoding,
            } => {
                match decode_grpc_frame(&mut buf, encoding.as_deref()) {
                    Ok(Some(msg)) => {
                        return Some((Ok(msg), Inbound::Reading { body, buf, encoding }))
                    }
                    Ok(None) => {}
                    Err(e) => return Some((Err(e), Inbound::Done)),
                }
                match body.frame().await {
                    None => {
                        let err = ClientError::transient("stream closed without status");
                        return Some((Err(err), Inbound::Done));
                    }
                    Some(Err(e)) => {
                        return Some((Err(ClientError::transient(e.to_string())), Inbound::Done))
                    }
                    Some(Ok(frame)) => match frame.into_data() {
                        Ok(data) => {
                            buf.extend_from_slice(&data);
                            Inbound::Reading { body, buf, encoding }
                        }
                        Err(frame) => {
                            let status = frame.trailers_ref().and_then(status_from);
                            return match status {
                                Some(status) => Some((Err(status.into()), Inbound::Done)),
                                None => None,
                            };
                        }
                    },
                }
            }
        };
    }
}

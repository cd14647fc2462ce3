//! Transport seam between the client core and the wire.
//!
//! The client never talks to sockets directly. It asks a [`Connector`] for an
//! [`RpcChannel`] to one address and issues unary calls or opens bidirectional
//! streams on it. [`crate::net::grpc::GrpcConnector`] is the production
//! implementation; tests plug in scripted channels.
//!
//! Payloads cross this seam as [`WireMessage`]s: already protobuf-encoded and,
//! when a codec was negotiated, already compressed.

use crate::core::error::{ClientError, ClientResult};
use crate::net::compression::{CodecRegistry, Negotiation};
use crate::net::tls::SecurityContext;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use prost::Message;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// One encoded message on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    /// Protobuf bytes, possibly compressed.
    pub payload: Bytes,
    /// Codec the payload is compressed with; `None` means uncompressed.
    pub encoding: Option<String>,
}

impl WireMessage {
    /// An uncompressed message.
    pub fn plain(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            encoding: None,
        }
    }

    /// Encode a protobuf message, compressing with `codec` when given.
    pub fn encode<M: Message>(
        msg: &M,
        codec: Option<&str>,
        registry: &CodecRegistry,
    ) -> ClientResult<Self> {
        let raw = msg.encode_to_vec();
        match codec {
            Some(id) => Ok(Self {
                payload: registry.compress(id, &raw)?,
                encoding: Some(id.to_string()),
            }),
            None => Ok(Self::plain(raw)),
        }
    }

    /// Decompress (if needed) and decode into a protobuf message.
    ///
    /// Both decompression and decode failures are payload corruption.
    pub fn decode<M: Message + Default>(&self, registry: &CodecRegistry) -> ClientResult<M> {
        let (codec, raw) = match &self.encoding {
            Some(id) => (id.as_str(), registry.decompress(id, &self.payload)?),
            None => ("identity", self.payload.clone()),
        };
        M::decode(raw).map_err(|e| ClientError::corrupt(codec, format!("decode error: {}", e)))
    }
}

/// Reply to a unary call.
#[derive(Debug, Clone)]
pub struct UnaryReply {
    /// Response message.
    pub message: WireMessage,
    /// Encodings the server advertised in `grpc-accept-encoding`.
    pub accept_encoding: Vec<String>,
}

/// An open bidirectional stream.
///
/// Dropping both halves closes the stream.
pub struct RpcStream {
    /// Requests to the server.
    pub outbound: mpsc::Sender<WireMessage>,
    /// Responses from the server; ends when the server closes the stream.
    pub inbound: BoxStream<'static, ClientResult<WireMessage>>,
}

impl std::fmt::Debug for RpcStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcStream")
            .field("outbound_closed", &self.outbound.is_closed())
            .finish()
    }
}

/// A live connection to one endpoint.
///
/// Implementations must be safe to share across concurrent callers.
#[async_trait]
pub trait RpcChannel: Send + Sync {
    /// Issue a unary call.
    ///
    /// Failures before the request was handed to the connection must be reported
    /// as [`ClientError::Unreachable`]; failures after that as
    /// [`ClientError::Transient`] or a mapped server status.
    async fn unary(
        &self,
        path: &'static str,
        request: WireMessage,
        timeout: Option<Duration>,
    ) -> ClientResult<UnaryReply>;

    /// Open a bidirectional stream.
    ///
    /// `encoding` is declared once for the whole stream; every outbound message
    /// must be compressed with it, or uncompressed when it is `None`.
    async fn open_stream(
        &self,
        path: &'static str,
        encoding: Option<&str>,
    ) -> ClientResult<RpcStream>;

    /// Whether the underlying connection is known to be closed.
    fn is_closed(&self) -> bool {
        false
    }
}

/// Creates channels to endpoint addresses.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `address` using `security`.
    async fn connect(
        &self,
        address: &str,
        security: &SecurityContext,
    ) -> ClientResult<Arc<dyn RpcChannel>>;
}

/// A channel plus the state bound to its lifetime.
///
/// Handles are immutable once built; a failed or rotated channel is replaced by a
/// new handle, never mutated.
#[derive(Clone)]
pub struct ChannelHandle {
    channel: Arc<dyn RpcChannel>,
    generation: u64,
    negotiation: Arc<Negotiation>,
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("generation", &self.generation)
            .field("negotiation", &self.negotiation)
            .finish()
    }
}

impl ChannelHandle {
    /// Wrap a freshly connected channel.
    pub fn new(channel: Arc<dyn RpcChannel>, generation: u64) -> Self {
        Self {
            channel,
            generation,
            negotiation: Arc::new(Negotiation::new()),
        }
    }

    /// Security generation the channel was built under.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Compression negotiation state of this channel.
    pub fn negotiation(&self) -> &Negotiation {
        &self.negotiation
    }

    /// The underlying channel.
    pub fn channel(&self) -> &Arc<dyn RpcChannel> {
        &self.channel
    }

    /// Issue a unary call with compression negotiation.
    ///
    /// Until the server has advertised its encodings the request goes out
    /// uncompressed; the first reply settles negotiation for the channel.
    pub async fn call<Req, Resp>(
        &self,
        path: &'static str,
        request: &Req,
        registry: &CodecRegistry,
        timeout: Option<Duration>,
    ) -> ClientResult<Resp>
    where
        Req: Message,
        Resp: Message + Default,
    {
        let codec = self.negotiation.selected().map(str::to_string);
        let wire = WireMessage::encode(request, codec.as_deref(), registry)?;
        let reply = self.channel.unary(path, wire, timeout).await?;
        if self.negotiation.settled().is_none() && !reply.accept_encoding.is_empty() {
            self.negotiation.settle(registry, reply.accept_encoding.clone());
        }
        reply.message.decode(registry)
    }
}

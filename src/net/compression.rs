//! Payload compression codecs and negotiation.
//!
//! Codecs are registered explicitly at client construction; there is no discovery.
//! Each registration carries a priority. When a server advertises the encodings it
//! accepts (`grpc-accept-encoding`), [`CodecRegistry::select`] picks the
//! highest-priority codec both sides know. `identity` always means uncompressed.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       CodecRegistry                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │  "snappy" prio 2 ─► SnappyCodec   (framed format)            │
//! │  "gzip"   prio 1 ─► GzipCodec     (feature = "gzip")         │
//! │  "identity"      ─► no compression, never registered         │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use crate::core::error::{ClientError, ClientResult};
use bytes::Bytes;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, OnceLock};

/// Encoding name meaning "no compression".
pub const IDENTITY: &str = "identity";

/// Compresses outbound payloads.
pub trait Compressor: Send + Sync {
    fn compress(&self, input: &[u8]) -> std::io::Result<Vec<u8>>;
}

/// Decompresses inbound payloads.
pub trait Decompressor: Send + Sync {
    fn decompress(&self, input: &[u8]) -> std::io::Result<Vec<u8>>;
}

/// Snappy in the framed stream format.
#[derive(Debug, Default, Clone, Copy)]
pub struct SnappyCodec;

impl Compressor for SnappyCodec {
    fn compress(&self, input: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut encoder = snap::write::FrameEncoder::new(Vec::with_capacity(input.len() / 2));
        encoder.write_all(input)?;
        encoder
            .into_inner()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    }
}

impl Decompressor for SnappyCodec {
    fn decompress(&self, input: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(input.len() * 2);
        snap::read::FrameDecoder::new(input).read_to_end(&mut out)?;
        Ok(out)
    }
}

/// Gzip via flate2.
#[cfg(feature = "gzip")]
#[derive(Debug, Default, Clone, Copy)]
pub struct GzipCodec;

#[cfg(feature = "gzip")]
impl Compressor for GzipCodec {
    fn compress(&self, input: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        encoder.write_all(input)?;
        encoder.finish()
    }
}

#[cfg(feature = "gzip")]
impl Decompressor for GzipCodec {
    fn decompress(&self, input: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::new();
        flate2::read::GzDecoder::new(input).read_to_end(&mut out)?;
        Ok(out)
    }
}

#[derive(Clone)]
struct CodecEntry {
    priority: u32,
    compressor: Arc<dyn Compressor>,
    decompressor: Arc<dyn Decompressor>,
}

/// Registry of named compression codecs.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    codecs: HashMap<String, CodecEntry>,
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("codecs", &self.ids_by_priority())
            .finish()
    }
}

impl CodecRegistry {
    /// Create an empty registry (every call goes uncompressed).
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in codecs, prioritized in `order` (first = highest).
    ///
    /// Unknown names in `order` are rejected.
    pub fn with_builtin(order: &[String]) -> ClientResult<Self> {
        let mut registry = Self::new();
        let count = order.len() as u32;
        for (idx, id) in order.iter().enumerate() {
            let priority = count - idx as u32;
            match id.as_str() {
                "snappy" => registry.register(id, priority, SnappyCodec, SnappyCodec),
                #[cfg(feature = "gzip")]
                "gzip" => registry.register(id, priority, GzipCodec, GzipCodec),
                IDENTITY => {}
                other => {
                    return Err(ClientError::config(format!(
                        "unknown compression codec: {}",
                        other
                    )))
                }
            }
        }
        Ok(registry)
    }

    /// Register a codec. Re-registering an id replaces the previous entry.
    pub fn register<C, D>(&mut self, id: &str, priority: u32, compressor: C, decompressor: D)
    where
        C: Compressor + 'static,
        D: Decompressor + 'static,
    {
        self.codecs.insert(
            id.to_string(),
            CodecEntry {
                priority,
                compressor: Arc::new(compressor),
                decompressor: Arc::new(decompressor),
            },
        );
    }

    /// Check whether a codec id is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.codecs.contains_key(id)
    }

    /// Registered ids, highest priority first (ties broken by name).
    pub fn ids_by_priority(&self) -> Vec<String> {
        let mut ids: Vec<(&String, u32)> =
            self.codecs.iter().map(|(id, e)| (id, e.priority)).collect();
        ids.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        ids.into_iter().map(|(id, _)| id.clone()).collect()
    }

    /// Value for an outbound `grpc-accept-encoding` header.
    pub fn accept_encoding_header(&self) -> String {
        let mut ids = self.ids_by_priority();
        ids.push(IDENTITY.to_string());
        ids.join(",")
    }

    /// Pick the highest-priority registered codec the server also advertises.
    ///
    /// Returns `None` when nothing matches, which means "send uncompressed".
    pub fn select<S: AsRef<str>>(&self, advertised: &[S]) -> Option<String> {
        self.ids_by_priority()
            .into_iter()
            .find(|id| advertised.iter().any(|a| a.as_ref().trim() == id))
    }

    /// Compress with the named codec.
    pub fn compress(&self, id: &str, payload: &[u8]) -> ClientResult<Bytes> {
        let entry = self
            .codecs
            .get(id)
            .ok_or_else(|| ClientError::config(format!("codec {} not registered", id)))?;
        entry
            .compressor
            .compress(payload)
            .map(Bytes::from)
            .map_err(|e| ClientError::invalid_request(format!("{} compression failed: {}", id, e)))
    }

    /// Decompress with the named codec. Any failure is reported as corruption.
    pub fn decompress(&self, id: &str, payload: &[u8]) -> ClientResult<Bytes> {
        if id == IDENTITY {
            return Ok(Bytes::copy_from_slice(payload));
        }
        let entry = self
            .codecs
            .get(id)
            .ok_or_else(|| ClientError::corrupt(id, "response uses an unregistered encoding"))?;
        entry
            .decompressor
            .decompress(payload)
            .map(Bytes::from)
            .map_err(|e| ClientError::corrupt(id, e.to_string()))
    }
}

/// Parse a comma-separated `grpc-accept-encoding` value.
pub fn parse_accept_encoding(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Compression negotiation state for one channel.
///
/// Established from the first server reply that advertises its encodings and
/// immutable for the rest of the channel's life.
#[derive(Debug, Default)]
pub struct Negotiation {
    state: OnceLock<NegotiatedCodec>,
}

/// Result of negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedCodec {
    /// Encodings the server advertised.
    pub advertised: Vec<String>,
    /// Selected codec, or `None` for identity.
    pub selected: Option<String>,
}

impl Negotiation {
    /// Create unsettled negotiation state.
    pub fn new() -> Self {
        Self::default()
    }

    /// The selected codec, if negotiation has completed and picked one.
    pub fn selected(&self) -> Option<&str> {
        self.state.get().and_then(|n| n.selected.as_deref())
    }

    /// The settled negotiation, if any.
    pub fn settled(&self) -> Option<&NegotiatedCodec> {
        self.state.get()
    }

    /// Settle negotiation from a server advertisement. Later calls are ignored.
    pub fn settle(&self, registry: &CodecRegistry, advertised: Vec<String>) -> &NegotiatedCodec {
        self.state.get_or_init(|| {
            let selected = registry.select(&advertised);
            tracing::debug!(?advertised, ?selected, "compression negotiated");
            NegotiatedCodec {
                advertised,
                selected,
            }
        })
    }
}

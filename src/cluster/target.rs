//! Target string parsing.
//!
//! Accepted forms:
//!
//! - `ip:///10.0.0.1:2379,10.0.0.2`: static address list
//! - `http://kv.internal:2379` / `https://kv.internal`: single host, scheme picks TLS
//! - `10.0.0.1:2379,10.0.0.2:2379`: bare list
//!
//! Addresses without a port get [`DEFAULT_PORT`].

use crate::core::error::{ClientError, ClientResult};

/// Port used when a target address omits one.
pub const DEFAULT_PORT: u16 = 8443;

/// A parsed target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// `host:port` addresses.
    pub addresses: Vec<String>,
    /// `Some(true)` for `https`, `Some(false)` for `http`, `None` when the scheme
    /// does not say.
    pub tls: Option<bool>,
}

impl Target {
    /// Parse a target string.
    pub fn parse(target: &str) -> ClientResult<Self> {
        let target = target.trim();
        let (list, tls) = if let Some(rest) = target.strip_prefix("ip:///") {
            (rest, None)
        } else if let Some(rest) = target.strip_prefix("https://") {
            (rest, Some(true))
        } else if let Some(rest) = target.strip_prefix("http://") {
            (rest, Some(false))
        } else if let Some((scheme, _)) = target.split_once("://") {
            return Err(ClientError::config(format!(
                "unsupported target scheme: {}",
                scheme
            )));
        } else {
            (target, None)
        };

        let addresses = list
            .trim_end_matches('/')
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(with_default_port)
            .collect::<ClientResult<Vec<_>>>()?;
        if addresses.is_empty() {
            return Err(ClientError::config(format!("target has no addresses: {}", target)));
        }
        if tls.is_some() && addresses.len() > 1 {
            return Err(ClientError::config(
                "http(s) targets name a single host; use ip:/// for a list",
            ));
        }
        Ok(Self { addresses, tls })
    }
}

/// Append the default port when `address` has none.
pub fn with_default_port(address: &str) -> ClientResult<String> {
    if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| ClientError::config(format!("malformed address: {}", address)))?;
        return match tail.strip_prefix(':') {
            Some(port) => Ok(format!("[{}]:{}", host, parse_port(address, port)?)),
            None if tail.is_empty() => Ok(format!("[{}]:{}", host, DEFAULT_PORT)),
            None => Err(ClientError::config(format!("malformed address: {}", address))),
        };
    }
    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            Ok(format!("{}:{}", host, parse_port(address, port)?))
        }
        Some(_) => Err(ClientError::config(format!("missing host: {}", address))),
        None => Ok(format!("{}:{}", address, DEFAULT_PORT)),
    }
}

fn parse_port(address: &str, port: &str) -> ClientResult<u16> {
    port.parse::<u16>()
        .map_err(|_| ClientError::config(format!("invalid port in {}", address)))
}

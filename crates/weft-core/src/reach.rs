//! Hop-by-hop resolution of symbolic destinations.
//!
//! A destination like `7.42.archive` names a numeric route prefix followed
//! by symbolic labels. Each iteration queries the server behind the numeric
//! prefix, checks that at least one of its possession-proofed keys is in the
//! trusted root set, optionally adopts a key the server vouches for, and
//! follows the hostname the server suggests. The loop ends when no named
//! labels remain, or fails after `max_hops`.
//!
//! Transport is abstracted behind [`HopDriver`]: one probe round against a
//! numeric destination, however the caller runs it (a transient tunnel over
//! a station in practice).

use crate::codec::{self, CodecError};
use crate::meta::{keys, MetaMap};
use thiserror::Error;
use tracing::{debug, trace};
use weft_crypto::constant_time::ct_eq;

/// One label of a symbolic hostname.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostLabel {
    /// Routable numeric address segment
    Numeric(u64),
    /// Symbolic name resolved by an intermediate server
    Named(String),
}

/// A dotted hostname: numeric route prefix, then symbolic labels.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Hostname {
    labels: Vec<HostLabel>,
}

impl Hostname {
    /// Build from labels.
    #[must_use]
    pub fn new(labels: Vec<HostLabel>) -> Self {
        Self { labels }
    }

    /// Parse a dotted string; all-digit labels become numeric.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let labels = text
            .split('.')
            .filter(|part| !part.is_empty())
            .map(|part| match part.parse::<u64>() {
                Ok(value) => HostLabel::Numeric(value),
                Err(_) => HostLabel::Named(part.to_string()),
            })
            .collect();
        Self { labels }
    }

    /// Labels in order.
    #[must_use]
    pub fn labels(&self) -> &[HostLabel] {
        &self.labels
    }

    /// Whether any symbolic label remains.
    #[must_use]
    pub fn includes_names(&self) -> bool {
        self.labels
            .iter()
            .any(|label| matches!(label, HostLabel::Named(_)))
    }

    /// The numeric prefix before the first named label.
    #[must_use]
    pub fn before_named(&self) -> Vec<u64> {
        self.labels
            .iter()
            .map_while(|label| match label {
                HostLabel::Numeric(value) => Some(*value),
                HostLabel::Named(_) => None,
            })
            .collect()
    }

    /// Fully numeric form, if no names remain.
    #[must_use]
    pub fn as_numeric(&self) -> Option<Vec<u64>> {
        if self.includes_names() {
            return None;
        }
        Some(self.before_named())
    }
}

impl std::fmt::Display for Hostname {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (idx, label) in self.labels.iter().enumerate() {
            if idx > 0 {
                write!(f, ".")?;
            }
            match label {
                HostLabel::Numeric(value) => write!(f, "{value}")?,
                HostLabel::Named(name) => write!(f, "{name}")?,
            }
        }
        Ok(())
    }
}

/// Encode a target/source numeric hostname pair for metadata key 3:
/// `VarLong(|source|)`, then target labels, then source labels.
#[must_use]
pub fn encode_target_source(target: &[u64], source: &[u64]) -> Vec<u8> {
    let mut out = Vec::new();
    codec::write_var_long(&mut out, source.len() as u64);
    for value in target.iter().chain(source.iter()) {
        codec::write_var_long(&mut out, *value);
    }
    out
}

/// Decode a target/source pair: greedily read every label, then split at
/// `len - |source|`.
///
/// # Errors
///
/// Propagates VarLong errors from the leading source length.
pub fn decode_target_source(data: &[u8]) -> Result<(Vec<u64>, Vec<u64>), CodecError> {
    let (source_len, mut at) = codec::read_var_long(data, 0)?;
    let source_len = usize::try_from(source_len).map_err(|_| CodecError::LengthOverrun)?;

    let mut values = Vec::new();
    while at < data.len() {
        let Ok((value, n)) = codec::read_var_long(data, at) else {
            break;
        };
        values.push(value);
        at += n;
    }

    let target_len = values.len().saturating_sub(source_len);
    let source = values.split_off(target_len);
    Ok((values, source))
}

/// Resolution failures.
#[derive(Debug, Error)]
pub enum ReachError {
    /// No hop produced a fully numeric destination within the budget
    #[error("max hops exceeded")]
    MaxHopsExceeded,

    /// A hop proved no key from the trusted root set
    #[error("untrusted hop: no proofed key matches a trusted root")]
    UntrustedHop,

    /// A named destination with no route to a resolving server
    #[error("no route: destination has names but no numeric prefix or default server")]
    NoRoute,

    /// The transport driver failed
    #[error("hop driver failed: {0}")]
    Driver(String),
}

/// What one probe round against an intermediate server returned.
#[derive(Debug, Clone, Default)]
pub struct HopReply {
    /// The peer's metadata (hostname suggestion, vouched key, ...)
    pub meta: MetaMap,
    /// Static keys the peer proved possession of
    pub proofed: Vec<[u8; 32]>,
}

/// Executes one probe round against a numeric destination.
pub trait HopDriver {
    /// Open a transient session to `destination`, send `request_meta`,
    /// collect the peer's reply, disconnect.
    ///
    /// # Errors
    ///
    /// Returns [`ReachError`] when the hop cannot be queried.
    fn query(&mut self, destination: &[u64], request_meta: &MetaMap) -> Result<HopReply, ReachError>;
}

/// The iterative resolver.
pub struct Reach {
    /// Our own numeric address, included in every hop request
    pub source: Vec<u64>,
    /// The destination being resolved; rewritten as hops answer
    pub destination: Hostname,
    /// Trusted root public keys; hops must prove one, and may extend the set
    pub root_public_keys: Vec<[u8; 32]>,
    /// Proofed keys returned by the most recent hop
    pub last_proofed: Vec<[u8; 32]>,
    /// Fallback resolvers for destinations with no numeric prefix
    pub default_servers: Vec<Vec<u64>>,
    /// Iteration budget
    pub max_hops: usize,
}

impl Reach {
    /// Create a resolver with the default hop budget.
    #[must_use]
    pub fn new(source: Vec<u64>, destination: Hostname, root_public_keys: Vec<[u8; 32]>) -> Self {
        Self {
            source,
            destination,
            root_public_keys,
            last_proofed: Vec::new(),
            default_servers: Vec::new(),
            max_hops: 50,
        }
    }

    /// Resolve to a fully numeric destination.
    ///
    /// # Errors
    ///
    /// [`ReachError::UntrustedHop`] when a hop proves no trusted key,
    /// [`ReachError::NoRoute`] when no server can be addressed,
    /// [`ReachError::MaxHopsExceeded`] when the budget runs out.
    pub fn run(&mut self, driver: &mut dyn HopDriver) -> Result<Vec<u64>, ReachError> {
        for hop in 0..self.max_hops {
            if let Some(numeric) = self.destination.as_numeric() {
                debug!(hop, "destination fully resolved");
                return Ok(numeric);
            }

            let prefix = self.destination.before_named();
            let next = if prefix.is_empty() {
                if self.default_servers.is_empty() {
                    return Err(ReachError::NoRoute);
                }
                self.default_servers[hop % self.default_servers.len()].clone()
            } else {
                prefix
            };

            let mut request_meta = MetaMap::new();
            request_meta.insert(
                keys::NUMERICAL_HOSTNAME_TARGET_SOURCE,
                encode_target_source(&next, &self.source),
            );
            request_meta.insert(
                keys::HOSTNAME,
                self.destination.to_string().into_bytes(),
            );

            let reply = driver.query(&next, &request_meta)?;

            let trusted = reply.proofed.iter().any(|proofed| {
                self.root_public_keys
                    .iter()
                    .any(|root| ct_eq(proofed, root))
            });
            if !trusted {
                return Err(ReachError::UntrustedHop);
            }

            if let Some(vouched) = reply.meta.get(&keys::PUBLIC_KEY) {
                if vouched.len() == 32 {
                    let mut key = [0u8; 32];
                    key.copy_from_slice(vouched);
                    if !self.root_public_keys.iter().any(|root| ct_eq(root, &key)) {
                        trace!("adopting vouched public key");
                        self.root_public_keys.push(key);
                    }
                }
            }

            self.last_proofed = reply.proofed;

            if let Some(suggested) = reply.meta.get(&keys::HOSTNAME) {
                if let Ok(text) = std::str::from_utf8(suggested) {
                    if !text.is_empty() {
                        self.destination = Hostname::parse(text);
                    }
                }
            }
        }
        Err(ReachError::MaxHopsExceeded)
    }
}

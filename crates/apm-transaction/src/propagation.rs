//! W3C Trace Context codec for distributed tracing tokens.
//!
//! A transaction hands its outgoing token to downstream services, which feed
//! it back into `start_transaction` to open a causally linked child.
//!
//! # Format
//!
//! ```text
//! traceparent: 00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01
//!              |  |                                |                |
//!              |  trace-id (128-bit)               parent-id        flags
//!              version                             (64-bit)
//! ```
//!
//! Decoding never panics. A malformed token yields a `PropagationError`,
//! which callers treat as "no incoming context".

use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

/// HTTP header carrying the W3C trace parent.
pub const TRACEPARENT_HEADER: &str = "traceparent";

/// The only version this codec emits.
pub const SUPPORTED_VERSION: u8 = 0x00;

/// Version reserved as invalid by the W3C specification.
const INVALID_VERSION: u8 = 0xff;

/// Trace flag bit marking the trace as sampled.
pub const FLAG_SAMPLED: u8 = 0x01;

lazy_static! {
    /// `version-traceId-parentId-flags[-future fields]`
    static ref TRACEPARENT_REGEX: Regex =
        Regex::new(r"(?i)^([a-f0-9]{2})-([a-f0-9]{32})-([a-f0-9]{16})-([a-f0-9]{2})(-.*)?$")
            .expect("failed creating regex");
}

/// Errors raised while decoding a tracing token.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PropagationError {
    #[error("tracing token is empty")]
    Empty,

    #[error("malformed traceparent: {0}")]
    Malformed(String),

    #[error("unsupported traceparent version: {0:02x}")]
    UnsupportedVersion(u8),

    #[error("traceparent trace-id must not be all zeros")]
    InvalidTraceId,

    #[error("traceparent parent-id must not be all zeros")]
    InvalidParentId,
}

/// Decoded `traceparent` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceParent {
    pub version: u8,
    pub trace_id: u128,
    pub parent_id: u64,
    pub flags: u8,
}

impl TraceParent {
    /// Create a version-00 trace parent.
    pub fn new(trace_id: u128, parent_id: u64, sampled: bool) -> Self {
        Self {
            version: SUPPORTED_VERSION,
            trace_id,
            parent_id,
            flags: if sampled { FLAG_SAMPLED } else { 0 },
        }
    }

    /// Same trace, new parent. Used when a transaction hands its own id downstream.
    pub fn child(&self, parent_id: u64) -> Self {
        Self {
            version: SUPPORTED_VERSION,
            trace_id: self.trace_id,
            parent_id,
            flags: self.flags,
        }
    }

    pub fn is_sampled(&self) -> bool {
        self.flags & FLAG_SAMPLED == FLAG_SAMPLED
    }

    /// Hex form of the trace id, as it appears on the wire.
    pub fn trace_id_hex(&self) -> String {
        format!("{:032x}", self.trace_id)
    }
}

impl FromStr for TraceParent {
    type Err = PropagationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim();
        if token.is_empty() {
            return Err(PropagationError::Empty);
        }

        let caps = TRACEPARENT_REGEX
            .captures(token)
            .ok_or_else(|| PropagationError::Malformed(token.to_string()))?;

        let field = |i: usize| caps.get(i).map(|m| m.as_str()).unwrap_or_default();
        let malformed = || PropagationError::Malformed(token.to_string());

        let version = u8::from_str_radix(field(1), 16).map_err(|_| malformed())?;
        if version == INVALID_VERSION {
            return Err(PropagationError::UnsupportedVersion(version));
        }
        // Version 00 has exactly four fields; later versions may append more.
        if version == SUPPORTED_VERSION && caps.get(5).is_some() {
            return Err(malformed());
        }

        let trace_id = u128::from_str_radix(field(2), 16).map_err(|_| malformed())?;
        if trace_id == 0 {
            return Err(PropagationError::InvalidTraceId);
        }

        let parent_id = u64::from_str_radix(field(3), 16).map_err(|_| malformed())?;
        if parent_id == 0 {
            return Err(PropagationError::InvalidParentId);
        }

        let flags = u8::from_str_radix(field(4), 16).map_err(|_| malformed())?;

        Ok(Self {
            version,
            trace_id,
            parent_id,
            flags,
        })
    }
}

impl fmt::Display for TraceParent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}-{:032x}-{:016x}-{:02x}",
            SUPPORTED_VERSION, self.trace_id, self.parent_id, self.flags
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

    #[test]
    fn test_parse_valid_traceparent() {
        let tp: TraceParent = SAMPLE.parse().unwrap();
        assert_eq!(tp.version, 0);
        assert_eq!(tp.trace_id, 0x4bf92f3577b34da6a3ce929d0e0e4736);
        assert_eq!(tp.parent_id, 0x00f067aa0ba902b7);
        assert!(tp.is_sampled());
        assert_eq!(tp.to_string(), SAMPLE);
    }

    #[test]
    fn test_parse_is_case_insensitive_and_emits_lowercase() {
        let tp: TraceParent = SAMPLE.to_uppercase().parse().unwrap();
        assert_eq!(tp.to_string(), SAMPLE);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!("".parse::<TraceParent>(), Err(PropagationError::Empty));
        assert_eq!("   ".parse::<TraceParent>(), Err(PropagationError::Empty));
        assert!(matches!(
            "not-a-traceparent".parse::<TraceParent>(),
            Err(PropagationError::Malformed(_))
        ));
        assert!(matches!(
            "00-4bf92f3577b34da6a3ce929d0e0e473-00f067aa0ba902b7-01".parse::<TraceParent>(),
            Err(PropagationError::Malformed(_))
        ));
    }

    #[test]
    fn test_parse_rejects_invalid_ids_and_versions() {
        assert_eq!(
            "00-00000000000000000000000000000000-00f067aa0ba902b7-01".parse::<TraceParent>(),
            Err(PropagationError::InvalidTraceId)
        );
        assert_eq!(
            "00-4bf92f3577b34da6a3ce929d0e0e4736-0000000000000000-01".parse::<TraceParent>(),
            Err(PropagationError::InvalidParentId)
        );
        assert_eq!(
            "ff-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01".parse::<TraceParent>(),
            Err(PropagationError::UnsupportedVersion(0xff))
        );
    }

    #[test]
    fn test_future_version_may_carry_extra_fields() {
        let tp: TraceParent = "01-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-00-extra"
            .parse()
            .unwrap();
        assert_eq!(tp.version, 1);
        assert!(!tp.is_sampled());

        assert!(matches!(
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01-extra".parse::<TraceParent>(),
            Err(PropagationError::Malformed(_))
        ));
    }

    #[test]
    fn test_child_keeps_trace_and_flags() {
        let parent: TraceParent = SAMPLE.parse().unwrap();
        let child = parent.child(42);
        assert_eq!(child.trace_id, parent.trace_id);
        assert_eq!(child.parent_id, 42);
        assert!(child.is_sampled());
        assert_eq!(child.trace_id_hex(), "4bf92f3577b34da6a3ce929d0e0e4736");
    }
}

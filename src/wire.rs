//! The inter-node message envelope and its codec.
//!
//! One envelope carries one fact to one worker on one node. Frames are
//! size-bounded: an oversized payload is rejected at encode time, never
//! truncated. Undecodable inbound frames are an error the poller logs and
//! drops.

use crate::term::Value;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;

/// Default per-frame size bound, in bytes.
pub const DEFAULT_MAX_FRAME: usize = 512;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub pred: u32,
    pub values: Vec<Value>,
    pub rank: u32,
    pub proc_id: String,
    pub priority: i32,
}

#[derive(Debug)]
pub enum WireError {
    /// The encoded frame exceeds the transport bound.
    Oversized { len: usize, max: usize },
    /// The inbound bytes do not decode to an envelope.
    Malformed(String),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Oversized { len, max } => {
                write!(f, "encoded message is {len} bytes, frame bound is {max}")
            }
            WireError::Malformed(err) => write!(f, "undecodable message: {err}"),
        }
    }
}

impl Error for WireError {}

pub fn encode(env: &Envelope, max_frame: usize) -> Result<Vec<u8>, WireError> {
    let bytes = match serde_json::to_vec(env) {
        Ok(bytes) => bytes,
        Err(err) => return Err(WireError::Malformed(err.to_string())),
    };
    if bytes.len() > max_frame {
        return Err(WireError::Oversized {
            len: bytes.len(),
            max: max_frame,
        });
    }
    Ok(bytes)
}

pub fn decode(bytes: &[u8]) -> Result<Envelope, WireError> {
    serde_json::from_slice(bytes).map_err(|err| WireError::Malformed(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> Envelope {
        Envelope {
            pred: 3,
            values: vec![Value::Int(1), Value::Float(2.5), Value::Str("x".into())],
            rank: 1,
            proc_id: "1".into(),
            priority: 0,
        }
    }

    #[test]
    fn round_trip() {
        let env = envelope();
        let bytes = encode(&env, DEFAULT_MAX_FRAME).unwrap();
        assert_eq!(decode(&bytes).unwrap(), env);
    }

    #[test]
    fn oversized_frames_are_rejected_not_truncated() {
        let mut env = envelope();
        env.values = vec![Value::Str("y".repeat(600))];
        match encode(&env, DEFAULT_MAX_FRAME) {
            Err(WireError::Oversized { len, max }) => {
                assert!(len > max);
            }
            other => panic!("expected Oversized, got {other:?}"),
        }
    }

    #[test]
    fn malformed_frames_fail_to_decode() {
        assert!(matches!(decode(b"{"), Err(WireError::Malformed(_))));
        assert!(matches!(decode(b"[1,2]"), Err(WireError::Malformed(_))));
    }
}

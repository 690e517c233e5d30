//! The inter-node transport seam.
//!
//! The master is the only owner of a transport handle; workers never touch
//! it. `ChannelMesh` wires N in-process nodes together over crossbeam
//! channels (per-pair ordered delivery) — enough for same-process ensembles
//! and tests; socket/RPC transports plug in behind the same trait.

use crate::wire::DEFAULT_MAX_FRAME;
use crossbeam_channel::{unbounded, Receiver, Sender};
use rustc_hash::FxHashMap;
use std::error::Error;
use std::fmt;

#[derive(Debug)]
pub enum TransportError {
    /// The destination rank is not reachable on this transport.
    Unroutable { rank: u32 },
    /// The underlying medium refused the frame.
    Send(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Unroutable { rank } => write!(f, "no route to rank {rank}"),
            TransportError::Send(err) => write!(f, "transport send failed: {err}"),
        }
    }
}

impl Error for TransportError {}

/// Best-effort frame delivery between nodes. `poll` must never block; `send`
/// preserves order per (source, destination) pair but nothing more.
pub trait Transport: Send + 'static {
    fn send(&mut self, frame: Vec<u8>, dest_rank: u32) -> Result<(), TransportError>;

    fn poll(&mut self) -> Option<Vec<u8>>;

    fn max_frame(&self) -> usize {
        DEFAULT_MAX_FRAME
    }
}

/// The transport of a single-node topology: nothing to reach, nothing to
/// receive.
pub struct NullTransport;

impl Transport for NullTransport {
    fn send(&mut self, _frame: Vec<u8>, dest_rank: u32) -> Result<(), TransportError> {
        Err(TransportError::Unroutable { rank: dest_rank })
    }

    fn poll(&mut self) -> Option<Vec<u8>> {
        None
    }
}

/// One endpoint of an in-process mesh built by [`channel_mesh`].
pub struct ChannelTransport {
    rank: u32,
    peers: FxHashMap<u32, Sender<Vec<u8>>>,
    inbox: Receiver<Vec<u8>>,
}

impl ChannelTransport {
    pub fn rank(&self) -> u32 {
        self.rank
    }
}

impl Transport for ChannelTransport {
    fn send(&mut self, frame: Vec<u8>, dest_rank: u32) -> Result<(), TransportError> {
        let Some(peer) = self.peers.get(&dest_rank) else {
            return Err(TransportError::Unroutable { rank: dest_rank });
        };
        peer.send(frame)
            .map_err(|err| TransportError::Send(err.to_string()))
    }

    fn poll(&mut self) -> Option<Vec<u8>> {
        self.inbox.try_recv().ok()
    }
}

/// A fully connected mesh of `n` nodes; element `i` is rank `i`'s transport.
pub fn channel_mesh(n: usize) -> Vec<ChannelTransport> {
    let channels: Vec<(Sender<Vec<u8>>, Receiver<Vec<u8>>)> =
        (0..n).map(|_| unbounded()).collect();
    channels
        .iter()
        .enumerate()
        .map(|(i, (_, rx))| {
            let peers = channels
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(j, (tx, _))| (j as u32, tx.clone()))
                .collect();
            ChannelTransport {
                rank: i as u32,
                peers,
                inbox: rx.clone(),
            }
        })
        .collect()
}

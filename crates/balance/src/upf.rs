use std::net::SocketAddr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Scaling lifecycle of a backend UPF.
///
/// A UPF accepts new sessions only while `Active`. `Draining` keeps the
/// UPF reachable for the sessions it still owns while they are moved
/// away; `Removed` is terminal and the slot index is never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ScaleState {
    Active,
    Draining,
    Removed,
}

/// One backend UPF as seen by the balancer.
///
/// This is the union of everything the proxy learns about a peer: the
/// PFCP identity it registered with, the transport address of its N4
/// endpoint, and the load observations the autoscaler feeds back in.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct UpfRecord {
    /// FQDN or IPv4 node id from the Association Setup exchange.
    pub node_id: String,
    /// Workload name, used to address the orchestrator manifest.
    pub hostname: String,
    /// N4 endpoint the proxy connects to.
    pub addr: SocketAddr,
    pub dnn: Option<String>,
    pub state: ScaleState,
    /// Last observed CPU percentage, if a probe is wired up.
    pub cpu: u32,
    /// Last observed aggregate bitrate in bits per second.
    pub bitrate: u64,
    /// Recovery timestamp from the most recent association setup; a
    /// change means the UPF restarted and lost all session state.
    #[cfg_attr(feature = "serde", serde(skip))]
    pub recovery_ts: Option<u32>,
}

impl UpfRecord {
    pub fn new(node_id: impl Into<String>, hostname: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            node_id: node_id.into(),
            hostname: hostname.into(),
            addr,
            dnn: None,
            state: ScaleState::Active,
            cpu: 0,
            bitrate: 0,
            recovery_ts: None,
        }
    }
}

/// Read-only view of a UPF slot handed to the control API and the
/// autoscaler, with the derived session count attached.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct UpfView {
    pub index: usize,
    pub node_id: String,
    pub hostname: String,
    pub addr: SocketAddr,
    pub state: ScaleState,
    pub sessions: usize,
    pub cpu: u32,
    pub bitrate: u64,
}

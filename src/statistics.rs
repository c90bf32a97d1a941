use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use ahash::AHashMap;
use parking_lot::RwLock;

/// The type of information passed through a statistics reporter.
#[derive(Debug, Clone, Copy)]
pub enum Stats {
    ReceivedBytes(u32),
    SendBytes(u32),
    ReceivedPkts(u32),
    SendPkts(u32),
    /// Datagrams that failed to parse or could not be routed.
    ErrorPkts(u32),
}

pub trait Number {
    fn add(&self, value: u64);
    fn get(&self) -> u64;
}

#[derive(Default)]
pub struct Count(AtomicU64);

impl Number for Count {
    fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-peer packet and byte counters.
pub struct Counts<T> {
    pub received_bytes: T,
    pub send_bytes: T,
    pub received_pkts: T,
    pub send_pkts: T,
    pub error_pkts: T,
}

impl<T: Number> Counts<T> {
    pub fn add(&self, payload: &Stats) {
        match payload {
            Stats::ReceivedBytes(v) => self.received_bytes.add(*v as u64),
            Stats::ReceivedPkts(v) => self.received_pkts.add(*v as u64),
            Stats::SendBytes(v) => self.send_bytes.add(*v as u64),
            Stats::SendPkts(v) => self.send_pkts.add(*v as u64),
            Stats::ErrorPkts(v) => self.error_pkts.add(*v as u64),
        }
    }
}

impl<T: Number + Default> Default for Counts<T> {
    fn default() -> Self {
        Self {
            received_bytes: T::default(),
            send_bytes: T::default(),
            received_pkts: T::default(),
            send_pkts: T::default(),
            error_pkts: T::default(),
        }
    }
}

/// Plane-wide statistics, keyed by peer address.
///
/// # Example
///
/// ```
/// use pfcp_lb::statistics::*;
///
/// let statistics = Statistics::default();
/// let addr = "127.0.0.1:8805".parse().unwrap();
///
/// statistics.register(addr);
/// statistics.get_reporter().send(&addr, &[Stats::ReceivedBytes(100)]);
/// assert_eq!(statistics.get(&addr).unwrap().received_bytes, 100);
/// ```
#[derive(Clone, Default)]
pub struct Statistics(Arc<RwLock<AHashMap<std::net::SocketAddr, Counts<Count>>>>);

impl Statistics {
    pub fn get_reporter(&self) -> Reporter {
        Reporter(self.0.clone())
    }

    /// Adds a peer to the watch list; counting for unknown peers is a
    /// silent no-op.
    pub fn register(&self, addr: std::net::SocketAddr) {
        self.0.write().entry(addr).or_default();
    }

    pub fn unregister(&self, addr: &std::net::SocketAddr) {
        self.0.write().remove(addr);
    }

    pub fn get(&self, addr: &std::net::SocketAddr) -> Option<Counts<u64>> {
        self.0.read().get(addr).map(|counts| Counts {
            received_bytes: counts.received_bytes.get(),
            received_pkts: counts.received_pkts.get(),
            send_bytes: counts.send_bytes.get(),
            send_pkts: counts.send_pkts.get(),
            error_pkts: counts.error_pkts.get(),
        })
    }
}

/// Held by the socket loops; forwards observations to the shared table.
#[derive(Clone)]
pub struct Reporter(Arc<RwLock<AHashMap<std::net::SocketAddr, Counts<Count>>>>);

impl Reporter {
    pub fn send(&self, addr: &std::net::SocketAddr, reports: &[Stats]) {
        if let Some(counts) = self.0.read().get(addr) {
            for item in reports {
                counts.add(item);
            }
        }
    }
}

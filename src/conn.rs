use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use ahash::AHashMap;
use parking_lot::Mutex;
use rs_pfcp::ie::{recovery_time_stamp::RecoveryTimeStamp, Ie, IeType};
use rs_pfcp::message::{heartbeat_request::HeartbeatRequestBuilder, Message};
use thiserror::Error;
use tokio::{net::UdpSocket, sync::mpsc, sync::oneshot};
use tokio_util::sync::CancellationToken;

use crate::statistics::{Reporter, Stats};

/// PFCP sequence numbers are 24 bits wide.
const SEQ_MASK: u32 = 0x00FF_FFFF;

/// How long an answered request stays in the duplicate cache, as a
/// multiple of the response timeout.
const RESP_CACHE_TTL_FACTOR: u32 = 3;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConnError {
    /// No matching response within `max_req_retries * resp_timeout`.
    #[error("request timed out")]
    Timeout,
    /// The association terminated while the request was in flight.
    #[error("association is down")]
    AssociationDown,
    #[error("malformed message from peer")]
    Malformed,
}

/// Association lifecycle with one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssocState {
    Idle,
    Associating,
    Up,
    Down,
    Closed,
}

/// One PFCP association: a (local socket, peer address) pair.
///
/// The connection owns the in-flight request table and the duplicate
/// response cache; nothing else reads them. The socket itself is shared
/// with the owning node, which demultiplexes incoming datagrams back to
/// the connection via [`PeerConn::complete`].
pub struct PeerConn {
    pub addr: SocketAddr,
    socket: Arc<UdpSocket>,
    seq: AtomicU32,
    state: Mutex<AssocState>,
    pending: Mutex<AHashMap<u32, oneshot::Sender<Vec<u8>>>>,
    resp_cache: Mutex<AHashMap<u32, (Instant, Vec<u8>)>>,
    max_req_retries: u8,
    resp_timeout: Duration,
    reporter: Reporter,
    cancel: CancellationToken,
}

impl PeerConn {
    pub fn new(
        addr: SocketAddr,
        socket: Arc<UdpSocket>,
        max_req_retries: u8,
        resp_timeout: Duration,
        reporter: Reporter,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            addr,
            socket,
            seq: AtomicU32::new(1),
            state: Mutex::new(AssocState::Idle),
            pending: Mutex::new(AHashMap::new()),
            resp_cache: Mutex::new(AHashMap::new()),
            max_req_retries: max_req_retries.max(1),
            resp_timeout,
            reporter,
            cancel,
        })
    }

    pub fn state(&self) -> AssocState {
        *self.state.lock()
    }

    pub fn set_state(&self, next: AssocState) {
        let mut state = self.state.lock();
        if *state != next {
            log::debug!("association {:?} -> {:?}: peer={}", *state, next, self.addr);
            *state = next;
        }
    }

    pub fn is_up(&self) -> bool {
        self.state() == AssocState::Up
    }

    /// Next 24-bit sequence number; zero is skipped so a fresh message
    /// never collides with builder defaults.
    pub fn next_seq(&self) -> u32 {
        loop {
            let seq = self.seq.fetch_add(1, Ordering::Relaxed) & SEQ_MASK;
            if seq != 0 {
                return seq;
            }
        }
    }

    /// Sends a request and waits for the matching response.
    ///
    /// The sequence number is assigned here; retransmissions reuse the
    /// identical bytes. The error is `Timeout` after
    /// `max_req_retries * resp_timeout`, or `AssociationDown` if the
    /// connection is torn down while waiting.
    pub async fn request<M: Message + ?Sized>(&self, msg: &mut M) -> Result<Vec<u8>, ConnError> {
        let seq = self.next_seq();
        msg.set_sequence(rs_pfcp::SequenceNumber(seq));
        self.request_raw(seq, msg.marshal()).await
    }

    pub async fn request_raw(&self, seq: u32, bytes: Vec<u8>) -> Result<Vec<u8>, ConnError> {
        if matches!(self.state(), AssocState::Closed | AssocState::Down) {
            return Err(ConnError::AssociationDown);
        }

        let (tx, mut rx) = oneshot::channel();
        self.pending.lock().insert(seq, tx);

        for attempt in 0..self.max_req_retries {
            if attempt > 0 {
                log::debug!("retransmit: peer={}, seq={}, attempt={}", self.addr, seq, attempt);
            }
            if self.socket.send_to(&bytes, self.addr).await.is_err() {
                self.pending.lock().remove(&seq);
                return Err(ConnError::AssociationDown);
            }
            self.reporter.send(
                &self.addr,
                &[Stats::SendBytes(bytes.len() as u32), Stats::SendPkts(1)],
            );

            match tokio::time::timeout(self.resp_timeout, &mut rx).await {
                Ok(Ok(resp)) => return Ok(resp),
                // The sender side was dropped by a teardown.
                Ok(Err(_)) => return Err(ConnError::AssociationDown),
                Err(_) => continue,
            }
        }

        self.pending.lock().remove(&seq);
        Err(ConnError::Timeout)
    }

    /// Hands an incoming response to its in-flight waiter. Returns
    /// `false` when no request with this sequence is outstanding.
    pub fn complete(&self, seq: u32, bytes: Vec<u8>) -> bool {
        match self.pending.lock().remove(&seq) {
            Some(tx) => tx.send(bytes).is_ok(),
            None => false,
        }
    }

    /// Fails every outstanding request with `AssociationDown`.
    pub fn fail_all(&self) {
        self.pending.lock().clear();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Sends a response datagram; responses carry the requester's
    /// sequence and are never retransmitted on our own initiative.
    pub async fn send_datagram(&self, bytes: &[u8]) {
        if self.socket.send_to(bytes, self.addr).await.is_ok() {
            self.reporter.send(
                &self.addr,
                &[Stats::SendBytes(bytes.len() as u32), Stats::SendPkts(1)],
            );
        }
    }

    /// Remembers a response so a retransmitted request can be answered
    /// without re-processing.
    pub fn remember(&self, seq: u32, bytes: Vec<u8>) {
        let ttl = self.resp_timeout * RESP_CACHE_TTL_FACTOR;
        let mut cache = self.resp_cache.lock();
        let now = Instant::now();
        cache.retain(|_, (at, _)| now.duration_since(*at) < ttl);
        cache.insert(seq, (now, bytes));
    }

    pub fn cached(&self, seq: u32) -> Option<Vec<u8>> {
        let ttl = self.resp_timeout * RESP_CACHE_TTL_FACTOR;
        let cache = self.resp_cache.lock();
        cache
            .get(&seq)
            .filter(|(at, _)| at.elapsed() < ttl)
            .map(|(_, bytes)| bytes.clone())
    }

    /// Emits Heartbeat Requests until the peer stops answering, then
    /// drives the association `Down` and reports the peer.
    pub fn spawn_heartbeat(
        self: &Arc<Self>,
        interval: Duration,
        recovery_ts: std::time::SystemTime,
        on_down: mpsc::UnboundedSender<SocketAddr>,
    ) {
        let conn = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = conn.cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match conn.state() {
                    AssocState::Up => {}
                    AssocState::Closed | AssocState::Down => break,
                    _ => continue,
                }

                let ts_ie = Ie::new(
                    IeType::RecoveryTimeStamp,
                    RecoveryTimeStamp::new(recovery_ts).marshal().to_vec(),
                );
                let mut req = HeartbeatRequestBuilder::new(0)
                    .recovery_time_stamp_ie(ts_ie)
                    .build();
                match conn.request(&mut req).await {
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("heartbeat lost: peer={}, err={}", conn.addr, e);
                        conn.set_state(AssocState::Down);
                        conn.fail_all();
                        let _ = on_down.send(conn.addr);
                        break;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statistics::Statistics;

    async fn test_conn(resp_timeout: Duration, retries: u8) -> Arc<PeerConn> {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer = "127.0.0.1:9".parse().unwrap();
        PeerConn::new(
            peer,
            socket,
            retries,
            resp_timeout,
            Statistics::default().get_reporter(),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn sequence_numbers_stay_within_24_bits() {
        let conn = test_conn(Duration::from_millis(10), 1).await;
        conn.seq.store(SEQ_MASK - 1, Ordering::Relaxed);
        let a = conn.next_seq();
        let b = conn.next_seq();
        let c = conn.next_seq();
        assert_eq!(a, SEQ_MASK - 1);
        assert_eq!(b, SEQ_MASK);
        // Zero is skipped on wrap.
        assert_eq!(c, 1);
    }

    #[tokio::test]
    async fn unanswered_request_times_out_and_clears_the_table() {
        let conn = test_conn(Duration::from_millis(20), 2).await;
        let start = Instant::now();
        let err = conn
            .request_raw(7, vec![0x20, 0x01, 0x00, 0x04, 0x00, 0x00, 0x07, 0x00])
            .await
            .unwrap_err();
        assert_eq!(err, ConnError::Timeout);
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert_eq!(conn.pending_len(), 0);
    }

    #[tokio::test]
    async fn complete_fulfils_the_matching_waiter() {
        let conn = test_conn(Duration::from_secs(1), 3).await;
        let fut = conn.request_raw(42, vec![0x20, 0x01, 0x00, 0x04, 0x00, 0x00, 0x2a, 0x00]);
        let conn2 = conn.clone();
        let answer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            conn2.complete(42, vec![0xAB])
        });
        let resp = fut.await.unwrap();
        assert_eq!(resp, vec![0xAB]);
        assert!(answer.await.unwrap());
    }

    #[tokio::test]
    async fn teardown_fails_in_flight_requests() {
        let conn = test_conn(Duration::from_secs(5), 3).await;
        let fut = conn.request_raw(9, vec![0x20, 0x01, 0x00, 0x04, 0x00, 0x00, 0x09, 0x00]);
        let conn2 = conn.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            conn2.fail_all();
        });
        assert_eq!(fut.await.unwrap_err(), ConnError::AssociationDown);
    }

    #[tokio::test]
    async fn duplicate_cache_answers_within_ttl() {
        let conn = test_conn(Duration::from_millis(50), 1).await;
        assert!(conn.cached(5).is_none());
        conn.remember(5, vec![1, 2, 3]);
        assert_eq!(conn.cached(5), Some(vec![1, 2, 3]));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(conn.cached(5).is_none());
    }
}

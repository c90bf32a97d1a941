//! Session load-balancing state for the PFCP proxy.
//!
//! The balancer is the single owner of the session→UPF binding. It keeps
//! three views of the same facts and mutates them together under one
//! lock, so that at any observation point a session is in the map if and
//! only if it is in exactly one per-UPF session list.

pub mod session;
pub mod upf;

pub use session::{SessionEntry, SessionRoute};
pub use upf::{ScaleState, UpfRecord, UpfView};

use ahash::AHashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BalanceError {
    /// No UPF is currently accepting new sessions.
    #[error("no active UPF available")]
    NoActiveUpf,
    #[error("unknown session: up_seid={0:#x}")]
    UnknownSession(u64),
    #[error("unknown UPF index: {0}")]
    UnknownUpf(usize),
    #[error("session already bound: up_seid={0:#x}")]
    DuplicateSession(u64),
}

#[derive(Default)]
struct Inner {
    upfs: Vec<UpfRecord>,
    /// up_seid → full session record.
    sessions: AHashMap<u64, SessionEntry>,
    /// up_seid → index of the bound UPF.
    lbmap: AHashMap<u64, usize>,
    /// Ordered session lists, parallel to `upfs`.
    upf_sessions: Vec<Vec<u64>>,
    /// down_seid → up_seid, for UPF-originated messages.
    by_down_seid: AHashMap<u64, u64>,
}

/// The session↔UPF binding table.
///
/// All operations are O(1) or O(sessions-of-one-UPF) and hold the single
/// internal mutex only for their own duration; anything long-running
/// (migration replay, socket I/O) happens outside, between calls.
///
/// # Example
///
/// ```
/// use pfcp_lb_balance::{Balancer, SessionEntry, UpfRecord};
///
/// let lb = Balancer::default();
/// let idx = lb.register(UpfRecord::new("upf-0", "upf-0", "10.0.0.1:8805".parse().unwrap()));
///
/// assert_eq!(lb.pick(), Ok(idx));
/// lb.insert(SessionEntry::new(1, 0xAAAA, 101, 0xBBBB, idx)).unwrap();
/// assert_eq!(lb.session_count(), 1);
/// assert_eq!(lb.sessions_of(idx), vec![1]);
/// ```
#[derive(Default)]
pub struct Balancer {
    inner: Mutex<Inner>,
}

impl Balancer {
    /// Adds a backend UPF and returns its stable index. Registering the
    /// same node id twice returns the existing slot.
    pub fn register(&self, rec: UpfRecord) -> usize {
        let mut inner = self.inner.lock();
        if let Some(idx) = inner.upfs.iter().position(|u| u.node_id == rec.node_id) {
            return idx;
        }
        inner.upfs.push(rec);
        inner.upf_sessions.push(Vec::new());
        inner.upfs.len() - 1
    }

    /// Chooses the destination UPF for a new session: the `Active` UPF
    /// with the fewest bound sessions, ties broken by lowest index.
    /// `Draining` and `Removed` slots are never picked.
    pub fn pick(&self) -> Result<usize, BalanceError> {
        let inner = self.inner.lock();
        inner
            .upfs
            .iter()
            .enumerate()
            .filter(|(_, u)| u.state == ScaleState::Active)
            .min_by_key(|(i, _)| inner.upf_sessions[*i].len())
            .map(|(i, _)| i)
            .ok_or(BalanceError::NoActiveUpf)
    }

    /// Binds a freshly established session.
    pub fn insert(&self, entry: SessionEntry) -> Result<(), BalanceError> {
        let mut inner = self.inner.lock();
        if inner.sessions.contains_key(&entry.up_seid) {
            return Err(BalanceError::DuplicateSession(entry.up_seid));
        }
        if entry.upf >= inner.upfs.len() {
            return Err(BalanceError::UnknownUpf(entry.upf));
        }
        inner.lbmap.insert(entry.up_seid, entry.upf);
        inner.upf_sessions[entry.upf].push(entry.up_seid);
        inner.by_down_seid.insert(entry.down_seid, entry.up_seid);
        inner.sessions.insert(entry.up_seid, entry);
        Ok(())
    }

    /// Unbinds a session and returns its record, if it existed.
    pub fn remove(&self, up_seid: u64) -> Option<SessionEntry> {
        let mut inner = self.inner.lock();
        Self::remove_locked(&mut inner, up_seid)
    }

    fn remove_locked(inner: &mut Inner, up_seid: u64) -> Option<SessionEntry> {
        let entry = inner.sessions.remove(&up_seid)?;
        inner.lbmap.remove(&up_seid);
        inner.by_down_seid.remove(&entry.down_seid);
        inner.upf_sessions[entry.upf].retain(|s| *s != up_seid);
        Some(entry)
    }

    pub fn route(&self, up_seid: u64) -> Option<SessionRoute> {
        let inner = self.inner.lock();
        let entry = inner.sessions.get(&up_seid)?;
        Some(SessionRoute {
            upf: entry.upf,
            addr: inner.upfs[entry.upf].addr,
            down_seid: entry.down_seid,
            upf_seid: entry.upf_seid,
        })
    }

    /// Resolves a UPF-originated message addressed by the proxy's
    /// down-side SEID.
    pub fn route_by_down(&self, down_seid: u64) -> Option<(u64, SessionRoute)> {
        let up_seid = *self.inner.lock().by_down_seid.get(&down_seid)?;
        self.route(up_seid).map(|r| (up_seid, r))
    }

    pub fn cp_seid(&self, up_seid: u64) -> Option<u64> {
        self.inner.lock().sessions.get(&up_seid).map(|e| e.cp_seid)
    }

    /// Records the accepted Establishment for later replay.
    pub fn store_est(&self, up_seid: u64, bytes: Vec<u8>) -> Result<(), BalanceError> {
        let mut inner = self.inner.lock();
        let entry = inner
            .sessions
            .get_mut(&up_seid)
            .ok_or(BalanceError::UnknownSession(up_seid))?;
        entry.est_msg = bytes;
        Ok(())
    }

    /// Appends an accepted Modification to the session's replay history.
    pub fn push_mod(&self, up_seid: u64, bytes: Vec<u8>) -> Result<(), BalanceError> {
        let mut inner = self.inner.lock();
        let entry = inner
            .sessions
            .get_mut(&up_seid)
            .ok_or(BalanceError::UnknownSession(up_seid))?;
        entry.mod_msgs.push(bytes);
        Ok(())
    }

    /// Establishment plus Modifications, in acceptance order.
    pub fn history(&self, up_seid: u64) -> Option<(Vec<u8>, Vec<Vec<u8>>)> {
        let inner = self.inner.lock();
        let entry = inner.sessions.get(&up_seid)?;
        Some((entry.est_msg.clone(), entry.mod_msgs.clone()))
    }

    /// Moves a session to another UPF after a successful replay. The
    /// old down/UPF SEIDs are replaced by the ones minted toward the
    /// destination.
    pub fn rebind(
        &self,
        up_seid: u64,
        dst: usize,
        down_seid: u64,
        upf_seid: u64,
    ) -> Result<(), BalanceError> {
        let mut inner = self.inner.lock();
        if dst >= inner.upfs.len() {
            return Err(BalanceError::UnknownUpf(dst));
        }
        let entry = inner
            .sessions
            .get_mut(&up_seid)
            .ok_or(BalanceError::UnknownSession(up_seid))?;
        let src = entry.upf;
        let old_down = entry.down_seid;
        entry.upf = dst;
        entry.down_seid = down_seid;
        entry.upf_seid = upf_seid;
        inner.lbmap.insert(up_seid, dst);
        inner.by_down_seid.remove(&old_down);
        inner.by_down_seid.insert(down_seid, up_seid);
        inner.upf_sessions[src].retain(|s| *s != up_seid);
        inner.upf_sessions[dst].push(up_seid);
        Ok(())
    }

    pub fn sessions_of(&self, idx: usize) -> Vec<u64> {
        let inner = self.inner.lock();
        inner.upf_sessions.get(idx).cloned().unwrap_or_default()
    }

    pub fn mark_draining(&self, idx: usize) -> Result<(), BalanceError> {
        self.set_state(idx, ScaleState::Draining)
    }

    pub fn mark_removed(&self, idx: usize) -> Result<(), BalanceError> {
        self.set_state(idx, ScaleState::Removed)
    }

    fn set_state(&self, idx: usize, state: ScaleState) -> Result<(), BalanceError> {
        let mut inner = self.inner.lock();
        let upf = inner
            .upfs
            .get_mut(idx)
            .ok_or(BalanceError::UnknownUpf(idx))?;
        upf.state = state;
        Ok(())
    }

    /// Atomically purges every session bound to a restarted or removed
    /// peer and returns the purged records so the caller can notify the
    /// SMF about each of them.
    pub fn invalidate_peer(&self, idx: usize) -> Vec<SessionEntry> {
        let mut inner = self.inner.lock();
        let seids = match inner.upf_sessions.get(idx) {
            Some(s) => s.clone(),
            None => return Vec::new(),
        };
        seids
            .into_iter()
            .filter_map(|seid| Self::remove_locked(&mut inner, seid))
            .collect()
    }

    /// Stores the peer's recovery timestamp; returns `true` when a
    /// previous, different timestamp was known, i.e. the peer restarted.
    pub fn note_recovery(&self, idx: usize, ts: u32) -> bool {
        let mut inner = self.inner.lock();
        let Some(upf) = inner.upfs.get_mut(idx) else {
            return false;
        };
        let restarted = matches!(upf.recovery_ts, Some(prev) if prev != ts);
        upf.recovery_ts = Some(ts);
        restarted
    }

    pub fn set_load(&self, idx: usize, cpu: u32, bitrate: u64) {
        let mut inner = self.inner.lock();
        if let Some(upf) = inner.upfs.get_mut(idx) {
            upf.cpu = cpu;
            upf.bitrate = bitrate;
        }
    }

    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<usize> {
        let inner = self.inner.lock();
        inner.upfs.iter().position(|u| u.addr == addr)
    }

    pub fn upf_addr(&self, idx: usize) -> Option<SocketAddr> {
        let inner = self.inner.lock();
        inner.upfs.get(idx).map(|u| u.addr)
    }

    pub fn hostname(&self, idx: usize) -> Option<String> {
        let inner = self.inner.lock();
        inner.upfs.get(idx).map(|u| u.hostname.clone())
    }

    pub fn state_of(&self, idx: usize) -> Option<ScaleState> {
        let inner = self.inner.lock();
        inner.upfs.get(idx).map(|u| u.state)
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn session_count_of(&self, idx: usize) -> usize {
        let inner = self.inner.lock();
        inner.upf_sessions.get(idx).map(|s| s.len()).unwrap_or(0)
    }

    pub fn upf_count(&self) -> usize {
        self.inner.lock().upfs.len()
    }

    /// Number of UPFs that still count against the pool bounds.
    pub fn live_count(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .upfs
            .iter()
            .filter(|u| u.state != ScaleState::Removed)
            .count()
    }

    pub fn active_count(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .upfs
            .iter()
            .filter(|u| u.state == ScaleState::Active)
            .count()
    }

    /// Snapshot of the whole peer table with derived session counts.
    pub fn views(&self) -> Vec<UpfView> {
        let inner = self.inner.lock();
        inner
            .upfs
            .iter()
            .enumerate()
            .map(|(i, u)| UpfView {
                index: i,
                node_id: u.node_id.clone(),
                hostname: u.hostname.clone(),
                addr: u.addr,
                state: u.state,
                sessions: inner.upf_sessions[i].len(),
                cpu: u.cpu,
                bitrate: u.bitrate,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upf(n: usize) -> UpfRecord {
        UpfRecord::new(
            format!("upf-{n}"),
            format!("upf-{n}"),
            format!("10.0.0.{}:8805", n + 1).parse().unwrap(),
        )
    }

    fn entry(seid: u64, idx: usize) -> SessionEntry {
        SessionEntry::new(seid, seid + 0x1000, seid + 0x2000, seid + 0x3000, idx)
    }

    #[test]
    fn register_is_idempotent_per_node_id() {
        let lb = Balancer::default();
        let a = lb.register(upf(0));
        let b = lb.register(upf(0));
        assert_eq!(a, b);
        assert_eq!(lb.upf_count(), 1);
    }

    #[test]
    fn pick_prefers_least_loaded_then_lowest_index() {
        let lb = Balancer::default();
        let a = lb.register(upf(0));
        let b = lb.register(upf(1));
        assert_eq!(lb.pick(), Ok(a));

        lb.insert(entry(1, a)).unwrap();
        assert_eq!(lb.pick(), Ok(b));

        lb.insert(entry(2, b)).unwrap();
        // Equal load again, lowest index wins.
        assert_eq!(lb.pick(), Ok(a));
    }

    #[test]
    fn pick_skips_draining_and_fails_when_pool_is_empty() {
        let lb = Balancer::default();
        let a = lb.register(upf(0));
        lb.mark_draining(a).unwrap();
        assert_eq!(lb.pick(), Err(BalanceError::NoActiveUpf));
    }

    #[test]
    fn binding_views_stay_consistent() {
        let lb = Balancer::default();
        let a = lb.register(upf(0));
        let b = lb.register(upf(1));
        for seid in 1..=10u64 {
            let idx = if seid % 2 == 0 { a } else { b };
            lb.insert(entry(seid, idx)).unwrap();
        }
        assert_eq!(
            lb.session_count(),
            lb.session_count_of(a) + lb.session_count_of(b)
        );

        for seid in 1..=10u64 {
            assert!(lb.route(seid).is_some());
        }
        lb.remove(4);
        assert!(lb.route(4).is_none());
        assert!(!lb.sessions_of(a).contains(&4));
        assert_eq!(
            lb.session_count(),
            lb.session_count_of(a) + lb.session_count_of(b)
        );
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let lb = Balancer::default();
        let a = lb.register(upf(0));
        lb.insert(entry(7, a)).unwrap();
        assert_eq!(
            lb.insert(entry(7, a)),
            Err(BalanceError::DuplicateSession(7))
        );
    }

    #[test]
    fn rebind_moves_session_between_lists() {
        let lb = Balancer::default();
        let a = lb.register(upf(0));
        let b = lb.register(upf(1));
        lb.insert(entry(1, a)).unwrap();

        lb.rebind(1, b, 0x9000, 0x9001).unwrap();
        assert!(lb.sessions_of(a).is_empty());
        assert_eq!(lb.sessions_of(b), vec![1]);
        let route = lb.route(1).unwrap();
        assert_eq!(route.upf, b);
        assert_eq!(route.down_seid, 0x9000);
        assert_eq!(route.upf_seid, 0x9001);
        // The old down-side SEID no longer resolves.
        assert!(lb.route_by_down(entry(1, a).down_seid).is_none());
        assert_eq!(lb.route_by_down(0x9000).map(|(s, _)| s), Some(1));
    }

    #[test]
    fn invalidate_peer_purges_all_its_sessions() {
        let lb = Balancer::default();
        let a = lb.register(upf(0));
        let b = lb.register(upf(1));
        for seid in 1..=10u64 {
            lb.insert(entry(seid, a)).unwrap();
        }
        lb.insert(entry(11, b)).unwrap();

        let purged = lb.invalidate_peer(a);
        assert_eq!(purged.len(), 10);
        assert_eq!(lb.session_count(), 1);
        assert!(lb.sessions_of(a).is_empty());
        assert_eq!(lb.sessions_of(b), vec![11]);
    }

    #[test]
    fn recovery_change_is_a_restart() {
        let lb = Balancer::default();
        let a = lb.register(upf(0));
        assert!(!lb.note_recovery(a, 100));
        assert!(!lb.note_recovery(a, 100));
        assert!(lb.note_recovery(a, 101));
    }

    #[test]
    fn history_keeps_modifications_in_order() {
        let lb = Balancer::default();
        let a = lb.register(upf(0));
        lb.insert(entry(1, a)).unwrap();
        lb.store_est(1, vec![0x32]).unwrap();
        lb.push_mod(1, vec![1]).unwrap();
        lb.push_mod(1, vec![2]).unwrap();
        let (est, mods) = lb.history(1).unwrap();
        assert_eq!(est, vec![0x32]);
        assert_eq!(mods, vec![vec![1], vec![2]]);
    }
}

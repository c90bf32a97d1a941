/// Per-session bookkeeping kept for the lifetime of a PFCP session.
///
/// A session is addressed by four SEIDs at once: the SMF's CP SEID and
/// the proxy's up-side SEID on the northbound leg, the proxy's down-side
/// SEID and the UPF's SEID on the southbound leg. The up-side SEID is
/// the primary key everywhere.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    /// SEID minted by the proxy's up-facing endpoint; unique for the
    /// session's lifetime.
    pub up_seid: u64,
    /// SEID the SMF chose for its own side (from CP-F-SEID).
    pub cp_seid: u64,
    /// SEID the proxy minted toward the currently bound UPF.
    pub down_seid: u64,
    /// SEID the bound UPF returned in its UP-F-SEID.
    pub upf_seid: u64,
    /// Index of the bound UPF in the balancer's peer table.
    pub upf: usize,
    /// Down-facing Session Establishment Request as last accepted,
    /// kept for replay when the session moves to another UPF.
    pub est_msg: Vec<u8>,
    /// Accepted Session Modification Requests, in acceptance order.
    pub mod_msgs: Vec<Vec<u8>>,
}

impl SessionEntry {
    pub fn new(up_seid: u64, cp_seid: u64, down_seid: u64, upf_seid: u64, upf: usize) -> Self {
        Self {
            up_seid,
            cp_seid,
            down_seid,
            upf_seid,
            upf,
            est_msg: Vec::new(),
            mod_msgs: Vec::new(),
        }
    }
}

/// Where a request for an existing session has to go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionRoute {
    pub upf: usize,
    pub addr: std::net::SocketAddr,
    pub down_seid: u64,
    pub upf_seid: u64,
}

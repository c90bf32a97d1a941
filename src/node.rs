use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::SystemTime,
};

use ahash::AHashMap;
use async_trait::async_trait;
use network_interface::{NetworkInterface, NetworkInterfaceConfig};
use parking_lot::{Mutex, RwLock};
use rs_pfcp::ie::{cause::Cause, node_id::NodeId, recovery_time_stamp::RecoveryTimeStamp, Ie, IeType};
use rs_pfcp::message::{
    association_setup_request::AssociationSetupRequestBuilder,
    association_setup_response::AssociationSetupResponse, header::Header, Message, MsgType,
};
use tokio::{net::UdpSocket, sync::mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    conn::{AssocState, ConnError, PeerConn},
    statistics::{Statistics, Stats},
};

/// Which side of the proxy a node serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plane {
    /// Faces the SMF; the proxy impersonates a UPF here.
    Up,
    /// Faces the UPF pool; the proxy impersonates an SMF here.
    Down,
}

impl std::fmt::Display for Plane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Plane::Up => write!(f, "up"),
            Plane::Down => write!(f, "down"),
        }
    }
}

/// Plane-specific handling of incoming PFCP requests.
///
/// The node demultiplexes datagrams: responses are matched against the
/// owning connection's in-flight table, requests are handed here. The
/// handler is invoked inline on the reader, so implementations must
/// spawn anything that waits on a peer.
#[async_trait]
pub trait PlaneHandler: Send + Sync + 'static {
    async fn on_request(&self, conn: Arc<PeerConn>, hdr: Header, raw: Vec<u8>);

    /// A peer stopped answering heartbeats or the association dropped.
    async fn on_peer_down(&self, addr: SocketAddr);
}

/// One listening UDP socket and every peer connection on one side of
/// the proxy.
pub struct Node {
    pub plane: Plane,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    conns: RwLock<AHashMap<SocketAddr, Arc<PeerConn>>>,
    cancel: CancellationToken,
    statistics: Statistics,
    cfg: Arc<Config>,
    node_ip: Ipv4Addr,
    recovery_ts: SystemTime,
    peer_down_tx: mpsc::UnboundedSender<SocketAddr>,
    peer_down_rx: Mutex<Option<mpsc::UnboundedReceiver<SocketAddr>>>,
}

impl Node {
    /// Binds the plane's socket and derives the local PFCP identity.
    pub async fn bind(cfg: Arc<Config>, plane: Plane, statistics: Statistics) -> anyhow::Result<Arc<Self>> {
        let bind = match plane {
            Plane::Up => cfg.up_addr,
            Plane::Down => cfg.down_addr,
        };
        let socket = UdpSocket::bind(bind).await?;
        let local_addr = socket.local_addr()?;
        let node_ip = resolve_node_ip(&cfg, local_addr);
        let (peer_down_tx, peer_down_rx) = mpsc::unbounded_channel();

        log::info!("pfcp node listening: plane={}, addr={}", plane, local_addr);

        Ok(Arc::new(Self {
            plane,
            socket: Arc::new(socket),
            local_addr,
            conns: RwLock::new(AHashMap::new()),
            cancel: CancellationToken::new(),
            statistics,
            cfg,
            node_ip,
            recovery_ts: SystemTime::now(),
            peer_down_tx,
            peer_down_rx: Mutex::new(Some(peer_down_rx)),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn node_ip(&self) -> Ipv4Addr {
        self.node_ip
    }

    pub fn recovery_ts(&self) -> SystemTime {
        self.recovery_ts
    }

    pub fn node_id_ie(&self) -> Ie {
        let cp = &self.cfg.cpiface;
        if cp.use_fqdn && !cp.node_id.is_empty() && cp.node_id.parse::<IpAddr>().is_err() {
            NodeId::new_fqdn(&cp.node_id).to_ie()
        } else {
            NodeId::new_ipv4(self.node_ip).to_ie()
        }
    }

    pub fn recovery_ts_ie(&self) -> Ie {
        Ie::new(
            IeType::RecoveryTimeStamp,
            RecoveryTimeStamp::new(self.recovery_ts).marshal().to_vec(),
        )
    }

    /// Connection for a peer address, created on first contact.
    pub fn conn(&self, addr: SocketAddr) -> Arc<PeerConn> {
        if let Some(conn) = self.conns.read().get(&addr) {
            return conn.clone();
        }
        let mut conns = self.conns.write();
        conns
            .entry(addr)
            .or_insert_with(|| {
                self.statistics.register(addr);
                PeerConn::new(
                    addr,
                    self.socket.clone(),
                    self.cfg.max_req_retries,
                    self.cfg.resp_timeout,
                    self.statistics.get_reporter(),
                    self.cancel.child_token(),
                )
            })
            .clone()
    }

    pub fn get_conn(&self, addr: &SocketAddr) -> Option<Arc<PeerConn>> {
        self.conns.read().get(addr).cloned()
    }

    pub fn peer_down_sender(&self) -> mpsc::UnboundedSender<SocketAddr> {
        self.peer_down_tx.clone()
    }

    /// Reads datagrams until [`Node::stop`]; one reader per socket.
    pub async fn serve(self: Arc<Self>, handler: Arc<dyn PlaneHandler>) {
        let mut peer_down_rx = self
            .peer_down_rx
            .lock()
            .take()
            .expect("node already serving");
        let reporter = self.statistics.get_reporter();
        let mut buf = vec![0u8; 4096];

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                down = peer_down_rx.recv() => {
                    if let Some(addr) = down {
                        handler.on_peer_down(addr).await;
                    }
                }
                recv = tokio::time::timeout(self.cfg.read_timeout, self.socket.recv_from(&mut buf)) => {
                    let (size, addr) = match recv {
                        Ok(Ok(x)) => x,
                        Ok(Err(e)) => {
                            log::warn!("udp socket receive error: plane={}, err={}", self.plane, e);
                            continue;
                        }
                        // Idle past the read deadline; loop to observe
                        // cancellation.
                        Err(_) => continue,
                    };
                    reporter.send(&addr, &[Stats::ReceivedBytes(size as u32), Stats::ReceivedPkts(1)]);
                    self.dispatch(&handler, addr, buf[..size].to_vec()).await;
                }
            }
        }

        log::info!("pfcp node stopped: plane={}", self.plane);
    }

    async fn dispatch(&self, handler: &Arc<dyn PlaneHandler>, addr: SocketAddr, data: Vec<u8>) {
        let reporter = self.statistics.get_reporter();
        let hdr = match Header::unmarshal(&data) {
            Ok(hdr) => hdr,
            Err(e) => {
                log::debug!("malformed datagram dropped: peer={}, err={}", addr, e);
                reporter.send(&addr, &[Stats::ErrorPkts(1)]);
                return;
            }
        };

        let conn = self.conn(addr);
        if is_response(hdr.message_type) {
            if !conn.complete(*hdr.sequence_number, data) {
                log::trace!(
                    "unmatched response dropped: peer={}, type={:?}, seq={}",
                    addr,
                    hdr.message_type,
                    hdr.sequence_number
                );
            }
            return;
        }

        // A retransmitted request is answered from the response cache
        // without reaching the handler again.
        if let Some(cached) = conn.cached(*hdr.sequence_number) {
            conn.send_datagram(&cached).await;
            return;
        }

        // Handlers run inline on the single reader, which is what keeps
        // per-session enqueue order equal to arrival order; anything
        // slow is spawned by the handler itself.
        handler.on_request(conn, hdr, data).await;
    }

    /// Outbound Association Setup toward a newly registered backend.
    /// Returns the connection and the peer's recovery timestamp, which
    /// the caller records for restart detection.
    pub async fn try_connect_n4_peer(
        &self,
        addr: SocketAddr,
    ) -> Result<(Arc<PeerConn>, Option<u32>), ConnError> {
        let conn = self.conn(addr);
        if conn.is_up() {
            return Ok((conn, None));
        }
        conn.set_state(AssocState::Associating);

        let mut req = AssociationSetupRequestBuilder::new(0)
            .node_id_ie(self.node_id_ie())
            .recovery_time_stamp_ie(self.recovery_ts_ie())
            .build();
        let raw = conn.request(&mut req).await.inspect_err(|_| {
            conn.set_state(AssocState::Down);
        })?;

        let resp = AssociationSetupResponse::unmarshal(&raw).map_err(|e| {
            log::warn!("bad association setup response: peer={}, err={}", addr, e);
            ConnError::Malformed
        })?;
        let cause = Cause::unmarshal(&resp.cause.payload).map_err(|_| ConnError::Malformed)?;
        if cause.value != rs_pfcp::ie::cause::CauseValue::RequestAccepted {
            log::warn!("association rejected: peer={}, cause={:?}", addr, cause.value);
            conn.set_state(AssocState::Down);
            return Err(ConnError::AssociationDown);
        }

        conn.set_state(AssocState::Up);
        log::info!("n4 association up: plane={}, peer={}", self.plane, addr);

        // The down plane always supervises its peers with heartbeats.
        if self.plane == Plane::Down || self.cfg.enable_hb_timer {
            conn.spawn_heartbeat(
                self.cfg.heart_beat_interval,
                self.recovery_ts,
                self.peer_down_tx.clone(),
            );
        }

        let peer_recovery = resp
            .recovery_time_stamp
            .as_ref()
            .and_then(|ie| ie.payload.get(..4))
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]));
        Ok((conn, peer_recovery))
    }

    /// Idempotent shutdown: cancels the reader, fails all in-flight
    /// requests with `AssociationDown` and closes every association.
    pub fn stop(&self) {
        self.cancel.cancel();
        for conn in self.conns.read().values() {
            conn.set_state(AssocState::Closed);
            conn.fail_all();
        }
    }
}

fn is_response(t: MsgType) -> bool {
    matches!(
        t,
        MsgType::HeartbeatResponse
            | MsgType::PfdManagementResponse
            | MsgType::AssociationSetupResponse
            | MsgType::AssociationUpdateResponse
            | MsgType::AssociationReleaseResponse
            | MsgType::VersionNotSupportedResponse
            | MsgType::NodeReportResponse
            | MsgType::SessionSetDeletionResponse
            | MsgType::SessionSetModificationResponse
            | MsgType::SessionEstablishmentResponse
            | MsgType::SessionModificationResponse
            | MsgType::SessionDeletionResponse
            | MsgType::SessionReportResponse
    )
}

fn resolve_node_ip(cfg: &Config, local: SocketAddr) -> Ipv4Addr {
    if let Ok(IpAddr::V4(ip)) = cfg.cpiface.node_id.parse::<IpAddr>() {
        return ip;
    }
    if !cfg.access_iface.ifname.is_empty() {
        if let Some(ip) = iface_ipv4(&cfg.access_iface.ifname) {
            return ip;
        }
    }
    if let IpAddr::V4(ip) = local.ip() {
        if !ip.is_unspecified() {
            return ip;
        }
    }
    local_ipv4().unwrap_or(Ipv4Addr::LOCALHOST)
}

/// IPv4 address of a named interface.
pub fn iface_ipv4(name: &str) -> Option<Ipv4Addr> {
    let interfaces = NetworkInterface::show().ok()?;
    interfaces
        .iter()
        .find(|iface| iface.name == name)?
        .addr
        .iter()
        .find_map(|addr| match addr {
            network_interface::Addr::V4(v4) => Some(v4.ip),
            _ => None,
        })
}

/// First non-loopback IPv4 address of any interface.
pub fn local_ipv4() -> Option<Ipv4Addr> {
    let interfaces = NetworkInterface::show().ok()?;
    interfaces
        .iter()
        .flat_map(|iface| iface.addr.iter())
        .find_map(|addr| match addr {
            network_interface::Addr::V4(v4) if !v4.ip.is_loopback() => Some(v4.ip),
            _ => None,
        })
}

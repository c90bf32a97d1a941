use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

use ahash::AHashMap;
use async_trait::async_trait;
use balance::{Balancer, SessionEntry, UpfRecord};
use parking_lot::Mutex;
use rs_pfcp::ie::{
    cause::{Cause, CauseValue},
    fseid::Fseid,
    report_type::ReportType,
    Ie, IeType,
};
use rs_pfcp::message::{
    association_release_response::AssociationReleaseResponseBuilder,
    association_setup_request::AssociationSetupRequest,
    association_setup_response::AssociationSetupResponseBuilder,
    header::Header,
    heartbeat_response::HeartbeatResponseBuilder,
    session_deletion_request::SessionDeletionRequest,
    session_deletion_response::{SessionDeletionResponse, SessionDeletionResponseBuilder},
    session_establishment_request::SessionEstablishmentRequest,
    session_establishment_response::{
        SessionEstablishmentResponse, SessionEstablishmentResponseBuilder,
    },
    session_modification_request::SessionModificationRequest,
    session_modification_response::{
        SessionModificationResponse, SessionModificationResponseBuilder,
    },
    session_report_request::{SessionReportRequest, SessionReportRequestBuilder},
    session_report_response::{SessionReportResponse, SessionReportResponseBuilder},
    Message, MsgType,
};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};

use crate::{
    bus::{DownToUp, DownToUpRx, ForwardReply, ForwardResult, SesDelU2d, SesEstU2d, SesModU2d,
          SesRepD2u, UpToDown, UpToDownRx, UpfD2u},
    config::Config,
    conn::{AssocState, ConnError, PeerConn},
    node::{Node, PlaneHandler},
};

/// PFCP cause "PFCP entity in recovery"; the codec's cause enum stops
/// one short of it, so the octet is carried raw.
pub const CAUSE_PFCP_ENTITY_IN_RECOVERY: u8 = 17;

fn cause_of(payload: &[u8]) -> Result<CauseValue, ConnError> {
    Cause::unmarshal(payload)
        .map(|c| c.value)
        .map_err(|_| ConnError::Malformed)
}

// ---------------------------------------------------------------------
// Up plane
// ---------------------------------------------------------------------

enum UpJob {
    Establish {
        msg: SessionEstablishmentRequest,
        seq: u32,
        peer: Arc<PeerConn>,
    },
    Modify {
        msg: SessionModificationRequest,
        seq: u32,
        peer: Arc<PeerConn>,
    },
    Delete {
        msg: SessionDeletionRequest,
        seq: u32,
        peer: Arc<PeerConn>,
    },
}

struct UpSession {
    cp_seid: u64,
    jobs: mpsc::UnboundedSender<UpJob>,
}

/// SMF-facing half of the session dispatcher.
///
/// Each session gets a worker task consuming its requests strictly in
/// arrival order; the worker keeps at most one request outstanding
/// toward the Down plane, which is what preserves PFCP's per-session
/// ordering without any global lock.
pub struct UpPlane {
    cfg: Arc<Config>,
    node: Arc<Node>,
    to_down: UpToDown,
    smf: Mutex<Option<Arc<PeerConn>>>,
    smf_recovery: Mutex<Option<u32>>,
    next_seid: AtomicU64,
    sessions: Mutex<AHashMap<u64, UpSession>>,
    backends: Mutex<Vec<UpfD2u>>,
    me: Weak<Self>,
}

impl UpPlane {
    pub fn new(cfg: Arc<Config>, node: Arc<Node>, to_down: UpToDown) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            cfg,
            node,
            to_down,
            smf: Mutex::new(None),
            smf_recovery: Mutex::new(None),
            next_seid: AtomicU64::new(1),
            sessions: Mutex::new(AHashMap::new()),
            backends: Mutex::new(Vec::new()),
            me: me.clone(),
        })
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn backends(&self) -> Vec<UpfD2u> {
        self.backends.lock().clone()
    }

    /// Consumes the Down→Up side of the bus.
    pub fn spawn_listeners(self: &Arc<Self>, rx: DownToUpRx) {
        let DownToUpRx {
            mut reports,
            mut upfs,
        } = rx;

        let plane = self.clone();
        tokio::spawn(async move {
            while let Some(rep) = reports.recv().await {
                let plane = plane.clone();
                tokio::spawn(async move { plane.forward_report(rep).await });
            }
        });

        let plane = self.clone();
        tokio::spawn(async move {
            while let Some(upf) = upfs.recv().await {
                log::info!("backend available: node_id={}, addr={}", upf.node_id, upf.addr);
                plane.backends.lock().push(upf);
            }
        });
    }

    async fn handle_association(&self, conn: Arc<PeerConn>, hdr: Header, raw: Vec<u8>) {
        let Ok(msg) = AssociationSetupRequest::unmarshal(&raw) else {
            log::debug!("bad association setup request: peer={}", conn.addr);
            return;
        };

        let ts = recovery_secs(&msg.recovery_time_stamp);
        let restarted = {
            let mut prev = self.smf_recovery.lock();
            let restarted = matches!((*prev, ts), (Some(p), Some(t)) if p != t);
            *prev = ts;
            restarted
        };
        if restarted {
            log::warn!("smf restarted, resetting all sessions: peer={}", conn.addr);
            let _ = self.to_down.reset_sessions.send(()).await;
            self.sessions.lock().clear();
        }

        let was_up = conn.is_up();
        conn.set_state(AssocState::Up);
        *self.smf.lock() = Some(conn.clone());

        let resp = AssociationSetupResponseBuilder::new(hdr.sequence_number)
            .cause_accepted()
            .node_id_ie(self.node.node_id_ie())
            .recovery_time_stamp_ie(self.node.recovery_ts_ie())
            .build();
        let bytes = resp.marshal();
        conn.send_datagram(&bytes).await;
        conn.remember(*hdr.sequence_number, bytes);

        if !was_up && self.cfg.enable_hb_timer {
            conn.spawn_heartbeat(
                self.cfg.heart_beat_interval,
                self.node.recovery_ts(),
                self.node.peer_down_sender(),
            );
        }
    }

    fn enqueue(&self, up_seid: u64, job: UpJob) -> bool {
        let sessions = self.sessions.lock();
        match sessions.get(&up_seid) {
            Some(session) => session.jobs.send(job).is_ok(),
            None => false,
        }
    }

    async fn forward_report(&self, rep: SesRepD2u) {
        let cp_seid = self
            .sessions
            .lock()
            .get(&rep.up_seid)
            .map(|s| s.cp_seid)
            .unwrap_or(rep.up_seid);
        let smf = self.smf.lock().clone();

        let result = match smf {
            Some(conn) if conn.is_up() => match SessionReportRequest::unmarshal(&rep.raw) {
                Ok(mut msg) => {
                    msg.header.seid = rs_pfcp::Seid(cp_seid);
                    match conn.request(&mut msg).await {
                        Ok(raw) => SessionReportResponse::unmarshal(&raw)
                            .map_err(|_| ConnError::Malformed)
                            .and_then(|resp| cause_of(&resp.cause.payload)),
                        Err(e) => Err(e),
                    }
                }
                Err(_) => Err(ConnError::Malformed),
            },
            _ => Err(ConnError::AssociationDown),
        };

        if let Err(e) = &result {
            log::warn!("session report not delivered: up_seid={:#x}, err={}", rep.up_seid, e);
        }
        if let Some(tx) = rep.resp {
            let _ = tx.send(result);
        }
        if rep.invalidate {
            self.sessions.lock().remove(&rep.up_seid);
        }
    }
}

#[async_trait]
impl PlaneHandler for UpPlane {
    async fn on_request(&self, conn: Arc<PeerConn>, hdr: Header, raw: Vec<u8>) {
        match hdr.message_type {
            MsgType::AssociationSetupRequest => self.handle_association(conn, hdr, raw).await,
            MsgType::AssociationReleaseRequest => {
                // The SMF dropped the association; every session it
                // owned goes with it.
                log::warn!("smf released the association: peer={}", conn.addr);
                let resp = AssociationReleaseResponseBuilder::new(hdr.sequence_number)
                    .cause_accepted()
                    .node_id(self.node.node_id_ie())
                    .build();
                conn.send_datagram(&resp.marshal()).await;
                conn.set_state(AssocState::Down);
                *self.smf.lock() = None;
                let _ = self.to_down.reset_sessions.send(()).await;
                self.sessions.lock().clear();
            }
            MsgType::HeartbeatRequest => {
                let resp = HeartbeatResponseBuilder::new(hdr.sequence_number)
                    .recovery_time_stamp_ie(self.node.recovery_ts_ie())
                    .build();
                conn.send_datagram(&resp.marshal()).await;
            }
            MsgType::SessionEstablishmentRequest => {
                let Ok(msg) = SessionEstablishmentRequest::unmarshal(&raw) else {
                    log::debug!("malformed establishment dropped: peer={}", conn.addr);
                    return;
                };
                let Ok(cp_fseid) = Fseid::unmarshal(&msg.fseid.payload) else {
                    log::debug!("establishment without CP F-SEID dropped: peer={}", conn.addr);
                    return;
                };
                let Some(plane) = self.me.upgrade() else {
                    return;
                };

                let up_seid = self.next_seid.fetch_add(1, Ordering::Relaxed);
                let (jobs, job_rx) = mpsc::unbounded_channel();
                self.sessions.lock().insert(
                    up_seid,
                    UpSession {
                        cp_seid: cp_fseid.seid.0,
                        jobs: jobs.clone(),
                    },
                );
                tokio::spawn(session_worker(plane, up_seid, cp_fseid.seid.0, job_rx));

                let _ = jobs.send(UpJob::Establish {
                    msg,
                    seq: *hdr.sequence_number,
                    peer: conn,
                });
            }
            MsgType::SessionModificationRequest => {
                let Ok(msg) = SessionModificationRequest::unmarshal(&raw) else {
                    log::debug!("malformed modification dropped: peer={}", conn.addr);
                    return;
                };
                let job = UpJob::Modify {
                    msg,
                    seq: *hdr.sequence_number,
                    peer: conn.clone(),
                };
                if !self.enqueue(*hdr.seid, job) {
                    let resp = SessionModificationResponseBuilder::new(hdr.seid, hdr.sequence_number)
                        .cause(CauseValue::SessionContextNotFound)
                        .build();
                    conn.send_datagram(&resp.marshal()).await;
                }
            }
            MsgType::SessionDeletionRequest => {
                let Ok(msg) = SessionDeletionRequest::unmarshal(&raw) else {
                    log::debug!("malformed deletion dropped: peer={}", conn.addr);
                    return;
                };
                let job = UpJob::Delete {
                    msg,
                    seq: *hdr.sequence_number,
                    peer: conn.clone(),
                };
                if !self.enqueue(*hdr.seid, job) {
                    let cause_ie = Ie::new(
                        IeType::Cause,
                        Cause::new(CauseValue::SessionContextNotFound).marshal().to_vec(),
                    );
                    let resp = SessionDeletionResponseBuilder::new(hdr.seid, hdr.sequence_number)
                        .cause_ie(cause_ie)
                        .build();
                    conn.send_datagram(&resp.marshal()).await;
                }
            }
            other => {
                log::debug!("unhandled message dropped: peer={}, type={:?}", conn.addr, other);
            }
        }
    }

    async fn on_peer_down(&self, addr: SocketAddr) {
        let mut smf = self.smf.lock();
        if smf.as_ref().map(|c| c.addr) == Some(addr) {
            log::warn!("smf association lost: peer={}", addr);
            *smf = None;
        }
    }
}

/// Per-session FIFO: one request at a time travels toward the Down
/// plane; everything else queues here in arrival order.
async fn session_worker(
    plane: Arc<UpPlane>,
    up_seid: u64,
    cp_seid: u64,
    mut jobs: mpsc::UnboundedReceiver<UpJob>,
) {
    while let Some(job) = jobs.recv().await {
        match job {
            UpJob::Establish { msg, seq, peer } => {
                let (tx, rx) = oneshot::channel();
                let sent = plane
                    .to_down
                    .ses_est
                    .send(SesEstU2d {
                        up_seid,
                        cp_seid,
                        msg,
                        resp: tx,
                    })
                    .await
                    .is_ok();
                let reply = reply_or_map(sent, rx.await, CauseValue::NoResourcesAvailable);

                let fseid_ie = Ie::new(
                    IeType::Fseid,
                    Fseid::new(up_seid, Some(plane.node.node_ip()), None).marshal(),
                );
                match SessionEstablishmentResponseBuilder::new(cp_seid, seq, reply.cause)
                    .node_id_ie(plane.node.node_id_ie())
                    .fseid_ie(fseid_ie)
                    .build()
                {
                    Ok(resp) => {
                        let bytes = resp.marshal();
                        peer.send_datagram(&bytes).await;
                        peer.remember(seq, bytes);
                    }
                    Err(e) => log::error!("building establishment response failed: {}", e),
                }

                if !reply.accepted() {
                    break;
                }
            }
            UpJob::Modify { msg, seq, peer } => {
                let (tx, rx) = oneshot::channel();
                let sent = plane
                    .to_down
                    .ses_mod
                    .send(SesModU2d {
                        up_seid,
                        msg,
                        resp: tx,
                    })
                    .await
                    .is_ok();
                let reply = reply_or_map(sent, rx.await, CauseValue::SessionContextNotFound);

                let resp = SessionModificationResponseBuilder::new(cp_seid, seq)
                    .cause(reply.cause)
                    .build();
                let bytes = resp.marshal();
                peer.send_datagram(&bytes).await;
                peer.remember(seq, bytes);
            }
            UpJob::Delete { msg, seq, peer } => {
                let (tx, rx) = oneshot::channel();
                let sent = plane
                    .to_down
                    .ses_del
                    .send(SesDelU2d {
                        up_seid,
                        msg,
                        resp: tx,
                    })
                    .await
                    .is_ok();
                let reply = reply_or_map(sent, rx.await, CauseValue::SessionContextNotFound);

                let cause_ie = Ie::new(IeType::Cause, Cause::new(reply.cause).marshal().to_vec());
                let resp = SessionDeletionResponseBuilder::new(cp_seid, seq)
                    .cause_ie(cause_ie)
                    .build();
                let bytes = resp.marshal();
                peer.send_datagram(&bytes).await;
                peer.remember(seq, bytes);

                if reply.accepted() {
                    break;
                }
            }
        }
    }

    plane.sessions.lock().remove(&up_seid);
}

/// Maps transport failures on the southbound leg to the PFCP cause the
/// SMF sees. Timeouts become `timeout_cause` (message-dependent per the
/// N4 profile), a torn-down association becomes "no established PFCP
/// association" and anything unparseable becomes "system failure".
fn reply_or_map(
    sent: bool,
    result: Result<ForwardResult, oneshot::error::RecvError>,
    timeout_cause: CauseValue,
) -> ForwardReply {
    if !sent {
        return ForwardReply::cause(CauseValue::SystemFailure);
    }
    match result {
        Ok(Ok(reply)) => reply,
        Ok(Err(ConnError::Timeout)) => ForwardReply::cause(timeout_cause),
        Ok(Err(ConnError::AssociationDown)) => {
            ForwardReply::cause(CauseValue::NoEstablishedPfcpAssociation)
        }
        Ok(Err(ConnError::Malformed)) => ForwardReply::cause(CauseValue::SystemFailure),
        Err(_) => ForwardReply::cause(CauseValue::SystemFailure),
    }
}

fn recovery_secs(ie: &Ie) -> Option<u32> {
    ie.payload
        .get(..4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

// ---------------------------------------------------------------------
// Down plane
// ---------------------------------------------------------------------

/// UPF-facing half of the session dispatcher.
///
/// Owns the down-side SEID space and drives the balancer: bindings are
/// created here on accepted establishments and torn down on deletions,
/// restarts and drains.
pub struct DownPlane {
    pub node: Arc<Node>,
    pub balancer: Arc<Balancer>,
    to_up: DownToUp,
    next_down_seid: AtomicU64,
    gates: Mutex<AHashMap<u64, Arc<AsyncMutex<()>>>>,
    me: Weak<Self>,
}

impl DownPlane {
    pub fn new(node: Arc<Node>, balancer: Arc<Balancer>, to_up: DownToUp) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            node,
            balancer,
            to_up,
            next_down_seid: AtomicU64::new(1),
            gates: Mutex::new(AHashMap::new()),
            me: me.clone(),
        })
    }

    pub fn mint_down_seid(&self) -> u64 {
        self.next_down_seid.fetch_add(1, Ordering::Relaxed)
    }

    /// The per-session lock serialising forwards and migration replay.
    pub fn gate(&self, up_seid: u64) -> Arc<AsyncMutex<()>> {
        self.gates
            .lock()
            .entry(up_seid)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub fn drop_gate(&self, up_seid: u64) {
        self.gates.lock().remove(&up_seid);
    }

    /// Registers a backend, opens its N4 association and announces it
    /// to the Up plane. Used by the control API and the autoscaler.
    pub async fn register_upf(&self, rec: UpfRecord) -> Result<usize, ConnError> {
        let node_id = rec.node_id.clone();
        let addr = rec.addr;
        let idx = self.balancer.register(rec);
        let (_conn, recovery) = self.node.try_connect_n4_peer(addr).await?;
        if let Some(ts) = recovery {
            self.balancer.note_recovery(idx, ts);
        }
        let _ = self.to_up.upfs.send(UpfD2u { node_id, addr }).await;
        Ok(idx)
    }

    /// Consumes the Up→Down side of the bus.
    pub fn spawn_listeners(self: &Arc<Self>, rx: UpToDownRx) {
        let UpToDownRx {
            mut ses_est,
            mut ses_mod,
            mut ses_del,
            mut reset_sessions,
        } = rx;

        let plane = self.clone();
        tokio::spawn(async move {
            while let Some(env) = ses_est.recv().await {
                let plane = plane.clone();
                tokio::spawn(async move {
                    let result = plane.establish(env.up_seid, env.cp_seid, env.msg).await;
                    let _ = env.resp.send(result);
                });
            }
        });

        let plane = self.clone();
        tokio::spawn(async move {
            while let Some(env) = ses_mod.recv().await {
                let plane = plane.clone();
                tokio::spawn(async move {
                    let gate = plane.gate(env.up_seid);
                    let _quiesced = gate.lock().await;
                    let result = plane.modify(env.up_seid, env.msg).await;
                    let _ = env.resp.send(result);
                });
            }
        });

        let plane = self.clone();
        tokio::spawn(async move {
            while let Some(env) = ses_del.recv().await {
                let plane = plane.clone();
                tokio::spawn(async move {
                    let gate = plane.gate(env.up_seid);
                    let _quiesced = gate.lock().await;
                    let result = plane.delete(env.up_seid, env.msg).await;
                    let _ = env.resp.send(result);
                });
            }
        });

        let plane = self.clone();
        tokio::spawn(async move {
            while reset_sessions.recv().await.is_some() {
                plane.reset_sessions().await;
            }
        });
    }

    fn upf_conn(&self, addr: SocketAddr) -> Result<Arc<PeerConn>, ConnError> {
        match self.node.get_conn(&addr) {
            Some(conn) if conn.is_up() => Ok(conn),
            _ => Err(ConnError::AssociationDown),
        }
    }

    async fn establish(
        &self,
        up_seid: u64,
        cp_seid: u64,
        msg: SessionEstablishmentRequest,
    ) -> ForwardResult {
        let idx = match self.balancer.pick() {
            Ok(idx) => idx,
            Err(_) => return Ok(ForwardReply::cause(CauseValue::NoResourcesAvailable)),
        };
        let addr = self.balancer.upf_addr(idx).ok_or(ConnError::AssociationDown)?;
        let conn = self.upf_conn(addr)?;

        let down_seid = self.mint_down_seid();
        let mut fwd = msg;
        rewrite_establishment(&mut fwd, self.node.node_id_ie(), self.down_fseid(down_seid));

        let raw = conn.request(&mut fwd).await?;
        let resp =
            SessionEstablishmentResponse::unmarshal(&raw).map_err(|_| ConnError::Malformed)?;
        let cause = cause_of(&resp.cause_ie().payload)?;
        if cause != CauseValue::RequestAccepted {
            log::warn!(
                "establishment rejected by upf: upf={}, cause={:?}",
                idx,
                cause
            );
            return Ok(ForwardReply::cause(cause));
        }
        let upf_fseid = resp.fseid().map_err(|_| ConnError::Malformed)?;

        let mut entry = SessionEntry::new(up_seid, cp_seid, down_seid, upf_fseid.seid.0, idx);
        entry.est_msg = fwd.marshal();
        // Create the gate before the binding becomes routable.
        let _ = self.gate(up_seid);
        if let Err(e) = self.balancer.insert(entry) {
            log::error!("binding new session failed: up_seid={:#x}, err={}", up_seid, e);
            return Err(ConnError::Malformed);
        }

        log::info!(
            "session established: up_seid={:#x}, upf={}, down_seid={:#x}",
            up_seid,
            idx,
            down_seid
        );
        Ok(ForwardReply {
            cause,
            upf_fseid: Some(upf_fseid),
        })
    }

    async fn modify(&self, up_seid: u64, msg: SessionModificationRequest) -> ForwardResult {
        let Some(route) = self.balancer.route(up_seid) else {
            return Ok(ForwardReply::cause(CauseValue::SessionContextNotFound));
        };
        let conn = self.upf_conn(route.addr)?;

        let mut fwd = msg;
        fwd.header.seid = rs_pfcp::Seid(route.upf_seid);
        let raw = conn.request(&mut fwd).await?;
        let resp =
            SessionModificationResponse::unmarshal(&raw).map_err(|_| ConnError::Malformed)?;
        let cause = cause_of(&resp.cause.payload)?;
        if cause == CauseValue::RequestAccepted {
            let _ = self.balancer.push_mod(up_seid, fwd.marshal());
        }
        Ok(ForwardReply::cause(cause))
    }

    async fn delete(&self, up_seid: u64, msg: SessionDeletionRequest) -> ForwardResult {
        let Some(route) = self.balancer.route(up_seid) else {
            return Ok(ForwardReply::cause(CauseValue::SessionContextNotFound));
        };
        let conn = self.upf_conn(route.addr)?;

        let mut fwd = msg;
        fwd.header.seid = rs_pfcp::Seid(route.upf_seid);
        let raw = conn.request(&mut fwd).await?;
        let resp = SessionDeletionResponse::unmarshal(&raw).map_err(|_| ConnError::Malformed)?;
        let cause = cause_of(&resp.cause.payload)?;
        if cause == CauseValue::RequestAccepted {
            self.balancer.remove(up_seid);
            self.drop_gate(up_seid);
            log::info!("session deleted: up_seid={:#x}", up_seid);
        }
        Ok(ForwardReply::cause(cause))
    }

    /// Admin reset: every session is deleted on its UPF (best effort)
    /// and purged from the binding table.
    pub async fn reset_sessions(&self) {
        let mut purged = Vec::new();
        for view in self.balancer.views() {
            purged.extend(self.balancer.invalidate_peer(view.index));
        }
        log::warn!("resetting sessions: count={}", purged.len());

        for entry in purged {
            self.drop_gate(entry.up_seid);
            if let Some(addr) = self.balancer.upf_addr(entry.upf) {
                if let Ok(conn) = self.upf_conn(addr) {
                    let mut del = rs_pfcp::message::session_deletion_request::SessionDeletionRequestBuilder::new(
                        entry.upf_seid,
                        0,
                    )
                    .build();
                    let _ = conn.request(&mut del).await;
                }
            }
        }
    }

    /// Tears down everything bound to a UPF and notifies the SMF with
    /// one Session Report per invalidated session.
    pub async fn invalidate_upf(&self, idx: usize, reason: &str) {
        let purged = self.balancer.invalidate_peer(idx);
        if purged.is_empty() {
            return;
        }
        log::warn!(
            "upf sessions invalidated: upf={}, count={}, reason={}",
            idx,
            purged.len(),
            reason
        );

        for entry in purged {
            self.drop_gate(entry.up_seid);
            let _ = self
                .to_up
                .reports
                .send(SesRepD2u {
                    up_seid: entry.up_seid,
                    raw: recovery_report(),
                    resp: None,
                    invalidate: true,
                })
                .await;
        }
    }

    pub fn down_fseid(&self, down_seid: u64) -> Ie {
        Ie::new(
            IeType::Fseid,
            Fseid::new(down_seid, Some(self.node.node_ip()), None).marshal(),
        )
    }

    async fn handle_upf_association(&self, conn: Arc<PeerConn>, hdr: Header, raw: Vec<u8>) {
        let Ok(msg) = AssociationSetupRequest::unmarshal(&raw) else {
            log::debug!("bad association setup request: peer={}", conn.addr);
            return;
        };

        let resp = AssociationSetupResponseBuilder::new(hdr.sequence_number)
            .cause_accepted()
            .node_id_ie(self.node.node_id_ie())
            .recovery_time_stamp_ie(self.node.recovery_ts_ie())
            .build();
        let bytes = resp.marshal();
        conn.send_datagram(&bytes).await;
        conn.remember(*hdr.sequence_number, bytes);
        conn.set_state(AssocState::Up);

        let Some(idx) = self.balancer.find_by_addr(conn.addr) else {
            log::warn!("association from unregistered peer: addr={}", conn.addr);
            return;
        };
        if let Some(ts) = recovery_secs(&msg.recovery_time_stamp) {
            if self.balancer.note_recovery(idx, ts) {
                if let Some(plane) = self.me.upgrade() {
                    tokio::spawn(async move {
                        plane.invalidate_upf(idx, "recovery timestamp changed").await;
                    });
                }
            }
        }
    }

    async fn handle_report(&self, conn: Arc<PeerConn>, hdr: Header, raw: Vec<u8>) {
        let Some((up_seid, route)) = self.balancer.route_by_down(*hdr.seid) else {
            let resp = SessionReportResponseBuilder::new(
                0u64,
                hdr.sequence_number,
                CauseValue::SessionContextNotFound,
            )
            .build();
            if let Ok(resp) = resp {
                conn.send_datagram(&resp.marshal()).await;
            }
            return;
        };

        let (tx, rx) = oneshot::channel();
        let sent = self
            .to_up
            .reports
            .send(SesRepD2u {
                up_seid,
                raw,
                resp: Some(tx),
                invalidate: false,
            })
            .await
            .is_ok();
        let cause = if sent {
            match rx.await {
                Ok(Ok(cause)) => cause,
                _ => CauseValue::SystemFailure,
            }
        } else {
            CauseValue::SystemFailure
        };

        let resp = SessionReportResponseBuilder::new(route.upf_seid, hdr.sequence_number, cause).build();
        if let Ok(resp) = resp {
            let bytes = resp.marshal();
            conn.send_datagram(&bytes).await;
            conn.remember(*hdr.sequence_number, bytes);
        }
    }
}

#[async_trait]
impl PlaneHandler for DownPlane {
    async fn on_request(&self, conn: Arc<PeerConn>, hdr: Header, raw: Vec<u8>) {
        match hdr.message_type {
            MsgType::HeartbeatRequest => {
                let resp = HeartbeatResponseBuilder::new(hdr.sequence_number)
                    .recovery_time_stamp_ie(self.node.recovery_ts_ie())
                    .build();
                conn.send_datagram(&resp.marshal()).await;
            }
            MsgType::AssociationSetupRequest => {
                self.handle_upf_association(conn, hdr, raw).await;
            }
            MsgType::AssociationReleaseRequest => {
                log::warn!("upf released the association: peer={}", conn.addr);
                let resp = AssociationReleaseResponseBuilder::new(hdr.sequence_number)
                    .cause_accepted()
                    .node_id(self.node.node_id_ie())
                    .build();
                conn.send_datagram(&resp.marshal()).await;
                conn.set_state(AssocState::Down);
                conn.fail_all();
                if let (Some(idx), Some(plane)) =
                    (self.balancer.find_by_addr(conn.addr), self.me.upgrade())
                {
                    tokio::spawn(async move {
                        let _ = plane.balancer.mark_removed(idx);
                        plane.invalidate_upf(idx, "association released").await;
                    });
                }
            }
            // Forwarding a report round-trips through the SMF; it must
            // not hold up the plane's reader.
            MsgType::SessionReportRequest => {
                if let Some(plane) = self.me.upgrade() {
                    tokio::spawn(async move { plane.handle_report(conn, hdr, raw).await });
                }
            }
            other => {
                log::debug!("unhandled message dropped: peer={}, type={:?}", conn.addr, other);
            }
        }
    }

    async fn on_peer_down(&self, addr: SocketAddr) {
        let Some(idx) = self.balancer.find_by_addr(addr) else {
            return;
        };
        log::warn!("upf association lost: upf={}, addr={}", idx, addr);
        let _ = self.balancer.mark_removed(idx);
        self.invalidate_upf(idx, "association down").await;
    }
}

/// Retargets an incoming Establishment at the proxy's own southbound
/// identity, keeping the header length consistent.
fn rewrite_establishment(msg: &mut SessionEstablishmentRequest, node_id: Ie, fseid: Ie) {
    msg.header.length =
        msg.header.length - msg.node_id.len() - msg.fseid.len() + node_id.len() + fseid.len();
    msg.node_id = node_id;
    msg.fseid = fseid;
}

/// Session Report announcing that the session's UPF restarted; the Up
/// plane rewrites the SEID toward the SMF.
fn recovery_report() -> Vec<u8> {
    let report_type = Ie::new(
        IeType::ReportType,
        ReportType::new().with_error_indication_report(true).marshal(),
    );
    let cause = Ie::new(IeType::Cause, vec![CAUSE_PFCP_ENTITY_IN_RECOVERY]);
    SessionReportRequestBuilder::new(0u64, 0u32)
        .report_type(report_type)
        .ies(vec![cause])
        .build()
        .marshal()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_map_to_the_right_causes() {
        let ok = ForwardReply::cause(CauseValue::RequestAccepted);
        let mapped = reply_or_map(true, Ok(Ok(ok)), CauseValue::NoResourcesAvailable);
        assert_eq!(mapped.cause, CauseValue::RequestAccepted);

        let mapped = reply_or_map(
            true,
            Ok(Err(ConnError::Timeout)),
            CauseValue::NoResourcesAvailable,
        );
        assert_eq!(mapped.cause, CauseValue::NoResourcesAvailable);

        let mapped = reply_or_map(
            true,
            Ok(Err(ConnError::Timeout)),
            CauseValue::SessionContextNotFound,
        );
        assert_eq!(mapped.cause, CauseValue::SessionContextNotFound);

        let mapped = reply_or_map(
            true,
            Ok(Err(ConnError::AssociationDown)),
            CauseValue::NoResourcesAvailable,
        );
        assert_eq!(mapped.cause, CauseValue::NoEstablishedPfcpassociation);

        let mapped = reply_or_map(
            true,
            Ok(Err(ConnError::Malformed)),
            CauseValue::NoResourcesAvailable,
        );
        assert_eq!(mapped.cause, CauseValue::SystemFailure);

        let mapped = reply_or_map(false, Ok(Ok(ok)), CauseValue::NoResourcesAvailable);
        assert_eq!(mapped.cause, CauseValue::SystemFailure);
    }

    #[test]
    fn recovery_report_parses_back() {
        let raw = recovery_report();
        let msg = SessionReportRequest::unmarshal(&raw).unwrap();
        let report_type = msg.report_type.expect("report type present");
        assert!(ReportType::unmarshal(&report_type.payload)
            .unwrap()
            .is_error_indication_report());
        let cause = msg
            .ies
            .iter()
            .find(|ie| ie.ie_type == IeType::Cause)
            .expect("cause present");
        assert_eq!(cause.payload[0], CAUSE_PFCP_ENTITY_IN_RECOVERY);
    }
}

//! End-to-end proxy scenarios over loopback UDP: a mock SMF drives the
//! Up plane while mock UPFs answer on the Down plane.

use std::{
    collections::HashMap,
    net::{Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use pfcp_lb::{
    autoscale::{Autoscaler, NullProbe, WorkloadProvisioner},
    config::Config,
    Proxy,
};
use rs_pfcp::ie::{
    cause::{Cause, CauseValue},
    create_far::CreateFar,
    create_pdr::CreatePdr,
    destination_interface::Interface,
    far_id::FarId,
    fseid::Fseid,
    node_id::NodeId,
    pdr_id::PdrId,
    precedence::Precedence,
    recovery_time_stamp::RecoveryTimeStamp,
    Ie, IeType,
};
use rs_pfcp::message::{
    association_setup_request::AssociationSetupRequestBuilder,
    association_setup_response::AssociationSetupResponseBuilder,
    heartbeat_response::HeartbeatResponseBuilder,
    parse,
    session_deletion_request::SessionDeletionRequestBuilder,
    session_deletion_response::SessionDeletionResponse,
    session_establishment_request::{
        SessionEstablishmentRequest, SessionEstablishmentRequestBuilder,
    },
    session_establishment_response::{
        SessionEstablishmentResponse, SessionEstablishmentResponseBuilder,
    },
    session_modification_request::SessionModificationRequestBuilder,
    session_modification_response::{
        SessionModificationResponse, SessionModificationResponseBuilder,
    },
    session_report_request::SessionReportRequest,
    session_report_response::SessionReportResponseBuilder,
    Message, MsgType,
};
use tokio::net::UdpSocket;

fn test_config() -> Arc<Config> {
    let mut cfg = Config::default();
    cfg.up_addr = "127.0.0.1:0".parse().unwrap();
    cfg.down_addr = "127.0.0.1:0".parse().unwrap();
    cfg.cpiface.http_port = "0".into();
    cfg.resp_timeout = Duration::from_secs(1);
    cfg.max_req_retries = 2;
    cfg.enable_hb_timer = false;
    cfg.heart_beat_interval = Duration::from_secs(60);
    Arc::new(cfg)
}

#[derive(Default)]
struct ProvisionerLog {
    created: Mutex<Vec<String>>,
    destroyed: Mutex<Vec<String>>,
}

struct MockProvisioner(Arc<ProvisionerLog>);

#[async_trait]
impl WorkloadProvisioner for MockProvisioner {
    async fn create(&self, name: &str) -> Result<()> {
        self.0.created.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn destroy(&self, name: &str) -> Result<()> {
        self.0.destroyed.lock().unwrap().push(name.to_string());
        Ok(())
    }
}

async fn start_proxy(cfg: Arc<Config>) -> (Proxy, Arc<ProvisionerLog>) {
    let log = Arc::new(ProvisionerLog::default());
    let proxy = Proxy::start(
        cfg,
        Arc::new(MockProvisioner(log.clone())),
        Arc::new(NullProbe),
    )
    .await
    .expect("proxy start");
    (proxy, log)
}

// ---------------------------------------------------------------------
// Mock UPF
// ---------------------------------------------------------------------

#[derive(Default)]
struct UpfState {
    /// upf_seid -> proxy down_seid, for live sessions.
    sessions: HashMap<u64, u64>,
    est_count: usize,
    mod_count: usize,
    del_count: usize,
}

struct MockUpf {
    addr: SocketAddr,
    socket: Arc<UdpSocket>,
    state: Arc<Mutex<UpfState>>,
}

impl MockUpf {
    async fn spawn(answer_sessions: bool) -> MockUpf {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        let state: Arc<Mutex<UpfState>> = Arc::default();
        let next_seid = Arc::new(AtomicU64::new(0xB000));

        let loop_socket = socket.clone();
        let loop_state = state.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let node_id_ie = NodeId::new_ipv4(Ipv4Addr::LOCALHOST).to_ie();
            let recovery_ie = Ie::new(
                IeType::RecoveryTimeStamp,
                RecoveryTimeStamp::new(std::time::SystemTime::now())
                    .marshal()
                    .to_vec(),
            );
            while let Ok((size, from)) = loop_socket.recv_from(&mut buf).await {
                let Ok(msg) = parse(&buf[..size]) else { continue };
                let seq = msg.sequence();
                let reply: Option<Vec<u8>> = match msg.msg_type() {
                    MsgType::AssociationSetupRequest => Some(
                        AssociationSetupResponseBuilder::new(seq)
                            .cause_accepted()
                            .node_id_ie(node_id_ie.clone())
                            .recovery_time_stamp_ie(recovery_ie.clone())
                            .build()
                            .marshal(),
                    ),
                    MsgType::HeartbeatRequest => Some(
                        HeartbeatResponseBuilder::new(seq)
                            .recovery_time_stamp_ie(recovery_ie.clone())
                            .build()
                            .marshal(),
                    ),
                    MsgType::SessionEstablishmentRequest if answer_sessions => {
                        let req = SessionEstablishmentRequest::unmarshal(&buf[..size]).unwrap();
                        let down_seid = Fseid::unmarshal(&req.fseid.payload).unwrap().seid.0;
                        let upf_seid = next_seid.fetch_add(1, Ordering::Relaxed);
                        {
                            let mut st = loop_state.lock().unwrap();
                            st.sessions.insert(upf_seid, down_seid);
                            st.est_count += 1;
                        }
                        let fseid_ie = Ie::new(
                            IeType::Fseid,
                            Fseid::new(upf_seid, Some(Ipv4Addr::LOCALHOST), None).marshal(),
                        );
                        Some(
                            SessionEstablishmentResponseBuilder::accepted(down_seid, seq)
                                .node_id(node_id_ie.clone())
                                .fseid_ie(fseid_ie)
                                .build()
                                .unwrap()
                                .marshal(),
                        )
                    }
                    MsgType::SessionModificationRequest if answer_sessions => {
                        let seid = msg.seid().unwrap_or(0);
                        let known = {
                            let mut st = loop_state.lock().unwrap();
                            st.mod_count += 1;
                            st.sessions.contains_key(&seid)
                        };
                        let cause = if known {
                            CauseValue::RequestAccepted
                        } else {
                            CauseValue::SessionContextNotFound
                        };
                        Some(
                            SessionModificationResponseBuilder::new(seid, seq)
                                .cause(cause)
                                .build()
                                .marshal(),
                        )
                    }
                    MsgType::SessionDeletionRequest if answer_sessions => {
                        let seid = msg.seid().unwrap_or(0);
                        let known = {
                            let mut st = loop_state.lock().unwrap();
                            st.del_count += 1;
                            st.sessions.remove(&seid).is_some()
                        };
                        let cause = if known {
                            CauseValue::RequestAccepted
                        } else {
                            CauseValue::SessionContextNotFound
                        };
                        let cause_ie = Ie::new(IeType::Cause, Cause::new(cause).marshal().to_vec());
                        Some(SessionDeletionResponse::new(seid, seq, cause_ie, None, vec![]).marshal())
                    }
                    _ => None,
                };
                if let Some(bytes) = reply {
                    let _ = loop_socket.send_to(&bytes, from).await;
                }
            }
        });

        MockUpf { addr, socket, state }
    }

    fn session_count(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }

    fn est_count(&self) -> usize {
        self.state.lock().unwrap().est_count
    }

    /// Re-associates with a fresh recovery timestamp, i.e. pretends the
    /// UPF restarted and lost its session state.
    async fn send_restart_association(&self, to: SocketAddr) {
        self.state.lock().unwrap().sessions.clear();
        let recovery = RecoveryTimeStamp::new(
            std::time::SystemTime::now() + Duration::from_secs(1000),
        );
        let req = AssociationSetupRequestBuilder::new(0x7777)
            .node_id_ie(NodeId::new_ipv4(Ipv4Addr::LOCALHOST).to_ie())
            .recovery_time_stamp_ie(Ie::new(
                IeType::RecoveryTimeStamp,
                recovery.marshal().to_vec(),
            ))
            .build();
        self.socket.send_to(&req.marshal(), to).await.unwrap();
    }
}

async fn register_upf(proxy: &Proxy, upf: &MockUpf) {
    let url = format!("http://127.0.0.1:{}/", proxy.down_api.port());
    let body = serde_json::json!({
        "ip": upf.addr.to_string(),
        "upf": { "hostname": format!("upf-{}", upf.addr.port()), "dnn": "internet" }
    });
    let resp = reqwest::Client::new()
        .post(&url)
        .json(&body)
        .send()
        .await
        .expect("register request");
    assert_eq!(resp.status(), reqwest::StatusCode::CREATED);
}

// ---------------------------------------------------------------------
// Mock SMF
// ---------------------------------------------------------------------

struct Smf {
    socket: UdpSocket,
    seq: u32,
    node_id_ie: Ie,
    recovery_ie: Ie,
}

impl Smf {
    async fn connect(target: SocketAddr) -> Smf {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(target).await.unwrap();
        Smf {
            socket,
            seq: 0,
            node_id_ie: NodeId::new_ipv4(Ipv4Addr::LOCALHOST).to_ie(),
            recovery_ie: Ie::new(
                IeType::RecoveryTimeStamp,
                RecoveryTimeStamp::new(std::time::SystemTime::now())
                    .marshal()
                    .to_vec(),
            ),
        }
    }

    fn next_seq(&mut self) -> u32 {
        self.seq += 1;
        self.seq
    }

    /// Sends a request and waits for its response, answering any
    /// requests (reports, heartbeats) that arrive in between.
    async fn rpc(&mut self, bytes: Vec<u8>) -> Vec<u8> {
        self.socket.send(&bytes).await.unwrap();
        let mut buf = vec![0u8; 4096];
        loop {
            let size = tokio::time::timeout(Duration::from_secs(10), self.socket.recv(&mut buf))
                .await
                .expect("response in time")
                .unwrap();
            let data = buf[..size].to_vec();
            let Ok(msg) = parse(&data) else { continue };
            match msg.msg_type() {
                MsgType::SessionReportRequest => {
                    self.answer_report(msg.seid().unwrap_or(0), msg.sequence()).await;
                }
                MsgType::HeartbeatRequest => {
                    let resp = HeartbeatResponseBuilder::new(msg.sequence())
                        .recovery_time_stamp_ie(self.recovery_ie.clone())
                        .build();
                    let _ = self.socket.send(&resp.marshal()).await;
                }
                _ => return data,
            }
        }
    }

    async fn answer_report(&self, seid: u64, seq: u32) {
        let resp = SessionReportResponseBuilder::accepted(seid, seq)
            .build()
            .unwrap();
        let _ = self.socket.send(&resp.marshal()).await;
    }

    async fn associate(&mut self) {
        let seq = self.next_seq();
        let req = AssociationSetupRequestBuilder::new(seq)
            .node_id_ie(self.node_id_ie.clone())
            .recovery_time_stamp_ie(self.recovery_ie.clone())
            .build();
        let raw = self.rpc(req.marshal()).await;
        let msg = parse(&raw).unwrap();
        assert_eq!(msg.msg_type(), MsgType::AssociationSetupResponse);
    }

    /// Returns the cause and, when accepted, the proxy-minted UP SEID.
    async fn establish(&mut self, cp_seid: u64) -> (CauseValue, u64) {
        let seq = self.next_seq();
        let fseid_ie = Ie::new(
            IeType::Fseid,
            Fseid::new(cp_seid, Some(Ipv4Addr::LOCALHOST), None).marshal(),
        );
        let pdr = CreatePdr::uplink_access(PdrId::new(1), Precedence::new(100));
        let far = CreateFar::uplink_forward(FarId::new(1), Interface::Core);
        let req = SessionEstablishmentRequestBuilder::new(0, seq)
            .node_id_ie(self.node_id_ie.clone())
            .fseid_ie(fseid_ie)
            .create_pdrs(vec![pdr.to_ie()])
            .create_fars(vec![far.to_ie()])
            .build()
            .unwrap();
        let raw = self.rpc(req.marshal()).await;
        let resp = SessionEstablishmentResponse::unmarshal(&raw).unwrap();
        let cause = Cause::unmarshal(&resp.cause.payload).unwrap().value;
        let up_seid = resp.fseid().map(|f| f.seid.0).unwrap_or(0);
        (cause, up_seid)
    }

    async fn modify(&mut self, up_seid: u64) -> CauseValue {
        let seq = self.next_seq();
        let req = SessionModificationRequestBuilder::new(up_seid, seq).build();
        let raw = self.rpc(req.marshal()).await;
        let resp = SessionModificationResponse::unmarshal(&raw).unwrap();
        Cause::unmarshal(&resp.cause.payload).unwrap().value
    }

    async fn delete(&mut self, up_seid: u64) -> CauseValue {
        let seq = self.next_seq();
        let req = SessionDeletionRequestBuilder::new(up_seid, seq).build();
        let raw = self.rpc(req.marshal()).await;
        let resp = SessionDeletionResponse::unmarshal(&raw).unwrap();
        Cause::unmarshal(&resp.cause.payload).unwrap().value
    }

    /// Waits for one Session Report Request, answers it, and returns
    /// its SEID and raw cause octet.
    async fn recv_report(&mut self) -> (u64, u8) {
        let mut buf = vec![0u8; 4096];
        loop {
            let size = tokio::time::timeout(Duration::from_secs(10), self.socket.recv(&mut buf))
                .await
                .expect("report in time")
                .unwrap();
            let data = &buf[..size];
            let Ok(msg) = parse(data) else { continue };
            if msg.msg_type() != MsgType::SessionReportRequest {
                continue;
            }
            let seid = msg.seid().unwrap_or(0);
            let seq = msg.sequence();
            let report = SessionReportRequest::unmarshal(data).unwrap();
            let cause = report
                .ies
                .iter()
                .find(|ie| ie.ie_type == IeType::Cause)
                .map(|ie| ie.payload[0])
                .unwrap_or(0);
            self.answer_report(seid, seq).await;
            return (seid, cause);
        }
    }
}

// ---------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------

#[tokio::test]
async fn establishment_flows_through_a_single_upf() {
    let (proxy, _) = start_proxy(test_config()).await;
    let upf = MockUpf::spawn(true).await;
    register_upf(&proxy, &upf).await;

    let mut smf = Smf::connect(proxy.up_n4).await;
    smf.associate().await;

    let (cause, up_seid) = smf.establish(0xAAAA).await;
    assert_eq!(cause, CauseValue::RequestAccepted);
    assert_ne!(up_seid, 0);
    // The proxy minted its own SEID; the SMF's never leaks through.
    assert_ne!(up_seid, 0xAAAA);

    // The UPF saw a rewritten establishment, not the SMF's F-SEID.
    assert_eq!(upf.est_count(), 1);
    assert_eq!(upf.session_count(), 1);
    let down_seids: Vec<u64> = upf
        .state
        .lock()
        .unwrap()
        .sessions
        .values()
        .copied()
        .collect();
    assert!(!down_seids.contains(&0xAAAA));

    assert_eq!(proxy.balancer.session_count(), 1);
    assert_eq!(proxy.balancer.sessions_of(0), vec![up_seid]);

    proxy.shutdown().await;
}

#[tokio::test]
async fn deletion_cleans_all_session_state() {
    let (proxy, _) = start_proxy(test_config()).await;
    let upf = MockUpf::spawn(true).await;
    register_upf(&proxy, &upf).await;

    let mut smf = Smf::connect(proxy.up_n4).await;
    smf.associate().await;
    let (_, up_seid) = smf.establish(0xAAAA).await;
    assert_eq!(proxy.balancer.session_count(), 1);

    assert_eq!(smf.delete(up_seid).await, CauseValue::RequestAccepted);
    assert_eq!(proxy.balancer.session_count(), 0);
    assert!(proxy.balancer.sessions_of(0).is_empty());
    assert_eq!(upf.session_count(), 0);

    // Deleting again: the session context is gone.
    assert_eq!(smf.delete(up_seid).await, CauseValue::SessionContextNotFound);

    proxy.shutdown().await;
}

#[tokio::test]
async fn migration_moves_sessions_and_keeps_them_responsive() {
    let (proxy, _) = start_proxy(test_config()).await;
    let upf_a = MockUpf::spawn(true).await;
    register_upf(&proxy, &upf_a).await;

    let mut smf = Smf::connect(proxy.up_n4).await;
    smf.associate().await;

    let mut seids = Vec::new();
    for i in 0..20u64 {
        let (cause, up_seid) = smf.establish(0xA000 + i).await;
        assert_eq!(cause, CauseValue::RequestAccepted);
        // A modification before migration, so the replay has history.
        assert_eq!(smf.modify(up_seid).await, CauseValue::RequestAccepted);
        seids.push(up_seid);
    }
    assert_eq!(proxy.balancer.sessions_of(0).len(), 20);

    let upf_b = MockUpf::spawn(true).await;
    register_upf(&proxy, &upf_b).await;

    let url = format!("http://127.0.0.1:{}/trans-ses", proxy.down_api.port());
    let client = reqwest::Client::new();
    for seid in &seids {
        let resp = client
            .post(&url)
            .json(&serde_json::json!({ "sesid": seid, "supf": 0, "dupf": 1 }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::CREATED);
    }

    assert!(proxy.balancer.sessions_of(0).is_empty());
    assert_eq!(proxy.balancer.sessions_of(1).len(), 20);
    assert_eq!(upf_a.session_count(), 0);
    assert_eq!(upf_b.session_count(), 20);
    // Each migration deleted the session on the source and replayed the
    // stored modification history against the destination.
    assert_eq!(upf_a.state.lock().unwrap().del_count, 20);
    assert_eq!(upf_b.state.lock().unwrap().mod_count, 20);

    // Every migrated session still answers modifications, now on B.
    for seid in &seids {
        assert_eq!(smf.modify(*seid).await, CauseValue::RequestAccepted);
    }
    assert_eq!(upf_b.state.lock().unwrap().mod_count, 40);

    // Idempotence: re-running the same transfers changes nothing.
    for seid in &seids {
        let resp = client
            .post(&url)
            .json(&serde_json::json!({ "sesid": seid, "supf": 0, "dupf": 1 }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::CREATED);
    }
    assert_eq!(proxy.balancer.sessions_of(1).len(), 20);

    proxy.shutdown().await;
}

#[tokio::test]
async fn upf_restart_invalidates_sessions_and_notifies_the_smf() {
    let (proxy, _) = start_proxy(test_config()).await;
    let upf = MockUpf::spawn(true).await;
    register_upf(&proxy, &upf).await;

    let mut smf = Smf::connect(proxy.up_n4).await;
    smf.associate().await;

    let mut cp_seids = Vec::new();
    for i in 0..10u64 {
        let (cause, _) = smf.establish(0xCC00 + i).await;
        assert_eq!(cause, CauseValue::RequestAccepted);
        cp_seids.push(0xCC00 + i);
    }
    assert_eq!(proxy.balancer.session_count(), 10);

    upf.send_restart_association(proxy.down_local).await;

    let mut reported = Vec::new();
    for _ in 0..10 {
        let (seid, cause) = smf.recv_report().await;
        assert_eq!(cause, pfcp_lb::dispatch::CAUSE_PFCP_ENTITY_IN_RECOVERY);
        reported.push(seid);
    }
    reported.sort_unstable();
    assert_eq!(reported, cp_seids);
    assert_eq!(proxy.balancer.session_count(), 0);

    proxy.shutdown().await;
}

#[tokio::test]
async fn overload_triggers_exactly_one_scale_out() {
    let cfg = test_config();
    let (proxy, log) = start_proxy(cfg.clone()).await;
    let upf = MockUpf::spawn(true).await;
    register_upf(&proxy, &upf).await;

    let mut smf = Smf::connect(proxy.up_n4).await;
    smf.associate().await;
    for i in 0..6u64 {
        let (cause, _) = smf.establish(0xD000 + i).await;
        assert_eq!(cause, CauseValue::RequestAccepted);
    }

    let mut scale_cfg = (*cfg).clone();
    scale_cfg.auto_scale_out = true;
    scale_cfg.scale_by_session = true;
    scale_cfg.max_sessions_threshold = 5;
    scale_cfg.max_sessions_tolerance = 0.0;
    let autoscaler = Autoscaler::new(
        Arc::new(scale_cfg),
        proxy.down.clone(),
        Arc::new(MockProvisioner(log.clone())),
        Arc::new(NullProbe),
    );
    autoscaler.reconcile().await.unwrap();

    assert_eq!(log.created.lock().unwrap().len(), 1);
    assert!(log.destroyed.lock().unwrap().is_empty());
    // No sessions moved by a scale-out.
    assert_eq!(proxy.balancer.sessions_of(0).len(), 6);

    proxy.shutdown().await;
}

#[tokio::test]
async fn unresponsive_upf_maps_to_no_resources() {
    let (proxy, _) = start_proxy(test_config()).await;
    // Answers the association but swallows all session traffic.
    let upf = MockUpf::spawn(false).await;
    register_upf(&proxy, &upf).await;

    let mut smf = Smf::connect(proxy.up_n4).await;
    smf.associate().await;

    let (cause, _) = smf.establish(0xEE01).await;
    assert_eq!(cause, CauseValue::NoResourcesAvailable);
    assert_eq!(proxy.balancer.session_count(), 0);

    // The in-flight table drained with the timeout.
    let conn = proxy.down.node.get_conn(&upf.addr).unwrap();
    assert_eq!(conn.pending_len(), 0);

    proxy.shutdown().await;
}

#[tokio::test]
async fn establishment_without_any_upf_is_rejected() {
    let (proxy, _) = start_proxy(test_config()).await;
    let mut smf = Smf::connect(proxy.up_n4).await;
    smf.associate().await;

    let (cause, _) = smf.establish(0xF001).await;
    assert_eq!(cause, CauseValue::NoResourcesAvailable);

    proxy.shutdown().await;
}

#[tokio::test]
async fn control_api_rejects_bad_input() {
    let (proxy, _) = start_proxy(test_config()).await;
    let base = format!("http://127.0.0.1:{}", proxy.down_api.port());
    let client = reqwest::Client::new();

    // Wrong method.
    let resp = client.get(format!("{base}/")).send().await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::METHOD_NOT_ALLOWED);

    // Malformed JSON.
    let resp = client
        .post(format!("{base}/"))
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

    // The info surface reports an empty pool.
    let resp = client.get(format!("{base}/info")).send().await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["sessions"], 0);
    assert_eq!(body["plane"], "down");

    proxy.shutdown().await;
}

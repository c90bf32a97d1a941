use std::{net::SocketAddr, time::Duration};

use rs_pfcp::ie::{
    cause::{Cause, CauseValue},
    create_far::CreateFar,
    create_pdr::CreatePdr,
    destination_interface::Interface,
    far_id::FarId,
    fseid::Fseid,
    pdr_id::PdrId,
    precedence::Precedence,
    Ie, IeType,
};
use rs_pfcp::message::{
    association_setup_request::AssociationSetupRequestBuilder,
    heartbeat_response::HeartbeatResponseBuilder,
    parse,
    session_deletion_request::SessionDeletionRequestBuilder,
    session_establishment_request::SessionEstablishmentRequestBuilder,
    session_establishment_response::SessionEstablishmentResponse,
    session_report_response::SessionReportResponseBuilder,
    Message, MsgType,
};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::config::SimMode;

/// Sessions driven per simulation run.
const SIM_SESSIONS: u64 = 10;

/// Drives the Up endpoint like an SMF would: association, then a batch
/// of establishments, optionally paired deletions, and for
/// `CreateContinue` a serving loop that answers heartbeats and reports.
pub async fn run(mode: SimMode, target: SocketAddr, cancel: CancellationToken) -> anyhow::Result<()> {
    let bind: SocketAddr = if target.ip().is_loopback() {
        "127.0.0.1:0".parse()?
    } else {
        "0.0.0.0:0".parse()?
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(target).await?;
    let local_ip = match socket.local_addr()?.ip() {
        std::net::IpAddr::V4(ip) if !ip.is_unspecified() => ip,
        _ => crate::node::local_ipv4().unwrap_or(std::net::Ipv4Addr::LOCALHOST),
    };
    log::info!("simulation started: mode={:?}, target={}", mode, target);

    let mut seq = 0u32;
    let mut next_seq = move || {
        seq += 1;
        seq
    };

    let node_id_ie = rs_pfcp::ie::node_id::NodeId::new_ipv4(local_ip).to_ie();
    let recovery_ie = Ie::new(
        IeType::RecoveryTimeStamp,
        rs_pfcp::ie::recovery_time_stamp::RecoveryTimeStamp::new(std::time::SystemTime::now())
            .marshal()
            .to_vec(),
    );

    let assoc = AssociationSetupRequestBuilder::new(next_seq())
        .node_id_ie(node_id_ie.clone())
        .recovery_time_stamp_ie(recovery_ie.clone())
        .build()
        .marshal();
    rpc(&socket, &assoc).await?;
    log::info!("simulation association up: target={}", target);

    let mut established = Vec::new();
    for i in 1..=SIM_SESSIONS {
        let cp_seid = 0x0100_0000 + i;
        let fseid_ie = Ie::new(IeType::Fseid, Fseid::new(cp_seid, Some(local_ip), None).marshal());
        let pdr = CreatePdr::uplink_access(PdrId::new(1), Precedence::new(100));
        let far = CreateFar::uplink_forward(FarId::new(1), Interface::Core);

        let est = SessionEstablishmentRequestBuilder::new(0, next_seq())
            .node_id_ie(node_id_ie.clone())
            .fseid_ie(fseid_ie)
            .create_pdrs(vec![pdr.to_ie()])
            .create_fars(vec![far.to_ie()])
            .build()
            .map_err(|e| anyhow::anyhow!("building establishment: {e}"))?;

        let raw = rpc(&socket, &est.marshal()).await?;
        let resp = SessionEstablishmentResponse::unmarshal(&raw)
            .map_err(|e| anyhow::anyhow!("bad establishment response: {e}"))?;
        let cause = Cause::unmarshal(&resp.cause_ie().payload)
            .map_err(|e| anyhow::anyhow!("bad cause: {e}"))?;
        if cause.value != CauseValue::RequestAccepted {
            log::warn!("simulated session rejected: cp_seid={:#x}, cause={:?}", cp_seid, cause.value);
            continue;
        }
        let up_fseid = resp
            .fseid()
            .map_err(|e| anyhow::anyhow!("missing UP F-SEID: {e}"))?;
        established.push(up_fseid.seid.0);
    }
    log::info!("simulated sessions established: count={}", established.len());

    if mode == SimMode::Delete {
        for seid in &established {
            let del = SessionDeletionRequestBuilder::new(*seid, next_seq()).build();
            rpc(&socket, &del.marshal()).await?;
        }
        log::info!("simulated sessions deleted: count={}", established.len());
        return Ok(());
    }

    if mode == SimMode::CreateContinue {
        serve(&socket, recovery_ie, cancel).await;
    }
    Ok(())
}

/// One request/response exchange with a short retry, enough for a
/// loopback lab target.
async fn rpc(socket: &UdpSocket, bytes: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut buf = vec![0u8; 4096];
    for _ in 0..3 {
        socket.send(bytes).await?;
        match tokio::time::timeout(Duration::from_secs(2), socket.recv(&mut buf)).await {
            Ok(Ok(size)) => return Ok(buf[..size].to_vec()),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => continue,
        }
    }
    anyhow::bail!("no response from {:?}", socket.peer_addr())
}

/// Keeps the established sessions alive: answers heartbeats and accepts
/// session reports until shutdown.
async fn serve(socket: &UdpSocket, recovery_ie: Ie, cancel: CancellationToken) {
    let mut buf = vec![0u8; 4096];
    loop {
        let size = tokio::select! {
            _ = cancel.cancelled() => break,
            recv = socket.recv(&mut buf) => match recv {
                Ok(size) => size,
                Err(_) => break,
            },
        };
        let Ok(msg) = parse(&buf[..size]) else {
            continue;
        };
        match msg.msg_type() {
            MsgType::HeartbeatRequest => {
                let resp = HeartbeatResponseBuilder::new(msg.sequence())
                    .recovery_time_stamp_ie(recovery_ie.clone())
                    .build();
                drop(msg);
                let _ = socket.send(&resp.marshal()).await;
            }
            MsgType::SessionReportRequest => {
                let seid = msg.seid().unwrap_or(rs_pfcp::Seid(0));
                let seq = msg.sequence();
                drop(msg);
                if let Ok(resp) = SessionReportResponseBuilder::accepted(seid, seq).build() {
                    let _ = socket.send(&resp.marshal()).await;
                }
            }
            _ => {}
        }
    }
}

use std::sync::Arc;

use rs_pfcp::ie::cause::{Cause, CauseValue};
use rs_pfcp::message::{
    session_deletion_request::SessionDeletionRequestBuilder,
    session_establishment_request::SessionEstablishmentRequest,
    session_establishment_response::SessionEstablishmentResponse,
    session_modification_request::SessionModificationRequest,
    session_modification_response::SessionModificationResponse,
    Message,
};

use crate::{
    conn::{ConnError, PeerConn},
    dispatch::DownPlane,
};

/// Moves the given sessions from `src` to `dst` by replaying their
/// stored Establishment and Modification history against `dst`.
///
/// The binding only changes after the destination accepted the whole
/// replay; a failed replay deletes partial state on `dst` and leaves
/// the session where it was. Re-running with the same arguments after a
/// success is a no-op, since the sessions are no longer on `src`.
///
/// Returns how many sessions actually moved.
pub async fn transfer_sessions(
    down: &Arc<DownPlane>,
    src: usize,
    dst: usize,
    seids: &[u64],
) -> anyhow::Result<usize> {
    let dst_addr = down
        .balancer
        .upf_addr(dst)
        .ok_or_else(|| anyhow::anyhow!("unknown destination UPF: {dst}"))?;
    let dst_conn = down
        .node
        .get_conn(&dst_addr)
        .filter(|c| c.is_up())
        .ok_or_else(|| anyhow::anyhow!("destination UPF {dst} has no association"))?;

    let mut moved = 0usize;
    for &up_seid in seids {
        // Quiesce the session: SMF traffic waits behind this gate until
        // the replay finished one way or the other.
        let gate = down.gate(up_seid);
        let _quiesced = gate.lock().await;

        let Some(route) = down.balancer.route(up_seid) else {
            continue;
        };
        if route.upf != src {
            // Already moved; keeps the whole call idempotent.
            continue;
        }
        let Some((est, mods)) = down.balancer.history(up_seid) else {
            continue;
        };

        // Delete on the source first. A failure here is tolerated: the
        // source either already lost the session or will drop it on its
        // next restart detection.
        if let Some(src_conn) = down.node.get_conn(&route.addr) {
            let mut del = SessionDeletionRequestBuilder::new(route.upf_seid, 0).build();
            if let Err(e) = src_conn.request(&mut del).await {
                log::warn!(
                    "deleting session on source failed: up_seid={:#x}, upf={}, err={}",
                    up_seid,
                    src,
                    e
                );
            }
        }

        match replay(down, &dst_conn, est, &mods).await {
            Ok((down_seid, upf_seid)) => {
                down.balancer.rebind(up_seid, dst, down_seid, upf_seid)?;
                moved += 1;
                log::info!(
                    "session migrated: up_seid={:#x}, upf {} -> {}",
                    up_seid,
                    src,
                    dst
                );
            }
            Err(e) => {
                log::error!(
                    "session replay failed, binding kept on source: up_seid={:#x}, err={}",
                    up_seid,
                    e
                );
            }
        }
    }

    Ok(moved)
}

/// Replays one session against the destination: a synthetic
/// Establishment carrying a fresh down-side SEID, then every stored
/// Modification in acceptance order. Rolls back partial state on error.
async fn replay(
    down: &Arc<DownPlane>,
    dst_conn: &Arc<PeerConn>,
    est: Vec<u8>,
    mods: &[Vec<u8>],
) -> anyhow::Result<(u64, u64)> {
    let mut est_msg = SessionEstablishmentRequest::unmarshal(&est)
        .map_err(|e| anyhow::anyhow!("stored establishment unreadable: {e}"))?;

    let down_seid = down.mint_down_seid();
    let fseid = down.down_fseid(down_seid);
    est_msg.header.length = est_msg.header.length - est_msg.fseid.len() + fseid.len();
    est_msg.fseid = fseid;

    let raw = dst_conn.request(&mut est_msg).await?;
    let resp = SessionEstablishmentResponse::unmarshal(&raw).map_err(|_| ConnError::Malformed)?;
    let cause = Cause::unmarshal(&resp.cause_ie().payload).map_err(|_| ConnError::Malformed)?;
    if cause.value != CauseValue::RequestAccepted {
        anyhow::bail!("destination rejected establishment replay: cause={:?}", cause.value);
    }
    let upf_seid = resp.fseid().map_err(|_| ConnError::Malformed)?.seid.0;

    for (i, stored) in mods.iter().enumerate() {
        let replay_result = async {
            let mut msg = SessionModificationRequest::unmarshal(stored)
                .map_err(|e| anyhow::anyhow!("stored modification unreadable: {e}"))?;
            msg.header.seid = rs_pfcp::Seid(upf_seid);
            let raw = dst_conn.request(&mut msg).await?;
            let resp =
                SessionModificationResponse::unmarshal(&raw).map_err(|_| ConnError::Malformed)?;
            let cause = Cause::unmarshal(&resp.cause.payload).map_err(|_| ConnError::Malformed)?;
            if cause.value != CauseValue::RequestAccepted {
                anyhow::bail!("modification replay {i} rejected: cause={:?}", cause.value);
            }
            Ok::<(), anyhow::Error>(())
        }
        .await;

        if let Err(e) = replay_result {
            // Roll back: remove the half-built session from the
            // destination, the binding stays on the source.
            let mut del = SessionDeletionRequestBuilder::new(upf_seid, 0).build();
            let _ = dst_conn.request(&mut del).await;
            return Err(e);
        }
    }

    Ok((down_seid, upf_seid))
}

/// Drains a UPF: marks it `Draining` so it gets no new sessions, then
/// spreads everything it still owns across the remaining active UPFs,
/// least-loaded first.
pub async fn make_upf_empty(down: &Arc<DownPlane>, src: usize) -> anyhow::Result<()> {
    down.balancer.mark_draining(src)?;

    loop {
        let seids = down.balancer.sessions_of(src);
        if seids.is_empty() {
            break;
        }

        let mut progress = 0usize;
        for up_seid in seids {
            let dst = match down.balancer.pick() {
                Ok(dst) => dst,
                Err(e) => anyhow::bail!("no destination left while draining UPF {src}: {e}"),
            };
            progress += transfer_sessions(down, src, dst, &[up_seid]).await?;
        }

        if progress == 0 {
            anyhow::bail!("draining UPF {src} made no progress");
        }
    }

    log::info!("upf drained: upf={}", src);
    Ok(())
}

use std::{
    net::SocketAddr,
    sync::Arc,
    time::Instant,
};

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use balance::{Balancer, UpfRecord};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::{
    autoscale::WorkloadProvisioner,
    config::Config,
    dispatch::{DownPlane, UpPlane},
    migrate,
    node::Plane,
    statistics::Statistics,
};

/// Shared state behind the control API.
///
/// Warn: this server carries no authentication; it is meant for the
/// trusted intra-cluster network only, do not expose it directly to an
/// unsafe environment.
pub struct ApiState {
    pub plane: Plane,
    pub cfg: Arc<Config>,
    pub balancer: Arc<Balancer>,
    pub down: Option<Arc<DownPlane>>,
    pub up: Option<Arc<UpPlane>>,
    pub provisioner: Arc<dyn WorkloadProvisioner>,
    pub statistics: Statistics,
    pub uptime: Instant,
}

/// Registration payload posted by a freshly started UPF workload.
#[derive(Deserialize)]
struct PfcpInfo {
    ip: String,
    #[serde(default)]
    upf: UpfInfo,
}

#[derive(Deserialize, Default)]
struct UpfInfo {
    #[serde(default)]
    dnn: String,
    #[serde(default)]
    hostname: String,
    #[serde(default, rename = "nodeid")]
    node_id: String,
}

#[derive(Deserialize)]
struct SesTransReq {
    sesid: u64,
    supf: usize,
    dupf: usize,
}

#[derive(Deserialize)]
struct UpfDelReq {
    upfid: usize,
}

/// Starts the plane's control server and returns the bound address.
pub async fn start(
    state: Arc<ApiState>,
    listen: SocketAddr,
    cancel: CancellationToken,
) -> anyhow::Result<SocketAddr> {
    let mut app = Router::new().route("/info", get(info));
    if state.down.is_some() {
        app = app
            .route("/", post(register_upf))
            .route("/trans-ses", post(transfer_session))
            .route("/del-upf", post(delete_upf));
    }
    let app = app.with_state(state.clone());

    let listener = TcpListener::bind(listen).await?;
    let addr = listener.local_addr()?;
    log::info!("controller listening: plane={}, addr={}", state.plane, addr);

    tokio::spawn(async move {
        let serve = axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await });
        if let Err(e) = serve.await {
            log::error!("controller server failed: err={}", e);
        }
    });
    Ok(addr)
}

fn reply(status: StatusCode) -> Response {
    let message = match status {
        StatusCode::CREATED => "Status Created",
        _ => "Failed to apply config",
    };
    (status, Json(json!({ "message": message }))).into_response()
}

async fn info(State(state): State<Arc<ApiState>>) -> Response {
    let sessions = match (&state.down, &state.up) {
        (Some(_), _) => state.balancer.session_count(),
        (_, Some(up)) => up.session_count(),
        _ => 0,
    };
    let upfs = match &state.down {
        Some(_) => serde_json::to_value(state.balancer.views()).unwrap_or_default(),
        None => json!(state
            .up
            .as_ref()
            .map(|up| up.backends().iter().map(|b| b.addr.to_string()).collect::<Vec<_>>())
            .unwrap_or_default()),
    };
    let traffic: Vec<_> = state
        .balancer
        .views()
        .iter()
        .filter_map(|v| {
            state.statistics.get(&v.addr).map(|c| {
                json!({
                    "addr": v.addr.to_string(),
                    "received_pkts": c.received_pkts,
                    "send_pkts": c.send_pkts,
                    "error_pkts": c.error_pkts,
                })
            })
        })
        .collect();

    Json(json!({
        "software": concat!(env!("CARGO_PKG_NAME"), ":", env!("CARGO_PKG_VERSION")),
        "plane": state.plane.to_string(),
        "uptime": state.uptime.elapsed().as_secs(),
        "dnn": state.cfg.cpiface.dnn,
        "sessions": sessions,
        "upfs": upfs,
        "traffic": traffic,
    }))
    .into_response()
}

async fn register_upf(State(state): State<Arc<ApiState>>, body: Bytes) -> Response {
    let Ok(info) = serde_json::from_slice::<PfcpInfo>(&body) else {
        log::error!("json unmarshal failed for upf registration");
        return reply(StatusCode::BAD_REQUEST);
    };
    let Some(down) = state.down.clone() else {
        return reply(StatusCode::METHOD_NOT_ALLOWED);
    };

    let Ok(addr) = parse_n4_addr(&info.ip) else {
        log::error!("bad peer address in upf registration: ip={}", info.ip);
        return reply(StatusCode::BAD_REQUEST);
    };

    let node_id = if info.upf.node_id.is_empty() {
        addr.ip().to_string()
    } else {
        info.upf.node_id.clone()
    };
    let hostname = if info.upf.hostname.is_empty() {
        node_id.clone()
    } else {
        info.upf.hostname.clone()
    };
    log::info!(
        "new pfcp peer registered: ip={}, hostname={}",
        info.ip,
        hostname
    );

    let mut rec = UpfRecord::new(node_id, hostname, addr);
    if !info.upf.dnn.is_empty() {
        rec.dnn = Some(info.upf.dnn.clone());
    }

    match down.register_upf(rec).await {
        Ok(_) => reply(StatusCode::CREATED),
        Err(e) => {
            log::error!("opening n4 association failed: peer={}, err={}", addr, e);
            reply(StatusCode::BAD_REQUEST)
        }
    }
}

async fn transfer_session(State(state): State<Arc<ApiState>>, body: Bytes) -> Response {
    let Ok(req) = serde_json::from_slice::<SesTransReq>(&body) else {
        log::error!("json unmarshal failed for session transfer");
        return reply(StatusCode::BAD_REQUEST);
    };
    let Some(down) = state.down.clone() else {
        return reply(StatusCode::METHOD_NOT_ALLOWED);
    };

    match migrate::transfer_sessions(&down, req.supf, req.dupf, &[req.sesid]).await {
        Ok(_) => reply(StatusCode::CREATED),
        Err(e) => {
            log::error!(
                "session transfer failed: sesid={:#x}, {} -> {}, err={}",
                req.sesid,
                req.supf,
                req.dupf,
                e
            );
            reply(StatusCode::BAD_REQUEST)
        }
    }
}

async fn delete_upf(State(state): State<Arc<ApiState>>, body: Bytes) -> Response {
    let Ok(req) = serde_json::from_slice::<UpfDelReq>(&body) else {
        log::error!("json unmarshal failed for upf deletion");
        return reply(StatusCode::BAD_REQUEST);
    };
    let Some(down) = state.down.clone() else {
        return reply(StatusCode::METHOD_NOT_ALLOWED);
    };

    if let Err(e) = migrate::make_upf_empty(&down, req.upfid).await {
        log::error!("draining upf failed: upf={}, err={}", req.upfid, e);
        return reply(StatusCode::BAD_REQUEST);
    }

    let hostname = state
        .balancer
        .hostname(req.upfid)
        .unwrap_or_else(|| format!("upf-{}", req.upfid));
    if let Err(e) = state.provisioner.destroy(&hostname).await {
        log::error!("destroying upf workload failed: name={}, err={}", hostname, e);
        return reply(StatusCode::BAD_REQUEST);
    }
    if state.balancer.mark_removed(req.upfid).is_err() {
        return reply(StatusCode::BAD_REQUEST);
    }
    reply(StatusCode::CREATED)
}

/// Accepts either a bare IP (the N4 default port is assumed) or a full
/// socket address.
fn parse_n4_addr(ip: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(addr) = ip.parse::<SocketAddr>() {
        return Ok(addr);
    }
    Ok(SocketAddr::new(ip.parse()?, 8805))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn n4_addr_accepts_ip_and_socket_addr() {
        assert_eq!(
            parse_n4_addr("10.0.0.1").unwrap(),
            "10.0.0.1:8805".parse().unwrap()
        );
        assert_eq!(
            parse_n4_addr("10.0.0.1:9805").unwrap(),
            "10.0.0.1:9805".parse().unwrap()
        );
        assert!(parse_n4_addr("not-an-ip").is_err());
    }
}

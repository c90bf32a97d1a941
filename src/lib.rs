pub mod api;
pub mod autoscale;
pub mod bus;
pub mod config;
pub mod conn;
pub mod dispatch;
pub mod migrate;
pub mod node;
pub mod sim;
pub mod statistics;

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use balance::Balancer;
use tokio_util::sync::CancellationToken;

use crate::{
    api::ApiState,
    autoscale::{Autoscaler, KubectlProvisioner, LoadProbe, NullProbe, WorkloadProvisioner},
    config::{Config, SimMode},
    dispatch::{DownPlane, UpPlane},
    node::{Node, Plane, PlaneHandler},
    statistics::Statistics,
};

/// Grace given to in-flight work on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A running proxy: both PFCP planes, the inter-plane bus, the control
/// APIs and the autoscaler.
///
/// Split out of the main function so integration tests can start the
/// whole server in-process against ephemeral ports.
pub struct Proxy {
    pub up_n4: SocketAddr,
    pub down_local: SocketAddr,
    pub up_api: SocketAddr,
    pub down_api: SocketAddr,
    pub balancer: Arc<Balancer>,
    pub up: Arc<UpPlane>,
    pub down: Arc<DownPlane>,
    up_node: Arc<Node>,
    down_node: Arc<Node>,
    cancel: CancellationToken,
}

impl Proxy {
    pub async fn start(
        cfg: Arc<Config>,
        provisioner: Arc<dyn WorkloadProvisioner>,
        probe: Arc<dyn LoadProbe>,
    ) -> anyhow::Result<Proxy> {
        let statistics = Statistics::default();
        let balancer = Arc::new(Balancer::default());
        let (to_down, to_down_rx, to_up, to_up_rx) = bus::channel();

        let up_node = Node::bind(cfg.clone(), Plane::Up, statistics.clone()).await?;
        let down_node = Node::bind(cfg.clone(), Plane::Down, statistics.clone()).await?;

        let up = UpPlane::new(cfg.clone(), up_node.clone(), to_down);
        let down = DownPlane::new(down_node.clone(), balancer.clone(), to_up);
        up.spawn_listeners(to_up_rx);
        down.spawn_listeners(to_down_rx);

        let up_handler: Arc<dyn PlaneHandler> = up.clone();
        tokio::spawn(up_node.clone().serve(up_handler));
        let down_handler: Arc<dyn PlaneHandler> = down.clone();
        tokio::spawn(down_node.clone().serve(down_handler));

        let cancel = CancellationToken::new();
        let (up_api_bind, down_api_bind) = api_binds(&cfg);
        let up_api = api::start(
            Arc::new(ApiState {
                plane: Plane::Up,
                cfg: cfg.clone(),
                balancer: balancer.clone(),
                down: None,
                up: Some(up.clone()),
                provisioner: provisioner.clone(),
                statistics: statistics.clone(),
                uptime: Instant::now(),
            }),
            up_api_bind,
            cancel.child_token(),
        )
        .await?;
        let down_api = api::start(
            Arc::new(ApiState {
                plane: Plane::Down,
                cfg: cfg.clone(),
                balancer: balancer.clone(),
                down: Some(down.clone()),
                up: None,
                provisioner: provisioner.clone(),
                statistics: statistics.clone(),
                uptime: Instant::now(),
            }),
            down_api_bind,
            cancel.child_token(),
        )
        .await?;

        let autoscaler = Autoscaler::new(cfg.clone(), down.clone(), provisioner, probe);
        if cfg.init_upfs > 0 {
            let autoscaler = autoscaler.clone();
            tokio::spawn(async move { autoscaler.provision_initial().await });
        }
        if cfg.auto_scale_out || cfg.auto_scale_in {
            tokio::spawn(autoscaler.run(cancel.child_token()));
        }

        Ok(Proxy {
            up_n4: up_node.local_addr(),
            down_local: down_node.local_addr(),
            up_api,
            down_api,
            balancer,
            up,
            down,
            up_node,
            down_node,
            cancel,
        })
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Idempotent graceful shutdown: stops both nodes, fails in-flight
    /// requests with `AssociationDown` and lets workers wind down.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.up_node.stop();
        self.down_node.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// The Up plane serves its controller on 8080, the Down plane on 8081;
/// `cpiface.http_port` overrides the Down plane (and "0" makes both
/// ephemeral, which the integration tests rely on).
fn api_binds(cfg: &Config) -> (SocketAddr, SocketAddr) {
    let down_port: u16 = match cfg.cpiface.http_port.parse() {
        Ok(port) => port,
        Err(_) => 8081,
    };
    let up_port: u16 = if cfg.cpiface.http_port == "0" { 0 } else { 8080 };
    (
        SocketAddr::from(([0, 0, 0, 0], up_port)),
        SocketAddr::from(([0, 0, 0, 0], down_port)),
    )
}

/// Entry point behind `main`, kept callable from tests.
pub async fn server_main(cfg: Arc<Config>, sim_mode: Option<SimMode>) -> anyhow::Result<()> {
    let proxy = Proxy::start(
        cfg,
        Arc::new(KubectlProvisioner::default()),
        Arc::new(NullProbe),
    )
    .await?;

    if let Some(mode) = sim_mode {
        let target = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), proxy.up_n4.port());
        let cancel = proxy.cancel_token().child_token();
        tokio::spawn(async move {
            if let Err(e) = sim::run(mode, target, cancel).await {
                log::error!("simulation failed: err={}", e);
            }
        });
    }

    wait_for_shutdown().await;
    log::info!("shutting down");
    let deadline = tokio::time::timeout(SHUTDOWN_GRACE, proxy.shutdown());
    let _ = deadline.await;
    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing SIGTERM handler failed");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

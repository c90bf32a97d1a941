use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use balance::{ScaleState, UpfView};
use tokio_util::sync::CancellationToken;

use crate::{config::Config, dispatch::DownPlane, migrate};

/// Seam to the platform that owns the UPF workloads. The proxy only
/// ever asks for a workload by name; registration of the new UPF comes
/// back through the control API.
#[async_trait]
pub trait WorkloadProvisioner: Send + Sync {
    async fn create(&self, name: &str) -> anyhow::Result<()>;
    async fn destroy(&self, name: &str) -> anyhow::Result<()>;
}

/// Applies or deletes a per-UPF manifest through the cluster CLI.
pub struct KubectlProvisioner {
    pub namespace: String,
    pub manifest_dir: PathBuf,
}

impl Default for KubectlProvisioner {
    fn default() -> Self {
        Self {
            namespace: "omec".into(),
            manifest_dir: "/upfs".into(),
        }
    }
}

impl KubectlProvisioner {
    async fn kubectl(&self, verb: &str, name: &str) -> anyhow::Result<()> {
        let manifest = self.manifest_dir.join(format!("{name}.yaml"));
        let output = tokio::process::Command::new("kubectl")
            .arg(verb)
            .arg("-n")
            .arg(&self.namespace)
            .arg("-f")
            .arg(&manifest)
            .output()
            .await?;
        if !output.status.success() {
            anyhow::bail!(
                "kubectl {verb} {} failed: {}",
                manifest.display(),
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(())
    }
}

#[async_trait]
impl WorkloadProvisioner for KubectlProvisioner {
    async fn create(&self, name: &str) -> anyhow::Result<()> {
        self.kubectl("apply", name).await
    }

    async fn destroy(&self, name: &str) -> anyhow::Result<()> {
        self.kubectl("delete", name).await
    }
}

/// CPU and bitrate observation for one UPF, when a metrics source is
/// wired up. The default probe reports nothing, which leaves
/// session-count scaling as the only active signal.
#[async_trait]
pub trait LoadProbe: Send + Sync {
    async fn sample(&self, upf: &UpfView) -> Option<(u32, u64)>;
}

pub struct NullProbe;

#[async_trait]
impl LoadProbe for NullProbe {
    async fn sample(&self, _upf: &UpfView) -> Option<(u32, u64)> {
        None
    }
}

/// Periodic reconciliation of the UPF pool against its load.
///
/// At most one scaling action per tick. Scale-out only requests the
/// workload; the new UPF registers itself through the control API and
/// starts taking new sessions once its association is up. Scale-in is
/// armed on one tick and executed on the next, so a momentary dip does
/// not drain a UPF.
pub struct Autoscaler {
    cfg: Arc<Config>,
    down: Arc<DownPlane>,
    provisioner: Arc<dyn WorkloadProvisioner>,
    probe: Arc<dyn LoadProbe>,
    next_name: AtomicU32,
    scale_in_armed: AtomicBool,
}

impl Autoscaler {
    pub fn new(
        cfg: Arc<Config>,
        down: Arc<DownPlane>,
        provisioner: Arc<dyn WorkloadProvisioner>,
        probe: Arc<dyn LoadProbe>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            down,
            provisioner,
            probe,
            next_name: AtomicU32::new(0),
            scale_in_armed: AtomicBool::new(false),
        })
    }

    fn next_name(&self) -> String {
        format!("upf-{}", self.next_name.fetch_add(1, Ordering::Relaxed))
    }

    /// Provisions the initial pool; the workloads register themselves
    /// once they come up.
    pub async fn provision_initial(&self) {
        for _ in 0..self.cfg.init_upfs {
            let name = self.next_name();
            if let Err(e) = self.provisioner.create(&name).await {
                log::error!("initial UPF provisioning failed: name={}, err={}", name, e);
            }
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.cfg.reconciliation_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.reconcile().await {
                log::error!("reconciliation failed: err={}", e);
            }
        }
    }

    pub async fn reconcile(&self) -> anyhow::Result<()> {
        for view in self.down.balancer.views() {
            if view.state != ScaleState::Active {
                continue;
            }
            if let Some((cpu, bitrate)) = self.probe.sample(&view).await {
                self.down.balancer.set_load(view.index, cpu, bitrate);
            }
        }

        let views = self.down.balancer.views();
        let active: Vec<&UpfView> = views
            .iter()
            .filter(|v| v.state == ScaleState::Active)
            .collect();
        if active.is_empty() {
            return Ok(());
        }

        let n = active.len() as f64;
        let avg_sessions = active.iter().map(|v| v.sessions).sum::<usize>() as f64 / n;
        let avg_cpu = active.iter().map(|v| v.cpu as u64).sum::<u64>() as f64 / n;
        let avg_bitrate = active.iter().map(|v| v.bitrate).sum::<u64>() as f64 / n;
        let live = self.down.balancer.live_count() as u32;

        if self.cfg.auto_scale_out && self.overloaded(avg_sessions, avg_cpu, avg_bitrate) {
            self.scale_in_armed.store(false, Ordering::Relaxed);
            if live < self.cfg.max_upfs {
                let name = self.next_name();
                log::info!(
                    "scaling out: live={}, avg_sessions={:.1}, name={}",
                    live,
                    avg_sessions,
                    name
                );
                self.provisioner.create(&name).await?;
            }
            return Ok(());
        }

        if self.cfg.auto_scale_in
            && live > self.cfg.min_upfs
            && self.underloaded(avg_sessions, avg_cpu, avg_bitrate)
        {
            // First tick arms the decision, the next one executes it.
            if !self.scale_in_armed.swap(true, Ordering::Relaxed) {
                return Ok(());
            }
            self.scale_in_armed.store(false, Ordering::Relaxed);

            let victim = active
                .iter()
                .min_by_key(|v| (v.sessions, v.index))
                .map(|v| v.index)
                .expect("active pool is non-empty");
            let hostname = self
                .down
                .balancer
                .hostname(victim)
                .unwrap_or_else(|| format!("upf-{victim}"));

            log::info!(
                "scaling in: victim={}, hostname={}, avg_sessions={:.1}",
                victim,
                hostname,
                avg_sessions
            );
            migrate::make_upf_empty(&self.down, victim).await?;
            if let Err(e) = self.provisioner.destroy(&hostname).await {
                log::error!("destroying UPF workload failed: name={}, err={}", hostname, e);
            }
            self.down.balancer.mark_removed(victim)?;
            return Ok(());
        }

        self.scale_in_armed.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn overloaded(&self, sessions: f64, cpu: f64, bitrate: f64) -> bool {
        let cfg = &self.cfg;
        (cfg.scale_by_session
            && sessions
                > cfg.max_sessions_threshold as f64 * (1.0 - cfg.max_sessions_tolerance as f64))
            || (cfg.scale_by_cpu && cpu > cfg.max_cpu_threshold as f64)
            || (cfg.scale_by_bitrate && bitrate > cfg.max_bitrate_threshold as f64)
    }

    fn underloaded(&self, sessions: f64, cpu: f64, bitrate: f64) -> bool {
        let cfg = &self.cfg;
        (cfg.scale_by_session
            && sessions
                < cfg.min_sessions_threshold as f64 * (1.0 + cfg.min_sessions_tolerance as f64))
            || (cfg.scale_by_cpu && cpu < cfg.min_cpu_threshold as f64)
            || (cfg.scale_by_bitrate && bitrate < cfg.min_bitrate_threshold as f64)
    }
}

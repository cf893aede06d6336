use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn, Instrument};

use crate::config::GpuConfig;
use crate::error::{MqiError, Result};
use crate::gpu::telemetry::parse_telemetry;
use crate::handlers::RemoteHandler;
use crate::repositories::GpuRepository;

/// One telemetry round trip: query the cluster, parse, upsert.
#[derive(Clone)]
pub struct GpuSampler {
    remote: Arc<RemoteHandler>,
    repo: GpuRepository,
    query_command: String,
}

impl GpuSampler {
    pub fn new(remote: Arc<RemoteHandler>, repo: GpuRepository, query_command: &str) -> Self {
        Self {
            remote,
            repo,
            query_command: query_command.to_string(),
        }
    }

    /// Returns how many GPUs were written to the ledger.
    pub async fn sample_once(&self) -> Result<usize> {
        if !self.remote.is_connected() {
            self.remote.connect().await?;
        }

        let result = self
            .remote
            .execute_remote_command("gpu_monitor", &self.query_command, None)
            .await?;
        if !result.success {
            return Err(MqiError::GpuResource(format!(
                "GPU query failed: {}",
                result.failure_reason()
            )));
        }

        let batch = parse_telemetry(&result.output);
        if batch.is_empty() {
            warn!("GPU query returned no usable rows");
            return Ok(0);
        }
        self.repo.update_resources(&batch).await
    }
}

struct Worker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Background task keeping the GPU ledger fresh.
pub struct GpuMonitor {
    sampler: GpuSampler,
    interval: Duration,
    stop_timeout: Duration,
    worker: Mutex<Option<Worker>>,
}

impl GpuMonitor {
    pub fn new(sampler: GpuSampler, interval: Duration, stop_timeout: Duration) -> Self {
        Self {
            sampler,
            interval,
            stop_timeout,
            worker: Mutex::new(None),
        }
    }

    pub fn from_config(sampler: GpuSampler, config: &GpuConfig) -> Self {
        Self::new(sampler, config.monitor_interval(), config.stop_timeout())
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .map(|w| w.as_ref().is_some_and(|w| !w.handle.is_finished()))
            .unwrap_or(false)
    }

    /// Spawn the sampling loop under `span`. Returns false if already running.
    pub fn start(&self, span: tracing::Span) -> bool {
        let mut worker = self.worker.lock().unwrap_or_else(|p| p.into_inner());
        if worker.is_some() {
            warn!("GPU monitor already running");
            return false;
        }

        let (shutdown, receiver) = watch::channel(false);
        let sampler = self.sampler.clone();
        let interval = self.interval;
        let handle = tokio::spawn(run_loop(sampler, interval, receiver).instrument(span));

        *worker = Some(Worker { shutdown, handle });
        info!(interval_secs = interval.as_secs_f64(), "GPU monitor started");
        true
    }

    /// Signal the loop and wait up to the stop timeout.
    ///
    /// Returns false when the task had to be aborted.
    pub async fn stop(&self) -> bool {
        let taken = self.worker.lock().unwrap_or_else(|p| p.into_inner()).take();
        let Some(Worker { shutdown, mut handle }) = taken else {
            warn!("GPU monitor is not running");
            return true;
        };

        let _ = shutdown.send(true);
        match tokio::time::timeout(self.stop_timeout, &mut handle).await {
            Ok(_) => {
                info!("GPU monitor stopped");
                true
            }
            Err(_) => {
                error!(
                    timeout_secs = self.stop_timeout.as_secs_f64(),
                    "GPU monitor did not stop in time; aborting"
                );
                handle.abort();
                false
            }
        }
    }
}

async fn run_loop(sampler: GpuSampler, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match sampler.sample_once().await {
                    Ok(count) => debug!(gpus = count, "GPU telemetry refreshed"),
                    Err(e) => warn!(error = %e, "GPU sampling failed; will retry next interval"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("GPU monitor loop exited");
}

use anyhow::Result;
use std::sync::Arc;

use crate::cli::context::PipelineContext;
use crate::gpu::{GpuMonitor, GpuSampler};
use crate::shutdown::ShutdownCoordinator;
use crate::telemetry::create_monitor_span;

pub struct MonitorCommand {
    pub once: bool,
}

impl MonitorCommand {
    pub async fn execute(&self, context: PipelineContext) -> Result<()> {
        let sampler = GpuSampler::new(
            context.remote.clone(),
            context.gpus.clone(),
            &context.config.gpu.query_command,
        );

        if self.once {
            let result = sampler.sample_once().await;
            context.close().await;
            let count = result?;
            println!("✅ Recorded {} GPU(s)", count);
            return Ok(());
        }

        let monitor = Arc::new(GpuMonitor::from_config(sampler, &context.config.gpu));
        monitor.start(create_monitor_span(&context.config.hpc.host));
        println!("🔄 Monitoring GPUs on {} (Ctrl-C to stop)", context.config.hpc.host);

        let PipelineContext { remote, database, .. } = context;
        ShutdownCoordinator::new()
            .with_monitor(monitor)
            .with_remote(remote)
            .with_database(database)
            .wait_for_shutdown()
            .await
    }
}

use anyhow::Result;

use crate::repositories::GpuRepository;

pub struct GpusCommand;

impl GpusCommand {
    pub async fn execute(&self, gpus: &GpuRepository) -> Result<()> {
        let resources = gpus.get_all_gpu_resources().await?;
        if resources.is_empty() {
            println!("No GPUs recorded yet. Run 'mqi-pipeline monitor --once' to sample the cluster.");
            return Ok(());
        }

        println!("🖥️  GPU LEDGER");
        println!("─────────────");
        for gpu in &resources {
            let owner = gpu.assigned_case.as_deref().unwrap_or("-");
            println!(
                "{:<44} {:<12} {:>6}/{:>6} MiB free  {:>3}C {:>3}%  {}",
                gpu.uuid,
                gpu.status.as_str(),
                gpu.memory_free,
                gpu.memory_total,
                gpu.temperature,
                gpu.utilization,
                owner
            );
        }
        println!();
        println!("Available: {}/{}", gpus.get_available_gpu_count().await?, resources.len());
        Ok(())
    }
}

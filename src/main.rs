use anyhow::Result;
use clap::Parser;

use mqi_pipeline::cli::commands::{
    AddBeamCommand, AddCaseCommand, GpusCommand, InitDbCommand, MonitorCommand, RunBeamCommand,
    RunCaseCommand,
};
use mqi_pipeline::cli::context::PipelineContext;
use mqi_pipeline::cli::{Cli, Commands};
use mqi_pipeline::config::MqiConfig;
use mqi_pipeline::init_telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    MqiConfig::load_env_file()?;
    let config = MqiConfig::load_from(cli.config.as_deref())?;
    init_telemetry(&config.observability)?;

    match cli.command {
        Commands::InitDb { write_config } => InitDbCommand::new(write_config).execute(&config).await,
        Commands::AddCase { case_id, case_path } => {
            let context = PipelineContext::open(config).await?;
            let result = AddCaseCommand { case_id, case_path }.execute(&context.cases).await;
            context.close().await;
            result
        }
        Commands::AddBeam {
            case_id,
            beam_id,
            beam_path,
            case_path,
        } => {
            let context = PipelineContext::open(config).await?;
            let command = AddBeamCommand {
                case_id,
                beam_id,
                beam_path,
                case_path,
            };
            let result = command.execute(&context.cases).await;
            context.close().await;
            result
        }
        Commands::RunBeam { beam_id } => {
            let context = PipelineContext::open(config).await?;
            RunBeamCommand { beam_id }.execute(context).await
        }
        Commands::RunCase { case_id } => {
            let context = PipelineContext::open(config).await?;
            RunCaseCommand { case_id }.execute(context).await
        }
        Commands::Monitor { once } => {
            let context = PipelineContext::open(config).await?;
            MonitorCommand { once }.execute(context).await
        }
        Commands::Gpus => {
            let context = PipelineContext::open(config).await?;
            let result = GpusCommand.execute(&context.gpus).await;
            context.close().await;
            result
        }
    }
}

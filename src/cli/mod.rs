use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod commands;
pub mod context;

#[derive(Parser)]
#[command(name = "mqi-pipeline")]
#[command(about = "Proton dose simulation pipeline for MOQUI on a Slurm GPU cluster")]
#[command(long_about = "Runs each treatment beam through validation, upload, GPU simulation on the \
                       cluster, download and DICOM conversion. Register beams with 'add-case' or 'add-beam', then \
                       'run-case' to process them.")]
pub struct Cli {
    /// Configuration file to load instead of mqi.toml / .mqi-rc
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the database and apply migrations
    InitDb {
        /// Also write the effective configuration to this file if it does not exist
        #[arg(long)]
        write_config: Option<PathBuf>,
    },
    /// Register a case directory, one beam per subdirectory
    AddCase {
        case_id: String,
        /// Directory whose subdirectories hold each beam's inputs
        case_path: PathBuf,
    },
    /// Register a beam directory under a case
    AddBeam {
        case_id: String,
        beam_id: String,
        /// Directory holding the beam's DICOM inputs
        beam_path: PathBuf,
        /// Case directory; defaults to the beam directory's parent
        #[arg(long)]
        case_path: Option<PathBuf>,
    },
    /// Run a single beam through the workflow
    RunBeam { beam_id: String },
    /// Run every non-terminal beam of a case concurrently
    RunCase { case_id: String },
    /// Keep the GPU ledger fresh until Ctrl-C
    Monitor {
        /// Take a single sample and exit
        #[arg(long)]
        once: bool,
    },
    /// Show the GPU ledger
    Gpus,
}

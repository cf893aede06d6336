//! Generation of the `moqui_tps.in` simulation parameter file
//!
//! The file is a flat list of `Key Value` lines. Static keys come from the
//! `[tps.parameters]` config table; paths and the GPU index are filled in per
//! beam so the simulation reads its inputs from, and writes its dose to, the
//! beam's remote working directory.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, error, info};

use crate::config::{HpcConfig, TpsConfig};
use crate::error::Result;
use crate::models::Beam;

pub const TPS_FILE_NAME: &str = "moqui_tps.in";

const REQUIRED_PARAMETERS: [&str; 4] = ["GPUID", "DicomDir", "logFilePath", "OutputDir"];

#[cfg_attr(test, automock)]
#[async_trait]
pub trait TpsGenerator: Send + Sync {
    /// Write `moqui_tps.in` into the beam directory. `Ok(false)` means the
    /// parameters were incomplete or the file could not be written.
    async fn generate_tps_file(&self, beam: &Beam) -> Result<bool>;
}

/// Builds the parameter file from configuration plus per-beam paths.
pub struct ParameterTpsGenerator {
    base_parameters: BTreeMap<String, String>,
    hpc: HpcConfig,
}

impl ParameterTpsGenerator {
    pub fn new(tps: &TpsConfig, hpc: HpcConfig) -> Self {
        Self {
            base_parameters: tps.parameters.clone(),
            hpc,
        }
    }

    /// Full parameter set for one beam, sorted by key.
    pub fn parameters_for(&self, beam: &Beam) -> BTreeMap<String, String> {
        let remote_dir = self.hpc.remote_beam_dir(&beam.parent_case_id, &beam.beam_id);

        let mut parameters = self.base_parameters.clone();
        // The batch script pins one device through CUDA_VISIBLE_DEVICES
        parameters.insert("GPUID".to_string(), "0".to_string());
        parameters.insert("DicomDir".to_string(), remote_dir.clone());
        parameters.insert("OutputDir".to_string(), remote_dir.clone());
        parameters.insert("logFilePath".to_string(), format!("{}/simulation.log", remote_dir));
        parameters.insert("ParentDir".to_string(), remote_dir);

        let beams = count_dicom_files(&beam.beam_path);
        if beams > 0 {
            parameters.insert("BeamNumbers".to_string(), beams.to_string());
            parameters.insert("GantryNum".to_string(), beams.to_string());
        }
        parameters
    }
}

fn count_dicom_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| {
                    e.path()
                        .extension()
                        .is_some_and(|ext| ext.eq_ignore_ascii_case("dcm"))
                })
                .count()
        })
        .unwrap_or(0)
}

fn missing_parameters(parameters: &BTreeMap<String, String>) -> Vec<&'static str> {
    REQUIRED_PARAMETERS
        .iter()
        .copied()
        .filter(|key| parameters.get(*key).is_none_or(|v| v.trim().is_empty()))
        .collect()
}

pub fn format_parameters(parameters: &BTreeMap<String, String>) -> String {
    let mut content = String::new();
    for (key, value) in parameters {
        content.push_str(key);
        content.push(' ');
        content.push_str(value);
        content.push('\n');
    }
    content
}

#[async_trait]
impl TpsGenerator for ParameterTpsGenerator {
    async fn generate_tps_file(&self, beam: &Beam) -> Result<bool> {
        let parameters = self.parameters_for(beam);

        let missing = missing_parameters(&parameters);
        if !missing.is_empty() {
            error!(beam_id = %beam.beam_id, missing = ?missing, "Required TPS parameters are missing");
            return Ok(false);
        }

        let output_file = beam.beam_path.join(TPS_FILE_NAME);
        debug!(beam_id = %beam.beam_id, file = %output_file.display(), "Writing TPS file");
        if let Err(e) = tokio::fs::write(&output_file, format_parameters(&parameters)).await {
            error!(
                beam_id = %beam.beam_id,
                file = %output_file.display(),
                error = %e,
                "Failed to write TPS file"
            );
            return Ok(false);
        }

        info!(
            beam_id = %beam.beam_id,
            parameters = parameters.len(),
            "TPS file generated"
        );
        Ok(true)
    }
}

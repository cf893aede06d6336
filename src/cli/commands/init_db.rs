use anyhow::Result;
use std::path::PathBuf;

use crate::config::MqiConfig;
use crate::database::DatabaseManager;

pub struct InitDbCommand {
    pub write_config: Option<PathBuf>,
}

impl InitDbCommand {
    pub fn new(write_config: Option<PathBuf>) -> Self {
        Self { write_config }
    }

    pub async fn execute(&self, config: &MqiConfig) -> Result<()> {
        if let Some(path) = &self.write_config {
            if path.exists() {
                println!("ℹ️  {} already exists, leaving it untouched", path.display());
            } else {
                config.save_to_file(path)?;
                println!("✅ Wrote configuration to {}", path.display());
            }
        }

        if let Some(dir) = sqlite_parent_dir(&config.database.url) {
            std::fs::create_dir_all(&dir)?;
        }
        let database = DatabaseManager::new(&config.database.url, config.database.max_connections, true).await?;
        database.shutdown().await;

        println!("✅ Database ready at {}", config.database.url);
        Ok(())
    }
}

/// Parent directory of a file-backed sqlite url, if it has one
fn sqlite_parent_dir(url: &str) -> Option<PathBuf> {
    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))?;
    let path = path.split('?').next()?;
    if path.is_empty() || path == ":memory:" {
        return None;
    }
    PathBuf::from(path)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(PathBuf::from)
}

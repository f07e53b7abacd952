use anyhow::Result;
use bolong_core::Engine;
use chrono::Utc;
use clap::Args;
use std::path::PathBuf;

#[derive(Args)]
pub struct BackupCommand {
    #[arg(help = "Directory to back up (default: current directory)")]
    dir: Option<PathBuf>,
}

impl BackupCommand {
    pub async fn run(&self, engine: &Engine) -> Result<()> {
        let dir = match &self.dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };
        // Snapshot names are UTC timestamps; lexical order is chronological.
        let name = Utc::now().format("%Y%m%d-%H%M%S").to_string();
        engine.backup(&dir, &name).await?;
        Ok(())
    }
}

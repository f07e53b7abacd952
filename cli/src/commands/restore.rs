use anyhow::Result;
use bolong_core::{Engine, RestoreOptions};
use clap::Args;
use std::path::PathBuf;

#[derive(Args)]
pub struct RestoreCommand {
    #[arg(long, default_value = "latest", help = "Name of the snapshot to restore")]
    name: String,

    #[arg(help = "Destination directory")]
    destination: PathBuf,

    #[arg(help = "Only restore paths matching these regexes")]
    patterns: Vec<String>,
}

impl RestoreCommand {
    pub async fn run(&self, engine: &Engine, quiet: bool) -> Result<()> {
        engine
            .restore(
                &self.name,
                &self.destination,
                &self.patterns,
                &RestoreOptions { quiet },
            )
            .await?;
        Ok(())
    }
}

use anyhow::Result;
use bolong_core::Engine;
use clap::Args;

#[derive(Args)]
pub struct ListCommand {}

impl ListCommand {
    pub async fn run(&self, engine: &Engine) -> Result<()> {
        for backup in engine.list_backups().await? {
            println!("{} {}", backup.name, backup.kind.suffix());
        }
        Ok(())
    }
}

use anyhow::Result;
use bolong_core::{index, Engine};
use clap::Args;

#[derive(Args)]
pub struct DumpIndexCommand {
    #[arg(help = "Snapshot name (default: latest)")]
    name: Option<String>,
}

impl DumpIndexCommand {
    pub async fn run(&self, engine: &Engine) -> Result<()> {
        let name = self.name.as_deref().unwrap_or("latest");
        let backup = engine.find_backup(name).await?;
        let idx = engine.read_index(&backup).await?;
        print!("{}", index::serialize(&idx));
        Ok(())
    }
}

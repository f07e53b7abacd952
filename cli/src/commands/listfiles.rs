use anyhow::Result;
use bolong_core::{Engine, FileKind};
use clap::Args;

#[derive(Args)]
pub struct ListFilesCommand {
    #[arg(long, default_value = "latest", help = "Name of the snapshot to list files for")]
    name: String,

    #[arg(long, help = "Include kind, permissions, size and ownership")]
    verbose: bool,
}

impl ListFilesCommand {
    pub async fn run(&self, engine: &Engine) -> Result<()> {
        let chain = engine.backup_chain(&self.name).await?;
        let idx = engine.read_index(&chain[0]).await?;
        for f in &idx.contents {
            let mut name = f.name.clone();
            if f.kind == FileKind::Directory {
                name.push('/');
            }
            if self.verbose {
                let (kind, size) = match f.kind {
                    FileKind::Directory => ("d", format!("{:10}", "")),
                    FileKind::Regular => ("f", format!("{:10}", f.size)),
                    FileKind::Symlink => ("s", format!("{:10}", f.size)),
                };
                println!(
                    "{} {:04o} {} {:>10} {:>10} {}",
                    kind, f.permissions, size, f.user, f.group, name
                );
            } else {
                println!("{}", name);
            }
        }
        Ok(())
    }
}

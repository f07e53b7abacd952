use crate::catalog::Backup;
use crate::config::Config;
use crate::index::{self, Index};
use crate::remote::Remote;
use crate::safe::SafeReader;
use crate::{Error, Result};
use std::sync::Arc;

/// The engine carries the configuration and a remote-store handle; every
/// operation goes through it. There is no process-wide state, so tests can
/// run engines against isolated stores side by side.
pub struct Engine {
    config: Config,
    remote: Arc<dyn Remote>,
}

impl Engine {
    pub fn new(config: Config, remote: Arc<dyn Remote>) -> Result<Engine> {
        config.validate()?;
        Ok(Engine { config, remote })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn remote(&self) -> &Arc<dyn Remote> {
        &self.remote
    }

    /// Fetch and decode the index of a backup.
    pub async fn read_index(&self, backup: &Backup) -> Result<Index> {
        let reader = self.remote.open(&backup.index_object()).await?;
        let mut safe = SafeReader::new(reader, &self.config.passphrase).await?;
        let data = safe.read_to_end().await?;
        let text = String::from_utf8(data)
            .map_err(|_| Error::IndexMalformed("index is not valid UTF-8".into()))?;
        index::parse(&text)
    }
}

pub mod googles3;
pub mod local;
pub mod retry;

use bolong_core::config::StoreKind;
use bolong_core::{Config, Error, Remote, Result};
use std::sync::Arc;

/// Construct the remote-store driver selected by the configuration.
pub fn open(config: &Config) -> Result<Arc<dyn Remote>> {
    match config.kind {
        StoreKind::Local => {
            let local = config
                .local
                .as_ref()
                .ok_or_else(|| Error::Config("missing local section".into()))?;
            Ok(Arc::new(local::LocalRemote::new(&local.path)))
        }
        StoreKind::Googles3 => {
            let s3 = config
                .googles3
                .as_ref()
                .ok_or_else(|| Error::Config("missing googles3 section".into()))?;
            Ok(Arc::new(googles3::GoogleS3Remote::new(s3)))
        }
    }
}

//! `nsscache update`: bring caches up to date with their sources.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;

use nsscache_core::MapKind;
use nsscache_update::{update_maps, CancelToken, UpdateOptions};

use crate::Globals;

/// Arguments for `nsscache update`.
#[derive(Args, Debug)]
pub struct UpdateArgs {
    /// Map to update; repeat for several. Defaults to every configured map.
    #[arg(long = "map", value_name = "KIND")]
    pub maps: Vec<MapKind>,

    /// Skip incremental mode and fetch every map in full.
    #[arg(short, long, visible_alias = "force")]
    pub full: bool,

    /// Publish even when the result would empty a map.
    #[arg(long)]
    pub force_write: bool,

    /// Seconds to wait before starting.
    #[arg(short, long, value_name = "SECS")]
    pub sleep: Option<u64>,
}

impl UpdateArgs {
    pub fn run(self, globals: &Globals) -> Result<u8> {
        let config = globals.load_config()?;
        let maps = config.select(&self.maps)?;

        if let Some(secs) = self.sleep.filter(|s| *s > 0) {
            tracing::info!("delaying {secs}s before updating");
            std::thread::sleep(Duration::from_secs(secs));
        }

        let options = UpdateOptions {
            force_full: self.full,
            force_write: self.force_write,
        };
        let summary = update_maps(config, &maps, options, CancelToken::new())
            .context("failed to start the update runtime")?;
        Ok(super::report_summary(&summary))
    }
}

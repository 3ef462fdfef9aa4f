//! `nsscache repair`: rebuild caches from a full fetch.

use anyhow::{Context, Result};
use clap::Args;

use nsscache_core::MapKind;
use nsscache_update::{repair_maps, CancelToken};

use crate::Globals;

/// Arguments for `nsscache repair`.
#[derive(Args, Debug)]
pub struct RepairArgs {
    /// Map to repair; repeat for several. Defaults to every configured map.
    #[arg(long = "map", value_name = "KIND")]
    pub maps: Vec<MapKind>,

    /// Publish even when the source returns an empty map.
    #[arg(long)]
    pub force_write: bool,
}

impl RepairArgs {
    pub fn run(self, globals: &Globals) -> Result<u8> {
        let config = globals.load_config()?;
        let maps = config.select(&self.maps)?;
        let summary = repair_maps(config, &maps, self.force_write, CancelToken::new())
            .context("failed to start the update runtime")?;
        Ok(super::report_summary(&summary))
    }
}

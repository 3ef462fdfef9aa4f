//! `nsscache diff --map KIND`: show what a full update would change.

use anyhow::{Context, Result};
use clap::Args;

use nsscache_core::MapKind;
use nsscache_update::verify::diff_map;

use crate::Globals;

/// Arguments for `nsscache diff`.
#[derive(Args, Debug)]
pub struct DiffArgs {
    /// Map to diff.
    #[arg(long = "map", value_name = "KIND")]
    pub map: MapKind,
}

impl DiffArgs {
    /// Exit 0 when identical, 1 when the cache differs.
    pub fn run(self, globals: &Globals) -> Result<u8> {
        let config = globals.load_config()?;
        let options = config
            .map(self.map)
            .with_context(|| format!("map '{}' is not configured", self.map))?;

        let diff = diff_map(&config, options)
            .with_context(|| format!("diff failed for '{}'", self.map))?;

        if diff.is_empty() {
            println!("No differences for '{}'.", self.map);
            return Ok(0);
        }

        print!("{diff}");
        if !diff.ends_with('\n') {
            println!();
        }
        Ok(1)
    }
}

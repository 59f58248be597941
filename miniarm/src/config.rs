//! Boot-time settings taken from `/chosen/bootargs`.
//!
//! Recognised tokens are `loglevel=<off|error|warn|info|debug|trace>` and
//! `gnttab_frames=<n>`. Anything else on the command line belongs to
//! somebody else and is ignored.

use core::str::FromStr;

use log::{LevelFilter, warn};

use crate::devtree::DeviceTree;
use crate::mem::mmu::MAX_GRANT_FRAMES;

pub const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::Info;
pub const DEFAULT_GNTTAB_FRAMES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootConfig {
    pub log_level: LevelFilter,
    pub gnttab_frames: usize,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL,
            gnttab_frames: DEFAULT_GNTTAB_FRAMES,
        }
    }
}

impl BootConfig {
    pub fn from_bootargs(args: &str) -> Self {
        let mut config = Self::default();
        for (key, value) in args.split_whitespace().filter_map(|t| t.split_once('=')) {
            match key {
                "loglevel" => match LevelFilter::from_str(value) {
                    Ok(level) => config.log_level = level,
                    Err(_) => warn!("ignoring loglevel={}", value),
                },
                "gnttab_frames" => match value.parse::<usize>() {
                    Ok(n) if (1..=MAX_GRANT_FRAMES).contains(&n) => config.gnttab_frames = n,
                    _ => warn!("ignoring gnttab_frames={}", value),
                },
                _ => {}
            }
        }
        config
    }

    pub fn from_device_tree(dt: &DeviceTree<'_>) -> Self {
        dt.bootargs().map(Self::from_bootargs).unwrap_or_default()
    }
}

//! Desktop adapters for the core's hardware-facing traits.
//!
//! - [`DirScripts`]: scripts are files in a directory
//! - [`LoggedPins`]: there are no pins on a desktop, so `configpin` is logged
//! - [`LogSink`]: the change feed goes to the log

use std::convert::Infallible;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::entities::Delta;
use crate::traits::{DeltaSink, PinConfigurator, PinMode, ScriptSource};

/// Script files under one directory.
///
/// `run yard` reads `<root>/yard`, falling back to `<root>/yard.txt`. Names
/// that would leave the directory are refused.
#[derive(Clone, Debug)]
pub struct DirScripts {
    root: PathBuf,
}

impl DirScripts {
    /// Serve scripts from `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The directory scripts are read from.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn is_safe_name(name: &str) -> bool {
        !name.is_empty()
            && !name.starts_with('.')
            && !name.contains(['/', '\\'])
    }
}

impl ScriptSource for DirScripts {
    fn read_script(&self, name: &str) -> Option<String> {
        if !Self::is_safe_name(name) {
            warn!("[scripts] refusing script name {:?}", name);
            return None;
        }
        let plain = self.root.join(name);
        let candidates = [plain.clone(), plain.with_extension("txt")];
        candidates.iter().find_map(|path| match std::fs::read_to_string(path) {
            Ok(text) => {
                debug!("[scripts] loaded {}", path.display());
                Some(text)
            }
            Err(_) => None,
        })
    }
}

/// Pin configurator that only logs.
#[derive(Debug, Default)]
pub struct LoggedPins;

impl PinConfigurator for LoggedPins {
    type Error = Infallible;

    fn configure(&mut self, pin: u8, mode: PinMode) -> Result<(), Infallible> {
        info!("[pins] pin {} -> {}", pin, mode.as_str());
        Ok(())
    }
}

/// Delta sink that writes each change to the log at debug level.
#[derive(Debug, Default)]
pub struct LogSink {
    published: u64,
}

impl LogSink {
    /// Deltas logged so far.
    pub fn published(&self) -> u64 {
        self.published
    }
}

impl DeltaSink for LogSink {
    type Error = Infallible;

    fn publish(&mut self, delta: &Delta) -> Result<(), Infallible> {
        self.published += 1;
        debug!("[feed] {:?}", delta);
        Ok(())
    }
}

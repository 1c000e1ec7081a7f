//! Watermark persistence: one small text file per (site, VSite).

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::Watermark;
use crate::Result;

/// Reads and writes `<state_dir>/<agent_key>-<site>-<vsite>.timestamp`.
#[derive(Debug, Clone)]
pub struct TimestampStore {
    state_dir: PathBuf,
    agent_key: String,
    site: String,
}

impl TimestampStore {
    pub fn new(
        state_dir: impl Into<PathBuf>,
        agent_key: impl Into<String>,
        site: impl Into<String>,
    ) -> Self {
        Self {
            state_dir: state_dir.into(),
            agent_key: agent_key.into(),
            site: site.into(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Path of the timestamp file for `vsite`.
    pub fn path(&self, vsite: &str) -> PathBuf {
        self.state_dir
            .join(format!("{}-{}-{}.timestamp", self.agent_key, self.site, vsite))
    }

    /// Load the last persisted watermark, or the epoch if there is none.
    ///
    /// An unreadable file is treated like a missing one so the VSite simply
    /// resynchronizes from scratch.
    pub fn load(&self, vsite: &str) -> Watermark {
        let path = self.path(vsite);
        match std::fs::read_to_string(&path) {
            Ok(contents) => match contents.lines().next() {
                Some(line) if !line.trim().is_empty() => Watermark::new(line),
                _ => Watermark::epoch(),
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Watermark::epoch(),
            Err(e) => {
                warn!(path = %path.display(), "Unreadable timestamp file, starting from epoch: {e}");
                Watermark::epoch()
            }
        }
    }

    /// Durably record `watermark` for `vsite`.
    ///
    /// Writes a sibling temporary file and renames it over the old one.
    pub fn save(&self, vsite: &str, watermark: &Watermark) -> Result<()> {
        let path = self.path(vsite);
        let tmp = path.with_extension("timestamp.tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            writeln!(file, "{watermark}")?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;
        debug!(vsite, %watermark, path = %path.display(), "Saved watermark");
        Ok(())
    }
}

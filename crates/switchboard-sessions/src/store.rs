//! Paths into the CLI's on-disk session store.
//!
//! The CLI keeps one JSONL per conversation under
//! `<config_dir>/projects/<slug>/<uuid>.jsonl`, where `<slug>` is the
//! workspace path with every non-alphanumeric character replaced by `-`.
//! The gateway only ever reads, forks, or deletes these files - and never
//! while a child is running for that UUID.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Result;

pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(config_dir: &str, workspace_dir: &str) -> Self {
        let root = Path::new(config_dir)
            .join("projects")
            .join(slugify(workspace_dir));
        Self { root }
    }

    /// The JSONL file the CLI uses for `uuid`.
    pub fn session_file(&self, uuid: &str) -> PathBuf {
        self.root.join(format!("{uuid}.jsonl"))
    }

    /// True when a prior conversation exists on disk - lets a fresh gateway
    /// process resume sessions recorded before a restart.
    pub fn exists(&self, uuid: &str) -> bool {
        self.session_file(uuid).is_file()
    }

    /// Delete the session file, clearing an "already in use" lock. Returns
    /// whether a file was actually removed.
    pub fn delete(&self, uuid: &str) -> Result<bool> {
        let path = self.session_file(uuid);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(uuid, "session file deleted");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Directory holding this workspace's session files.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn slugify(path: &str) -> String {
    path.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

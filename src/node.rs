//! Persistent node identity.
//!
//! A meta node records its id and the HTTP addresses of the meta servers it
//! knows about in `<dir>/node.json`, so a restarted node rejoins the same
//! cluster without being told the seeds again.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

const NODE_FILE: &str = "node.json";
const NODE_TMP_FILE: &str = "node.json.tmp";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Zero until the cluster assigns one.
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub meta_servers: Vec<String>,
}

impl Node {
    /// Load the identity stored under `dir`.  A missing file yields the
    /// default identity.
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let path = dir.join(NODE_FILE);
        match fs::read(&path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(anyhow::anyhow!("reading {}: {}", path.display(), e)),
        }
    }

    /// Write the identity to `dir`, replacing the previous file atomically.
    pub fn save(&self, dir: &Path) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let tmp = dir.join(NODE_TMP_FILE);
        let path = dir.join(NODE_FILE);

        let mut file = File::create(&tmp)?;
        serde_json::to_writer(&mut file, self)?;
        file.flush()?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, &path)?;
        Ok(path)
    }
}

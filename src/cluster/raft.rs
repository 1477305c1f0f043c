//! Single-voter consensus module.
//!
//! [`LocalConsensus`] satisfies the [`Consensus`] contract for a cluster of
//! exactly one meta node.  Every proposal is appended to a JSON Lines log
//! (`raft.log`), flushed, then handed to the state machine.  After
//! `snapshot_threshold` entries the state machine is snapshotted into
//! `snapshot.json` and the log is truncated.
//!
//! Loading happens off the open path: `open` only reads the files, and a
//! background task restores the snapshot, replays the log, waits out the
//! election timeout and only then reports itself as leader.  Callers that
//! wait for a leader therefore also wait for the log to be applied.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::consensus::{
    BoxFuture, Consensus, ConsensusOpener, ConsensusOptions, Role, StateMachine,
};
use crate::errors::ConsensusError;

const LOG_FILE: &str = "raft.log";
const SNAPSHOT_FILE: &str = "snapshot.json";

#[derive(Debug, Serialize, Deserialize)]
struct LogEntry {
    index: u64,
    /// Hex-encoded command bytes.
    command: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    last_index: u64,
    /// Hex-encoded state machine snapshot.
    data: String,
}

/// Opens [`LocalConsensus`] instances.
#[derive(Debug, Clone)]
pub struct LocalConsensusOpener {
    pub election_timeout: Duration,
    pub snapshot_threshold: u64,
}

impl Default for LocalConsensusOpener {
    fn default() -> Self {
        Self {
            election_timeout: Duration::from_millis(1000),
            snapshot_threshold: 8192,
        }
    }
}

impl ConsensusOpener for LocalConsensusOpener {
    fn open(&self, opts: ConsensusOptions) -> Result<Arc<dyn Consensus>, ConsensusError> {
        let consensus: Arc<dyn Consensus> =
            LocalConsensus::open(opts, self.election_timeout, self.snapshot_threshold)?;
        Ok(consensus)
    }
}

struct LogState {
    dir: PathBuf,
    writer: BufWriter<File>,
    last_index: u64,
    entries_since_snapshot: u64,
}

pub struct LocalConsensus {
    addr: String,
    role: RwLock<Role>,
    log: Mutex<LogState>,
    state_machine: Arc<dyn StateMachine>,
    snapshot_threshold: u64,
    loader: Mutex<Option<JoinHandle<()>>>,
}

impl LocalConsensus {
    /// Open the log under `<opts.dir>/raft` and start the background loader.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(
        opts: ConsensusOptions,
        election_timeout: Duration,
        snapshot_threshold: u64,
    ) -> Result<Arc<Self>, ConsensusError> {
        if opts.peers.iter().any(|p| p != &opts.addr) {
            return Err(ConsensusError::Unsupported(format!(
                "local consensus cannot replicate to peers {:?}",
                opts.peers
            )));
        }

        let dir = opts.dir.join("raft");
        std::fs::create_dir_all(&dir)?;

        let snapshot = read_snapshot(&dir)?;
        let snapshot_index = snapshot.as_ref().map(|s| s.last_index).unwrap_or(0);
        let entries: Vec<LogEntry> = read_log(&dir)?
            .into_iter()
            .filter(|e| e.index > snapshot_index)
            .collect();
        let last_index = entries.last().map(|e| e.index).unwrap_or(snapshot_index);
        debug!(
            "raft log at {}: snapshot index {}, {} entries to replay",
            dir.display(),
            snapshot_index,
            entries.len()
        );

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(LOG_FILE))?;

        let consensus = Arc::new(Self {
            addr: opts.addr,
            role: RwLock::new(Role::Candidate),
            log: Mutex::new(LogState {
                dir,
                writer: BufWriter::new(file),
                last_index,
                entries_since_snapshot: entries.len() as u64,
            }),
            state_machine: opts.state_machine,
            snapshot_threshold,
            loader: Mutex::new(None),
        });

        let loader = {
            let consensus = consensus.clone();
            tokio::spawn(async move {
                if let Err(e) = consensus.load(snapshot, entries) {
                    warn!("raft log replay failed: {}", e);
                    consensus.set_role(Role::Shutdown);
                    return;
                }
                tokio::time::sleep(election_timeout).await;
                consensus.promote();
            })
        };
        *consensus.loader.lock().expect("mutex poisoned") = Some(loader);

        Ok(consensus)
    }

    fn load(
        &self,
        snapshot: Option<SnapshotFile>,
        entries: Vec<LogEntry>,
    ) -> Result<(), ConsensusError> {
        let _log = self.log.lock().expect("mutex poisoned");
        if let Some(snapshot) = snapshot {
            let bytes = decode_hex(&snapshot.data)?;
            self.state_machine.restore(&bytes)?;
        }
        for entry in entries {
            let command = decode_hex(&entry.command)?;
            match self.state_machine.apply(&command) {
                Ok(()) | Err(ConsensusError::Rejected(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn promote(&self) {
        let mut role = self.role.write().expect("rwlock poisoned");
        if *role == Role::Candidate {
            *role = Role::Leader;
            info!("raft node {} elected leader", self.addr);
        }
    }

    fn set_role(&self, new: Role) {
        *self.role.write().expect("rwlock poisoned") = new;
    }

    fn commit(&self, command: &[u8]) -> Result<(), ConsensusError> {
        let mut log = self.log.lock().expect("mutex poisoned");
        match self.role() {
            Role::Leader => {}
            Role::Shutdown => return Err(ConsensusError::Shutdown),
            _ => return Err(ConsensusError::NotLeader { leader: None }),
        }

        let entry = LogEntry {
            index: log.last_index + 1,
            command: hex::encode(command),
        };
        let line = serde_json::to_string(&entry)?;
        writeln!(log.writer, "{line}")?;
        log.writer.flush()?;
        log.writer.get_ref().sync_data()?;
        log.last_index = entry.index;
        log.entries_since_snapshot += 1;

        let result = self.state_machine.apply(command);

        if log.entries_since_snapshot >= self.snapshot_threshold {
            if let Err(e) = self.compact(&mut log) {
                warn!("raft log compaction failed: {}", e);
            }
        }
        result
    }

    fn compact(&self, log: &mut LogState) -> Result<(), ConsensusError> {
        let data = self.state_machine.snapshot()?;
        let snapshot = SnapshotFile {
            last_index: log.last_index,
            data: hex::encode(data),
        };

        let temp = NamedTempFile::new_in(&log.dir)?;
        {
            let mut writer = BufWriter::new(&temp);
            serde_json::to_writer(&mut writer, &snapshot)?;
            writer.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.persist(log.dir.join(SNAPSHOT_FILE))
            .map_err(|e| ConsensusError::Io(e.error))?;

        let file = File::create(log.dir.join(LOG_FILE))?;
        log.writer = BufWriter::new(file);
        log.entries_since_snapshot = 0;
        debug!("raft log compacted at index {}", log.last_index);
        Ok(())
    }
}

impl Consensus for LocalConsensus {
    fn role(&self) -> Role {
        *self.role.read().expect("rwlock poisoned")
    }

    fn leader(&self) -> Option<String> {
        match self.role() {
            Role::Leader => Some(self.addr.clone()),
            _ => None,
        }
    }

    fn propose(&self, command: Vec<u8>) -> BoxFuture<'_, Result<(), ConsensusError>> {
        Box::pin(async move { self.commit(&command) })
    }

    fn shutdown(&self) -> BoxFuture<'_, Result<(), ConsensusError>> {
        Box::pin(async move {
            self.set_role(Role::Shutdown);
            if let Some(loader) = self.loader.lock().expect("mutex poisoned").take() {
                loader.abort();
            }
            let mut log = self.log.lock().expect("mutex poisoned");
            log.writer.flush()?;
            Ok(())
        })
    }
}

fn read_snapshot(dir: &Path) -> Result<Option<SnapshotFile>, ConsensusError> {
    let path = dir.join(SNAPSHOT_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let file = File::open(&path)?;
    Ok(Some(serde_json::from_reader(BufReader::new(file))?))
}

fn read_log(dir: &Path) -> Result<Vec<LogEntry>, ConsensusError> {
    let path = dir.join(LOG_FILE);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(&path)?;
    let mut entries = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<LogEntry>(&line) {
            Ok(entry) => entries.push(entry),
            // A torn final write from a crash; everything before it is intact.
            Err(e) => {
                warn!("truncating raft log at unreadable entry: {}", e);
                break;
            }
        }
    }
    Ok(entries)
}

fn decode_hex(s: &str) -> Result<Vec<u8>, ConsensusError> {
    hex::decode(s).map_err(|e| {
        ConsensusError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Records applied commands; rejects the literal command `b"reject"`.
    #[derive(Default)]
    struct Recorder {
        applied: Mutex<Vec<Vec<u8>>>,
    }

    impl StateMachine for Recorder {
        fn apply(&self, command: &[u8]) -> Result<(), ConsensusError> {
            if command == b"reject" {
                return Err(ConsensusError::Rejected(
                    crate::errors::DataError::DatabaseNameRequired,
                ));
            }
            self.applied.lock().unwrap().push(command.to_vec());
            Ok(())
        }

        fn snapshot(&self) -> Result<Vec<u8>, ConsensusError> {
            Ok(serde_json::to_vec(&*self.applied.lock().unwrap())?)
        }

        fn restore(&self, snapshot: &[u8]) -> Result<(), ConsensusError> {
            *self.applied.lock().unwrap() = serde_json::from_slice(snapshot)?;
            Ok(())
        }
    }

    fn open(dir: &TempDir, sm: Arc<Recorder>, threshold: u64) -> Arc<LocalConsensus> {
        LocalConsensus::open(
            ConsensusOptions {
                dir: dir.path().to_path_buf(),
                addr: "127.0.0.1:8089".to_string(),
                peers: Vec::new(),
                state_machine: sm,
            },
            Duration::from_millis(10),
            threshold,
        )
        .unwrap()
    }

    async fn wait_leader(c: &LocalConsensus) {
        for _ in 0..200 {
            if c.role() == Role::Leader {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no leader");
    }

    #[tokio::test]
    async fn test_becomes_leader_after_election_timeout() {
        let tmp = TempDir::new().unwrap();
        let c = open(&tmp, Arc::new(Recorder::default()), 100);
        assert_eq!(c.role(), Role::Candidate);
        assert!(matches!(
            c.propose(b"early".to_vec()).await,
            Err(ConsensusError::NotLeader { leader: None })
        ));

        wait_leader(&c).await;
        assert_eq!(c.leader().as_deref(), Some("127.0.0.1:8089"));
    }

    #[tokio::test]
    async fn test_rejects_foreign_peers() {
        let tmp = TempDir::new().unwrap();
        let result = LocalConsensus::open(
            ConsensusOptions {
                dir: tmp.path().to_path_buf(),
                addr: "127.0.0.1:8089".to_string(),
                peers: vec!["127.0.0.1:8089".to_string(), "10.0.0.2:8089".to_string()],
                state_machine: Arc::new(Recorder::default()),
            },
            Duration::from_millis(10),
            100,
        );
        assert!(matches!(result, Err(ConsensusError::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_log_replays_on_reopen() {
        let tmp = TempDir::new().unwrap();
        let c = open(&tmp, Arc::new(Recorder::default()), 100);
        wait_leader(&c).await;
        c.propose(b"a".to_vec()).await.unwrap();
        assert!(matches!(
            c.propose(b"reject".to_vec()).await,
            Err(ConsensusError::Rejected(_))
        ));
        c.propose(b"b".to_vec()).await.unwrap();
        c.shutdown().await.unwrap();
        assert!(matches!(
            c.propose(b"c".to_vec()).await,
            Err(ConsensusError::Shutdown)
        ));

        let sm = Arc::new(Recorder::default());
        let c2 = open(&tmp, sm.clone(), 100);
        wait_leader(&c2).await;
        assert_eq!(
            *sm.applied.lock().unwrap(),
            vec![b"a".to_vec(), b"b".to_vec()]
        );
    }

    #[tokio::test]
    async fn test_compaction_writes_snapshot_and_truncates_log() {
        let tmp = TempDir::new().unwrap();
        let c = open(&tmp, Arc::new(Recorder::default()), 2);
        wait_leader(&c).await;
        for cmd in [b"a", b"b", b"c"] {
            c.propose(cmd.to_vec()).await.unwrap();
        }
        c.shutdown().await.unwrap();

        let raft_dir = tmp.path().join("raft");
        assert!(raft_dir.join(SNAPSHOT_FILE).exists());
        assert_eq!(read_log(&raft_dir).unwrap().len(), 1);

        let sm = Arc::new(Recorder::default());
        let c2 = open(&tmp, sm.clone(), 2);
        wait_leader(&c2).await;
        assert_eq!(sm.applied.lock().unwrap().len(), 3);
    }
}

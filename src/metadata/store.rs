//! The meta store.
//!
//! [`Store`] owns the metadata document and the consensus handle.  Reads
//! return owned clones taken under a shared lock; every mutation is a
//! [`Command`] proposed through the consensus module and applied by the
//! [`StateMachine`] callback under the exclusive lock, which bumps the index
//! by one and publishes it on the change channel.
//!
//! Lock discipline: one `RwLock` guards the document, the opened flag and
//! the consensus handle.  It is never held across an `.await`; the only
//! blocking work done under it is the open section (directory creation and
//! the synchronous consensus open), which keeps open all-or-nothing.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use metrics::{counter, gauge};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::command::Command;
use super::data::{
    Data, DatabaseInfo, NodeInfo, Privilege, RetentionPolicyInfo, RetentionPolicyUpdate,
    UserInfo,
};
use crate::auth::{self, AuthCache};
use crate::cluster::consensus::{
    Consensus, ConsensusOpener, ConsensusOptions, RaftListener, Role, StateMachine,
};
use crate::cluster::join::{Backoff, HttpJoinClient, JoinClient};
use crate::cluster::raft::LocalConsensusOpener;
use crate::config::MetaConfig;
use crate::errors::{ConsensusError, MetaError};
use crate::metrics::{record_leadership, APPLY_TOTAL, INDEX};

/// How long `open` waits for the consensus listener to be bound.
pub const RAFT_LISTENER_STARTUP_TIMEOUT: Duration = Duration::from_secs(1);

const LISTENER_POLL_INTERVAL: Duration = Duration::from_millis(10);
const LEADER_POLL_INTERVAL: Duration = Duration::from_millis(100);

struct State {
    data: Data,
    opened: bool,
    consensus: Option<Arc<dyn Consensus>>,
}

/// The part of the store the consensus module calls back into.
struct Shared {
    state: RwLock<State>,
    /// Latest applied index.  Receivers are woken on every apply.
    changed: watch::Sender<u64>,
    auth_cache: AuthCache,
}

impl StateMachine for Shared {
    fn apply(&self, command: &[u8]) -> Result<(), ConsensusError> {
        let cmd = Command::decode(command)?;
        let mut state = self.state.write().expect("rwlock poisoned");
        cmd.apply_to(&mut state.data)?;
        state.data.index += 1;
        let index = state.data.index;
        self.changed.send_replace(index);
        if let Some(user) = cmd.touched_user() {
            self.auth_cache.invalidate(user);
        }
        drop(state);

        debug!("applied {} at index {}", cmd.kind(), index);
        gauge!(INDEX).set(index as f64);
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<u8>, ConsensusError> {
        let state = self.state.read().expect("rwlock poisoned");
        Ok(serde_json::to_vec(&state.data)?)
    }

    fn restore(&self, snapshot: &[u8]) -> Result<(), ConsensusError> {
        let data: Data = serde_json::from_slice(snapshot)?;
        let mut state = self.state.write().expect("rwlock poisoned");
        let index = data.index;
        state.data = data;
        self.changed.send_replace(index);
        self.auth_cache.clear();
        drop(state);

        debug!("restored snapshot at index {}", index);
        gauge!(INDEX).set(index as f64);
        Ok(())
    }
}

/// Handle returned by [`Store::after_index`].
///
/// Signaled once the document has moved past the index the caller passed
/// in.  Dropping it unregisters the waiter.
pub struct DataChanged {
    rx: watch::Receiver<u64>,
    closing: watch::Receiver<bool>,
    stale: bool,
}

impl DataChanged {
    /// Whether a call to [`wait`](Self::wait) would return immediately.
    pub fn is_signaled(&self) -> bool {
        self.stale || self.rx.has_changed().unwrap_or(true)
    }

    /// Wait until signaled and return the index current at that moment.
    pub async fn wait(mut self) -> Result<u64, MetaError> {
        if self.stale {
            return Ok(*self.rx.borrow());
        }
        tokio::select! {
            changed = self.rx.changed() => {
                changed.map_err(|_| MetaError::Closing)?;
                Ok(*self.rx.borrow_and_update())
            }
            _ = self.closing.wait_for(|closing| *closing) => Err(MetaError::Closing),
        }
    }
}

/// The in-process authority over cluster metadata.
pub struct Store {
    config: MetaConfig,
    path: PathBuf,
    shared: Arc<Shared>,
    closing: watch::Sender<bool>,
    opener: Arc<dyn ConsensusOpener>,
    join_client: Option<Arc<dyn JoinClient>>,
}

impl Store {
    /// Create a store backed by the bundled single-voter consensus module.
    pub fn new(config: MetaConfig) -> Self {
        let opener = LocalConsensusOpener {
            election_timeout: config.election_timeout(),
            snapshot_threshold: config.snapshot_threshold,
        };
        Self::with_opener(config, Arc::new(opener))
    }

    pub fn with_opener(config: MetaConfig, opener: Arc<dyn ConsensusOpener>) -> Self {
        let (changed, _) = watch::channel(1);
        let (closing, _) = watch::channel(false);
        Self {
            path: PathBuf::from(&config.dir),
            config,
            shared: Arc::new(Shared {
                state: RwLock::new(State {
                    data: Data::default(),
                    opened: false,
                    consensus: None,
                }),
                changed,
                auth_cache: AuthCache::new(),
            }),
            closing,
            opener,
            join_client: None,
        }
    }

    /// Use `client` for the join handshake instead of an HTTP client built
    /// from the configured peers.
    pub fn with_join_client(mut self, client: Arc<dyn JoinClient>) -> Self {
        self.join_client = Some(client);
        self
    }

    pub fn config(&self) -> &MetaConfig {
        &self.config
    }

    fn lifecycle(&self, msg: &str) {
        if self.config.logging_enabled {
            info!("{}", msg);
        } else {
            debug!("{}", msg);
        }
    }

    fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    /// Run `fut` unless shutdown is signaled first.
    async fn until_closing<F: std::future::Future>(&self, fut: F) -> Result<F::Output, MetaError> {
        let mut closing = self.closing.subscribe();
        tokio::select! {
            out = fut => Ok(out),
            _ = closing.wait_for(|closing| *closing) => Err(MetaError::Closing),
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Open the store and block until the consensus module reports a leader.
    ///
    /// `http_addr` is the address this node advertises for its HTTP API.
    pub async fn open(&self, http_addr: &str, listener: &RaftListener) -> Result<(), MetaError> {
        let seeds = self.config.join_peers.clone();
        self.open_with_seeds(http_addr, listener, &seeds).await
    }

    /// Like [`open`](Self::open), joining through `seeds` instead of the
    /// configured peers.  An empty list starts or restarts a cluster locally.
    pub async fn open_with_seeds(
        &self,
        http_addr: &str,
        listener: &RaftListener,
        seeds: &[String],
    ) -> Result<(), MetaError> {
        self.lifecycle(&format!("Using data dir: {}", self.path.display()));

        let raft_addr = self.wait_for_listener(listener).await?;
        if self.is_closing() {
            return Err(MetaError::Closing);
        }
        if self.shared.state.read().expect("rwlock poisoned").opened {
            return Err(MetaError::AlreadyOpen);
        }

        let mut peers = Vec::new();
        if !seeds.is_empty() {
            peers = self.join_cluster(http_addr, &raft_addr, seeds).await?;
        }

        self.open_consensus(&raft_addr, peers)?;

        // The log is loaded and current once a leader is known.
        self.wait_for_leader(Duration::ZERO).await?;
        self.lifecycle(&format!("Store opened, leader is {:?}", self.leader()));

        if seeds.is_empty() && self.is_leader() {
            self.ensure_meta_node(http_addr, &raft_addr).await?;
        }
        Ok(())
    }

    async fn wait_for_listener(&self, listener: &RaftListener) -> Result<String, MetaError> {
        let deadline = Instant::now() + RAFT_LISTENER_STARTUP_TIMEOUT;
        loop {
            if let Some(addr) = listener.addr() {
                return Ok(advertised_addr(addr));
            }
            if Instant::now() >= deadline {
                return Err(MetaError::ListenerTimeout);
            }
            tokio::time::sleep(LISTENER_POLL_INTERVAL).await;
        }
    }

    fn open_consensus(&self, raft_addr: &str, peers: Vec<String>) -> Result<(), MetaError> {
        let mut state = self.shared.state.write().expect("rwlock poisoned");
        // close() raises the flag before taking this lock.
        if self.is_closing() {
            return Err(MetaError::Closing);
        }
        if state.opened {
            return Err(MetaError::AlreadyOpen);
        }

        std::fs::create_dir_all(&self.path).map_err(|source| MetaError::Directory {
            path: self.path.clone(),
            source,
        })?;

        let consensus = self
            .opener
            .open(ConsensusOptions {
                dir: self.path.clone(),
                addr: raft_addr.to_string(),
                peers,
                state_machine: self.shared.clone(),
            })
            .map_err(MetaError::ConsensusOpen)?;

        state.consensus = Some(consensus);
        state.opened = true;
        Ok(())
    }

    /// A fresh single node cluster registers itself as the first member.
    async fn ensure_meta_node(&self, http_addr: &str, raft_addr: &str) -> Result<(), MetaError> {
        if self.meta_node_by_tcp_host(raft_addr).is_some() {
            return Ok(());
        }
        match self.create_meta_node(http_addr, raft_addr).await {
            Ok(node) => {
                self.lifecycle(&format!("Registered meta node {} at {}", node.id, raft_addr));
                Ok(())
            }
            Err(e) if e.code() == "NodeExists" => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Signal shutdown and release the consensus module.
    ///
    /// Only the first call does anything; later calls return `Ok(())`.
    pub async fn close(&self) -> Result<(), MetaError> {
        let first = self.closing.send_if_modified(|closing| {
            if *closing {
                false
            } else {
                *closing = true;
                true
            }
        });
        if !first {
            return Ok(());
        }

        let consensus = {
            let mut state = self.shared.state.write().expect("rwlock poisoned");
            state.consensus.take()
        };
        if let Some(consensus) = consensus {
            consensus.shutdown().await?;
        }
        record_leadership(false);
        self.lifecycle("Store closed");
        Ok(())
    }

    // ── Reads ───────────────────────────────────────────────────────

    /// An owned copy of the current document.
    pub fn snapshot(&self) -> Data {
        self.shared.state.read().expect("rwlock poisoned").data.clone()
    }

    pub fn index(&self) -> u64 {
        self.shared.state.read().expect("rwlock poisoned").data.index
    }

    fn consensus(&self) -> Option<Arc<dyn Consensus>> {
        self.shared
            .state
            .read()
            .expect("rwlock poisoned")
            .consensus
            .clone()
    }

    /// The consensus address of the current leader, if any.
    pub fn leader(&self) -> Option<String> {
        self.consensus().and_then(|c| c.leader())
    }

    pub fn is_leader(&self) -> bool {
        self.consensus()
            .map(|c| c.role() == Role::Leader)
            .unwrap_or(false)
    }

    /// A handle that is signaled once the document index exceeds `index`.
    ///
    /// Already signaled when the caller is behind; otherwise signaled by the
    /// next successful apply.
    pub fn after_index(&self, index: u64) -> DataChanged {
        let state = self.shared.state.read().expect("rwlock poisoned");
        // Subscribing under the read lock pins the receiver's view to the
        // current index; apply publishes under the write lock.
        let rx = self.shared.changed.subscribe();
        DataChanged {
            rx,
            closing: self.closing.subscribe(),
            stale: index < state.data.index,
        }
    }

    pub fn user(&self, name: &str) -> Option<UserInfo> {
        let state = self.shared.state.read().expect("rwlock poisoned");
        state.data.user(name).cloned()
    }

    pub fn database(&self, name: &str) -> Option<DatabaseInfo> {
        let state = self.shared.state.read().expect("rwlock poisoned");
        state.data.database(name).cloned()
    }

    pub fn meta_nodes(&self) -> Vec<NodeInfo> {
        let state = self.shared.state.read().expect("rwlock poisoned");
        state.data.meta_nodes.clone()
    }

    pub fn meta_node_by_tcp_host(&self, tcp_host: &str) -> Option<NodeInfo> {
        let state = self.shared.state.read().expect("rwlock poisoned");
        state.data.meta_node_by_tcp_host(tcp_host).cloned()
    }

    /// Verify a user's password, going through the credential cache.
    pub fn authenticate(&self, username: &str, password: &str) -> Result<UserInfo, MetaError> {
        let user = self.user(username).ok_or(MetaError::UserNotFound)?;
        self.shared.auth_cache.verify(&user, password)?;
        Ok(user)
    }

    // ── Leadership ──────────────────────────────────────────────────

    /// Poll until a leader is known.  A zero `timeout`, or one too large to
    /// represent as a deadline, waits forever.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<(), MetaError> {
        let deadline = if timeout.is_zero() {
            None
        } else {
            Instant::now().checked_add(timeout)
        };
        let mut closing = self.closing.subscribe();
        let mut ticker = tokio::time::interval(LEADER_POLL_INTERVAL);

        loop {
            let expired = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = closing.wait_for(|closing| *closing) => return Err(MetaError::Closing),
                _ = expired => return Err(MetaError::Timeout),
                _ = ticker.tick() => {
                    if self.leader().is_some() {
                        record_leadership(self.is_leader());
                        return Ok(());
                    }
                }
            }
        }
    }

    // ── Writes ──────────────────────────────────────────────────────

    /// Replicate an encoded [`Command`].
    ///
    /// Returns once the command is committed and applied locally.  Failures
    /// from the consensus module, including "not leader", come back
    /// unmodified.
    pub async fn apply(&self, command: &[u8]) -> Result<(), MetaError> {
        let cmd = Command::decode(command).map_err(MetaError::InvalidCommand)?;
        if self.is_closing() {
            return Err(MetaError::Closing);
        }
        let consensus = self.consensus().ok_or(MetaError::NotOpen)?;

        let propose = tokio::time::timeout(
            self.config.apply_timeout(),
            consensus.propose(command.to_vec()),
        );
        let result = match self.until_closing(propose).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(MetaError::Consensus(e)),
            Ok(Err(_elapsed)) => Err(MetaError::Timeout),
            Err(e) => Err(e),
        };

        let status = if result.is_ok() { "ok" } else { "error" };
        counter!(APPLY_TOTAL, "command" => cmd.kind(), "status" => status).increment(1);
        if let Err(e) = &result {
            debug!("apply {} failed: {}", cmd.kind(), e);
        }
        result
    }

    pub async fn apply_command(&self, cmd: &Command) -> Result<(), MetaError> {
        let bytes = cmd.encode().map_err(MetaError::InvalidCommand)?;
        self.apply(&bytes).await
    }

    pub async fn create_meta_node(
        &self,
        http_addr: &str,
        raft_addr: &str,
    ) -> Result<NodeInfo, MetaError> {
        self.apply_command(&Command::CreateMetaNode {
            host: http_addr.to_string(),
            tcp_host: raft_addr.to_string(),
            rand: rand::random(),
        })
        .await?;
        self.meta_node_by_tcp_host(raft_addr)
            .ok_or_else(|| MetaError::Internal(anyhow::anyhow!("meta node {raft_addr} missing")))
    }

    pub async fn create_data_node(
        &self,
        http_addr: &str,
        tcp_addr: &str,
    ) -> Result<NodeInfo, MetaError> {
        self.apply_command(&Command::CreateDataNode {
            host: http_addr.to_string(),
            tcp_host: tcp_addr.to_string(),
        })
        .await?;
        let state = self.shared.state.read().expect("rwlock poisoned");
        state
            .data
            .data_nodes
            .iter()
            .find(|n| n.tcp_host == tcp_addr)
            .cloned()
            .ok_or_else(|| MetaError::Internal(anyhow::anyhow!("data node {tcp_addr} missing")))
    }

    pub async fn delete_data_node(&self, id: u64) -> Result<(), MetaError> {
        self.apply_command(&Command::DeleteDataNode { id }).await
    }

    pub async fn create_database(&self, name: &str) -> Result<(), MetaError> {
        self.apply_command(&Command::CreateDatabase {
            name: name.to_string(),
        })
        .await
    }

    pub async fn drop_database(&self, name: &str) -> Result<(), MetaError> {
        self.apply_command(&Command::DropDatabase {
            name: name.to_string(),
        })
        .await
    }

    pub async fn create_retention_policy(
        &self,
        database: &str,
        policy: RetentionPolicyInfo,
    ) -> Result<(), MetaError> {
        self.apply_command(&Command::CreateRetentionPolicy {
            database: database.to_string(),
            policy,
        })
        .await
    }

    pub async fn update_retention_policy(
        &self,
        database: &str,
        name: &str,
        update: RetentionPolicyUpdate,
    ) -> Result<(), MetaError> {
        self.apply_command(&Command::UpdateRetentionPolicy {
            database: database.to_string(),
            name: name.to_string(),
            update,
        })
        .await
    }

    pub async fn drop_retention_policy(&self, database: &str, name: &str) -> Result<(), MetaError> {
        self.apply_command(&Command::DropRetentionPolicy {
            database: database.to_string(),
            name: name.to_string(),
        })
        .await
    }

    pub async fn set_default_retention_policy(
        &self,
        database: &str,
        name: &str,
    ) -> Result<(), MetaError> {
        self.apply_command(&Command::SetDefaultRetentionPolicy {
            database: database.to_string(),
            name: name.to_string(),
        })
        .await
    }

    /// Create a user; the password is bcrypt-hashed before replication.
    pub async fn create_user(
        &self,
        name: &str,
        password: &str,
        admin: bool,
    ) -> Result<(), MetaError> {
        let hash = auth::hash_password(password, self.config.bcrypt_cost)?;
        self.apply_command(&Command::CreateUser {
            name: name.to_string(),
            hash,
            admin,
        })
        .await
    }

    pub async fn update_user(&self, name: &str, password: &str) -> Result<(), MetaError> {
        let hash = auth::hash_password(password, self.config.bcrypt_cost)?;
        self.apply_command(&Command::UpdateUser {
            name: name.to_string(),
            hash,
        })
        .await
    }

    pub async fn drop_user(&self, name: &str) -> Result<(), MetaError> {
        self.apply_command(&Command::DropUser {
            name: name.to_string(),
        })
        .await
    }

    pub async fn set_privilege(
        &self,
        username: &str,
        database: &str,
        privilege: Privilege,
    ) -> Result<(), MetaError> {
        self.apply_command(&Command::SetPrivilege {
            username: username.to_string(),
            database: database.to_string(),
            privilege,
        })
        .await
    }

    pub async fn set_admin_privilege(&self, username: &str, admin: bool) -> Result<(), MetaError> {
        self.apply_command(&Command::SetAdminPrivilege {
            username: username.to_string(),
            admin,
        })
        .await
    }

    // ── Join ────────────────────────────────────────────────────────

    /// Register this node with an existing cluster and return the consensus
    /// addresses of its members.
    ///
    /// Both steps are retried with bounded exponential backoff until they
    /// succeed or the store is closed.
    pub async fn join_cluster(
        &self,
        http_addr: &str,
        raft_addr: &str,
        seeds: &[String],
    ) -> Result<Vec<String>, MetaError> {
        let client: Arc<dyn JoinClient> = match &self.join_client {
            Some(client) => client.clone(),
            None => Arc::new(HttpJoinClient::new(
                seeds.to_vec(),
                self.config.https_enabled,
            )?),
        };
        let mut backoff = Backoff::new(
            self.config.join_retry_initial(),
            self.config.join_retry_max(),
        );

        self.lifecycle(&format!("Joining cluster via {:?}", seeds));
        loop {
            match self
                .until_closing(client.register_node(http_addr, raft_addr))
                .await?
            {
                Ok(()) => break,
                Err(e) => {
                    warn!("join: register {} failed: {}", raft_addr, e);
                    self.until_closing(tokio::time::sleep(backoff.next_delay()))
                        .await?;
                }
            }
        }

        backoff.reset();
        let data = loop {
            match self.until_closing(client.fetch_snapshot()).await? {
                Ok(data) if !data.meta_nodes.is_empty() => break data,
                Ok(_) => warn!("join: snapshot has no meta nodes yet"),
                Err(e) => warn!("join: fetching snapshot failed: {}", e),
            }
            self.until_closing(tokio::time::sleep(backoff.next_delay()))
                .await?;
        };

        let peers: Vec<String> = data.meta_nodes.iter().map(|n| n.tcp_host.clone()).collect();
        self.lifecycle(&format!("Joined cluster, peers {:?}", peers));
        Ok(peers)
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        // Break the store <-> consensus reference cycle if close was skipped.
        self.closing.send_replace(true);
        if let Ok(mut state) = self.shared.state.write() {
            state.consensus.take();
        }
    }
}

/// Address to advertise for a bound socket.  Unspecified hosts advertise
/// as loopback.
pub(crate) fn advertised_addr(addr: SocketAddr) -> String {
    if addr.ip().is_unspecified() {
        let ip: std::net::IpAddr = match addr {
            SocketAddr::V4(_) => std::net::Ipv4Addr::LOCALHOST.into(),
            SocketAddr::V6(_) => std::net::Ipv6Addr::LOCALHOST.into(),
        };
        return SocketAddr::new(ip, addr.port()).to_string();
    }
    addr.to_string()
}

//! The contract between the meta store and a consensus module.
//!
//! The store never looks inside the replication protocol.  It needs four
//! things from it: a role and leader report, a way to submit an opaque
//! command, a single commit callback invoked in commit order, and snapshot
//! hooks for log compaction and follower catch-up.  Those are the
//! [`Consensus`] and [`StateMachine`] traits below.  Async methods use
//! manual desugaring with pinned futures so the traits stay object safe.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};

use crate::errors::ConsensusError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Role of the local node in the consensus group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
    Shutdown,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
            Role::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Callbacks the consensus module drives.
///
/// `apply` is invoked exactly once per committed command, in commit order,
/// never concurrently with itself.
pub trait StateMachine: Send + Sync {
    /// Apply a committed command.  A rejection must leave state unchanged.
    fn apply(&self, command: &[u8]) -> Result<(), ConsensusError>;

    /// Serialize the full current state.
    fn snapshot(&self) -> Result<Vec<u8>, ConsensusError>;

    /// Replace the full current state with a previously captured snapshot.
    fn restore(&self, snapshot: &[u8]) -> Result<(), ConsensusError>;
}

/// A running consensus module.
pub trait Consensus: Send + Sync {
    fn role(&self) -> Role;

    /// Consensus address of the current leader, if one is known.
    fn leader(&self) -> Option<String>;

    /// Replicate `command` and resolve once it has been committed and
    /// applied locally.
    fn propose(&self, command: Vec<u8>) -> BoxFuture<'_, Result<(), ConsensusError>>;

    /// Stop participating.  Calling it more than once is harmless.
    fn shutdown(&self) -> BoxFuture<'_, Result<(), ConsensusError>>;
}

/// Everything a consensus module needs to start.
pub struct ConsensusOptions {
    /// Directory for the log and snapshots.
    pub dir: PathBuf,
    /// The address this node advertises to peers.
    pub addr: String,
    /// Initial membership.  Empty means a brand new single node cluster.
    pub peers: Vec<String>,
    pub state_machine: Arc<dyn StateMachine>,
}

/// Factory for consensus modules.
///
/// `open` is synchronous: the store calls it inside its exclusive open
/// section.  Implementations must not call back into the state machine
/// before `open` returns; loading the log happens in the background and
/// the node reports no leader until it is done.
pub trait ConsensusOpener: Send + Sync {
    fn open(&self, opts: ConsensusOptions) -> Result<Arc<dyn Consensus>, ConsensusError>;
}

/// Rendezvous for the consensus listener address.
///
/// The transport binds a socket and publishes its address here; the store
/// waits for it before advertising itself to peers.
#[derive(Debug, Default)]
pub struct RaftListener {
    addr: OnceLock<SocketAddr>,
}

impl RaftListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the bound address.  Returns `false` if one was already set.
    pub fn set_addr(&self, addr: SocketAddr) -> bool {
        self.addr.set(addr).is_ok()
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr.get().copied()
    }
}

//! Process wiring for a meta node.
//!
//! [`Service`] binds the consensus and HTTP sockets, opens the [`Store`],
//! serves the HTTP API and records the node's identity in `node.json`.
//! When no join peers are configured, the meta servers remembered in
//! `node.json` are used instead.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cluster::consensus::RaftListener;
use crate::config::Config;
use crate::errors::MetaError;
use crate::metadata::store::{advertised_addr, Store};
use crate::node::Node;
use crate::server;
use crate::AppState;

pub struct Service {
    config: Config,
    store: Arc<Store>,
    raft_listener: Option<Arc<RaftListener>>,
    raft_socket: Option<TcpListener>,
    http_socket: Option<TcpListener>,
    http_addr: Option<SocketAddr>,
    join_peers: Vec<String>,
    shutdown: watch::Sender<bool>,
    server: Option<JoinHandle<std::io::Result<()>>>,
}

impl Service {
    pub fn new(config: Config) -> Self {
        let store = Arc::new(Store::new(config.meta.clone()));
        Self::with_store(config, store)
    }

    pub fn with_store(config: Config, store: Arc<Store>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            store,
            raft_listener: None,
            raft_socket: None,
            http_socket: None,
            http_addr: None,
            join_peers: Vec::new(),
            shutdown,
            server: None,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Bound HTTP address, once [`bind`](Self::bind) has run.
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    /// Bound consensus address, once [`bind`](Self::bind) has run.
    pub fn raft_addr(&self) -> Option<SocketAddr> {
        self.raft_listener.as_ref().and_then(|ln| ln.addr())
    }

    /// Bind the consensus and HTTP sockets from the configuration.
    pub async fn bind(&mut self) -> Result<(), MetaError> {
        let raft_socket = TcpListener::bind(&self.config.meta.bind_address)
            .await
            .map_err(|e| {
                MetaError::Internal(anyhow::anyhow!(
                    "binding {}: {}",
                    self.config.meta.bind_address,
                    e
                ))
            })?;
        let http_socket = TcpListener::bind(&self.config.meta.http_bind_address)
            .await
            .map_err(|e| {
                MetaError::Internal(anyhow::anyhow!(
                    "binding {}: {}",
                    self.config.meta.http_bind_address,
                    e
                ))
            })?;

        let listener = Arc::new(RaftListener::new());
        listener.set_addr(raft_socket.local_addr().map_err(anyhow::Error::from)?);
        let http_addr = http_socket.local_addr().map_err(anyhow::Error::from)?;

        let node = Node::load(Path::new(&self.config.meta.dir))?;
        self.join_peers = join_seeds(
            &self.config.meta.join_peers,
            &node.meta_servers,
            &advertised_addr(http_addr),
        );
        if self.config.meta.join_peers.is_empty() && !self.join_peers.is_empty() {
            info!("Rejoining meta servers from node.json: {:?}", self.join_peers);
        }

        self.http_addr = Some(http_addr);
        self.raft_listener = Some(listener);
        self.raft_socket = Some(raft_socket);
        self.http_socket = Some(http_socket);
        Ok(())
    }

    /// Open the store and start serving HTTP.
    ///
    /// [`bind`](Self::bind) must have run first.
    pub async fn open(&mut self) -> Result<(), MetaError> {
        if self.server.is_some() {
            return Err(MetaError::AlreadyOpen);
        }
        let listener = self.raft_listener.clone().ok_or(MetaError::NoRaftListener)?;
        let http_socket = self.http_socket.take().ok_or(MetaError::NoRaftListener)?;
        let http_addr = self
            .http_addr
            .map(advertised_addr)
            .ok_or(MetaError::NoRaftListener)?;

        if let Err(e) = self
            .store
            .open_with_seeds(&http_addr, &listener, &self.join_peers)
            .await
        {
            self.http_socket = Some(http_socket);
            return Err(e);
        }

        let state = Arc::new(AppState {
            config: self.config.clone(),
            store: self.store.clone(),
        });
        let mut shutdown = self.shutdown.subscribe();
        let app = server::app(state);
        self.server = Some(tokio::spawn(async move {
            axum::serve(http_socket, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.wait_for(|closing| *closing).await;
                })
                .await
        }));
        info!("Meta HTTP API listening on {}", http_addr);

        self.persist_identity()?;
        Ok(())
    }

    /// Record this node's id and the known meta servers in `node.json`.
    fn persist_identity(&self) -> Result<(), MetaError> {
        let dir = Path::new(&self.config.meta.dir);
        let mut node = Node::load(dir)?;
        let data = self.store.snapshot();
        if let Some(raft_addr) = self.raft_addr().map(advertised_addr) {
            if let Some(me) = data.meta_node_by_tcp_host(&raft_addr) {
                node.id = me.id;
            }
        }
        node.meta_servers = data.meta_nodes.iter().map(|n| n.host.clone()).collect();
        let path = node.save(dir)?;
        info!("Node id {} saved to {}", node.id, path.display());
        Ok(())
    }

    /// Stop the HTTP server and close the store.  Safe to call repeatedly.
    pub async fn close(&mut self) -> Result<(), MetaError> {
        self.shutdown.send_replace(true);
        if let Some(server) = self.server.take() {
            match server.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("HTTP server exited with error: {}", e),
                Err(e) => warn!("HTTP server task failed: {}", e),
            }
        }
        self.raft_socket.take();
        self.http_socket.take();
        self.store.close().await
    }
}

/// Seeds for the join handshake.  Configured peers win; otherwise the meta
/// servers saved by a previous run, minus this node's own HTTP address.
fn join_seeds(configured: &[String], saved: &[String], own_http_addr: &str) -> Vec<String> {
    if !configured.is_empty() {
        return configured.to_vec();
    }
    saved
        .iter()
        .filter(|addr| addr.as_str() != own_http_addr)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetaConfig;
    use crate::errors::ConsensusError;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_config(tmp: &TempDir) -> Config {
        Config {
            meta: MetaConfig {
                dir: tmp.path().join("meta").to_str().unwrap().to_string(),
                bind_address: "127.0.0.1:0".to_string(),
                http_bind_address: "127.0.0.1:0".to_string(),
                logging_enabled: false,
                election_timeout_ms: 10,
                join_retry_initial_ms: 5,
                join_retry_max_ms: 20,
                ..MetaConfig::default()
            },
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_open_without_bind_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut service = Service::new(test_config(&tmp));
        assert!(matches!(
            service.open().await,
            Err(MetaError::NoRaftListener)
        ));
    }

    #[tokio::test]
    async fn test_open_serves_and_persists_identity() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let mut service = Service::new(config.clone());
        service.bind().await.unwrap();
        service.open().await.unwrap();

        let http_addr = service.http_addr().unwrap();
        let raft_addr = service.raft_addr().unwrap();
        let body = reqwest::get(format!("http://{http_addr}/ping"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, raft_addr.to_string());

        let node = Node::load(Path::new(&config.meta.dir)).unwrap();
        assert_eq!(node.id, 1);
        assert_eq!(node.meta_servers, vec![http_addr.to_string()]);

        service.close().await.unwrap();
        service.close().await.unwrap();
        assert!(reqwest::get(format!("http://{http_addr}/ping")).await.is_err());
    }

    #[tokio::test]
    async fn test_second_open_is_already_open() {
        let tmp = TempDir::new().unwrap();
        let mut service = Service::new(test_config(&tmp));
        service.bind().await.unwrap();
        service.open().await.unwrap();
        assert!(matches!(service.open().await, Err(MetaError::AlreadyOpen)));
        service.close().await.unwrap();
    }

    #[test]
    fn test_join_seeds_prefers_configured_peers() {
        let configured = vec!["a:8091".to_string()];
        let saved = vec!["b:8091".to_string(), "me:8091".to_string()];
        assert_eq!(join_seeds(&configured, &saved, "me:8091"), configured);
        assert_eq!(
            join_seeds(&[], &saved, "me:8091"),
            vec!["b:8091".to_string()]
        );
        assert!(join_seeds(&[], &["me:8091".to_string()], "me:8091").is_empty());
        assert!(join_seeds(&[], &[], "me:8091").is_empty());
    }

    #[tokio::test]
    async fn test_restart_with_own_identity_reopens_locally() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(&tmp);
        let mut service = Service::new(config.clone());
        service.bind().await.unwrap();
        service.open().await.unwrap();
        service.store().create_database("db0").await.unwrap();
        let index = service.store().index();
        let http_addr = service.http_addr().unwrap();
        let raft_addr = service.raft_addr().unwrap();
        service.close().await.unwrap();

        // Same addresses, no configured peers: node.json only lists this node.
        config.meta.http_bind_address = http_addr.to_string();
        config.meta.bind_address = raft_addr.to_string();
        let mut service = Service::new(config.clone());
        service.bind().await.unwrap();
        assert!(service.join_peers.is_empty());
        tokio::time::timeout(Duration::from_secs(10), service.open())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(service.store().index(), index);
        assert!(service.store().database("db0").is_some());
        assert_eq!(service.store().meta_nodes().len(), 1);
        let node = Node::load(Path::new(&config.meta.dir)).unwrap();
        assert_eq!(node.id, 1);
        service.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_rejoins_saved_meta_servers() {
        let leader_tmp = TempDir::new().unwrap();
        let mut leader = Service::new(test_config(&leader_tmp));
        leader.bind().await.unwrap();
        leader.open().await.unwrap();
        let leader_http = leader.http_addr().unwrap().to_string();

        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        Node {
            id: 2,
            meta_servers: vec![leader_http.clone()],
        }
        .save(Path::new(&config.meta.dir))
        .unwrap();

        let mut service = Service::new(config);
        service.bind().await.unwrap();
        assert_eq!(service.join_peers, vec![leader_http]);
        let raft_addr = service.raft_addr().map(advertised_addr).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(10), service.open())
            .await
            .unwrap();
        // Registration reached the leader; the bundled consensus module then
        // refuses to replicate with it.
        assert!(matches!(
            result,
            Err(MetaError::ConsensusOpen(ConsensusError::Unsupported(_)))
        ));
        assert!(leader.store().meta_node_by_tcp_host(&raft_addr).is_some());

        service.close().await.unwrap();
        leader.close().await.unwrap();
    }
}

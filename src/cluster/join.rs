//! Client side of the cluster join handshake.
//!
//! A new meta node registers its HTTP and consensus addresses with an
//! existing cluster and then fetches the membership snapshot, whose
//! consensus addresses become its initial peer list.  The store drives the
//! retries; the client only performs single attempts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use reqwest::StatusCode;
use tracing::debug;

use super::consensus::BoxFuture;
use crate::errors::JoinError;
use crate::metadata::command::Command;
use crate::metadata::data::Data;

/// Header naming the leader's HTTP address on a not-leader rejection.
pub const LEADER_HEADER: &str = "x-meta-leader";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// One attempt at each step of the join handshake.
pub trait JoinClient: Send + Sync {
    /// Register a meta node.  A node that is already registered counts as
    /// success.
    fn register_node<'a>(
        &'a self,
        http_addr: &'a str,
        raft_addr: &'a str,
    ) -> BoxFuture<'a, Result<(), JoinError>>;

    /// Fetch the cluster's current metadata.
    fn fetch_snapshot(&self) -> BoxFuture<'_, Result<Data, JoinError>>;
}

/// Shortest delay a [`Backoff`] hands out.
pub const MIN_BACKOFF: Duration = Duration::from_millis(1);

/// Exponential backoff with a ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    /// Delays never drop below [`MIN_BACKOFF`], and the ceiling is never
    /// below the first delay.
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(MIN_BACKOFF);
        Self {
            initial,
            max: max.max(initial),
            current: initial,
        }
    }

    /// Delay before the next attempt; doubles up to the ceiling.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// [`JoinClient`] speaking to the meta HTTP API.
///
/// Requests go to one seed at a time; any failure moves on to the next seed
/// so unreachable servers are skipped on the following attempt.
pub struct HttpJoinClient {
    servers: Vec<String>,
    scheme: &'static str,
    client: reqwest::Client,
    next: AtomicUsize,
}

impl HttpJoinClient {
    pub fn new(servers: Vec<String>, https: bool) -> Result<Self, JoinError> {
        if servers.is_empty() {
            return Err(JoinError::NoServers);
        }
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(JoinError::Client)?;
        Ok(Self {
            servers,
            scheme: if https { "https" } else { "http" },
            client,
            next: AtomicUsize::new(0),
        })
    }

    fn current(&self) -> &str {
        let i = self.next.load(Ordering::Relaxed) % self.servers.len();
        &self.servers[i]
    }

    fn rotate(&self) {
        self.next.fetch_add(1, Ordering::Relaxed);
    }

    fn url(&self, server: &str, path: &str) -> String {
        format!("{}://{}{}", self.scheme, server, path)
    }

    async fn post_command(
        &self,
        server: &str,
        body: Vec<u8>,
    ) -> Result<reqwest::Response, JoinError> {
        self.client
            .post(self.url(server, "/execute"))
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|source| JoinError::Http {
                addr: server.to_string(),
                source,
            })
    }

    async fn try_register(&self, http_addr: &str, raft_addr: &str) -> Result<(), JoinError> {
        let server = self.current().to_string();
        let body = Command::CreateMetaNode {
            host: http_addr.to_string(),
            tcp_host: raft_addr.to_string(),
            rand: rand::random(),
        }
        .encode()?;

        let mut resp = self.post_command(&server, body.clone()).await?;

        // Follow a single not-leader redirect to the node it names.
        if resp.status() == StatusCode::SERVICE_UNAVAILABLE {
            let leader = resp
                .headers()
                .get(LEADER_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            if let Some(leader) = leader {
                debug!("{} is not the leader, retrying against {}", server, leader);
                resp = self.post_command(&leader, body).await?;
            }
        }

        let status = resp.status();
        if status.is_success() || status == StatusCode::CONFLICT {
            return Ok(());
        }
        Err(JoinError::Status {
            addr: server,
            status: status.as_u16(),
            body: resp.text().await.unwrap_or_default(),
        })
    }

    async fn try_fetch_snapshot(&self) -> Result<Data, JoinError> {
        let server = self.current().to_string();
        let resp = self
            .client
            .get(self.url(&server, "/snapshot"))
            .send()
            .await
            .map_err(|source| JoinError::Http {
                addr: server.clone(),
                source,
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(JoinError::Status {
                addr: server,
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        let data: Data = resp.json().await.map_err(|source| JoinError::Http {
            addr: server.clone(),
            source,
        })?;
        if data.meta_nodes.is_empty() {
            return Err(JoinError::EmptySnapshot { addr: server });
        }
        Ok(data)
    }
}

impl JoinClient for HttpJoinClient {
    fn register_node<'a>(
        &'a self,
        http_addr: &'a str,
        raft_addr: &'a str,
    ) -> BoxFuture<'a, Result<(), JoinError>> {
        Box::pin(async move {
            let result = self.try_register(http_addr, raft_addr).await;
            if result.is_err() {
                self.rotate();
            }
            result
        })
    }

    fn fetch_snapshot(&self) -> BoxFuture<'_, Result<Data, JoinError>> {
        Box::pin(async move {
            let result = self.try_fetch_snapshot().await;
            if result.is_err() {
                self.rotate();
            }
            result
        })
    }
}

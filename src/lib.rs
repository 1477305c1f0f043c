//! bleepmeta library: replicated cluster metadata store.
//!
//! This crate provides the meta store that holds cluster membership,
//! databases, retention policies and users, replicates every change through
//! a consensus module, and exposes it over a small HTTP API.

use std::sync::Arc;

pub mod auth;
pub mod cluster;
pub mod config;
pub mod errors;
pub mod metadata;
pub mod metrics;
pub mod node;
pub mod server;
pub mod service;

use crate::config::Config;
use crate::metadata::store::Store;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// The meta store backing every route.
    pub store: Arc<Store>,
}

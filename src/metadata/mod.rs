//! Cluster metadata.
//!
//! [`data::Data`] is the replicated document, [`command::Command`] the set of
//! mutations that can be replicated, and [`store::Store`] the handle that
//! ties both to a consensus module.

pub mod command;
pub mod data;
pub mod store;

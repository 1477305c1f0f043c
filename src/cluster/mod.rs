//! Cluster coordination.
//!
//! The store talks to consensus through the traits in [`consensus`].
//! [`raft`] provides the bundled single-voter implementation and [`join`]
//! the client side of the membership handshake.

pub mod consensus;
pub mod join;
pub mod raft;

//! casnap chunk server.
//!
//! Serves chunks over HTTP from a tiered cache of memory, local disk, peers
//! and the remote object store.

pub mod api;
pub mod config;

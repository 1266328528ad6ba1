//! Shared test utilities for replication, chaos and integration tests.
//!
//! This module provides:
//! - An in-process multi-node source cluster with peer clusters
//! - Fault injection (node kill, failing / hanging peers)
//! - Redis testcontainer setup for the stream sink

#![allow(dead_code)]

pub mod cluster;
pub mod containers;

pub use cluster::*;
pub use containers::*;

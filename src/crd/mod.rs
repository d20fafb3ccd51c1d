//! Custom Resource Definitions for extension lifecycle management
//!
//! This module defines the Extension resource driven by the controller and
//! the read-only Cluster resource describing the owning managed cluster.

mod cluster;
mod extension;
pub mod types;


pub use cluster::{
    Cluster, ClusterSpec, ShootLastOperation, ShootSnapshot, ShootStatus, SnapshotMetadata,
};
pub use extension::{Extension, ExtensionSpec, ExtensionStatus};
pub use types::*;

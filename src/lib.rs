//! Extension lifecycle controller
//!
//! This crate drives provider-specific Extension resources attached to
//! managed clusters toward their desired state. It decides when to reconcile,
//! which operation to run and how to delete safely; the provider logic itself
//! lives behind the [`controller::Actuator`] trait.

pub mod controller;
pub mod crd;
pub mod error;
pub mod telemetry;

#[cfg(feature = "rest-api")]
pub mod rest_api;

#[cfg(test)]
pub(crate) mod testing;

pub use crate::error::{Error, Result};

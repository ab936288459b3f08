//! Rollhouse Backend Library
//!
//! Exposes core modules for use by binaries and integration tests.

pub mod alerts;
pub mod api;
pub mod casino;
pub mod gateway;
pub mod ledger;
pub mod models;
pub mod reconcile;

//! Device Hub integration tests
//!
//! End-to-end coverage of the device lifecycle and messaging plane:
//! - Provisioning flows against the real CA and store
//! - Twin reconciliation round trips
//! - Gateway REST/WebSocket behavior, auth and method correlation
//! - Name translator cache invalidation
//! - IPC interface round trips

pub mod helpers;

pub mod twin_tests;

pub use helpers::{make_csr, HubFixture};

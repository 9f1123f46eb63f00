//! Common test infrastructure
//!
//! Tests should only import from this module, not from internal submodules.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{TestCatalog, datasource_payload};
//!
//! #[tokio::test]
//! async fn test_create_is_published() {
//!     let catalog = TestCatalog::new();
//!     let created = catalog.service.create_datasource(datasource_payload("Clientes")).unwrap();
//!     catalog.drain_until_idle().await;
//!     assert_eq!(catalog.bus.delivered_for(created.id).len(), 1);
//! }
//! ```

// Each test binary uses a different subset of the helpers
#![allow(dead_code)]

mod constants;
mod fixtures;
mod harness;

pub use constants::*;
pub use fixtures::*;
pub use harness::TestCatalog;

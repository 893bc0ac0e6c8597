//! # fleetd-core
//!
//! Core library for fleetd - an on-device agent that reconciles a declarative
//! application bundle against a local container engine and reports observed
//! state to a control plane.
//!
//! This crate provides the fundamental building blocks consumed by the agent
//! composition root: the bundle data model, the supervision hierarchy, and
//! the status reporter.
//!
//! ## Features
//!
//! - **Data Model**: Bundle, application, release, and service types with a
//!   canonical spec hash used for container equivalence checks
//! - **Supervision**: One worker per service reconciling one container toward
//!   one release, with release transitions and ordered teardown
//! - **Reporting**: Diff-based upstream publication of application, service
//!   status, and service state facts, gated on cross-service quorum
//! - **Variables**: Typed policy toggles backed by a watched configuration
//!   directory
//! - **Validators**: Stateless predicates that veto a service before it is
//!   scheduled
//!
//! The HTTP transport and the concrete container engine are injected behind
//! the [`client::ApiClient`] and [`engine::ContainerEngine`] traits.
//!
//! ## Example
//!
//! ```rust,no_run
//! use fleetd_core::models::Service;
//!
//! let service: Service = serde_json::from_str(
//!     r#"{"image": "registry.example.com/sensor:1.4"}"#,
//! )
//! .unwrap();
//! assert_eq!(service.spec_hash().len(), 64);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod client;
pub mod engine;
pub mod fs_atomic;
pub mod models;
pub mod supervisor;
pub mod validator;
pub mod variables;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::client::ApiClient;
    pub use crate::engine::ContainerEngine;
    pub use crate::models::{Application, Bundle, Release, Service};
    pub use crate::supervisor::Supervisor;
    pub use crate::validator::Validator;
    pub use crate::variables::Variables;
}

/// Re-export commonly used types at the crate root.
pub use models::{Application, Bundle, Release, Service};
pub use supervisor::Supervisor;

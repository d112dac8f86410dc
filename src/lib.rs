//! # Task Substrate
//!
//! Task-lifecycle and worker-coordination substrate for a distributed,
//! autoscaling agent execution platform. Users submit natural-language
//! mandates through the gateway; workers pick them up over a durable
//! broker and drive a bounded tick-based execution loop, surfacing status
//! back through a fast store and a durable store.
//!
//! ## Architecture
//!
//! - **Gateway**: accepts mandates, enqueues work, serves task status
//! - **Worker lifecycle**: pulls tasks off the broker, runs the injected
//!   agent engine, reports progress and terminal results
//! - **Status manager**: the shared resilient/best-effort status-publish
//!   path used by both gateway and worker
//! - **Storage**: a fast, mutable store for live status and a durable,
//!   row-scoped store for history
//!
//! The agent reasoning engine itself is out of scope here; this crate only
//! defines the seam ([`worker::agent_engine::AgentEngine`]) it is driven
//! through.

/// HTTP API server and endpoints
pub mod api;
/// Authentication seam: token validation is an external capability
pub mod auth;
/// Durable work queue
pub mod broker;
/// System configuration
pub mod config;
/// System-wide constants
pub mod constants;
/// Shared task and worker contracts
pub mod domain;
/// Error types and handling
pub mod error;
/// Gateway task service
pub mod gateway;
/// System health monitoring
pub mod monitoring;
/// IP-based request-rate limiting
pub mod rate_limit;
/// Circuit breaker and other resilience primitives
pub mod resilience;
/// Status publishing shared by gateway and worker
pub mod status_manager;
/// Fast-store and durable-store implementations
pub mod storage;
/// Input validation
pub mod validation;
/// Worker lifecycle controller
pub mod worker;

pub use error::{Result, SubstrateError};

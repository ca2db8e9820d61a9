//! Eventline - reliable cross-service event pipeline.
//!
//! One service appends domain events to a durable, partitioned append-only
//! log; another consumes them through a named consumer group. The consumer
//! must never lose an entry, must never produce a side effect twice for the
//! same logical event, and must survive its own restarts as well as sibling
//! consumer crashes without manual intervention.
//!
//! The moving parts:
//! - `publisher`: append an event to the durable log, best-effort metrics
//! - `consumer`: group bootstrap, claim-based recovery of orphaned entries,
//!   and the steady-state dispatch loop
//! - `dedup`: the idempotent apply that both paths funnel through
//! - `stream`: the durable log protocol (Redis Streams + in-memory)
//! - `context`: process identity and the correlation/request pair that
//!   threads through every hop

pub mod bootstrap;
pub mod config;
pub mod consumer;
pub mod context;
pub mod dedup;
pub mod event;
pub mod metrics;
pub mod publisher;
pub mod stream;

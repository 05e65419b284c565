#![forbid(unsafe_code)]
//! Local gateway between a browser UI and a spawned coding-agent worker.
//!
//! The worker speaks newline-delimited JSON-RPC over its standard
//! streams; the gateway exposes REST + SSE + WebSocket to the browser,
//! keeps a durable projection/event log in SQLite, and mediates the
//! interactive approval and question flows the worker initiates.
//!
//! Component map:
//! - [`turns::TurnController`]: thread/turn lifecycle, auto-resume,
//!   preset resolution, slash-token expansion.
//! - [`bus::EventBus`]: per-thread fan-out with store-backed replay.
//! - [`approvals::ApprovalCoordinator`] and
//!   [`interactions::InteractionCoordinator`]: pending-request state
//!   machines over the store and the live rpc-id maps.
//! - [`dispatch::WorkerDispatcher`]: the single consumer of inbound
//!   worker messages.
//! - [`terminal::TerminalMux`]: one PTY per thread shared by many
//!   WebSocket clients.
//! - [`http`]: the axum surface.

pub mod approvals;
pub mod bus;
pub mod classify;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod interactions;
pub mod state;
pub mod store;
pub mod terminal;
pub mod turns;

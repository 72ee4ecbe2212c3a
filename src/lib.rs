//! Courier - durable outbound notification delivery
//!
//! Turns enqueued domain notifications into reliably delivered messages:
//! at-least-once delivery through an atomically claimed durable queue,
//! bounded exponential retry, provider rate pacing, and stale-claim
//! recovery.

#![allow(missing_docs)]

pub mod boot;
pub mod cli;
pub mod commands;
pub mod config;
pub mod database;
pub mod delivery;
pub mod environment;
pub mod mailer;
pub mod setup_tracing;

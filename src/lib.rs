//! pricewatch: market-data acquisition pipeline and alert evaluation
//! engine.
//!
//! The two load-bearing subsystems are the candle orchestration path
//! (cache → store → gap-detect → provider → persist) and the alert engine
//! (trigger-mode and cooldown gating over a closed condition vocabulary).
//! HTTP routing, auth, and notification delivery live outside this crate;
//! the engine's responsibility ends at durable trigger persistence.

pub mod cli;
pub mod config;
pub mod constants;
pub mod error;
pub mod models;
pub mod services;
pub mod worker;

pub use error::{AppError, Result};

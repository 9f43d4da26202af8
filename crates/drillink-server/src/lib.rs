//! # drillink-server
//!
//! HTTP server library for drillink.
//!
//! This library provides the WebSocket device hub, the API handlers and the
//! shared state behind them.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod api;
pub mod hub;
pub mod logging;
pub mod state;

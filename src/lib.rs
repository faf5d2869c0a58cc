//! Room session coordinator for two-person pairing sessions: a websocket
//! chat gateway, a serial admission queue over a fixed pool of meeting
//! hosts, and lifecycle timers that reclaim meetings nobody is using.
//!
//! The binary wires everything together; embedders implement [`agent::Agent`]
//! and [`storage::Storage`] to plug in a mentoring bot and a real database.

pub mod agent;
pub mod api;
pub mod chat;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod meeting;
pub mod queue;
pub mod storage;

//! Abuseguard - Adaptive Rate Limiting and Abuse Detection
//!
//! This crate implements an HTTP gate that enforces per-endpoint and per-tier
//! request quotas, records violations in a ledger, and escalates repeat
//! offenders through warnings and temporary bans. Counters and records live
//! in Redis when configured, with an in-process fallback when it is not.

pub mod abuse;
pub mod config;
pub mod error;
pub mod gate;
pub mod identity;
pub mod ratelimit;
pub mod remote;
pub mod request;

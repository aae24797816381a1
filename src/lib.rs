//! Costwindow - Sliding-Window Cost Rate Limiting Service
//!
//! This crate implements admission control for cost-weighted API traffic.
//! Each consumer (the whole site, or a single API client) has a limit on the
//! total cost it may spend per window. Window state lives in a shared store so
//! that any number of stateless service instances enforce the same limits.

pub mod config;
pub mod error;
pub mod grpc;
pub mod ratelimit;
pub mod store;

//! Ratewarden - per-client request quota guard
//!
//! This crate implements fixed-window rate limiting for an axum REST API.
//! Requests are attributed to a client, matched against ordered rules and
//! counted in pluggable storage (in-process or Redis). Outcomes are recorded
//! for the admin API. Storage trouble never blocks a request.

pub mod app;
pub mod config;
pub mod error;
pub mod http;
pub mod monitoring;
pub mod ratelimit;

//! Goule - A process supervisor for long-running services
//!
//! This library keeps a set of named services alive for a reverse-proxy or
//! admin server:
//! - Runs each service's program under a dedicated supervisor loop
//! - Relaunches exited programs after a configurable interval
//! - Stops process groups with SIGTERM, escalating to SIGKILL
//! - Keeps a bounded backlog of each program's output and lifecycle notes
//! - Exposes the registry over a small authenticated admin API

pub mod admin;
pub mod backlog;
pub mod config;
pub mod control;
pub mod error;
pub mod registry;
pub mod supervisor;
pub mod terminate;

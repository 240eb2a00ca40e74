//! devhost - local development orchestrator
//!
//! This library provides the pieces behind the `devhost` binary:
//! - A forward proxy for a development TLD that routes hostnames to project
//!   web servers and intercepts TLS with locally issued certificates
//! - A file-based store of process records shared between invocations
//! - A supervisor that runs commands once or restarts them on failure and
//!   on file changes
//! - A daemonizer that re-executes the binary in the background and waits
//!   for it to report it is up
//! - A domain registry mapping hostnames to project directories

pub mod certs;
pub mod config;
pub mod daemon;
pub mod domains;
pub mod error;
pub mod pages;
pub mod pool;
pub mod process;
pub mod projects;
pub mod proxy;
pub mod record;
pub mod supervisor;
pub mod watcher;

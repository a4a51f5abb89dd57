//! Interop broker — resolves intents and routes contexts across
//! application platforms.
//!
//! [`engine::Engine`] is the embeddable core: it fans resolution out to
//! registered [`platform::PlatformAdapter`]s, merges their candidates,
//! and dispatches raises and broadcasts. [`broker`] exposes an engine to
//! local applications over a Unix socket; [`client`] is the one-shot CLI
//! side of that socket.

pub mod broker;
pub mod cli;
pub mod client;
pub mod directory;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod listeners;
pub mod model;
pub mod platform;

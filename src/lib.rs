#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

/// The requests clients can send, and the responses they get back.
pub mod actions;

/// Code relating to setting up the server which accepts connections and spawns handlers for clients.
pub mod server;

/// Clients.
pub mod client;

/// The command line interface.
pub mod cli;

/// The service facade between the wire and the port machinery.
pub mod facade;

/// Handles incoming websockets.
pub(crate) mod websocket;

/// In-memory loopback port driver, for running without hardware.
pub mod mock;

/// Serial port machinery: settings, drivers, discovery, sessions, streaming.
pub mod serial;

/// Relates to config files.
pub mod config;

/// Possible errors in this library.
pub mod error;

/// Logging/tracing setup.
pub mod logging;

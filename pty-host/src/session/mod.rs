// Pty host session subsystem
// Shared between the daemon binary, the client and tests

pub mod bufferer;
pub mod command_detection;
pub mod config;
pub mod environment;
pub mod error;
pub mod layout;
pub mod paths;
pub mod persistence;
pub mod persistent;
pub mod protocol;
pub mod request_store;
pub mod rpc;
pub mod runtime;
pub mod scheduler;
pub mod serializer;
pub mod service;
pub mod shell_integration;
pub mod system;

// Socket client (Unix only for now)
#[cfg(unix)]
pub mod client;

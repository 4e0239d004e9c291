//! Control channel used by `tierctl` to load and unload files of a running mount.

pub mod client;
pub mod message;
pub mod server;

pub use client::Client;
pub use message::{Request, Response, Status};

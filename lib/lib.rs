pub mod api;
pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod fs;
pub mod lock;
pub mod logger;
pub mod utils;

pub use error::{Error, Result};

pub mod config;
pub mod db;
pub mod errors;
pub mod logging;
pub mod models;
pub mod services;
pub mod state;
pub mod utils;

pub use errors::{BridgeError, ProtocolError, Result};
pub use state::BridgeState;

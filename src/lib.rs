pub mod auth;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod fc;
pub mod observability;
pub mod protocol;
pub mod routing;
pub mod state;
pub mod stream;
pub mod transport;

pub(crate) mod json_scan;
mod util;

pub use engine::Relay;

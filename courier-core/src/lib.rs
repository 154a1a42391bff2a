pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod schema;
pub mod store;
pub mod types;

pub use config::Config;
pub use context::CourierContext;
pub use error::{CourierError, Result};
pub use types::*;

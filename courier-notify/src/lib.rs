pub mod audience;
pub mod matrix;
pub mod preferences;
pub mod render;
pub mod service;

pub use service::{NotificationProducer, TriggerOutcome};

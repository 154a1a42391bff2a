pub mod poller;
pub mod processor;

pub use poller::QueuePoller;
pub use processor::{ProcessOutcome, QueueProcessor, RetryPolicy};

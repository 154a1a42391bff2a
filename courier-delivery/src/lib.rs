pub mod apns;
pub mod email;
pub mod fcm;
pub mod inapp;
pub mod push;
pub mod sender;
pub mod sms;

#[cfg(test)]
mod testing;

pub use sender::{ChannelSender, SendOutcome, SenderRegistry};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::config::DeliveryConfig;
use courier_core::store::{DeviceTokenRepository, InAppRepository, UserDirectory};
use courier_core::{Channel, QueuedNotification};

use crate::apns::ApnsDelivery;
use crate::email::{EmailDelivery, EmailSender};
use crate::fcm::FcmDelivery;
use crate::inapp::InAppSender;
use crate::push::PushSender;
use crate::sms::{SmsDelivery, SmsSender};

/// Result of one delivery attempt. Transport errors end up here as a failed
/// outcome; they never abort the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    pub success: bool,
    pub external_id: Option<String>,
    pub message: Option<String>,
}

impl SendOutcome {
    pub fn delivered(external_id: Option<String>) -> Self {
        Self {
            success: true,
            external_id,
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            external_id: None,
            message: Some(message.into()),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[async_trait]
pub trait ChannelSender: Send + Sync {
    fn channel(&self) -> Channel;

    async fn send(&self, notification: &QueuedNotification) -> SendOutcome;
}

/// Channel -> sender lookup used by the queue consumer.
#[derive(Clone, Default)]
pub struct SenderRegistry {
    senders: HashMap<Channel, Arc<dyn ChannelSender>>,
}

impl SenderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `sender` under its own channel, replacing any previous one.
    pub fn register(&mut self, sender: Arc<dyn ChannelSender>) -> &mut Self {
        self.senders.insert(sender.channel(), sender);
        self
    }

    pub fn get(&self, channel: Channel) -> Option<&Arc<dyn ChannelSender>> {
        self.senders.get(&channel)
    }

    pub fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self.senders.keys().copied().collect();
        channels.sort();
        channels
    }

    /// Registers a sender for every channel. Transports missing from `config`
    /// are still registered and fail each send as "not configured".
    pub fn from_config<S>(config: &DeliveryConfig, store: Arc<S>) -> anyhow::Result<Self>
    where
        S: DeviceTokenRepository + InAppRepository + UserDirectory + 'static,
    {
        let apns = Arc::new(ApnsDelivery::new(config)?);
        let fcm = Arc::new(FcmDelivery::new(config)?);
        let email = EmailDelivery::new(config)?;
        let sms = SmsDelivery::new(config)?;

        let mut registry = Self::new();
        registry
            .register(Arc::new(PushSender::new(store.clone(), apns, fcm)))
            .register(Arc::new(InAppSender::new(store.clone())))
            .register(Arc::new(EmailSender::new(store.clone(), email)))
            .register(Arc::new(SmsSender::new(store, sms)));

        tracing::info!("Registered senders for channels: {:?}", registry.channels());
        Ok(registry)
    }
}

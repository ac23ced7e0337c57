//! Channel senders. Each renders the channel's message and hands it to a
//! provider; the bundled providers only simulate delivery.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::models::{Channel, Notification};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub message_id: String,
}

#[async_trait]
pub trait ChannelSender: Send + Sync {
    fn channel(&self) -> Channel;

    async fn send(&self, notification: &Notification) -> Result<Receipt>;
}

/// Stand-in for an external provider: fixed latency and a random failure
/// rate in `[0, 1]`.
#[derive(Debug, Clone, Copy)]
pub struct SimulatedProvider {
    pub latency: Duration,
    pub failure_rate: f64,
}

impl SimulatedProvider {
    pub fn new(latency: Duration, failure_rate: f64) -> Self {
        Self {
            latency,
            failure_rate: failure_rate.clamp(0.0, 1.0),
        }
    }

    async fn deliver(&self, channel: Channel, unavailable: &str) -> Result<Receipt> {
        tokio::time::sleep(self.latency).await;

        if rand::random::<f64>() < self.failure_rate {
            return Err(anyhow!("{unavailable}"));
        }

        Ok(Receipt {
            message_id: format!("{channel}-{}", Uuid::new_v4()),
        })
    }
}

fn require_user(notification: &Notification) -> Result<i32> {
    match notification.user_id {
        Some(user_id) => Ok(user_id),
        None => bail!("order {} has no user to notify", notification.order_id),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

pub struct EmailSender {
    provider: SimulatedProvider,
}

impl EmailSender {
    pub const LATENCY: Duration = Duration::from_millis(100);

    pub fn new(provider: SimulatedProvider) -> Self {
        Self { provider }
    }

    pub fn render(notification: &Notification) -> Result<EmailMessage> {
        let user_id = require_user(notification)?;
        Ok(EmailMessage {
            to: format!("user{user_id}@example.com"),
            subject: format!("Order {} - Status Update", notification.order_id),
            body: format!(
                "Your order #{} status has been updated to: {}",
                notification.order_id, notification.status
            ),
        })
    }
}

#[async_trait]
impl ChannelSender for EmailSender {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(&self, notification: &Notification) -> Result<Receipt> {
        let email = Self::render(notification)?;
        info!(to = %email.to, subject = %email.subject, "Sending email");
        self.provider
            .deliver(Channel::Email, "Email service temporarily unavailable")
            .await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmsMessage {
    pub to: String,
    pub text: String,
}

pub struct SmsSender {
    provider: SimulatedProvider,
}

impl SmsSender {
    pub const LATENCY: Duration = Duration::from_millis(150);

    pub fn new(provider: SimulatedProvider) -> Self {
        Self { provider }
    }

    pub fn render(notification: &Notification) -> Result<SmsMessage> {
        let user_id = require_user(notification)?;
        Ok(SmsMessage {
            to: format!("+1234567890{user_id}"),
            text: format!(
                "Order #{} status: {}",
                notification.order_id, notification.status
            ),
        })
    }
}

#[async_trait]
impl ChannelSender for SmsSender {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    async fn send(&self, notification: &Notification) -> Result<Receipt> {
        let sms = Self::render(notification)?;
        info!(to = %sms.to, "Sending SMS");
        self.provider
            .deliver(Channel::Sms, "SMS service temporarily unavailable")
            .await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushMessage {
    pub user_id: i32,
    pub title: String,
    pub body: String,
}

pub struct PushSender {
    provider: SimulatedProvider,
}

impl PushSender {
    pub const LATENCY: Duration = Duration::from_millis(80);

    pub fn new(provider: SimulatedProvider) -> Self {
        Self { provider }
    }

    pub fn render(notification: &Notification) -> Result<PushMessage> {
        Ok(PushMessage {
            user_id: require_user(notification)?,
            title: format!("Order {} Update", notification.order_id),
            body: format!(
                "Your order status has been updated to: {}",
                notification.status
            ),
        })
    }
}

#[async_trait]
impl ChannelSender for PushSender {
    fn channel(&self) -> Channel {
        Channel::Push
    }

    async fn send(&self, notification: &Notification) -> Result<Receipt> {
        let push = Self::render(notification)?;
        info!(user_id = push.user_id, title = %push.title, "Sending push notification");
        self.provider
            .deliver(Channel::Push, "Push service temporarily unavailable")
            .await
    }
}

/// The simulated sender for `channel`, with that channel's usual latency.
pub fn simulated(channel: Channel, failure_rate: f64) -> Arc<dyn ChannelSender> {
    match channel {
        Channel::Email => Arc::new(EmailSender::new(SimulatedProvider::new(
            EmailSender::LATENCY,
            failure_rate,
        ))),
        Channel::Sms => Arc::new(SmsSender::new(SimulatedProvider::new(
            SmsSender::LATENCY,
            failure_rate,
        ))),
        Channel::Push => Arc::new(PushSender::new(SimulatedProvider::new(
            PushSender::LATENCY,
            failure_rate,
        ))),
    }
}

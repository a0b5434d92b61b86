//! Notification handling for monitored devices
//! This module subscribes to a data characteristic and forwards every
//! notification to the owning connection task.

use std::sync::Arc;

use futures_util::StreamExt;
use log::{debug, error, info};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::transport::Peripheral;

/// What the forwarding task reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationEvent {
    Value { characteristic: Uuid, value: Vec<u8> },
    /// The subscription failed or the stream ended; the link is gone.
    Ended,
}

/// Owns the task forwarding one characteristic's notifications
#[derive(Debug, Default)]
pub struct NotificationHandler {
    token: Option<CancellationToken>,
}

impl NotificationHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.token.as_ref().is_some_and(|t| !t.is_cancelled())
    }

    /// Set up notifications, replacing any previous subscription.
    pub fn start<F>(&mut self, peripheral: Arc<dyn Peripheral>, service: Uuid, characteristic: Uuid, on_event: F)
    where
        F: Fn(NotificationEvent) + Send + 'static,
    {
        self.stop();
        let token = CancellationToken::new();
        self.token = Some(token.clone());

        tokio::spawn(async move {
            Self::process_notifications(peripheral, service, characteristic, token, on_event).await;
        });
    }

    /// Stops forwarding. No `Ended` event is reported for a stopped stream.
    pub fn stop(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
    }

    async fn process_notifications<F>(
        peripheral: Arc<dyn Peripheral>,
        service: Uuid,
        characteristic: Uuid,
        token: CancellationToken,
        on_event: F,
    ) where
        F: Fn(NotificationEvent),
    {
        info!("Subscribing to notifications on {}", characteristic);
        let subscribed = tokio::select! {
            _ = token.cancelled() => return,
            result = peripheral.notifications(service, characteristic) => result,
        };
        let mut stream = match subscribed {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to subscribe to notifications: {}", e);
                on_event(NotificationEvent::Ended);
                return;
            }
        };

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Notification forwarding for {} stopped", characteristic);
                    return;
                }
                next = stream.next() => match next {
                    Some(value) => on_event(NotificationEvent::Value { characteristic, value }),
                    None => break,
                },
            }
        }

        info!("Notification stream ended");
        on_event(NotificationEvent::Ended);
    }
}

impl Drop for NotificationHandler {
    fn drop(&mut self) {
        self.stop();
    }
}

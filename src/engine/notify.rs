use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::NotifyError;
use crate::models::round::OfferPayload;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RevokeReason {
    Taken,
    Expired,
    Cancelled,
}

impl RevokeReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RevokeReason::Taken => "taken",
            RevokeReason::Expired => "expired",
            RevokeReason::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchEvent {
    Offer {
        driver_id: Uuid,
        offer: OfferPayload,
    },
    OfferRevoked {
        driver_id: Uuid,
        request_id: Uuid,
        round: u32,
        reason: RevokeReason,
    },
    RequestAccepted {
        requester_id: Uuid,
        request_id: Uuid,
        driver_id: Uuid,
    },
    NoDriversAvailable {
        requester_id: Uuid,
        request_id: Uuid,
    },
}

impl DispatchEvent {
    pub fn driver_id(&self) -> Option<Uuid> {
        match self {
            DispatchEvent::Offer { driver_id, .. } | DispatchEvent::OfferRevoked { driver_id, .. } => {
                Some(*driver_id)
            }
            _ => None,
        }
    }

    pub fn requester_id(&self) -> Option<Uuid> {
        match self {
            DispatchEvent::RequestAccepted { requester_id, .. }
            | DispatchEvent::NoDriversAvailable { requester_id, .. } => Some(*requester_id),
            _ => None,
        }
    }
}

/// Delivery of offers and outcomes to devices. The engine only calls it; transport lives elsewhere.
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn deliver_offer(&self, driver_id: Uuid, offer: &OfferPayload) -> Result<(), NotifyError>;

    async fn revoke_offer(
        &self,
        driver_id: Uuid,
        request_id: Uuid,
        round: u32,
        reason: RevokeReason,
    ) -> Result<(), NotifyError>;

    async fn notify_requester(&self, event: DispatchEvent) -> Result<(), NotifyError>;
}

/// Publishes every event on a broadcast channel consumed by the websocket push endpoint.
pub struct ChannelGateway {
    tx: broadcast::Sender<DispatchEvent>,
}

impl ChannelGateway {
    pub fn new(tx: broadcast::Sender<DispatchEvent>) -> Self {
        Self { tx }
    }

    fn publish(&self, recipient: Uuid, event: DispatchEvent) -> Result<(), NotifyError> {
        self.tx
            .send(event)
            .map(|_| ())
            .map_err(|_| NotifyError::NoRecipient(recipient))
    }
}

#[async_trait]
impl NotificationGateway for ChannelGateway {
    async fn deliver_offer(&self, driver_id: Uuid, offer: &OfferPayload) -> Result<(), NotifyError> {
        self.publish(
            driver_id,
            DispatchEvent::Offer {
                driver_id,
                offer: offer.clone(),
            },
        )
    }

    async fn revoke_offer(
        &self,
        driver_id: Uuid,
        request_id: Uuid,
        round: u32,
        reason: RevokeReason,
    ) -> Result<(), NotifyError> {
        self.publish(
            driver_id,
            DispatchEvent::OfferRevoked {
                driver_id,
                request_id,
                round,
                reason,
            },
        )
    }

    async fn notify_requester(&self, event: DispatchEvent) -> Result<(), NotifyError> {
        let recipient = event.requester_id().unwrap_or_default();
        self.publish(recipient, event)
    }
}

//! Delivery statuses and event types.
//!
//! Both enumerations are closed: parsing any string outside the defined set
//! fails. Each [`EventType`] establishes exactly one [`DeliveryStatus`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A string that is not a member of a closed enumeration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown {kind}: {value:?}")]
pub struct UnknownVariant {
    /// Which enumeration was being parsed.
    pub kind: &'static str,
    /// The rejected input.
    pub value: String,
}

/// Lifecycle status of a delivery.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Delivery was created for an order.
    Confirmed,
    /// Delivery was cancelled. Terminal.
    Cancelled,
    /// Delivery is travelling to the customer.
    OnTheGo,
    /// Delivery reached the customer. Terminal.
    Delivered,
}

impl DeliveryStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [Self; 4] = [
        Self::Confirmed,
        Self::Cancelled,
        Self::OnTheGo,
        Self::Delivered,
    ];

    /// Wire and storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
            Self::OnTheGo => "on_the_go",
            Self::Delivered => "delivered",
        }
    }

    /// Whether no transition leaves this status.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Delivered)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "confirmed" => Ok(Self::Confirmed),
            "cancelled" => Ok(Self::Cancelled),
            "on_the_go" => Ok(Self::OnTheGo),
            "delivered" => Ok(Self::Delivered),
            _ => Err(UnknownVariant {
                kind: "delivery status",
                value: s.to_string(),
            }),
        }
    }
}

/// Kind of lifecycle event.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// Creates a delivery lifecycle.
    #[serde(rename = "confirm_delivery")]
    ConfirmDelivery,
    /// Cancels a confirmed or travelling delivery.
    #[serde(rename = "cancelled_delivery")]
    CancelledDelivery,
    /// Dispatches a confirmed delivery.
    #[serde(rename = "set_onthego_delivery")]
    SetOnTheGoDelivery,
    /// Completes a travelling delivery.
    #[serde(rename = "set_delivered_delivery")]
    SetDeliveredDelivery,
}

impl EventType {
    /// Every event type.
    pub const ALL: [Self; 4] = [
        Self::ConfirmDelivery,
        Self::CancelledDelivery,
        Self::SetOnTheGoDelivery,
        Self::SetDeliveredDelivery,
    ];

    /// Wire and storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConfirmDelivery => "confirm_delivery",
            Self::CancelledDelivery => "cancelled_delivery",
            Self::SetOnTheGoDelivery => "set_onthego_delivery",
            Self::SetDeliveredDelivery => "set_delivered_delivery",
        }
    }

    /// The status an event of this type establishes.
    #[must_use]
    pub const fn resulting_status(self) -> DeliveryStatus {
        match self {
            Self::ConfirmDelivery => DeliveryStatus::Confirmed,
            Self::CancelledDelivery => DeliveryStatus::Cancelled,
            Self::SetOnTheGoDelivery => DeliveryStatus::OnTheGo,
            Self::SetDeliveredDelivery => DeliveryStatus::Delivered,
        }
    }

    /// Whether events of this type must name the acting user.
    #[must_use]
    pub const fn requires_actor(self) -> bool {
        !matches!(self, Self::ConfirmDelivery)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "confirm_delivery" => Ok(Self::ConfirmDelivery),
            "cancelled_delivery" => Ok(Self::CancelledDelivery),
            "set_onthego_delivery" => Ok(Self::SetOnTheGoDelivery),
            "set_delivered_delivery" => Ok(Self::SetDeliveredDelivery),
            _ => Err(UnknownVariant {
                kind: "event type",
                value: s.to_string(),
            }),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_parse_back() {
        for status in DeliveryStatus::ALL {
            assert_eq!(status.as_str().parse::<DeliveryStatus>().unwrap(), status);
        }
        assert!("CONFIRMED".parse::<DeliveryStatus>().is_err());
    }

    #[test]
    fn event_type_strings_parse_back() {
        for event_type in EventType::ALL {
            assert_eq!(event_type.as_str().parse::<EventType>().unwrap(), event_type);
        }
        assert!("shipped".parse::<EventType>().is_err());
    }

    #[test]
    fn each_type_establishes_a_distinct_status() {
        let statuses: std::collections::HashSet<_> =
            EventType::ALL.iter().map(|t| t.resulting_status()).collect();
        assert_eq!(statuses.len(), DeliveryStatus::ALL.len());
    }

    #[test]
    fn terminal_statuses() {
        assert!(DeliveryStatus::Cancelled.is_terminal());
        assert!(DeliveryStatus::Delivered.is_terminal());
        assert!(!DeliveryStatus::Confirmed.is_terminal());
        assert!(!DeliveryStatus::OnTheGo.is_terminal());
    }

    #[test]
    fn serde_uses_wire_names() {
        assert_eq!(
            serde_json::to_string(&DeliveryStatus::OnTheGo).unwrap(),
            "\"on_the_go\""
        );
        assert_eq!(
            serde_json::to_string(&EventType::SetOnTheGoDelivery).unwrap(),
            "\"set_onthego_delivery\""
        );
    }
}

//! # DeliveryGo Core
//!
//! Schema, state machine and storage abstractions for the event-sourced
//! delivery lifecycle.
//!
//! ## Core Concepts
//!
//! - **Event**: immutable fact recording one lifecycle transition ([`event`])
//! - **Validator**: structural checks on events, fail-fast ([`validation`])
//! - **State machine**: pure transition table over event history ([`state_machine`])
//! - **Event store**: append-only, conditionally appended streams ([`event_store`])
//! - **Projection**: current-state read model folded from events ([`projection`])
//! - **Broker**: inbound intents and outbound notifications ([`broker`])
//!
//! ## Data Flow
//!
//! ```text
//! intent ──▶ state machine ──▶ event store ──▶ projection builder ──▶ read model
//!              (validate)        (append)         (fold / apply)
//! ```
//!
//! ## Example
//!
//! ```
//! use deliverygo_core::projection::DeliveryProjection;
//! use deliverygo_core::state_machine::{self, CurrentState};
//! use deliverygo_core::status::{DeliveryStatus, EventType};
//! use deliverygo_core::stream::{DeliveryId, OrderId};
//!
//! let event = state_machine::next_event(
//!     &[],
//!     EventType::ConfirmDelivery,
//!     DeliveryId::new("D1"),
//!     OrderId::new("O1"),
//!     "U1",
//!     chrono::Utc::now(),
//! )
//! .map_err(|e| e.to_string());
//! assert_eq!(event.map(|e| e.resulting_status()), Ok(DeliveryStatus::Confirmed));
//! assert_eq!(state_machine::current_state(&[]), CurrentState::NoHistory);
//! assert!(DeliveryProjection::fold(&[]).is_none());
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

pub mod broker;
pub mod event;
pub mod event_store;
pub mod projection;
pub mod state_machine;
pub mod status;
pub mod stream;
pub mod validation;

/// Injected dependencies.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```ignore
    /// // Test - fixed time for deterministic tests
    /// struct FixedClock { time: DateTime<Utc> }
    /// impl Clock for FixedClock {
    ///     fn now(&self) -> DateTime<Utc> {
    ///         self.time
    ///     }
    /// }
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock reading the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

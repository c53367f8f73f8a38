//! # DeliveryGo Testing
//!
//! Testing utilities for the delivery lifecycle engine.
//!
//! This crate provides:
//! - In-memory implementations of the event store, projection store and broker
//! - Deterministic clocks
//! - Property-based testing strategies for lifecycles
//!
//! ## Example
//!
//! ```
//! use deliverygo_testing::{InMemoryEventStore, InMemoryProjectionStore, test_clock};
//! use deliverygo_core::environment::Clock;
//!
//! let events = InMemoryEventStore::new();
//! let projections = InMemoryProjectionStore::new();
//! assert!(events.is_empty() && projections.is_empty());
//! assert_eq!(test_clock().now(), test_clock().now());
//! ```

use chrono::{DateTime, Utc};
use deliverygo_core::environment::Clock;

pub mod broker;
pub mod event_store;
pub mod projection_mocks;

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::atomic::{AtomicI64, Ordering};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that advances by one second on every read.
    #[derive(Debug)]
    pub struct TickingClock {
        start: DateTime<Utc>,
        ticks: AtomicI64,
    }

    impl TickingClock {
        /// Start ticking from `start`.
        #[must_use]
        pub const fn new(start: DateTime<Utc>) -> Self {
            Self {
                start,
                ticks: AtomicI64::new(0),
            }
        }
    }

    impl Clock for TickingClock {
        fn now(&self) -> DateTime<Utc> {
            let tick = self.ticks.fetch_add(1, Ordering::SeqCst);
            self.start + chrono::Duration::seconds(tick)
        }
    }

    /// Create a fixed clock at 2025-01-01 00:00:00 UTC.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Property-based testing strategies.
pub mod properties {
    use deliverygo_core::state_machine::CurrentState;
    use deliverygo_core::status::EventType;
    use proptest::prelude::*;

    /// Any event type.
    pub fn any_event_type() -> impl Strategy<Value = EventType> {
        prop::sample::select(EventType::ALL.to_vec())
    }

    /// Any state, including `NoHistory`.
    pub fn any_current_state() -> impl Strategy<Value = CurrentState> {
        prop::sample::select(CurrentState::ALL.to_vec())
    }

    /// A legal sequence of event types from creation, of any length.
    pub fn valid_lifecycle() -> impl Strategy<Value = Vec<EventType>> {
        use EventType::{CancelledDelivery, ConfirmDelivery, SetDeliveredDelivery, SetOnTheGoDelivery};
        prop::sample::select(vec![
            vec![ConfirmDelivery],
            vec![ConfirmDelivery, CancelledDelivery],
            vec![ConfirmDelivery, SetOnTheGoDelivery],
            vec![ConfirmDelivery, SetOnTheGoDelivery, CancelledDelivery],
            vec![ConfirmDelivery, SetOnTheGoDelivery, SetDeliveredDelivery],
        ])
    }
}

// Re-export commonly used items
pub use broker::{InMemoryIntentSource, InMemoryPublisher};
pub use event_store::{GatedEventStore, InMemoryEventStore};
pub use mocks::{FixedClock, TickingClock, test_clock};
pub use projection_mocks::InMemoryProjectionStore;

//! Delivery lifecycle state machine.
//!
//! Everything here is a pure function of the event history: no I/O, no clock
//! reads. The caller supplies "now" and performs the append.
//!
//! ```text
//! NoHistory ──confirm──▶ Confirmed ──on_the_go──▶ OnTheGo ──delivered──▶ Delivered
//!                            │                       │
//!                            └────cancel──┐   ┌──cancel┘
//!                                         ▼   ▼
//!                                       Cancelled
//! ```
//!
//! Current status is taken from the latest event by `(occurred_at, sequence)`,
//! so two events sharing a timestamp resolve to the one appended last.

use crate::event::{DeliveryEvent, EventPayload, StoredEvent};
use crate::status::{DeliveryStatus, EventType};
use crate::stream::{DeliveryId, OrderId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// State of a delivery as seen by the state machine.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CurrentState {
    /// No events exist for the delivery.
    NoHistory,
    /// The delivery is at this status.
    At(DeliveryStatus),
}

impl CurrentState {
    /// Every state, `NoHistory` first.
    pub const ALL: [Self; 5] = [
        Self::NoHistory,
        Self::At(DeliveryStatus::Confirmed),
        Self::At(DeliveryStatus::Cancelled),
        Self::At(DeliveryStatus::OnTheGo),
        Self::At(DeliveryStatus::Delivered),
    ];

    /// The status, if there is history.
    #[must_use]
    pub const fn status(self) -> Option<DeliveryStatus> {
        match self {
            Self::NoHistory => None,
            Self::At(status) => Some(status),
        }
    }
}

impl fmt::Display for CurrentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoHistory => f.write_str("no_history"),
            Self::At(status) => status.fmt(f),
        }
    }
}

/// The current state does not permit the requested transition.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("cannot apply {attempted} to a delivery in state {from}")]
pub struct InvalidTransition {
    /// State the delivery was in.
    pub from: CurrentState,
    /// Event type that was requested.
    pub attempted: EventType,
}

/// Look up the transition table.
///
/// # Errors
///
/// Returns [`InvalidTransition`] for every pair outside the five allowed ones.
pub const fn transition(
    from: CurrentState,
    attempted: EventType,
) -> Result<DeliveryStatus, InvalidTransition> {
    use CurrentState::{At, NoHistory};
    use DeliveryStatus::{Confirmed, OnTheGo};
    use EventType::{CancelledDelivery, ConfirmDelivery, SetDeliveredDelivery, SetOnTheGoDelivery};

    match (from, attempted) {
        (NoHistory, ConfirmDelivery)
        | (At(Confirmed), CancelledDelivery | SetOnTheGoDelivery)
        | (At(OnTheGo), CancelledDelivery | SetDeliveredDelivery) => {
            Ok(attempted.resulting_status())
        }
        _ => Err(InvalidTransition { from, attempted }),
    }
}

/// The latest event of a history in fold order, regardless of slice order.
#[must_use]
pub fn latest(history: &[StoredEvent]) -> Option<&StoredEvent> {
    history.iter().max_by_key(|e| e.ordering_key())
}

/// Current state of a delivery given its history.
#[must_use]
pub fn current_state(history: &[StoredEvent]) -> CurrentState {
    latest(history).map_or(CurrentState::NoHistory, |e| {
        CurrentState::At(e.resulting_status())
    })
}

/// The latest event, if it already records the proposed change.
///
/// A confirmation only counts as a duplicate when it was for the same order.
#[must_use]
pub fn already_applied<'a>(
    history: &'a [StoredEvent],
    proposed: EventType,
    order_id: Option<&OrderId>,
) -> Option<&'a StoredEvent> {
    let last = latest(history)?;
    if last.event_type() != proposed {
        return None;
    }
    match (proposed, order_id) {
        (EventType::ConfirmDelivery, Some(order_id)) if &last.event.order_id != order_id => None,
        _ => Some(last),
    }
}

/// Construct the next event for a delivery, if the transition is legal.
///
/// `user_id` is the owner for confirmations and the actor otherwise.
/// `occurred_at` is `now`, clamped so it is never earlier than the latest event
/// in `history`.
///
/// # Errors
///
/// Returns [`InvalidTransition`] when the current state does not allow
/// `proposed`.
pub fn next_event(
    history: &[StoredEvent],
    proposed: EventType,
    delivery_id: DeliveryId,
    order_id: OrderId,
    user_id: impl Into<String>,
    now: DateTime<Utc>,
) -> Result<DeliveryEvent, InvalidTransition> {
    let last = latest(history);
    let from = last.map_or(CurrentState::NoHistory, |e| {
        CurrentState::At(e.resulting_status())
    });
    transition(from, proposed)?;

    let occurred_at = last.map_or(now, |e| now.max(e.event.occurred_at));
    Ok(DeliveryEvent::new(
        delivery_id,
        order_id,
        EventPayload::for_type(proposed, user_id),
        occurred_at,
    ))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::stream::Version;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn history(types: &[EventType]) -> Vec<StoredEvent> {
        types
            .iter()
            .enumerate()
            .map(|(i, event_type)| {
                let n = i64::try_from(i).unwrap();
                StoredEvent {
                    sequence: n + 1,
                    version: Version::new(u64::try_from(i).unwrap() + 1),
                    created_at: t0() + Duration::seconds(n),
                    event: DeliveryEvent::new(
                        DeliveryId::new("D1"),
                        OrderId::new("O1"),
                        EventPayload::for_type(*event_type, "U1"),
                        t0() + Duration::seconds(n),
                    ),
                }
            })
            .collect()
    }

    fn propose(history: &[StoredEvent], proposed: EventType) -> Result<DeliveryEvent, InvalidTransition> {
        next_event(
            history,
            proposed,
            DeliveryId::new("D1"),
            OrderId::new("O1"),
            "U9",
            t0() + Duration::hours(1),
        )
    }

    #[test]
    fn transition_table_is_exhaustive() {
        let allowed = [
            (CurrentState::NoHistory, EventType::ConfirmDelivery),
            (CurrentState::At(DeliveryStatus::Confirmed), EventType::CancelledDelivery),
            (CurrentState::At(DeliveryStatus::Confirmed), EventType::SetOnTheGoDelivery),
            (CurrentState::At(DeliveryStatus::OnTheGo), EventType::CancelledDelivery),
            (CurrentState::At(DeliveryStatus::OnTheGo), EventType::SetDeliveredDelivery),
        ];

        let mut successes = 0;
        for from in CurrentState::ALL {
            for attempted in EventType::ALL {
                let result = transition(from, attempted);
                if allowed.contains(&(from, attempted)) {
                    assert_eq!(result, Ok(attempted.resulting_status()));
                    successes += 1;
                } else {
                    assert_eq!(result, Err(InvalidTransition { from, attempted }));
                }
            }
        }
        assert_eq!(successes, 5);
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for status in DeliveryStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            for attempted in EventType::ALL {
                assert!(transition(CurrentState::At(status), attempted).is_err());
            }
        }
    }

    #[test]
    fn empty_history_confirms() {
        let event = propose(&[], EventType::ConfirmDelivery).unwrap();
        assert_eq!(event.resulting_status(), DeliveryStatus::Confirmed);
        assert_eq!(event.payload, EventPayload::Confirm { user_id: "U9".into() });
    }

    #[test]
    fn confirmed_cannot_be_delivered() {
        let err = propose(&history(&[EventType::ConfirmDelivery]), EventType::SetDeliveredDelivery)
            .unwrap_err();
        assert_eq!(err.from, CurrentState::At(DeliveryStatus::Confirmed));
        assert_eq!(err.attempted, EventType::SetDeliveredDelivery);
    }

    #[test]
    fn on_the_go_can_be_cancelled_and_then_nothing() {
        let mut h = history(&[EventType::ConfirmDelivery, EventType::SetOnTheGoDelivery]);
        let cancel = propose(&h, EventType::CancelledDelivery).unwrap();
        assert_eq!(cancel.payload.actor_user_id(), Some("U9"));
        h = history(&[
            EventType::ConfirmDelivery,
            EventType::SetOnTheGoDelivery,
            EventType::CancelledDelivery,
        ]);
        assert_eq!(current_state(&h), CurrentState::At(DeliveryStatus::Cancelled));
        let err = propose(&h, EventType::SetDeliveredDelivery).unwrap_err();
        assert_eq!(err.from, CurrentState::At(DeliveryStatus::Cancelled));
    }

    #[test]
    fn current_state_uses_latest_occurrence_not_slice_order() {
        let mut h = history(&[EventType::ConfirmDelivery, EventType::SetOnTheGoDelivery]);
        h.reverse();
        assert_eq!(current_state(&h), CurrentState::At(DeliveryStatus::OnTheGo));
    }

    #[test]
    fn equal_timestamps_resolve_to_last_append() {
        let mut h = history(&[
            EventType::ConfirmDelivery,
            EventType::SetOnTheGoDelivery,
            EventType::CancelledDelivery,
        ]);
        let same = h[1].event.occurred_at;
        h[2].event.occurred_at = same;
        h.swap(1, 2);
        assert_eq!(current_state(&h), CurrentState::At(DeliveryStatus::Cancelled));
    }

    #[test]
    fn occurred_at_never_precedes_history() {
        let h = history(&[EventType::ConfirmDelivery]);
        let skewed_now = t0() - Duration::minutes(5);
        let event = next_event(
            &h,
            EventType::SetOnTheGoDelivery,
            DeliveryId::new("D1"),
            OrderId::new("O1"),
            "U9",
            skewed_now,
        )
        .unwrap();
        assert_eq!(event.occurred_at, h[0].event.occurred_at);
    }

    #[test]
    fn duplicate_detection_matches_latest_type() {
        let h = history(&[EventType::ConfirmDelivery, EventType::SetOnTheGoDelivery]);
        assert!(already_applied(&h, EventType::SetOnTheGoDelivery, None).is_some());
        assert!(already_applied(&h, EventType::ConfirmDelivery, None).is_none());
        assert!(already_applied(&[], EventType::ConfirmDelivery, None).is_none());
    }

    #[test]
    fn confirm_duplicate_requires_same_order() {
        let h = history(&[EventType::ConfirmDelivery]);
        let same = OrderId::new("O1");
        let other = OrderId::new("O2");
        assert!(already_applied(&h, EventType::ConfirmDelivery, Some(&same)).is_some());
        assert!(already_applied(&h, EventType::ConfirmDelivery, Some(&other)).is_none());
    }

    proptest! {
        #[test]
        fn arbitrary_intents_keep_a_legal_lifecycle(
            attempts in prop::collection::vec(prop::sample::select(EventType::ALL.to_vec()), 0..16)
        ) {
            let mut state = CurrentState::NoHistory;
            let mut accepted = Vec::new();
            for attempted in attempts {
                if let Ok(status) = transition(state, attempted) {
                    prop_assert!(state.status().is_none_or(|s| !s.is_terminal()));
                    accepted.push(attempted);
                    state = CurrentState::At(status);
                }
            }
            prop_assert!(accepted.len() <= 3);
            if let Some(first) = accepted.first() {
                prop_assert_eq!(*first, EventType::ConfirmDelivery);
            }
            prop_assert!(!accepted.iter().skip(1).any(|t| *t == EventType::ConfirmDelivery));
        }
    }
}

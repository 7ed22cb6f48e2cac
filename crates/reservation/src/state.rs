//! Reservation state machine.

use serde::{Deserialize, Serialize};

/// The state of a reservation in its lifecycle.
///
/// State transitions:
/// ```text
/// Held ──┬──► Committing ──┬──► Committed
///        │       │          ├──► Held (ledger rolled back)
///        │       │          └──► Expired (abandoned commit)
///        ├──► Released
///        └──► Expired
/// ```
///
/// `Committing` pins the holds while the order's ledger transaction is in
/// flight; release and the sweeper leave it alone until it settles.
/// `Expired` means the holds were freed by the sweeper; it counts as
/// released. The only way out of it is a late `Committed` when the order's
/// ledger transaction had already become durable before the sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    /// Stock is soft-held, awaiting commit or release.
    #[default]
    Held,

    /// A ledger transaction is deducting the held stock.
    Committing,

    /// Holds converted into a ledger deduction (terminal state).
    Committed,

    /// Holds dropped on caller request (terminal state).
    Released,

    /// Holds dropped by the sweeper after the TTL lapsed (terminal state).
    Expired,
}

impl ReservationStatus {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationStatus::Held | ReservationStatus::Committing)
    }

    /// Returns true if the reservation may move from `self` to `next`.
    pub fn can_transition_to(&self, next: ReservationStatus) -> bool {
        use ReservationStatus::*;
        matches!(
            (self, next),
            (Held, Committing)
                | (Held, Released)
                | (Held, Expired)
                | (Committing, Committed)
                | (Committing, Held)
                | (Committing, Expired)
                | (Expired, Committed)
        )
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Held => "held",
            ReservationStatus::Committing => "committing",
            ReservationStatus::Committed => "committed",
            ReservationStatus::Released => "released",
            ReservationStatus::Expired => "expired",
        }
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ReservationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "held" => Ok(ReservationStatus::Held),
            "committing" => Ok(ReservationStatus::Committing),
            "committed" => Ok(ReservationStatus::Committed),
            "released" => Ok(ReservationStatus::Released),
            "expired" => Ok(ReservationStatus::Expired),
            other => Err(format!("unknown reservation status '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_state_is_held() {
        assert_eq!(ReservationStatus::default(), ReservationStatus::Held);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!ReservationStatus::Held.is_terminal());
        assert!(!ReservationStatus::Committing.is_terminal());
        assert!(ReservationStatus::Committed.is_terminal());
        assert!(ReservationStatus::Released.is_terminal());
        assert!(ReservationStatus::Expired.is_terminal());
    }

    #[test]
    fn test_no_transitions_out_of_committed_or_released() {
        for next in [
            ReservationStatus::Held,
            ReservationStatus::Committing,
            ReservationStatus::Committed,
            ReservationStatus::Released,
            ReservationStatus::Expired,
        ] {
            assert!(!ReservationStatus::Committed.can_transition_to(next));
            assert!(!ReservationStatus::Released.can_transition_to(next));
        }
    }

    #[test]
    fn test_held_transitions() {
        assert!(ReservationStatus::Held.can_transition_to(ReservationStatus::Committing));
        assert!(!ReservationStatus::Held.can_transition_to(ReservationStatus::Committed));
        assert!(ReservationStatus::Held.can_transition_to(ReservationStatus::Released));
        assert!(ReservationStatus::Held.can_transition_to(ReservationStatus::Expired));
        assert!(!ReservationStatus::Held.can_transition_to(ReservationStatus::Held));
        assert!(!ReservationStatus::Expired.can_transition_to(ReservationStatus::Released));
    }

    #[test]
    fn test_committing_cannot_be_released() {
        let committing = ReservationStatus::Committing;
        assert!(committing.can_transition_to(ReservationStatus::Committed));
        assert!(committing.can_transition_to(ReservationStatus::Held));
        assert!(committing.can_transition_to(ReservationStatus::Expired));
        assert!(!committing.can_transition_to(ReservationStatus::Released));
    }

    #[test]
    fn test_string_roundtrip() {
        for status in [
            ReservationStatus::Held,
            ReservationStatus::Committing,
            ReservationStatus::Committed,
            ReservationStatus::Released,
            ReservationStatus::Expired,
        ] {
            assert_eq!(status.as_str().parse::<ReservationStatus>(), Ok(status));
        }
        assert!("pending".parse::<ReservationStatus>().is_err());
    }

    #[test]
    fn test_serialization() {
        let json = serde_json::to_string(&ReservationStatus::Committed).unwrap();
        assert_eq!(json, "\"committed\"");
    }
}

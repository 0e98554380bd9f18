//! Logical clocks for a branch of history.
//!
//! A branch sits at a [`StateTimestamp`]; every successful write is a
//! [`TransitionTimestamp`], the step from one state to the next. Replicas apply
//! transitions in timestamp order, which is what gives every key a single
//! total order of writes.

use serde::{Deserialize, Serialize};

/// A point in a branch's history.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct StateTimestamp(u64);

impl StateTimestamp {
    /// The state before any write.
    pub const ZERO: StateTimestamp = StateTimestamp(0);

    /// The transition leaving this state.
    pub fn next(self) -> TransitionTimestamp {
        TransitionTimestamp::starting_from(self)
    }
}

impl std::fmt::Display for StateTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single step in a branch's history, from [`source`](Self::source) to
/// [`target`](Self::target).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TransitionTimestamp(u64);

impl TransitionTimestamp {
    /// The transition that advances history from `before`.
    pub fn starting_from(before: StateTimestamp) -> Self {
        TransitionTimestamp(before.0)
    }

    /// The state this transition starts from.
    pub fn source(self) -> StateTimestamp {
        StateTimestamp(self.0)
    }

    /// The state this transition produces.
    pub fn target(self) -> StateTimestamp {
        StateTimestamp(self.0 + 1)
    }
}

impl std::fmt::Display for TransitionTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}", self.0, self.0 + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_chain() {
        let t0 = StateTimestamp::ZERO;
        let step = t0.next();
        assert_eq!(step.source(), t0);
        let t1 = step.target();
        assert!(t1 > t0);
        assert_eq!(t1.next().source(), t1);
    }
}

use core::fmt;

use portable_atomic::{AtomicU8, Ordering};

use crate::{Error, Result, Transition};

/// Lifecycle of a [`Sequencer`].
///
/// ```text
/// Detached --attach--> Attaching --lease--> Attached --detach--> Detaching --release--> Detached
///     \                   |                   |                     |
///      +------------------+-----destroy-------+---------------------+-----> Destroyed (terminal)
/// ```
///
/// [`Attaching`] and [`Detaching`] are held while the lease request is in
/// flight; no other attach or detach can start from them. A failed lease
/// request moves `Attaching` back to `Detached`.
///
/// [`Destroyed`] absorbs every further transition: requests made after it is
/// reached succeed without effect, so shutdown may be triggered redundantly
/// from several paths.
///
/// [`Sequencer`]: crate::Sequencer
/// [`Attaching`]: SequenceState::Attaching
/// [`Detaching`]: SequenceState::Detaching
/// [`Destroyed`]: SequenceState::Destroyed
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SequenceState {
    /// No logical node id is leased. Initial state.
    Detached = 0,
    /// A logical node id is leased and IDs can be generated locally.
    Attached = 1,
    /// Terminal state.
    Destroyed = 2,
    /// A lease request is in flight.
    Attaching = 3,
    /// The leased id is being returned to the cluster.
    Detaching = 4,
}

impl SequenceState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Detached,
            1 => Self::Attached,
            3 => Self::Attaching,
            4 => Self::Detaching,
            _ => Self::Destroyed,
        }
    }
}

impl fmt::Display for SequenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Detached => f.write_str("detached"),
            Self::Attached => f.write_str("attached"),
            Self::Destroyed => f.write_str("destroyed"),
            Self::Attaching => f.write_str("attaching"),
            Self::Detaching => f.write_str("detaching"),
        }
    }
}

/// Result of a successful [`StateCell::transition`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// The state moved away from `from`.
    Applied { from: SequenceState },
    /// The cell was already [`SequenceState::Destroyed`]; nothing changed.
    Absorbed,
}

/// Atomic holder of a [`SequenceState`].
///
/// Caller-initiated transitions go through [`StateCell::transition`], which
/// encodes the legality table in one place and commits with a single
/// compare-and-swap. The caller that moved the cell into a transient state
/// finishes it with [`StateCell::settle`].
#[derive(Debug)]
pub(crate) struct StateCell {
    raw: AtomicU8,
}

impl StateCell {
    pub(crate) const fn new(state: SequenceState) -> Self {
        Self {
            raw: AtomicU8::new(state as u8),
        }
    }

    pub(crate) fn load(&self) -> SequenceState {
        SequenceState::from_u8(self.raw.load(Ordering::Acquire))
    }

    /// Moves the cell to `target`, which is one of [`SequenceState::Attaching`],
    /// [`SequenceState::Detaching`] or [`SequenceState::Destroyed`].
    ///
    /// Concurrent callers race on the CAS: exactly one wins a given edge, the
    /// losers re-read the state and are judged against the table again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::State`] for `attach` while not detached and for
    /// `detach` while not attached. Nothing fails once destroyed.
    pub(crate) fn transition(&self, sequence: &str, target: SequenceState) -> Result<Outcome> {
        loop {
            let current = self.load();
            let legal = match (current, target) {
                (SequenceState::Destroyed, _) => return Ok(Outcome::Absorbed),
                (_, SequenceState::Destroyed)
                | (SequenceState::Detached, SequenceState::Attaching)
                | (SequenceState::Attached, SequenceState::Detaching) => true,
                _ => false,
            };

            if !legal {
                let transition = match target {
                    SequenceState::Attaching | SequenceState::Attached => Transition::Attach,
                    _ => Transition::Detach,
                };
                return Err(Error::State {
                    sequence: sequence.to_owned(),
                    transition,
                    actual: current,
                });
            }

            if self
                .raw
                .compare_exchange(
                    current as u8,
                    target as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Ok(Outcome::Applied { from: current });
            }
        }
    }

    /// Completes `from -> to` only if nobody moved the cell in between. The
    /// only competing move out of a transient state is to `Destroyed`.
    pub(crate) fn settle(&self, from: SequenceState, to: SequenceState) -> bool {
        self.raw
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::scope;

    #[test]
    fn attach_detach_cycle() {
        let cell = StateCell::new(SequenceState::Detached);
        assert_eq!(
            cell.transition("s", SequenceState::Attaching),
            Ok(Outcome::Applied {
                from: SequenceState::Detached
            })
        );
        assert!(cell.settle(SequenceState::Attaching, SequenceState::Attached));
        assert_eq!(cell.load(), SequenceState::Attached);
        assert_eq!(
            cell.transition("s", SequenceState::Detaching),
            Ok(Outcome::Applied {
                from: SequenceState::Attached
            })
        );
        assert!(cell.settle(SequenceState::Detaching, SequenceState::Detached));
        assert_eq!(cell.load(), SequenceState::Detached);
    }

    #[test]
    fn illegal_edges_name_the_sequence_and_transition() {
        let cell = StateCell::new(SequenceState::Detached);
        let err = cell.transition("orders", SequenceState::Detaching).unwrap_err();
        assert_eq!(
            err,
            Error::State {
                sequence: "orders".into(),
                transition: Transition::Detach,
                actual: SequenceState::Detached,
            }
        );
        assert_eq!(
            err.to_string(),
            "Sequence 'orders' cannot detach while detached"
        );

        cell.transition("orders", SequenceState::Attaching).unwrap();
        cell.settle(SequenceState::Attaching, SequenceState::Attached);
        let err = cell.transition("orders", SequenceState::Attaching).unwrap_err();
        assert!(err.is_state_error());
        assert_eq!(cell.load(), SequenceState::Attached);
    }

    #[test]
    fn transient_states_block_attach_and_detach() {
        let cell = StateCell::new(SequenceState::Detached);
        cell.transition("s", SequenceState::Attaching).unwrap();
        assert_eq!(
            cell.transition("s", SequenceState::Detaching)
                .unwrap_err()
                .to_string(),
            "Sequence 's' cannot detach while attaching"
        );
        assert!(cell.transition("s", SequenceState::Attaching).is_err());

        cell.settle(SequenceState::Attaching, SequenceState::Attached);
        cell.transition("s", SequenceState::Detaching).unwrap();
        assert_eq!(
            cell.transition("s", SequenceState::Attaching)
                .unwrap_err()
                .to_string(),
            "Sequence 's' cannot attach while detaching"
        );
        assert_eq!(cell.load(), SequenceState::Detaching);
    }

    #[test]
    fn destroy_wins_over_a_pending_settle() {
        let cell = StateCell::new(SequenceState::Detached);
        cell.transition("s", SequenceState::Attaching).unwrap();
        assert_eq!(
            cell.transition("s", SequenceState::Destroyed),
            Ok(Outcome::Applied {
                from: SequenceState::Attaching
            })
        );
        assert!(!cell.settle(SequenceState::Attaching, SequenceState::Attached));
        assert_eq!(cell.load(), SequenceState::Destroyed);
    }

    #[test]
    fn destroyed_absorbs_everything() {
        let cell = StateCell::new(SequenceState::Attached);
        assert!(matches!(
            cell.transition("s", SequenceState::Destroyed),
            Ok(Outcome::Applied { .. })
        ));
        for target in [
            SequenceState::Attaching,
            SequenceState::Detaching,
            SequenceState::Destroyed,
        ] {
            assert_eq!(cell.transition("s", target), Ok(Outcome::Absorbed));
        }
        assert_eq!(cell.load(), SequenceState::Destroyed);
    }

    #[test]
    fn exactly_one_concurrent_attach_wins() {
        const THREADS: usize = 16;
        let cell = StateCell::new(SequenceState::Detached);

        let wins: usize = scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| s.spawn(|| cell.transition("s", SequenceState::Attaching).is_ok()))
                .collect();
            handles
                .into_iter()
                .map(|h| usize::from(h.join().unwrap()))
                .sum()
        });

        assert_eq!(wins, 1);
        assert_eq!(cell.load(), SequenceState::Attaching);
    }

    #[test]
    fn settle_only_applies_to_expected_state() {
        let cell = StateCell::new(SequenceState::Attaching);
        assert!(cell.settle(SequenceState::Attaching, SequenceState::Detached));
        assert!(!cell.settle(SequenceState::Attaching, SequenceState::Detached));
        assert_eq!(cell.load(), SequenceState::Detached);
    }
}

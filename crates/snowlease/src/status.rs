use core::time::Duration;

use crate::SequenceId;

/// Outcome of one non-blocking generation attempt.
///
/// - [`IdGenStatus::Ready`] carries a freshly generated ID.
/// - [`IdGenStatus::Pending`] means the current millisecond's counter space is
///   exhausted (or the clock reads behind the last issued timestamp) and the
///   caller should wait `yield_for` before trying again.
///
/// # Example
///
/// ```
/// use snowlease::{IdGenStatus, SequenceId};
///
/// fn report(status: IdGenStatus) {
///     match status {
///         IdGenStatus::Ready { id } => println!("ID: {id}"),
///         IdGenStatus::Pending { yield_for } => println!("Back off for {yield_for:?}"),
///     }
/// }
/// # report(IdGenStatus::Ready { id: SequenceId::from_raw(1) });
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdGenStatus {
    /// A unique ID was generated and is ready to use.
    Ready {
        /// The generated ID.
        id: SequenceId,
    },
    /// No ID could be generated in this attempt.
    Pending {
        /// How long to wait before the next attempt.
        yield_for: Duration,
    },
}

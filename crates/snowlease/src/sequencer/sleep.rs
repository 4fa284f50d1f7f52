use core::{future::Future, time::Duration};

/// Abstracts how an async generation loop waits between attempts.
pub trait SleepProvider {
    /// We require `Send` so that the future can be safely moved across threads
    fn sleep_for(dur: Duration) -> impl Future<Output = ()> + Send;
}

/// A [`SleepProvider`] backed by Tokio's timer.
///
/// This is the default provider for [`Sequencer::next_id_async`].
///
/// [`Sequencer::next_id_async`]: crate::Sequencer::next_id_async
pub struct TokioSleep;
impl SleepProvider for TokioSleep {
    fn sleep_for(dur: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(dur)
    }
}

/// A [`SleepProvider`] that yields to the scheduler instead of sleeping.
///
/// Retries sooner than [`TokioSleep`] at the cost of a tighter polling loop
/// while a millisecond's counter space is exhausted.
pub struct TokioYield;
impl SleepProvider for TokioYield {
    fn sleep_for(_dur: Duration) -> impl Future<Output = ()> + Send {
        tokio::task::yield_now()
    }
}

//! Bounded fan-out / fan-in.
//!
//! Runs one task per item with at most `width` in flight, hands each result to a
//! completion callback as it finishes, and returns the results in input order.

use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FanOutError {
    #[error("fan-out cancelled")]
    Cancelled,

    #[error("task for item {index} ended without a result")]
    TaskLost { index: usize },
}

pub struct BoundedFanOut {
    width: usize,
    cancel: CancellationToken,
}

impl BoundedFanOut {
    pub fn new(width: usize, cancel: CancellationToken) -> Self {
        Self {
            width: width.max(1),
            cancel,
        }
    }

    /// Run `task(index, item, child_token)` for every item.
    ///
    /// Tasks are dispatched in input order as permits free up and never once the
    /// token is cancelled; cancellation aborts everything in flight.
    pub async fn run<I, T, F, Fut, C>(
        &self,
        items: Vec<I>,
        task: F,
        mut on_complete: C,
    ) -> Result<Vec<T>, FanOutError>
    where
        I: Send + 'static,
        T: Send + 'static,
        F: Fn(usize, I, CancellationToken) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        C: FnMut(usize, &T),
    {
        let mut slots: Vec<Option<T>> = items.iter().map(|_| None).collect();
        let semaphore = Arc::new(Semaphore::new(self.width));
        let mut pending = items.into_iter().enumerate();
        let mut next = pending.next();
        let mut set: JoinSet<(usize, T)> = JoinSet::new();

        while next.is_some() || !set.is_empty() {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    set.abort_all();
                    while set.join_next().await.is_some() {}
                    return Err(FanOutError::Cancelled);
                }
                Some(joined) = set.join_next(), if !set.is_empty() => {
                    match joined {
                        Ok((index, value)) => {
                            on_complete(index, &value);
                            slots[index] = Some(value);
                        }
                        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                        Err(_) => {}
                    }
                }
                permit = Arc::clone(&semaphore).acquire_owned(), if next.is_some() => {
                    let Ok(permit) = permit else {
                        return Err(FanOutError::Cancelled);
                    };
                    if let Some((index, item)) = next.take() {
                        let work = task(index, item, self.cancel.child_token());
                        set.spawn(async move {
                            let _permit = permit;
                            (index, work.await)
                        });
                        next = pending.next();
                    }
                }
            }
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| slot.ok_or(FanOutError::TaskLost { index }))
            .collect()
    }
}

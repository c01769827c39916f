//! Single-resolution completion sources.
//!
//! Engine signals arrive through callbacks; callers wait on futures. A
//! [`Completion`] is the callback side: it may be cloned into several
//! callbacks (a request callback and a transaction listener, say), and the
//! first one to settle it wins. Later settles hand their value back
//! unchanged. A [`Pending`] is the waiting side. If every clone of the
//! completion is dropped without settling, the wait ends with
//! [`StoreError::Interrupted`].

use crate::error::{StoreError, StoreResult};
use futures_channel::oneshot;
use std::cell::RefCell;
use std::rc::Rc;

/// The settling half.
pub(crate) struct Completion<T> {
    sender: Rc<RefCell<Option<oneshot::Sender<StoreResult<T>>>>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            sender: Rc::clone(&self.sender),
        }
    }
}

impl<T> Completion<T> {
    /// Settles with `result`. Returns the result back if already settled
    /// or if nobody is waiting any more.
    pub(crate) fn settle(&self, result: StoreResult<T>) -> Result<(), StoreResult<T>> {
        let sender = self.sender.borrow_mut().take();
        match sender {
            Some(sender) => sender.send(result),
            None => Err(result),
        }
    }

    /// Settles with a value, ignoring late settles.
    pub(crate) fn resolve(&self, value: T) {
        let _ = self.settle(Ok(value));
    }

    /// Settles with an error, ignoring late settles.
    pub(crate) fn reject(&self, err: StoreError) {
        let _ = self.settle(Err(err));
    }
}

/// The waiting half.
pub(crate) struct Pending<T> {
    receiver: oneshot::Receiver<StoreResult<T>>,
    operation: &'static str,
}

impl<T> Pending<T> {
    /// Waits for the settled result.
    pub(crate) async fn wait(self) -> StoreResult<T> {
        match self.receiver.await {
            Ok(result) => result,
            Err(oneshot::Canceled) => Err(StoreError::interrupted(self.operation)),
        }
    }
}

/// Creates a completion source for `operation`.
pub(crate) fn completion<T>(operation: &'static str) -> (Completion<T>, Pending<T>) {
    let (sender, receiver) = oneshot::channel();
    (
        Completion {
            sender: Rc::new(RefCell::new(Some(sender))),
        },
        Pending {
            receiver,
            operation,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;

    #[test]
    fn first_settle_wins() {
        let (done, pending) = completion::<u32>("test");
        let other = done.clone();
        done.resolve(1);
        assert_eq!(other.settle(Ok(2)), Err(Ok(2)));
        assert_eq!(pending.wait().now_or_never(), Some(Ok(1)));
    }

    #[test]
    fn dropped_source_interrupts() {
        let (done, pending) = completion::<u32>("get");
        drop(done);
        let result = pending.wait().now_or_never();
        assert_eq!(result, Some(Err(StoreError::interrupted("get"))));
    }

    #[test]
    fn rejection_is_delivered() {
        let (done, pending) = completion::<()>("clear");
        done.reject(StoreError::validation("nope"));
        assert!(matches!(
            pending.wait().now_or_never(),
            Some(Err(StoreError::Validation { .. }))
        ));
    }
}

use std::future::Future;
use tokio::sync::watch;

use crate::error::SessionError;

type State = Option<Result<(), SessionError>>;

#[derive(Debug)]
pub struct ReadySignal {
    tx: watch::Sender<State>,
}

impl ReadySignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Resolve successfully. Returns false if the signal was already resolved.
    pub fn complete(&self) -> bool {
        self.resolve(Ok(()))
    }

    /// Resolve with an error. Returns false if the signal was already resolved.
    pub fn fail(&self, err: SessionError) -> bool {
        self.resolve(Err(err))
    }

    fn resolve(&self, result: Result<(), SessionError>) -> bool {
        self.tx.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some(result);
            true
        })
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Current outcome without waiting.
    pub fn peek(&self) -> State {
        self.tx.borrow().clone()
    }

    /// Wait for the outcome. If the signal is dropped while still pending the
    /// waiter observes [`SessionError::Closed`].
    pub fn wait(&self) -> impl Future<Output = Result<(), SessionError>> + Send + 'static {
        let mut rx = self.tx.subscribe();
        async move {
            let outcome = match rx.wait_for(Option::is_some).await {
                Ok(state) => (*state).clone(),
                Err(_) => None,
            };
            outcome.unwrap_or(Err(SessionError::Closed))
        }
    }

    /// Wait for `self`, then for `next`. `next` is only consulted once `self`
    /// has succeeded; a failure of either fails the whole chain.
    pub fn then(
        &self,
        next: &ReadySignal,
    ) -> impl Future<Output = Result<(), SessionError>> + Send + 'static {
        let first = self.wait();
        let second = next.wait();
        async move {
            first.await?;
            second.await
        }
    }

    /// Non-blocking view of [`ReadySignal::then`].
    pub fn peek_then(&self, next: &ReadySignal) -> State {
        match self.peek()? {
            Ok(()) => next.peek(),
            Err(e) => Some(Err(e)),
        }
    }
}

impl Default for ReadySignal {
    fn default() -> Self {
        Self::new()
    }
}

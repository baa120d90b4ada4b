//! Dispatcher: runs one leased message through its handler and turns the
//! result into a terminal disposition.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use courier_messaging::Message;

use crate::handler::{HandlerError, MessageHandler};
use crate::policy::{Decision, FailureClass, RetryPolicy};
use crate::registry::{HandlerDescriptor, HandlerRegistry};
use crate::scope::{ScopeLease, ScopeManager};

/// Terminal decision for one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Acknowledge,
    RetryAfter(Duration),
    DeadLetter(String),
}

impl Disposition {
    pub fn label(&self) -> &'static str {
        match self {
            Disposition::Acknowledge => "acknowledge",
            Disposition::RetryAfter(_) => "retry",
            Disposition::DeadLetter(_) => "dead_letter",
        }
    }
}

/// Why a handler stopped being awaited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Deadline,
    Abort,
}

impl Interrupt {
    fn reason(self) -> &'static str {
        match self {
            Interrupt::Deadline => "cancelled: message timeout elapsed",
            Interrupt::Abort => "cancelled: host aborted in-flight work",
        }
    }
}

#[derive(Debug)]
enum Outcome {
    Returned(Result<(), HandlerError>),
    Panicked(String),
    Interrupted(Interrupt),
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    policy: RetryPolicy,
    message_timeout: Duration,
}

impl Dispatcher {
    pub fn new(policy: RetryPolicy, message_timeout: Duration) -> Self {
        Self {
            policy,
            message_timeout,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn message_timeout(&self) -> Duration {
        self.message_timeout
    }

    /// Resolve, scope and dispatch one message.
    ///
    /// Never fails: configuration problems surface as dead-letter dispositions
    /// so the message is never silently dropped.
    pub async fn process(
        &self,
        message: &Message,
        registry: &HandlerRegistry,
        scopes: &ScopeManager,
        abort: &CancellationToken,
    ) -> Disposition {
        let descriptor = match registry.resolve(message.kind()) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                warn!(message_id = %message.id(), kind = %message.kind(), error = %err, "no handler registered");
                return Disposition::DeadLetter(format!("unknown message kind: {}", message.kind()));
            }
        };

        let scope = match scopes.acquire(&descriptor) {
            Ok(scope) => scope,
            Err(err) => {
                warn!(message_id = %message.id(), kind = %message.kind(), error = %err, "scope acquisition failed");
                return Disposition::DeadLetter(format!("dependency resolution failed: {err}"));
            }
        };

        let deadline = Instant::now() + self.message_timeout;
        self.dispatch(message, &descriptor, scope, deadline, abort).await
    }

    /// Invoke the handler until it returns, `deadline` passes or `abort` fires.
    ///
    /// The scope is released before the disposition is returned on every path.
    #[instrument(
        skip_all,
        fields(message_id = %message.id(), kind = %message.kind(), attempt = message.attempt())
    )]
    pub async fn dispatch(
        &self,
        message: &Message,
        descriptor: &HandlerDescriptor,
        scope: ScopeLease,
        deadline: Instant,
        abort: &CancellationToken,
    ) -> Disposition {
        let handler = match descriptor.instantiate(scope.scope()) {
            Ok(handler) => handler,
            Err(err) => {
                scope.release();
                warn!(error = %err, "handler construction failed");
                return Disposition::DeadLetter(format!("dependency resolution failed: {err}"));
            }
        };

        let outcome = run(handler.as_ref(), message, &scope, deadline, abort).await;
        scope.release();

        let disposition = self.settle(message, handler.as_ref(), outcome);
        debug!(disposition = disposition.label(), "dispatch finished");
        disposition
    }

    fn settle(
        &self,
        message: &Message,
        handler: &dyn MessageHandler,
        outcome: Outcome,
    ) -> Disposition {
        match outcome {
            Outcome::Returned(Ok(())) => Disposition::Acknowledge,
            Outcome::Returned(Err(err)) => {
                let class = handler.classify(&err);
                self.failure(message, class, err.to_string())
            }
            Outcome::Panicked(msg) => {
                self.failure(message, FailureClass::Permanent, format!("handler panicked: {msg}"))
            }
            Outcome::Interrupted(cause) => {
                self.failure(message, FailureClass::Transient, cause.reason().to_string())
            }
        }
    }

    fn failure(&self, message: &Message, class: FailureClass, reason: String) -> Disposition {
        let attempt = message.attempt();
        match (self.policy.decide(attempt, class), class) {
            (Decision::Retry, _) => {
                let delay = self.policy.backoff(attempt);
                warn!(?delay, %reason, "handler failed, scheduling retry");
                Disposition::RetryAfter(delay)
            }
            (Decision::DeadLetter, FailureClass::Permanent) => {
                warn!(%reason, "permanent failure, dead-lettering");
                Disposition::DeadLetter(reason)
            }
            (Decision::DeadLetter, FailureClass::Transient) => {
                warn!(%reason, "retries exhausted, dead-lettering");
                Disposition::DeadLetter(format!(
                    "retries exhausted after {attempt} attempts: {reason}"
                ))
            }
        }
    }
}

async fn run(
    handler: &dyn MessageHandler,
    message: &Message,
    scope: &ScopeLease,
    deadline: Instant,
    abort: &CancellationToken,
) -> Outcome {
    let cancel = abort.child_token();
    let mut work = AssertUnwindSafe(handler.handle(message, scope.scope(), &cancel)).catch_unwind();

    // Handler first: a result that is ready wins over a signal that is ready.
    let cause = tokio::select! {
        biased;
        result = &mut work => return settle_poll(result),
        _ = tokio::time::sleep_until(deadline) => Interrupt::Deadline,
        _ = abort.cancelled() => Interrupt::Abort,
    };

    cancel.cancel();
    // One more poll lets a cooperative handler finish; anything still pending
    // is abandoned.
    match (&mut work).now_or_never() {
        Some(Ok(Ok(()))) => Outcome::Returned(Ok(())),
        Some(Err(panic)) => Outcome::Panicked(panic_message(panic.as_ref())),
        Some(Ok(Err(_))) | None => Outcome::Interrupted(cause),
    }
}

fn settle_poll(result: Result<Result<(), HandlerError>, Box<dyn Any + Send>>) -> Outcome {
    match result {
        Ok(result) => Outcome::Returned(result),
        Err(panic) => Outcome::Panicked(panic_message(panic.as_ref())),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

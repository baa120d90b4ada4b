//! Execution scopes: the dependency context a handler runs against.
//!
//! - `PerMessage` descriptors get a fresh scope per delivery, torn down as soon
//!   as the handler returns, fails, panics or is abandoned
//! - `Shared` descriptors reuse one host-lifetime scope; release is a no-op
//!
//! Release is tied to `ScopeLease`'s `Drop`, so no exit path can skip it.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use courier_core::ScopeId;

use crate::registry::HandlerDescriptor;

/// Isolation requirement declared by a handler descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    /// Fresh dependencies per message; never shared across concurrent messages.
    PerMessage,
    /// One long-lived scope for all messages; the handler synchronizes itself.
    Shared,
}

/// Dependency resolution failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScopeError {
    #[error("{0}")]
    Unavailable(String),

    #[error("missing dependency `{0}`")]
    MissingDependency(&'static str),
}

impl ScopeError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }
}

/// Typed container of resolved dependencies (repositories, clients, ...).
pub struct ExecutionScope {
    id: ScopeId,
    isolation: Isolation,
    dependencies: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl ExecutionScope {
    pub fn new(isolation: Isolation) -> Self {
        Self {
            id: ScopeId::new(),
            isolation,
            dependencies: HashMap::new(),
        }
    }

    pub fn with<T: Any + Send + Sync>(mut self, value: T) -> Self {
        self.insert(value);
        self
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) {
        self.insert_arc(Arc::new(value));
    }

    /// Register an already shared dependency (e.g. a connection pool).
    pub fn insert_arc<T: Any + Send + Sync>(&mut self, value: Arc<T>) {
        self.dependencies.insert(TypeId::of::<T>(), value);
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.dependencies
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|dep| dep.downcast::<T>().ok())
    }

    pub fn require<T: Any + Send + Sync>(&self) -> Result<Arc<T>, ScopeError> {
        self.get::<T>()
            .ok_or(ScopeError::MissingDependency(type_name::<T>()))
    }

    pub fn id(&self) -> ScopeId {
        self.id
    }

    pub fn isolation(&self) -> Isolation {
        self.isolation
    }

    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }
}

impl fmt::Debug for ExecutionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionScope")
            .field("id", &self.id)
            .field("isolation", &self.isolation)
            .field("dependencies", &self.dependencies.len())
            .finish()
    }
}

/// Builds and tears down scopes.
pub trait ScopeProvider: Send + Sync {
    /// Resolve a dependency context. Called once at host start for the shared
    /// scope and once per message for `PerMessage` descriptors.
    fn create(&self, isolation: Isolation) -> Result<ExecutionScope, ScopeError>;

    /// Synchronously tear down a `PerMessage` scope (close connections, ...).
    /// Called exactly once per created per-message scope.
    fn release(&self, scope: &ExecutionScope) {
        let _ = scope;
    }
}

/// Hands out scopes according to each descriptor's isolation flag.
pub struct ScopeManager {
    provider: Arc<dyn ScopeProvider>,
    shared: Arc<ExecutionScope>,
}

impl ScopeManager {
    /// Resolve the shared scope eagerly so a broken dependency setup fails at startup.
    pub fn new(provider: Arc<dyn ScopeProvider>) -> Result<Self, ScopeError> {
        let shared = Arc::new(provider.create(Isolation::Shared)?);
        Ok(Self { provider, shared })
    }

    pub fn acquire(&self, descriptor: &HandlerDescriptor) -> Result<ScopeLease, ScopeError> {
        match descriptor.isolation() {
            Isolation::Shared => Ok(ScopeLease {
                inner: LeaseInner::Shared(Arc::clone(&self.shared)),
            }),
            Isolation::PerMessage => {
                let scope = self.provider.create(Isolation::PerMessage)?;
                debug!(scope_id = %scope.id(), kind = %descriptor.kind(), "scope created");
                Ok(ScopeLease {
                    inner: LeaseInner::Owned {
                        scope,
                        provider: Arc::clone(&self.provider),
                    },
                })
            }
        }
    }

    pub fn shared(&self) -> &ExecutionScope {
        &self.shared
    }
}

impl fmt::Debug for ScopeManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeManager")
            .field("shared", &self.shared)
            .finish_non_exhaustive()
    }
}

enum LeaseInner {
    Owned {
        scope: ExecutionScope,
        provider: Arc<dyn ScopeProvider>,
    },
    Shared(Arc<ExecutionScope>),
}

/// Scope held for the duration of one dispatch; released on drop.
pub struct ScopeLease {
    inner: LeaseInner,
}

impl ScopeLease {
    pub fn scope(&self) -> &ExecutionScope {
        match &self.inner {
            LeaseInner::Owned { scope, .. } => scope,
            LeaseInner::Shared(scope) => scope,
        }
    }

    /// Release now instead of at end of scope.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for ScopeLease {
    fn drop(&mut self) {
        if let LeaseInner::Owned { scope, provider } = &self.inner {
            if std::thread::panicking() {
                warn!(scope_id = %scope.id(), "releasing scope while unwinding");
            }
            provider.release(scope);
            debug!(scope_id = %scope.id(), "scope released");
        }
    }
}

impl fmt::Debug for ScopeLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ScopeLease").field(self.scope()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::handler::{HandlerError, MessageHandler};
    use async_trait::async_trait;
    use courier_core::MessageKind;
    use courier_messaging::Message;
    use tokio_util::sync::CancellationToken;

    #[derive(Debug)]
    struct Clock(&'static str);

    #[derive(Default)]
    struct CountingProvider {
        created: AtomicUsize,
        released: AtomicUsize,
    }

    impl ScopeProvider for CountingProvider {
        fn create(&self, isolation: Isolation) -> Result<ExecutionScope, ScopeError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(ExecutionScope::new(isolation).with(Clock("utc")))
        }

        fn release(&self, _scope: &ExecutionScope) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Noop;

    #[async_trait]
    impl MessageHandler for Noop {
        async fn handle(
            &self,
            _message: &Message,
            _scope: &ExecutionScope,
            _cancel: &CancellationToken,
        ) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    fn descriptor(isolation: Isolation) -> HandlerDescriptor {
        HandlerDescriptor::new(MessageKind::new("noop").unwrap(), isolation, |_| {
            Ok(Arc::new(Noop))
        })
    }

    #[test]
    fn typed_lookup() {
        let scope = ExecutionScope::new(Isolation::PerMessage).with(Clock("utc"));

        assert_eq!(scope.get::<Clock>().unwrap().0, "utc");
        assert!(scope.get::<String>().is_none());
        assert!(matches!(
            scope.require::<String>(),
            Err(ScopeError::MissingDependency(_))
        ));
    }

    #[test]
    fn per_message_scopes_are_fresh_and_released_once() {
        let provider = Arc::new(CountingProvider::default());
        let manager = ScopeManager::new(provider.clone()).unwrap();
        let descriptor = descriptor(Isolation::PerMessage);

        let first = manager.acquire(&descriptor).unwrap();
        let second = manager.acquire(&descriptor).unwrap();
        assert_ne!(first.scope().id(), second.scope().id());

        first.release();
        assert_eq!(provider.released.load(Ordering::SeqCst), 1);

        drop(second);
        assert_eq!(provider.released.load(Ordering::SeqCst), 2);
        // shared scope + two per-message scopes
        assert_eq!(provider.created.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn shared_scope_is_reused_and_never_released() {
        let provider = Arc::new(CountingProvider::default());
        let manager = ScopeManager::new(provider.clone()).unwrap();
        let descriptor = descriptor(Isolation::Shared);

        let a = manager.acquire(&descriptor).unwrap();
        let b = manager.acquire(&descriptor).unwrap();
        assert_eq!(a.scope().id(), b.scope().id());
        assert_eq!(a.scope().id(), manager.shared().id());

        drop(a);
        drop(b);
        assert_eq!(provider.released.load(Ordering::SeqCst), 0);
        assert_eq!(provider.created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn scope_released_when_holder_panics() {
        let provider = Arc::new(CountingProvider::default());
        let manager = ScopeManager::new(provider.clone()).unwrap();
        let descriptor = descriptor(Isolation::PerMessage);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _lease = manager.acquire(&descriptor).unwrap();
            panic!("handler blew up");
        }));

        assert!(result.is_err());
        assert_eq!(provider.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_shared_scope_fails_startup() {
        struct Broken;
        impl ScopeProvider for Broken {
            fn create(&self, _isolation: Isolation) -> Result<ExecutionScope, ScopeError> {
                Err(ScopeError::unavailable("database unreachable"))
            }
        }

        assert!(ScopeManager::new(Arc::new(Broken)).is_err());
    }
}

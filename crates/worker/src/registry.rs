//! Handler registry: message kind → handler descriptor.
//!
//! Populated once during startup, then moved behind an `Arc` and only read, so
//! lookups need no locking.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use courier_core::MessageKind;

use crate::handler::MessageHandler;
use crate::scope::{ExecutionScope, Isolation, ScopeError};

/// Construction recipe for a handler instance.
pub type HandlerFactory =
    dyn Fn(&ExecutionScope) -> Result<Arc<dyn MessageHandler>, ScopeError> + Send + Sync;

/// Registry configuration errors. Fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("a handler is already registered for message kind `{0}`")]
    DuplicateHandler(MessageKind),

    #[error("unknown message kind `{0}`")]
    UnknownMessageKind(MessageKind),
}

/// Registration record for one message kind.
pub struct HandlerDescriptor {
    kind: MessageKind,
    isolation: Isolation,
    factory: Box<HandlerFactory>,
    shared_instance: OnceLock<Arc<dyn MessageHandler>>,
}

impl HandlerDescriptor {
    pub fn new<F>(kind: MessageKind, isolation: Isolation, factory: F) -> Self
    where
        F: Fn(&ExecutionScope) -> Result<Arc<dyn MessageHandler>, ScopeError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            kind,
            isolation,
            factory: Box::new(factory),
            shared_instance: OnceLock::new(),
        }
    }

    /// Handler built from a fresh scope for every message.
    pub fn per_message<F>(kind: MessageKind, factory: F) -> Self
    where
        F: Fn(&ExecutionScope) -> Result<Arc<dyn MessageHandler>, ScopeError>
            + Send
            + Sync
            + 'static,
    {
        Self::new(kind, Isolation::PerMessage, factory)
    }

    /// Handler built once from the shared scope and reused by every worker.
    pub fn shared<F>(kind: MessageKind, factory: F) -> Self
    where
        F: Fn(&ExecutionScope) -> Result<Arc<dyn MessageHandler>, ScopeError>
            + Send
            + Sync
            + 'static,
    {
        Self::new(kind, Isolation::Shared, factory)
    }

    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    pub fn isolation(&self) -> Isolation {
        self.isolation
    }

    /// Resolve the handler instance for a dispatch running against `scope`.
    pub fn instantiate(
        &self,
        scope: &ExecutionScope,
    ) -> Result<Arc<dyn MessageHandler>, ScopeError> {
        match self.isolation {
            Isolation::PerMessage => (self.factory)(scope),
            Isolation::Shared => {
                if let Some(handler) = self.shared_instance.get() {
                    return Ok(Arc::clone(handler));
                }
                // Two workers may race to build it; the first one stored wins.
                let built = (self.factory)(scope)?;
                Ok(Arc::clone(self.shared_instance.get_or_init(|| built)))
            }
        }
    }
}

impl fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("kind", &self.kind)
            .field("isolation", &self.isolation)
            .field("instantiated", &self.shared_instance.get().is_some())
            .finish()
    }
}

/// Static mapping from message kind to handler descriptor.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    descriptors: HashMap<MessageKind, Arc<HandlerDescriptor>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor under its kind. Never overwrites an existing entry.
    pub fn register(
        &mut self,
        descriptor: HandlerDescriptor,
    ) -> Result<Arc<HandlerDescriptor>, RegistryError> {
        if self.descriptors.contains_key(descriptor.kind()) {
            return Err(RegistryError::DuplicateHandler(descriptor.kind().clone()));
        }
        let descriptor = Arc::new(descriptor);
        self.descriptors
            .insert(descriptor.kind().clone(), Arc::clone(&descriptor));
        Ok(descriptor)
    }

    /// Builder-style registration for startup wiring.
    pub fn with(mut self, descriptor: HandlerDescriptor) -> Result<Self, RegistryError> {
        self.register(descriptor)?;
        Ok(self)
    }

    pub fn resolve(&self, kind: &MessageKind) -> Result<Arc<HandlerDescriptor>, RegistryError> {
        self.descriptors
            .get(kind)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownMessageKind(kind.clone()))
    }

    pub fn kinds(&self) -> impl Iterator<Item = &MessageKind> {
        self.descriptors.keys()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use courier_messaging::Message;
    use proptest::prelude::*;
    use tokio_util::sync::CancellationToken;

    use crate::handler::HandlerError;

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

    fn kind(tag: &str) -> MessageKind {
        MessageKind::new(tag).unwrap()
    }

    fn noop(tag: &str, isolation: Isolation) -> HandlerDescriptor {
        HandlerDescriptor::new(kind(tag), isolation, |_| Ok(Arc::new(Noop)))
    }

    #[test]
    fn duplicate_registration_fails_and_keeps_original() {
        let mut registry = HandlerRegistry::new();
        let original = registry
            .register(noop("order.created", Isolation::PerMessage))
            .unwrap();

        let err = registry
            .register(noop("order.created", Isolation::Shared))
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateHandler(kind("order.created")));

        let resolved = registry.resolve(&kind("order.created")).unwrap();
        assert!(Arc::ptr_eq(&resolved, &original));
        assert_eq!(resolved.isolation(), Isolation::PerMessage);
    }

    #[test]
    fn unknown_kind_fails_to_resolve() {
        let registry = HandlerRegistry::new()
            .with(noop("a", Isolation::Shared))
            .unwrap();
        assert_eq!(
            registry.resolve(&kind("b")).unwrap_err(),
            RegistryError::UnknownMessageKind(kind("b"))
        );
    }

    #[test]
    fn shared_handlers_are_built_once() {
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = builds.clone();
        let descriptor = HandlerDescriptor::shared(kind("s"), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Noop))
        });

        let scope = ExecutionScope::new(Isolation::Shared);
        let a = descriptor.instantiate(&scope).unwrap();
        let b = descriptor.instantiate(&scope).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn per_message_handlers_are_built_every_time() {
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = builds.clone();
        let descriptor = HandlerDescriptor::per_message(kind("p"), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Noop))
        });

        let scope = ExecutionScope::new(Isolation::PerMessage);
        descriptor.instantiate(&scope).unwrap();
        descriptor.instantiate(&scope).unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }

    proptest! {
        /// Property: every registered kind resolves to exactly the stored
        /// descriptor, and re-registering any of them is rejected.
        #[test]
        fn resolve_returns_registered_descriptor(
            tags in prop::collection::hash_set("[a-z]{1,12}", 1..20)
        ) {
            let mut registry = HandlerRegistry::new();
            let mut stored = Vec::new();
            for tag in &tags {
                stored.push(registry.register(noop(tag, Isolation::PerMessage)).unwrap());
            }

            for descriptor in &stored {
                let resolved = registry.resolve(descriptor.kind()).unwrap();
                prop_assert!(Arc::ptr_eq(&resolved, descriptor));

                let dup = registry.register(noop(descriptor.kind().as_str(), Isolation::Shared));
                prop_assert!(matches!(dup, Err(RegistryError::DuplicateHandler(_))));
                let still = registry.resolve(descriptor.kind()).unwrap();
                prop_assert!(Arc::ptr_eq(&still, descriptor));
            }
            prop_assert_eq!(registry.len(), tags.len());
        }
    }
}

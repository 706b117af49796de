//! Per-invocation context shared by the controller, supervisor and sweeper.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use devbox_core::Operation;
use devbox_store::{DevboxConfig, EntityLock, LockKey, Outcome, Store};

use crate::allocator::PortAllocator;
use crate::clock::{Clock, SystemClock};
use crate::error::{ControlError, During, ErrorKind, Result};
use crate::usage::{self, Invocation};

/// Everything one invocation needs: the store, the configuration loaded for
/// this invocation, a clock, and the invocation's identity.
pub struct Context<S: Store> {
    store: Arc<S>,
    config: Arc<DevboxConfig>,
    clock: Arc<dyn Clock>,
    invocation: Invocation,
    lock_wait: Option<Duration>,
}

impl<S: Store> Clone for Context<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: Arc::clone(&self.config),
            clock: Arc::clone(&self.clock),
            invocation: self.invocation.clone(),
            lock_wait: self.lock_wait,
        }
    }
}

impl<S: Store> fmt::Debug for Context<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("root", &self.store.root())
            .field("invocation", &self.invocation)
            .finish_non_exhaustive()
    }
}

impl<S: Store + 'static> Context<S> {
    /// Create a context.
    #[must_use]
    pub fn new(
        store: Arc<S>,
        config: DevboxConfig,
        clock: Arc<dyn Clock>,
        invocation: Invocation,
    ) -> Self {
        Self {
            store,
            config: Arc::new(config),
            clock,
            invocation,
            lock_wait: None,
        }
    }

    /// Create a context on the system clock, with the actor taken from the
    /// configuration.
    #[must_use]
    pub fn with_defaults(store: Arc<S>, config: DevboxConfig) -> Self {
        let invocation = Invocation::from_config(&config);
        Self::new(store, config, Arc::new(SystemClock), invocation)
    }

    /// The same context, with lock waits capped at `wait` instead of the
    /// store's bound.
    #[must_use]
    pub fn with_lock_wait(&self, wait: Duration) -> Self {
        Self {
            lock_wait: Some(wait),
            ..self.clone()
        }
    }

    /// Get a reference to the store.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &DevboxConfig {
        &self.config
    }

    /// Get the invocation identity.
    #[must_use]
    pub const fn invocation(&self) -> &Invocation {
        &self.invocation
    }

    /// The current time on this context's clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// An allocator over the configured port ranges.
    #[must_use]
    pub fn allocator(&self) -> PortAllocator {
        PortAllocator::new(self.config.ports.clone())
    }

    /// Acquire an entity lock without blocking the async runtime.
    ///
    /// # Errors
    ///
    /// Returns `ErrorKind::Busy` if the lock stays held past the configured
    /// bound, or past this context's lock wait when one is set.
    pub async fn lock(
        &self,
        key: LockKey,
        operation: Operation,
        entity: impl fmt::Display,
    ) -> Result<EntityLock> {
        let store = Arc::clone(&self.store);
        let wait = self.lock_wait;
        tokio::task::spawn_blocking(move || match wait {
            Some(wait) => store.lock_within(key, wait),
            None => store.lock(key),
        })
            .await
            .map_err(|err| {
                ControlError::new(operation, &entity, ErrorKind::Storage(err.to_string()))
            })?
            .during(operation, entity)
    }

    /// Append a usage event for this invocation.
    pub fn record(
        &self,
        operation: Operation,
        entity: impl fmt::Display,
        outcome: Outcome,
        detail: Option<String>,
    ) {
        usage::record(
            self.store.as_ref(),
            self.clock.as_ref(),
            &self.invocation,
            operation,
            &entity.to_string(),
            outcome,
            detail,
        );
    }
}

//! Module registry: deferred registration callbacks applied once at bring-up.
//!
//! Feature modules contribute to a target they never see at construction time
//! (typically the server's route table). Each module calls [`Registry::register`]
//! with a named callback; the server calls [`Registry::drain_and_apply`]
//! exactly once, which applies every callback in registration order and closes
//! the registry. Registering after that is a programming error reported as
//! [`RegistryError::Closed`].

use std::fmt;
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, error, info};

/// Errors returned by [`Registry`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The registry was already drained.
    #[error("registry closed: cannot register '{name}' after the server started")]
    Closed { name: String },
}

type Apply<T> = Box<dyn FnOnce(&mut T) + Send>;

struct Entry<T> {
    name: String,
    apply: Apply<T>,
}

/// Append-only, drain-once collection of registration callbacks for `T`.
pub struct Registry<T> {
    /// `None` once drained.
    entries: Mutex<Option<Vec<Entry<T>>>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("pending", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Some(Vec::new())),
        }
    }

    /// Queue `apply` to run against the target when the registry is drained.
    pub fn register<F>(&self, name: impl Into<String>, apply: F) -> Result<(), RegistryError>
    where
        F: FnOnce(&mut T) + Send + 'static,
    {
        let name = name.into();
        let mut guard = self.lock();
        match guard.as_mut() {
            Some(entries) => {
                debug!(module = %name, position = entries.len(), "module registered");
                entries.push(Entry {
                    name,
                    apply: Box::new(apply),
                });
                Ok(())
            }
            None => {
                error!(module = %name, "registration after drain");
                Err(RegistryError::Closed { name })
            }
        }
    }

    /// Apply every registered callback to `target`, in order, and close the registry.
    ///
    /// Returns how many entries were applied.
    pub fn drain_and_apply(&self, target: &mut T) -> Result<usize, RegistryError> {
        // Take the entries out before applying so callbacks never run under the lock.
        let entries = self.lock().take().ok_or_else(|| RegistryError::Closed {
            name: "<drain>".to_string(),
        })?;
        let count = entries.len();
        for entry in entries {
            debug!(module = %entry.name, "applying module");
            (entry.apply)(target);
        }
        info!(modules = count, "registry drained");
        Ok(count)
    }

    /// Number of entries waiting to be applied (0 once closed).
    pub fn len(&self) -> usize {
        self.lock().as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Vec<Entry<T>>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

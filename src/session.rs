//! Instantiated models, by host-chosen id.
//!
//! Instantiation is asynchronous, so a handle exists in the registry from
//! the moment `instantiateModel` starts. Calls naming a handle that is still
//! being built wait for it; calls naming an unknown or disposed handle fail
//! immediately.
//!
//! Disposing a handle whose model is still being built removes it right
//! away; the model is disposed as soon as it finishes instantiating.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use crate::model::InstantiatedModel;

/// Shared reference to a live model.
pub type ModelHandle = Arc<dyn InstantiatedModel>;

#[derive(Clone)]
enum HandleState {
    Pending,
    Ready(ModelHandle),
    Gone,
}

struct Entry {
    generation: u64,
    state: watch::Sender<HandleState>,
}

#[derive(Default)]
struct Inner {
    handles: HashMap<String, Entry>,
    next_generation: u64,
}

/// Registry of instantiated models.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve `id` for a model about to be instantiated.
    ///
    /// Returns `None` if the id is already in use.
    pub fn begin(&self, id: &str) -> Option<Instantiation> {
        let mut inner = self.inner();
        if inner.handles.contains_key(id) {
            return None;
        }

        let generation = inner.next_generation;
        inner.next_generation += 1;
        let (state, _) = watch::channel(HandleState::Pending);
        inner
            .handles
            .insert(id.to_string(), Entry { generation, state });

        Some(Instantiation {
            registry: self.clone(),
            id: id.to_string(),
            generation,
            finished: false,
        })
    }

    /// The model behind `id`, waiting while it is still being built.
    ///
    /// The handle is looked up when this is called, not when the future is
    /// first polled: a ready model stays reachable through the returned
    /// future even if it is disposed before then.
    ///
    /// `None` if the id is unknown, was disposed, or failed to instantiate.
    pub fn lookup(&self, id: &str) -> impl Future<Output = Option<ModelHandle>> + Send + 'static {
        let found = self
            .inner()
            .handles
            .get(id)
            .map(|entry| (entry.state.borrow().clone(), entry.state.subscribe()));

        async move {
            let (current, mut rx) = found?;
            if let HandleState::Ready(model) = current {
                return Some(model);
            }
            loop {
                let state = rx.borrow_and_update().clone();
                match state {
                    HandleState::Ready(model) => return Some(model),
                    HandleState::Gone => return None,
                    HandleState::Pending => {}
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        }
    }

    /// Remove `id` immediately, disposing its model if it is ready.
    ///
    /// A model still being built is disposed by its [`Instantiation`] on
    /// completion. Returns `false` if the id was unknown.
    pub fn dispose(&self, id: &str) -> bool {
        let entry = match self.inner().handles.remove(id) {
            Some(entry) => entry,
            None => return false,
        };

        if let HandleState::Ready(model) = entry.state.send_replace(HandleState::Gone) {
            dispose_model(id, model.as_ref());
        }
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner().handles.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner().handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A reserved handle whose model is being built.
///
/// Dropping it without calling [`complete`](Self::complete) removes the
/// handle and wakes anyone waiting on it.
pub struct Instantiation {
    registry: SessionRegistry,
    id: String,
    generation: u64,
    finished: bool,
}

impl Instantiation {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Publish the built model.
    ///
    /// Returns `false` if the handle was disposed in the meantime; the model
    /// is then disposed right here.
    pub fn complete(mut self, model: Box<dyn InstantiatedModel>) -> bool {
        self.finished = true;
        let model: ModelHandle = Arc::from(model);

        {
            let inner = self.registry.inner();
            if let Some(entry) = inner.handles.get(&self.id) {
                if entry.generation == self.generation {
                    entry.state.send_replace(HandleState::Ready(model));
                    return true;
                }
            }
        }

        tracing::debug!(id = %self.id, "Model instantiated after dispose; disposing it");
        dispose_model(&self.id, model.as_ref());
        false
    }

    /// Give up on this handle.
    pub fn fail(self) {}
}

impl Drop for Instantiation {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        let mut inner = self.registry.inner();
        let current = inner
            .handles
            .get(&self.id)
            .is_some_and(|entry| entry.generation == self.generation);
        if current {
            if let Some(entry) = inner.handles.remove(&self.id) {
                entry.state.send_replace(HandleState::Gone);
            }
        }
    }
}

/// Run model `dispose`, keeping a panic inside it from unwinding further.
fn dispose_model(id: &str, model: &dyn InstantiatedModel) {
    if std::panic::catch_unwind(AssertUnwindSafe(|| model.dispose())).is_err() {
        tracing::warn!(id = %id, "Model panicked while disposing");
    }
}

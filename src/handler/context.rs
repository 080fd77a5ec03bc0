//! Call context for method handlers.
//!
//! A [`CallContext`] carries everything one control call may touch: the
//! call's correlation id, the host channel, the loaders built for this call
//! and the state shared by all calls (loaded model, instantiated models,
//! training sessions).

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::watch;

use crate::error::CallError;
use crate::host::HostChannel;
use crate::loader::{CallScope, LoaderFactory};
use crate::model::{Model, ModelLoader};
use crate::session::{ModelHandle, SessionRegistry};
use crate::training::TrainingSessions;

/// Default cap on exception details sent to the host, in characters.
pub const DEFAULT_MAX_ERROR_DETAILS: usize = 10_000;

/// What a successful handler hands back: the `result` object plus any
/// attachments that follow it in the reply frame.
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome {
    pub result: Value,
    pub attachments: Vec<Bytes>,
}

impl CallOutcome {
    pub fn new(result: Value) -> Self {
        Self {
            result,
            attachments: Vec::new(),
        }
    }

    /// `{}` with no attachments.
    pub fn empty() -> Self {
        Self::new(Value::Object(Default::default()))
    }

    pub fn with_attachments(mut self, attachments: Vec<Bytes>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// The loaded model, and how many `initialize` loads are still running.
struct ModelSlot {
    model: Option<Arc<dyn Model>>,
    loading: usize,
}

/// State shared by every call of one runtime.
pub struct RuntimeState {
    model: Arc<watch::Sender<ModelSlot>>,
    loader: Option<Arc<dyn ModelLoader>>,
    sessions: SessionRegistry,
    trainings: TrainingSessions,
    read_ahead: usize,
    max_error_details: usize,
}

impl RuntimeState {
    pub fn new(
        model: Option<Arc<dyn Model>>,
        loader: Option<Arc<dyn ModelLoader>>,
        read_ahead: usize,
        max_error_details: usize,
    ) -> Self {
        let (slot, _) = watch::channel(ModelSlot { model, loading: 0 });
        Self {
            model: Arc::new(slot),
            loader,
            sessions: SessionRegistry::new(),
            trainings: TrainingSessions::new(),
            read_ahead,
            max_error_details,
        }
    }

    /// The most recently loaded model, if any.
    pub fn model(&self) -> Option<Arc<dyn Model>> {
        self.model.borrow().model.clone()
    }

    /// The model calls dispatched now should use.
    ///
    /// Resolves at once unless an `initialize` is loading a model, in which
    /// case it waits for every running load to finish.
    pub(crate) fn current_model(
        &self,
    ) -> impl Future<Output = Option<Arc<dyn Model>>> + Send + 'static {
        let mut rx = self.model.subscribe();
        let settled = {
            let slot = rx.borrow_and_update();
            (slot.loading == 0).then(|| slot.model.clone())
        };

        async move {
            if let Some(model) = settled {
                return model;
            }
            loop {
                if rx.changed().await.is_err() {
                    return None;
                }
                let settled = {
                    let slot = rx.borrow_and_update();
                    (slot.loading == 0).then(|| slot.model.clone())
                };
                if let Some(model) = settled {
                    return model;
                }
            }
        }
    }

    /// Mark a model load as running until the ticket is dropped.
    pub(crate) fn begin_model_load(&self) -> ModelLoad {
        self.model.send_modify(|slot| slot.loading += 1);
        ModelLoad {
            slot: self.model.clone(),
            model: None,
        }
    }

    pub(crate) fn loader(&self) -> Option<Arc<dyn ModelLoader>> {
        self.loader.clone()
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn trainings(&self) -> &TrainingSessions {
        &self.trainings
    }

    #[inline]
    pub fn max_error_details(&self) -> usize {
        self.max_error_details
    }
}

/// A model load in progress. Dropping it without [`finish`](Self::finish)
/// keeps the previous model.
pub(crate) struct ModelLoad {
    slot: Arc<watch::Sender<ModelSlot>>,
    model: Option<Arc<dyn Model>>,
}

impl ModelLoad {
    /// Install the loaded model.
    pub(crate) fn finish(mut self, model: Arc<dyn Model>) {
        self.model = Some(model);
    }
}

impl Drop for ModelLoad {
    fn drop(&mut self) {
        let loaded = self.model.take();
        self.slot.send_modify(|slot| {
            slot.loading -= 1;
            if let Some(model) = loaded {
                slot.model = Some(model);
            }
        });
    }
}

/// Context passed to method handlers.
#[derive(Clone)]
pub struct CallContext {
    call_id: Option<Value>,
    host: HostChannel,
    scope: CallScope,
    state: Arc<RuntimeState>,
}

impl CallContext {
    pub fn new(
        call_id: Option<Value>,
        host: HostChannel,
        scope: CallScope,
        state: Arc<RuntimeState>,
    ) -> Self {
        Self {
            call_id,
            host,
            scope,
            state,
        }
    }

    /// The `params.id` of a correlated call, echoed in its reply.
    #[inline]
    pub fn call_id(&self) -> Option<&Value> {
        self.call_id.as_ref()
    }

    #[inline]
    pub fn host(&self) -> &HostChannel {
        &self.host
    }

    #[inline]
    pub fn state(&self) -> &RuntimeState {
        &self.state
    }

    /// Loader factory bound to this call's scope.
    pub fn loaders(&self) -> LoaderFactory {
        LoaderFactory::new(self.host.clone(), self.scope.clone(), self.state.read_ahead)
    }

    /// The loaded model, as of this call's dispatch.
    pub fn model(
        &self,
    ) -> impl Future<Output = Result<Arc<dyn Model>, CallError>> + Send + 'static {
        let model = self.state.current_model();
        async move { model.await.ok_or(CallError::NotInitialized) }
    }

    /// The instantiated model `id`, waiting if it is still being built.
    ///
    /// The handle is resolved against the registry as of this call.
    pub fn instantiated(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<ModelHandle, CallError>> + Send + 'static {
        let lookup = self.state.sessions.lookup(id);
        let id = id.to_string();
        async move { lookup.await.ok_or(CallError::ModelNotFound(id)) }
    }

    /// Resolve `path` through the configured loader, on the blocking pool.
    pub(crate) async fn load_model(&self, path: String) -> Result<Arc<dyn Model>, CallError> {
        let loader = match self.state.loader() {
            Some(loader) => loader,
            None => return Err(CallError::NotInitialized),
        };

        match tokio::task::spawn_blocking(move || loader.load(Path::new(&path))).await {
            Ok(Ok(model)) => Ok(model),
            Ok(Err(e)) => Err(CallError::Exception(format!("{:#}", e))),
            Err(e) if e.is_panic() => Err(CallError::Exception(panic_message(e.into_panic()))),
            Err(e) => Err(CallError::Exception(e.to_string())),
        }
    }
}

/// Run model code, turning its errors and panics into [`CallError::Exception`].
pub async fn user_code<T, F>(fut: F) -> Result<T, CallError>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(CallError::Exception(format!("{:#}", e))),
        Err(panic) => Err(CallError::Exception(panic_message(panic))),
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

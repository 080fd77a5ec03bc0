//! Training sessions and the tracker model code reports through.
//!
//! Each `train` call opens a session keyed by the host's training-session
//! id. While the session is active the model can report progress and
//! metrics; `cancelTrain` flips it to cancelled and fires the registered
//! callbacks. Cancellation is advisory: nothing is interrupted, model code
//! decides when to stop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use serde::Serialize;

use crate::error::TrackerError;
use crate::host::HostChannel;
use crate::model::Tensor;

/// Lifecycle of a training session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingStatus {
    Active,
    Cancelled,
    Completed,
}

impl TrainingStatus {
    fn as_str(self) -> &'static str {
        match self {
            TrainingStatus::Active => "active",
            TrainingStatus::Cancelled => "cancelled",
            TrainingStatus::Completed => "completed",
        }
    }
}

type CancelCallback = Box<dyn FnOnce() + Send + 'static>;

struct SessionState {
    status: TrainingStatus,
    on_cancel: Vec<CancelCallback>,
}

struct Session {
    id: String,
    state: Mutex<SessionState>,
}

impl Session {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Flip to cancelled and run callbacks outside the lock, in order.
    fn cancel(&self) {
        let callbacks = {
            let mut state = self.state();
            if state.status != TrainingStatus::Active {
                return;
            }
            state.status = TrainingStatus::Cancelled;
            std::mem::take(&mut state.on_cancel)
        };

        for callback in callbacks {
            callback();
        }
    }

    fn complete(&self) {
        let mut state = self.state();
        state.status = TrainingStatus::Completed;
        state.on_cancel.clear();
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProgressParams<'a> {
    training_session_id: &'a str,
    progress: f64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MetricsParams<'a> {
    training_session_id: &'a str,
    names: Vec<String>,
}

/// Handle given to [`InstantiatedModel::train`](crate::model::InstantiatedModel::train).
#[derive(Clone)]
pub struct TrainTracker {
    session: Arc<Session>,
    host: HostChannel,
}

impl TrainTracker {
    /// The host's training-session id.
    pub fn id(&self) -> &str {
        &self.session.id
    }

    pub fn status(&self) -> TrainingStatus {
        self.session.state().status
    }

    pub fn is_cancelled(&self) -> bool {
        self.status() == TrainingStatus::Cancelled
    }

    /// Run `callback` when the host cancels this session.
    ///
    /// Runs immediately if the session is already cancelled; never runs if
    /// it has completed.
    pub fn on_cancel<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.session.state();
        match state.status {
            TrainingStatus::Active => state.on_cancel.push(Box::new(callback)),
            TrainingStatus::Cancelled => {
                drop(state);
                callback();
            }
            TrainingStatus::Completed => {}
        }
    }

    /// Report progress, usually a fraction or percentage.
    pub async fn progress(&self, progress: f64) -> Result<(), TrackerError> {
        self.ensure_active("progress")?;
        if !progress.is_finite() {
            return Err(TrackerError::InvalidArgument(format!(
                "progress must be a finite number, got {}",
                progress
            )));
        }

        let params = ProgressParams {
            training_session_id: self.id(),
            progress,
        };
        self.host.emit("trainingProgress", &params, Vec::new()).await?;
        Ok(())
    }

    /// Report named metric tensors. An empty list sends nothing.
    pub async fn metrics(&self, metrics: Vec<(String, Tensor)>) -> Result<(), TrackerError> {
        self.ensure_active("metrics")?;
        if metrics.is_empty() {
            return Ok(());
        }

        let (names, values): (Vec<String>, Vec<Bytes>) = metrics
            .into_iter()
            .map(|(name, tensor)| (name, tensor.into_bytes()))
            .unzip();

        let params = MetricsParams {
            training_session_id: self.id(),
            names,
        };
        self.host.emit("trainingMetrics", &params, values).await?;
        Ok(())
    }

    fn ensure_active(&self, what: &'static str) -> Result<(), TrackerError> {
        let status = self.status();
        if status == TrainingStatus::Active {
            Ok(())
        } else {
            Err(TrackerError::NotActive {
                what,
                session: self.session.id.clone(),
                status: status.as_str(),
            })
        }
    }
}

impl std::fmt::Debug for TrainTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainTracker")
            .field("id", &self.session.id)
            .field("status", &self.status())
            .finish()
    }
}

/// Training sessions currently running, by id.
#[derive(Clone, Default)]
pub struct TrainingSessions {
    sessions: Arc<Mutex<HashMap<String, Arc<Session>>>>,
}

impl TrainingSessions {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a session. Returns `None` if `id` is already running.
    pub fn start(&self, id: &str, host: HostChannel) -> Option<ActiveTraining> {
        let mut sessions = self.sessions();
        if sessions.contains_key(id) {
            return None;
        }

        let session = Arc::new(Session {
            id: id.to_string(),
            state: Mutex::new(SessionState {
                status: TrainingStatus::Active,
                on_cancel: Vec::new(),
            }),
        });
        sessions.insert(id.to_string(), session.clone());

        Some(ActiveTraining {
            tracker: TrainTracker { session, host },
            sessions: self.clone(),
        })
    }

    /// Cancel the session `id`. Returns `false` if no such session runs.
    pub fn cancel(&self, id: &str) -> bool {
        let session = self.sessions().get(id).cloned();
        match session {
            Some(session) => {
                session.cancel();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A registered session. Dropping it completes the session and removes it
/// from the map.
pub struct ActiveTraining {
    tracker: TrainTracker,
    sessions: TrainingSessions,
}

impl ActiveTraining {
    pub fn tracker(&self) -> &TrainTracker {
        &self.tracker
    }
}

impl Drop for ActiveTraining {
    fn drop(&mut self) {
        self.tracker.session.complete();
        let mut sessions = self.sessions.sessions();
        if let Some(current) = sessions.get(self.tracker.id()) {
            if Arc::ptr_eq(current, &self.tracker.session) {
                sessions.remove(self.tracker.id());
            }
        }
    }
}

//! The capability contract model code implements.
//!
//! A [`Model`] knows how to build initial state and how to instantiate
//! itself from state. An [`InstantiatedModel`] evaluates, trains, exports
//! its state and is disposed when the host is done with it. Both traits are
//! object safe so the runtime can hold them as `Arc<dyn ...>`.
//!
//! Model code reports failure through `anyhow::Error`; the runtime turns
//! those (and panics) into `exception` error results for the host.
//!
//! # Example
//!
//! ```ignore
//! use modelwire::model::{EvaluateOutput, InstantiatedModel, Model, Tensor};
//!
//! struct Identity;
//!
//! #[async_trait::async_trait]
//! impl InstantiatedModel for Identity {
//!     async fn evaluate(&self, mut data: DataLoaderMap) -> anyhow::Result<Vec<EvaluateOutput>> {
//!         let input = data.get_mut("input").unwrap();
//!         let all = input.next(input.remaining()).await?;
//!         Ok(vec![EvaluateOutput::new("output", all)])
//!     }
//!     // ...
//! }
//! ```

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::loader::{DataLoaderMap, StateLoaderMap, StateProvider};
use crate::training::TrainTracker;

/// A serialized tensor. The encoding is opaque to the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Tensor(Bytes);

impl Tensor {
    /// Wrap serialized tensor bytes.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Borrow the serialized bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Take the serialized bytes.
    #[inline]
    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    /// Serialized size in bytes.
    #[inline]
    pub fn byte_size(&self) -> usize {
        self.0.len()
    }
}

impl From<Bytes> for Tensor {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl From<Vec<u8>> for Tensor {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Bytes::from(bytes))
    }
}

/// One named output of [`InstantiatedModel::evaluate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluateOutput {
    pub name: String,
    pub data: Vec<Tensor>,
}

impl EvaluateOutput {
    pub fn new(name: impl Into<String>, data: Vec<Tensor>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

/// Entry points of a loaded model.
#[async_trait]
pub trait Model: Send + Sync + 'static {
    /// Build initial state from the given data and push it through `provider`.
    async fn create_model_state(
        &self,
        data: DataLoaderMap,
        provider: StateProvider,
    ) -> anyhow::Result<()>;

    /// Create a live instance from previously provided state.
    async fn instantiate_model(
        &self,
        state: StateLoaderMap,
    ) -> anyhow::Result<Box<dyn InstantiatedModel>>;
}

/// A live model instance owned by the session registry.
#[async_trait]
pub trait InstantiatedModel: Send + Sync + 'static {
    /// Run the model over `data`.
    async fn evaluate(&self, data: DataLoaderMap) -> anyhow::Result<Vec<EvaluateOutput>>;

    /// Train on `data`, reporting through `tracker`.
    async fn train(&self, data: DataLoaderMap, tracker: TrainTracker) -> anyhow::Result<()>;

    /// Export the current state through `provider`.
    async fn get_model_state(&self, provider: StateProvider) -> anyhow::Result<()>;

    /// Release resources. Called at most once, when the host disposes the
    /// instance (or when it finishes instantiating after a dispose request).
    fn dispose(&self) {}
}

/// Resolves the path passed to `initialize` into a model.
///
/// Loading code from disk is up to the embedding binary; the runtime only
/// calls this hook.
pub trait ModelLoader: Send + Sync + 'static {
    fn load(&self, path: &Path) -> anyhow::Result<Arc<dyn Model>>;
}

impl<F> ModelLoader for F
where
    F: Fn(&Path) -> anyhow::Result<Arc<dyn Model>> + Send + Sync + 'static,
{
    fn load(&self, path: &Path) -> anyhow::Result<Arc<dyn Model>> {
        self(path)
    }
}

//! # modelwire
//!
//! Subprocess-side runtime for serving model code to a host orchestrator.
//!
//! The host spawns this process, hands it a socket path in `IPC_PATH` and
//! drives it with control calls (create state, instantiate, train, evaluate,
//! fetch state, dispose, cancel). Model code implements the [`Model`] and
//! [`InstantiatedModel`] traits; the runtime pulls their inputs from the
//! host on demand and pushes outputs back.
//!
//! ## Architecture
//!
//! - **Control frames**: JSON call or reply in segment 0, raw attachments after it
//! - **Data chunks**: answers to "need data" requests, matched by request id
//! - One reader, one writer task, one task per control call
//!
//! ## Example
//!
//! ```ignore
//! use modelwire::RuntimeBuilder;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     RuntimeBuilder::new()
//!         .model(MyModel::default())
//!         .connect_env()
//!         .await?
//!         .run()
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod handler;
pub mod host;
pub mod loader;
pub mod model;
pub mod pending;
pub mod protocol;
pub mod session;
pub mod training;
pub mod transport;
pub mod writer;

mod runtime;

#[cfg(test)]
mod test_support;

pub use error::{CallError, LoaderError, RuntimeError, TrackerError};
pub use loader::{DataLoader, DataLoaderMap, StateLoader, StateLoaderMap, StateProvider};
pub use model::{EvaluateOutput, InstantiatedModel, Model, ModelLoader, Tensor};
pub use runtime::{Runtime, RuntimeBuilder, DEFAULT_READ_AHEAD};
pub use training::{TrainTracker, TrainingStatus};

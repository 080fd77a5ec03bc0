//! Echo Model - the smallest useful model.
//!
//! This example demonstrates:
//! - Implementing `Model` and `InstantiatedModel`
//! - Pulling records with a data loader and returning them as outputs
//! - Reporting training progress and honouring cancellation
//!
//! The host starts this binary with `IPC_PATH` set to its socket. Logs go
//! to stderr; set `RUST_LOG=debug` to see protocol details.

use async_trait::async_trait;
use modelwire::{
    DataLoaderMap, EvaluateOutput, InstantiatedModel, Model, RuntimeBuilder, StateLoaderMap,
    StateProvider, TrackerError, TrainTracker,
};
use tracing_subscriber::EnvFilter;

struct Echo;

#[async_trait]
impl Model for Echo {
    async fn create_model_state(
        &self,
        _data: DataLoaderMap,
        _provider: StateProvider,
    ) -> anyhow::Result<()> {
        // Nothing to learn.
        Ok(())
    }

    async fn instantiate_model(
        &self,
        _state: StateLoaderMap,
    ) -> anyhow::Result<Box<dyn InstantiatedModel>> {
        Ok(Box::new(Echo))
    }
}

#[async_trait]
impl InstantiatedModel for Echo {
    async fn evaluate(&self, mut data: DataLoaderMap) -> anyhow::Result<Vec<EvaluateOutput>> {
        let names: Vec<String> = data.names().map(str::to_owned).collect();
        let mut outputs = Vec::with_capacity(names.len());

        for name in names {
            if let Some(loader) = data.get_mut(&name) {
                let records = loader.next(loader.remaining()).await?;
                outputs.push(EvaluateOutput::new(name, records));
            }
        }
        Ok(outputs)
    }

    async fn train(&self, mut data: DataLoaderMap, tracker: TrainTracker) -> anyhow::Result<()> {
        let Some(loader) = data.get_mut("input") else {
            anyhow::bail!("train needs an \"input\" data loader");
        };

        let total = loader.size().max(1);
        while loader.has_next(1) && !tracker.is_cancelled() {
            loader.next(1).await?;
            match tracker
                .progress(loader.position() as f64 / total as f64)
                .await
            {
                Ok(()) => {}
                // Cancelled between the check and the report.
                Err(TrackerError::NotActive { .. }) => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn get_model_state(&self, _provider: StateProvider) -> anyhow::Result<()> {
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    RuntimeBuilder::new()
        .model(Echo)
        .connect_env()
        .await?
        .run()
        .await?;

    Ok(())
}

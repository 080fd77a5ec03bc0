//! Linear Model - a trainable model with state.
//!
//! This example demonstrates:
//! - Building initial state and exporting it with a state provider
//! - Instantiating from state blobs
//! - Shuffling paired loaders together with `shuffle_in_group`
//! - Reporting progress and loss metrics during training
//!
//! Tensors are little-endian `f32` scalars. The model fits `y = w * x + b`
//! with plain stochastic gradient descent.

use std::sync::Mutex;

use async_trait::async_trait;
use modelwire::{
    DataLoaderMap, EvaluateOutput, InstantiatedModel, Model, RuntimeBuilder, StateLoaderMap,
    StateProvider, Tensor, TrackerError, TrainTracker,
};
use tracing_subscriber::EnvFilter;

const LEARNING_RATE: f32 = 0.01;
const BATCH: usize = 16;

fn to_f32(tensor: &Tensor) -> anyhow::Result<f32> {
    let bytes: [u8; 4] = tensor
        .as_bytes()
        .try_into()
        .map_err(|_| anyhow::anyhow!("expected a 4-byte f32, got {} bytes", tensor.byte_size()))?;
    Ok(f32::from_le_bytes(bytes))
}

fn from_f32(value: f32) -> Tensor {
    Tensor::from(value.to_le_bytes().to_vec())
}

#[derive(Debug, Clone, Copy, Default)]
struct Weights {
    w: f32,
    b: f32,
}

impl Weights {
    fn encode(self) -> Vec<u8> {
        [self.w.to_le_bytes(), self.b.to_le_bytes()].concat()
    }

    fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        anyhow::ensure!(bytes.len() == 8, "weights must be 8 bytes, got {}", bytes.len());
        Ok(Self {
            w: f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            b: f32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        })
    }
}

struct Linear;

#[async_trait]
impl Model for Linear {
    async fn create_model_state(
        &self,
        _data: DataLoaderMap,
        provider: StateProvider,
    ) -> anyhow::Result<()> {
        provider
            .provide("weights", Weights::default().encode())
            .await?;
        Ok(())
    }

    async fn instantiate_model(
        &self,
        state: StateLoaderMap,
    ) -> anyhow::Result<Box<dyn InstantiatedModel>> {
        let blob = state
            .get("weights")
            .ok_or_else(|| anyhow::anyhow!("state has no \"weights\""))?
            .read()
            .await?;
        Ok(Box::new(LinearInstance {
            weights: Mutex::new(Weights::decode(&blob)?),
        }))
    }
}

struct LinearInstance {
    weights: Mutex<Weights>,
}

impl LinearInstance {
    fn weights(&self) -> Weights {
        *self.weights.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl InstantiatedModel for LinearInstance {
    async fn evaluate(&self, mut data: DataLoaderMap) -> anyhow::Result<Vec<EvaluateOutput>> {
        let x = data
            .get_mut("x")
            .ok_or_else(|| anyhow::anyhow!("evaluate needs an \"x\" data loader"))?;
        let Weights { w, b } = self.weights();

        let mut ys = Vec::with_capacity(x.size());
        while x.has_next(1) {
            let batch = x.next(BATCH.min(x.remaining())).await?;
            for tensor in &batch {
                ys.push(from_f32(w * to_f32(tensor)? + b));
            }
        }
        Ok(vec![EvaluateOutput::new("y", ys)])
    }

    async fn train(&self, mut data: DataLoaderMap, tracker: TrainTracker) -> anyhow::Result<()> {
        data.shuffle_in_group(&["x", "y"])?;
        let mut x = data
            .remove("x")
            .ok_or_else(|| anyhow::anyhow!("train needs an \"x\" data loader"))?;
        let mut y = data
            .remove("y")
            .ok_or_else(|| anyhow::anyhow!("train needs a \"y\" data loader"))?;
        anyhow::ensure!(x.size() == y.size(), "x and y differ in size");

        let total = x.size().max(1);
        while x.has_next(1) && !tracker.is_cancelled() {
            let amount = BATCH.min(x.remaining());
            let xs = x.next(amount).await?;
            let ys = y.next(amount).await?;

            let mut loss = 0.0;
            let mut weights = self.weights();
            for (xt, yt) in xs.iter().zip(&ys) {
                let (xv, yv) = (to_f32(xt)?, to_f32(yt)?);
                let err = weights.w * xv + weights.b - yv;
                weights.w -= LEARNING_RATE * err * xv;
                weights.b -= LEARNING_RATE * err;
                loss += err * err;
            }
            *self.weights.lock().unwrap_or_else(|e| e.into_inner()) = weights;

            let reported = async {
                tracker
                    .metrics(vec![("loss".to_string(), from_f32(loss / amount as f32))])
                    .await?;
                tracker.progress(x.position() as f64 / total as f64).await
            };
            match reported.await {
                Ok(()) => {}
                Err(TrackerError::NotActive { .. }) => break,
                Err(e) => return Err(e.into()),
            }
        }

        if tracker.is_cancelled() {
            tracing::info!(session = tracker.id(), "Training cancelled");
        }
        Ok(())
    }

    async fn get_model_state(&self, provider: StateProvider) -> anyhow::Result<()> {
        provider.provide("weights", self.weights().encode()).await?;
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
        .model(Linear)
        .read_ahead(BATCH)
        .connect_env()
        .await?
        .run()
        .await?;

    Ok(())
}

//! The control methods the host can call.

use std::future::{ready, Future, Ready};

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::context::user_code;
use super::{CallContext, CallKind, CallOutcome, CallResult, MethodTable};
use crate::error::CallError;
use crate::loader::{DataParam, StateKeyParam};
use crate::model::EvaluateOutput;

#[derive(Debug, Deserialize)]
pub struct InitializeParams {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateModelStateParams {
    #[serde(rename = "params")]
    pub data: Vec<DataParam>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstantiateModelParams {
    pub instantiated_model_id: String,
    pub state: Vec<StateKeyParam>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisposeParams {
    pub instantiated_model_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainParams {
    pub training_session_id: String,
    pub instantiated_model_id: String,
    #[serde(rename = "params")]
    pub data: Vec<DataParam>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelTrainParams {
    pub training_session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateParams {
    pub instantiated_model_id: String,
    #[serde(rename = "params")]
    pub data: Vec<DataParam>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetModelStateParams {
    pub instantiated_model_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutputDescription<'a> {
    name: &'a str,
    byte_sizes: Vec<usize>,
}

/// Table with every control method registered.
pub fn method_table() -> MethodTable {
    let mut table = MethodTable::new();
    table.register("initialize", CallKind::OneWay, initialize);
    table.register("createModelState", CallKind::Correlated, create_model_state);
    table.register("instantiateModel", CallKind::Correlated, instantiate_model);
    table.register("disposeInstantiatedModel", CallKind::OneWay, dispose_instantiated_model);
    table.register("train", CallKind::Correlated, train);
    table.register("cancelTrain", CallKind::OneWay, cancel_train);
    table.register("evaluate", CallKind::Correlated, evaluate);
    table.register("getModelState", CallKind::Correlated, get_model_state);
    table
}

// Each handler does its registry work before returning its future, so it
// takes effect in the order the host sent the calls.

/// Load the model at `path` and report the outcome as an event.
fn initialize(
    params: InitializeParams,
    ctx: CallContext,
) -> impl Future<Output = CallResult> + Send + 'static {
    let load = ctx.state().loader().map(|_| ctx.state().begin_model_load());

    async move {
        let loaded = match load {
            Some(load) => ctx.load_model(params.path).await.map(|model| load.finish(model)),
            None if ctx.state().model().is_some() => Ok(()),
            None => Err(CallError::NotInitialized),
        };

        let event = match &loaded {
            Ok(()) => json!({}),
            Err(e) => {
                tracing::warn!("Model initialization failed: {}", e);
                e.to_result(ctx.state().max_error_details())
            }
        };
        if let Err(e) = ctx.host().emit("modelSessionInitialized", &event, Vec::new()).await {
            tracing::debug!("Could not report initialization: {}", e);
        }

        Ok(CallOutcome::empty())
    }
}

fn create_model_state(
    params: CreateModelStateParams,
    ctx: CallContext,
) -> impl Future<Output = CallResult> + Send + 'static {
    let model = ctx.model();

    async move {
        let model = model.await?;
        let loaders = ctx.loaders();
        let data = loaders.data_loaders(&params.data);
        let provider = loaders.state_provider(ctx.call_id().cloned().unwrap_or_default());

        user_code(model.create_model_state(data, provider)).await?;
        Ok(CallOutcome::empty())
    }
}

fn instantiate_model(
    params: InstantiateModelParams,
    ctx: CallContext,
) -> impl Future<Output = CallResult> + Send + 'static {
    let model = ctx.model();
    let id = params.instantiated_model_id;
    let ticket = ctx.state().sessions().begin(&id);

    async move {
        let ticket = ticket.ok_or_else(|| {
            CallError::InvalidArguments(format!(
                "instantiated model id {:?} is already in use",
                id
            ))
        })?;
        let model = model.await?;

        let state = ctx.loaders().state_loaders(&params.state);
        let instance = user_code(model.instantiate_model(state)).await?;
        if !ticket.complete(instance) {
            tracing::debug!(id = %id, "Instantiated model was disposed while instantiating");
        }
        Ok(CallOutcome::empty())
    }
}

fn dispose_instantiated_model(params: DisposeParams, ctx: CallContext) -> Ready<CallResult> {
    if !ctx.state().sessions().dispose(&params.instantiated_model_id) {
        tracing::debug!(
            id = %params.instantiated_model_id,
            "Dispose requested for unknown instantiated model"
        );
    }
    ready(Ok(CallOutcome::empty()))
}

fn train(
    params: TrainParams,
    ctx: CallContext,
) -> impl Future<Output = CallResult> + Send + 'static {
    let session_id = params.training_session_id;
    let active = ctx.state().trainings().start(&session_id, ctx.host().clone());
    let model = ctx.instantiated(&params.instantiated_model_id);

    async move {
        let active = active.ok_or_else(|| {
            CallError::InvalidArguments(format!(
                "training session {:?} is already running",
                session_id
            ))
        })?;
        let model = model.await?;
        let data = ctx.loaders().data_loaders(&params.data);

        user_code(model.train(data, active.tracker().clone())).await?;
        Ok(CallOutcome::empty())
    }
}

fn cancel_train(params: CancelTrainParams, ctx: CallContext) -> Ready<CallResult> {
    if !ctx.state().trainings().cancel(&params.training_session_id) {
        tracing::debug!(
            session = %params.training_session_id,
            "Cancel requested for unknown training session"
        );
    }
    ready(Ok(CallOutcome::empty()))
}

/// Evaluate and send every output tensor back in one attachment.
fn evaluate(
    params: EvaluateParams,
    ctx: CallContext,
) -> impl Future<Output = CallResult> + Send + 'static {
    let model = ctx.instantiated(&params.instantiated_model_id);

    async move {
        let model = model.await?;
        let data = ctx.loaders().data_loaders(&params.data);
        let outputs = user_code(model.evaluate(data)).await?;
        Ok(pack_outputs(&outputs))
    }
}

/// One attachment with every tensor, and the sizes to split it by.
fn pack_outputs(outputs: &[EvaluateOutput]) -> CallOutcome {
    let total = outputs
        .iter()
        .flat_map(|o| o.data.iter())
        .map(|t| t.byte_size())
        .sum();
    let mut blob = BytesMut::with_capacity(total);
    let mut descriptions = Vec::with_capacity(outputs.len());
    for output in outputs {
        let mut byte_sizes = Vec::with_capacity(output.data.len());
        for tensor in &output.data {
            blob.extend_from_slice(tensor.as_bytes());
            byte_sizes.push(tensor.byte_size());
        }
        descriptions.push(OutputDescription {
            name: &output.name,
            byte_sizes,
        });
    }

    let result = json!({ "outputs": descriptions });
    CallOutcome::new(result).with_attachments(vec![blob.freeze()])
}

fn get_model_state(
    params: GetModelStateParams,
    ctx: CallContext,
) -> impl Future<Output = CallResult> + Send + 'static {
    let model = ctx.instantiated(&params.instantiated_model_id);

    async move {
        let model = model.await?;
        let provider = ctx
            .loaders()
            .state_provider(ctx.call_id().cloned().unwrap_or_default());

        user_code(model.get_model_state(provider)).await?;
        Ok(CallOutcome::empty())
    }
}

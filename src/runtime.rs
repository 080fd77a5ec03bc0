//! Runtime builder and dispatch loop.
//!
//! The [`RuntimeBuilder`] collects the model (or a loader for it) and the
//! tuning knobs; the [`Runtime`] owns the connection:
//! 1. Connect to the host socket (`IPC_PATH`) or take a given stream
//! 2. Spawn the writer task
//! 3. Read frames one at a time, spawning a task per control call and
//!    routing data chunks to the pending-request table
//! 4. Stop when the host closes the stream or the writer fails
//!
//! # Example
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

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::{JoinError, JoinHandle, JoinSet};

use crate::error::{CallError, Result, RuntimeError};
use crate::handler::{
    method_table, BoxFuture, CallContext, CallKind, CallResult, MethodTable, RuntimeState,
    DEFAULT_MAX_ERROR_DETAILS,
};
use crate::host::HostChannel;
use crate::loader::CallScope;
use crate::model::{Model, ModelLoader};
use crate::pending::PendingRequests;
use crate::protocol::{Frame, FrameReader};
use crate::transport::{self, SocketReader};
use crate::writer::{spawn_writer_task, WriterConfig};

/// Default number of records a data loader fetches beyond what is asked.
pub const DEFAULT_READ_AHEAD: usize = 0;

/// Builder for configuring and creating a [`Runtime`].
pub struct RuntimeBuilder {
    model: Option<Arc<dyn Model>>,
    loader: Option<Arc<dyn ModelLoader>>,
    writer_config: WriterConfig,
    read_ahead: usize,
    max_error_details: usize,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            model: None,
            loader: None,
            writer_config: WriterConfig::default(),
            read_ahead: DEFAULT_READ_AHEAD,
            max_error_details: DEFAULT_MAX_ERROR_DETAILS,
        }
    }

    /// Serve a model known up front. `initialize` then just reports success.
    pub fn model<M: Model>(self, model: M) -> Self {
        self.shared_model(Arc::new(model))
    }

    /// Like [`model`](Self::model), for a model that is already shared.
    pub fn shared_model(mut self, model: Arc<dyn Model>) -> Self {
        self.model = Some(model);
        self
    }

    /// Resolve the path sent with `initialize` into a model.
    pub fn loader<L: ModelLoader>(mut self, loader: L) -> Self {
        self.loader = Some(Arc::new(loader));
        self
    }

    /// Set the writer channel capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.writer_config.channel_capacity = capacity;
        self
    }

    /// Records a data loader fetches beyond what `next` asks for.
    ///
    /// Default: 0
    pub fn read_ahead(mut self, records: usize) -> Self {
        self.read_ahead = records;
        self
    }

    /// Cap on exception details sent to the host, in characters.
    ///
    /// Default: 10 000
    pub fn max_error_details(mut self, chars: usize) -> Self {
        self.max_error_details = chars;
        self
    }

    /// Connect to the socket named by `IPC_PATH`.
    pub async fn connect_env(self) -> Result<Runtime<SocketReader>> {
        let path = transport::socket_path_from_env()?;
        self.connect(path).await
    }

    /// Connect to the host socket at `path`.
    pub async fn connect(self, path: impl AsRef<Path>) -> Result<Runtime<SocketReader>> {
        let (reader, writer) = transport::connect(path.as_ref()).await?.into_split();
        Ok(self.serve(reader, writer))
    }

    /// Run over an already connected stream.
    ///
    /// Must be called inside a Tokio runtime; the writer task starts here.
    pub fn serve<R, W>(self, reader: R, writer: W) -> Runtime<R>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (writer, writer_task) = spawn_writer_task(writer, self.writer_config);
        let state = RuntimeState::new(
            self.model,
            self.loader,
            self.read_ahead,
            self.max_error_details,
        );

        Runtime {
            reader: FrameReader::new(reader),
            dispatcher: Dispatcher {
                table: method_table(),
                state: Arc::new(state),
                host: HostChannel::new(writer, PendingRequests::new()),
            },
            writer_task,
        }
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A connected runtime. Call [`run`](Self::run) to serve the host.
pub struct Runtime<R> {
    reader: FrameReader<R>,
    dispatcher: Dispatcher,
    writer_task: JoinHandle<Result<()>>,
}

impl<R> Runtime<R>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    /// State shared by all calls.
    pub fn state(&self) -> &Arc<RuntimeState> {
        &self.dispatcher.state
    }

    /// Serve control calls until the host closes the stream.
    ///
    /// Returns [`RuntimeError::Transport`] if writing to the host fails.
    /// Calls still running when this returns are aborted.
    pub async fn run(self) -> Result<()> {
        let Runtime {
            mut reader,
            dispatcher,
            mut writer_task,
        } = self;
        let mut tasks = JoinSet::new();

        let result = {
            let read_loop = dispatcher.read_loop(&mut reader, &mut tasks);
            tokio::pin!(read_loop);

            tokio::select! {
                res = &mut read_loop => res,
                res = &mut writer_task => writer_exit(res),
            }
        };

        tasks.shutdown().await;
        dispatcher.host.pending().close_all();
        result
    }
}

fn writer_exit(res: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    match res {
        Ok(res) => res,
        Err(e) => Err(RuntimeError::Transport(std::io::Error::new(
            std::io::ErrorKind::Other,
            e,
        ))),
    }
}

/// Routes decoded frames: control calls to the method table, data chunks
/// to the pending-request table.
struct Dispatcher {
    table: MethodTable,
    state: Arc<RuntimeState>,
    host: HostChannel,
}

impl Dispatcher {
    async fn read_loop<R>(
        &self,
        reader: &mut FrameReader<R>,
        tasks: &mut JoinSet<()>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            while let Some(done) = tasks.try_join_next() {
                if let Err(e) = done {
                    if e.is_panic() {
                        tracing::error!("Call task panicked: {}", e);
                    }
                }
            }

            match reader.read_frame().await {
                Ok(Some(frame)) => self.dispatch_frame(frame, tasks),
                Ok(None) | Err(RuntimeError::ConnectionClosed) => {
                    tracing::debug!("Host closed the connection");
                    return Ok(());
                }
                Err(RuntimeError::Protocol(msg)) => {
                    tracing::warn!("Skipping malformed frame: {}", msg);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn dispatch_frame(&self, frame: Frame, tasks: &mut JoinSet<()>) {
        match frame {
            Frame::DataChunk {
                request_id,
                segments,
            } => {
                if let Err(e) = self.host.pending().resolve(request_id, segments) {
                    tracing::warn!("Dropping data chunk: {}", e);
                }
            }
            Frame::Control { segments } => {
                let message: Value = match segments.first().map(|s| serde_json::from_slice(s)) {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        tracing::warn!("Malformed control message: {}", e);
                        return;
                    }
                    None => {
                        tracing::warn!("Control frame without segments");
                        return;
                    }
                };
                self.spawn_call(message, tasks);
            }
        }
    }

    fn spawn_call(&self, mut message: Value, tasks: &mut JoinSet<()>) {
        let method = message
            .get("method")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let params = message
            .get_mut("params")
            .map(Value::take)
            .unwrap_or(Value::Null);
        let kind = method
            .as_deref()
            .and_then(|m| self.table.kind(m))
            .unwrap_or(CallKind::Correlated);
        let call_id = match kind {
            CallKind::Correlated => params.get("id").cloned(),
            CallKind::OneWay => None,
        };

        let scope = CallScope::new();
        let ctx = CallContext::new(
            call_id.clone(),
            self.host.clone(),
            scope.clone(),
            self.state.clone(),
        );
        let host = self.host.clone();
        let max_details = self.state.max_error_details();

        // Registry changes happen here, in frame order; only the rest of
        // the call runs on its own task.
        let name = method.unwrap_or_default();
        let call: BoxFuture<'static, CallResult> = if name.is_empty() {
            Box::pin(std::future::ready(Err(CallError::InvalidArguments(
                "control message has no method".to_string(),
            ))))
        } else {
            self.table.dispatch(&name, params, ctx)
        };

        tasks.spawn(async move {
            let result = call.await;
            scope.complete();

            finish_call(&host, &name, kind, call_id, result, max_details).await;
        });
    }
}

/// Reply to a correlated call, or just log the outcome of any other.
async fn finish_call(
    host: &HostChannel,
    method: &str,
    kind: CallKind,
    call_id: Option<Value>,
    result: CallResult,
    max_details: usize,
) {
    if let Err(e) = &result {
        tracing::warn!(method = %method, "Call failed: {}", e);
    }

    let id = match (kind, call_id) {
        (CallKind::OneWay, _) => return,
        (CallKind::Correlated, None) => {
            tracing::debug!(method = %method, "Dropping reply to call without id");
            return;
        }
        (CallKind::Correlated, Some(id)) => id,
    };

    let (result, attachments) = match result {
        Ok(outcome) => (outcome.result, outcome.attachments),
        Err(e) => (e.to_result(max_details), Vec::new()),
    };
    if let Err(e) = host.reply(&id, &result, attachments).await {
        tracing::debug!(method = %method, "Could not send reply: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{build_control_frame, build_data_chunk_frame};
    use tokio::io::{duplex, AsyncWriteExt};

    #[test]
    fn test_builder_defaults() {
        let builder = RuntimeBuilder::default();

        assert!(builder.model.is_none());
        assert!(builder.loader.is_none());
        assert_eq!(builder.read_ahead, DEFAULT_READ_AHEAD);
        assert_eq!(builder.max_error_details, DEFAULT_MAX_ERROR_DETAILS);
    }

    #[test]
    fn test_builder_configuration() {
        let builder = RuntimeBuilder::new()
            .channel_capacity(16)
            .read_ahead(32)
            .max_error_details(100);

        assert_eq!(builder.writer_config.channel_capacity, 16);
        assert_eq!(builder.read_ahead, 32);
        assert_eq!(builder.max_error_details, 100);
    }

    #[tokio::test]
    async fn test_run_ends_when_host_closes() {
        let (client, server) = duplex(4096);
        let (reader, writer) = tokio::io::split(client);
        let runtime = RuntimeBuilder::new().serve(reader, writer);

        drop(server);
        runtime.run().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_connect_env_serves_until_hangup() {
        use tokio::net::UnixListener;

        let path = std::env::temp_dir().join(format!(
            "modelwire-runtime-{}.sock",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).unwrap();
        std::env::set_var(transport::IPC_PATH_ENV, &path);

        let host = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let runtime = RuntimeBuilder::new().connect_env().await.unwrap();
        host.await.unwrap();
        runtime.run().await.unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_bad_frames_do_not_stop_the_loop() {
        let (client, mut server) = duplex(4096);
        let (reader, writer) = tokio::io::split(client);
        let runtime = RuntimeBuilder::new().serve(reader, writer);
        let run = tokio::spawn(runtime.run());

        // Unknown request id, then JSON that does not parse.
        server
            .write_all(&build_data_chunk_frame(99, &[b"x"]))
            .await
            .unwrap();
        server
            .write_all(&build_control_frame(&[b"not json".as_slice()]))
            .await
            .unwrap();
        drop(server);

        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_writer_failure_is_fatal() {
        struct Broken;

        impl AsyncWrite for Broken {
            fn poll_write(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                _buf: &[u8],
            ) -> std::task::Poll<std::io::Result<usize>> {
                std::task::Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
            }

            fn poll_flush(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                std::task::Poll::Ready(Ok(()))
            }

            fn poll_shutdown(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                std::task::Poll::Ready(Ok(()))
            }
        }

        let (client, mut server) = duplex(4096);
        let runtime = RuntimeBuilder::new().serve(client, Broken);
        let run = tokio::spawn(runtime.run());

        // Any correlated call produces a reply, which the writer cannot write.
        server
            .write_all(&build_control_frame(&[
                br#"{"method":"nope","params":{"id":1}}"#.as_slice(),
            ]))
            .await
            .unwrap();

        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(err, RuntimeError::Transport(_)));
    }
}

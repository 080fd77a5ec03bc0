//! Outbound side of a call: events and on-demand reads.
//!
//! [`HostChannel`] bundles the writer handle with the pending-request table
//! so loaders, providers and trackers can talk to the host without knowing
//! about frames.

use bytes::Bytes;
use serde::Serialize;

use crate::error::{LoaderError, Result};
use crate::pending::PendingRequests;
use crate::writer::{OutboundFrame, WriterHandle};

/// What a "need data" request asks the host for.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum ReadRequest<'a> {
    /// Records of a data loader, by index, in this order.
    #[serde(rename = "readData")]
    Data {
        #[serde(rename = "dataId")]
        data_id: &'a str,
        indices: &'a [u32],
    },
    /// A whole state blob.
    #[serde(rename = "readState")]
    State {
        #[serde(rename = "dataId")]
        data_id: &'a str,
    },
}

#[derive(Serialize)]
struct ReadEnvelope<'a> {
    #[serde(flatten)]
    request: &'a ReadRequest<'a>,
    #[serde(rename = "requestId")]
    request_id: u32,
}

#[derive(Serialize)]
struct EventEnvelope<'a, P> {
    event: &'a str,
    params: &'a P,
}

#[derive(Serialize)]
struct ReplyEnvelope<'a> {
    id: &'a serde_json::Value,
    result: &'a serde_json::Value,
}

/// Writer + pending table, cheaply cloneable.
#[derive(Clone)]
pub struct HostChannel {
    writer: WriterHandle,
    pending: PendingRequests,
}

impl HostChannel {
    pub fn new(writer: WriterHandle, pending: PendingRequests) -> Self {
        Self { writer, pending }
    }

    /// The underlying writer handle.
    #[inline]
    pub fn writer(&self) -> &WriterHandle {
        &self.writer
    }

    /// The pending-request table reads are registered in.
    #[inline]
    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    /// Send a control-frame event `{"event": name, "params": params}`.
    pub async fn emit<P: Serialize>(
        &self,
        event: &str,
        params: &P,
        attachments: Vec<Bytes>,
    ) -> Result<()> {
        let json = serde_json::to_vec(&EventEnvelope { event, params })?;
        self.writer
            .send(OutboundFrame::control(Bytes::from(json), attachments))
            .await
    }

    /// Send the reply `{"id": id, "result": result}` to a correlated call.
    pub async fn reply(
        &self,
        id: &serde_json::Value,
        result: &serde_json::Value,
        attachments: Vec<Bytes>,
    ) -> Result<()> {
        let json = serde_json::to_vec(&ReplyEnvelope { id, result })?;
        self.writer
            .send(OutboundFrame::control(Bytes::from(json), attachments))
            .await
    }

    /// Ask the host for data and wait for the matching data-chunk frame.
    ///
    /// The slot is registered before the request goes out, so an answer can
    /// never race ahead of its registration.
    pub async fn read(&self, request: &ReadRequest<'_>) -> std::result::Result<Vec<Bytes>, LoaderError> {
        let pending = self.pending.register();
        let json = serde_json::to_vec(&ReadEnvelope {
            request,
            request_id: pending.id(),
        })
        .map_err(|e| LoaderError::Protocol(e.to_string()))?;

        self.writer
            .send(OutboundFrame::data_request(Bytes::from(json)))
            .await?;

        Ok(pending.wait().await?)
    }
}

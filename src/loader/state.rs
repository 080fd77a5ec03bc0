//! State blobs: pulled whole from the host, pushed whole to it.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use serde::Serialize;

use super::CallScope;
use crate::error::LoaderError;
use crate::host::{HostChannel, ReadRequest};

/// Reads one state blob on demand.
pub struct StateLoader {
    host: HostChannel,
    scope: CallScope,
    data_id: String,
    byte_size: u64,
}

/// State loaders of one call, by key.
pub type StateLoaderMap = HashMap<String, StateLoader>;

impl StateLoader {
    pub(crate) fn new(host: HostChannel, scope: CallScope, data_id: String, byte_size: u64) -> Self {
        Self {
            host,
            scope,
            data_id,
            byte_size,
        }
    }

    /// Size of the blob as announced by the host.
    #[inline]
    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    /// Fetch the whole blob.
    ///
    /// A blob the host splits over several segments is joined back together.
    pub async fn read(&self) -> Result<Bytes, LoaderError> {
        if self.scope.is_complete() {
            return Err(LoaderError::CallCompleted);
        }

        let mut segments = self
            .host
            .read(&ReadRequest::State {
                data_id: &self.data_id,
            })
            .await?;

        if segments.len() == 1 {
            return Ok(segments.remove(0));
        }

        let total = segments.iter().map(Bytes::len).sum();
        let mut blob = BytesMut::with_capacity(total);
        for segment in segments {
            blob.extend_from_slice(&segment);
        }
        Ok(blob.freeze())
    }
}

impl std::fmt::Debug for StateLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateLoader")
            .field("data_id", &self.data_id)
            .field("byte_size", &self.byte_size)
            .finish()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProvideStateParams<'a> {
    command_id: &'a serde_json::Value,
    names: Vec<&'a str>,
}

/// Pushes state blobs to the host, tagged with the call's id.
///
/// Nothing is acknowledged; the host considers the state complete when the
/// surrounding call replies.
#[derive(Clone)]
pub struct StateProvider {
    host: HostChannel,
    scope: CallScope,
    command_id: serde_json::Value,
}

impl StateProvider {
    pub(crate) fn new(host: HostChannel, scope: CallScope, command_id: serde_json::Value) -> Self {
        Self {
            host,
            scope,
            command_id,
        }
    }

    /// Provide one blob under `key`.
    pub async fn provide(&self, key: &str, data: impl Into<Bytes>) -> Result<(), LoaderError> {
        self.send(vec![key], vec![data.into()]).await
    }

    /// Provide several blobs in one event.
    pub async fn provide_all<K, D>(&self, entries: Vec<(K, D)>) -> Result<(), LoaderError>
    where
        K: AsRef<str>,
        D: Into<Bytes>,
    {
        if entries.is_empty() {
            return Ok(());
        }

        let (keys, blobs): (Vec<K>, Vec<Bytes>) =
            entries.into_iter().map(|(k, d)| (k, d.into())).unzip();
        let names = keys.iter().map(|k| k.as_ref()).collect();
        self.send(names, blobs).await
    }

    async fn send(&self, names: Vec<&str>, blobs: Vec<Bytes>) -> Result<(), LoaderError> {
        if self.scope.is_complete() {
            return Err(LoaderError::CallCompleted);
        }

        let params = ProvideStateParams {
            command_id: &self.command_id,
            names,
        };
        self.host.emit("provideStateData", &params, blobs).await?;
        Ok(())
    }
}

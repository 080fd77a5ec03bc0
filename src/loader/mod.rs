//! Loaders and providers handed to model code during a call.
//!
//! - [`DataLoader`] - lazy, positionable, shuffleable record stream
//! - [`StateLoader`] - pulls one state blob from the host
//! - [`StateProvider`] - pushes state blobs to the host
//!
//! Everything created for a call shares that call's [`CallScope`]. Once the
//! call returns, the scope is complete and further reads or provides fail
//! with [`LoaderError::CallCompleted`](crate::error::LoaderError::CallCompleted).

mod data;
mod state;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Deserialize;

pub use data::{DataLoader, DataLoaderMap};
pub use state::{StateLoader, StateLoaderMap, StateProvider};

use crate::host::HostChannel;

/// Completion flag shared by everything created for one control call.
#[derive(Debug, Clone, Default)]
pub struct CallScope {
    completed: Arc<AtomicBool>,
}

impl CallScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the owning call as returned.
    pub fn complete(&self) {
        self.completed.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }
}

/// Host description of one data loader.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataParam {
    /// Name model code looks the loader up by.
    pub name: String,
    /// Opaque id echoed back in read requests.
    pub data_id: String,
    /// Number of records.
    pub amount: u32,
    pub total_byte_size: u64,
}

/// Host description of one state blob.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateKeyParam {
    pub key: String,
    /// Opaque id echoed back in read requests.
    pub data_id: String,
    pub byte_size: u64,
}

/// Builds loaders for one call.
#[derive(Clone)]
pub struct LoaderFactory {
    host: HostChannel,
    scope: CallScope,
    read_ahead: usize,
}

impl LoaderFactory {
    pub fn new(host: HostChannel, scope: CallScope, read_ahead: usize) -> Self {
        Self {
            host,
            scope,
            read_ahead,
        }
    }

    /// One data loader per parameter, keyed by name.
    pub fn data_loaders(&self, params: &[DataParam]) -> DataLoaderMap {
        params
            .iter()
            .map(|p| {
                let loader = DataLoader::new(
                    self.host.clone(),
                    self.scope.clone(),
                    p.data_id.clone(),
                    p.amount,
                    p.total_byte_size,
                    self.read_ahead,
                );
                (p.name.clone(), loader)
            })
            .collect()
    }

    /// One state loader per key.
    pub fn state_loaders(&self, params: &[StateKeyParam]) -> StateLoaderMap {
        params
            .iter()
            .map(|p| {
                let loader = StateLoader::new(
                    self.host.clone(),
                    self.scope.clone(),
                    p.data_id.clone(),
                    p.byte_size,
                );
                (p.key.clone(), loader)
            })
            .collect::<HashMap<_, _>>()
    }

    /// A provider whose events carry `command_id`.
    pub fn state_provider(&self, command_id: serde_json::Value) -> StateProvider {
        StateProvider::new(self.host.clone(), self.scope.clone(), command_id)
    }

    #[inline]
    pub fn scope(&self) -> &CallScope {
        &self.scope
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_scope_shared() {
        let scope = CallScope::new();
        let clone = scope.clone();
        assert!(!clone.is_complete());

        scope.complete();
        assert!(clone.is_complete());
    }

    #[test]
    fn test_data_param_deserialize() {
        let param: DataParam = serde_json::from_str(
            r#"{"name":"input","dataId":"abc","amount":10,"totalByteSize":400}"#,
        )
        .unwrap();
        assert_eq!(param.name, "input");
        assert_eq!(param.data_id, "abc");
        assert_eq!(param.amount, 10);
        assert_eq!(param.total_byte_size, 400);
    }

    #[test]
    fn test_state_key_param_deserialize() {
        let param: StateKeyParam =
            serde_json::from_str(r#"{"key":"weights","dataId":"s1","byteSize":12}"#).unwrap();
        assert_eq!(param.key, "weights");
        assert_eq!(param.byte_size, 12);
    }
}

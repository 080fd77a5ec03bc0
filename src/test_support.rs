//! In-process stand-in for the host side of the socket (tests only).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Notify;

use crate::host::HostChannel;
use crate::pending::PendingRequests;
use crate::writer::spawn_writer_task_default;

/// Marker event [`FakeHost::settle`] sends behind everything else.
const SETTLE_EVENT: &str = "fakeHostSettle";

#[derive(Default)]
struct Settle {
    sent: AtomicUsize,
    seen: AtomicUsize,
    notify: Notify,
}

/// Records what the subprocess sent and answers data requests.
pub(crate) struct FakeHost {
    pub host: HostChannel,
    pub pending: PendingRequests,
    pub requests: Arc<Mutex<Vec<Value>>>,
    pub events: Arc<Mutex<Vec<(Value, Vec<Bytes>)>>>,
    settle: Arc<Settle>,
}

impl FakeHost {
    /// Answer `readData` with one `r<index>` segment per index and
    /// `readState` with `state:<dataId>`.
    pub fn spawn() -> Self {
        Self::spawn_with(default_answer)
    }

    pub fn spawn_with<F>(answer: F) -> Self
    where
        F: Fn(&Value) -> Vec<Bytes> + Send + 'static,
    {
        let (client, server) = tokio::io::duplex(1 << 16);
        let (writer, _task) = spawn_writer_task_default(client);
        let pending = PendingRequests::new();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let events = Arc::new(Mutex::new(Vec::new()));
        let settle = Arc::new(Settle::default());

        tokio::spawn(host_loop(
            server,
            pending.clone(),
            requests.clone(),
            events.clone(),
            settle.clone(),
            answer,
        ));

        Self {
            host: HostChannel::new(writer, pending.clone()),
            pending,
            requests,
            events,
            settle,
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn events(&self) -> Vec<(Value, Vec<Bytes>)> {
        self.events.lock().unwrap().clone()
    }

    /// Wait until everything sent so far has reached the host.
    ///
    /// The writer keeps frames in order, so once a marker sent now is
    /// recorded, so is every frame queued before it.
    pub async fn settle(&self) {
        let target = self.settle.sent.fetch_add(1, Ordering::SeqCst) + 1;
        self.host
            .emit(SETTLE_EVENT, &Value::Null, Vec::new())
            .await
            .unwrap();

        let caught_up = async {
            loop {
                let notified = self.settle.notify.notified();
                if self.settle.seen.load(Ordering::SeqCst) >= target {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), caught_up)
            .await
            .expect("host never saw the settle marker");
    }
}

pub(crate) fn default_answer(request: &Value) -> Vec<Bytes> {
    match request["type"].as_str() {
        Some("readData") => request["indices"]
            .as_array()
            .unwrap()
            .iter()
            .map(|i| Bytes::from(format!("r{}", i.as_u64().unwrap())))
            .collect(),
        Some("readState") => vec![Bytes::from(format!(
            "state:{}",
            request["dataId"].as_str().unwrap()
        ))],
        other => panic!("unexpected request type {:?}", other),
    }
}

async fn host_loop<R, F>(
    mut server: R,
    pending: PendingRequests,
    requests: Arc<Mutex<Vec<Value>>>,
    events: Arc<Mutex<Vec<(Value, Vec<Bytes>)>>>,
    settle: Arc<Settle>,
    answer: F,
) where
    R: AsyncRead + Unpin,
    F: Fn(&Value) -> Vec<Bytes>,
{
    loop {
        let tag = match server.read_u8().await {
            Ok(tag) => tag,
            Err(_) => return,
        };

        if tag == 0 {
            let count = server.read_u32().await.unwrap() as usize + 1;
            let mut segments = Vec::with_capacity(count);
            for _ in 0..count {
                segments.push(read_segment(&mut server).await);
            }
            assert_eq!(server.read_u8().await.unwrap(), 0);

            let json: Value = serde_json::from_slice(&segments[0]).unwrap();
            if json["event"] == SETTLE_EVENT {
                settle.seen.fetch_add(1, Ordering::SeqCst);
                settle.notify.notify_waiters();
                continue;
            }
            events.lock().unwrap().push((json, segments.split_off(1)));
        } else {
            let body = read_segment(&mut server).await;
            let json: Value = serde_json::from_slice(&body).unwrap();
            let id = json["requestId"].as_u64().unwrap() as u32;
            let segments = answer(&json);
            requests.lock().unwrap().push(json);
            let _ = pending.resolve(id, segments);
        }
    }
}

async fn read_segment<R: AsyncRead + Unpin>(server: &mut R) -> Bytes {
    let len = server.read_u64().await.unwrap() as usize;
    let mut buf = vec![0u8; len];
    server.read_exact(&mut buf).await.unwrap();
    Bytes::from(buf)
}

//! Bounded request dispatch with deadlines and hooks.
//!
//! Each request is enqueued onto a bounded queue and picked up by a
//! worker task; when the queue is full, enqueueing blocks the caller,
//! which is the gateway's admission-control pressure point. The caller
//! races the worker's reply against the request deadline and returns a
//! synthetic 499 when the deadline wins.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::object::DerivedObject;
use crate::processor::plugins::HookRegistry;
use crate::processor::{Coordinator, RequestMeta};
use crate::response::{Response, status_client_closed};

struct QueueMessage {
    meta: RequestMeta,
    obj: DerivedObject,
    reply: oneshot::Sender<Response>,
    cancel: CancellationToken,
    deadline: Instant,
}

/// Front door of the gateway: deadlines, queueing, hooks.
pub struct Dispatcher {
    coordinator: Arc<Coordinator>,
    hooks: HookRegistry,
    queue_tx: mpsc::Sender<QueueMessage>,
    queue_rx: Arc<Mutex<mpsc::Receiver<QueueMessage>>>,
    process_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        coordinator: Arc<Coordinator>,
        hooks: HookRegistry,
        queue_len: usize,
        process_timeout: Duration,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(queue_len.max(1));
        Self {
            coordinator,
            hooks,
            queue_tx,
            queue_rx: Arc::new(Mutex::new(queue_rx)),
            process_timeout,
        }
    }

    /// Run one request through the coordinator.
    ///
    /// Establishes the request deadline, runs pre-process hooks, enqueues
    /// the work and waits for the reply. A deadline elapse cancels the
    /// worker's reply and yields a synthetic 499 (with the placeholder
    /// treatment when one applies).
    pub async fn dispatch(&self, meta: RequestMeta, obj: DerivedObject) -> Response {
        let deadline = Instant::now() + self.process_timeout;
        self.hooks.pre_process(&obj, &meta);

        let (reply_tx, reply_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let msg = QueueMessage {
            meta: meta.clone(),
            obj: obj.clone(),
            reply: reply_tx,
            cancel: cancel.clone(),
            deadline,
        };

        self.spawn_worker();
        if self.queue_tx.send(msg).await.is_err() {
            return Response::error(
                http::StatusCode::SERVICE_UNAVAILABLE,
                "dispatch queue closed",
            );
        }

        let mut res = tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                cancel.cancel();
                warn!(key = %obj.key, "process timeout");
                self.coordinator
                    .reply_with_error(&obj, status_client_closed(), "context cancelled")
                    .await
            }
            received = reply_rx => match received {
                Ok(res) => res,
                Err(_) => {
                    // The worker dropped the reply without sending.
                    self.coordinator
                        .reply_with_error(&obj, status_client_closed(), "request abandoned")
                        .await
                }
            }
        };

        self.hooks.post_process(&obj, &meta, &mut res);
        res
    }

    /// One worker task per dispatched request; each pops one message from
    /// the shared queue, so bursts drain in arrival order while the queue
    /// bound provides backpressure.
    fn spawn_worker(&self) {
        let coordinator = self.coordinator.clone();
        let queue_rx = self.queue_rx.clone();
        tokio::spawn(async move {
            let msg = { queue_rx.lock().await.recv().await };
            let Some(msg) = msg else {
                return;
            };
            let res = coordinator.process(&msg.meta, &msg.obj, msg.deadline).await;
            if msg.cancel.is_cancelled() {
                debug!(key = %msg.obj.key, "dropping result for cancelled request");
                return;
            }
            let _ = msg.reply.send(res);
        });
    }

    /// The underlying coordinator, for tests and diagnostics.
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }
}

// Sidecar receive tasks.
//
// While a stream is active the socket's read side belongs to one of
// these tasks; the driver keeps the write side and services pacing and
// control signaling. Errors (including republish/close control results)
// land in a shared slot the driver observes only at wait return.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::SessionError;
use crate::protocol::{ProtocolSession, SharedMessage};
use crate::session::publish::handle_publish_message;
use crate::source::{Consumer, Source};

struct RecvShared {
    queue: Mutex<VecDeque<SharedMessage>>,
    error: Mutex<Option<SessionError>>,
    nb_msgs: AtomicI64,
    notify: Notify,
}

impl RecvShared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            error: Mutex::new(None),
            nb_msgs: AtomicI64::new(0),
            notify: Notify::new(),
        })
    }

    fn set_error(&self, e: SessionError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(e);
        }
    }
}

/// Reads a playing client's inbound control messages so the delivery
/// loop never blocks on the socket's read side. Each arrival wakes the
/// consumer the driver is parked on.
pub struct PlayReceiveTask {
    shared: Arc<RecvShared>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl PlayReceiveTask {
    pub fn start(
        protocol: Arc<dyn ProtocolSession>,
        consumer: Arc<dyn Consumer>,
        cancel: CancellationToken,
    ) -> Self {
        let shared = RecvShared::new();
        let task_shared = shared.clone();
        let task_cancel = cancel.clone();

        let handle = tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        _ = task_cancel.cancelled() => break,
                        r = protocol.recv_message() => match r {
                            Ok(msg) => {
                                task_shared.queue.lock().push_back(msg);
                                task_shared.nb_msgs.fetch_add(1, Ordering::SeqCst);
                                consumer.wakeup();
                            }
                            Err(e) => {
                                task_shared.set_error(e);
                                consumer.wakeup();
                                break;
                            }
                        }
                    }
                }
            }
            .in_current_span(),
        );

        Self {
            shared,
            cancel,
            handle,
        }
    }

    pub fn empty(&self) -> bool {
        self.shared.queue.lock().is_empty()
    }

    pub fn size(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn pump(&self) -> Option<SharedMessage> {
        self.shared.queue.lock().pop_front()
    }

    pub fn take_error(&self) -> Option<SessionError> {
        self.shared.error.lock().take()
    }

    pub async fn stop(self) -> usize {
        self.cancel.cancel();
        let _ = self.handle.await;
        self.shared.queue.lock().len()
    }
}

/// Reads and dispatches a publisher's messages. The driver only watches
/// the message counter advance within its timeout ladder; media flows
/// straight from this task into the Source.
pub struct PublishReceiveTask {
    shared: Arc<RecvShared>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl PublishReceiveTask {
    pub fn start(
        protocol: Arc<dyn ProtocolSession>,
        source: Arc<dyn Source>,
        stream_id: u32,
        is_fmle: bool,
        vhost_is_edge: bool,
        cancel: CancellationToken,
    ) -> Self {
        let shared = RecvShared::new();
        let task_shared = shared.clone();
        let task_cancel = cancel.clone();

        let handle = tokio::spawn(
            async move {
                loop {
                    let msg = tokio::select! {
                        _ = task_cancel.cancelled() => break,
                        r = protocol.recv_message() => match r {
                            Ok(msg) => msg,
                            Err(e) => {
                                task_shared.set_error(e);
                                task_shared.notify.notify_one();
                                break;
                            }
                        }
                    };

                    task_shared.nb_msgs.fetch_add(1, Ordering::SeqCst);
                    task_shared.notify.notify_one();

                    if let Err(e) = handle_publish_message(
                        &protocol,
                        &source,
                        msg,
                        stream_id,
                        is_fmle,
                        vhost_is_edge,
                    )
                    .await
                    {
                        task_shared.set_error(e);
                        task_shared.notify.notify_one();
                        break;
                    }
                }
            }
            .in_current_span(),
        );

        Self {
            shared,
            cancel,
            handle,
        }
    }

    pub fn nb_msgs(&self) -> i64 {
        self.shared.nb_msgs.load(Ordering::SeqCst)
    }

    pub fn take_error(&self) -> Option<SessionError> {
        self.shared.error.lock().take()
    }

    /// Park until a message/error arrives or the timeout elapses.
    pub async fn wait(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.shared.notify.notified()).await;
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tenantq_core::Message;

use crate::error::SourceError;

/// Default time a delivered message stays invisible before it is handed out
/// again, and default delay before a requeued message reappears.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Queue transport consumed by the populator and the dispatcher.
#[async_trait]
pub trait MessageSource: Send + Sync + 'static {
    /// Lazy, potentially infinite stream of received messages.
    ///
    /// The stream is not restartable: sources may hand it out only once.
    fn messages(&self) -> BoxStream<'static, Message>;

    /// Removes the message from the source permanently.
    async fn acknowledge(&self, message: &Message) -> Result<(), SourceError>;

    /// Makes the message eligible for redelivery after a visibility delay.
    async fn requeue(&self, message: &Message) -> Result<(), SourceError>;
}

/// A delivered message plus the timer that returns it to the stream.
struct InFlight {
    message: Message,
    expiry: CancellationToken,
}

struct MemoryInner {
    tx: mpsc::UnboundedSender<Message>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    outstanding: Mutex<HashMap<String, InFlight>>,
    acknowledged: AtomicU64,
    requeued: AtomicU64,
    expired: AtomicU64,
    visibility_timeout: Duration,
    requeue_delay: Duration,
    closed: CancellationToken,
}

impl MemoryInner {
    /// Tracks a delivered message and arms its visibility timer.
    fn deliver(self: &Arc<Self>, message: &Message) {
        let token = message.ack_token().to_string();
        let expiry = self.closed.child_token();
        self.outstanding.lock().insert(
            token.clone(),
            InFlight {
                message: message.clone(),
                expiry: expiry.clone(),
            },
        );

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = expiry.cancelled() => {}
                _ = tokio::time::sleep(inner.visibility_timeout) => {
                    let Some(expired) = inner.outstanding.lock().remove(&token) else {
                        return;
                    };
                    inner.expired.fetch_add(1, Ordering::Relaxed);
                    let _ = inner.tx.send(expired.message.with_ack_token(fresh_token()));
                }
            }
        });
    }

    /// Removes a delivered message and stops its visibility timer.
    fn settle(&self, ack_token: &str) -> Result<Message, SourceError> {
        let Some(in_flight) = self.outstanding.lock().remove(ack_token) else {
            return Err(SourceError::UnknownToken(ack_token.to_string()));
        };
        in_flight.expiry.cancel();
        Ok(in_flight.message)
    }
}

fn fresh_token() -> String {
    Uuid::new_v4().simple().to_string()
}

/// In-process [`MessageSource`] backed by an unbounded channel.
///
/// Delivered messages stay outstanding until acknowledged or requeued. One
/// left alone longer than the visibility timeout comes back on the stream
/// with a fresh ack token, as does a requeued one after the requeue delay.
#[derive(Clone)]
pub struct MemorySource {
    inner: Arc<MemoryInner>,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new(DEFAULT_VISIBILITY_TIMEOUT)
    }
}

impl MemorySource {
    /// Uses `visibility_timeout` both for unacknowledged deliveries and as the
    /// requeue delay.
    pub fn new(visibility_timeout: Duration) -> Self {
        Self::with_delays(visibility_timeout, visibility_timeout)
    }

    pub fn with_delays(visibility_timeout: Duration, requeue_delay: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(MemoryInner {
                tx,
                rx: Mutex::new(Some(rx)),
                outstanding: Mutex::new(HashMap::new()),
                acknowledged: AtomicU64::new(0),
                requeued: AtomicU64::new(0),
                expired: AtomicU64::new(0),
                visibility_timeout,
                requeue_delay,
                closed: CancellationToken::new(),
            }),
        }
    }

    /// Publishes a new message with a fresh id and ack token.
    pub fn publish(
        &self,
        payload: impl Into<Vec<u8>>,
        headers: HashMap<String, String>,
    ) -> Result<Message, SourceError> {
        if self.inner.closed.is_cancelled() {
            return Err(SourceError::Closed);
        }
        let message = Message::new(fresh_token(), fresh_token(), payload, headers);
        self.inner
            .tx
            .send(message.clone())
            .map_err(|_| SourceError::Closed)?;
        Ok(message)
    }

    /// Ends the message stream and drops pending redeliveries.
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    pub fn acknowledged_count(&self) -> u64 {
        self.inner.acknowledged.load(Ordering::Relaxed)
    }

    pub fn requeued_count(&self) -> u64 {
        self.inner.requeued.load(Ordering::Relaxed)
    }

    /// Deliveries that outlived the visibility timeout and were handed out
    /// again.
    pub fn expired_count(&self) -> u64 {
        self.inner.expired.load(Ordering::Relaxed)
    }

    /// Messages delivered but neither acknowledged, requeued nor expired.
    pub fn outstanding_len(&self) -> usize {
        self.inner.outstanding.lock().len()
    }
}

#[async_trait]
impl MessageSource for MemorySource {
    fn messages(&self) -> BoxStream<'static, Message> {
        let Some(rx) = self.inner.rx.lock().take() else {
            return stream::empty().boxed();
        };
        let inner = Arc::clone(&self.inner);
        stream::unfold((rx, inner), |(mut rx, inner)| async move {
            let message = tokio::select! {
                biased;
                _ = inner.closed.cancelled() => None,
                message = rx.recv() => message,
            }?;
            inner.deliver(&message);
            Some((message, (rx, inner)))
        })
        .boxed()
    }

    async fn acknowledge(&self, message: &Message) -> Result<(), SourceError> {
        self.inner.settle(message.ack_token())?;
        self.inner.acknowledged.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn requeue(&self, message: &Message) -> Result<(), SourceError> {
        let original = self.inner.settle(message.ack_token())?;
        self.inner.requeued.fetch_add(1, Ordering::Relaxed);

        let redelivery = original.with_ack_token(fresh_token());
        let tx = self.inner.tx.clone();
        let closed = self.inner.closed.clone();
        let delay = self.inner.requeue_delay;
        tokio::spawn(async move {
            tokio::select! {
                _ = closed.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(redelivery);
                }
            }
        });
        Ok(())
    }
}

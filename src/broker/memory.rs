//! In-memory broker double for tests and single-process runs.
//!
//! Honours the semantics the system depends on: per-queue FIFO, manual
//! acknowledgement, prefetch-limited fair dispatch across subscribers,
//! max-length drop-head with dead-letter routing, and message TTL on the
//! stats queues. An unsettled delivery that gets dropped is requeued, the
//! way a real broker redelivers after a channel loss.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use strum::IntoEnumIterator;
use tokio_util::sync::CancellationToken;

use crate::broker::{Acker, Broker, Delivery, Queue, Subscription};
use crate::error::MontebusResult;
use crate::message::Headers;

#[derive(Debug, Clone)]
struct StoredMsg {
    payload: Vec<u8>,
    headers: Headers,
    enqueued_at: Instant,
}

struct SubscriberSlot {
    id: u64,
    tx: async_channel::Sender<Delivery>,
    prefetch: u16,
    outstanding: Arc<AtomicU32>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMsg>,
    subscribers: Vec<SubscriberSlot>,
    rr_cursor: usize,
}

struct Inner {
    queues: Mutex<HashMap<Queue, QueueState>>,
    next_subscriber_id: AtomicU64,
}

#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let queues = Queue::iter().map(|q| (q, QueueState::default())).collect();
        Self {
            inner: Arc::new(Inner {
                queues: Mutex::new(queues),
                next_subscriber_id: AtomicU64::new(1),
            }),
        }
    }
}

/// Drops messages whose TTL has lapsed.
fn prune(state: &mut QueueState, queue: Queue) {
    if let Some(ttl) = queue.spec().message_ttl {
        state.ready.retain(|msg| msg.enqueued_at.elapsed() < ttl);
    }
}

/// Pushes ready messages to eligible subscribers, round-robin, respecting
/// each subscriber's prefetch window. Deliveries are constructed outside the
/// state lock so a failed send can requeue through the acker safely.
fn dispatch(inner: &Arc<Inner>, queue: Queue) {
    loop {
        let handed_off = {
            let mut queues = inner.queues.lock().expect("broker mutex");
            let state = queues.get_mut(&queue).expect("known queue");
            prune(state, queue);
            state
                .subscribers
                .retain(|s| !s.cancel.is_cancelled() && !s.tx.is_closed());
            if state.ready.is_empty() || state.subscribers.is_empty() {
                return;
            }

            let count = state.subscribers.len();
            let mut chosen = None;
            for offset in 0..count {
                let idx = (state.rr_cursor + offset) % count;
                let slot = &state.subscribers[idx];
                let window = u32::from(slot.prefetch);
                if window == 0 || slot.outstanding.load(Ordering::SeqCst) < window {
                    chosen = Some(idx);
                    break;
                }
            }
            let Some(idx) = chosen else {
                return;
            };
            state.rr_cursor = (idx + 1) % count;
            let msg = state.ready.pop_front().expect("non-empty");
            let slot = &state.subscribers[idx];
            slot.outstanding.fetch_add(1, Ordering::SeqCst);
            (
                msg,
                slot.tx.clone(),
                slot.outstanding.clone(),
                slot.id,
            )
        };

        let (msg, tx, outstanding, subscriber_id) = handed_off;
        let delivery = Delivery::new(
            msg.payload.clone(),
            msg.headers.clone(),
            Box::new(MemoryAcker {
                inner: inner.clone(),
                queue,
                msg,
                outstanding: Some(outstanding),
                settled: AtomicBool::new(false),
            }),
        );
        if tx.try_send(delivery).is_err() {
            // Receiver gone: drop the dead slot; the unsettled delivery's
            // acker has already requeued the message.
            let mut queues = inner.queues.lock().expect("broker mutex");
            let state = queues.get_mut(&queue).expect("known queue");
            state.subscribers.retain(|s| s.id != subscriber_id);
        }
    }
}

fn enqueue(inner: &Arc<Inner>, queue: Queue, msg: StoredMsg, front: bool) {
    let mut dead_lettered = Vec::new();
    {
        let mut queues = inner.queues.lock().expect("broker mutex");
        let state = queues.get_mut(&queue).expect("known queue");
        prune(state, queue);
        let spec = queue.spec();
        if let Some(max_length) = spec.max_length {
            while state.ready.len() >= max_length as usize {
                // Drop-head: the oldest message makes room, dead-lettered
                // when the queue has a DLQ bound.
                let evicted = state.ready.pop_front().expect("over limit");
                if let Some(dlq) = spec.dead_letter {
                    dead_lettered.push((dlq, evicted));
                }
            }
        }
        if front {
            state.ready.push_front(msg);
        } else {
            state.ready.push_back(msg);
        }
    }
    for (dlq, mut evicted) in dead_lettered {
        evicted.enqueued_at = Instant::now();
        enqueue(inner, dlq, evicted, false);
        dispatch(inner, dlq);
    }
    dispatch(inner, queue);
}

struct MemoryAcker {
    inner: Arc<Inner>,
    queue: Queue,
    msg: StoredMsg,
    outstanding: Option<Arc<AtomicU32>>,
    settled: AtomicBool,
}

impl MemoryAcker {
    fn settle(&self) -> bool {
        !self.settled.swap(true, Ordering::SeqCst)
    }

    fn release_window(&self) {
        if let Some(outstanding) = &self.outstanding {
            outstanding.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> MontebusResult<()> {
        if self.settle() {
            self.release_window();
            dispatch(&self.inner, self.queue);
        }
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> MontebusResult<()> {
        if self.settle() {
            self.release_window();
            if requeue {
                enqueue(&self.inner, self.queue, self.msg.clone(), true);
            } else if let Some(dlq) = self.queue.spec().dead_letter {
                let mut msg = self.msg.clone();
                msg.enqueued_at = Instant::now();
                enqueue(&self.inner, dlq, msg, false);
            }
            dispatch(&self.inner, self.queue);
        }
        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        // Unsettled deliveries are redelivered, like after a channel loss.
        if self.settle() {
            self.release_window();
            enqueue(&self.inner, self.queue, self.msg.clone(), true);
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_topology(&self) -> MontebusResult<()> {
        // All queues exist from construction; declaration is idempotent.
        Ok(())
    }

    async fn publish(
        &self,
        queue: Queue,
        payload: &[u8],
        _persistent: bool,
        headers: &Headers,
    ) -> MontebusResult<()> {
        enqueue(
            &self.inner,
            queue,
            StoredMsg {
                payload: payload.to_vec(),
                headers: headers.clone(),
                enqueued_at: Instant::now(),
            },
            false,
        );
        Ok(())
    }

    async fn get(&self, queue: Queue) -> MontebusResult<Option<Delivery>> {
        let msg = {
            let mut queues = self.inner.queues.lock().expect("broker mutex");
            let state = queues.get_mut(&queue).expect("known queue");
            prune(state, queue);
            state.ready.pop_front()
        };
        Ok(msg.map(|msg| {
            Delivery::new(
                msg.payload.clone(),
                msg.headers.clone(),
                Box::new(MemoryAcker {
                    inner: self.inner.clone(),
                    queue,
                    msg,
                    outstanding: None,
                    settled: AtomicBool::new(false),
                }),
            )
        }))
    }

    async fn subscribe(
        &self,
        queue: Queue,
        prefetch: u16,
        _consumer_tag: &str,
    ) -> MontebusResult<Subscription> {
        let (tx, rx) = async_channel::unbounded();
        let cancel = CancellationToken::new();
        {
            let mut queues = self.inner.queues.lock().expect("broker mutex");
            let state = queues.get_mut(&queue).expect("known queue");
            state.subscribers.push(SubscriberSlot {
                id: self.inner.next_subscriber_id.fetch_add(1, Ordering::SeqCst),
                tx,
                prefetch,
                outstanding: Arc::new(AtomicU32::new(0)),
                cancel: cancel.clone(),
            });
        }
        dispatch(&self.inner, queue);
        Ok(Subscription::new(rx, cancel))
    }

    async fn purge(&self, queue: Queue) -> MontebusResult<u64> {
        let mut queues = self.inner.queues.lock().expect("broker mutex");
        let state = queues.get_mut(&queue).expect("known queue");
        let count = state.ready.len() as u64;
        state.ready.clear();
        Ok(count)
    }

    async fn queue_size(&self, queue: Queue) -> MontebusResult<u64> {
        let mut queues = self.inner.queues.lock().expect("broker mutex");
        let state = queues.get_mut(&queue).expect("known queue");
        prune(state, queue);
        Ok(state.ready.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn payload(n: u8) -> Vec<u8> {
        vec![n]
    }

    #[tokio::test]
    async fn fifo_publish_and_get() {
        let broker = MemoryBroker::new();
        for n in 0..3 {
            broker
                .publish(Queue::Scenarios, &payload(n), true, &Headers::new())
                .await
                .unwrap();
        }
        assert_eq!(broker.queue_size(Queue::Scenarios).await.unwrap(), 3);

        for n in 0..3 {
            let delivery = broker.get(Queue::Scenarios).await.unwrap().unwrap();
            assert_eq!(delivery.payload, payload(n));
            delivery.ack().await.unwrap();
        }
        assert!(broker.get(Queue::Scenarios).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unsettled_delivery_is_redelivered() {
        let broker = MemoryBroker::new();
        broker
            .publish(Queue::Scenarios, &payload(9), true, &Headers::new())
            .await
            .unwrap();
        {
            let _delivery = broker.get(Queue::Scenarios).await.unwrap().unwrap();
            // dropped without settling
        }
        assert_eq!(broker.queue_size(Queue::Scenarios).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn nack_with_requeue_puts_message_back() {
        let broker = MemoryBroker::new();
        broker
            .publish(Queue::Scenarios, &payload(1), true, &Headers::new())
            .await
            .unwrap();
        let delivery = broker.get(Queue::Scenarios).await.unwrap().unwrap();
        delivery.nack(true).await.unwrap();
        assert_eq!(broker.queue_size(Queue::Scenarios).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn nack_without_requeue_routes_to_dlq() {
        let broker = MemoryBroker::new();
        broker
            .publish(Queue::Scenarios, &payload(1), true, &Headers::new())
            .await
            .unwrap();
        let delivery = broker.get(Queue::Scenarios).await.unwrap().unwrap();
        delivery.nack(false).await.unwrap();
        assert_eq!(broker.queue_size(Queue::Scenarios).await.unwrap(), 0);
        assert_eq!(broker.queue_size(Queue::ScenariosDlq).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn prefetch_one_limits_outstanding_deliveries() {
        let broker = MemoryBroker::new();
        let subscription = broker.subscribe(Queue::Scenarios, 1, "w1").await.unwrap();
        for n in 0..3 {
            broker
                .publish(Queue::Scenarios, &payload(n), true, &Headers::new())
                .await
                .unwrap();
        }

        let first = subscription.recv().await.unwrap();
        // Second delivery must not arrive while the first is unacked.
        let early = tokio::time::timeout(Duration::from_millis(50), subscription.recv()).await;
        assert!(early.is_err());

        first.ack().await.unwrap();
        let second = tokio::time::timeout(Duration::from_millis(200), subscription.recv())
            .await
            .expect("second delivery after ack")
            .unwrap();
        assert_eq!(second.payload, payload(1));
        second.ack().await.unwrap();
    }

    #[tokio::test]
    async fn dispatch_is_fair_across_subscribers() {
        let broker = MemoryBroker::new();
        let a = broker.subscribe(Queue::Scenarios, 1, "a").await.unwrap();
        let b = broker.subscribe(Queue::Scenarios, 1, "b").await.unwrap();

        for n in 0..2 {
            broker
                .publish(Queue::Scenarios, &payload(n), true, &Headers::new())
                .await
                .unwrap();
        }

        // With one unacked delivery each, both subscribers hold exactly one.
        let da = tokio::time::timeout(Duration::from_millis(200), a.recv())
            .await
            .expect("delivery for a")
            .unwrap();
        let db = tokio::time::timeout(Duration::from_millis(200), b.recv())
            .await
            .expect("delivery for b")
            .unwrap();
        da.ack().await.unwrap();
        db.ack().await.unwrap();
    }

    #[tokio::test]
    async fn model_queue_drop_head_keeps_a_single_message() {
        let broker = MemoryBroker::new();
        broker
            .publish(Queue::Model, &payload(1), true, &Headers::new())
            .await
            .unwrap();
        broker
            .publish(Queue::Model, &payload(2), true, &Headers::new())
            .await
            .unwrap();
        assert_eq!(broker.queue_size(Queue::Model).await.unwrap(), 1);
        let delivery = broker.get(Queue::Model).await.unwrap().unwrap();
        assert_eq!(delivery.payload, payload(2));
        delivery.ack().await.unwrap();
    }

    #[tokio::test]
    async fn purge_empties_the_queue() {
        let broker = MemoryBroker::new();
        for n in 0..5 {
            broker
                .publish(Queue::Results, &payload(n), true, &Headers::new())
                .await
                .unwrap();
        }
        assert_eq!(broker.purge(Queue::Results).await.unwrap(), 5);
        assert_eq!(broker.queue_size(Queue::Results).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn headers_travel_with_the_envelope() {
        let broker = MemoryBroker::new();
        let headers = Headers {
            retry_count: 2,
            last_error: Some("boom".into()),
            consumer_id: Some("w9".into()),
        };
        broker
            .publish(Queue::Scenarios, &payload(1), true, &headers)
            .await
            .unwrap();
        let delivery = broker.get(Queue::Scenarios).await.unwrap().unwrap();
        assert_eq!(delivery.headers, headers);
        delivery.ack().await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_subscription_stops_receiving() {
        let broker = MemoryBroker::new();
        let subscription = broker.subscribe(Queue::Scenarios, 1, "w").await.unwrap();
        subscription.cancel();
        broker
            .publish(Queue::Scenarios, &payload(1), true, &Headers::new())
            .await
            .unwrap();
        // Message stays on the queue for the next consumer.
        assert_eq!(broker.queue_size(Queue::Scenarios).await.unwrap(), 1);
    }
}

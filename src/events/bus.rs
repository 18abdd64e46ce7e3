//! In-process event fan-out.
//!
//! Publishing assigns the per-process sequence and delivers to every
//! matching subscriber under one lock, so each subscriber observes
//! sequences in strictly increasing order. Script hooks and webhooks are
//! fired on detached tasks and never block the publisher.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};

use super::hooks::{HookContext, HookRunner};
use super::webhooks::WebhookSink;
use super::{Envelope, EventFilter};

pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 100;

/// What to do when a subscriber's buffer is full.
///
/// Events are best-effort by default: a slow subscriber loses events, the
/// publisher never stalls. `Block` exists for sinks that must not miss an
/// event and accept holding up fan-out instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPolicy {
    Drop,
    Block,
}

struct SubEntry {
    id: u64,
    filter: EventFilter,
    policy: DeliveryPolicy,
    tx: mpsc::Sender<Envelope>,
}

struct Inner {
    seq: u64,
    subs: Vec<SubEntry>,
}

pub struct EventBus {
    inner: Mutex<Inner>,
    next_sub_id: AtomicU64,
    hooks: Option<HookRunner>,
    webhooks: WebhookSink,
    shutdown: watch::Receiver<bool>,
}

/// A live subscription. Dropping the receiver detaches the subscriber on
/// the next publish.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<Envelope>,
}

impl EventBus {
    pub fn new(
        hooks: Option<HookRunner>,
        webhooks: WebhookSink,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                seq: 0,
                subs: Vec::new(),
            }),
            next_sub_id: AtomicU64::new(1),
            hooks,
            webhooks,
            shutdown,
        })
    }

    /// A bus with no script-hook or webhook sinks, for tests and tools.
    pub fn in_process_only() -> Arc<Self> {
        let (_tx, rx) = watch::channel(false);
        Self::new(None, WebhookSink::disabled(), rx)
    }

    pub async fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.subscribe_with(filter, DEFAULT_SUBSCRIBER_BUFFER, DeliveryPolicy::Drop)
            .await
    }

    pub async fn subscribe_with(
        &self,
        filter: EventFilter,
        capacity: usize,
        policy: DeliveryPolicy,
    ) -> Subscription {
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.inner.lock().await.subs.push(SubEntry {
            id,
            filter,
            policy,
            tx,
        });
        Subscription { id, rx }
    }

    pub async fn unsubscribe(&self, id: u64) {
        self.inner.lock().await.subs.retain(|s| s.id != id);
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.lock().await.subs.len()
    }

    /// Publish one envelope: assign the sequence, fan out to in-process
    /// subscribers, then hand the event to the hook and webhook sinks on
    /// detached tasks. Returns the assigned sequence.
    pub async fn publish(&self, env: Envelope, hook_ctx: Option<HookContext>) -> u64 {
        let env = {
            let mut inner = self.inner.lock().await;
            inner.seq += 1;
            let mut env = env;
            env.sequence = inner.seq;

            // Dead subscribers are dropped as a side effect of delivery.
            let mut closed = Vec::new();
            for sub in inner.subs.iter() {
                if !sub.filter.matches(&env) {
                    continue;
                }
                match sub.policy {
                    DeliveryPolicy::Drop => match sub.tx.try_send(env.clone()) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            warn!(
                                subscriber = sub.id,
                                event = %env.event_type,
                                seq = env.sequence,
                                "subscriber buffer full — event dropped for this subscriber"
                            );
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => closed.push(sub.id),
                    },
                    DeliveryPolicy::Block => {
                        if sub.tx.send(env.clone()).await.is_err() {
                            closed.push(sub.id);
                        }
                    }
                }
            }
            if !closed.is_empty() {
                inner.subs.retain(|s| !closed.contains(&s.id));
            }
            env
        };

        debug!(event = %env.event_type, seq = env.sequence, task = ?env.task_id, "event published");

        if let Some(ref hooks) = self.hooks {
            hooks.fire(&env, hook_ctx, self.shutdown.clone());
        }
        self.webhooks.fire(&env);

        env.sequence
    }

    /// Swap the webhook URL list — called when the `event_webhooks`
    /// setting changes.
    pub fn set_webhook_urls(&self, urls: Vec<String>) {
        self.webhooks.set_urls(urls);
    }

    /// Re-deliver previously audited envelopes to one subscription,
    /// assigning fresh sequences. Used for post-crash replay.
    pub async fn replay_to(&self, sub_id: u64, envelopes: Vec<Envelope>) {
        let mut inner = self.inner.lock().await;
        for env in envelopes {
            inner.seq += 1;
            let mut env = env;
            env.sequence = inner.seq;
            if let Some(sub) = inner.subs.iter().find(|s| s.id == sub_id) {
                if sub.filter.matches(&env) {
                    let _ = sub.tx.try_send(env);
                }
            }
        }
    }
}

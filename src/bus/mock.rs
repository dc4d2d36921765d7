//! In-process [`Bus`] test double. Reply-to semantics mirror real NATS
//! request-reply exactly: a request gets a generated inbox subject, and
//! "replying" is just a [`Bus::publish`] to that inbox — so worker code
//! written against this mock needs no special-casing to run against a real
//! bus.

// Copyright 2015-2020 Capital One Services, LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use super::{Bus, BusAuth, BusMessage, Subscription};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

struct Delivery {
    message: BusMessage,
}

#[derive(Clone)]
struct SubEntry {
    id: u64,
    /// Subscriptions sharing the same group name act as one queue group: a
    /// message lands on exactly one member. `None` means every such
    /// subscription gets its own copy, as an ungrouped NATS subscriber would.
    group: Option<String>,
    sender: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct Inner {
    subscribers: HashMap<String, Vec<SubEntry>>,
    round_robin: HashMap<String, usize>,
    reply_waiters: HashMap<String, oneshot::Sender<BusMessage>>,
}

/// A shared, clonable in-process bus. Clones share the same subscriber
/// registry, so a `MockBus` clone given to a worker and one given to a client
/// see each other's subscriptions and requests.
#[derive(Clone)]
pub struct MockBus {
    inner: Arc<Mutex<Inner>>,
    next_id: Arc<AtomicU64>,
}

impl MockBus {
    pub fn new() -> Self {
        MockBus {
            inner: Arc::new(Mutex::new(Inner::default())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Registers a handler that answers every request on `subject` by
    /// running `f` against the request payload. Convenience for tests that
    /// don't need the full subscription/dispatch loop.
    pub fn handle<F>(&self, subject: &str, f: F)
    where
        F: Fn(Vec<u8>) -> Vec<u8> + Send + Sync + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        self.register(subject, None, tx);
        let bus = self.clone();
        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                let reply_to = delivery.message.reply_to.clone();
                let response = f(delivery.message.payload);
                if let Some(reply_to) = reply_to {
                    let _ = bus.publish(&reply_to, response).await;
                }
            }
        });
    }

    fn register(&self, subject: &str, group: Option<&str>, sender: mpsc::UnboundedSender<Delivery>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock().unwrap();
        inner
            .subscribers
            .entry(subject.to_string())
            .or_default()
            .push(SubEntry {
                id,
                group: group.map(|s| s.to_string()),
                sender,
            });
        id
    }

    fn deregister(&self, subject: &str, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entries) = inner.subscribers.get_mut(subject) {
            entries.retain(|e| e.id != id);
        }
    }
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for MockBus {
    async fn request(&self, subject: &str, payload: Vec<u8>, timeout: Duration) -> Result<BusMessage> {
        let inbox = format!("_INBOX.{}", Uuid::new_v4());
        let (tx, rx) = oneshot::channel();

        let recipient = {
            let mut inner = self.inner.lock().unwrap();
            inner.reply_waiters.insert(inbox.clone(), tx);

            let Some(entries) = inner.subscribers.get(subject) else {
                inner.reply_waiters.remove(&inbox);
                return Err(Error::unknown_subject(format!("no subscriber on {subject}")));
            };
            if entries.is_empty() {
                inner.reply_waiters.remove(&inbox);
                return Err(Error::unknown_subject(format!("no subscriber on {subject}")));
            }

            let groups = group_representatives(entries);
            let counter = inner.round_robin.entry(subject.to_string()).or_insert(0);
            let idx = *counter % groups.len();
            *counter = counter.wrapping_add(1);
            groups[idx].clone()
        };

        recipient
            .send(Delivery {
                message: BusMessage {
                    subject: subject.to_string(),
                    payload,
                    reply_to: Some(inbox.clone()),
                },
            })
            .map_err(|_| Error::Bus(format!("subscriber on {subject} dropped")))?;

        match tokio::time::timeout(timeout, rx).await {
            Err(_) => {
                self.inner.lock().unwrap().reply_waiters.remove(&inbox);
                Err(Error::timeout(format!("request on {subject} timed out")))
            }
            Ok(Err(_)) => Err(Error::Bus(format!("subscriber on {subject} dropped reply"))),
            Ok(Ok(message)) => Ok(message),
        }
    }

    async fn subscribe(&self, subject: &str, queue_group: Option<&str>) -> Result<Box<dyn Subscription>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.register(subject, queue_group, tx);
        Ok(Box::new(MockSubscription {
            bus: self.clone(),
            subject: subject.to_string(),
            id,
            receiver: rx,
        }))
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        let waiter = self.inner.lock().unwrap().reply_waiters.remove(subject);
        if let Some(tx) = waiter {
            let _ = tx.send(BusMessage {
                subject: subject.to_string(),
                payload,
                reply_to: None,
            });
            return Ok(());
        }

        let recipients = {
            let inner = self.inner.lock().unwrap();
            match inner.subscribers.get(subject) {
                Some(entries) => group_representatives(entries),
                None => Vec::new(),
            }
        };
        for sender in recipients {
            let _ = sender.send(Delivery {
                message: BusMessage {
                    subject: subject.to_string(),
                    payload: payload.clone(),
                    reply_to: None,
                },
            });
        }
        Ok(())
    }

    async fn drain(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Groups a subject's subscriber entries by queue-group membership and
/// returns one representative sender per group (ungrouped subscribers count
/// as their own singleton group), so fan-out delivers once per group.
fn group_representatives(entries: &[SubEntry]) -> Vec<mpsc::UnboundedSender<Delivery>> {
    let mut seen_groups: Vec<String> = Vec::new();
    let mut reps = Vec::new();
    for entry in entries {
        match &entry.group {
            Some(g) if seen_groups.contains(g) => continue,
            Some(g) => {
                seen_groups.push(g.clone());
                reps.push(entry.sender.clone());
            }
            None => reps.push(entry.sender.clone()),
        }
    }
    reps
}

struct MockSubscription {
    bus: MockBus,
    subject: String,
    id: u64,
    receiver: mpsc::UnboundedReceiver<Delivery>,
}

#[async_trait]
impl Subscription for MockSubscription {
    async fn next(&mut self) -> Option<BusMessage> {
        self.receiver.recv().await.map(|d| d.message)
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        self.bus.deregister(&self.subject, self.id);
        Ok(())
    }
}

/// Connects a fresh handle to the same shared in-process bus state. Unlike a
/// real bus URL, `url` is ignored — all [`MockBus`] clones share one registry,
/// which is the point of using it as a test double.
pub async fn connect(_url: &str, _auth: BusAuth) -> Result<MockBus> {
    Ok(MockBus::new())
}

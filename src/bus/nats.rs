//! `async-nats`-backed [`Bus`] implementation.

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

use super::{Bus, BusAuth, BusMessage, Connector, Subscription};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;

/// Builds a [`Connector`] that opens real NATS connections via [`NatsBus::connect`],
/// for wiring a [`crate::pool::ConnectionPool`] that dials non-default buses.
pub fn connector() -> Connector {
    Arc::new(|url: String, auth: BusAuth| {
        async move {
            let bus = NatsBus::connect(&url, auth).await?;
            Ok(Arc::new(bus) as Arc<dyn Bus>)
        }
        .boxed()
    })
}

pub struct NatsBus {
    client: async_nats::Client,
}

impl NatsBus {
    pub async fn connect(url: &str, auth: BusAuth) -> Result<Self> {
        let options = match auth {
            BusAuth::None => async_nats::ConnectOptions::new(),
            BusAuth::Token(token) => async_nats::ConnectOptions::new().token(token),
            BusAuth::UserPass { user, pass } => {
                async_nats::ConnectOptions::new().user_and_password(user, pass)
            }
        };

        let client = options
            .connect(url)
            .await
            .map_err(|e| Error::Bus(format!("connect to {url}: {e}")))?;

        Ok(NatsBus { client })
    }

    pub fn from_client(client: async_nats::Client) -> Self {
        NatsBus { client }
    }
}

#[async_trait]
impl Bus for NatsBus {
    async fn request(&self, subject: &str, payload: Vec<u8>, timeout: Duration) -> Result<BusMessage> {
        let fut = self.client.request(subject.to_string(), payload.into());
        match tokio::time::timeout(timeout, fut).await {
            Err(_) => Err(Error::timeout(format!("request on {subject} timed out"))),
            Ok(Err(e)) => Err(Error::Bus(format!("request on {subject}: {e}"))),
            Ok(Ok(message)) => Ok(BusMessage {
                subject: message.subject.to_string(),
                payload: message.payload.to_vec(),
                reply_to: message.reply.map(|s| s.to_string()),
            }),
        }
    }

    async fn subscribe(&self, subject: &str, queue_group: Option<&str>) -> Result<Box<dyn Subscription>> {
        let subscriber = match queue_group {
            Some(group) => self
                .client
                .queue_subscribe(subject.to_string(), group.to_string())
                .await
                .map_err(|e| Error::Bus(format!("queue_subscribe {subject}: {e}")))?,
            None => self
                .client
                .subscribe(subject.to_string())
                .await
                .map_err(|e| Error::Bus(format!("subscribe {subject}: {e}")))?,
        };
        Ok(Box::new(NatsSubscription { subscriber }))
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| Error::Bus(format!("publish {subject}: {e}")))
    }

    async fn drain(&self) -> Result<()> {
        self.client
            .drain()
            .await
            .map_err(|e| Error::Bus(format!("drain: {e}")))
    }

    async fn close(&self) -> Result<()> {
        // async-nats closes the connection on drop of the last client clone;
        // draining first is the cooperative shutdown the teacher's lattice
        // bus performed via `Connection::close`.
        self.drain().await
    }
}

struct NatsSubscription {
    subscriber: async_nats::Subscriber,
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn next(&mut self) -> Option<BusMessage> {
        self.subscriber.next().await.map(|m| BusMessage {
            subject: m.subject.to_string(),
            payload: m.payload.to_vec(),
            reply_to: m.reply.map(|s| s.to_string()),
        })
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        self.subscriber
            .unsubscribe()
            .await
            .map_err(|e| Error::Bus(format!("unsubscribe: {e}")))
    }
}

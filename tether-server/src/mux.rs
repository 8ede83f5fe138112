//! Delivery multiplexer.
//!
//! Merges the outboxes of all of a user's networks, plus the account outbox,
//! into the single ordered stream one attached client sees.
//!
//! ```text
//!  network outbox ──forwarder──┐
//!  network outbox ──forwarder──┼──► aggregation queue ──writer──► ClientTransport
//!  account outbox ──forwarder──┘
//! ```
//!
//! Forwarders reserve room in the aggregation queue before taking an item
//! off their outbox, so stopping them never strands an item. Anything still
//! in the aggregation queue when the client goes away, and the item whose
//! write failed, is put back on the outbox it came from. A forwarder whose
//! outbox is closed (its network was removed) lets go of it right away.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::outbox::Outbox;
use crate::protocol::{ChanList, Payload};
use crate::user::UserSession;

/// Where delivered payloads go.
#[async_trait]
pub trait ClientTransport: Send {
    async fn send(&mut self, payload: &Payload) -> anyhow::Result<()>;

    /// Liveness ping, written once every keepalive period.
    async fn keepalive(&mut self) -> anyhow::Result<()>;
}

struct Tagged {
    origin: Outbox,
    payload: Payload,
}

#[derive(Debug, Clone, Copy)]
pub struct Delivery {
    pub keepalive: Duration,
    /// Aggregation queue capacity, on top of one slot per source.
    pub capacity: usize,
}

impl Default for Delivery {
    fn default() -> Self {
        Self {
            keepalive: Duration::from_secs(25),
            capacity: 256,
        }
    }
}

impl Delivery {
    /// Stream `user`'s events to `transport` until `detached` flips to
    /// `true` (or its sender is dropped) or a write fails.
    ///
    /// Starts with a snapshot of every network. Networks added while
    /// attached are picked up on the next attach. The underlying sessions
    /// are never affected by the client going away.
    pub async fn run<T: ClientTransport>(
        &self,
        user: &Arc<UserSession>,
        transport: &mut T,
        mut detached: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let networks = user.networks();
        for net in &networks {
            transport.send(&Payload::NetData(net.net_data())).await?;
            for state in net.active_channels() {
                transport.send(&Payload::ChanData(state)).await?;
            }
            let list = ChanList {
                network: net.name(),
                list: net.all_channels(),
            };
            transport.send(&Payload::ChanList(list)).await?;
        }

        let sources: Vec<Outbox> = networks
            .iter()
            .map(|n| n.outbox())
            .chain(std::iter::once(user.account_outbox()))
            .collect();
        let (agg_tx, mut agg_rx) = mpsc::channel(self.capacity.max(1) + sources.len());
        let (stop_tx, stop_rx) = watch::channel(false);
        let forwarders: Vec<_> = sources
            .into_iter()
            .map(|origin| tokio::spawn(forward(origin, agg_tx.clone(), stop_rx.clone())))
            .collect();
        drop(agg_tx);

        tracing::debug!(user = %user.email(), networks = networks.len(), "Client attached");

        let mut ticker = tokio::time::interval(self.keepalive);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        let outcome = loop {
            tokio::select! {
                item = agg_rx.recv() => {
                    let Some(Tagged { origin, payload }) = item else {
                        break Ok(());
                    };
                    if let Err(e) = transport.send(&payload).await {
                        origin.requeue(payload);
                        break Err(e);
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = transport.keepalive().await {
                        break Err(e);
                    }
                }
                changed = detached.changed() => {
                    if changed.is_err() || *detached.borrow() {
                        break Ok(());
                    }
                }
            }
        };

        let _ = stop_tx.send(true);
        for forwarder in forwarders {
            let _ = forwarder.await;
        }
        let mut requeued = 0;
        while let Ok(Tagged { origin, payload }) = agg_rx.try_recv() {
            origin.requeue(payload);
            requeued += 1;
        }
        match &outcome {
            Ok(()) => tracing::debug!(user = %user.email(), requeued, "Client detached"),
            Err(e) => tracing::info!(user = %user.email(), requeued, error = %e, "Client write failed"),
        }
        outcome
    }
}

/// Move items from `origin` to the aggregation queue until told to stop
/// or until `origin` is closed.
async fn forward(origin: Outbox, agg: mpsc::Sender<Tagged>, mut stop: watch::Receiver<bool>) {
    let mut reader = tokio::select! {
        reader = origin.take() => reader,
        _ = stop.changed() => return,
        _ = origin.closed() => return,
    };
    loop {
        let permit = tokio::select! {
            biased;
            _ = stop.changed() => break,
            _ = origin.closed() => break,
            permit = agg.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let payload = tokio::select! {
            biased;
            _ = stop.changed() => break,
            _ = origin.closed() => break,
            payload = reader.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
        };
        permit.send(Tagged {
            origin: origin.clone(),
            payload,
        });
    }
}

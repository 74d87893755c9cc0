// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Per-session event topic.
//!
//! One publisher (the agent loop), any number of read-only subscribers.
//! Publishing never blocks the loop.  A subscriber that falls behind loses
//! the oldest buffered events first; terminal events sit at the tail of the
//! buffer, so they survive lag and are always observed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::AgentEvent;

const BUS_CAPACITY: usize = 1024;

/// One totally-ordered event record.  `seq` is strictly increasing per
/// session; gaps after a lag report coalesced deltas.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub seq: u64,
    pub event: AgentEvent,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventRecord>,
    seq: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            tx,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an event; returns its sequence number.  Lack of subscribers
    /// is not an error.
    pub fn publish(&self, event: AgentEvent) -> u64 {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        trace!(seq, ?event, "publish");
        let _ = self.tx.send(EventRecord { seq, event });
        seq
    }

    pub fn subscribe(&self) -> EventSubscriber {
        EventSubscriber {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct EventSubscriber {
    rx: broadcast::Receiver<EventRecord>,
}

impl EventSubscriber {
    /// Next event record, or `None` once the bus is closed.  Lag is absorbed
    /// by skipping to the oldest retained record.
    pub async fn next(&mut self) -> Option<EventRecord> {
        loop {
            match self.rx.recv().await {
                Ok(rec) => return Some(rec),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    trace!(skipped, "subscriber lagged; oldest events coalesced");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        bus.publish(AgentEvent::AgentStart);
        bus.publish(AgentEvent::MessageDelta { text: "a".into() });
        bus.publish(AgentEvent::TurnEnd);

        assert_eq!(sub.next().await.unwrap().event, AgentEvent::AgentStart);
        assert!(matches!(
            sub.next().await.unwrap().event,
            AgentEvent::MessageDelta { .. }
        ));
        assert_eq!(sub.next().await.unwrap().event, AgentEvent::TurnEnd);
    }

    #[tokio::test]
    async fn sequence_numbers_strictly_increase() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        for _ in 0..5 {
            bus.publish(AgentEvent::AgentStart);
        }
        let mut last = None;
        for _ in 0..5 {
            let rec = sub.next().await.unwrap();
            if let Some(prev) = last {
                assert!(rec.seq > prev);
            }
            last = Some(rec.seq);
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(AgentEvent::AgentStart);
    }

    #[tokio::test]
    async fn lagged_subscriber_still_sees_terminal_event() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        // Overflow the buffer with non-terminal deltas, then close the turn.
        for i in 0..(BUS_CAPACITY * 2) {
            bus.publish(AgentEvent::MessageDelta {
                text: format!("{i}"),
            });
        }
        bus.publish(AgentEvent::AgentEnd {
            usage: Default::default(),
        });

        let mut saw_terminal = false;
        while let Some(rec) = sub.next().await {
            if rec.event.is_terminal() {
                saw_terminal = true;
                break;
            }
        }
        assert!(saw_terminal, "terminal event must survive subscriber lag");
    }

    #[tokio::test]
    async fn two_subscribers_see_the_same_order() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(AgentEvent::AgentStart);
        bus.publish(AgentEvent::TurnEnd);
        assert_eq!(a.next().await.unwrap().seq, b.next().await.unwrap().seq);
        assert_eq!(a.next().await.unwrap().seq, b.next().await.unwrap().seq);
    }
}

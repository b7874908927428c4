// ABOUTME: The scheduler's priority queue - five tiers, FIFO by timestamp within a tier.
// ABOUTME: Ties beyond timestamp break on envelope id so dequeue order is deterministic.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use uuid::Uuid;

use crate::message::{AddressKind, Envelope, EnvelopeKind};

/// Priority tier for an envelope; lower is dispatched first.
///
/// 0: any envelope from a system sender
/// 1: any envelope from an admin or user
/// 2: interrupt from an agent
/// 3: broadcast (including task_complete) from an agent
/// 4: request/response from an agent
pub fn priority_tier(envelope: &Envelope) -> u8 {
    match envelope.sender().kind {
        AddressKind::System => 0,
        AddressKind::Admin | AddressKind::User => 1,
        AddressKind::Agent => match envelope.kind() {
            EnvelopeKind::Interrupt => 2,
            EnvelopeKind::Broadcast | EnvelopeKind::TaskComplete => 3,
            EnvelopeKind::Request | EnvelopeKind::Response => 4,
        },
    }
}

#[derive(Debug)]
struct QueuedEnvelope {
    tier: u8,
    envelope: Envelope,
}

impl PartialEq for QueuedEnvelope {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedEnvelope {}

impl PartialOrd for QueuedEnvelope {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEnvelope {
    // BinaryHeap pops the maximum, so "greater" means dispatched sooner:
    // lower tier, then earlier timestamp, then smaller id.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .tier
            .cmp(&self.tier)
            .then_with(|| other.envelope.timestamp.cmp(&self.envelope.timestamp))
            .then_with(|| other.envelope.id.cmp(&self.envelope.id))
    }
}

/// The scheduler-owned message queue. Unbounded; only the dispatch loop
/// mutates it.
#[derive(Default)]
pub struct MessageQueue {
    heap: BinaryHeap<QueuedEnvelope>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, envelope: Envelope) {
        let tier = priority_tier(&envelope);
        self.heap.push(QueuedEnvelope { tier, envelope });
    }

    pub fn pop(&mut self) -> Option<Envelope> {
        self.heap.pop().map(|queued| queued.envelope)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Remove every queued envelope for the given task, preserving dispatch
    /// order. Used for breakpoint stashing and cancellation.
    pub fn drain_task(&mut self, task_id: Uuid) -> Vec<Envelope> {
        let mut drained = Vec::new();
        let mut kept = Vec::new();
        while let Some(queued) = self.heap.pop() {
            if queued.envelope.task_id == task_id {
                drained.push(queued.envelope);
            } else {
                kept.push(queued);
            }
        }
        self.heap.extend(kept);
        drained
    }
}

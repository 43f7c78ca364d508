use std::collections::VecDeque;

use crate::envelope::Envelope;

/// Per-task FIFO of envelopes awaiting dispatch, plus in-flight
/// accounting. `try_pop` enforces the `maxMessagesInFlight` bound at the
/// single point envelopes leave the queue, so callers cannot accidentally
/// dispatch past capacity.
pub struct PendingEnvelopeQueue {
    queue: VecDeque<Envelope>,
    in_flight: usize,
    max_in_flight: usize,
}

impl PendingEnvelopeQueue {
    pub fn new(max_in_flight: usize) -> Self {
        assert!(max_in_flight >= 1, "maxMessagesInFlight must be >= 1");
        Self {
            queue: VecDeque::new(),
            in_flight: 0,
            max_in_flight,
        }
    }

    pub fn push(&mut self, envelope: Envelope) {
        self.queue.push_back(envelope);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn has_capacity(&self) -> bool {
        self.in_flight < self.max_in_flight
    }

    /// Pops the next envelope for dispatch and increments `in_flight`, or
    /// returns `None` if the queue is empty or at capacity.
    pub fn try_pop(&mut self) -> Option<Envelope> {
        if !self.has_capacity() {
            return None;
        }
        let envelope = self.queue.pop_front()?;
        self.in_flight += 1;
        Some(envelope)
    }

    /// Records that one in-flight dispatch's callback has resolved
    /// (complete or failure).
    pub fn complete_one(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use crate::record::MessageRecord;

/// Min-heap of records keyed on forward time, FIFO for equal keys.
///
/// Many producers (one per TCP pump, one per UDP socket), one consumer (the
/// forwarder). The lock is held across the due-comparison so pop-if-due is a
/// single atomic operation rather than the pop-and-reinsert dance a
/// peek-less queue forces.
pub(crate) struct DelayQueue {
    inner: Mutex<Inner>,
}

struct Inner {
    heap: BinaryHeap<Entry>,
    /// Insertion sequence; breaks forward-time ties so release order matches
    /// receive order unless a hook reordered forward times.
    next_seq: u64,
}

struct Entry {
    record: MessageRecord,
    seq: u64,
}

impl DelayQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
        }
    }

    pub(crate) fn push(&self, record: MessageRecord) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(Entry { record, seq });
    }

    /// Remove and return the earliest record iff it is due at `now`.
    pub(crate) fn pop_due(&self, now: Instant) -> Option<MessageRecord> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        if inner.heap.peek()?.record.forward_time > now {
            return None;
        }

        inner.heap.pop().map(|e| e.record)
    }

    pub(crate) fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .heap
            .len()
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse both keys so the earliest
        // forward time (and lowest sequence within it) surfaces first.
        other
            .record
            .forward_time
            .cmp(&self.record.forward_time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Outbound;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    async fn record(number: u64, forward_offset: Duration) -> MessageRecord {
        let socket = Arc::new(tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let now = Instant::now();

        MessageRecord {
            sender: "alpha".to_owned(),
            recipient: "bravo_Actual".to_owned(),
            send_port: 40000,
            recv_port: 8000,
            message: number.to_string().into_bytes(),
            socket: Outbound::Udp(socket),
            message_number: number,
            receipt_time: now,
            forward_time: now + forward_offset,
            time_since_test_start: Duration::ZERO,
            drop_message: false,
            diagram_label: None,
            annotations: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn pops_nothing_before_forward_time() {
        let queue = DelayQueue::new();
        queue.push(record(0, Duration::from_secs(60)).await);

        assert!(queue.pop_due(Instant::now()).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn pops_earliest_due_record() {
        let queue = DelayQueue::new();
        queue.push(record(0, Duration::from_millis(5)).await);
        queue.push(record(1, Duration::ZERO).await);

        let later = Instant::now() + Duration::from_secs(1);

        assert_eq!(queue.pop_due(later).unwrap().message_number, 1);
        assert_eq!(queue.pop_due(later).unwrap().message_number, 0);
        assert!(queue.pop_due(later).is_none());
    }

    #[tokio::test]
    async fn equal_forward_times_release_in_insertion_order() {
        let queue = DelayQueue::new();

        let mut records = Vec::new();
        for n in 0..5 {
            records.push(record(n, Duration::ZERO).await);
        }
        // Pin them all to one instant so only the tie-break decides.
        let at = records[0].forward_time;
        for mut r in records {
            r.forward_time = at;
            queue.push(r);
        }

        let later = at + Duration::from_secs(1);
        for n in 0..5 {
            assert_eq!(queue.pop_due(later).unwrap().message_number, n);
        }
    }
}

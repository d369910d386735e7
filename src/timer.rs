//! Per-connection deadline table.
//!
//! Three deadlines per connection (connect, drain, request) plus nothing
//! else: the tick used for signal accounting is a cap on the poll timeout,
//! not a timer entry. Cancellation removes the live entry; stale heap
//! nodes are skipped on pop.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

use crate::connection::ConnId;

/// Which deadline fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    Connect,
    Drain,
    Request,
}

pub(crate) type TimerId = u64;

pub(crate) struct TimerTable {
    heap: BinaryHeap<Reverse<(Instant, TimerId)>>,
    live: HashMap<TimerId, (ConnId, TimerKind)>,
    next_id: TimerId,
}

impl TimerTable {
    pub(crate) fn new() -> Self {
        TimerTable {
            heap: BinaryHeap::new(),
            live: HashMap::new(),
            next_id: 0,
        }
    }

    pub(crate) fn arm(&mut self, deadline: Instant, conn: ConnId, kind: TimerKind) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.live.insert(id, (conn, kind));
        self.heap.push(Reverse((deadline, id)));
        id
    }

    pub(crate) fn cancel(&mut self, id: TimerId) {
        self.live.remove(&id);
    }

    /// Earliest live deadline. Pops stale (cancelled) heads on the way.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if self.live.contains_key(&id) {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Pop every live deadline at or before `now`.
    pub(crate) fn expire(&mut self, now: Instant) -> Vec<(ConnId, TimerKind)> {
        let mut fired = Vec::new();
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if let Some(entry) = self.live.remove(&id) {
                fired.push(entry);
            }
        }
        fired
    }

    #[cfg(test)]
    pub(crate) fn live_count(&self) -> usize {
        self.live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn expire_in_deadline_order() {
        let mut t = TimerTable::new();
        let now = Instant::now();
        t.arm(now + Duration::from_millis(20), 2, TimerKind::Drain);
        t.arm(now + Duration::from_millis(10), 1, TimerKind::Connect);
        t.arm(now + Duration::from_millis(30), 3, TimerKind::Request);

        let fired = t.expire(now + Duration::from_millis(25));
        assert_eq!(
            fired,
            vec![(1, TimerKind::Connect), (2, TimerKind::Drain)]
        );
        assert_eq!(t.live_count(), 1);
    }

    #[test]
    fn cancelled_timers_do_not_fire() {
        let mut t = TimerTable::new();
        let now = Instant::now();
        let a = t.arm(now, 1, TimerKind::Connect);
        t.arm(now, 2, TimerKind::Connect);
        t.cancel(a);
        let fired = t.expire(now);
        assert_eq!(fired, vec![(2, TimerKind::Connect)]);
    }

    #[test]
    fn next_deadline_skips_stale_heads() {
        let mut t = TimerTable::new();
        let now = Instant::now();
        let early = t.arm(now + Duration::from_millis(5), 1, TimerKind::Connect);
        t.arm(now + Duration::from_millis(50), 2, TimerKind::Request);
        t.cancel(early);
        let next = t.next_deadline().unwrap();
        assert!(next >= now + Duration::from_millis(50));
    }

    #[test]
    fn past_deadline_fires_immediately() {
        let mut t = TimerTable::new();
        let now = Instant::now();
        t.arm(now - Duration::from_millis(1), 7, TimerKind::Request);
        assert_eq!(t.expire(now), vec![(7, TimerKind::Request)]);
    }

    #[test]
    fn empty_table_has_no_deadline() {
        let mut t = TimerTable::new();
        assert_eq!(t.next_deadline(), None);
        assert!(t.expire(Instant::now()).is_empty());
    }
}

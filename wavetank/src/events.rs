//! Event scheduling and ordering for the simulation engine.
//!
//! Scheduled callbacks live in a slot arena keyed by [`EventId`] (index +
//! generation), while dispatch order is kept in a binary heap of
//! `(time, sequence)` entries. The split gives cheap cancellation: a cancel
//! empties the slot and bumps its generation, and the stale heap entry is
//! skipped when it eventually surfaces. A reused slot never honors an old
//! handle because the generation no longer matches.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::time::Duration;

use crate::sim::SimWorld;

/// Callback invoked when an event is dispatched.
pub(crate) type EventCallback = Box<dyn FnOnce(&SimWorld)>;

/// A weak handle to a scheduled event.
///
/// The holder never dereferences the handle; it is only passed back to the
/// scheduler for cancellation and pending-state queries. A handle stays
/// valid for the lifetime of the simulation: after its event has dispatched
/// or been cancelled it simply refers to nothing live, and cancelling it
/// again is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId {
    index: u32,
    generation: u64,
}

impl EventId {
    /// Handle that never refers to a live event. Returned by `schedule`
    /// calls made after the run loop has permanently stopped.
    pub(crate) const DEAD: EventId = EventId {
        index: u32::MAX,
        generation: u64::MAX,
    };
}

struct Slot {
    generation: u64,
    callback: Option<EventCallback>,
}

/// Slot arena owning the callbacks of all pending events.
pub(crate) struct EventArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl EventArena {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    /// Stores a callback and returns the handle to it.
    pub(crate) fn insert(&mut self, callback: EventCallback) -> EventId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.callback = Some(callback);
            EventId {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                callback: Some(callback),
            });
            EventId {
                index,
                generation: 0,
            }
        }
    }

    /// Removes and returns the callback for `id`, if it is still pending.
    ///
    /// The slot's generation is bumped so every outstanding handle to it
    /// goes stale before the slot can be reused. Both cancellation and
    /// dispatch funnel through here, which is what makes
    /// cancel-after-dispatch a structural no-op.
    pub(crate) fn take(&mut self, id: EventId) -> Option<EventCallback> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let callback = slot.callback.take()?;
        slot.generation += 1;
        self.free.push(id.index);
        self.live -= 1;
        Some(callback)
    }

    /// Returns `true` if `id` refers to an event that has not yet been
    /// dispatched or cancelled.
    pub(crate) fn is_pending(&self, id: EventId) -> bool {
        self.slots
            .get(id.index as usize)
            .map(|slot| slot.generation == id.generation && slot.callback.is_some())
            .unwrap_or(false)
    }

    /// Number of live (pending) events.
    pub(crate) fn len(&self) -> usize {
        self.live
    }
}

impl fmt::Debug for EventArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventArena")
            .field("live", &self.live)
            .field("slots", &self.slots.len())
            .finish()
    }
}

/// A heap entry for an event scheduled at a specific simulation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ScheduledEvent {
    time: Duration,
    sequence: u64, // For deterministic ordering
    id: EventId,
}

impl ScheduledEvent {
    pub(crate) fn new(time: Duration, sequence: u64, id: EventId) -> Self {
        Self { time, sequence, id }
    }

    pub(crate) fn time(&self) -> Duration {
        self.time
    }

    pub(crate) fn id(&self) -> EventId {
        self.id
    }
}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max heap, but we want earliest time first,
        // so both comparisons are reversed. Sequence breaks ties at the
        // same timestamp: earlier scheduling dispatches first.
        match other.time.cmp(&self.time) {
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            other => other,
        }
    }
}

/// Priority queue of scheduled events in `(time, sequence)` order.
#[derive(Debug)]
pub(crate) struct EventQueue {
    heap: BinaryHeap<ScheduledEvent>,
}

impl EventQueue {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
        }
    }

    pub(crate) fn schedule(&mut self, event: ScheduledEvent) {
        self.heap.push(event);
    }

    pub(crate) fn pop_earliest(&mut self) -> Option<ScheduledEvent> {
        self.heap.pop()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> EventCallback {
        Box::new(|_| {})
    }

    #[test]
    fn event_queue_ordering() {
        let mut arena = EventArena::new();
        let mut queue = EventQueue::new();

        let a = arena.insert(noop());
        let b = arena.insert(noop());
        let c = arena.insert(noop());

        queue.schedule(ScheduledEvent::new(Duration::from_millis(300), 0, a));
        queue.schedule(ScheduledEvent::new(Duration::from_millis(100), 1, b));
        queue.schedule(ScheduledEvent::new(Duration::from_millis(200), 2, c));

        let first = queue.pop_earliest().expect("queue has entries");
        assert_eq!(first.time(), Duration::from_millis(100));
        assert_eq!(first.id(), b);

        let second = queue.pop_earliest().expect("queue has entries");
        assert_eq!(second.time(), Duration::from_millis(200));
        assert_eq!(second.id(), c);

        let third = queue.pop_earliest().expect("queue has entries");
        assert_eq!(third.time(), Duration::from_millis(300));
        assert_eq!(third.id(), a);

        assert!(queue.is_empty());
    }

    #[test]
    fn same_time_deterministic_ordering() {
        let mut arena = EventArena::new();
        let mut queue = EventQueue::new();
        let same_time = Duration::from_millis(100);

        let first = arena.insert(noop());
        let second = arena.insert(noop());
        let third = arena.insert(noop());

        // Insert out of order; sequence decides.
        queue.schedule(ScheduledEvent::new(same_time, 2, third));
        queue.schedule(ScheduledEvent::new(same_time, 0, first));
        queue.schedule(ScheduledEvent::new(same_time, 1, second));

        assert_eq!(queue.pop_earliest().map(|e| e.id()), Some(first));
        assert_eq!(queue.pop_earliest().map(|e| e.id()), Some(second));
        assert_eq!(queue.pop_earliest().map(|e| e.id()), Some(third));
        assert!(queue.is_empty());
    }

    #[test]
    fn arena_take_makes_handle_stale() {
        let mut arena = EventArena::new();

        let id = arena.insert(noop());
        assert!(arena.is_pending(id));
        assert_eq!(arena.len(), 1);

        assert!(arena.take(id).is_some());
        assert!(!arena.is_pending(id));
        assert_eq!(arena.len(), 0);

        // Second take is a no-op, not an error.
        assert!(arena.take(id).is_none());
    }

    #[test]
    fn reused_slot_never_aliases_old_handle() {
        let mut arena = EventArena::new();

        let old = arena.insert(noop());
        assert!(arena.take(old).is_some());

        // The freed slot is reused with a new generation.
        let new = arena.insert(noop());
        assert_ne!(old, new);
        assert!(!arena.is_pending(old));
        assert!(arena.is_pending(new));

        // Cancelling through the stale handle must not touch the new event.
        assert!(arena.take(old).is_none());
        assert!(arena.is_pending(new));
    }

    #[test]
    fn dead_handle_is_never_pending() {
        let mut arena = EventArena::new();
        assert!(!arena.is_pending(EventId::DEAD));
        assert!(arena.take(EventId::DEAD).is_none());
    }
}

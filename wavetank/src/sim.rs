//! Core simulation world and event dispatch loop.
//!
//! [`SimWorld`] owns all mutable simulation state behind a single
//! `Rc<RefCell<..>>` and hands out [`WeakSimWorld`] handles for everything
//! that needs to call back in (sockets, applications, internal delivery
//! events). The handle pattern keeps ownership centralized and makes
//! re-entrant scheduling from inside a dispatching callback safe: the
//! borrow is always released before a callback runs.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tracing::{instrument, trace};

use crate::error::{SimulationError, SimulationResult};
use crate::events::{EventArena, EventCallback, EventId, EventQueue, ScheduledEvent};
use crate::network::config::NetworkConfiguration;
use crate::network::state::NetworkState;
use crate::rng::{reset_sim_rng, set_sim_seed};

#[derive(Debug)]
pub(crate) struct SimInner {
    pub(crate) current_time: Duration,
    pub(crate) event_queue: EventQueue,
    pub(crate) events: EventArena,
    pub(crate) next_sequence: u64,
    pub(crate) stopped: bool,
    pub(crate) network: NetworkState,
    pub(crate) events_processed: u64,
}

impl SimInner {
    fn new(network_config: NetworkConfiguration) -> Self {
        Self {
            current_time: Duration::ZERO,
            event_queue: EventQueue::new(),
            events: EventArena::new(),
            next_sequence: 0,
            stopped: false,
            network: NetworkState::new(network_config),
            events_processed: 0,
        }
    }

    /// Inserts a callback into the arena and its heap entry into the queue.
    pub(crate) fn schedule_locked(&mut self, time: Duration, callback: EventCallback) -> EventId {
        let id = self.events.insert(callback);
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.event_queue
            .schedule(ScheduledEvent::new(time, sequence, id));
        trace!(?time, sequence, ?id, "scheduled event");
        id
    }
}

/// The central simulation coordinator that manages time and event dispatch.
///
/// `SimWorld` is the authoritative source of simulated time. Applications
/// and sockets interact with it through [`WeakSimWorld`] handles, so the
/// world can be dropped without leaving dangling strong references behind.
#[derive(Debug)]
pub struct SimWorld {
    inner: Rc<RefCell<SimInner>>,
}

impl SimWorld {
    /// Creates a new simulation world with default network configuration
    /// and the default seed (0).
    pub fn new() -> Self {
        Self::new_with_network_config_and_seed(NetworkConfiguration::default(), 0)
    }

    /// Creates a new simulation world with a specific seed for
    /// deterministic randomness.
    pub fn new_with_seed(seed: u64) -> Self {
        Self::new_with_network_config_and_seed(NetworkConfiguration::default(), seed)
    }

    /// Creates a new simulation world with custom network configuration.
    pub fn new_with_network_config(network_config: NetworkConfiguration) -> Self {
        Self::new_with_network_config_and_seed(network_config, 0)
    }

    /// Creates a new simulation world with both custom network
    /// configuration and a specific seed.
    ///
    /// The thread-local RNG is reset before seeding, so consecutive
    /// simulations on the same thread are independent.
    pub fn new_with_network_config_and_seed(
        network_config: NetworkConfiguration,
        seed: u64,
    ) -> Self {
        reset_sim_rng();
        set_sim_seed(seed);

        Self {
            inner: Rc::new(RefCell::new(SimInner::new(network_config))),
        }
    }

    /// Returns the current simulation time.
    pub fn current_time(&self) -> Duration {
        self.inner.borrow().current_time
    }

    /// Schedules `callback` to run after `delay` of simulated time.
    ///
    /// Returns a handle usable only for [`SimWorld::cancel`] and
    /// [`SimWorld::is_pending`]. A zero delay is legal: the event still
    /// gets a fresh sequence number and dispatches after everything already
    /// queued for the current timestamp.
    ///
    /// After the run loop has permanently stopped this becomes a silent
    /// no-op returning a dead handle; simulations routinely create objects
    /// whose teardown schedules cleanup after the loop has exited.
    #[instrument(skip(self, callback))]
    pub fn schedule(&self, delay: Duration, callback: impl FnOnce(&SimWorld) + 'static) -> EventId {
        let mut inner = self.inner.borrow_mut();
        if inner.stopped {
            return EventId::DEAD;
        }
        let time = inner.current_time + delay;
        inner.schedule_locked(time, Box::new(callback))
    }

    /// Schedules `callback` at an absolute simulation time.
    ///
    /// Fails with [`SimulationError::InvalidDelay`] if `time` lies before
    /// the current simulation time; the relative [`SimWorld::schedule`]
    /// cannot express a negative delay at the type level, so this is where
    /// that error surfaces.
    #[instrument(skip(self, callback))]
    pub fn schedule_at(
        &self,
        time: Duration,
        callback: impl FnOnce(&SimWorld) + 'static,
    ) -> SimulationResult<EventId> {
        let mut inner = self.inner.borrow_mut();
        if inner.stopped {
            return Ok(EventId::DEAD);
        }
        if time < inner.current_time {
            return Err(SimulationError::InvalidDelay {
                target: time,
                now: inner.current_time,
            });
        }
        Ok(inner.schedule_locked(time, Box::new(callback)))
    }

    /// Cancels a pending event.
    ///
    /// No-op (not an error) if the event has already dispatched, was
    /// already cancelled, or the handle is stale. A cancelled event's
    /// callback is never invoked.
    pub fn cancel(&self, id: EventId) {
        let callback = self.inner.borrow_mut().events.take(id);
        // Dropped outside the borrow: the callback may own the last
        // reference to something whose teardown re-enters the scheduler.
        drop(callback);
    }

    /// Returns `true` if `id` refers to an event that has not yet been
    /// dispatched or cancelled.
    pub fn is_pending(&self, id: EventId) -> bool {
        self.inner.borrow().events.is_pending(id)
    }

    /// Processes the next pending event and advances time to its timestamp.
    ///
    /// Heap entries whose events were cancelled are skipped without
    /// advancing the clock. Returns `true` if more events remain after
    /// processing.
    #[instrument(skip(self))]
    pub fn step(&mut self) -> bool {
        let callback = {
            let mut inner = self.inner.borrow_mut();
            if inner.stopped {
                return false;
            }
            let mut callback = None;
            while let Some(entry) = inner.event_queue.pop_earliest() {
                if let Some(cb) = inner.events.take(entry.id()) {
                    inner.current_time = entry.time();
                    inner.events_processed += 1;
                    callback = Some(cb);
                    break;
                }
                // Stale entry for a cancelled event; drop it silently.
            }
            callback
        };

        match callback {
            Some(cb) => {
                cb(self);
                self.inner.borrow().events.len() > 0
            }
            None => false,
        }
    }

    /// Runs the dispatch loop until no events remain, or until the earliest
    /// pending event lies beyond `stop_time`.
    ///
    /// When a `stop_time` is given, the first event past it is left
    /// undispatched and the clock advances to `stop_time` itself. After
    /// `run` returns the world is permanently stopped: later `schedule`
    /// calls become silent no-ops.
    #[instrument(skip(self))]
    pub fn run(&mut self, stop_time: Option<Duration>) {
        let mut halted = false;
        loop {
            let callback = {
                let mut inner = self.inner.borrow_mut();
                if inner.stopped {
                    // stop() fired from inside a callback.
                    halted = true;
                    None
                } else {
                    let mut callback = None;
                    while let Some(entry) = inner.event_queue.pop_earliest() {
                        if !inner.events.is_pending(entry.id()) {
                            continue;
                        }
                        if let Some(stop) = stop_time {
                            if entry.time() > stop {
                                // Halt without dispatching; the entry stays queued.
                                inner.event_queue.schedule(entry);
                                break;
                            }
                        }
                        if let Some(cb) = inner.events.take(entry.id()) {
                            inner.current_time = entry.time();
                            inner.events_processed += 1;
                            callback = Some(cb);
                            break;
                        }
                    }
                    callback
                }
            };

            match callback {
                Some(cb) => cb(self),
                None => break,
            }
        }

        let mut inner = self.inner.borrow_mut();
        inner.stopped = true;
        if !inner.event_queue.is_empty() {
            trace!(
                remaining = inner.events.len(),
                "run loop stopped with events still queued"
            );
        }
        if !halted {
            if let Some(stop) = stop_time {
                if stop > inner.current_time {
                    inner.current_time = stop;
                }
            }
        }
    }

    /// Runs the dispatch loop until the queue is empty.
    pub fn run_until_empty(&mut self) {
        self.run(None);
    }

    /// Marks the world stopped.
    ///
    /// A running dispatch loop halts before invoking its next callback;
    /// later `schedule` calls become silent no-ops. Usable from inside a
    /// dispatching callback.
    pub fn stop(&self) {
        self.inner.borrow_mut().stopped = true;
    }

    /// Returns `true` if there are pending events waiting for dispatch.
    pub fn has_pending_events(&self) -> bool {
        self.pending_event_count() > 0
    }

    /// Returns the number of pending (not cancelled) events.
    pub fn pending_event_count(&self) -> usize {
        self.inner.borrow().events.len()
    }

    /// Total number of events dispatched so far.
    pub fn events_processed(&self) -> u64 {
        self.inner.borrow().events_processed
    }

    /// Creates a weak reference to this simulation world.
    pub fn downgrade(&self) -> WeakSimWorld {
        WeakSimWorld {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Runs `f` with mutable access to the inner state.
    ///
    /// Callers must not invoke user callbacks while inside `f`.
    pub(crate) fn with_inner<R>(&self, f: impl FnOnce(&mut SimInner) -> R) -> R {
        f(&mut self.inner.borrow_mut())
    }
}

impl Default for SimWorld {
    fn default() -> Self {
        Self::new()
    }
}

/// A weak reference to a simulation world.
///
/// Handle-based access for sockets, applications and internally scheduled
/// events. All operations return [`SimulationResult`] and fail with
/// [`SimulationError::SimulationShutdown`] once the world is dropped.
#[derive(Debug)]
pub struct WeakSimWorld {
    inner: Weak<RefCell<SimInner>>,
}

impl WeakSimWorld {
    /// Attempts to upgrade this weak reference to a strong one.
    pub fn upgrade(&self) -> SimulationResult<SimWorld> {
        self.inner
            .upgrade()
            .map(|inner| SimWorld { inner })
            .ok_or(SimulationError::SimulationShutdown)
    }

    /// Returns the current simulation time.
    pub fn current_time(&self) -> SimulationResult<Duration> {
        Ok(self.upgrade()?.current_time())
    }

    /// Schedules `callback` after `delay`; see [`SimWorld::schedule`].
    pub fn schedule(
        &self,
        delay: Duration,
        callback: impl FnOnce(&SimWorld) + 'static,
    ) -> SimulationResult<EventId> {
        Ok(self.upgrade()?.schedule(delay, callback))
    }

    /// Cancels a pending event; see [`SimWorld::cancel`].
    pub fn cancel(&self, id: EventId) -> SimulationResult<()> {
        self.upgrade()?.cancel(id);
        Ok(())
    }

    /// Returns `true` if `id` is still pending; see [`SimWorld::is_pending`].
    pub fn is_pending(&self, id: EventId) -> SimulationResult<bool> {
        Ok(self.upgrade()?.is_pending(id))
    }
}

impl Clone for WeakSimWorld {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn sim_world_basic_lifecycle() {
        let mut sim = SimWorld::new();

        assert_eq!(sim.current_time(), Duration::ZERO);
        assert!(!sim.has_pending_events());

        let fired = Rc::new(RefCell::new(false));
        let flag = fired.clone();
        sim.schedule(Duration::from_millis(100), move |_| {
            *flag.borrow_mut() = true;
        });

        assert!(sim.has_pending_events());
        assert_eq!(sim.pending_event_count(), 1);
        assert_eq!(sim.current_time(), Duration::ZERO); // Time hasn't advanced yet

        let has_more = sim.step();
        assert!(!has_more);
        assert!(*fired.borrow());
        assert_eq!(sim.current_time(), Duration::from_millis(100));
        assert!(!sim.has_pending_events());
    }

    #[test]
    fn events_dispatch_in_time_order() {
        let mut sim = SimWorld::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        for (label, delay) in [(3u32, 300u64), (1, 100), (2, 200)] {
            let order = order.clone();
            sim.schedule(Duration::from_millis(delay), move |_| {
                order.borrow_mut().push(label);
            });
        }

        sim.run_until_empty();
        assert_eq!(*order.borrow(), vec![1, 2, 3]);
        assert_eq!(sim.current_time(), Duration::from_millis(300));
    }

    #[test]
    fn same_time_events_dispatch_in_scheduling_order() {
        let mut sim = SimWorld::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        for label in [10u32, 20, 30] {
            let order = order.clone();
            sim.schedule(Duration::from_millis(100), move |_| {
                order.borrow_mut().push(label);
            });
        }

        sim.run_until_empty();
        assert_eq!(*order.borrow(), vec![10, 20, 30]);
    }

    #[test]
    fn cancelled_event_never_fires() {
        let mut sim = SimWorld::new();
        let fired = Rc::new(RefCell::new(false));

        let flag = fired.clone();
        let id = sim.schedule(Duration::from_millis(50), move |_| {
            *flag.borrow_mut() = true;
        });

        assert!(sim.is_pending(id));
        sim.cancel(id);
        assert!(!sim.is_pending(id));

        sim.run_until_empty();
        assert!(!*fired.borrow());
        // A skipped cancelled entry does not advance the clock.
        assert_eq!(sim.current_time(), Duration::ZERO);
    }

    #[test]
    fn cancel_after_dispatch_is_noop() {
        let mut sim = SimWorld::new();
        let id = sim.schedule(Duration::from_millis(5), |_| {});
        sim.run_until_empty();

        assert!(!sim.is_pending(id));
        sim.cancel(id); // Must not panic or affect anything.
    }

    #[test]
    fn reentrant_zero_delay_runs_after_queued_same_time_events() {
        let mut sim = SimWorld::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        // First event at t=100 schedules a zero-delay follow-up; the
        // already-queued second event at t=100 must dispatch before it.
        let o = order.clone();
        sim.schedule(Duration::from_millis(100), move |sim| {
            o.borrow_mut().push("first");
            let o = o.clone();
            sim.schedule(Duration::ZERO, move |_| {
                o.borrow_mut().push("follow-up");
            });
        });
        let o = order.clone();
        sim.schedule(Duration::from_millis(100), move |_| {
            o.borrow_mut().push("second");
        });

        sim.run_until_empty();
        assert_eq!(*order.borrow(), vec!["first", "second", "follow-up"]);
        assert_eq!(sim.current_time(), Duration::from_millis(100));
    }

    #[test]
    fn run_halts_at_stop_time_without_dispatching_beyond() {
        let mut sim = SimWorld::new();
        let fired = Rc::new(RefCell::new(Vec::new()));

        for delay in [100u64, 200, 300] {
            let fired = fired.clone();
            sim.schedule(Duration::from_millis(delay), move |_| {
                fired.borrow_mut().push(delay);
            });
        }

        sim.run(Some(Duration::from_millis(250)));
        assert_eq!(*fired.borrow(), vec![100, 200]);
        // Clock advances to the stop time, not to the undispatched event.
        assert_eq!(sim.current_time(), Duration::from_millis(250));
    }

    #[test]
    fn schedule_after_run_is_silent_noop() {
        let mut sim = SimWorld::new();
        sim.schedule(Duration::from_millis(10), |_| {});
        sim.run_until_empty();

        let fired = Rc::new(RefCell::new(false));
        let flag = fired.clone();
        let id = sim.schedule(Duration::from_millis(10), move |_| {
            *flag.borrow_mut() = true;
        });

        assert!(!sim.is_pending(id));
        sim.run_until_empty();
        assert!(!*fired.borrow());
    }

    #[test]
    fn schedule_at_rejects_past_times() {
        let mut sim = SimWorld::new();
        sim.schedule(Duration::from_millis(100), |_| {});
        sim.step();
        assert_eq!(sim.current_time(), Duration::from_millis(100));

        let err = sim
            .schedule_at(Duration::from_millis(50), |_| {})
            .expect_err("past target must be rejected");
        assert_eq!(
            err,
            SimulationError::InvalidDelay {
                target: Duration::from_millis(50),
                now: Duration::from_millis(100),
            }
        );
    }

    #[test]
    fn stop_from_callback_halts_run() {
        let mut sim = SimWorld::new();
        let fired = Rc::new(RefCell::new(Vec::new()));

        let f = fired.clone();
        sim.schedule(Duration::from_millis(10), move |sim| {
            f.borrow_mut().push(10u64);
            sim.stop();
        });
        let f = fired.clone();
        sim.schedule(Duration::from_millis(20), move |_| {
            f.borrow_mut().push(20);
        });

        sim.run(None);
        assert_eq!(*fired.borrow(), vec![10]);
        assert_eq!(sim.current_time(), Duration::from_millis(10));
    }

    #[test]
    fn clock_is_monotonic_across_run() {
        let mut sim = SimWorld::new();
        let times = Rc::new(RefCell::new(Vec::new()));

        for delay in [50u64, 10, 30, 10, 70] {
            let times = times.clone();
            sim.schedule(Duration::from_millis(delay), move |sim| {
                times.borrow_mut().push(sim.current_time());
            });
        }

        sim.run_until_empty();
        let times = times.borrow();
        for pair in times.windows(2) {
            assert!(pair[0] <= pair[1], "time went backwards: {:?}", *times);
        }
    }

    #[test]
    fn weak_sim_world_lifecycle() {
        let sim = SimWorld::new();
        let weak = sim.downgrade();

        assert_eq!(
            weak.current_time().expect("world is alive"),
            Duration::ZERO
        );
        weak.schedule(Duration::from_millis(100), |_| {})
            .expect("world is alive");
        assert!(sim.has_pending_events());

        drop(sim);

        assert_eq!(weak.current_time(), Err(SimulationError::SimulationShutdown));
        assert_eq!(
            weak.schedule(Duration::from_millis(100), |_| {}).err(),
            Some(SimulationError::SimulationShutdown)
        );
    }
}

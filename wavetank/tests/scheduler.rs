//! Scheduler ordering, determinism and cancellation scenarios.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use wavetank::SimWorld;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[test]
fn insertion_order_scenario() {
    init_tracing();
    // Schedule at t=5,3,3,1 in that insertion order; expected dispatch is
    // t=1, then the two t=3 events in their relative insertion order,
    // then t=5.
    let mut sim = SimWorld::new();
    let order = Rc::new(RefCell::new(Vec::new()));

    for (label, secs) in [("t5", 5u64), ("t3-first", 3), ("t3-second", 3), ("t1", 1)] {
        let order = order.clone();
        sim.schedule(Duration::from_secs(secs), move |_| {
            order.borrow_mut().push(label);
        });
    }

    sim.run_until_empty();
    assert_eq!(*order.borrow(), vec!["t1", "t3-first", "t3-second", "t5"]);
}

#[test]
fn identical_schedules_dispatch_identically() {
    init_tracing();
    // The core determinism guarantee: the same sequence of schedule calls
    // produces the same (time, order) progression on every run.
    fn run_once() -> Vec<(Duration, u32)> {
        let mut sim = SimWorld::new();
        let trace = Rc::new(RefCell::new(Vec::new()));

        for (task, millis) in [(1u32, 100u64), (2, 50), (3, 100), (4, 75), (5, 100)] {
            let trace = trace.clone();
            sim.schedule(Duration::from_millis(millis), move |sim| {
                trace.borrow_mut().push((sim.current_time(), task));
            });
        }

        sim.run_until_empty();
        Rc::try_unwrap(trace)
            .expect("no other holders")
            .into_inner()
    }

    let first = run_once();
    for _ in 0..9 {
        assert_eq!(run_once(), first);
    }

    let expected = vec![
        (Duration::from_millis(50), 2),
        (Duration::from_millis(75), 4),
        (Duration::from_millis(100), 1),
        (Duration::from_millis(100), 3),
        (Duration::from_millis(100), 5),
    ];
    assert_eq!(first, expected);
}

#[test]
fn cancel_from_earlier_event_suppresses_later_event() {
    init_tracing();
    let mut sim = SimWorld::new();
    let fired = Rc::new(RefCell::new(false));

    let flag = fired.clone();
    let victim = sim.schedule(Duration::from_secs(2), move |_| {
        *flag.borrow_mut() = true;
    });

    sim.schedule(Duration::from_secs(1), move |sim| {
        sim.cancel(victim);
    });

    sim.run_until_empty();
    assert!(!*fired.borrow());
    assert_eq!(sim.current_time(), Duration::from_secs(1));
}

#[test]
fn stale_handle_does_not_alias_a_reused_slot() {
    init_tracing();
    let mut sim = SimWorld::new();

    let first = sim.schedule(Duration::from_millis(10), |_| {});
    sim.run_until_empty();
    assert!(!sim.is_pending(first));

    // The next schedule may reuse the freed arena slot.
    let mut sim = SimWorld::new();
    let first = sim.schedule(Duration::from_millis(10), |_| {});
    sim.step();

    let fired = Rc::new(RefCell::new(false));
    let flag = fired.clone();
    let second = sim.schedule(Duration::from_millis(10), move |_| {
        *flag.borrow_mut() = true;
    });

    // Cancelling through the stale handle must not kill the new event.
    sim.cancel(first);
    assert!(sim.is_pending(second));

    sim.run_until_empty();
    assert!(*fired.borrow());
}

#[test]
fn reentrant_scheduling_during_run_dispatches_same_run() {
    init_tracing();
    let mut sim = SimWorld::new();
    let order = Rc::new(RefCell::new(Vec::new()));

    let o = order.clone();
    sim.schedule(Duration::from_secs(1), move |sim| {
        o.borrow_mut().push("tick");
        let o = o.clone();
        sim.schedule(Duration::from_secs(1), move |_| {
            o.borrow_mut().push("next-tick");
        });
    });

    sim.run_until_empty();
    assert_eq!(*order.borrow(), vec!["tick", "next-tick"]);
    assert_eq!(sim.current_time(), Duration::from_secs(2));
}

#[test]
fn run_with_stop_time_leaves_later_events_undispatched() {
    init_tracing();
    let mut sim = SimWorld::new();
    let fired = Rc::new(RefCell::new(Vec::new()));

    for secs in [1u64, 2, 3, 4] {
        let fired = fired.clone();
        sim.schedule(Duration::from_secs(secs), move |_| {
            fired.borrow_mut().push(secs);
        });
    }

    sim.run(Some(Duration::from_secs(2)));
    assert_eq!(*fired.borrow(), vec![1, 2]);
    assert_eq!(sim.current_time(), Duration::from_secs(2));

    // The world is permanently stopped afterwards.
    sim.run_until_empty();
    assert_eq!(*fired.borrow(), vec![1, 2]);
}

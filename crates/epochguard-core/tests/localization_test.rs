//! End-to-end detection and replay on the simulated collaborators.

#![allow(unsafe_code)]

use std::cell::{Cell, RefCell};

use epochguard_core::sim::{ScenarioOutcome, SimEngine, run_scenario};
use epochguard_core::{EngineOptions, EpochCoordinator, ThreadRecord};
use epochguard_membrane::{EngineConfig, FaultKind};

fn config(leak_check: bool) -> EngineConfig {
    EngineConfig {
        leak_check,
        ..EngineConfig::default()
    }
}

fn write_byte(addr: usize, value: u8) {
    // SAFETY: callers pass addresses inside the guarded heap mapping.
    unsafe { (addr as *mut u8).write_volatile(value) };
}

fn write_word(addr: usize, value: u64) {
    // SAFETY: as above; `addr` is word aligned.
    unsafe { (addr as *mut u64).write_volatile(value) };
}

/// Overflow one byte past a 16-byte object.
fn overflow(engine: &EpochCoordinator, me: &ThreadRecord) -> usize {
    let p = engine.malloc(me, 16).unwrap();
    for i in 0..=16 {
        write_byte(p + i, 0x41);
    }
    p
}

#[test]
fn clean_workload_commits_once() {
    let sim = SimEngine::new(config(true)).unwrap();
    let me = sim.init().unwrap();
    let outcome = run_scenario(&sim.engine, &me, |engine, me| {
        let p = engine.malloc(me, 64).unwrap();
        write_byte(p + 63, 1);
        let q = engine.calloc(me, 4, 8).unwrap();
        engine.free(me, p);
        engine.free(me, q);
        engine.teardown(me);
    });
    assert!(matches!(outcome, ScenarioOutcome::Completed { runs: 1 }));
    assert!(sim.sink.reports().is_empty());
}

#[test]
fn overflow_is_pinpointed_by_the_replay() {
    let sim = SimEngine::new(config(false)).unwrap();
    let me = sim.init().unwrap();
    let object = Cell::new(0);
    let outcome = run_scenario(&sim.engine, &me, |engine, me| {
        object.set(overflow(engine, me));
        engine.teardown(me);
    });
    assert_eq!(outcome.runs(), 2);
    let report = outcome.report().unwrap();
    assert_eq!(report.kind, FaultKind::Overflow);
    assert!(report.localized);
    assert_eq!(report.object_start, Some(object.get()));
    assert_eq!(report.object_size, Some(16));
    assert_eq!(report.offset, Some(16));
    assert!(report.alloc_site.is_some());
    assert!(report.call_site.is_some());
}

#[test]
fn overflow_into_the_next_header_is_pinpointed_with_leak_checks_on() {
    let sim = SimEngine::new(config(true)).unwrap();
    let me = sim.init().unwrap();
    let object = Cell::new(0);
    let outcome = run_scenario(&sim.engine, &me, |engine, me| {
        let p = engine.malloc(me, 16).unwrap();
        let q = engine.malloc(me, 16).unwrap();
        object.set(p);
        // Run past p's block, over q's header and into its payload.
        for at in p..q + 8 {
            write_byte(at, 0x41);
        }
        // q's header is garbage now; the free is ignored.
        engine.free(me, q);
        engine.free(me, p);
        engine.teardown(me);
    });
    assert_eq!(outcome.runs(), 2);
    let report = outcome.report().unwrap();
    assert_eq!(report.kind, FaultKind::Overflow);
    assert!(report.localized);
    assert_eq!(report.object_start, Some(object.get()));
    assert_eq!(report.offset, Some(16));
}

#[test]
fn overflow_with_default_config_is_pinpointed() {
    let sim = SimEngine::new(EngineConfig::default()).unwrap();
    let me = sim.init().unwrap();
    let object = Cell::new(0);
    let outcome = run_scenario(&sim.engine, &me, |engine, me| {
        object.set(overflow(engine, me));
        engine.teardown(me);
    });
    assert_eq!(outcome.runs(), 2);
    let report = outcome.report().unwrap();
    assert_eq!(report.kind, FaultKind::Overflow);
    assert!(report.localized);
    assert_eq!(report.object_start, Some(object.get()));
}

#[test]
fn write_after_free_is_pinpointed_with_the_free_site() {
    let sim = SimEngine::new(EngineConfig {
        quarantine_entries: 2,
        ..config(false)
    })
    .unwrap();
    let me = sim.init().unwrap();
    let freed = Cell::new(0);
    let outcome = run_scenario(&sim.engine, &me, |engine, me| {
        let p = engine.malloc(me, 32).unwrap();
        freed.set(p);
        engine.free(me, p);
        write_word(p + 8, 0x4141_4141_4141_4141);
        let q = engine.malloc(me, 32).unwrap();
        assert_ne!(q, p, "a quarantined block is not handed out again");
        // Evicting `p` finds the dangling write.
        engine.free(me, q);
        engine.teardown(me);
    });
    assert_eq!(outcome.runs(), 2);
    let report = outcome.report().unwrap();
    assert_eq!(report.kind, FaultKind::UseAfterFree);
    assert!(report.localized);
    assert_eq!(report.object_start, Some(freed.get()));
    assert_eq!(report.offset, Some(8));
    assert_eq!(report.observed, Some(0x4141_4141_4141_4141));
    assert!(report.free_site.is_some());
}

#[test]
fn leak_at_exit_reports_the_allocation_site() {
    let roots = Box::into_raw(Box::new([0usize; 4]));
    let start = roots as usize;
    let sim = SimEngine::with_options(
        config(true),
        EngineOptions {
            heap_capacity: 64 * 1024 * 1024,
            scan_stacks: false,
            extra_roots: vec![(start, start + std::mem::size_of::<[usize; 4]>())],
            ..EngineOptions::default()
        },
    )
    .unwrap();
    let me = sim.init().unwrap();
    let leaked = Cell::new(0);
    let outcome = run_scenario(&sim.engine, &me, |engine, me| {
        // SAFETY: `roots` stays allocated for the whole test.
        let slots = unsafe { &mut *roots };
        for slot in slots.iter_mut().take(3) {
            *slot = engine.malloc(me, 24).unwrap();
        }
        leaked.set(slots[1]);
        slots[1] = 0;
        engine.teardown(me);
    });
    assert_eq!(outcome.runs(), 2);
    let report = outcome.report().unwrap();
    assert_eq!(report.kind, FaultKind::Leak);
    assert!(report.localized);
    assert_eq!(report.object_start, Some(leaked.get()));
    assert_eq!(report.object_size, Some(24));
    assert!(report.alloc_site.is_some());
    // SAFETY: created by `Box::into_raw` above and no longer referenced.
    drop(unsafe { Box::from_raw(roots) });
}

#[test]
fn replayed_opens_return_the_recorded_descriptors() {
    let sim = SimEngine::new(config(false)).unwrap();
    let me = sim.init().unwrap();
    let seen = RefCell::new(Vec::new());
    let outcome = run_scenario(&sim.engine, &me, |engine, me| {
        let gw = engine.gateway();
        let flags = libc::O_CREAT | libc::O_RDWR;
        let a = gw.open(me, engine, c"/tmp/a", flags, 0o600).unwrap();
        let b = gw.open(me, engine, c"/tmp/b", flags, 0o600).unwrap();
        gw.close(me, engine, a).unwrap();
        let c = gw.open(me, engine, c"/tmp/c", flags, 0o600).unwrap();
        seen.borrow_mut().push([a, b, c]);
        overflow(engine, me);
        engine.teardown(me);
    });
    assert_eq!(outcome.runs(), 2);
    assert_eq!(outcome.report().unwrap().kind, FaultKind::Overflow);
    assert_eq!(*seen.borrow(), vec![[4, 5, 4], [4, 5, 4]]);
    // The replay reused the recorded descriptors instead of reopening.
    assert_eq!(sim.kernel.opens(), 3);
    assert!(sim.kernel.is_open(4));
    assert!(sim.kernel.is_open(5));
}

#[test]
fn corruption_missing_from_the_replay_is_reported_unlocalized() {
    let sim = SimEngine::new(config(false)).unwrap();
    let me = sim.init().unwrap();
    let runs = Cell::new(0);
    let outcome = run_scenario(&sim.engine, &me, |engine, me| {
        runs.set(runs.get() + 1);
        if runs.get() == 1 {
            overflow(engine, me);
        } else {
            engine.malloc(me, 16).unwrap();
        }
        engine.teardown(me);
    });
    assert_eq!(outcome.runs(), 2);
    let report = outcome.report().unwrap();
    assert_eq!(report.kind, FaultKind::Overflow);
    assert!(!report.localized);
}

//! Record/replay of intercepted calls across a rollback.
//!
//! Every workload ends in a one-byte overflow, so the engine rolls back
//! once and replays the calls before it reports.

#![allow(unsafe_code)]

use std::cell::RefCell;

use epochguard_core::sim::{SimEngine, run_scenario};
use epochguard_core::{EpochCoordinator, SyscallBackend, ThreadRecord};
use epochguard_membrane::{EngineConfig, FaultKind};

const RW: i32 = libc::O_CREAT | libc::O_RDWR;

fn quiet() -> SimEngine {
    SimEngine::new(EngineConfig {
        leak_check: false,
        ..EngineConfig::default()
    })
    .unwrap()
}

fn overflow_and_exit(engine: &EpochCoordinator, me: &ThreadRecord) {
    let p = engine.malloc(me, 16).unwrap();
    // SAFETY: the byte past a 16-byte payload lies inside its block.
    unsafe { ((p + 16) as *mut u8).write_volatile(0x41) };
    engine.teardown(me);
}

#[test]
fn dup2_over_an_open_descriptor_is_replayed() {
    let sim = quiet();
    let me = sim.init().unwrap();
    let seen = RefCell::new(Vec::new());
    let outcome = run_scenario(&sim.engine, &me, |engine, me| {
        let gw = engine.gateway();
        let a = gw.open(me, engine, c"/scratch/a", RW, 0o600).unwrap();
        let b = gw.open(me, engine, c"/scratch/b", RW, 0o600).unwrap();
        let dup = gw.dup2(me, engine, a, b).unwrap();
        seen.borrow_mut().push([a, b, dup]);
        overflow_and_exit(engine, me);
    });
    assert_eq!(outcome.runs(), 2);
    assert_eq!(outcome.report().unwrap().kind, FaultKind::Overflow);
    assert_eq!(*seen.borrow(), vec![[4, 5, 5], [4, 5, 5]]);
    assert_eq!(sim.kernel.opens(), 2);

    // After the replay, 5 is again a duplicate of a's description.
    assert!(sim.kernel.is_open(4));
    sim.kernel.write(5, b"dup").unwrap();
    assert_eq!(sim.kernel.contents("/scratch/a").as_deref(), Some(&b"dup"[..]));
    assert_eq!(sim.kernel.contents("/scratch/b").as_deref(), Some(&b""[..]));
}

#[test]
fn dup2_onto_a_free_number_is_replayed() {
    let sim = quiet();
    let me = sim.init().unwrap();
    let seen = RefCell::new(Vec::new());
    let outcome = run_scenario(&sim.engine, &me, |engine, me| {
        let gw = engine.gateway();
        let a = gw.open(me, engine, c"/scratch/a", RW, 0o600).unwrap();
        let dup = gw.dup2(me, engine, a, 9).unwrap();
        seen.borrow_mut().push([a, dup]);
        overflow_and_exit(engine, me);
    });
    assert_eq!(outcome.runs(), 2);
    assert_eq!(*seen.borrow(), vec![[4, 9], [4, 9]]);
    assert!(sim.kernel.is_open(9));
    assert_eq!(sim.kernel.opens(), 1);
}

#[test]
fn closed_streams_and_directories_come_back_on_replay() {
    let sim = quiet();
    let me = sim.init().unwrap();
    let seen = RefCell::new(Vec::new());
    let outcome = run_scenario(&sim.engine, &me, |engine, me| {
        let gw = engine.gateway();
        let f = gw.fopen(me, engine, c"/scratch/s", c"w").unwrap();
        gw.fclose(me, engine, f).unwrap();
        let d = gw.opendir(me, engine, c"/scratch").unwrap();
        gw.closedir(me, engine, d).unwrap();
        let g = gw.fopen(me, engine, c"/scratch/t", c"w").unwrap();
        seen.borrow_mut().push([f, d, g]);
        overflow_and_exit(engine, me);
    });
    assert_eq!(outcome.runs(), 2);
    let seen = seen.into_inner();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], seen[1]);
    // Nothing was reopened; the replay reused the sheltered descriptions.
    assert_eq!(sim.kernel.opens(), 3);
    let g = seen[1][2];
    assert_eq!(sim.kernel.fileno(g), Ok(4));
    assert!(sim.kernel.is_open(4));
}

#[test]
fn munmap_waits_for_the_commit() {
    let sim = quiet();
    let me = sim.init().unwrap();
    let gw = sim.engine.gateway();
    let map = gw
        .mmap(&me, &*sim.engine, 0, 8192, libc::PROT_READ, libc::MAP_PRIVATE | libc::MAP_ANONYMOUS, -1, 0)
        .unwrap();
    assert!(gw.munmap(&me, &*sim.engine, map + 1, 4096).is_err());
    gw.munmap(&me, &*sim.engine, map, 8192).unwrap();
    assert_eq!(sim.kernel.unmaps(), 0);

    sim.engine.epoch_end(&me, false);
    sim.engine.epoch_begin(&me);
    assert_eq!(sim.kernel.unmaps(), 1);
}

#[test]
fn rolled_back_munmap_never_reaches_the_kernel() {
    let sim = quiet();
    let me = sim.init().unwrap();
    let maps = RefCell::new(Vec::new());
    let outcome = run_scenario(&sim.engine, &me, |engine, me| {
        let gw = engine.gateway();
        let map = gw
            .mmap(me, engine, 0, 4096, libc::PROT_READ, libc::MAP_PRIVATE | libc::MAP_ANONYMOUS, -1, 0)
            .unwrap();
        gw.munmap(me, engine, map, 4096).unwrap();
        maps.borrow_mut().push(map);
        overflow_and_exit(engine, me);
    });
    assert_eq!(outcome.runs(), 2);
    let maps = maps.into_inner();
    // The replayed mmap returned the mapping from the first run.
    assert_eq!(maps[0], maps[1]);
    assert_eq!(sim.kernel.unmaps(), 0);
}

#[test]
fn clocks_return_the_recorded_values_on_replay() {
    let sim = quiet();
    let me = sim.init().unwrap();
    let seen = RefCell::new(Vec::new());
    let outcome = run_scenario(&sim.engine, &me, |engine, me| {
        let gw = engine.gateway();
        let t = gw.time(me, engine);
        let mut tv = libc::timeval { tv_sec: 0, tv_usec: 0 };
        gw.gettimeofday(me, engine, &mut tv).unwrap();
        seen.borrow_mut().push((t, tv.tv_sec, tv.tv_usec));
        overflow_and_exit(engine, me);
    });
    assert_eq!(outcome.runs(), 2);
    let seen = seen.into_inner();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], seen[1]);
    assert_eq!(seen[0].0 + 1, seen[0].1);
    // Only the first run reached the clock.
    assert_eq!(sim.kernel.time(), seen[0].1 + 1);
}

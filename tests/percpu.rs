// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

// Per-CPU cooling devices driven through the simulated injection primitive.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::bail;
use anyhow::Result;
use scx_idleclamp::config::Tunables;
use scx_idleclamp::cooling_error;
use scx_idleclamp::counters::FakeCounters;
use scx_idleclamp::duty_cycle::runtime;
use scx_idleclamp::inject::EndAction;
use scx_idleclamp::inject::IdleInjector;
use scx_idleclamp::inject::InjectCallbacks;
use scx_idleclamp::inject::InjectHandle;
use scx_idleclamp::probe::CpuFeatures;
use scx_idleclamp::sim::SimInjector;
use scx_idleclamp::sim::SimPlatform;
use scx_idleclamp::CoolingDevice;
use scx_idleclamp::CoolingError;
use scx_idleclamp::CounterId;
use scx_idleclamp::CpuCoolingRegistry;
use scx_idleclamp::Cpumask;

const NR_CPUS: usize = 4;
const IDLE_US: u32 = 24000;

struct Setup {
    sim: Arc<SimInjector>,
    counters: Arc<FakeCounters>,
    registry: CpuCoolingRegistry,
    online: Cpumask,
}

fn features() -> CpuFeatures {
    CpuFeatures {
        vendor: "GenuineIntel".to_string(),
        mwait: true,
    }
}

fn setup_with(tunables: Tunables) -> Setup {
    let sim = Arc::new(SimInjector::new());
    let counters = Arc::new(FakeCounters::new());
    for cpu in 0..NR_CPUS {
        counters.set_cpu(cpu, CounterId::Tsc, 1);
        counters.set_cpu(cpu, CounterId::Mperf, 1);
    }
    let registry = CpuCoolingRegistry::new(
        &features(),
        sim.clone(),
        counters.clone(),
        Arc::new(tunables),
        NR_CPUS,
    )
    .unwrap();
    for cpu in 0..NR_CPUS {
        registry.cpu_online(cpu).unwrap();
    }

    Setup {
        sim,
        counters,
        registry,
        online: Cpumask::full(NR_CPUS),
    }
}

fn setup() -> Setup {
    setup_with(Tunables::default())
}

/// Make `cpu` look `busy` percent busy over the next sample.
fn busy_for(counters: &FakeCounters, cpu: usize, busy: u64) {
    counters.add_cpu(cpu, CounterId::Tsc, 1000);
    counters.add_cpu(cpu, CounterId::Mperf, busy * 10);
}

struct Nop;

impl InjectCallbacks for Nop {
    fn end(&self, _cpu: usize, _idle_us: u32, _run_us: u32) -> EndAction {
        EndAction::Keep
    }
}

/// Forwards to the simulator, failing the next `stop` or `unregister` once
/// armed.
struct Flaky {
    sim: Arc<SimInjector>,
    fail_stop: AtomicBool,
    fail_unregister: AtomicBool,
}

impl Flaky {
    fn new(sim: Arc<SimInjector>) -> Self {
        Self {
            sim,
            fail_stop: AtomicBool::new(false),
            fail_unregister: AtomicBool::new(false),
        }
    }
}

impl IdleInjector for Flaky {
    fn register(
        &self,
        cpus: &Cpumask,
        callbacks: Arc<dyn InjectCallbacks>,
    ) -> Result<InjectHandle> {
        self.sim.register(cpus, callbacks)
    }

    fn set_duration(&self, handle: InjectHandle, run_us: u32, idle_us: u32) -> Result<()> {
        self.sim.set_duration(handle, run_us, idle_us)
    }

    fn set_latency(&self, handle: InjectHandle, latency_us: u32) -> Result<()> {
        self.sim.set_latency(handle, latency_us)
    }

    fn start(&self, handle: InjectHandle) -> Result<()> {
        self.sim.start(handle)
    }

    fn stop(&self, handle: InjectHandle) -> Result<()> {
        if self.fail_stop.swap(false, Ordering::SeqCst) {
            bail!("transient stop failure");
        }
        self.sim.stop(handle)
    }

    fn unregister(&self, handle: InjectHandle) -> Result<()> {
        if self.fail_unregister.swap(false, Ordering::SeqCst) {
            bail!("transient unregister failure");
        }
        self.sim.unregister(handle)
    }
}

fn setup_flaky() -> (Arc<SimInjector>, Arc<Flaky>, CpuCoolingRegistry) {
    let sim = Arc::new(SimInjector::new());
    let flaky = Arc::new(Flaky::new(sim.clone()));
    let counters = Arc::new(FakeCounters::new());
    let registry = CpuCoolingRegistry::new(
        &features(),
        flaky.clone(),
        counters,
        Arc::new(Tunables::default()),
        NR_CPUS,
    )
    .unwrap();
    for cpu in 0..NR_CPUS {
        registry.cpu_online(cpu).unwrap();
    }
    (sim, flaky, registry)
}

#[test]
fn test_release_exactly_once() {
    let s = setup();
    let dev = s.registry.device(1).unwrap();

    dev.set_cur_state(30).unwrap();
    dev.set_cur_state(50).unwrap();
    assert!(dev.is_active());
    dev.set_cur_state(0).unwrap();

    assert!(!dev.is_active());
    assert_eq!(dev.cur_state(), Some(0));
    assert_eq!(s.sim.nr_registered(), 1);
    assert_eq!(s.sim.nr_unregistered(), 1);
    assert_eq!(s.sim.owner(1), None);

    dev.set_cur_state(0).unwrap();
    assert_eq!(s.sim.nr_unregistered(), 1);
}

#[test]
fn test_same_level_keeps_handle() {
    let s = setup();
    let dev = s.registry.device(2).unwrap();

    dev.set_cur_state(40).unwrap();
    let handle = dev.handle().unwrap();
    dev.set_cur_state(40).unwrap();
    assert_eq!(dev.handle(), Some(handle));
    assert_eq!(s.sim.nr_registered(), 1);

    dev.set_cur_state(60).unwrap();
    assert_eq!(dev.handle(), Some(handle));
    let info = s.sim.device(handle).unwrap();
    assert!(info.running);
    assert_eq!(info.idle_us, IDLE_US);
    assert_eq!(info.run_us, runtime(IDLE_US, 60));
}

#[test]
fn test_level_clamped_to_max() {
    let s = setup();
    let dev = s.registry.device(0).unwrap();
    assert_eq!(dev.max_state(), 100);
    assert_eq!(dev.name(), "idle-0");

    dev.set_cur_state(150).unwrap();
    assert_eq!(dev.cur_state(), Some(100));
    assert_eq!(dev.run_duration(), runtime(IDLE_US, 99));
}

#[test]
fn test_hysteresis_compensates_and_restores() {
    let s = setup();
    let dev = s.registry.device(1).unwrap();
    dev.set_cur_state(60).unwrap();
    let handle = dev.handle().unwrap();
    let nominal = runtime(IDLE_US, 60);

    // The first window after registration only takes a snapshot.
    s.sim.run_period(&s.online);
    assert!(!dev.compensating());
    assert_eq!(s.sim.device(handle).unwrap().run_us, nominal);

    // 50% effective idle against a 60% target.
    busy_for(&s.counters, 1, 50);
    s.sim.run_period(&s.online);
    assert!(dev.compensating());
    let run_us = s.sim.device(handle).unwrap().run_us;
    assert_eq!(run_us, runtime(IDLE_US, 50));
    assert!(run_us > nominal);

    // 58% is within the margin.
    busy_for(&s.counters, 1, 42);
    s.sim.run_period(&s.online);
    assert!(!dev.compensating());
    assert_eq!(s.sim.device(handle).unwrap().run_us, nominal);

    // Within the margin without prior compensation changes nothing.
    busy_for(&s.counters, 1, 42);
    s.sim.run_period(&s.online);
    assert!(!dev.compensating());
    assert_eq!(s.sim.device(handle).unwrap().run_us, nominal);
}

#[test]
fn test_unreadable_counter_keeps_duration() {
    let s = setup();
    let dev = s.registry.device(3).unwrap();
    dev.set_cur_state(60).unwrap();
    let handle = dev.handle().unwrap();

    s.sim.run_period(&s.online);
    s.counters.remove(CounterId::Mperf);
    s.sim.run_period(&s.online);
    assert!(!dev.compensating());
    assert_eq!(s.sim.device(handle).unwrap().run_us, runtime(IDLE_US, 60));
}

#[test]
fn test_busy_leaves_level_unchanged() {
    let s = setup();
    let other = s
        .sim
        .register(&Cpumask::of_cpu(2, NR_CPUS).unwrap(), Arc::new(Nop))
        .unwrap();

    let dev = s.registry.device(2).unwrap();
    let err = dev.set_cur_state(30).unwrap_err();
    assert_eq!(
        cooling_error(&err),
        Some(&CoolingError::AlreadyClaimed { cpu: 2 })
    );
    assert_eq!(dev.cur_state(), Some(0));
    assert!(!dev.is_active());

    // Retried once the other owner lets go.
    s.sim.unregister(other).unwrap();
    dev.set_cur_state(30).unwrap();
    assert!(dev.is_active());
}

#[test]
fn test_latency_applied_at_register() {
    let s = setup_with(Tunables::new(IDLE_US, 2, 500).unwrap());
    let dev = s.registry.device(0).unwrap();
    dev.set_cur_state(10).unwrap();
    let info = s.sim.device(dev.handle().unwrap()).unwrap();
    assert_eq!(info.latency_us, 500);
}

#[test]
fn test_offline_tears_down() {
    let s = setup();
    let dev = s.registry.device(3).unwrap();
    dev.set_cur_state(30).unwrap();

    s.registry.cpu_offline(3).unwrap();
    assert!(s.registry.device(3).is_none());
    assert!(!dev.is_active());
    assert_eq!(s.sim.nr_unregistered(), 1);
    assert_eq!(s.registry.cpus(), vec![0, 1, 2]);

    // A fresh device shows up when the CPU returns.
    let dev = s.registry.cpu_online(3).unwrap();
    assert_eq!(dev.cur_state(), Some(0));
}

#[test]
fn test_shutdown_releases_everything() {
    let s = setup();
    for cpu in 0..NR_CPUS {
        s.registry.device(cpu).unwrap().set_cur_state(20).unwrap();
    }
    assert_eq!(s.sim.nr_live(), NR_CPUS);

    s.registry.shutdown().unwrap();
    assert_eq!(s.sim.nr_live(), 0);
    assert_eq!(s.sim.nr_unregistered(), NR_CPUS as u64);
    assert!(s.registry.cpus().is_empty());
}

#[test]
fn test_simulated_shortfall_compensates() {
    let s = setup();
    let platform = SimPlatform::new(s.counters.clone(), NR_CPUS, 80);
    let dev = s.registry.device(0).unwrap();
    dev.set_cur_state(50).unwrap();
    let handle = dev.handle().unwrap();

    // Only 80% of each idle window is really idle, 40% instead of 50%.
    for _ in 0..2 {
        let windows = s.sim.run_period(&s.online);
        platform.advance(&windows);
    }
    assert!(dev.compensating());
    assert!(s.sim.device(handle).unwrap().run_us > runtime(IDLE_US, 50));
}

#[test]
fn test_concurrent_level_reads() {
    let s = setup();
    let dev = s.registry.device(1).unwrap();
    let levels = [0, 30, 70];

    std::thread::scope(|scope| {
        scope.spawn(|| {
            for i in 0..=300 {
                dev.set_cur_state(levels[i % levels.len()]).unwrap();
            }
        });
        for _ in 0..3 {
            scope.spawn(|| {
                for _ in 0..1000 {
                    let level = dev.cur_state().unwrap();
                    assert!(levels.contains(&level));
                }
            });
        }
    });

    assert_eq!(s.sim.nr_registered(), s.sim.nr_unregistered());
}

#[test]
fn test_failed_stop_still_releases() {
    let (sim, flaky, registry) = setup_flaky();
    let dev = registry.device(0).unwrap();

    dev.set_cur_state(30).unwrap();
    flaky.fail_stop.store(true, Ordering::SeqCst);
    dev.set_cur_state(0).unwrap();
    assert!(!dev.is_active());
    assert_eq!(sim.nr_live(), 0);
    assert_eq!(sim.owner(0), None);

    dev.set_cur_state(30).unwrap();
    assert!(dev.is_active());
}

#[test]
fn test_failed_unregister_can_be_retried() {
    let (sim, flaky, registry) = setup_flaky();
    let dev = registry.device(1).unwrap();
    dev.set_cur_state(30).unwrap();
    let handle = dev.handle().unwrap();

    flaky.fail_unregister.store(true, Ordering::SeqCst);
    assert!(dev.set_cur_state(0).is_err());
    assert_eq!(dev.handle(), Some(handle));
    assert_eq!(dev.cur_state(), Some(30));

    dev.set_cur_state(0).unwrap();
    assert!(!dev.is_active());
    assert_eq!(sim.nr_live(), 0);
}

#[test]
fn test_shutdown_continues_past_failure() {
    let (sim, flaky, registry) = setup_flaky();
    for cpu in 0..NR_CPUS {
        registry.device(cpu).unwrap().set_cur_state(20).unwrap();
    }

    // Devices are shut down in CPU order, the first one fails to release.
    flaky.fail_unregister.store(true, Ordering::SeqCst);
    assert!(registry.shutdown().is_err());
    assert_eq!(sim.nr_live(), 1);
    assert_eq!(registry.cpus(), vec![0]);
    assert!(sim.owner(0).is_some());

    registry.shutdown().unwrap();
    assert_eq!(sim.nr_live(), 0);
    assert!(registry.cpus().is_empty());
}

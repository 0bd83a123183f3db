// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Package-wide idle injection.
//!
//! A single target ratio is applied to every present CPU so that idle
//! windows line up and the package can drop into deep C-states. One online
//! CPU, the control CPU, owns the feedback loop: at every window boundary
//! its `begin()` callback samples the package C-state residency, feeds the
//! calibration table and decides whether the whole package can skip
//! injection because it already idles enough. Every `end()` callback latches
//! the requested target and recomputes the run duration from the
//! compensated level.
//!
//! While clamping, a poller samples the package residency once per second
//! with its own snapshots; that value is what `cur_state()` reports.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use crossbeam::channel::RecvTimeoutError;
use crossbeam::channel::Sender;
use log::debug;
use log::info;
use log::trace;
use log::warn;

use crate::calibration::Adjustment;
use crate::calibration::CalibrationTable;
use crate::config::Tunables;
use crate::config::TICK_USEC;
use crate::duty_cycle::runtime;
use crate::inject::BeginAction;
use crate::inject::EndAction;
use crate::inject::IdleInjector;
use crate::inject::InjectCallbacks;
use crate::inject::InjectHandle;
use crate::probe::probe_package_clamp;
use crate::probe::CpuFeatures;
use crate::sampler::ResidencySampler;
use crate::sampler::ResidencySource;
use crate::sampler::Sample;
use crate::sampler::FIRST_SAMPLE_RATIO;
use crate::stats::CalibrationDump;
use crate::stats::Metrics;
use crate::topology::current_cpu;
use crate::topology::BOOT_CPU;
use crate::CoolingDevice;
use crate::CounterReader;
use crate::Cpumask;
use crate::Topology;

/// Number of calibration levels. Targets go up to `MAX_TARGET_RATIO - 1`.
pub const MAX_TARGET_RATIO: u32 = 50;

pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// State shared with the injection callbacks and the poller.
struct ClampState {
    /// Last target requested through `set_cur_state()`.
    set_target_ratio: AtomicU32,
    /// Ratio measured over the last window by the control CPU.
    current_ratio: AtomicU32,
    /// Ratio measured by the poller.
    pkg_cstate_ratio_cur: AtomicU32,
    should_skip: AtomicBool,
    clamping: AtomicBool,
    control_cpu: AtomicUsize,

    // Latched at every end() so a new request applies from the next round.
    count: AtomicU32,
    target_ratio: AtomicU32,
    guard: AtomicU32,
    window_size_now: AtomicU32,

    calibration: CalibrationTable,
    sampler: ResidencySampler,
    poll_sampler: ResidencySampler,
    reader: Arc<dyn CounterReader>,
    tunables: Arc<Tunables>,
    metrics: Metrics,
}

fn guard_for(target: u32) -> u32 {
    1 + target / 20
}

impl ClampState {
    fn latch(&self) {
        let target = self.set_target_ratio.load(Ordering::Acquire);
        self.target_ratio.store(target, Ordering::Release);
        self.guard.store(guard_for(target), Ordering::Release);
        self.window_size_now
            .store(self.tunables.window_size(), Ordering::Release);
    }

    /// Run duration for the latched target, compensated by what the
    /// calibration table learned.
    fn run_time(&self) -> u32 {
        let target = self.target_ratio.load(Ordering::Acquire);
        let level = self.calibration.compensated_level(target);
        runtime(self.tunables.idle_duration_us(), level)
    }

    /// Evaluate the window that just ended. Returns whether the package is
    /// already above target plus guard.
    fn adjust_controls(&self, cpu: usize) -> bool {
        let target = self.target_ratio.load(Ordering::Acquire);
        let guard = self.guard.load(Ordering::Acquire);

        match self.sampler.sample(self.reader.as_ref(), cpu) {
            Sample::Ratio(ratio) => {
                self.current_ratio.store(ratio, Ordering::Release);
                let requested = self.set_target_ratio.load(Ordering::Acquire);
                match self.calibration.adjust(target, requested, ratio) {
                    Adjustment::Clean { delta } => {
                        trace!("level {}: clean delta {}", target, delta);
                        self.metrics.clean_samples.increment(1);
                    }
                    Adjustment::Discarded { delta } => {
                        trace!("level {}: discarded delta {}", target, delta);
                        self.metrics.discarded_samples.increment(1);
                    }
                    Adjustment::Frozen => {}
                }
            }
            Sample::Warmup => {
                self.current_ratio
                    .store(FIRST_SAMPLE_RATIO, Ordering::Release);
            }
            Sample::Unreadable => self.metrics.unreadable_samples.increment(1),
            Sample::Stalled => {}
        }

        self.set_target_ratio.load(Ordering::Acquire) + guard
            <= self.current_ratio.load(Ordering::Acquire)
    }

    fn poll(&self) {
        let cpu = self.control_cpu.load(Ordering::Acquire);
        let sample = self.poll_sampler.sample(self.reader.as_ref(), cpu);
        if let Some(ratio) = sample.ratio() {
            self.pkg_cstate_ratio_cur.store(ratio, Ordering::Release);
            self.metrics.pkg_cstate_ratio.set(ratio as f64);
        }
    }
}

impl InjectCallbacks for ClampState {
    fn begin(&self, cpu: usize, _idle_us: u32, _run_us: u32) -> BeginAction {
        // Only the control CPU collects stats and updates the controls.
        if cpu == self.control_cpu.load(Ordering::Acquire) {
            let window = self.window_size_now.load(Ordering::Acquire).max(1);
            if self.count.load(Ordering::Acquire) % window == 0 {
                let skip = self.adjust_controls(cpu);
                self.should_skip.store(skip, Ordering::Release);
            }
        }

        if self.should_skip.load(Ordering::Acquire) {
            self.metrics.skipped_periods.increment(1);
            BeginAction::Skip
        } else {
            BeginAction::Inject
        }
    }

    fn end(&self, cpu: usize, _idle_us: u32, _run_us: u32) -> EndAction {
        self.latch();
        if cpu == self.control_cpu.load(Ordering::Acquire) {
            self.count.fetch_add(1, Ordering::AcqRel);
        }
        EndAction::Reprogram {
            run_us: self.run_time(),
        }
    }
}

struct Poller {
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

impl Poller {
    fn spawn(state: Arc<ClampState>, interval: Duration) -> Result<Self> {
        let (stop, stop_rx) = crossbeam::channel::bounded::<()>(1);
        let thread = std::thread::Builder::new()
            .name("idleclamp-poll".into())
            .spawn(move || loop {
                state.poll();
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    _ => break,
                }
            })
            .context("Failed to spawn the package C-state poller")?;
        Ok(Self { stop, thread })
    }

    fn cancel(self) {
        let _ = self.stop.send(());
        if self.thread.join().is_err() {
            warn!("package C-state poller panicked");
        }
    }
}

struct Session {
    handle: InjectHandle,
    poller: Option<Poller>,
}

/// The package-wide idle injection cooling device.
pub struct PowerClamp {
    state: Arc<ClampState>,
    session: Mutex<Option<Session>>,
    online: Mutex<Cpumask>,
    present: Cpumask,
    injector: Arc<dyn IdleInjector>,
    poll_interval: Option<Duration>,
}

impl PowerClamp {
    /// Probe the hardware and set up an idle device. Clamping starts with
    /// the first non-zero `set_cur_state()`.
    pub fn new(
        features: &CpuFeatures,
        injector: Arc<dyn IdleInjector>,
        reader: Arc<dyn CounterReader>,
        topo: &Topology,
        tunables: Arc<Tunables>,
    ) -> Result<Self> {
        let probe_cpu = topo.online().first().unwrap_or(BOOT_CPU);
        probe_package_clamp(features, reader.as_ref(), probe_cpu)?;

        let state = ClampState {
            set_target_ratio: AtomicU32::new(0),
            current_ratio: AtomicU32::new(0),
            pkg_cstate_ratio_cur: AtomicU32::new(0),
            should_skip: AtomicBool::new(false),
            clamping: AtomicBool::new(false),
            control_cpu: AtomicUsize::new(BOOT_CPU),
            count: AtomicU32::new(0),
            target_ratio: AtomicU32::new(0),
            guard: AtomicU32::new(1),
            window_size_now: AtomicU32::new(tunables.window_size()),
            calibration: CalibrationTable::new(MAX_TARGET_RATIO as usize),
            sampler: ResidencySampler::new(ResidencySource::package()),
            poll_sampler: ResidencySampler::new(ResidencySource::package()),
            reader,
            tunables,
            metrics: Metrics::new(),
        };

        Ok(Self {
            state: Arc::new(state),
            session: Mutex::new(None),
            online: Mutex::new(topo.online().clone()),
            present: topo.present().clone(),
            injector,
            poll_interval: Some(POLL_INTERVAL),
        })
    }

    /// Change the poll period, `None` disables the poller thread and leaves
    /// polling to `poll_once()`.
    pub fn with_poll_interval(mut self, interval: Option<Duration>) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn control_cpu(&self) -> usize {
        self.state.control_cpu.load(Ordering::Acquire)
    }

    pub fn clamping(&self) -> bool {
        self.state.clamping.load(Ordering::Acquire)
    }

    pub fn target_ratio(&self) -> u32 {
        self.state.set_target_ratio.load(Ordering::Acquire)
    }

    /// Ratio measured over the last calibration window.
    pub fn current_ratio(&self) -> u32 {
        self.state.current_ratio.load(Ordering::Acquire)
    }

    pub fn should_skip(&self) -> bool {
        self.state.should_skip.load(Ordering::Acquire)
    }

    pub fn calibration(&self) -> &CalibrationTable {
        &self.state.calibration
    }

    pub fn online(&self) -> Cpumask {
        self.online.lock().unwrap().clone()
    }

    pub fn handle(&self) -> Option<InjectHandle> {
        self.session.lock().unwrap().as_ref().map(|s| s.handle)
    }

    fn set_control_cpu(&self, cpu: usize) {
        self.state.control_cpu.store(cpu, Ordering::Release);
        self.state.metrics.control_cpu.set(cpu as f64);
    }

    /// Prefer the boot CPU, then the one we are running on, then whatever
    /// is online.
    fn elect(&self) {
        let online = self.online.lock().unwrap();
        let cpu = if online.test_cpu(BOOT_CPU) {
            BOOT_CPU
        } else {
            match current_cpu() {
                Some(cpu) if online.test_cpu(cpu) => cpu,
                _ => online.first().unwrap_or(BOOT_CPU),
            }
        };
        debug!("control cpu {}", cpu);
        self.set_control_cpu(cpu);
    }

    fn start(&self, session: &mut Option<Session>) -> Result<()> {
        self.elect();

        let state = self.state.clone();
        let callbacks: Arc<dyn InjectCallbacks> = state.clone();
        let handle = self
            .injector
            .register(&self.present, callbacks)
            .context("Failed to register package idle injection")?;

        let idle_us = state.tunables.idle_duration_us();
        let res = self
            .injector
            .set_duration(handle, TICK_USEC, idle_us)
            .and_then(|_| self.injector.set_latency(handle, u32::MAX));
        if let Err(e) = res {
            let _ = self.injector.unregister(handle);
            return Err(e);
        }

        state.sampler.reset();
        state.poll_sampler.reset();
        state.count.store(0, Ordering::Release);
        state.should_skip.store(false, Ordering::Release);
        state.latch();

        let res = self
            .injector
            .set_duration(handle, state.run_time(), idle_us)
            .and_then(|_| self.injector.start(handle));
        if let Err(e) = res {
            let _ = self.injector.unregister(handle);
            return Err(e);
        }
        state.clamping.store(true, Ordering::Release);

        let poller = match self.poll_interval {
            Some(interval) => match Poller::spawn(state.clone(), interval) {
                Ok(poller) => Some(poller),
                Err(e) => {
                    warn!("{:#}, cur_state will not be refreshed", e);
                    None
                }
            },
            None => {
                state.poll();
                None
            }
        };

        *session = Some(Session { handle, poller });
        Ok(())
    }

    /// The session is only dropped once its registration is gone, so a
    /// failed unregister can be retried.
    fn stop(&self, session: &mut Option<Session>) -> Result<()> {
        let Some(Session { handle, poller }) = session.as_mut() else {
            return Ok(());
        };
        let handle = *handle;

        self.state.clamping.store(false, Ordering::Release);
        if let Some(poller) = poller.take() {
            poller.cancel();
        }
        if let Err(e) = self.injector.stop(handle) {
            warn!("Failed to stop package idle injection: {:#}", e);
        }
        self.injector
            .unregister(handle)
            .context("Failed to release package idle injection")?;
        *session = None;
        Ok(())
    }

    /// One poll of the package C-state ratio reported by `cur_state()`.
    pub fn poll_once(&self) {
        self.state.poll();
    }

    /// Hotplug: `cpu` came online.
    pub fn cpu_online(&self, cpu: usize) -> Result<()> {
        let mut online = self.online.lock().unwrap();
        online.set_cpu(cpu)?;
        if !self.clamping() {
            return Ok(());
        }

        // The boot CPU takes control back when it returns.
        if cpu == BOOT_CPU {
            info!("boot cpu back online, taking control back");
            self.set_control_cpu(BOOT_CPU);
        }
        Ok(())
    }

    /// Hotplug: `cpu` is about to go offline. A new control CPU is elected
    /// before the departing one is gone.
    pub fn cpu_predown(&self, cpu: usize) -> Result<()> {
        let mut online = self.online.lock().unwrap();
        if cpu == self.control_cpu() {
            let next = match online.first() {
                Some(first) if first == cpu => online.next_after(cpu),
                first => first,
            };
            match next {
                Some(next) => {
                    info!("control cpu {} going down, cpu {} takes over", cpu, next);
                    self.set_control_cpu(next);
                }
                None => warn!("no cpu left to take control from cpu {}", cpu),
            }
        }
        online.clear_cpu(cpu)
    }

    /// Snapshot of the calibration state.
    pub fn dump(&self) -> CalibrationDump {
        CalibrationDump {
            control_cpu: self.control_cpu(),
            clamping: self.clamping(),
            target_ratio: self.target_ratio(),
            current_ratio: self.current_ratio(),
            tunables: Some(self.state.tunables.snapshot()),
            rows: self.state.calibration.rows(),
        }
    }

    /// Stop clamping, if active, and cancel the poller.
    pub fn shutdown(&self) -> Result<()> {
        let mut session = self.session.lock().unwrap();
        self.stop(&mut session)?;
        self.state.set_target_ratio.store(0, Ordering::Release);
        Ok(())
    }
}

impl CoolingDevice for PowerClamp {
    fn name(&self) -> String {
        "intel_powerclamp".to_string()
    }

    fn max_state(&self) -> u32 {
        MAX_TARGET_RATIO - 1
    }

    fn cur_state(&self) -> Option<u32> {
        // Not polled while idle, there is nothing meaningful to report.
        if self.clamping() {
            Some(self.state.pkg_cstate_ratio_cur.load(Ordering::Acquire))
        } else {
            None
        }
    }

    fn set_cur_state(&self, state: u32) -> Result<()> {
        let mut session = self.session.lock().unwrap();
        let new_target = state.min(MAX_TARGET_RATIO - 1);
        let cur_target = self.state.set_target_ratio.load(Ordering::Acquire);

        if cur_target == 0 && new_target > 0 {
            info!("Start idle injection to reduce power, target {}%", new_target);
            self.state
                .set_target_ratio
                .store(new_target, Ordering::Release);
            if let Err(e) = self.start(&mut session) {
                self.state.set_target_ratio.store(0, Ordering::Release);
                return Err(e);
            }
        } else if cur_target > 0 && new_target == 0 {
            info!("Stop forced idle injection");
            self.stop(&mut session)?;
            self.state.set_target_ratio.store(0, Ordering::Release);
        } else {
            self.state
                .set_target_ratio
                .store(new_target, Ordering::Release);
        }
        Ok(())
    }
}

impl Drop for PowerClamp {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("Failed to stop idle injection: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::CounterId;
    use crate::counters::FakeCounters;
    use crate::sim::SimInjector;

    fn features() -> CpuFeatures {
        CpuFeatures {
            vendor: "GenuineIntel".to_string(),
            mwait: true,
        }
    }

    fn setup(nr_cpus: usize) -> (Arc<SimInjector>, Arc<FakeCounters>, PowerClamp) {
        let sim = Arc::new(SimInjector::new());
        let counters = Arc::new(FakeCounters::new());
        counters.set(CounterId::Tsc, 1);
        counters.set(CounterId::PkgCstate(6), 1);
        let clamp = PowerClamp::new(
            &features(),
            sim.clone(),
            counters.clone(),
            &Topology::uniform(nr_cpus),
            Arc::new(Tunables::default()),
        )
        .unwrap()
        .with_poll_interval(None);
        (sim, counters, clamp)
    }

    #[test]
    fn test_guard() {
        assert_eq!(guard_for(0), 1);
        assert_eq!(guard_for(19), 1);
        assert_eq!(guard_for(20), 2);
        assert_eq!(guard_for(49), 3);
    }

    #[test]
    fn test_max_state_and_clamp() {
        let (_sim, _counters, clamp) = setup(2);
        assert_eq!(clamp.max_state(), 49);
        assert_eq!(clamp.cur_state(), None);

        clamp.set_cur_state(80).unwrap();
        assert_eq!(clamp.target_ratio(), 49);
        assert!(clamp.clamping());
        assert_eq!(clamp.cur_state(), Some(FIRST_SAMPLE_RATIO));
    }

    #[test]
    fn test_skip_above_guard() {
        let (sim, counters, clamp) = setup(1);
        clamp.set_cur_state(10).unwrap();
        let online = clamp.online();

        // Warmup window.
        sim.run_period(&online);
        counters.add(CounterId::Tsc, 1000);
        counters.add(CounterId::PkgCstate(6), 500);
        sim.run_period(&online);
        sim.run_period(&online);

        // 50% idle is way above 10 + 1.
        assert_eq!(clamp.current_ratio(), 50);
        assert!(clamp.should_skip());
        let windows = sim.run_period(&online);
        assert!(windows.iter().all(|w| !w.injected));
    }

    #[test]
    fn test_requires_pkg_counter() {
        let sim = Arc::new(SimInjector::new());
        let counters = Arc::new(FakeCounters::new());
        counters.set(CounterId::Tsc, 1);
        let res = PowerClamp::new(
            &features(),
            sim,
            counters,
            &Topology::uniform(2),
            Arc::new(Tunables::default()),
        );
        assert!(res.is_err());
    }
}

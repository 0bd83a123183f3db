// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! In-process stand-ins for the injection primitive and the hardware.
//!
//! `SimInjector` keeps registrations and drives the callbacks one period at
//! a time. `SimPlatform` turns the windows of a period into counter
//! movements on a `FakeCounters` table, so the controllers can be run end
//! to end without a kernel.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::anyhow;
use anyhow::Result;
use log::trace;

use crate::counters::CounterId;
use crate::counters::FakeCounters;
use crate::counters::PKG_CSTATES;
use crate::inject::BeginAction;
use crate::inject::EndAction;
use crate::inject::IdleInjector;
use crate::inject::InjectCallbacks;
use crate::inject::InjectHandle;
use crate::CoolingError;
use crate::Cpumask;

struct SimDevice {
    cpus: Cpumask,
    callbacks: Arc<dyn InjectCallbacks>,
    run_us: u32,
    idle_us: u32,
    latency_us: u32,
    running: bool,
}

#[derive(Default)]
struct SimState {
    next_handle: u64,
    devices: BTreeMap<InjectHandle, SimDevice>,
    claimed: BTreeMap<usize, InjectHandle>,
    nr_registered: u64,
    nr_unregistered: u64,
}

/// What happened on one CPU during one period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub handle: InjectHandle,
    pub cpu: usize,
    pub injected: bool,
    pub run_us: u32,
    pub idle_us: u32,
}

/// Current programming of a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub run_us: u32,
    pub idle_us: u32,
    pub latency_us: u32,
    pub running: bool,
}

#[derive(Default)]
pub struct SimInjector {
    state: Mutex<SimState>,
}

impl SimInjector {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_device<T>(
        &self,
        handle: InjectHandle,
        f: impl FnOnce(&mut SimDevice) -> T,
    ) -> Result<T> {
        let mut state = self.state.lock().unwrap();
        let dev = state
            .devices
            .get_mut(&handle)
            .ok_or_else(|| anyhow!("Unknown injection handle {:?}", handle))?;
        Ok(f(dev))
    }

    pub fn device(&self, handle: InjectHandle) -> Option<DeviceInfo> {
        let state = self.state.lock().unwrap();
        state.devices.get(&handle).map(|d| DeviceInfo {
            run_us: d.run_us,
            idle_us: d.idle_us,
            latency_us: d.latency_us,
            running: d.running,
        })
    }

    /// Handle currently owning injection on `cpu`.
    pub fn owner(&self, cpu: usize) -> Option<InjectHandle> {
        self.state.lock().unwrap().claimed.get(&cpu).copied()
    }

    pub fn nr_registered(&self) -> u64 {
        self.state.lock().unwrap().nr_registered
    }

    pub fn nr_unregistered(&self) -> u64 {
        self.state.lock().unwrap().nr_unregistered
    }

    pub fn nr_live(&self) -> usize {
        self.state.lock().unwrap().devices.len()
    }

    /// Run one period on every `online` CPU of every started registration.
    pub fn run_period(&self, online: &Cpumask) -> Vec<Window> {
        self.run_period_with(online, |_| {})
    }

    /// Like `run_period()`, calling `during_idle` with the windows after all
    /// `begin()` callbacks and before the `end()` ones.
    pub fn run_period_with(
        &self,
        online: &Cpumask,
        mut during_idle: impl FnMut(&[Window]),
    ) -> Vec<Window> {
        let mut windows = vec![];
        let mut targets = vec![];
        {
            let state = self.state.lock().unwrap();
            for (handle, dev) in state.devices.iter().filter(|(_, d)| d.running) {
                for cpu in dev.cpus.iter().filter(|c| online.test_cpu(*c)) {
                    targets.push((*handle, cpu, dev.callbacks.clone(), dev.run_us, dev.idle_us));
                }
            }
        }

        // Callbacks run without the state lock, as they would from the
        // primitive's timers.
        for (handle, cpu, callbacks, run_us, idle_us) in targets.iter() {
            let injected = callbacks.begin(*cpu, *idle_us, *run_us) == BeginAction::Inject;
            windows.push(Window {
                handle: *handle,
                cpu: *cpu,
                injected,
                run_us: *run_us,
                idle_us: *idle_us,
            });
        }

        during_idle(&windows);

        for ((handle, cpu, callbacks, run_us, idle_us), window) in targets.iter().zip(&windows) {
            if !window.injected {
                continue;
            }
            if let EndAction::Reprogram { run_us: new_run } = callbacks.end(*cpu, *idle_us, *run_us)
            {
                trace!("cpu {}: run duration {} -> {}us", cpu, run_us, new_run);
                let _ = self.with_device(*handle, |d| d.run_us = new_run);
            }
        }

        windows
    }
}

impl IdleInjector for SimInjector {
    fn register(
        &self,
        cpus: &Cpumask,
        callbacks: Arc<dyn InjectCallbacks>,
    ) -> Result<InjectHandle> {
        let mut state = self.state.lock().unwrap();
        if let Some(cpu) = cpus.iter().find(|c| state.claimed.contains_key(c)) {
            return Err(CoolingError::AlreadyClaimed { cpu }.into());
        }

        state.next_handle += 1;
        let handle = InjectHandle(state.next_handle);
        for cpu in cpus.iter() {
            state.claimed.insert(cpu, handle);
        }
        state.devices.insert(
            handle,
            SimDevice {
                cpus: cpus.clone(),
                callbacks,
                run_us: 0,
                idle_us: 0,
                latency_us: u32::MAX,
                running: false,
            },
        );
        state.nr_registered += 1;
        Ok(handle)
    }

    fn set_duration(&self, handle: InjectHandle, run_us: u32, idle_us: u32) -> Result<()> {
        self.with_device(handle, |d| {
            d.run_us = run_us;
            d.idle_us = idle_us;
        })
    }

    fn set_latency(&self, handle: InjectHandle, latency_us: u32) -> Result<()> {
        self.with_device(handle, |d| d.latency_us = latency_us)
    }

    fn start(&self, handle: InjectHandle) -> Result<()> {
        self.with_device(handle, |d| d.running = true)
    }

    fn stop(&self, handle: InjectHandle) -> Result<()> {
        self.with_device(handle, |d| d.running = false)
    }

    fn unregister(&self, handle: InjectHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.devices.remove(&handle).is_none() {
            return Err(anyhow!("Unknown injection handle {:?}", handle));
        }
        state.claimed.retain(|_, h| *h != handle);
        state.nr_unregistered += 1;
        Ok(())
    }
}

/// Counter model driven by simulated periods.
///
/// Reference cycles tick at one per microsecond. Of every injected idle
/// window only `efficiency` percent is really spent idle, the rest is lost
/// to interrupts and wakeups. The package only counts as idle while every
/// online CPU is.
pub struct SimPlatform {
    counters: Arc<FakeCounters>,
    efficiency: u32,
}

impl SimPlatform {
    pub fn new(counters: Arc<FakeCounters>, nr_cpus: usize, efficiency: u32) -> Self {
        // Missing counters read as unreadable, so seed every one sampled.
        counters.set(CounterId::Tsc, 1);
        for cpu in 0..nr_cpus {
            counters.set_cpu(cpu, CounterId::Tsc, 1);
            counters.set_cpu(cpu, CounterId::Mperf, 1);
        }
        for id in PKG_CSTATES {
            counters.set(CounterId::PkgCstate(id), 1);
        }
        Self {
            counters,
            efficiency: efficiency.min(100),
        }
    }

    pub fn counters(&self) -> &Arc<FakeCounters> {
        &self.counters
    }

    /// Advance the counters by one period made of `windows`.
    pub fn advance(&self, windows: &[Window]) {
        if windows.is_empty() {
            return;
        }

        let mut pkg_wall = 0u64;
        let mut pkg_idle = u64::MAX;
        for w in windows {
            let wall = w.run_us as u64 + w.idle_us as u64;
            let idle = if w.injected {
                w.idle_us as u64 * self.efficiency as u64 / 100
            } else {
                0
            };
            self.counters.add_cpu(w.cpu, CounterId::Tsc, wall);
            self.counters.add_cpu(w.cpu, CounterId::Mperf, wall - idle);

            pkg_wall = pkg_wall.max(wall);
            pkg_idle = pkg_idle.min(idle);
        }

        self.counters.add(CounterId::Tsc, pkg_wall);
        self.counters
            .add(CounterId::PkgCstate(PKG_CSTATES[2]), pkg_idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::CounterReader;

    struct Nop;

    impl InjectCallbacks for Nop {
        fn end(&self, _cpu: usize, _idle_us: u32, run_us: u32) -> EndAction {
            EndAction::Reprogram { run_us: run_us + 1 }
        }
    }

    #[test]
    fn test_claims() {
        let sim = SimInjector::new();
        let a = sim.register(&Cpumask::from_cpulist("0-1", 4).unwrap(), Arc::new(Nop)).unwrap();
        let err = sim
            .register(&Cpumask::from_cpulist("1-2", 4).unwrap(), Arc::new(Nop))
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<CoolingError>(),
            Some(&CoolingError::AlreadyClaimed { cpu: 1 })
        );

        sim.unregister(a).unwrap();
        assert!(sim.unregister(a).is_err());
        assert!(sim
            .register(&Cpumask::from_cpulist("1-2", 4).unwrap(), Arc::new(Nop))
            .is_ok());
    }

    #[test]
    fn test_period_reprograms() {
        let sim = SimInjector::new();
        let online = Cpumask::full(2);
        let h = sim.register(&Cpumask::of_cpu(1, 2).unwrap(), Arc::new(Nop)).unwrap();
        sim.set_duration(h, 100, 1000).unwrap();
        assert!(sim.run_period(&online).is_empty());

        sim.start(h).unwrap();
        let windows = sim.run_period(&online);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].cpu, 1);
        assert_eq!(sim.device(h).unwrap().run_us, 101);
    }

    #[test]
    fn test_platform_package_idle() {
        let counters = Arc::new(FakeCounters::new());
        let platform = SimPlatform::new(counters.clone(), 2, 50);
        let h = InjectHandle(1);
        platform.advance(&[
            Window {
                handle: h,
                cpu: 0,
                injected: true,
                run_us: 1000,
                idle_us: 1000,
            },
            Window {
                handle: h,
                cpu: 1,
                injected: true,
                run_us: 1000,
                idle_us: 1000,
            },
        ]);
        assert_eq!(counters.read(0, CounterId::Tsc).unwrap(), 2001);
        assert_eq!(counters.read(1, CounterId::Mperf).unwrap(), 1501);
        assert_eq!(counters.read(0, CounterId::PkgCstate(6)).unwrap(), 501);
    }
}

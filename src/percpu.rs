// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-CPU idle injection cooling devices.
//!
//! Every online CPU gets its own device with an independent target. A
//! device claims injection for its CPU when its state leaves 0 and releases
//! it when the state returns to 0. While clamping, the end of every idle
//! window compares the effective idle ratio (100 - MPERF/TSC) with the
//! target and lengthens the run duration while the CPU falls too far
//! behind, see `Hysteresis`.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::error;
use log::info;
use log::warn;

use crate::config::Tunables;
use crate::config::TICK_USEC;
use crate::duty_cycle::runtime;
use crate::hysteresis::Correction;
use crate::hysteresis::Hysteresis;
use crate::inject::EndAction;
use crate::inject::IdleInjector;
use crate::inject::InjectCallbacks;
use crate::inject::InjectHandle;
use crate::probe::probe_cpu_cooling;
use crate::probe::CpuFeatures;
use crate::sampler::ResidencySampler;
use crate::sampler::ResidencySource;
use crate::sampler::Sample;
use crate::stats::Metrics;
use crate::CounterReader;
use crate::CoolingDevice;
use crate::Cpumask;

pub const CPU_COOLING_MAX_STATE: u32 = 100;

/// The part of a device the injection callbacks see.
struct CpuCoolingState {
    cpu: usize,
    state: AtomicU32,
    run_duration: AtomicU32,
    comp_active: AtomicBool,
    sampler: ResidencySampler,
    hysteresis: Hysteresis,
    reader: Arc<dyn CounterReader>,
    metrics: Arc<Metrics>,
}

impl InjectCallbacks for CpuCoolingState {
    fn end(&self, cpu: usize, idle_us: u32, _run_us: u32) -> EndAction {
        let busy = match self.sampler.sample(self.reader.as_ref(), self.cpu) {
            Sample::Ratio(busy) => busy,
            Sample::Unreadable => {
                self.metrics.unreadable_samples.increment(1);
                return EndAction::Keep;
            }
            Sample::Warmup | Sample::Stalled => return EndAction::Keep,
        };
        let effective = 100 - busy.min(100);
        let target = self.state.load(Ordering::Acquire);
        let comp_active = self.comp_active.load(Ordering::Acquire);

        match self
            .hysteresis
            .evaluate(target, effective, comp_active, idle_us)
        {
            Correction::Compensate { run_us } => {
                debug!(
                    "cpu {}: effective {}% < target {}%, run {}us",
                    cpu, effective, target, run_us
                );
                self.metrics.compensated_periods.increment(1);
                self.comp_active.store(true, Ordering::Release);
                EndAction::Reprogram { run_us }
            }
            Correction::Restore => {
                self.comp_active.store(false, Ordering::Release);
                EndAction::Reprogram {
                    run_us: self.run_duration.load(Ordering::Acquire),
                }
            }
            Correction::Keep => EndAction::Keep,
        }
    }
}

/// Idle injection cooling device for one CPU.
pub struct CpuIdleCooling {
    inner: Arc<CpuCoolingState>,
    handle: Mutex<Option<InjectHandle>>,
    set_lock: Arc<Mutex<()>>,
    injector: Arc<dyn IdleInjector>,
    tunables: Arc<Tunables>,
    nr_cpus: usize,
}

impl CpuIdleCooling {
    fn new(
        cpu: usize,
        nr_cpus: usize,
        set_lock: Arc<Mutex<()>>,
        injector: Arc<dyn IdleInjector>,
        reader: Arc<dyn CounterReader>,
        tunables: Arc<Tunables>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            inner: Arc::new(CpuCoolingState {
                cpu,
                state: AtomicU32::new(0),
                run_duration: AtomicU32::new(0),
                comp_active: AtomicBool::new(false),
                sampler: ResidencySampler::new(ResidencySource::CoreActive),
                hysteresis: Hysteresis::default(),
                reader,
                metrics,
            }),
            handle: Mutex::new(None),
            set_lock,
            injector,
            tunables,
            nr_cpus,
        }
    }

    pub fn cpu(&self) -> usize {
        self.inner.cpu
    }

    /// Nominal run duration for the current state.
    pub fn run_duration(&self) -> u32 {
        self.inner.run_duration.load(Ordering::Acquire)
    }

    /// Whether the last window asked for a compensated run duration.
    pub fn compensating(&self) -> bool {
        self.inner.comp_active.load(Ordering::Acquire)
    }

    pub fn is_active(&self) -> bool {
        self.handle.lock().unwrap().is_some()
    }

    pub fn handle(&self) -> Option<InjectHandle> {
        *self.handle.lock().unwrap()
    }

    fn register(&self) -> Result<InjectHandle> {
        let cpu = self.inner.cpu;
        let cpus = Cpumask::of_cpu(cpu, self.nr_cpus)?;
        let callbacks: Arc<dyn InjectCallbacks> = self.inner.clone();

        // Busy when someone else claimed injection for this CPU.
        let handle = self.injector.register(&cpus, callbacks).map_err(|e| {
            error!("idle injection register failed for cpu {}: {:#}", cpu, e);
            e
        })?;

        let idle_us = self.tunables.idle_duration_us();
        let res = self
            .injector
            .set_duration(handle, TICK_USEC, idle_us)
            .and_then(|_| {
                self.injector
                    .set_latency(handle, self.tunables.idle_latency_us())
            });
        if let Err(e) = res {
            let _ = self.injector.unregister(handle);
            return Err(e);
        }

        self.inner.sampler.reset();
        self.inner.comp_active.store(false, Ordering::Release);
        Ok(handle)
    }

    /// Stop and unregister the injection held in `slot`. A failed stop does
    /// not keep the claim alive. The slot is only emptied once the claim is
    /// gone, so a failed unregister can be retried.
    fn release(&self, slot: &mut Option<InjectHandle>) -> Result<()> {
        let Some(handle) = *slot else {
            return Ok(());
        };
        if let Err(e) = self.injector.stop(handle) {
            warn!("cpu {}: failed to stop idle injection: {:#}", self.inner.cpu, e);
        }
        self.injector.unregister(handle).with_context(|| {
            format!("Failed to release idle injection on cpu {}", self.inner.cpu)
        })?;
        *slot = None;
        Ok(())
    }

    /// Stop clamping and drop back to state 0.
    pub fn shutdown(&self) -> Result<()> {
        let _guard = self.set_lock.lock().unwrap();
        self.release(&mut self.handle.lock().unwrap())?;
        self.inner.state.store(0, Ordering::Release);
        Ok(())
    }
}

impl CoolingDevice for CpuIdleCooling {
    fn name(&self) -> String {
        format!("idle-{}", self.inner.cpu)
    }

    fn max_state(&self) -> u32 {
        CPU_COOLING_MAX_STATE
    }

    fn cur_state(&self) -> Option<u32> {
        Some(self.inner.state.load(Ordering::Acquire))
    }

    fn set_cur_state(&self, state: u32) -> Result<()> {
        let _guard = self.set_lock.lock().unwrap();
        let state = state.min(CPU_COOLING_MAX_STATE);
        let curr = self.inner.state.load(Ordering::Acquire);
        let idle_us = self.tunables.idle_duration_us();
        let mut handle = self.handle.lock().unwrap();

        if curr == 0 && state > 0 {
            let h = match *handle {
                Some(h) => h,
                None => self.register()?,
            };
            *handle = Some(h);

            let run_us = runtime(idle_us, state);
            self.inner.run_duration.store(run_us, Ordering::Release);
            let res = self
                .injector
                .set_duration(h, run_us, idle_us)
                .and_then(|_| self.injector.start(h));
            if let Err(e) = res {
                handle.take();
                let _ = self.injector.unregister(h);
                return Err(e).with_context(|| {
                    format!("Failed to start idle injection on cpu {}", self.inner.cpu)
                });
            }
            info!(
                "cpu {}: start idle injection at {}% ({}us run / {}us idle)",
                self.inner.cpu, state, run_us, idle_us
            );
        } else if curr > 0 && state > 0 {
            let run_us = runtime(idle_us, state);
            self.inner.run_duration.store(run_us, Ordering::Release);
            if let Some(h) = *handle {
                self.injector.set_duration(h, run_us, idle_us)?;
            }
        } else if curr > 0 && state == 0 {
            self.release(&mut handle)?;
            info!("cpu {}: stop idle injection", self.inner.cpu);
        }

        self.inner.state.store(state, Ordering::Release);
        Ok(())
    }
}

/// Per-CPU cooling devices keyed by CPU id, following CPU hotplug.
pub struct CpuCoolingRegistry {
    devices: Mutex<BTreeMap<usize, Arc<CpuIdleCooling>>>,
    set_lock: Arc<Mutex<()>>,
    injector: Arc<dyn IdleInjector>,
    reader: Arc<dyn CounterReader>,
    tunables: Arc<Tunables>,
    metrics: Arc<Metrics>,
    nr_cpus: usize,
}

impl CpuCoolingRegistry {
    pub fn new(
        features: &CpuFeatures,
        injector: Arc<dyn IdleInjector>,
        reader: Arc<dyn CounterReader>,
        tunables: Arc<Tunables>,
        nr_cpus: usize,
    ) -> Result<Self> {
        probe_cpu_cooling(features)?;

        Ok(Self {
            devices: Mutex::new(BTreeMap::new()),
            set_lock: Arc::new(Mutex::new(())),
            injector,
            reader,
            tunables,
            metrics: Arc::new(Metrics::new()),
            nr_cpus,
        })
    }

    /// Create the device for a CPU which came online.
    pub fn cpu_online(&self, cpu: usize) -> Result<Arc<CpuIdleCooling>> {
        if cpu >= self.nr_cpus {
            bail!("Invalid CPU {} passed, max {}", cpu, self.nr_cpus);
        }

        let mut devices = self.devices.lock().unwrap();
        let dev = devices
            .entry(cpu)
            .or_insert_with(|| {
                debug!("registering cooling device idle-{}", cpu);
                Arc::new(CpuIdleCooling::new(
                    cpu,
                    self.nr_cpus,
                    self.set_lock.clone(),
                    self.injector.clone(),
                    self.reader.clone(),
                    self.tunables.clone(),
                    self.metrics.clone(),
                ))
            })
            .clone();
        Ok(dev)
    }

    /// Tear down the device of a CPU going offline.
    pub fn cpu_offline(&self, cpu: usize) -> Result<()> {
        let mut devices = self.devices.lock().unwrap();
        if let Some(dev) = devices.get(&cpu) {
            debug!("unregistering cooling device idle-{}", cpu);
            dev.shutdown()?;
            devices.remove(&cpu);
        }
        Ok(())
    }

    pub fn device(&self, cpu: usize) -> Option<Arc<CpuIdleCooling>> {
        self.devices.lock().unwrap().get(&cpu).cloned()
    }

    pub fn cpus(&self) -> Vec<usize> {
        self.devices.lock().unwrap().keys().copied().collect()
    }

    /// Stop every device and empty the registry. Devices which fail to
    /// release stay registered and the first error is returned.
    pub fn shutdown(&self) -> Result<()> {
        let mut devices = self.devices.lock().unwrap();
        let mut first_err = None;
        devices.retain(|cpu, dev| match dev.shutdown() {
            Ok(()) => false,
            Err(e) => {
                warn!("cpu {}: {:#}", cpu, e);
                first_err.get_or_insert(e);
                true
            }
        });
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

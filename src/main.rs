// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap::ValueEnum;
use log::info;
use metrics_exporter_prometheus::PrometheusBuilder;

use scx_idleclamp::config::Tunables;
use scx_idleclamp::config::DEFAULT_IDLE_DURATION_US;
use scx_idleclamp::config::DEFAULT_IDLE_LATENCY_US;
use scx_idleclamp::config::DEFAULT_WINDOW_SIZE;
use scx_idleclamp::counters::FakeCounters;
use scx_idleclamp::probe::CpuFeatures;
use scx_idleclamp::sim::SimInjector;
use scx_idleclamp::sim::SimPlatform;
use scx_idleclamp::CoolingDevice;
use scx_idleclamp::CpuCoolingRegistry;
use scx_idleclamp::Cpumask;
use scx_idleclamp::PowerClamp;
use scx_idleclamp::Topology;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// One independent cooling device per CPU.
    Cpu,
    /// One package-wide clamp with learned calibration.
    Package,
}

/// scx_idleclamp: idle injection cooling
///
/// Drives the per-CPU or package-wide idle injection cooling device against
/// a simulated injection primitive and simulated residency counters, and
/// reports how the achieved idle ratio tracks the requested level.
#[derive(Debug, Parser)]
struct Opts {
    /// Which cooling device to run.
    #[clap(short = 'm', long, value_enum, default_value = "package")]
    mode: Mode,

    /// Requested throttling level in percent of forced idle.
    #[clap(short = 'l', long, default_value = "25")]
    level: u32,

    /// Length of each forced idle window in microseconds (6000-25000).
    #[clap(short = 'd', long, default_value_t = DEFAULT_IDLE_DURATION_US)]
    duration_us: u32,

    /// Number of periods between calibration samples (2-10).
    #[clap(short = 'w', long, default_value_t = DEFAULT_WINDOW_SIZE)]
    window_size: u32,

    /// Maximum exit latency of the forced idle state, per-CPU mode only.
    #[clap(long, default_value_t = DEFAULT_IDLE_LATENCY_US)]
    idle_latency_us: u32,

    /// Online CPUs of the simulated machine, as a cpulist.
    #[clap(short = 'c', long, default_value = "0-3")]
    cpus: String,

    /// Number of injection periods to simulate.
    #[clap(short = 'p', long, default_value = "200")]
    periods: u32,

    /// Percentage of each forced idle window the simulated hardware really
    /// spends idle.
    #[clap(short = 'e', long, default_value = "90")]
    efficiency: u32,

    /// Wall clock delay between simulated periods in milliseconds.
    #[clap(short = 'i', long, default_value = "0")]
    interval_ms: u64,

    /// Check CPU support against this cpuinfo file instead of assuming a
    /// capable CPU.
    #[clap(long)]
    cpuinfo: Option<PathBuf>,

    /// Take the CPU sets from sysfs and the CPU features from /proc/cpuinfo
    /// of this machine instead of --cpus and --cpuinfo.
    #[clap(long, action = clap::ArgAction::SetTrue, conflicts_with_all = ["cpus", "cpuinfo"])]
    host: bool,

    /// Print the calibration table at the end of a package run.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    dump_calibration: bool,

    /// Print the calibration table as JSON.
    #[clap(long, action = clap::ArgAction::SetTrue, requires = "dump_calibration")]
    json: bool,

    /// Enable verbose output. Specify multiple times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Enable the Prometheus endpoint for metrics on port 9000.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    enable_prometheus: bool,
}

enum Device {
    Cpu(CpuCoolingRegistry),
    Package(PowerClamp),
}

struct Simulation {
    sim: Arc<SimInjector>,
    platform: SimPlatform,
    online: Cpumask,
    device: Device,
    periods: u32,
    interval: Duration,
}

impl Simulation {
    fn init(opts: &Opts) -> Result<Self> {
        let topo = if opts.host {
            Topology::new()?
        } else {
            let online_cpus = scx_idleclamp::read_cpulist(&opts.cpus)?;
            let Some(nr_cpus) = online_cpus.iter().max().map(|c| c + 1) else {
                bail!("No CPU in {:?}", opts.cpus);
            };
            let online = Cpumask::from_cpulist(&opts.cpus, nr_cpus)?;
            Topology::with_masks(Cpumask::full(nr_cpus), online)
        };
        let nr_cpus = topo.nr_cpus();
        let online = topo.online().clone();

        let features = match &opts.cpuinfo {
            Some(path) => CpuFeatures::read_from(path)?,
            None if opts.host => CpuFeatures::read()?,
            None => CpuFeatures {
                vendor: "GenuineIntel".to_string(),
                mwait: true,
            },
        };

        let tunables = Arc::new(Tunables::new(
            opts.duration_us,
            opts.window_size,
            opts.idle_latency_us,
        )?);

        let counters = Arc::new(FakeCounters::new());
        let platform = SimPlatform::new(counters.clone(), nr_cpus, opts.efficiency);
        let sim = Arc::new(SimInjector::new());

        let device = match opts.mode {
            Mode::Cpu => {
                let registry =
                    CpuCoolingRegistry::new(&features, sim.clone(), counters, tunables, nr_cpus)?;
                for cpu in online.iter() {
                    registry.cpu_online(cpu)?.set_cur_state(opts.level)?;
                }
                Device::Cpu(registry)
            }
            Mode::Package => {
                let clamp = PowerClamp::new(&features, sim.clone(), counters, &topo, tunables)?;
                clamp.set_cur_state(opts.level)?;
                Device::Package(clamp)
            }
        };

        info!(
            "Simulating {:?} idle injection at {}% on cpus {:?}",
            opts.mode,
            opts.level,
            online.iter().collect::<Vec<_>>()
        );

        Ok(Self {
            sim,
            platform,
            online,
            device,
            periods: opts.periods,
            interval: Duration::from_millis(opts.interval_ms),
        })
    }

    fn report(&self, period: u32) {
        match &self.device {
            Device::Cpu(registry) => {
                for cpu in registry.cpus() {
                    if let Some(dev) = registry.device(cpu) {
                        info!(
                            "[{}] cpu {}: level={:?} run={}us compensating={}",
                            period,
                            cpu,
                            dev.cur_state(),
                            dev.run_duration(),
                            dev.compensating()
                        );
                    }
                }
            }
            Device::Package(clamp) => {
                info!(
                    "[{}] control_cpu={} target={} current={} polled={:?} skip={}",
                    period,
                    clamp.control_cpu(),
                    clamp.target_ratio(),
                    clamp.current_ratio(),
                    clamp.cur_state(),
                    clamp.should_skip()
                );
            }
        }
    }

    fn run(&mut self, shutdown: Arc<AtomicBool>) -> Result<()> {
        let report_every = (self.periods / 10).max(1);

        for period in 0..self.periods {
            if shutdown.load(Ordering::Relaxed) {
                info!("Interrupted after {} periods", period);
                break;
            }

            let windows = self.sim.run_period(&self.online);
            self.platform.advance(&windows);

            if period % report_every == 0 {
                self.report(period);
            }
            if !self.interval.is_zero() {
                std::thread::sleep(self.interval);
            }
        }
        self.report(self.periods);
        Ok(())
    }

    fn dump(&self, json: bool) -> Result<()> {
        let Device::Package(clamp) = &self.device else {
            info!("Calibration is only kept by the package clamp");
            return Ok(());
        };

        let dump = clamp.dump();
        if json {
            println!("{}", dump.to_json()?);
        } else {
            dump.format(&mut std::io::stdout())?;
        }
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        let res = match &self.device {
            Device::Cpu(registry) => registry.shutdown(),
            Device::Package(clamp) => clamp.shutdown(),
        };
        res.context("Failed to stop idle injection")?;
        info!(
            "Released {} of {} injection registrations",
            self.sim.nr_unregistered(),
            self.sim.nr_registered()
        );
        Ok(())
    }
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let llv = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    if opts.enable_prometheus {
        info!("Enabling Prometheus endpoint: http://localhost:9000");
        PrometheusBuilder::new()
            .install()
            .context("Failed to install Prometheus recorder")?;
    }

    let mut simulation = Simulation::init(&opts)?;
    simulation.run(shutdown)?;
    if opts.dump_calibration {
        simulation.dump(opts.json)?;
    }
    simulation.shutdown()
}

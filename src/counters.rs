// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Hardware counter access.
//!
//! The controllers never touch registers directly, they go through a
//! `CounterReader`. `MsrCounterReader` reads the x86 MSR device nodes,
//! `FakeCounters` is an in-memory table for tests and simulation, and
//! `FileCounterReader` replays register values from a text file.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::debug;

use crate::CoolingError;

const MSR_IA32_TSC: u32 = 0x10;
const MSR_IA32_MPERF: u32 = 0xe7;
const MSR_PKG_C2_RESIDENCY: u32 = 0x60d;
const MSR_PKG_C3_RESIDENCY: u32 = 0x3f8;
const MSR_PKG_C6_RESIDENCY: u32 = 0x3f9;
const MSR_PKG_C7_RESIDENCY: u32 = 0x3fa;
const MSR_PKG_C8_RESIDENCY: u32 = 0x630;
const MSR_PKG_C9_RESIDENCY: u32 = 0x631;
const MSR_PKG_C10_RESIDENCY: u32 = 0x632;

/// Package C-states whose residency counts as package idle time.
pub const PKG_CSTATES: [u8; 7] = [2, 3, 6, 7, 8, 9, 10];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CounterId {
    /// Monotonic reference cycles.
    Tsc,
    /// Reference cycles spent in C0 by this CPU.
    Mperf,
    /// Cycles the package spent in the given C-state.
    PkgCstate(u8),
}

impl CounterId {
    /// MSR address backing this counter.
    pub fn msr(&self) -> Option<u32> {
        match self {
            CounterId::Tsc => Some(MSR_IA32_TSC),
            CounterId::Mperf => Some(MSR_IA32_MPERF),
            CounterId::PkgCstate(2) => Some(MSR_PKG_C2_RESIDENCY),
            CounterId::PkgCstate(3) => Some(MSR_PKG_C3_RESIDENCY),
            CounterId::PkgCstate(6) => Some(MSR_PKG_C6_RESIDENCY),
            CounterId::PkgCstate(7) => Some(MSR_PKG_C7_RESIDENCY),
            CounterId::PkgCstate(8) => Some(MSR_PKG_C8_RESIDENCY),
            CounterId::PkgCstate(9) => Some(MSR_PKG_C9_RESIDENCY),
            CounterId::PkgCstate(10) => Some(MSR_PKG_C10_RESIDENCY),
            CounterId::PkgCstate(_) => None,
        }
    }

    pub fn from_msr(msr: u32) -> Option<CounterId> {
        match msr {
            MSR_IA32_TSC => Some(CounterId::Tsc),
            MSR_IA32_MPERF => Some(CounterId::Mperf),
            _ => PKG_CSTATES
                .iter()
                .map(|id| CounterId::PkgCstate(*id))
                .find(|c| c.msr() == Some(msr)),
        }
    }
}

impl fmt::Display for CounterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CounterId::Tsc => write!(f, "TSC"),
            CounterId::Mperf => write!(f, "MPERF"),
            CounterId::PkgCstate(id) => write!(f, "PKG_C{}_RESIDENCY", id),
        }
    }
}

/// Read access to free running hardware counters.
///
/// Implementations are called from injection callbacks and must not block.
pub trait CounterReader: Send + Sync {
    /// Read `counter` as seen from `cpu`. A failure is transient, the caller
    /// keeps its previous sample.
    fn read(&self, cpu: usize, counter: CounterId) -> Result<u64>;
}

fn unreadable(cpu: usize, counter: CounterId) -> anyhow::Error {
    CoolingError::CounterUnreadable { cpu, counter }.into()
}

/// Reads counters through `/dev/cpu/N/msr`.
pub struct MsrCounterReader {
    dev_root: PathBuf,
}

impl MsrCounterReader {
    pub fn new() -> Self {
        Self::with_root(Path::new("/dev/cpu"))
    }

    pub fn with_root(dev_root: &Path) -> Self {
        Self {
            dev_root: dev_root.to_path_buf(),
        }
    }

    fn read_msr(&self, cpu: usize, msr: u32) -> Result<u64> {
        let path = self.dev_root.join(cpu.to_string()).join("msr");
        let file = File::open(&path).with_context(|| format!("Failed to open {:?}", path))?;
        let mut buf = [0u8; 8];
        let nr_read = file.read_at(&mut buf, msr as u64)?;
        if nr_read != 8 {
            bail!("Short read of msr {:#x}: {} bytes", msr, nr_read);
        }
        Ok(u64::from_le_bytes(buf))
    }
}

impl Default for MsrCounterReader {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterReader for MsrCounterReader {
    fn read(&self, cpu: usize, counter: CounterId) -> Result<u64> {
        let msr = counter
            .msr()
            .ok_or_else(|| anyhow!("No MSR for counter {}", counter))?;
        self.read_msr(cpu, msr).map_err(|e| {
            debug!("msr {:#x} on cpu {}: {:#}", msr, cpu, e);
            unreadable(cpu, counter)
        })
    }
}

/// In-memory counter table.
///
/// Values stored for `None` apply to every CPU unless overridden for a
/// specific CPU. Counters without a value read as unreadable.
#[derive(Default)]
pub struct FakeCounters {
    values: Mutex<BTreeMap<(Option<usize>, CounterId), u64>>,
}

impl FakeCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a package-wide (or otherwise CPU independent) value.
    pub fn set(&self, counter: CounterId, value: u64) {
        self.values
            .lock()
            .unwrap()
            .insert((None, counter), value);
    }

    pub fn set_cpu(&self, cpu: usize, counter: CounterId, value: u64) {
        self.values
            .lock()
            .unwrap()
            .insert((Some(cpu), counter), value);
    }

    pub fn add(&self, counter: CounterId, delta: u64) {
        let mut values = self.values.lock().unwrap();
        let v = values.entry((None, counter)).or_insert(0);
        *v = v.wrapping_add(delta);
    }

    pub fn add_cpu(&self, cpu: usize, counter: CounterId, delta: u64) {
        let mut values = self.values.lock().unwrap();
        let v = values.entry((Some(cpu), counter)).or_insert(0);
        *v = v.wrapping_add(delta);
    }

    /// Make `counter` unreadable everywhere.
    pub fn remove(&self, counter: CounterId) {
        self.values
            .lock()
            .unwrap()
            .retain(|(_, c), _| *c != counter);
    }
}

impl CounterReader for FakeCounters {
    fn read(&self, cpu: usize, counter: CounterId) -> Result<u64> {
        let values = self.values.lock().unwrap();
        values
            .get(&(Some(cpu), counter))
            .or_else(|| values.get(&(None, counter)))
            .copied()
            .ok_or_else(|| unreadable(cpu, counter))
    }
}

/// Replays register values from a text file, one register per line:
///
/// ```text
/// 0x10::0x2000
/// 1:0xe7::0x400
/// ```
///
/// A leading `N:` restricts the line to CPU N. The file is re-read on every
/// access so a test harness can rewrite it between periods.
pub struct FileCounterReader {
    path: PathBuf,
}

impl FileCounterReader {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    fn parse_line(line: &str) -> Option<(Option<usize>, u32, u64)> {
        let line = line.trim();
        let (cpu, rest) = match line.split_once(':') {
            Some((cpu, rest)) if !cpu.starts_with("0x") && !rest.starts_with(':') => {
                (Some(cpu.trim().parse::<usize>().ok()?), rest)
            }
            _ => (None, line),
        };
        let (reg, val) = rest.trim().split_once("::")?;
        let reg = u32::from_str_radix(reg.trim().strip_prefix("0x")?, 16).ok()?;
        let val = val.trim();
        let val = u64::from_str_radix(val.strip_prefix("0x").unwrap_or(val), 16).ok()?;
        Some((cpu, reg, val))
    }
}

impl CounterReader for FileCounterReader {
    fn read(&self, cpu: usize, counter: CounterId) -> Result<u64> {
        let msr = counter.msr().ok_or_else(|| unreadable(cpu, counter))?;
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            debug!("{:?}: {}", self.path, e);
            unreadable(cpu, counter)
        })?;

        let mut global = None;
        for (line_cpu, reg, val) in content.lines().filter_map(Self::parse_line) {
            if reg != msr {
                continue;
            }
            match line_cpu {
                Some(c) if c == cpu => return Ok(val),
                Some(_) => {}
                None => global = global.or(Some(val)),
            }
        }
        global.ok_or_else(|| unreadable(cpu, counter))
    }
}

/// Sum of all package C-state residency counters.
///
/// A counter which fails to read once is assumed absent and skipped from
/// then on.
#[derive(Default)]
pub struct PkgResidency {
    skip: [AtomicBool; PKG_CSTATES.len()],
}

impl PkgResidency {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if at least one package C-state counter can be read.
    pub fn available(reader: &dyn CounterReader, cpu: usize) -> bool {
        PKG_CSTATES
            .iter()
            .any(|id| reader.read(cpu, CounterId::PkgCstate(*id)).is_ok())
    }

    pub fn read(&self, reader: &dyn CounterReader, cpu: usize) -> Result<u64> {
        let mut count = 0u64;
        let mut nr_read = 0;
        for (i, id) in PKG_CSTATES.iter().enumerate() {
            if self.skip[i].load(Ordering::Relaxed) {
                continue;
            }
            match reader.read(cpu, CounterId::PkgCstate(*id)) {
                Ok(val) => {
                    count = count.wrapping_add(val);
                    nr_read += 1;
                }
                Err(_) => {
                    debug!("skipping package C{} residency from now on", id);
                    self.skip[i].store(true, Ordering::Relaxed);
                }
            }
        }

        if nr_read == 0 {
            return Err(unreadable(cpu, CounterId::PkgCstate(PKG_CSTATES[0])));
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cooling_error;

    #[test]
    fn test_msr_mapping() {
        for id in PKG_CSTATES {
            let c = CounterId::PkgCstate(id);
            assert_eq!(CounterId::from_msr(c.msr().unwrap()), Some(c));
        }
        assert_eq!(CounterId::PkgCstate(4).msr(), None);
    }

    #[test]
    fn test_fake_per_cpu_override() {
        let fake = FakeCounters::new();
        fake.set(CounterId::Tsc, 100);
        fake.set_cpu(1, CounterId::Tsc, 200);
        assert_eq!(fake.read(0, CounterId::Tsc).unwrap(), 100);
        assert_eq!(fake.read(1, CounterId::Tsc).unwrap(), 200);

        let err = fake.read(0, CounterId::Mperf).unwrap_err();
        assert_eq!(
            cooling_error(&err),
            Some(&CoolingError::CounterUnreadable {
                cpu: 0,
                counter: CounterId::Mperf
            })
        );
    }

    #[test]
    fn test_msr_reader() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("0")).unwrap();
        std::fs::create_dir_all(dir.path().join("1")).unwrap();

        // The TSC lives at offset 0x10 of the msr device.
        let mut regs = vec![0u8; 0x18];
        regs[0x10..0x18].copy_from_slice(&0x1234_5678_9abc_u64.to_le_bytes());
        std::fs::write(dir.path().join("0/msr"), &regs).unwrap();
        std::fs::write(dir.path().join("1/msr"), &regs[..0x14]).unwrap();

        let reader = MsrCounterReader::with_root(dir.path());
        assert_eq!(reader.read(0, CounterId::Tsc).unwrap(), 0x1234_5678_9abc);

        for (cpu, counter) in [(1, CounterId::Tsc), (0, CounterId::Mperf), (2, CounterId::Tsc)] {
            let err = reader.read(cpu, counter).unwrap_err();
            assert_eq!(
                cooling_error(&err),
                Some(&CoolingError::CounterUnreadable { cpu, counter })
            );
        }
    }

    #[test]
    fn test_file_reader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test-rd.dat");
        std::fs::write(&path, "0x10::0x2000\n1:0xe7::0x400\n0x3f9::0xff\n").unwrap();

        let reader = FileCounterReader::new(&path);
        assert_eq!(reader.read(0, CounterId::Tsc).unwrap(), 0x2000);
        assert_eq!(reader.read(1, CounterId::Mperf).unwrap(), 0x400);
        assert!(reader.read(0, CounterId::Mperf).is_err());
        assert_eq!(reader.read(3, CounterId::PkgCstate(6)).unwrap(), 0xff);
    }

    #[test]
    fn test_pkg_residency_latches_missing_counters() {
        let fake = FakeCounters::new();
        assert!(!PkgResidency::available(&fake, 0));

        fake.set(CounterId::PkgCstate(2), 10);
        fake.set(CounterId::PkgCstate(6), 5);
        let pkg = PkgResidency::new();
        assert_eq!(pkg.read(&fake, 0).unwrap(), 15);

        // C3 was absent on the first read and stays skipped.
        fake.set(CounterId::PkgCstate(3), 1000);
        assert_eq!(pkg.read(&fake, 0).unwrap(), 15);

        fake.remove(CounterId::PkgCstate(2));
        fake.remove(CounterId::PkgCstate(6));
        assert!(pkg.read(&fake, 0).is_err());
    }
}

// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Host CPU sets as seen through sysfs.
//!
//! Only the pieces idle injection cares about are modelled: which CPUs exist
//! (`present`), which of them currently run (`online`) and how wide masks
//! must be (`possible`). If the host topology changes (due to e.g. hotplug)
//! the cooling devices are told through their online/offline entry points,
//! a `Topology` itself is a snapshot.

use std::path::Path;

use anyhow::Context;
use anyhow::Result;

use crate::cpumask::read_cpulist;
use crate::Cpumask;

const CPU_SYSFS: &str = "/sys/devices/system/cpu";

/// The boot CPU. Preferred as the package control CPU.
pub const BOOT_CPU: usize = 0;

#[derive(Debug, Clone)]
pub struct Topology {
    nr_cpus: usize,
    present: Cpumask,
    online: Cpumask,
}

fn read_sysfs_cpulist(root: &Path, name: &str) -> Result<Vec<usize>> {
    let path = root.join(name);
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    read_cpulist(&content)
}

impl Topology {
    /// Snapshot the host CPU sets.
    pub fn new() -> Result<Topology> {
        Self::from_sysfs_root(Path::new(CPU_SYSFS))
    }

    /// Snapshot CPU sets from a sysfs-like directory holding `possible`,
    /// `present` and `online` cpulists.
    pub fn from_sysfs_root(root: &Path) -> Result<Topology> {
        let possible = read_sysfs_cpulist(root, "possible")?;
        let nr_cpus = possible.iter().max().map_or(1, |max| max + 1);

        let mut present = Cpumask::new(nr_cpus);
        for cpu in read_sysfs_cpulist(root, "present")? {
            present.set_cpu(cpu)?;
        }
        let mut online = Cpumask::new(nr_cpus);
        for cpu in read_sysfs_cpulist(root, "online")? {
            online.set_cpu(cpu)?;
        }

        Ok(Topology {
            nr_cpus,
            present,
            online,
        })
    }

    /// A topology with CPUs `0..nr_cpus` all present and online.
    pub fn uniform(nr_cpus: usize) -> Topology {
        Topology {
            nr_cpus,
            present: Cpumask::full(nr_cpus),
            online: Cpumask::full(nr_cpus),
        }
    }

    pub fn with_masks(present: Cpumask, online: Cpumask) -> Topology {
        Topology {
            nr_cpus: present.len().max(online.len()),
            present,
            online,
        }
    }

    pub fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    pub fn present(&self) -> &Cpumask {
        &self.present
    }

    pub fn online(&self) -> &Cpumask {
        &self.online
    }
}

/// CPU the calling thread is running on, if the kernel tells us.
pub fn current_cpu() -> Option<usize> {
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu < 0 {
        None
    } else {
        Some(cpu as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_sysfs_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("possible"), "0-7\n").unwrap();
        std::fs::write(dir.path().join("present"), "0-3\n").unwrap();
        std::fs::write(dir.path().join("online"), "0,2-3\n").unwrap();

        let top = Topology::from_sysfs_root(dir.path()).unwrap();
        assert_eq!(top.nr_cpus(), 8);
        assert_eq!(top.present().weight(), 4);
        assert_eq!(top.online().iter().collect::<Vec<_>>(), vec![0, 2, 3]);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Topology::from_sysfs_root(dir.path()).is_err());
    }
}

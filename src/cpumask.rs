// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Cpumask
//!
//! Fixed width set of CPU ids, used to describe which CPUs an injection
//! handle covers and which CPUs are currently online.
//!
//! A mask is sized at creation. It can be built empty, from a hexadecimal
//! string or from a kernel style cpulist:
//!
//!```
//!     use scx_idleclamp::Cpumask;
//!     let mask = Cpumask::from_cpulist("0-3,8", 16).unwrap();
//!     assert_eq!(mask.weight(), 5);
//!     assert_eq!(mask.first(), Some(0));
//!     assert_eq!(format!("{}", mask), "010f");
//!```

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use bitvec::prelude::*;
use sscanf::sscanf;
use std::fmt;

#[derive(Debug, Eq, Clone, Hash, PartialEq)]
pub struct Cpumask {
    mask: BitVec<u64, Lsb0>,
}

impl Cpumask {
    fn check_cpu(&self, cpu: usize) -> Result<()> {
        if cpu >= self.mask.len() {
            bail!("Invalid CPU {} passed, max {}", cpu, self.mask.len());
        }

        Ok(())
    }

    /// Build a new empty Cpumask able to hold `nr_cpus` CPUs.
    pub fn new(nr_cpus: usize) -> Cpumask {
        Cpumask {
            mask: bitvec![u64, Lsb0; 0; nr_cpus],
        }
    }

    /// Build a Cpumask with every one of the `nr_cpus` bits set.
    pub fn full(nr_cpus: usize) -> Cpumask {
        Cpumask {
            mask: bitvec![u64, Lsb0; 1; nr_cpus],
        }
    }

    /// Build a Cpumask holding a single CPU.
    pub fn of_cpu(cpu: usize, nr_cpus: usize) -> Result<Cpumask> {
        let mut mask = Cpumask::new(nr_cpus);
        mask.set_cpu(cpu)?;
        Ok(mask)
    }

    /// Build a Cpumask object from a hexadecimal string, e.g. "0xf0".
    pub fn from_hex(cpumask: &str, nr_cpus: usize) -> Result<Cpumask> {
        let hex_str = {
            let mut tmp_str = cpumask
                .trim()
                .strip_prefix("0x")
                .unwrap_or(cpumask.trim())
                .replace(['_', ','], "");
            if tmp_str.len() % 2 != 0 {
                tmp_str = "0".to_string() + &tmp_str;
            }
            tmp_str
        };
        let byte_vec =
            hex::decode(&hex_str).with_context(|| format!("Failed to parse cpumask: {cpumask}"))?;

        let mut mask = Cpumask::new(nr_cpus);
        for (index, &val) in byte_vec.iter().rev().enumerate() {
            let mut v = val;
            while v != 0 {
                let lsb = v.trailing_zeros() as usize;
                v &= !(1 << lsb);
                let cpu = index * 8 + lsb;
                if cpu >= nr_cpus {
                    bail!(
                        "Found cpu ({}) in cpumask ({}) which is larger than the mask width ({})",
                        cpu,
                        cpumask,
                        nr_cpus
                    );
                }
                mask.mask.set(cpu, true);
            }
        }

        Ok(mask)
    }

    /// Build a Cpumask from a cpulist such as "0-3,6".
    pub fn from_cpulist(cpulist: &str, nr_cpus: usize) -> Result<Cpumask> {
        let mut mask = Cpumask::new(nr_cpus);
        for cpu in read_cpulist(cpulist)? {
            mask.set_cpu(cpu)?;
        }

        Ok(mask)
    }

    /// Set a bit in the Cpumask. Returns an error if the specified CPU exceeds
    /// the size of the Cpumask.
    pub fn set_cpu(&mut self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.mask.set(cpu, true);
        Ok(())
    }

    /// Clear a bit from the Cpumask. Returns an error if the specified CPU
    /// exceeds the size of the Cpumask.
    pub fn clear_cpu(&mut self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.mask.set(cpu, false);
        Ok(())
    }

    /// Test whether the specified CPU bit is set in the Cpumask. CPUs beyond
    /// the width of the mask are reported as not set.
    pub fn test_cpu(&self, cpu: usize) -> bool {
        match self.mask.get(cpu) {
            Some(bit) => *bit,
            None => false,
        }
    }

    /// Count the number of bits set in the Cpumask.
    pub fn weight(&self) -> usize {
        self.mask.count_ones()
    }

    /// Return true if the Cpumask has no bit set, false otherwise.
    pub fn is_empty(&self) -> bool {
        self.mask.not_any()
    }

    /// The width of the cpumask.
    pub fn len(&self) -> usize {
        self.mask.len()
    }

    /// Lowest CPU set in the mask.
    pub fn first(&self) -> Option<usize> {
        self.mask.first_one()
    }

    /// Lowest CPU set in the mask strictly above `cpu`.
    pub fn next_after(&self, cpu: usize) -> Option<usize> {
        self.iter().find(|&c| c > cpu)
    }

    /// Iterate over the CPUs set in the mask, in ascending order.
    pub fn iter(&self) -> CpumaskIterator<'_> {
        CpumaskIterator {
            mask: self,
            index: 0,
        }
    }

    fn fmt_with(&self, f: &mut fmt::Formatter<'_>, case: char) -> fmt::Result {
        let nr_cpus = self.mask.len().max(1);
        let mut masks: Vec<u32> = self
            .mask
            .as_raw_slice()
            .iter()
            .flat_map(|x| [*x as u32, (x >> 32) as u32])
            .collect();

        // Throw out possible stray from u64 -> u32.
        masks.truncate(nr_cpus.div_ceil(32));
        if masks.is_empty() {
            masks.push(0);
        }

        // Print the highest 32bit. Trim digits beyond the mask width.
        let width = match nr_cpus.div_ceil(4) % 8 {
            0 => 8,
            v => v,
        };
        let top = masks.pop().unwrap_or(0);
        match case {
            'X' => write!(f, "{:0width$X}", top, width = width)?,
            _ => write!(f, "{:0width$x}", top, width = width)?,
        }

        // The rest in descending order.
        for submask in masks.iter().rev() {
            match case {
                'X' => write!(f, ",{submask:08X}")?,
                _ => write!(f, ",{submask:08x}")?,
            }
        }
        Ok(())
    }
}

/// Parse a kernel cpulist ("0-3,8,10-11") into a list of CPU ids.
pub fn read_cpulist(cpulist: &str) -> Result<Vec<usize>> {
    let cpulist = cpulist.trim_end_matches('\0').trim();
    let mut cpu_ids = vec![];
    if cpulist.is_empty() {
        return Ok(cpu_ids);
    }
    for group in cpulist.split(',') {
        let (min, max) = match sscanf!(group.trim(), "{usize}-{usize}") {
            Ok((x, y)) => (x, y),
            Err(_) => match sscanf!(group.trim(), "{usize}") {
                Ok(x) => (x, x),
                Err(_) => {
                    bail!("Failed to parse cpulist {}", group.trim());
                }
            },
        };
        for i in min..(max + 1) {
            cpu_ids.push(i);
        }
    }

    Ok(cpu_ids)
}

pub struct CpumaskIterator<'a> {
    mask: &'a Cpumask,
    index: usize,
}

impl Iterator for CpumaskIterator<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < self.mask.len() {
            let index = self.index;
            self.index += 1;
            if self.mask.test_cpu(index) {
                return Some(index);
            }
        }

        None
    }
}

impl fmt::Display for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f, 'x')
    }
}

impl fmt::LowerHex for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f, 'x')
    }
}

impl fmt::UpperHex for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f, 'X')
    }
}

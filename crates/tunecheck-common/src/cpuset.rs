//! CPU sets in Linux list format (`0-3,8,10-11`)

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::{Error, Target};

/// Highest number of CPUs a set may describe (the kernel's `NR_CPUS` ceiling)
pub const MAX_CPUS: u32 = 8192;

/// An ordered set of CPU indices
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CpuSet {
    cpus: BTreeSet<u32>,
}

impl CpuSet {
    /// Parse Linux list syntax. Surrounding whitespace is ignored and an
    /// empty string is the empty set.
    pub fn parse(input: &str) -> Result<Self, Error> {
        let mut cpus = BTreeSet::new();
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Ok(Self { cpus });
        }

        for part in trimmed.split(',') {
            let part = part.trim();
            match part.split_once('-') {
                Some((start, end)) => {
                    let start = parse_index(start, input)?;
                    let end = parse_index(end, input)?;
                    if start > end {
                        return Err(Error::validation(format!(
                            "invalid cpu range {part:?} in {input:?}"
                        )));
                    }
                    cpus.extend(start..=end);
                }
                None => {
                    cpus.insert(parse_index(part, input)?);
                }
            }
        }

        Ok(Self { cpus })
    }

    /// All CPUs `0..count`
    pub fn first_n(count: u32) -> Self {
        Self {
            cpus: (0..count).collect(),
        }
    }

    /// CPUs in `self` that are not in `other`
    pub fn difference(&self, other: &CpuSet) -> CpuSet {
        Self {
            cpus: self.cpus.difference(&other.cpus).copied().collect(),
        }
    }

    /// Whether the set contains `cpu`
    pub fn contains(&self, cpu: u32) -> bool {
        self.cpus.contains(&cpu)
    }

    /// Number of CPUs in the set
    pub fn len(&self) -> usize {
        self.cpus.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }

    /// Indices in ascending order
    pub fn list(&self) -> Vec<u32> {
        self.cpus.iter().copied().collect()
    }

    /// CPU targets in ascending order
    pub fn targets(&self) -> Vec<Target> {
        self.cpus.iter().copied().map(Target::Cpu).collect()
    }
}

fn parse_index(value: &str, input: &str) -> Result<u32, Error> {
    let index: u32 = value
        .trim()
        .parse()
        .map_err(|_| Error::validation(format!("invalid cpu index {value:?} in {input:?}")))?;
    if index >= MAX_CPUS {
        return Err(Error::validation(format!(
            "cpu index {index} in {input:?} exceeds the {MAX_CPUS} cpu limit"
        )));
    }
    Ok(index)
}

impl FromStr for CpuSet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl FromIterator<u32> for CpuSet {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        Self {
            cpus: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ranges: Vec<(u32, u32)> = Vec::new();
        for &cpu in &self.cpus {
            match ranges.last_mut() {
                Some((_, end)) if *end + 1 == cpu => *end = cpu,
                _ => ranges.push((cpu, cpu)),
            }
        }
        let parts: Vec<String> = ranges
            .into_iter()
            .map(|(start, end)| {
                if start == end {
                    start.to_string()
                } else {
                    format!("{start}-{end}")
                }
            })
            .collect();
        write!(f, "{}", parts.join(","))
    }
}

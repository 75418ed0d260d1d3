//! CPU/socket topology probe (C2): discovers which CPUs belong to which
//! physical package and freezes the mapping for the lifetime of the process.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::num::ParseIntError;

use crate::error::{JouleTraceError, Result};

/// Handles "n" or "start-end" or comma-separated combinations of either, as
/// found in `/sys/devices/system/cpu/online`.
fn parse_cpu_list(list: &str) -> anyhow::Result<Vec<u32>> {
    fn parse_item(item: &str) -> anyhow::Result<Vec<u32>> {
        let bounds: Vec<u32> = item
            .split('-')
            .map(str::parse)
            .collect::<std::result::Result<Vec<u32>, ParseIntError>>()?;
        match bounds.as_slice() {
            [start, end] => Ok((*start..=*end).collect()),
            [n] => Ok(vec![*n]),
            _ => Err(anyhow::anyhow!("invalid cpu list item: {item}")),
        }
    }

    let cpus = list
        .trim()
        .split(',')
        .filter(|s| !s.is_empty())
        .map(parse_item)
        .collect::<anyhow::Result<Vec<Vec<u32>>>>()?
        .into_iter()
        .flatten()
        .collect();
    Ok(cpus)
}

fn online_cpus() -> anyhow::Result<Vec<u32>> {
    let list = fs::read_to_string("/sys/devices/system/cpu/online")?;
    parse_cpu_list(&list)
}

fn physical_package_id(cpu: u32) -> anyhow::Result<u32> {
    let path = format!("/sys/devices/system/cpu/cpu{cpu}/topology/physical_package_id");
    let content = fs::read_to_string(&path)?;
    Ok(content.trim().parse()?)
}

/// Immutable CPU -> socket topology, discovered once.
#[derive(Debug, Clone)]
pub struct SocketTopology {
    socket_to_cpus: HashMap<u32, Vec<u32>>,
    cpu_to_socket: HashMap<u32, u32>,
}

impl SocketTopology {
    pub fn discover() -> Result<SocketTopology> {
        let cpus =
            online_cpus().map_err(|e| JouleTraceError::BadCpu(format!("reading online CPUs: {e}")))?;

        let mut socket_to_cpus: HashMap<u32, Vec<u32>> = HashMap::new();
        let mut cpu_to_socket = HashMap::new();
        for cpu in cpus {
            let socket = physical_package_id(cpu)
                .map_err(|e| JouleTraceError::BadCpu(format!("reading topology for cpu {cpu}: {e}")))?;
            socket_to_cpus.entry(socket).or_default().push(cpu);
            cpu_to_socket.insert(cpu, socket);
        }
        if socket_to_cpus.is_empty() {
            return Err(JouleTraceError::BadCpu("no online CPUs found".into()));
        }
        for cpus in socket_to_cpus.values_mut() {
            cpus.sort_unstable();
        }

        Ok(SocketTopology {
            socket_to_cpus,
            cpu_to_socket,
        })
    }

    pub fn socket_of(&self, cpu_id: u32) -> Result<u32> {
        self.cpu_to_socket
            .get(&cpu_id)
            .copied()
            .ok_or_else(|| JouleTraceError::BadCpu(format!("cpu {cpu_id} is not online/known")))
    }

    pub fn cpus_of(&self, socket_id: u32) -> Result<&[u32]> {
        self.socket_to_cpus
            .get(&socket_id)
            .map(Vec::as_slice)
            .ok_or_else(|| JouleTraceError::BadCpu(format!("unknown socket {socket_id}")))
    }

    pub fn socket_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.socket_to_cpus.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// One representative CPU per socket, e.g. for pinning a measurement.
    pub fn one_cpu_per_socket(&self) -> Result<HashMap<u32, u32>> {
        let mut out = HashMap::new();
        for (socket, cpus) in &self.socket_to_cpus {
            let cpu = *cpus.first().ok_or_else(|| JouleTraceError::BadCpu(format!("socket {socket} has no CPUs")))?;
            out.insert(*socket, cpu);
        }
        Ok(out)
    }
}

/// Topology construction for tests that should not depend on the host's
/// actual CPU layout.
pub mod testing {
    use std::collections::HashMap;

    use super::SocketTopology;

    pub fn single_socket(socket_id: u32, cpus: Vec<u32>) -> SocketTopology {
        let mut cpu_to_socket = HashMap::new();
        for cpu in &cpus {
            cpu_to_socket.insert(*cpu, socket_id);
        }
        SocketTopology {
            socket_to_cpus: HashMap::from([(socket_id, cpus)]),
            cpu_to_socket,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single() {
        assert_eq!(parse_cpu_list("0").unwrap(), vec![0]);
    }

    #[test]
    fn parse_range() {
        assert_eq!(parse_cpu_list("0-3").unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn parse_combined() {
        assert_eq!(parse_cpu_list("0-1,4,6-7").unwrap(), vec![0, 1, 4, 6, 7]);
    }
}

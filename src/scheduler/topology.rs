// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use crate::common::config;
use crate::common::ids::{CpuId, NodeId};
use crate::novarise_logging::{info, warn};

/// A logical CPU belonging to a topology node.
#[derive(Clone, Debug)]
pub struct TopologyCpu {
    pub cpu_id: CpuId,
}

/// A NUMA node and the CPUs attached to it.
#[derive(Clone, Debug)]
pub struct TopologyNode {
    pub node_id: NodeId,
    pub cpus: Vec<TopologyCpu>,
}

/// Immutable snapshot of the machine's NUMA layout, taken once at scheduler
/// start. Node and CPU order is stable for the lifetime of the snapshot.
#[derive(Clone, Debug)]
pub struct Topology {
    nodes: Vec<TopologyNode>,
    num_cpus: usize,
    fake: bool,
}

impl Topology {
    /// Detect the machine topology, honoring the fake-NUMA config switch.
    pub fn from_config() -> Self {
        let fake_nodes = config::fake_numa_nodes();
        if fake_nodes > 0 {
            let per_node = config::fake_numa_workers_per_node().max(1);
            return Self::fake(fake_nodes, per_node);
        }
        Self::detect()
    }

    /// Detect NUMA nodes and their CPUs. On Linux this reads
    /// /sys/devices/system/node; everywhere else (and when sysfs is
    /// unavailable) all CPUs land on a single node 0.
    pub fn detect() -> Self {
        if let Some(mut nodes) = detect_from_sysfs() {
            // Sysfs node numbers can be sparse (memory-only nodes are
            // skipped); queues are addressed positionally, so renumber.
            for (idx, node) in nodes.iter_mut().enumerate() {
                node.node_id = NodeId(idx as u32);
            }
            let num_cpus = nodes.iter().map(|n| n.cpus.len()).sum();
            info!(
                "topology: {} NUMA node(s), {} CPU(s)",
                nodes.len(),
                num_cpus
            );
            return Self {
                nodes,
                num_cpus,
                fake: false,
            };
        }

        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        info!("topology: single node fallback with {} CPU(s)", cpu_count);
        Self {
            nodes: vec![TopologyNode {
                node_id: NodeId(0),
                cpus: (0..cpu_count)
                    .map(|cpu| TopologyCpu {
                        cpu_id: CpuId(cpu as u32),
                    })
                    .collect(),
            }],
            num_cpus: cpu_count,
            fake: false,
        }
    }

    /// Build a synthetic topology. CPU ids are assigned round-robin over
    /// the real CPUs so that pinning still lands on existing cores.
    pub fn fake(node_count: usize, workers_per_node: usize) -> Self {
        let node_count = node_count.max(1);
        let workers_per_node = workers_per_node.max(1);
        let real_cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        let mut next_cpu = 0usize;
        let nodes = (0..node_count)
            .map(|node| TopologyNode {
                node_id: NodeId(node as u32),
                cpus: (0..workers_per_node)
                    .map(|_| {
                        let cpu = next_cpu % real_cpus;
                        next_cpu += 1;
                        TopologyCpu {
                            cpu_id: CpuId(cpu as u32),
                        }
                    })
                    .collect(),
            })
            .collect();

        Self {
            nodes,
            num_cpus: node_count * workers_per_node,
            fake: true,
        }
    }

    pub fn nodes(&self) -> &[TopologyNode] {
        &self.nodes
    }

    pub fn num_cpus(&self) -> usize {
        self.num_cpus
    }

    pub fn is_fake(&self) -> bool {
        self.fake
    }
}

#[cfg(target_os = "linux")]
fn detect_from_sysfs() -> Option<Vec<TopologyNode>> {
    let mut node_ids = Vec::new();
    for entry in std::fs::read_dir("/sys/devices/system/node").ok()? {
        let entry = entry.ok()?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(rest) = name.strip_prefix("node") {
            if let Ok(node) = rest.parse::<u32>() {
                node_ids.push(node);
            }
        }
    }
    if node_ids.is_empty() {
        return None;
    }
    node_ids.sort_unstable();

    let mut nodes = Vec::with_capacity(node_ids.len());
    for node in node_ids {
        let path = format!("/sys/devices/system/node/node{}/cpulist", node);
        let cpulist = std::fs::read_to_string(path).ok()?;
        let cpus = parse_cpulist(cpulist.trim())?;
        if cpus.is_empty() {
            // Memory-only nodes (e.g. CXL expanders) carry no workers.
            continue;
        }
        nodes.push(TopologyNode {
            node_id: NodeId(node),
            cpus: cpus
                .into_iter()
                .map(|cpu| TopologyCpu { cpu_id: CpuId(cpu) })
                .collect(),
        });
    }
    if nodes.is_empty() {
        None
    } else {
        Some(nodes)
    }
}

#[cfg(not(target_os = "linux"))]
fn detect_from_sysfs() -> Option<Vec<TopologyNode>> {
    None
}

/// Parse a sysfs cpulist such as "0-3,8-11" or "0,2,4".
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_cpulist(list: &str) -> Option<Vec<u32>> {
    let mut cpus = Vec::new();
    if list.is_empty() {
        return Some(cpus);
    }
    for part in list.split(',') {
        let part = part.trim();
        if let Some((lo, hi)) = part.split_once('-') {
            let lo = lo.trim().parse::<u32>().ok()?;
            let hi = hi.trim().parse::<u32>().ok()?;
            if hi < lo {
                return None;
            }
            cpus.extend(lo..=hi);
        } else {
            cpus.push(part.parse::<u32>().ok()?);
        }
    }
    Some(cpus)
}

/// Pin the calling thread to the given CPU. Failures are logged, not fatal:
/// fake topologies and restricted cpusets routinely reject pins.
pub fn pin_thread_to_cpu(cpu_id: CpuId) -> bool {
    let core = core_affinity::CoreId {
        id: cpu_id.as_usize(),
    };
    if core_affinity::set_for_current(core) {
        true
    } else {
        warn!("failed to pin thread to cpu {}", cpu_id);
        false
    }
}

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
use crate::novarise_config::config as novarise_app_config;

pub(crate) fn num_groups() -> usize {
    novarise_app_config()
        .ok()
        .map(|c| c.scheduler.num_groups)
        .unwrap_or(0)
}

/// Get the actual task-group count. Returns 4 x CPU cores if configured as 0.
pub(crate) fn actual_num_groups() -> usize {
    let configured = num_groups();
    if configured > 0 {
        configured
    } else {
        4 * std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

pub(crate) fn wait_poll_ms() -> u64 {
    novarise_app_config()
        .ok()
        .map(|c| c.scheduler.wait_poll_ms)
        .unwrap_or(10)
}

pub(crate) fn shutdown_timeout_ms() -> u64 {
    novarise_app_config()
        .ok()
        .map(|c| c.scheduler.shutdown_timeout_ms)
        .unwrap_or(100_000)
}

pub(crate) fn worker_wait_timeout_ms() -> u64 {
    novarise_app_config()
        .ok()
        .map(|c| c.scheduler.worker_wait_timeout_ms)
        .unwrap_or(100)
}

pub(crate) fn fake_numa_nodes() -> usize {
    novarise_app_config()
        .ok()
        .map(|c| c.scheduler.fake_numa_nodes)
        .unwrap_or(0)
}

pub(crate) fn fake_numa_workers_per_node() -> usize {
    novarise_app_config()
        .ok()
        .map(|c| c.scheduler.fake_numa_workers_per_node)
        .unwrap_or(0)
}

pub(crate) fn buffer_pool_bytes() -> u64 {
    novarise_app_config()
        .ok()
        .map(|c| c.buffer.pool_bytes)
        .unwrap_or(1024 * 1024 * 1024)
}

pub(crate) fn size_classes() -> Vec<u64> {
    novarise_app_config()
        .ok()
        .map(|c| c.buffer.size_classes.clone())
        .unwrap_or_else(|| (0..10).map(|shift| 4096u64 << shift).collect())
}

pub(crate) fn enable_numa_binding() -> bool {
    novarise_app_config()
        .ok()
        .map(|c| c.buffer.enable_numa_binding)
        .unwrap_or(true)
}

pub(crate) fn swap_dir() -> std::path::PathBuf {
    let configured = novarise_app_config()
        .ok()
        .and_then(|c| c.buffer.swap_dir.clone());
    match configured {
        Some(dir) if !dir.trim().is_empty() => std::path::PathBuf::from(dir),
        _ => {
            let mut default_dir = std::env::temp_dir();
            default_dir.push("novarise-swap");
            default_dir
        }
    }
}

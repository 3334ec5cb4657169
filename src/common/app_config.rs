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
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONFIG: OnceLock<NovaRiseConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static NovaRiseConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = path.as_ref().to_path_buf();
    let cfg = NovaRiseConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn init_from_env_or_default() -> Result<&'static NovaRiseConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = config_path_from_env_or_default()?;
    let cfg = NovaRiseConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn config() -> Result<&'static NovaRiseConfig> {
    init_from_env_or_default()
}

fn config_path_from_env_or_default() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("NOVARISE_CONFIG") {
        if !p.trim().is_empty() {
            return Ok(PathBuf::from(p));
        }
    }

    let candidates = [PathBuf::from("novarise.toml")];
    for p in candidates {
        if p.exists() {
            return Ok(p);
        }
    }

    Err(anyhow!(
        "missing config file: set $NOVARISE_CONFIG or create ./novarise.toml"
    ))
}

#[derive(Clone, Deserialize)]
pub struct NovaRiseConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    /// Example: "novarise=debug"
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub buffer: BufferConfig,
}

impl NovaRiseConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        let cfg: NovaRiseConfig =
            toml::from_str(&s).with_context(|| format!("parse toml: {}", path.display()))?;
        Ok(cfg)
    }
}

impl Default for NovaRiseConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            scheduler: SchedulerConfig::default(),
            buffer: BufferConfig::default(),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Target number of task-group chains created by `group_tasks`.
    /// 0 means auto: four chains per available CPU.
    #[serde(default = "default_num_groups")]
    pub num_groups: usize,
    #[serde(default = "default_wait_poll_ms")]
    pub wait_poll_ms: u64,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Bound on a worker's idle condvar wait; idle workers re-poll the
    /// shutdown flag at least this often.
    #[serde(default = "default_worker_wait_timeout_ms")]
    pub worker_wait_timeout_ms: u64,
    /// When non-zero, run on a synthetic topology with this many nodes
    /// instead of the detected one. Used on CI boxes and in tests.
    #[serde(default)]
    pub fake_numa_nodes: usize,
    #[serde(default)]
    pub fake_numa_workers_per_node: usize,
}

fn default_num_groups() -> usize {
    0 // 0 means auto: 4 x CPU count
}

fn default_wait_poll_ms() -> u64 {
    10
}

fn default_shutdown_timeout_ms() -> u64 {
    100_000
}

fn default_worker_wait_timeout_ms() -> u64 {
    100
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_groups: default_num_groups(),
            wait_poll_ms: default_wait_poll_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            worker_wait_timeout_ms: default_worker_wait_timeout_ms(),
            fake_numa_nodes: 0,
            fake_numa_workers_per_node: 0,
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct BufferConfig {
    /// Residency budget of the buffer pool in bytes.
    #[serde(default = "default_pool_bytes")]
    pub pool_bytes: u64,
    /// Enabled page size classes in bytes. Every entry must be one of the
    /// supported powers of two between 4 KiB and 2 MiB.
    #[serde(default = "default_size_classes")]
    pub size_classes: Vec<u64>,
    #[serde(default = "default_enable_numa_binding")]
    pub enable_numa_binding: bool,
    /// Directory holding the per-size-class swap files of the default
    /// frame store.
    #[serde(default)]
    pub swap_dir: Option<String>,
}

fn default_pool_bytes() -> u64 {
    1024 * 1024 * 1024 // 1 GiB
}

fn default_size_classes() -> Vec<u64> {
    (0..10).map(|shift| 4096u64 << shift).collect()
}

fn default_enable_numa_binding() -> bool {
    true
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            pool_bytes: default_pool_bytes(),
            size_classes: default_size_classes(),
            enable_numa_binding: default_enable_numa_binding(),
            swap_dir: None,
        }
    }
}

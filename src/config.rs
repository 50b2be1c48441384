//! Backend construction settings (spec §6 "Init settings").
//!
//! Can be built programmatically with [`BackendInitSettings::default`] and setters, or
//! loaded from a `packetrelay.yaml` file with [`load_settings`], following the same search
//! path the teacher's config loader uses for `riverdb.yaml`.

use std::env;
use std::fs::File;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};

#[derive(Deserialize, Debug, Clone)]
pub struct BackendInitSettings {
    /// Total bytes backing the fixed-size data block pool.
    #[serde(default = "default_heap_size")]
    pub heap_size: usize,
    /// Size in bytes of one block in the data block pool. Must be a power of two.
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    /// Maximum number of simultaneously open connections (accepted + outgoing).
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Per-connection output queue depth.
    #[serde(default = "default_max_pending_outgoing")]
    pub max_pending_outgoing_packets_per_connection: u32,
    /// Per-connection free-queue depth (the queue is sized to twice this).
    #[serde(default = "default_max_pending_freeing")]
    pub max_pending_freeing_packets_per_connection: u32,
    /// Depth of each send-worker thread's local op queue.
    #[serde(default = "default_max_send_queue_elements")]
    pub max_send_queue_elements: u32,
    /// Number of dedicated send worker threads; connections are partitioned by `id % n`.
    #[serde(default = "default_num_send_threads")]
    pub num_send_threads: u32,
    /// Number of tokio I/O worker threads driving accept/connect/recv tasks.
    #[serde(default = "default_num_io_threads")]
    pub num_io_threads: u32,
}

const fn default_heap_size() -> usize { 64 * 1024 * 1024 }
const fn default_block_size() -> u32 { 4096 }
const fn default_max_connections() -> u32 { 1024 }
const fn default_max_pending_outgoing() -> u32 { 64 }
const fn default_max_pending_freeing() -> u32 { 64 }
const fn default_max_send_queue_elements() -> u32 { 256 }
const fn default_num_send_threads() -> u32 { 4 }
const fn default_num_io_threads() -> u32 { 4 }

impl Default for BackendInitSettings {
    fn default() -> Self {
        Self {
            heap_size: default_heap_size(),
            block_size: default_block_size(),
            max_connections: default_max_connections(),
            max_pending_outgoing_packets_per_connection: default_max_pending_outgoing(),
            max_pending_freeing_packets_per_connection: default_max_pending_freeing(),
            max_send_queue_elements: default_max_send_queue_elements(),
            num_send_threads: default_num_send_threads(),
            num_io_threads: default_num_io_threads(),
        }
    }
}

impl BackendInitSettings {
    fn validate(mut self) -> Result<Self> {
        if !self.block_size.is_power_of_two() {
            self.block_size = self.block_size.next_power_of_two();
        }
        if self.max_connections < 1 {
            return Err(Error::new("max_connections must be at least 1"));
        }
        if self.num_send_threads < 1 {
            return Err(Error::new("num_send_threads must be at least 1"));
        }
        if self.heap_size < self.block_size as usize {
            return Err(Error::new("heap_size must be >= block_size"));
        }
        Ok(self)
    }

    /// Maximum number of free-queue reservations a connection may hold at once,
    /// i.e. `MaxPendingFreeingPacketsPerConnection * 2` from spec §3.
    pub fn max_pending_frees(&self) -> u32 {
        self.max_pending_freeing_packets_per_connection * 2
    }
}

/// Load settings from `packetrelay.yaml`, searching the current directory and its
/// parents, then `~/.config/packetrelay`, then `~/.packetrelay.yaml`, then `/etc/packetrelay`.
pub fn load_settings() -> Result<BackendInitSettings> {
    let path = find_config_file("packetrelay.yaml")?;
    debug!(config_path = %path.to_string_lossy(), "loading packetrelay settings");
    let file = File::open(&path)?;
    let settings: BackendInitSettings = serde_yaml::from_reader(file)?;
    settings.validate()
}

fn find_config_file(config_name: &str) -> Result<PathBuf> {
    if let Ok(start) = env::current_dir() {
        let mut dir = start.as_path();
        loop {
            let fp = Path::join(dir, config_name);
            if fp.exists() {
                return Ok(fp);
            }
            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
    }

    let home = env::var("HOME").unwrap_or_else(|_| "~/".to_string());

    let conf_path = Path::join(Path::new(&home), Path::join(Path::new(".config/packetrelay"), config_name));
    if conf_path.exists() {
        return Ok(conf_path);
    }

    let conf_path = Path::join(Path::new(&home), ".".to_string() + config_name);
    if conf_path.exists() {
        return Ok(conf_path);
    }

    let conf_path = Path::join(Path::new("/etc/packetrelay"), config_name);
    if conf_path.exists() {
        return Ok(conf_path);
    }

    Err(Error::new(format!("config file {} not found", config_name)))
}

//! Metrics collection for the node agent
//!
//! Provides:
//! - Host metrics (CPU usage and load, memory, uptime) via sysinfo
//! - Discovery of the simulation process by name or command line
//! - A background collector refreshing a shared snapshot at a fixed interval

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

pub type SharedSnapshot = Arc<RwLock<MetricsSnapshot>>;

/// CPU usage metrics
#[derive(Debug, Clone, Default, Serialize)]
pub struct CpuMetrics {
    pub used_percent: f32,
    pub cores: usize,
    pub load_1m: f64,
}

/// Memory usage metrics
#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryMetrics {
    pub used_gb: f64,
    pub available_gb: f64,
    pub total_gb: f64,
    pub used_percent: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SystemMetrics {
    pub cpu: CpuMetrics,
    pub memory: MemoryMetrics,
    pub uptime_seconds: u64,
}

/// Payload of `/api/system/metrics`
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    #[serde(rename = "nodeId")]
    pub node_id: String,
    pub timestamp: String,
    pub running: bool,
    pub pid: Option<u32>,
    pub start_time: Option<String>,
    pub cpu_percent: f32,
    pub mem_mb: f64,
    pub cmdline: Option<String>,
    pub system: SystemMetrics,
}

impl MetricsSnapshot {
    /// Snapshot served before the first collection
    pub fn empty(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            running: false,
            pid: None,
            start_time: None,
            cpu_percent: 0.0,
            mem_mb: 0.0,
            cmdline: None,
            system: SystemMetrics::default(),
        }
    }

    fn with_process(mut self, process: Option<&ProcessView>) -> Self {
        if let Some(p) = process {
            self.running = true;
            self.pid = Some(p.pid);
            self.start_time = DateTime::<Utc>::from_timestamp(p.start_time as i64, 0).map(|t| t.to_rfc3339());
            self.cpu_percent = p.cpu_percent;
            self.mem_mb = p.memory_bytes as f64 / BYTES_PER_MB;
            self.cmdline = Some(p.cmdline.clone());
        }
        self
    }
}

/// Process fields needed for discovery, detached from sysinfo
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessView {
    pub pid: u32,
    pub name: String,
    pub cmdline: String,
    pub cpu_percent: f32,
    pub memory_bytes: u64,
    /// Seconds since the Unix epoch
    pub start_time: u64,
}

/// Lowest PID whose name or command line contains `pattern`, excluding the agent itself
pub fn pick_process<'a>(processes: &'a [ProcessView], pattern: &str, self_pid: u32) -> Option<&'a ProcessView> {
    if pattern.is_empty() {
        return None;
    }
    processes
        .iter()
        .filter(|p| p.pid != self_pid)
        .filter(|p| p.name.contains(pattern) || p.cmdline.contains(pattern))
        .min_by_key(|p| p.pid)
}

fn process_views(sys: &System) -> Vec<ProcessView> {
    sys.processes()
        .values()
        .map(|p| ProcessView {
            pid: p.pid().as_u32(),
            name: p.name().to_string(),
            cmdline: p.cmd().join(" "),
            cpu_percent: p.cpu_usage(),
            memory_bytes: p.memory(),
            start_time: p.start_time(),
        })
        .collect()
}

fn collect_system(sys: &System) -> SystemMetrics {
    let total = sys.total_memory() as f64;
    let available = sys.available_memory() as f64;
    let used = (total - available).max(0.0);
    let load_1m = if cfg!(unix) { System::load_average().one } else { 0.0 };

    SystemMetrics {
        cpu: CpuMetrics {
            used_percent: sys.global_cpu_info().cpu_usage(),
            cores: sys.cpus().len(),
            load_1m,
        },
        memory: MemoryMetrics {
            used_gb: used / BYTES_PER_GB,
            available_gb: available / BYTES_PER_GB,
            total_gb: total / BYTES_PER_GB,
            used_percent: if total > 0.0 { used / total * 100.0 } else { 0.0 },
        },
        uptime_seconds: System::uptime(),
    }
}

/// Keeps a sysinfo handle between refreshes (CPU usage needs two samples)
pub struct Collector {
    sys: System,
    node_id: String,
    pattern: String,
    self_pid: u32,
}

impl Collector {
    pub fn new(node_id: &str, pattern: &str) -> Self {
        let mut sys = System::new();
        sys.refresh_cpu();
        Self {
            sys,
            node_id: node_id.to_string(),
            pattern: pattern.to_string(),
            self_pid: std::process::id(),
        }
    }

    pub fn collect(&mut self) -> MetricsSnapshot {
        self.sys.refresh_cpu();
        self.sys.refresh_memory();
        self.sys.refresh_processes();

        let views = process_views(&self.sys);
        let process = pick_process(&views, &self.pattern, self.self_pid);
        debug!(
            "Collected metrics: {} processes, target {}",
            views.len(),
            process.map_or("not running".to_string(), |p| format!("PID {}", p.pid))
        );

        let mut snapshot = MetricsSnapshot::empty(&self.node_id).with_process(process);
        snapshot.system = collect_system(&self.sys);
        snapshot
    }
}

/// Refreshes `shared` every `every` until the task is aborted
pub fn spawn_collector(shared: SharedSnapshot, mut collector: Collector, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Collecting metrics every {}s (pattern: {})", every.as_secs(), collector.pattern);
        let mut tick = tokio::time::interval(every);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            let snapshot = collector.collect();
            *shared.write().await = snapshot;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(pid: u32, name: &str, cmdline: &str) -> ProcessView {
        ProcessView {
            pid,
            name: name.to_string(),
            cmdline: cmdline.to_string(),
            cpu_percent: 1.5,
            memory_bytes: 64 * 1024 * 1024,
            start_time: 1_760_000_000,
        }
    }

    #[test]
    fn test_pick_process_by_name_or_cmdline() {
        let procs = vec![
            view(900, "bash", "bash"),
            view(812, "finalvudatasim", "./finalvudatasim"),
            view(640, "sh", "sh -c cd /opt/sim && ./finalvudatasim"),
        ];
        assert_eq!(pick_process(&procs, "finalvudatasim", 1).map(|p| p.pid), Some(640));
        // the agent never reports itself
        assert_eq!(pick_process(&procs, "finalvudatasim", 640).map(|p| p.pid), Some(812));
        assert!(pick_process(&procs, "redis-server", 1).is_none());
        assert!(pick_process(&procs, "", 1).is_none());
    }

    #[test]
    fn test_snapshot_with_process() {
        let p = view(812, "finalvudatasim", "./finalvudatasim --profile burst");
        let snap = MetricsSnapshot::empty("w1").with_process(Some(&p));
        assert!(snap.running);
        assert_eq!(snap.pid, Some(812));
        assert_eq!(snap.mem_mb, 64.0);
        assert!(snap.start_time.unwrap().starts_with("2025-10-09"));

        let json = serde_json::to_value(MetricsSnapshot::empty("w1")).unwrap();
        assert_eq!(json["nodeId"], "w1");
        assert_eq!(json["running"], false);
        assert!(json["pid"].is_null());
        assert!(json["system"]["memory"]["total_gb"].is_number());
    }

    #[test]
    fn test_collect_reads_host() {
        let mut collector = Collector::new("w1", "no-such-process-pattern-xyz");
        let snap = collector.collect();
        assert_eq!(snap.node_id, "w1");
        assert!(!snap.running);
        assert!(snap.system.cpu.cores > 0);
        assert!(snap.system.memory.total_gb > 0.0);
    }
}

//! Built-in probes: memory, CPU, database reachability and dependency pings

use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;
use sysinfo::System;
use tokio::time::Instant;

use super::{CheckOutcome, HealthCheck, HealthStatus};
use crate::error::ResilienceResult;

fn classify(value: f64, degraded_at: f64, unhealthy_at: f64) -> HealthStatus {
    if value >= unhealthy_at {
        HealthStatus::Unhealthy
    } else if value >= degraded_at {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

/// System memory usage in percent
pub struct MemoryCheck {
    sys: Mutex<System>,
    degraded_pct: f64,
    unhealthy_pct: f64,
}

impl MemoryCheck {
    pub fn new(degraded_pct: f64, unhealthy_pct: f64) -> Self {
        Self {
            sys: Mutex::new(System::new()),
            degraded_pct,
            unhealthy_pct,
        }
    }
}

#[async_trait]
impl HealthCheck for MemoryCheck {
    async fn check(&self) -> CheckOutcome {
        let (used, total) = {
            let mut sys = self.sys.lock();
            sys.refresh_memory();
            (sys.used_memory(), sys.total_memory())
        };
        if total == 0 {
            return CheckOutcome::degraded("memory statistics unavailable");
        }
        let pct = used as f64 / total as f64 * 100.0;
        let status = classify(pct, self.degraded_pct, self.unhealthy_pct);
        CheckOutcome::new(
            status,
            format!("{:.1}% used ({} / {} MiB)", pct, used >> 20, total >> 20),
        )
        .with_value(pct)
    }
}

/// Global CPU usage in percent, measured since the previous run
pub struct CpuCheck {
    sys: Mutex<System>,
    degraded_pct: f64,
    unhealthy_pct: f64,
}

impl CpuCheck {
    pub fn new(degraded_pct: f64, unhealthy_pct: f64) -> Self {
        let mut sys = System::new();
        // Prime the counters so the first check has a reference point
        sys.refresh_cpu();
        Self {
            sys: Mutex::new(sys),
            degraded_pct,
            unhealthy_pct,
        }
    }
}

#[async_trait]
impl HealthCheck for CpuCheck {
    async fn check(&self) -> CheckOutcome {
        let usage = {
            let mut sys = self.sys.lock();
            sys.refresh_cpu();
            sys.global_cpu_info().cpu_usage() as f64
        };
        let status = classify(usage, self.degraded_pct, self.unhealthy_pct);
        CheckOutcome::new(status, format!("{:.1}% busy", usage)).with_value(usage)
    }
}

/// TCP connect to `host:port`, used for database reachability
pub struct TcpCheck {
    addr: String,
    slow_after: Duration,
}

impl TcpCheck {
    pub fn new(addr: impl Into<String>, slow_after: Duration) -> Self {
        Self {
            addr: addr.into(),
            slow_after,
        }
    }
}

#[async_trait]
impl HealthCheck for TcpCheck {
    async fn check(&self) -> CheckOutcome {
        let started = Instant::now();
        match tokio::net::TcpStream::connect(&self.addr).await {
            Ok(_) => {
                let elapsed = started.elapsed();
                let details = format!("connected to {} in {}ms", self.addr, elapsed.as_millis());
                if elapsed > self.slow_after {
                    CheckOutcome::degraded(details)
                } else {
                    CheckOutcome::healthy(details)
                }
            }
            Err(e) => CheckOutcome::unhealthy(format!("{}: {}", self.addr, e)),
        }
    }
}

/// HTTP GET against a dependency. 2xx is healthy (degraded when slow),
/// anything else unhealthy.
pub struct HttpCheck {
    client: reqwest::Client,
    url: String,
    slow_after: Duration,
}

impl HttpCheck {
    pub fn new(url: impl Into<String>, timeout: Duration, slow_after: Duration) -> ResilienceResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            slow_after,
        })
    }
}

#[async_trait]
impl HealthCheck for HttpCheck {
    async fn check(&self) -> CheckOutcome {
        let started = Instant::now();
        match self.client.get(&self.url).send().await {
            Ok(response) if response.status().is_success() => {
                let elapsed = started.elapsed();
                let details = format!("{} in {}ms", response.status(), elapsed.as_millis());
                if elapsed > self.slow_after {
                    CheckOutcome::degraded(details)
                } else {
                    CheckOutcome::healthy(details)
                }
            }
            Ok(response) => CheckOutcome::unhealthy(format!("{} returned {}", self.url, response.status())),
            Err(e) => CheckOutcome::unhealthy(format!("{}: {}", self.url, e)),
        }
    }
}

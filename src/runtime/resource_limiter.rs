// src/runtime/resource_limiter.rs
//! Resource limits handed to launchers
//!
//! Launchers translate these into their own mechanism:
//! - Docker: `--memory`, `--cpus`, `--pids-limit`
//! - Local processes: exported as environment variables for the runner to honour

use serde::{Deserialize, Serialize};

/// Resource limits for a runner process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// CPU quota as percentage (0-100 per core)
    /// Example: 50 = 50% of one CPU core
    pub cpu_quota: Option<u32>,

    /// Memory limit in megabytes
    pub memory_limit_mb: Option<u64>,

    /// Maximum number of processes inside the runner
    pub pids_limit: Option<u32>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_quota: Some(100),
            memory_limit_mb: Some(512),
            pids_limit: Some(256),
        }
    }
}

impl ResourceLimits {
    /// Create resource limits with no restrictions
    pub fn unlimited() -> Self {
        Self {
            cpu_quota: None,
            memory_limit_mb: None,
            pids_limit: None,
        }
    }

    /// Validate resource limits
    pub fn validate(&self) -> Result<(), String> {
        if let Some(quota) = self.cpu_quota {
            if quota == 0 {
                return Err("CPU quota cannot be 0".to_string());
            }
            if quota > 6400 {
                return Err("CPU quota cannot exceed 6400% (64 cores)".to_string());
            }
        }

        if let Some(memory) = self.memory_limit_mb {
            if memory < 16 {
                return Err("Memory limit cannot be less than 16MB".to_string());
            }
        }

        if let Some(pids) = self.pids_limit {
            if pids == 0 {
                return Err("PID limit cannot be 0".to_string());
            }
        }

        Ok(())
    }

    /// Fractional CPU count in the form Docker expects (`--cpus=0.5`)
    pub fn cpus(&self) -> Option<String> {
        self.cpu_quota.map(|quota| format!("{:.2}", quota as f64 / 100.0))
    }

    /// Docker CLI flags for these limits
    pub fn docker_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(memory) = self.memory_limit_mb {
            args.push(format!("--memory={}m", memory));
        }
        if let Some(cpus) = self.cpus() {
            args.push(format!("--cpus={}", cpus));
        }
        if let Some(pids) = self.pids_limit {
            args.push(format!("--pids-limit={}", pids));
        }

        args
    }

    /// Environment variables describing these limits to a local runner
    pub fn env_vars(&self) -> Vec<(String, String)> {
        let mut vars = Vec::new();

        if let Some(memory) = self.memory_limit_mb {
            vars.push(("RUNNER_MEMORY_LIMIT_MB".to_string(), memory.to_string()));
        }
        if let Some(quota) = self.cpu_quota {
            vars.push(("RUNNER_CPU_QUOTA".to_string(), quota.to_string()));
        }

        vars
    }
}

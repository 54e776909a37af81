//! Run report written once on exit.

use std::fs;
use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::supervisor::{ChildState, ChildStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub children: Vec<ChildReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildReport {
    pub name: String,
    /// `Ready`, `Dead` or `Exited`.
    pub final_status: ChildStatus,
    pub effective_port: Option<u16>,
    pub restart_count: u32,
    pub last_exit_code: Option<i32>,
    pub stderr_tail: Option<String>,
}

impl ChildReport {
    /// `status` is the child's status when shutdown began.
    pub fn new(child: &ChildState, status: ChildStatus) -> Self {
        let final_status = final_status(status);
        Self {
            name: child.spec.name.clone(),
            final_status,
            effective_port: child.effective_port,
            restart_count: child.restart_count,
            last_exit_code: child.last_exit_code,
            stderr_tail: if final_status == ChildStatus::Dead {
                child.stderr_tail()
            } else {
                None
            },
        }
    }
}

/// Collapse the six runtime states onto the three the report knows.
pub fn final_status(status: ChildStatus) -> ChildStatus {
    match status {
        ChildStatus::Ready => ChildStatus::Ready,
        ChildStatus::Pending | ChildStatus::Dead => ChildStatus::Dead,
        ChildStatus::Starting | ChildStatus::Unhealthy | ChildStatus::Exited => {
            ChildStatus::Exited
        }
    }
}

impl RunReport {
    pub fn any_dead(&self) -> bool {
        self.children
            .iter()
            .any(|c| c.final_status == ChildStatus::Dead)
    }

    pub fn child(&self, name: &str) -> Option<&ChildReport> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn write(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize run report")?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write run report to {}", path.display()))?;
        Ok(())
    }
}

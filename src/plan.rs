//! TOML test plans.
//!
//! A plan lists phases that each run an external command:
//!
//! ```toml
//! name = "board bring-up"
//!
//! [[phase]]
//! name = "power_on"
//! command = "psu-ctl"
//! args = ["on", "--rail", "3v3"]
//! timeout_s = 5.0
//!
//! [[phase]]
//! name = "flash"
//! command = "flash-tool"
//! run_if = ["test", "-e", "/dev/ttyUSB0"]
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::phase::command::{CommandGuard, CommandPhase};
use crate::phase::{CodeInfo, Phase, PhaseContext};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("plan {0:?} defines no phases")]
    Empty(String),

    #[error("phase name {0:?} is used more than once")]
    DuplicateName(String),

    #[error("phase at position {0} has an empty name")]
    EmptyName(usize),

    #[error("phase {0:?} has an empty command")]
    EmptyCommand(String),

    #[error("phase {0:?} has an empty run_if command")]
    EmptyGuard(String),

    #[error("phase {phase:?} has an unusable timeout_s ({value})")]
    InvalidTimeout { phase: String, value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestPlan {
    pub name: String,
    #[serde(default, rename = "phase")]
    pub phases: Vec<PhaseSpec>,
    /// Where the plan was loaded from, used for phase code info.
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Seconds. Zero or negative means the executor default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_s: Option<f64>,
    /// Guard command; the phase runs only if it exits successfully.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_if: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<PathBuf>,
}

impl PhaseSpec {
    /// The phase's own deadline, or `None` to use the executor default.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_s
            .filter(|s| s.is_finite() && *s > 0.0)
            .map(Duration::from_secs_f64)
    }
}

impl TestPlan {
    /// Read, parse and validate a plan file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read plan file: {}", path.display()))?;
        let mut plan = Self::from_toml_str(&content)
            .with_context(|| format!("invalid plan file: {}", path.display()))?;
        plan.source = Some(path.to_path_buf());
        info!(
            path = %path.display(),
            plan = %plan.name,
            phases = plan.phases.len(),
            "loaded test plan"
        );
        Ok(plan)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let plan: Self = toml::from_str(content)?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn validate(&self) -> Result<(), PlanError> {
        if self.phases.is_empty() {
            return Err(PlanError::Empty(self.name.clone()));
        }
        let mut seen = HashSet::new();
        for (idx, spec) in self.phases.iter().enumerate() {
            if spec.name.trim().is_empty() {
                return Err(PlanError::EmptyName(idx));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(PlanError::DuplicateName(spec.name.clone()));
            }
            if spec.command.trim().is_empty() {
                return Err(PlanError::EmptyCommand(spec.name.clone()));
            }
            if matches!(&spec.run_if, Some(argv) if argv.is_empty() || argv[0].trim().is_empty()) {
                return Err(PlanError::EmptyGuard(spec.name.clone()));
            }
            if let Some(value) = spec.timeout_s {
                if !value.is_finite() || value > u32::MAX as f64 {
                    return Err(PlanError::InvalidTimeout {
                        phase: spec.name.clone(),
                        value: value.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Turn the plan into executable phases, in order.
    pub fn to_phases(&self) -> Vec<Phase> {
        let file = self
            .source
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<inline plan>".to_string());

        self.phases
            .iter()
            .map(|spec| {
                let command = CommandPhase::from_spec(spec);
                let work = move |ctx: &PhaseContext| command.run(ctx);
                let mut phase = Phase::new(spec.name.clone(), work).with_code_info(CodeInfo {
                    name: spec.name.clone(),
                    file: file.clone(),
                    line: None,
                });
                if let Some(timeout) = spec.timeout() {
                    phase = phase.with_timeout(timeout);
                }
                if let Some(argv) = &spec.run_if {
                    let guard = CommandGuard::new(argv.clone());
                    phase = phase.with_run_if(move |ctx| guard.check(ctx));
                }
                phase
            })
            .collect()
    }
}

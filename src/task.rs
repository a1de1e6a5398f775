//! `TaskConfig` — the contract the Dispatcher ships into a claimed VM.

use crate::error::FleetError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Coding tool the in-VM runner launches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tool {
    ClaudeCode,
    Opencode,
    Amp,
    Cline,
}

impl Tool {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "claude-code" | "claude_code" | "claude" => Some(Self::ClaudeCode),
            "opencode" | "open-code" => Some(Self::Opencode),
            "amp" => Some(Self::Amp),
            "cline" => Some(Self::Cline),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClaudeCode => "claude-code",
            Self::Opencode => "opencode",
            Self::Amp => "amp",
            Self::Cline => "cline",
        }
    }
}

const DEFAULT_MAX_TIME_MINUTES: u32 = 30;
const MAX_PROJECT_LEN: usize = 63;

/// The task contract written to `/etc/agent-config/task.json` in the VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub agent_id: String,
    pub project: String,
    pub repo_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue: Option<String>,
    pub tool: Tool,
    pub prompt: String,
    pub branch: String,
    #[serde(default = "default_max_time")]
    pub max_time: u32,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    pub host_addr: String,
    pub dispatched_at: DateTime<Utc>,
}

fn default_max_time() -> u32 {
    DEFAULT_MAX_TIME_MINUTES
}

/// Fields accepted from an operator `dispatch` command before defaults are applied.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchRequest {
    pub project: String,
    pub repo_url: String,
    pub tool: String,
    pub prompt: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub issue: Option<String>,
    #[serde(default)]
    pub max_time: Option<u32>,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
}

impl TaskConfig {
    /// Build and validate a `TaskConfig` from an operator request.
    ///
    /// Validation failures never mutate pool/registry state (spec.md §7,
    /// taxonomy class 1): this runs before `PoolManager::claim`.
    pub fn build(
        agent_id: String,
        req: DispatchRequest,
        host_addr: String,
        dispatched_at: DateTime<Utc>,
    ) -> Result<Self, FleetError> {
        if req.project.trim().is_empty() {
            return Err(FleetError::Validation("project must not be empty".into()));
        }
        if req.project.len() > MAX_PROJECT_LEN {
            return Err(FleetError::Validation(format!(
                "project name too long (max {MAX_PROJECT_LEN} characters)"
            )));
        }
        if req.repo_url.trim().is_empty() {
            return Err(FleetError::Validation("repoURL must not be empty".into()));
        }
        if req.prompt.trim().is_empty() {
            return Err(FleetError::Validation("prompt must not be empty".into()));
        }
        let tool = Tool::parse(&req.tool).ok_or_else(|| {
            FleetError::Validation(format!(
                "unknown tool '{}': allowed values are claude-code, opencode, amp, cline",
                req.tool
            ))
        })?;

        let branch = req
            .branch
            .filter(|b| !b.trim().is_empty())
            .unwrap_or_else(|| format!("agent/{}/{}", req.project, agent_id));

        Ok(TaskConfig {
            agent_id,
            project: req.project,
            repo_url: req.repo_url,
            issue: req.issue,
            tool,
            prompt: req.prompt,
            branch,
            max_time: req.max_time.unwrap_or(DEFAULT_MAX_TIME_MINUTES),
            env_vars: req.env_vars,
            host_addr,
            dispatched_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req() -> DispatchRequest {
        DispatchRequest {
            project: "p".into(),
            repo_url: "https://example.com/p.git".into(),
            tool: "claude-code".into(),
            prompt: "fix the bug".into(),
            branch: None,
            issue: None,
            max_time: None,
            env_vars: HashMap::new(),
        }
    }

    #[test]
    fn defaults_branch_name() {
        let cfg = TaskConfig::build("agent-1".into(), req(), "10.0.0.1".into(), Utc::now()).unwrap();
        assert_eq!(cfg.branch, "agent/p/agent-1");
        assert_eq!(cfg.max_time, DEFAULT_MAX_TIME_MINUTES);
    }

    #[test]
    fn rejects_empty_project() {
        let mut r = req();
        r.project = "".into();
        let err = TaskConfig::build("agent-1".into(), r, "10.0.0.1".into(), Utc::now()).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn rejects_unknown_tool() {
        let mut r = req();
        r.tool = "bogus-tool".into();
        let err = TaskConfig::build("agent-1".into(), r, "10.0.0.1".into(), Utc::now()).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn honors_explicit_branch() {
        let mut r = req();
        r.branch = Some("my-branch".into());
        let cfg = TaskConfig::build("agent-1".into(), r, "10.0.0.1".into(), Utc::now()).unwrap();
        assert_eq!(cfg.branch, "my-branch");
    }
}

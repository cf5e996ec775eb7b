use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One of the five states a build can be in. Transitions only ever move
/// forward through this list; see `BuildRecord::can_transition_to`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl BuildState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
        };
        f.write_str(s)
    }
}

impl FromStr for BuildState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(Self::Queued),
            "RUNNING" => Ok(Self::Running),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            "CANCELED" => Ok(Self::Canceled),
            other => Err(format!("unknown build state: {other}")),
        }
    }
}

/// Exit code synthesized for a build that never reached a real subprocess
/// exit status.
pub const EXIT_CODE_CANCELED: i32 = -1;
pub const EXIT_CODE_PREFLIGHT_FAILURE: i32 = -2;

/// Authoritative record of one build, owned by the Registry. Invariants:
///   - `state` only ever advances QUEUED -> RUNNING -> {terminal}
///   - terminal states are frozen
///   - `ended_at >= started_at` once both are set
///   - `exit_code` is meaningful only once `state` is terminal
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildRecord {
    pub id: String,
    pub customer: String,
    pub project_name: String,
    pub target_image: String,
    pub config_path: String,
    pub state: BuildState,
    pub exit_code: i32,
    pub started_at: i64,
    pub ended_at: i64,
    pub error_message: String,
    pub build_dir: String,
    pub tmp_dir: String,
    pub deploy_dir: String,
}

impl BuildRecord {
    pub fn new(id: String, customer: String, project_name: String, target_image: String, config_path: String) -> Self {
        Self {
            id,
            customer,
            project_name,
            target_image,
            config_path,
            state: BuildState::Queued,
            exit_code: 0,
            started_at: 0,
            ended_at: 0,
            error_message: String::new(),
            build_dir: String::new(),
            tmp_dir: String::new(),
            deploy_dir: String::new(),
        }
    }

    /// Monotonicity rule: a terminal state can never be left, and QUEUED
    /// can only ever move to RUNNING or directly to CANCELED
    /// (cancel-before-dispatch).
    pub fn can_transition_to(&self, next: BuildState) -> bool {
        use BuildState::*;
        match (self.state, next) {
            (Queued, Running) => true,
            (Queued, Canceled) => true,
            (Queued, Failed) => true, // pre-flight fatal, never reaches RUNNING
            (Running, Succeeded | Failed | Canceled) => true,
            _ => false,
        }
    }
}

/// Which stream a log line originated from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
    Meta,
}

impl fmt::Display for LogStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::Meta => "meta",
        };
        f.write_str(s)
    }
}

/// One append-only log line. Byte-preserving except for line-splitting.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogLine {
    pub stream: LogStream,
    pub timestamp: i64,
    pub text: String,
}

/// Sidecar document persisted next to a build's extracted artifacts.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub build_id: String,
    pub project_name: String,
    pub user: String,
    pub timestamp: i64,
    pub target_image: String,
    pub status: String,
    pub build_duration: i64,
    pub config_used: BTreeMap<String, String>,
    pub artifact_sizes: BTreeMap<String, u64>,
}

/// Declarative description of one metadata layer to materialize before
/// the build.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LayerSpec {
    pub name: String,
    pub git_url: String,
    pub branch_or_ref: String,
    #[serde(default)]
    pub subdir: Option<String>,
}

/// Directories a project needs. Any field left `None` is defaulted by the
/// Runner under `${HOME}/.smidr/...`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Directories {
    pub source: Option<PathBuf>,
    pub layers: Option<PathBuf>,
    pub build: Option<PathBuf>,
    pub tmp: Option<PathBuf>,
    pub deploy: Option<PathBuf>,
    pub downloads: Option<PathBuf>,
    pub sstate: Option<PathBuf>,
}

/// Resolved form of `Directories` once defaulting has run — every field is
/// now an absolute path that exists on disk.
#[derive(Clone, Debug)]
pub struct ResolvedDirectories {
    pub source: PathBuf,
    pub layers: PathBuf,
    pub build: PathBuf,
    pub tmp: PathBuf,
    pub deploy: PathBuf,
    pub downloads: PathBuf,
    pub sstate: PathBuf,
}

/// A project's declarative build configuration (`smidr.yaml` on disk).
/// Opaque to everything except the Runner, which reads exactly the fields
/// it needs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub project_name: String,
    pub target_image: String,
    pub layers: Vec<LayerSpec>,
    #[serde(default)]
    pub directories: Directories,
    pub base_image: String,
    pub provider: String,
    pub machine: String,
    pub distro: String,
    pub version: String,
    #[serde(default = "default_parallel_make")]
    pub parallel_make: u32,
    #[serde(default = "default_bb_threads")]
    pub bb_number_threads: u32,
}

fn default_parallel_make() -> u32 {
    4
}

fn default_bb_threads() -> u32 {
    4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_are_monotonic() {
        let mut rec = BuildRecord::new("id".into(), String::new(), "p".into(), "t".into(), "/cfg".into());
        assert!(rec.can_transition_to(BuildState::Running));
        rec.state = BuildState::Running;
        assert!(rec.can_transition_to(BuildState::Succeeded));
        assert!(!rec.can_transition_to(BuildState::Queued));
        rec.state = BuildState::Succeeded;
        assert!(!rec.can_transition_to(BuildState::Failed));
    }

    #[test]
    fn queued_can_cancel_directly() {
        let rec = BuildRecord::new("id".into(), String::new(), "p".into(), "t".into(), "/cfg".into());
        assert!(rec.can_transition_to(BuildState::Canceled));
    }

    #[test]
    fn state_display_and_parse_roundtrip() {
        for s in [
            BuildState::Queued,
            BuildState::Running,
            BuildState::Succeeded,
            BuildState::Failed,
            BuildState::Canceled,
        ] {
            let text = s.to_string();
            let parsed: BuildState = text.parse().unwrap();
            assert_eq!(parsed, s);
        }
    }
}

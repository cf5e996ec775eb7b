//! Daemon-level configuration (env-var driven) and project configuration
//! (`smidr.yaml`, parsed with `serde_yaml` into `ProjectConfig`).

use std::env;
use std::path::PathBuf;

use crate::model::{Directories, ProjectConfig, ResolvedDirectories};

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub address: String,
    pub db_path: Option<PathBuf>,
}

impl DaemonConfig {
    pub fn new(address: String, db_path: Option<PathBuf>) -> Self {
        Self { address, db_path }
    }
}

/// Root of all daemon-managed state, `${HOME}/.smidr` by default,
/// overridable with `SMIDR_HOME` for tests.
pub fn smidr_home() -> PathBuf {
    if let Ok(dir) = env::var("SMIDR_HOME") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".smidr")
}

pub fn load_project_config(path: &std::path::Path) -> Result<ProjectConfig, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read config {}: {e}", path.display()))?;
    serde_yaml::from_str(&text).map_err(|e| format!("failed to parse config {}: {e}", path.display()))
}

/// Template written by `smidrd init <project>`.
pub fn init_template(project_name: &str) -> String {
    format!(
        r#"# smidr.yaml -- generated by `smidrd init {project_name}`
project_name: {project_name}
target_image: core-image-minimal

layers:
  - name: poky
    git_url: https://git.yoctoproject.org/poky
    branch_or_ref: scarthgap

# directories left unset here default to ${{HOME}}/.smidr/{{source,layers,build,tmp,deploy,downloads,sstate}}
directories: {{}}

base_image: poky
provider: local
machine: qemux86-64
distro: poky
version: scarthgap

parallel_make: 4
bb_number_threads: 4
"#,
        project_name = project_name
    )
}

/// Fill in any directory left unset with a default under `home`, then
/// idempotently create every directory. Calling this twice against the
/// same `dirs` yields the same resolved paths with no error.
pub fn resolve_directories(home: &std::path::Path, dirs: &Directories) -> std::io::Result<ResolvedDirectories> {
    let resolved = ResolvedDirectories {
        source: dirs.source.clone().unwrap_or_else(|| home.join("source")),
        layers: dirs.layers.clone().unwrap_or_else(|| home.join("layers")),
        build: dirs.build.clone().unwrap_or_else(|| home.join("build")),
        tmp: dirs.tmp.clone().unwrap_or_else(|| home.join("tmp")),
        deploy: dirs.deploy.clone().unwrap_or_else(|| home.join("deploy")),
        downloads: dirs.downloads.clone().unwrap_or_else(|| home.join("downloads")),
        sstate: dirs.sstate.clone().unwrap_or_else(|| home.join("sstate")),
    };

    for path in [
        &resolved.source,
        &resolved.layers,
        &resolved.build,
        &resolved.tmp,
        &resolved.deploy,
        &resolved.downloads,
        &resolved.sstate,
    ] {
        std::fs::create_dir_all(path)?;
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_template_parses_as_valid_project_config() {
        let text = init_template("demo");
        let cfg: ProjectConfig = serde_yaml::from_str(&text).expect("template should parse");
        assert_eq!(cfg.project_name, "demo");
        assert_eq!(cfg.layers.len(), 1);
    }

    #[test]
    fn directory_defaulting_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = Directories::default();
        let first = resolve_directories(tmp.path(), &dirs).unwrap();
        let second = resolve_directories(tmp.path(), &dirs).unwrap();
        assert_eq!(first.source, second.source);
        assert_eq!(first.build, second.build);
        assert!(first.source.exists());
    }
}

//! Workspace assembly: regenerate `bblayers.conf` and `local.conf` from
//! scratch on every run to guarantee determinism.
//!
//! Templated as a `format!` over a raw-string template, written with a
//! single `fs::write` call.

use std::path::{Path, PathBuf};

use crate::error::WorkspaceError;
use crate::model::{ProjectConfig, ResolvedDirectories};

pub fn write_bblayers_conf(build_dir: &Path, layer_paths: &[PathBuf]) -> Result<PathBuf, WorkspaceError> {
    let conf_dir = build_dir.join("conf");
    std::fs::create_dir_all(&conf_dir)
        .map_err(|e| WorkspaceError::CreateDir { path: conf_dir.display().to_string(), source: e })?;

    let mut layer_lines = String::new();
    for path in layer_paths {
        layer_lines.push_str(&format!("  \"{}\" \\\n", path.display()));
    }

    let content = format!(
        r#"# bblayers.conf -- regenerated on every build, do not edit by hand
LCONF_VERSION = "7"

BBPATH = "${{TOPDIR}}"
BBFILES ?= ""

BBLAYERS ?= " \
{layer_lines}  "
"#,
        layer_lines = layer_lines
    );

    let path = conf_dir.join("bblayers.conf");
    std::fs::write(&path, content).map_err(|e| WorkspaceError::WriteFile { path: path.display().to_string(), source: e })?;
    Ok(path)
}

pub fn write_local_conf(build_dir: &Path, config: &ProjectConfig, dirs: &ResolvedDirectories) -> Result<PathBuf, WorkspaceError> {
    let conf_dir = build_dir.join("conf");
    std::fs::create_dir_all(&conf_dir)
        .map_err(|e| WorkspaceError::CreateDir { path: conf_dir.display().to_string(), source: e })?;

    let content = format!(
        r#"# local.conf -- regenerated on every build, do not edit by hand
MACHINE ?= "{machine}"
DISTRO ?= "{distro}"
PACKAGE_CLASSES ?= "package_rpm"

DL_DIR ?= "{downloads}"
SSTATE_DIR ?= "{sstate}"
TMPDIR ?= "{tmp}"

BB_NUMBER_THREADS ?= "{bb_threads}"
PARALLEL_MAKE ?= "-j {parallel_make}"

CONF_VERSION = "2"
"#,
        machine = config.machine,
        distro = config.distro,
        downloads = dirs.downloads.display(),
        sstate = dirs.sstate.display(),
        tmp = dirs.tmp.display(),
        bb_threads = config.bb_number_threads,
        parallel_make = config.parallel_make,
    );

    let path = conf_dir.join("local.conf");
    std::fs::write(&path, content).map_err(|e| WorkspaceError::WriteFile { path: path.display().to_string(), source: e })?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Directories;

    #[test]
    fn bblayers_conf_lists_zero_layers_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_bblayers_conf(dir.path(), &[]).unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("BBLAYERS"));
    }

    #[test]
    fn bblayers_conf_lists_layers_in_declaration_order() {
        let dir = tempfile::tempdir().unwrap();
        let layers = vec![PathBuf::from("/a/one"), PathBuf::from("/a/two")];
        let path = write_bblayers_conf(dir.path(), &layers).unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        let pos_one = content.find("/a/one").unwrap();
        let pos_two = content.find("/a/two").unwrap();
        assert!(pos_one < pos_two);
    }

    #[test]
    fn local_conf_is_regenerated_deterministically() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProjectConfig {
            project_name: "p".into(),
            target_image: "core-image-minimal".into(),
            layers: vec![],
            directories: Directories::default(),
            base_image: "poky".into(),
            provider: "local".into(),
            machine: "qemux86-64".into(),
            distro: "poky".into(),
            version: "scarthgap".into(),
            parallel_make: 4,
            bb_number_threads: 4,
        };
        let resolved = ResolvedDirectories {
            source: dir.path().join("source"),
            layers: dir.path().join("layers"),
            build: dir.path().join("build"),
            tmp: dir.path().join("tmp"),
            deploy: dir.path().join("deploy"),
            downloads: dir.path().join("downloads"),
            sstate: dir.path().join("sstate"),
        };
        let path1 = write_local_conf(dir.path(), &config, &resolved).unwrap();
        let first = std::fs::read_to_string(&path1).unwrap();
        let path2 = write_local_conf(dir.path(), &config, &resolved).unwrap();
        let second = std::fs::read_to_string(&path2).unwrap();
        assert_eq!(first, second);
        assert!(first.contains("qemux86-64"));
    }
}

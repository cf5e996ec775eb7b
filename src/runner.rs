//! Build Runner: the supervised pipeline that owns one build end-to-end,
//! from resolving its configuration through dispatching the container
//! engine to extracting artifacts. Sole writer to its BuildRecord and to
//! `build_dir`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::artifacts::ArtifactStore;
use crate::config;
use crate::layers::{self, RetryPolicy};
use crate::logfanout::LogFanout;
use crate::model::{
    ArtifactMetadata, BuildState, Directories, LogStream, ProjectConfig, EXIT_CODE_CANCELED, EXIT_CODE_PREFLIGHT_FAILURE,
};
use crate::process::{ContainerEngine, ExecutionOutcome, ExecutionRequest};
use crate::registry::{Registry, StateUpdate};
use crate::workspace;

pub struct RunOptions {
    pub build_id: String,
    pub target: String,
    pub customer: String,
    pub force_clean: bool,
    pub force_image_rebuild: bool,
}

/// Everything the Runner needs that outlives this one build.
pub struct RunnerContext {
    pub registry: Arc<Registry>,
    pub artifacts: Arc<ArtifactStore>,
    pub engine: Arc<dyn ContainerEngine>,
}

/// Run one build to completion. Never returns an `Err` that leaves the
/// Registry in a non-terminal state for this build id -- every code path
/// below ends in a `mark_terminal` call.
pub async fn run(
    ctx: RunnerContext,
    config_path: String,
    options: RunOptions,
    cancel: CancellationToken,
) -> Arc<LogFanout> {
    let id = options.build_id.clone();
    let home = config::smidr_home();

    // Phase 1: resolve & default. Both of these must succeed before the
    // live Log Fan-out is created, since it lives at `resolved.build` --
    // the same path that becomes `BuildRecord.build_dir` -- and that path
    // doesn't exist until the project config names it.
    let project_config = match config::load_project_config(Path::new(&config_path)) {
        Ok(c) => c,
        Err(e) => {
            let fanout = bootstrap_fanout(&home, &options, &id);
            fanout.write(LogStream::Meta, &format!("invalid project configuration: {e}"), now());
            finalize_preflight_failure(&ctx.registry, &id, format!("invalid project configuration: {e}"));
            fanout.close();
            return fanout;
        }
    };

    let resolved = match resolve_directories_for(&home, &project_config.directories, &options) {
        Ok(r) => r,
        Err(e) => {
            let fanout = bootstrap_fanout(&home, &options, &id);
            fanout.write(LogStream::Meta, &format!("directory resolution failed: {e}"), now());
            finalize_preflight_failure(&ctx.registry, &id, e.to_string());
            fanout.close();
            return fanout;
        }
    };

    // force_clean: wipe any stale build output before the Log Fan-out takes
    // up residence in build_dir, so a forced build never deletes the very
    // log files it is writing.
    if options.force_clean && resolved.build.exists() {
        let _ = std::fs::remove_dir_all(&resolved.build);
    }
    if let Err(e) = std::fs::create_dir_all(&resolved.build) {
        let fanout = bootstrap_fanout(&home, &options, &id);
        fanout.write(LogStream::Meta, &format!("failed to create build directory: {e}"), now());
        finalize_preflight_failure(&ctx.registry, &id, e.to_string());
        fanout.close();
        return fanout;
    }

    let fanout = Arc::new(LogFanout::create(&resolved.build).unwrap_or_else(|_| {
        LogFanout::create(std::env::temp_dir().join(&id).as_path()).expect("fallback log fanout dir must be creatable")
    }));
    if options.force_clean {
        fanout.write(LogStream::Meta, "force_clean: removed stale build directory", now());
    }

    run_resolved(ctx, project_config, config_path, options, resolved, cancel, fanout.clone()).await;
    fanout
}

/// Fallback Log Fan-out for failures that happen before `resolved.build`
/// is known. No `build_dir` is ever recorded in the Registry on these
/// paths, so no subscriber can observe a mismatch; this only exists so the
/// failure reason lands somewhere before the fanout closes.
fn bootstrap_fanout(home: &Path, options: &RunOptions, id: &str) -> Arc<LogFanout> {
    let guess = home.join("builds").join(format!("build-{}", options.customer)).join(&options.target).join(id);
    let _ = std::fs::create_dir_all(&guess);
    Arc::new(LogFanout::create(&guess).unwrap_or_else(|_| {
        LogFanout::create(std::env::temp_dir().join(id).as_path()).expect("fallback log fanout dir must be creatable")
    }))
}

async fn run_resolved(
    ctx: RunnerContext,
    project_config: ProjectConfig,
    config_path: String,
    options: RunOptions,
    resolved: crate::model::ResolvedDirectories,
    cancel: CancellationToken,
    fanout: Arc<LogFanout>,
) {
    let id = options.build_id.clone();

    // Phase 1 continued: QUEUED -> RUNNING.
    if let Err(e) = ctx.registry.update_state(
        &id,
        BuildState::Running,
        StateUpdate {
            started_at: Some(now()),
            build_dir: Some(resolved.build.display().to_string()),
            tmp_dir: Some(resolved.tmp.display().to_string()),
            deploy_dir: Some(resolved.deploy.display().to_string()),
        },
    ) {
        // QUEUED -> CANCELED already happened concurrently (cancel-before-dispatch).
        tracing::info!(build_id = %id, error = %e, "build dispatch aborted, likely already canceled");
        fanout.close();
        return;
    }

    let started_at = now();

    if cancel.is_cancelled() {
        finalize_canceled(&ctx.registry, &fanout, &id, started_at);
        return;
    }

    fanout.write(LogStream::Meta, "Preparing container environment", now());

    // Phase 2: layer materialization.
    let layer_paths = match layers::materialize_layers(
        &resolved.layers,
        &project_config.layers,
        RetryPolicy::default(),
        options.force_image_rebuild,
    )
    .await
    {
        Ok(paths) => paths,
        Err(e) => {
            fanout.write(LogStream::Meta, &format!("layer materialization failed: {e}"), now());
            finalize_failed(&ctx.registry, &fanout, &id, EXIT_CODE_PREFLIGHT_FAILURE, e.to_string(), started_at);
            return;
        }
    };

    if cancel.is_cancelled() {
        finalize_canceled(&ctx.registry, &fanout, &id, started_at);
        return;
    }

    // Phase 3: workspace assembly.
    if let Err(e) = workspace::write_bblayers_conf(&resolved.build, &layer_paths) {
        finalize_failed(&ctx.registry, &fanout, &id, EXIT_CODE_PREFLIGHT_FAILURE, e.to_string(), started_at);
        return;
    }
    if let Err(e) = workspace::write_local_conf(&resolved.build, &project_config, &resolved) {
        finalize_failed(&ctx.registry, &fanout, &id, EXIT_CODE_PREFLIGHT_FAILURE, e.to_string(), started_at);
        return;
    }

    if cancel.is_cancelled() {
        finalize_canceled(&ctx.registry, &fanout, &id, started_at);
        return;
    }

    // Phase 4: build execution.
    let command = vec!["bitbake".to_string(), options.target.clone()];
    let req = ExecutionRequest {
        container_name: format!("smidr-{id}"),
        image: project_config.base_image.clone(),
        command,
        workspace_dir: resolved.build.display().to_string(),
        deploy_dir: resolved.deploy.display().to_string(),
        downloads_dir: resolved.downloads.display().to_string(),
        sstate_dir: resolved.sstate.display().to_string(),
        layer_dirs: layer_paths.iter().map(|p| p.display().to_string()).collect(),
        env: HashMap::new(),
        fanout: fanout.clone(),
        cancel: cancel.clone(),
    };

    let outcome = ctx.engine.run(req).await;

    fanout.write(LogStream::Meta, "Cleaning up container", now());

    let exit_code = match outcome {
        Ok(ExecutionOutcome::Exited(code)) => code,
        Ok(ExecutionOutcome::Canceled) => {
            let _ = extract_best_effort(&ctx.artifacts, &options, &resolved.deploy, &fanout);
            finalize_canceled(&ctx.registry, &fanout, &id, started_at);
            return;
        }
        Err(e) => {
            fanout.write(LogStream::Meta, &format!("build execution error: {e}"), now());
            finalize_failed(&ctx.registry, &fanout, &id, EXIT_CODE_PREFLIGHT_FAILURE, e, started_at);
            return;
        }
    };

    if exit_code != 0 {
        finalize_failed(&ctx.registry, &fanout, &id, exit_code, format!("subprocess exited with code {exit_code}"), started_at);
        return;
    }

    // Phase 5: artifact extraction (failures here are non-fatal).
    let (extraction_error, artifact_sizes) = extract_best_effort(&ctx.artifacts, &options, &resolved.deploy, &fanout);

    // Phase 6: finalization.
    let ended_at = now();
    let duration = ended_at - started_at;
    let meta = ArtifactMetadata {
        build_id: id.clone(),
        project_name: project_config.project_name.clone(),
        user: std::env::var("USER").unwrap_or_default(),
        timestamp: started_at,
        target_image: options.target.clone(),
        status: BuildState::Succeeded.to_string(),
        build_duration: duration,
        config_used: config_used_summary(&project_config),
        artifact_sizes,
    };
    let _ = ctx.artifacts.save_metadata_in(&options.customer, &meta);
    let _ = config_path;

    let error_message = extraction_error.unwrap_or_default();
    let _ = ctx.registry.mark_terminal(&id, BuildState::Succeeded, 0, error_message, ended_at);
    fanout.close();
}

/// Copies `deploy_dir` into the Artifact Store. Returns `(Some(message),
/// sizes)` on an I/O error that prevented *any* artifact from being
/// captured -- recorded in `error_message` without failing the build --
/// and the per-artifact byte sizes observed, which become
/// `ArtifactMetadata::artifact_sizes`.
fn extract_best_effort(
    store: &ArtifactStore,
    options: &RunOptions,
    deploy_dir: &Path,
    fanout: &LogFanout,
) -> (Option<String>, BTreeMap<String, u64>) {
    match store.store_from_directory(&options.customer, &options.build_id, deploy_dir) {
        Ok(result) => {
            for skipped in &result.skipped {
                fanout.write(LogStream::Meta, &format!("skipped artifact: {skipped}"), now());
            }
            (None, result.sizes)
        }
        Err(e) => {
            fanout.write(LogStream::Meta, &format!("artifact extraction failed: {e}"), now());
            (Some(e.to_string()), BTreeMap::new())
        }
    }
}

fn finalize_preflight_failure(registry: &Registry, id: &str, message: String) {
    let _ = registry.mark_terminal(id, BuildState::Failed, EXIT_CODE_PREFLIGHT_FAILURE, message, now());
}

fn finalize_failed(registry: &Registry, fanout: &LogFanout, id: &str, exit_code: i32, message: String, started_at: i64) {
    let ended_at = now().max(started_at);
    let _ = registry.mark_terminal(id, BuildState::Failed, exit_code, message, ended_at);
    fanout.close();
}

fn finalize_canceled(registry: &Registry, fanout: &LogFanout, id: &str, started_at: i64) {
    let ended_at = now().max(started_at);
    let _ = registry.mark_terminal(id, BuildState::Canceled, EXIT_CODE_CANCELED, String::new(), ended_at);
    fanout.close();
}

fn config_used_summary(config: &ProjectConfig) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    out.insert("machine".into(), config.machine.clone());
    out.insert("distro".into(), config.distro.clone());
    out.insert("version".into(), config.version.clone());
    out.insert("provider".into(), config.provider.clone());
    out
}

/// Applies the `SMIDR_TEST_WORKSPACE_DIR` override before falling back to
/// the usual `${HOME}/.smidr/builds/...` defaulting.
fn resolve_directories_for(
    home: &Path,
    dirs: &Directories,
    options: &RunOptions,
) -> std::io::Result<crate::model::ResolvedDirectories> {
    let mut dirs = dirs.clone();
    if let Ok(over_build) = std::env::var("SMIDR_TEST_WORKSPACE_DIR") {
        if !over_build.is_empty() {
            dirs.build = Some(PathBuf::from(over_build));
        }
    }
    let scoped_home = home
        .join("builds")
        .join(format!("build-{}", options.customer))
        .join(&options.target);
    config::resolve_directories(&scoped_home, &dirs)
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BuildRecord;
    use crate::process::SmokeContainerEngine;
    use std::sync::Arc;

    fn write_config(dir: &Path) -> String {
        let config = crate::config::init_template("demo");
        let path = dir.join("smidr.yaml");
        std::fs::write(&path, config).unwrap();
        path.display().to_string()
    }

    #[tokio::test]
    async fn happy_path_smoke_build_reaches_succeeded() {
        std::env::set_var("SMIDR_HOME", tempfile::tempdir().unwrap().into_path());
        std::env::set_var("SMIDR_TEST_WRITE_MARKERS", "1");
        std::env::set_var("SMIDR_TEST_ENTRYPOINT", "sh,-c,echo ok");

        let project_dir = tempfile::tempdir().unwrap();
        let config_path = write_config(project_dir.path());

        let registry = Arc::new(Registry::new());
        let artifacts = Arc::new(ArtifactStore::new(tempfile::tempdir().unwrap().path().to_path_buf()));
        let options = RunOptions {
            build_id: "user-demo-20260101-000000".into(),
            target: "core-image-minimal".into(),
            customer: String::new(),
            force_clean: false,
            force_image_rebuild: false,
        };
        registry
            .create(BuildRecord::new(options.build_id.clone(), String::new(), "demo".into(), options.target.clone(), config_path.clone()))
            .unwrap();

        let ctx = RunnerContext { registry: registry.clone(), artifacts: artifacts.clone(), engine: Arc::new(SmokeContainerEngine) };
        run(ctx, config_path, options, CancellationToken::new()).await;

        let record = registry.get("user-demo-20260101-000000").unwrap();
        assert_eq!(record.state, BuildState::Succeeded);
        assert_eq!(record.exit_code, 0);

        let names = artifacts.list_artifacts("", "user-demo-20260101-000000").unwrap();
        assert!(names.contains(&"smoke-marker.txt".to_string()));

        let meta = artifacts.load_metadata("", "user-demo-20260101-000000").unwrap();
        assert!(meta.artifact_sizes.contains_key("smoke-marker.txt"));

        let plain_log = std::fs::read_to_string(std::path::Path::new(&record.build_dir).join("build-log.txt")).unwrap();
        assert!(plain_log.contains("Preparing container environment"));
        assert!(plain_log.contains("Cleaning up container"));

        std::env::remove_var("SMIDR_TEST_WRITE_MARKERS");
        std::env::remove_var("SMIDR_TEST_ENTRYPOINT");
        std::env::remove_var("SMIDR_HOME");
    }

    #[tokio::test]
    async fn cancel_during_run_reaches_canceled_with_exit_code_minus_one() {
        std::env::set_var("SMIDR_HOME", tempfile::tempdir().unwrap().into_path());
        std::env::set_var("SMIDR_TEST_WRITE_MARKERS", "1");
        std::env::set_var("SMIDR_TEST_ENTRYPOINT", "sh,-c,sleep 60");

        let project_dir = tempfile::tempdir().unwrap();
        let config_path = write_config(project_dir.path());

        let registry = Arc::new(Registry::new());
        let artifacts = Arc::new(ArtifactStore::new(tempfile::tempdir().unwrap().path().to_path_buf()));
        let options = RunOptions {
            build_id: "user-demo-20260102-000000".into(),
            target: "core-image-minimal".into(),
            customer: String::new(),
            force_clean: false,
            force_image_rebuild: false,
        };
        registry
            .create(BuildRecord::new(options.build_id.clone(), String::new(), "demo".into(), options.target.clone(), config_path.clone()))
            .unwrap();

        let cancel = CancellationToken::new();
        let ctx = RunnerContext { registry: registry.clone(), artifacts, engine: Arc::new(SmokeContainerEngine) };
        let build_id = options.build_id.clone();
        let cancel_for_run = cancel.clone();
        let handle = tokio::spawn(async move { run(ctx, config_path, options, cancel_for_run).await });

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        cancel.cancel();
        handle.await.unwrap();

        let record = registry.get(&build_id).unwrap();
        assert_eq!(record.state, BuildState::Canceled);
        assert_eq!(record.exit_code, crate::model::EXIT_CODE_CANCELED);

        std::env::remove_var("SMIDR_TEST_WRITE_MARKERS");
        std::env::remove_var("SMIDR_TEST_ENTRYPOINT");
        std::env::remove_var("SMIDR_HOME");
    }
}

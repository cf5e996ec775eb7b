//! RPC Façade: request validation, state creation, streaming wiring, and
//! cancellation routing. One struct holds the shared collaborators, with
//! `tonic::async_trait` impls per service and `ReceiverStream` for
//! server-side streaming behind a bounded-channel backpressure valve.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

use crate::artifacts::ArtifactStore;
use crate::error::FacadeError;
use crate::logfanout::FanoutMessage;
use crate::model::BuildState;
use crate::process::{ContainerEngine, SmokeContainerEngine, SystemContainerEngine};
use crate::registry::Registry;
use crate::runner::{self, RunOptions, RunnerContext};

pub mod smidr_v1 {
    tonic::include_proto!("smidr.v1");
}

use smidr_v1::artifact_service_server::ArtifactService;
use smidr_v1::build_service_server::BuildService;
use smidr_v1::log_service_server::LogService;
use smidr_v1::{
    Artifact, BuildIdentifier, BuildStatusRequest, BuildStatusResponse, CancelBuildRequest, CancelBuildResponse,
    ListArtifactsRequest, ListArtifactsResponse, ListBuildsRequest, ListBuildsResponse, LogEntry,
    StartBuildRequest, StreamBuildLogsRequest, Timestamps,
};

/// Cancellation handle for one in-flight build, registered by the Façade
/// when it dispatches the Runner task and consulted by `CancelBuild` to
/// route a client's cancel request into the Runner's context.
struct InFlight {
    tokens: StdMutex<HashMap<String, CancellationToken>>,
}

impl InFlight {
    fn new() -> Self {
        Self { tokens: StdMutex::new(HashMap::new()) }
    }

    fn register(&self, id: String, token: CancellationToken) {
        self.tokens.lock().unwrap().insert(id, token);
    }

    fn take_for_cancel(&self, id: &str) -> Option<CancellationToken> {
        self.tokens.lock().unwrap().get(id).cloned()
    }

    fn forget(&self, id: &str) {
        self.tokens.lock().unwrap().remove(id);
    }
}

#[derive(Clone)]
pub struct Facade {
    registry: Arc<Registry>,
    artifacts: Arc<ArtifactStore>,
    in_flight: Arc<InFlight>,
}

impl Facade {
    pub fn new(registry: Arc<Registry>, artifacts: Arc<ArtifactStore>) -> Self {
        Self { registry, artifacts, in_flight: Arc::new(InFlight::new()) }
    }

    fn engine() -> Arc<dyn ContainerEngine> {
        if crate::process::smoke_mode_enabled() {
            Arc::new(SmokeContainerEngine)
        } else {
            Arc::new(SystemContainerEngine)
        }
    }

    fn to_status_response(record: &crate::model::BuildRecord) -> BuildStatusResponse {
        BuildStatusResponse {
            identifier: Some(BuildIdentifier { build_id: record.id.clone() }),
            target: record.target_image.clone(),
            state: record.state.to_string(),
            config_path: record.config_path.clone(),
            timestamps: Some(Timestamps { start: record.started_at, end: record.ended_at }),
            exit_code: record.exit_code,
            error_message: record.error_message.clone(),
        }
    }
}

fn new_build_id(project_name: &str, customer: &str) -> String {
    let user = if customer.is_empty() { std::env::var("USER").unwrap_or_else(|_| "anon".into()) } else { customer.to_string() };
    let now = chrono::Utc::now();
    format!("{user}-{project_name}-{}", now.format("%Y%m%d-%H%M%S"))
}

#[tonic::async_trait]
impl BuildService for Facade {
    async fn start_build(&self, request: Request<StartBuildRequest>) -> Result<Response<BuildStatusResponse>, Status> {
        let req = request.into_inner();
        if req.config.trim().is_empty() {
            return Err(FacadeError::InvalidRequest("config path must not be empty".into()).into());
        }
        if req.target.trim().is_empty() {
            return Err(FacadeError::InvalidRequest("target image must not be empty".into()).into());
        }
        if !std::path::Path::new(&req.config).exists() {
            return Err(FacadeError::InvalidRequest(format!("config path does not exist: {}", req.config)).into());
        }

        let project_config = crate::config::load_project_config(std::path::Path::new(&req.config))
            .map_err(FacadeError::InvalidRequest)?;

        let build_id = new_build_id(&project_config.project_name, &req.customer);
        let record = crate::model::BuildRecord::new(
            build_id.clone(),
            req.customer.clone(),
            project_config.project_name.clone(),
            req.target.clone(),
            req.config.clone(),
        );
        self.registry.create(record).map_err(FacadeError::from)?;

        let options = RunOptions {
            build_id: build_id.clone(),
            target: req.target.clone(),
            customer: req.customer.clone(),
            force_clean: req.force_clean,
            force_image_rebuild: req.force_image_rebuild,
        };
        let cancel = CancellationToken::new();
        self.in_flight.register(build_id.clone(), cancel.clone());

        let ctx = RunnerContext { registry: self.registry.clone(), artifacts: self.artifacts.clone(), engine: Self::engine() };
        let config_path = req.config.clone();
        let in_flight = self.in_flight.clone();
        let finished_id = build_id.clone();
        tokio::spawn(async move {
            runner::run(ctx, config_path, options, cancel).await;
            in_flight.forget(&finished_id);
        });

        let record = self.registry.get(&build_id).map_err(FacadeError::from)?;
        Ok(Response::new(Self::to_status_response(&record)))
    }

    async fn get_build_status(&self, request: Request<BuildStatusRequest>) -> Result<Response<BuildStatusResponse>, Status> {
        let id = request
            .into_inner()
            .identifier
            .ok_or_else(|| FacadeError::InvalidRequest("missing identifier".into()))?
            .build_id;
        let record = self.registry.get(&id).map_err(FacadeError::from)?;
        Ok(Response::new(Self::to_status_response(&record)))
    }

    async fn list_builds(&self, request: Request<ListBuildsRequest>) -> Result<Response<ListBuildsResponse>, Status> {
        let req = request.into_inner();
        let states: Vec<BuildState> = req.state_filter.iter().filter_map(|s| s.parse().ok()).collect();
        let limit = if req.page_size > 0 { Some(req.page_size as usize) } else { None };
        let builds = self.registry.list(&states, limit).iter().map(Self::to_status_response).collect();
        Ok(Response::new(ListBuildsResponse { builds }))
    }

    async fn cancel_build(&self, request: Request<CancelBuildRequest>) -> Result<Response<CancelBuildResponse>, Status> {
        let id = request
            .into_inner()
            .identifier
            .ok_or_else(|| FacadeError::InvalidRequest("missing identifier".into()))?
            .build_id;

        let record = self.registry.get(&id).map_err(FacadeError::from)?;
        if record.state.is_terminal() {
            return Ok(Response::new(CancelBuildResponse { accepted: false }));
        }

        match self.in_flight.take_for_cancel(&id) {
            Some(token) => {
                token.cancel();
                Ok(Response::new(CancelBuildResponse { accepted: true }))
            }
            None => {
                // QUEUED but no Runner task registered yet, or already finished.
                let _ = self.registry.mark_terminal(&id, BuildState::Canceled, crate::model::EXIT_CODE_CANCELED, String::new(), chrono::Utc::now().timestamp());
                Ok(Response::new(CancelBuildResponse { accepted: true }))
            }
        }
    }
}

#[tonic::async_trait]
impl LogService for Facade {
    type StreamBuildLogsStream = ReceiverStream<Result<LogEntry, Status>>;

    async fn stream_build_logs(
        &self,
        request: Request<StreamBuildLogsRequest>,
    ) -> Result<Response<Self::StreamBuildLogsStream>, Status> {
        let req = request.into_inner();
        let id = req.identifier.ok_or_else(|| FacadeError::InvalidRequest("missing identifier".into()))?.build_id;

        // Existence is checked via the Registry; the Log Fan-out itself is
        // owned by the (possibly already-finished) Runner and reconstructed
        // here purely to read the on-disk backing files.
        let record = self.registry.get(&id).map_err(FacadeError::from)?;
        if record.build_dir.is_empty() {
            return Err(FacadeError::NotFound(format!("build {id} has no log directory yet")).into());
        }

        let fanout = crate::logfanout::LogFanout::create(std::path::Path::new(&record.build_dir))
            .map_err(|e| FacadeError::Internal(e.to_string()))?;
        let mut rx = fanout.subscribe();

        let (tx, out_rx) = mpsc::channel(512);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match msg {
                    FanoutMessage::Line(line) => {
                        let entry = LogEntry { stream: line.stream.to_string(), message: line.text, ts: line.timestamp };
                        if tx.send(Ok(entry)).await.is_err() {
                            return;
                        }
                    }
                    FanoutMessage::End => return,
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(out_rx)))
    }
}

#[tonic::async_trait]
impl ArtifactService for Facade {
    async fn list_artifacts(&self, request: Request<ListArtifactsRequest>) -> Result<Response<ListArtifactsResponse>, Status> {
        let id = request
            .into_inner()
            .identifier
            .ok_or_else(|| FacadeError::InvalidRequest("missing identifier".into()))?
            .build_id;
        let record = self.registry.get(&id).map_err(FacadeError::from)?;

        let names = self.artifacts.list_artifacts(&record.customer, &id).map_err(FacadeError::from)?;
        let sizes = self.artifacts.load_metadata(&record.customer, &id).map(|m| m.artifact_sizes).unwrap_or_default();

        let artifacts = names
            .into_iter()
            .map(|name| {
                let size_bytes = sizes.get(&name).copied().unwrap_or(0);
                Artifact { name, size_bytes, checksum: String::new() }
            })
            .collect();

        Ok(Response::new(ListArtifactsResponse { artifacts }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_build_rejects_missing_config_path() {
        let facade = Facade::new(Arc::new(Registry::new()), Arc::new(ArtifactStore::new(std::env::temp_dir())));
        let req = Request::new(StartBuildRequest {
            config: "/does/not/exist.yaml".into(),
            target: "core-image-minimal".into(),
            customer: String::new(),
            force_clean: false,
            force_image_rebuild: false,
        });
        let err = facade.start_build(req).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn cancel_unknown_build_is_not_found() {
        let facade = Facade::new(Arc::new(Registry::new()), Arc::new(ArtifactStore::new(std::env::temp_dir())));
        let req = Request::new(CancelBuildRequest { identifier: Some(BuildIdentifier { build_id: "nope".into() }) });
        let err = facade.cancel_build(req).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);
    }
}

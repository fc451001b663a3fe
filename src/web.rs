use crate::{
    app::{AppContext, AppError, AppService},
    config::Config,
    coordinator::{ArchivedNote, StructuralChange},
    graph::{GraphError, ListQuery, NoteListing},
    retrieval::{parse_since, SearchResults},
    semantic::{CancelToken, IndexHealth, RebuildStats, SearchQuery},
    stats::VaultStats,
    vault::{CreateNote, ExtractedSection, Note},
    watcher::{self, IndexWorker},
};
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use tokio::signal;

const DEFAULT_LIMIT: usize = 10;
const DEFAULT_LIST_LIMIT: usize = 50;

#[derive(Clone)]
pub struct SharedState {
    service: Arc<AppService>,
    /// Cancelled on shutdown so a running rebuild lets go
    shutdown: CancelToken,
}

impl SharedState {
    pub fn new(service: Arc<AppService>) -> Self {
        Self {
            service,
            shutdown: CancelToken::new(),
        }
    }
}

pub fn router(state: Arc<SharedState>) -> Router {
    Router::new()
        .route("/api/search", post(search))
        .route("/api/note/get", post(get_note))
        .route("/api/note/create", post(create_note))
        .route("/api/note/append", post(append_to_note))
        .route("/api/note/tags", post(update_tags))
        .route("/api/note/replace_section", post(replace_section))
        .route("/api/note/extract_section", post(extract_section))
        .route("/api/note/move", post(move_note))
        .route("/api/note/rename", post(rename_note))
        .route("/api/note/delete", post(delete_note))
        .route("/api/references", post(references))
        .route("/api/backlinks", post(backlinks))
        .route("/api/links", post(links))
        .route("/api/notes", post(list_notes))
        .route("/api/tags", get(tags))
        .route("/api/stats", get(stats))
        .route("/api/index/status", get(index_status))
        .route("/api/index/rebuild", post(rebuild_index))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(state)
}

/// Index maintenance that runs alongside the server.
struct Background {
    worker: IndexWorker,
    _watcher: Option<notify::RecommendedWatcher>,
}

fn start_background(service: &AppService, config: &Config) -> anyhow::Result<Option<Background>> {
    if !config.watch.enabled {
        log::info!("file watching disabled in config");
        return Ok(None);
    }

    let vault = service.vault().clone();
    let index = service.index().clone();

    let worker = IndexWorker::spawn(
        vault.clone(),
        index.clone(),
        Duration::from_millis(config.watch.debounce_ms),
        config.watch.queue_capacity,
    )?;

    // a vault we can't watch still serves; reconciliation and manual
    // rebuilds keep it fresh
    let watcher = match watcher::watch_vault(vault.clone(), worker.sender()) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            log::warn!("file watcher unavailable: {e}");
            None
        }
    };

    watcher::spawn_reconciliation(
        vault,
        index,
        Duration::from_secs(config.watch.reconcile_timeout_secs),
    )?;

    service.attach_worker(Some(worker.sender()));

    Ok(Some(Background {
        worker,
        _watcher: watcher,
    }))
}

async fn start_app(ctx: AppContext) -> anyhow::Result<()> {
    let service = ctx.service();
    let background = start_background(&service, ctx.config())?;

    let state = Arc::new(SharedState::new(service.clone()));
    let signal = shutdown_signal(state.shutdown.clone());

    async fn shutdown_signal(cancel: CancelToken) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                log::error!("failed to install Ctrl+C handler: {e}");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => {
                    log::error!("failed to install signal handler: {e}");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        log::warn!("shutting down");
        cancel.cancel();
    }

    let listen = &ctx.config().server.listen;
    let listener = tokio::net::TcpListener::bind(listen).await?;
    log::info!("listening on {listen}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(signal)
        .await?;

    service.attach_worker(None);
    if let Some(background) = background {
        log::warn!("waiting for index worker to stop");
        tokio::task::block_in_place(move || background.worker.shutdown());
    }

    Ok(())
}

pub fn start_daemon(ctx: AppContext) -> anyhow::Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(start_app(ctx))
}

#[derive(Debug)]
pub struct HttpError(AppError);

impl HttpError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            AppError::NotFound(_) | AppError::SectionNotFound { .. } => StatusCode::NOT_FOUND,
            AppError::AlreadyExists(_)
            | AppError::RenameConflict { .. }
            | AppError::RebuildInProgress => StatusCode::CONFLICT,
            AppError::OutsideVault(_) | AppError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            AppError::IndexUnavailable(_) | AppError::RebuildInterrupted => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::EmbeddingFailure(_) => StatusCode::BAD_GATEWAY,
            AppError::Graph(GraphError::FlagLike { .. }) => StatusCode::BAD_REQUEST,
            AppError::Graph(_) => StatusCode::BAD_GATEWAY,
            AppError::ReferenceRewritePartial { .. }
            | AppError::Io { .. }
            | AppError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("{:?}", self.0);
        }

        let body = json!({
            "error": {
                "kind": self.0.kind(),
                "message": self.0.to_string(),
                "detail": self.0.detail(),
            }
        });

        (status, Json(body)).into_response()
    }
}

impl<E> From<E> for HttpError
where
    E: Into<AppError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub directory: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// RFC 3339 or YYYY-MM-DD
    pub since: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

async fn search(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<SearchRequest>,
) -> Result<Json<SearchResults>, HttpError> {
    log::debug!("payload: {payload:?}");

    let since = match payload.since.as_deref() {
        Some(raw) => Some(parse_since(raw).ok_or_else(|| {
            AppError::InvalidArgument(format!("unrecognised date '{raw}'"))
        })?),
        None => None,
    };

    let query = SearchQuery {
        text: payload.query,
        directory: payload.directory,
        tags: payload.tags,
        since,
        limit: payload.limit,
    };

    tokio::task::block_in_place(move || {
        state.service.search(&query).map(Json).map_err(Into::into)
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathRequest {
    pub path: String,
}

async fn get_note(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<PathRequest>,
) -> Result<Json<Note>, HttpError> {
    tokio::task::block_in_place(move || {
        state.service.get_note(&payload.path).map(Json).map_err(Into::into)
    })
}

async fn create_note(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<CreateNote>,
) -> Result<Json<Value>, HttpError> {
    log::debug!("payload: {payload:?}");

    tokio::task::block_in_place(move || {
        let path = state.service.create_note(&payload)?;
        Ok(Json(json!({ "path": path })))
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppendRequest {
    pub path: String,
    pub text: String,
}

async fn append_to_note(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<AppendRequest>,
) -> Result<Json<Value>, HttpError> {
    tokio::task::block_in_place(move || {
        state.service.append_to_note(&payload.path, &payload.text)?;
        Ok(Json(json!({ "path": payload.path })))
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct TagsRequest {
    pub path: String,
    #[serde(default)]
    pub add: Vec<String>,
    #[serde(default)]
    pub remove: Vec<String>,
}

async fn update_tags(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<TagsRequest>,
) -> Result<Json<Value>, HttpError> {
    log::debug!("payload: {payload:?}");

    tokio::task::block_in_place(move || {
        let changed = state
            .service
            .update_tags(&payload.path, &payload.add, &payload.remove)?;
        Ok(Json(json!({ "path": payload.path, "changed": changed })))
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplaceSectionRequest {
    pub path: String,
    pub section: String,
    pub content: String,
}

async fn replace_section(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<ReplaceSectionRequest>,
) -> Result<Json<Value>, HttpError> {
    tokio::task::block_in_place(move || {
        state
            .service
            .replace_section(&payload.path, &payload.section, &payload.content)?;
        Ok(Json(json!({ "path": payload.path })))
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractSectionRequest {
    pub path: String,
    pub section: String,
    pub new_title: String,
    #[serde(default)]
    pub new_directory: String,
}

async fn extract_section(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<ExtractSectionRequest>,
) -> Result<Json<ExtractedSection>, HttpError> {
    log::debug!("payload: {payload:?}");

    tokio::task::block_in_place(move || {
        state
            .service
            .extract_section(
                &payload.path,
                &payload.section,
                &payload.new_title,
                &payload.new_directory,
            )
            .map(Json)
            .map_err(Into::into)
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct MoveRequest {
    pub path: String,
    pub new_directory: String,
}

async fn move_note(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<MoveRequest>,
) -> Result<Json<StructuralChange>, HttpError> {
    log::debug!("payload: {payload:?}");

    tokio::task::block_in_place(move || {
        state
            .service
            .move_note(&payload.path, &payload.new_directory)
            .map(Json)
            .map_err(Into::into)
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct RenameRequest {
    pub path: String,
    pub new_title: String,
}

async fn rename_note(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<RenameRequest>,
) -> Result<Json<StructuralChange>, HttpError> {
    log::debug!("payload: {payload:?}");

    tokio::task::block_in_place(move || {
        state
            .service
            .rename_note(&payload.path, &payload.new_title)
            .map(Json)
            .map_err(Into::into)
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteRequest {
    pub path: String,
    pub reason: Option<String>,
}

async fn delete_note(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<DeleteRequest>,
) -> Result<Json<ArchivedNote>, HttpError> {
    log::debug!("payload: {payload:?}");

    tokio::task::block_in_place(move || {
        state
            .service
            .delete_note(&payload.path, payload.reason.as_deref())
            .map(Json)
            .map_err(Into::into)
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReferencesRequest {
    pub title: String,
    #[serde(default)]
    pub include_text_mentions: bool,
}

async fn references(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<ReferencesRequest>,
) -> Result<Json<Value>, HttpError> {
    tokio::task::block_in_place(move || {
        let refs = state
            .service
            .find_references(&payload.title, payload.include_text_mentions)?;
        Ok(Json(json!({ "title": payload.title, "references": refs })))
    })
}

async fn backlinks(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<PathRequest>,
) -> Result<Json<Value>, HttpError> {
    tokio::task::block_in_place(move || {
        let notes = state.service.backlinks(&payload.path)?;
        Ok(Json(json!({ "path": payload.path, "backlinks": notes })))
    })
}

async fn links(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<PathRequest>,
) -> Result<Json<Value>, HttpError> {
    tokio::task::block_in_place(move || {
        let notes = state.service.links(&payload.path)?;
        Ok(Json(json!({ "path": payload.path, "links": notes })))
    })
}

fn default_list_limit() -> usize {
    DEFAULT_LIST_LIMIT
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListRequest {
    pub directory: Option<String>,
    pub tag: Option<String>,
    #[serde(default = "default_list_limit")]
    pub limit: usize,
}

async fn list_notes(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<ListRequest>,
) -> Result<Json<Vec<NoteListing>>, HttpError> {
    tokio::task::block_in_place(move || {
        let query = ListQuery {
            directory: payload.directory,
            tag: payload.tag,
            limit: payload.limit,
        };
        state.service.list_notes(&query).map(Json).map_err(Into::into)
    })
}

async fn tags(State(state): State<Arc<SharedState>>) -> Result<Json<Value>, HttpError> {
    tokio::task::block_in_place(move || {
        let tags = state.service.tags()?;
        Ok(Json(json!({ "tags": tags })))
    })
}

async fn stats(State(state): State<Arc<SharedState>>) -> Json<VaultStats> {
    tokio::task::block_in_place(move || Json(state.service.stats()))
}

async fn index_status(State(state): State<Arc<SharedState>>) -> Json<IndexHealth> {
    tokio::task::block_in_place(move || Json(state.service.index_status()))
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RebuildRequest {
    #[serde(default)]
    pub confirm: bool,
}

async fn rebuild_index(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<RebuildRequest>,
) -> Result<Json<RebuildStats>, HttpError> {
    if !payload.confirm {
        return Err(AppError::InvalidArgument(
            "a full rebuild re-embeds every note; pass confirm: true".to_string(),
        )
        .into());
    }

    tokio::task::block_in_place(move || {
        state
            .service
            .rebuild_index(&state.shutdown, &|done: usize, total: usize| {
                if done % 100 == 0 || done == total {
                    log::info!("rebuild progress: {done}/{total}");
                }
            })
            .map(Json)
            .map_err(Into::into)
    })
}

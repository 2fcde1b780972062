use std::path::PathBuf;
use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::spawn;
use tracing::{error, info, warn};

use crate::{
    app_state::AppState,
    error::{ErrorKind, GenerationError, IngestError},
    ingest,
    llm::TextGenerator,
    models::{FileNode, HistoryEntry},
    orchestrator::{AnalyzeOutcome, DeepDiveOutcome},
};

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

/// Traduce un fallo de generación al código HTTP que espera el frontend.
/// Sin credencial se responde 428 para que la UI muestre su aviso bloqueante.
fn generation_error(err: GenerationError) -> ApiError {
    let status = match err.kind() {
        ErrorKind::Configuration => StatusCode::PRECONDITION_REQUIRED,
        ErrorKind::InvalidCredential => StatusCode::UNAUTHORIZED,
        ErrorKind::MalformedResponse | ErrorKind::Network => StatusCode::BAD_GATEWAY,
    };
    api_error(status, err.user_message())
}

fn ingest_error(err: IngestError) -> ApiError {
    let status = match err {
        IngestError::TooManyFiles { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        IngestError::NotADirectory(_) | IngestError::Empty => StatusCode::BAD_REQUEST,
    };
    api_error(status, err.to_string())
}

// --- Payloads ---

#[derive(Deserialize)]
pub struct CredentialPayload {
    api_key: String,
}

#[derive(Deserialize)]
pub struct PastePayload {
    #[serde(default)]
    name: Option<String>,
    text: String,
}

#[derive(Deserialize)]
pub struct DirectoryPayload {
    path: String,
}

#[derive(Deserialize)]
pub struct FilePayload {
    path: String,
}

#[derive(Deserialize)]
pub struct ExplanationQuery {
    path: String,
    // Línea bajo el cursor (1-based), para resaltar su bloque.
    #[serde(default)]
    line: Option<usize>,
}

#[derive(Deserialize)]
pub struct DeepDivePayload {
    path: String,
    block_index: usize,
}

#[derive(Deserialize)]
pub struct RestorePayload {
    id: String,
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/credential", post(set_credential_handler).delete(clear_credential_handler))
        .route("/api/project", get(project_handler))
        .route("/api/project/paste", post(paste_project_handler))
        .route("/api/project/directory", post(directory_project_handler))
        .route("/api/analyze", post(analyze_handler))
        .route("/api/analyze-all", post(analyze_all_handler))
        .route("/api/deep-dive", post(deep_dive_handler))
        .route("/api/explanation", get(explanation_handler))
        .route("/api/summary/file", post(file_summary_handler))
        .route("/api/summary/project", post(project_summary_handler))
        .route("/api/history", get(history_handler))
        .route("/api/history/save", post(save_history_handler))
        .route("/api/history/restore", post(restore_history_handler))
        .route("/api/reset", post(reset_handler))
        .route("/api/shutdown", post(shutdown_handler))
        .with_state(app_state)
}

// --- Estado y credenciales ---

#[axum::debug_handler]
async fn status_handler(State(state): State<AppState>) -> Json<Value> {
    let (configured, source) = {
        let credentials = state.llm_manager.credentials();
        (credentials.key().is_some(), credentials.source())
    };
    let project = state.project().as_ref().map(|p| p.name.clone());
    Json(json!({
        "provider": state.llm_manager.provider,
        "model": state.llm_manager.chat_model,
        "credential_configured": configured,
        "credential_source": source,
        "project": project,
        "statuses": state.session.statuses(),
        "queue": state.orchestrator.queued_paths(),
        "deep_dive": state.session.deep_dive(),
        "cached_explanations": state.session.cached_explanations(),
    }))
}

#[axum::debug_handler]
async fn set_credential_handler(
    State(state): State<AppState>,
    Json(payload): Json<CredentialPayload>,
) -> Result<impl IntoResponse, ApiError> {
    let key = payload.api_key.trim();
    if key.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "La clave de API no puede estar vacía."));
    }
    state.llm_manager.credentials().set_user_key(key);
    info!("Clave de API del usuario configurada.");
    Ok((StatusCode::OK, Json(json!({ "message": "Clave de API guardada." }))))
}

#[axum::debug_handler]
async fn clear_credential_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.llm_manager.credentials().clear();
    info!("Clave de API eliminada.");
    StatusCode::NO_CONTENT
}

// --- Proyecto ---

/// Sustituye el proyecto cargado y descarta la sesión anterior.
fn load_project(state: &AppState, tree: FileNode) -> Json<FileNode> {
    state.orchestrator.cancel_pending();
    state.session.reset();
    info!("Proyecto '{}' cargado con {} ficheros", tree.name, tree.files().len());
    *state.project() = Some(tree.clone());
    Json(tree)
}

#[axum::debug_handler]
async fn project_handler(State(state): State<AppState>) -> Result<Json<FileNode>, ApiError> {
    state
        .project()
        .clone()
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "No hay ningún proyecto cargado."))
}

#[axum::debug_handler]
async fn paste_project_handler(
    State(state): State<AppState>,
    Json(payload): Json<PastePayload>,
) -> Result<Json<FileNode>, ApiError> {
    let name = payload
        .name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| "Proyecto pegado".to_string());
    let tree = ingest::parse_pasted_project(&name, &payload.text).map_err(ingest_error)?;
    Ok(load_project(&state, tree))
}

#[axum::debug_handler]
async fn directory_project_handler(
    State(state): State<AppState>,
    Json(payload): Json<DirectoryPayload>,
) -> Result<Json<FileNode>, ApiError> {
    // Una ruta vacía no es un directorio: se responde 400.
    let path = PathBuf::from(payload.path.trim());

    let tree = tokio::task::spawn_blocking(move || ingest::ingest_directory(&path))
        .await
        .map_err(|e| {
            error!("La tarea de ingesta falló: {}", e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "La lectura del directorio se interrumpió.")
        })?
        .map_err(ingest_error)?;
    Ok(load_project(&state, tree))
}

// --- Análisis ---

fn require_file(state: &AppState, path: &str) -> Result<FileNode, ApiError> {
    match state.find_file(path) {
        Some(file) if file.is_file() => Ok(file),
        _ => Err(api_error(
            StatusCode::NOT_FOUND,
            format!("El fichero '{}' no existe en el proyecto.", path),
        )),
    }
}

#[axum::debug_handler]
async fn analyze_handler(
    State(state): State<AppState>,
    Json(payload): Json<FilePayload>,
) -> Result<impl IntoResponse, ApiError> {
    let file = require_file(&state, &payload.path)?;
    state.llm_manager.ensure_configured().map_err(generation_error)?;

    let orchestrator = state.orchestrator.clone();
    spawn(async move {
        match orchestrator.analyze(&file).await {
            Ok(AnalyzeOutcome::Failed { message }) => warn!("Análisis de {} fallido: {}", file.path, message),
            Ok(outcome) => info!("Análisis de {}: {:?}", file.path, outcome),
            Err(e) => error!("No se pudo analizar {}: {}", file.path, e),
        }
    });
    Ok(StatusCode::ACCEPTED)
}

#[axum::debug_handler]
async fn analyze_all_handler(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let files: Vec<FileNode> = match state.project().as_ref() {
        Some(tree) => tree.files().into_iter().cloned().collect(),
        None => return Err(api_error(StatusCode::BAD_REQUEST, "Primero debe cargar un proyecto.")),
    };
    state.llm_manager.ensure_configured().map_err(generation_error)?;

    let orchestrator = state.orchestrator.clone();
    spawn(async move {
        if let Err(e) = orchestrator.process_all(&files).await {
            error!("Error procesando la cola de análisis: {}", e);
        }
    });
    Ok(StatusCode::ACCEPTED)
}

#[axum::debug_handler]
async fn deep_dive_handler(
    State(state): State<AppState>,
    Json(payload): Json<DeepDivePayload>,
) -> Result<impl IntoResponse, ApiError> {
    let file = require_file(&state, &payload.path)?;
    state.llm_manager.ensure_configured().map_err(generation_error)?;
    if let Some(current) = state.session.deep_dive().filter(|d| d.is_loading) {
        return Err(api_error(
            StatusCode::CONFLICT,
            format!("Ya hay un deep dive en curso ({}#{}).", current.file, current.block_index),
        ));
    }
    let block_exists = state
        .session
        .explanation(&file.path)
        .is_some_and(|e| payload.block_index < e.blocks.len());
    if !block_exists {
        return Err(api_error(StatusCode::NOT_FOUND, "El bloque indicado no existe."));
    }

    let orchestrator = state.orchestrator.clone();
    let block_index = payload.block_index;
    spawn(async move {
        match orchestrator.deep_dive(&file, block_index).await {
            Ok(DeepDiveOutcome::Completed) => info!("Deep dive de {}#{} completado", file.path, block_index),
            Ok(outcome) => warn!("Deep dive de {}#{}: {:?}", file.path, block_index, outcome),
            Err(e) => error!("No se pudo iniciar el deep dive: {}", e),
        }
    });
    Ok(StatusCode::ACCEPTED)
}

#[axum::debug_handler]
async fn explanation_handler(
    State(state): State<AppState>,
    Query(query): Query<ExplanationQuery>,
) -> Result<Json<Value>, ApiError> {
    let file = require_file(&state, &query.path)?;
    let source = file.content.as_deref().unwrap_or_default();
    let projection = state.session.projection(&file.path, source);
    let gaps: Vec<[usize; 2]> = projection
        .as_ref()
        .map(|p| p.gaps(source).into_iter().map(|r| [*r.start(), *r.end()]).collect())
        .unwrap_or_default();
    let unlocatable = projection.as_ref().map(|p| p.unlocatable()).unwrap_or_default();
    let active_block = query
        .line
        .zip(projection.as_ref())
        .and_then(|(line, p)| p.block_at_line(line).map(|index| (index, p.block_lines(index))))
        .map(|(index, lines)| {
            json!({
                "index": index,
                "lines": lines.map(|r| [*r.start(), *r.end()]),
            })
        });

    Ok(Json(json!({
        "path": file.path,
        "status": state.session.status(&file.path),
        "explanation": state.session.explanation(&file.path),
        "projection": projection,
        "gaps": gaps,
        "unlocatable": unlocatable,
        "active_block": active_block,
        "deep_dive": state.session.deep_dive(),
    })))
}

// --- Resúmenes ---

#[axum::debug_handler]
async fn file_summary_handler(
    State(state): State<AppState>,
    Json(payload): Json<FilePayload>,
) -> Result<Json<Value>, ApiError> {
    let file = require_file(&state, &payload.path)?;
    let summary = state
        .orchestrator
        .summarize_file(&file)
        .await
        .map_err(generation_error)?;
    Ok(Json(json!({ "path": file.path, "summary": summary })))
}

#[axum::debug_handler]
async fn project_summary_handler(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let tree = state
        .project()
        .clone()
        .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "Primero debe cargar un proyecto."))?;
    let summary = state
        .orchestrator
        .summarize_project(&tree)
        .await
        .map_err(generation_error)?;
    Ok(Json(json!({ "summary": summary })))
}

// --- Historial ---

#[axum::debug_handler]
async fn history_handler(State(state): State<AppState>) -> Result<Json<Vec<HistoryEntry>>, ApiError> {
    state.history.load().await.map(Json).map_err(|e| {
        error!("Error leyendo el historial: {}", e);
        api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("Error leyendo el historial: {}", e))
    })
}

#[axum::debug_handler]
async fn save_history_handler(State(state): State<AppState>) -> Result<Json<Vec<HistoryEntry>>, ApiError> {
    let entry = {
        let project = state.project();
        let tree = project
            .as_ref()
            .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "No hay ningún proyecto que guardar."))?;
        state.session.to_history_entry(tree)
    };
    state.history.record(entry).await.map(Json).map_err(|e| {
        error!("Error guardando el historial: {}", e);
        api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("Error guardando el historial: {}", e))
    })
}

#[axum::debug_handler]
async fn restore_history_handler(
    State(state): State<AppState>,
    Json(payload): Json<RestorePayload>,
) -> Result<Json<FileNode>, ApiError> {
    let entries = state.history.load().await.map_err(|e| {
        api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("Error leyendo el historial: {}", e))
    })?;
    let entry = entries
        .into_iter()
        .find(|e| e.id == payload.id)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "La entrada de historial no existe."))?;

    state.orchestrator.cancel_pending();
    state.session.restore(&entry);
    *state.project() = Some(entry.file_tree.clone());
    info!("Sesión restaurada desde el historial: {}", entry.project_name);
    Ok(Json(entry.file_tree))
}

// --- Reinicio y apagado ---

#[axum::debug_handler]
async fn reset_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.orchestrator.cancel_pending();
    state.session.reset();
    *state.project() = None;
    info!("Sesión reiniciada.");
    StatusCode::OK
}

#[axum::debug_handler]
async fn shutdown_handler(
    State(state): State<AppState>,
) -> impl IntoResponse {
    info!("Petición de apagado recibida.");
    let sender = state
        .shutdown_sender
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take();
    if let Some(sender) = sender {
        let _ = sender.send(());
    }
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn ingest_errors_are_client_errors() {
        let too_many = IngestError::TooManyFiles { found: 26, limit: 25 };
        assert_eq!(ingest_error(too_many).0, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(ingest_error(IngestError::Empty).0, StatusCode::BAD_REQUEST);

        let empty_path = ingest::ingest_directory(Path::new("")).unwrap_err();
        let (status, Json(body)) = ingest_error(empty_path);
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("no es un directorio"));
    }
}

use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use crate::{
    config::AppConfig, history::HistoryManager, llm::LlmManager, models::FileNode,
    orchestrator::Orchestrator, session::SessionStore,
};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub llm_manager: Arc<LlmManager>,
    pub session: Arc<SessionStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub history: Arc<HistoryManager>,
    // Proyecto cargado actualmente (árbol con contenidos).
    pub project: Arc<Mutex<Option<FileNode>>>,
    pub shutdown_sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl AppState {
    pub fn project(&self) -> MutexGuard<'_, Option<FileNode>> {
        self.project.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Busca un fichero del proyecto cargado por su ruta relativa.
    pub fn find_file(&self, path: &str) -> Option<FileNode> {
        self.project().as_ref().and_then(|tree| tree.find_file(path).cloned())
    }
}

//! Persistencia del historial de análisis.
//!
//! Dos backends: un fichero JSON local y, opcionalmente, un almacén remoto
//! por usuario al que se sube el mismo blob con GET/PUT. Un fallo remoto
//! nunca bloquea ni corrompe la copia local.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{info, warn};
use url::Url;

use crate::config::AppConfig;
use crate::error::HistoryError;
use crate::models::HistoryEntry;

/// Número máximo de entradas que se conservan.
pub const MAX_HISTORY_ENTRIES: usize = 20;

#[async_trait]
pub trait HistoryBackend: Send + Sync {
    async fn load(&self) -> Result<Vec<HistoryEntry>, HistoryError>;
    async fn save(&self, entries: &[HistoryEntry]) -> Result<(), HistoryError>;
}

/// Historial en un fichero JSON del dispositivo.
pub struct LocalHistoryStore {
    path: PathBuf,
}

impl LocalHistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl HistoryBackend for LocalHistoryStore {
    async fn load(&self) -> Result<Vec<HistoryEntry>, HistoryError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) if raw.trim().is_empty() => Ok(Vec::new()),
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, entries: &[HistoryEntry]) -> Result<(), HistoryError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let raw = serde_json::to_string_pretty(entries)?;
        // Escritura atómica: fichero temporal y renombrado.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// Historial en un almacén remoto de blobs por usuario.
pub struct RemoteHistoryStore {
    client: reqwest::Client,
    url: Url,
    token: Option<String>,
}

impl RemoteHistoryStore {
    pub fn new(url: Url, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            token,
        }
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl HistoryBackend for RemoteHistoryStore {
    async fn load(&self) -> Result<Vec<HistoryEntry>, HistoryError> {
        let response = self.authorized(self.client.get(self.url.clone())).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let response = response.error_for_status()?;
        Ok(response.json::<Vec<HistoryEntry>>().await?)
    }

    async fn save(&self, entries: &[HistoryEntry]) -> Result<(), HistoryError> {
        self.authorized(self.client.put(self.url.clone()))
            .json(entries)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Coordina el backend local y el remoto opcional.
pub struct HistoryManager {
    local: Box<dyn HistoryBackend>,
    remote: Option<Box<dyn HistoryBackend>>,
}

impl HistoryManager {
    pub fn new(local: Box<dyn HistoryBackend>, remote: Option<Box<dyn HistoryBackend>>) -> Self {
        Self { local, remote }
    }

    pub fn from_config(cfg: &AppConfig) -> Self {
        let local = Box::new(LocalHistoryStore::new(&cfg.history_path));
        let remote = cfg.remote_history_url.clone().map(|url| {
            info!("Historial remoto habilitado en {}", url);
            Box::new(RemoteHistoryStore::new(url, cfg.remote_history_token.clone())) as Box<dyn HistoryBackend>
        });
        Self::new(local, remote)
    }

    /// Prefiere la copia remota; si falla, usa la local.
    pub async fn load(&self) -> Result<Vec<HistoryEntry>, HistoryError> {
        if let Some(remote) = &self.remote {
            match remote.load().await {
                Ok(entries) => return Ok(entries),
                Err(e) => warn!("No se pudo leer el historial remoto, se usa el local: {}", e),
            }
        }
        self.local.load().await
    }

    /// Guarda primero en local (los errores se propagan) y después en remoto
    /// (los errores sólo se registran).
    pub async fn save(&self, entries: &[HistoryEntry]) -> Result<(), HistoryError> {
        self.local.save(entries).await?;
        if let Some(remote) = &self.remote {
            if let Err(e) = remote.save(entries).await {
                warn!("No se pudo guardar el historial remoto: {}", e);
            }
        }
        Ok(())
    }

    /// Añade una entrada al principio y recorta a `MAX_HISTORY_ENTRIES`.
    pub async fn record(&self, entry: HistoryEntry) -> Result<Vec<HistoryEntry>, HistoryError> {
        let mut entries = self.load().await?;
        entries.retain(|e| e.id != entry.id);
        entries.insert(0, entry);
        entries.truncate(MAX_HISTORY_ENTRIES);
        self.save(&entries).await?;
        info!("Historial guardado ({} entradas)", entries.len());
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FileNode;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn entry(id: &str) -> HistoryEntry {
        HistoryEntry {
            id: id.to_string(),
            timestamp: Utc::now(),
            project_name: "demo".into(),
            file_tree: FileNode::directory("demo", "", vec![FileNode::file("a.rs", "a.rs", "x")]),
            explanations_cache: HashMap::new(),
            file_summaries: HashMap::new(),
            project_summary: None,
        }
    }

    struct FailingBackend;

    #[async_trait]
    impl HistoryBackend for FailingBackend {
        async fn load(&self) -> Result<Vec<HistoryEntry>, HistoryError> {
            Err(HistoryError::Remote("sin red".into()))
        }
        async fn save(&self, _entries: &[HistoryEntry]) -> Result<(), HistoryError> {
            Err(HistoryError::Remote("sin red".into()))
        }
    }

    #[derive(Default)]
    struct MemoryBackend {
        entries: Mutex<Vec<HistoryEntry>>,
    }

    #[async_trait]
    impl HistoryBackend for MemoryBackend {
        async fn load(&self) -> Result<Vec<HistoryEntry>, HistoryError> {
            Ok(self.entries.lock().unwrap().clone())
        }
        async fn save(&self, entries: &[HistoryEntry]) -> Result<(), HistoryError> {
            *self.entries.lock().unwrap() = entries.to_vec();
            Ok(())
        }
    }

    #[test]
    fn local_store_round_trips_and_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalHistoryStore::new(dir.path().join("nested").join("history.json"));
        tokio_test::block_on(async {
            assert!(store.load().await.unwrap().is_empty());
            store.save(&[entry("1"), entry("2")]).await.unwrap();
            let loaded = store.load().await.unwrap();
            assert_eq!(loaded.len(), 2);
            assert_eq!(loaded[0].id, "1");
        });
    }

    #[tokio::test]
    async fn remote_failure_does_not_block_local_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        let manager = HistoryManager::new(
            Box::new(LocalHistoryStore::new(&path)),
            Some(Box::new(FailingBackend)),
        );
        let entries = manager.record(entry("a")).await.unwrap();
        assert_eq!(entries.len(), 1);
        let local = LocalHistoryStore::new(&path).load().await.unwrap();
        assert_eq!(local[0].id, "a");
    }

    #[tokio::test]
    async fn record_prepends_and_caps_entries() {
        let manager = HistoryManager::new(Box::new(MemoryBackend::default()), None);
        for i in 0..(MAX_HISTORY_ENTRIES + 3) {
            manager.record(entry(&i.to_string())).await.unwrap();
        }
        let entries = manager.load().await.unwrap();
        assert_eq!(entries.len(), MAX_HISTORY_ENTRIES);
        assert_eq!(entries[0].id, (MAX_HISTORY_ENTRIES + 2).to_string());
    }

    #[tokio::test]
    async fn remote_copy_is_preferred_when_available() {
        let remote = MemoryBackend::default();
        remote.entries.lock().unwrap().push(entry("remota"));
        let manager = HistoryManager::new(Box::new(MemoryBackend::default()), Some(Box::new(remote)));
        let entries = manager.load().await.unwrap();
        assert_eq!(entries[0].id, "remota");
    }
}

//! Abstracción sobre Rig para hablar con la API de generación de texto.
//!
//! Aquí vive la frontera con el proveedor: los errores de Rig se clasifican
//! una única vez en `GenerationError` y el resto del sistema sólo ve esa
//! enumeración.

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use rig::agent::Agent;
use rig::completion::{CompletionError, CompletionModel, Prompt, PromptError};
use rig::streaming::{StreamedAssistantContent, StreamingCompletion};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{AppConfig, LlmProvider};
use crate::error::GenerationError;

/// Secuencia de fragmentos de texto de una llamada en streaming.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, GenerationError>> + Send>>;

/// Petición a la API de generación.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub model: String,
    pub prompt: String,
    pub system_instruction: String,
    pub temperature: f64,
}

/// Capacidad de generación de texto que consume el orquestador.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Falla antes de cualquier llamada de red si no hay credencial.
    fn ensure_configured(&self) -> Result<(), GenerationError>;

    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError>;

    async fn generate_stream(&self, request: &GenerationRequest) -> Result<FragmentStream, GenerationError>;
}

// ---------------------------------------------------------------------
// CREDENCIALES
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSource {
    /// Variable de entorno: privilegiada, nunca se borra.
    Environment,
    /// Introducida por el usuario en tiempo de ejecución.
    User,
}

#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    key: Option<(String, CredentialSource)>,
}

impl CredentialStore {
    pub fn from_env(provider: LlmProvider) -> Self {
        let key = std::env::var(provider.api_key_var())
            .ok()
            .filter(|k| !k.trim().is_empty())
            .map(|k| (k, CredentialSource::Environment));
        Self { key }
    }

    pub fn set_user_key(&mut self, key: impl Into<String>) {
        self.key = Some((key.into(), CredentialSource::User));
    }

    pub fn clear(&mut self) {
        self.key = None;
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_ref().map(|(k, _)| k.as_str())
    }

    pub fn source(&self) -> Option<CredentialSource> {
        self.key.as_ref().map(|(_, s)| *s)
    }

    /// Reacciona a una credencial rechazada. Devuelve `true` si se olvidó.
    pub fn reject(&mut self) -> bool {
        match self.source() {
            Some(CredentialSource::User) => {
                self.key = None;
                true
            }
            _ => false,
        }
    }
}

fn note_failure(credentials: &Mutex<CredentialStore>, err: &GenerationError) {
    if let GenerationError::InvalidCredential(_) = err {
        let mut store = credentials.lock().unwrap_or_else(|e| e.into_inner());
        if store.reject() {
            warn!("Clave de API rechazada por el proveedor; se descarta la clave del usuario.");
        } else {
            warn!("Clave de API de entorno rechazada por el proveedor; se mantiene.");
        }
    }
}

// ---------------------------------------------------------------------
// CLASIFICACIÓN DE ERRORES
// ---------------------------------------------------------------------

const CREDENTIAL_HINTS: [&str; 7] = [
    "API key not valid",
    "API_KEY_INVALID",
    "invalid_api_key",
    "Incorrect API key",
    "Unauthorized",
    "401",
    "PERMISSION_DENIED",
];

fn classify_completion_error(err: CompletionError) -> GenerationError {
    match err {
        CompletionError::JsonError(e) => GenerationError::MalformedResponse(e.to_string()),
        CompletionError::ResponseError(msg) => GenerationError::MalformedResponse(msg),
        CompletionError::ProviderError(msg) => {
            if CREDENTIAL_HINTS.iter().any(|hint| msg.contains(hint)) {
                GenerationError::InvalidCredential(msg)
            } else {
                GenerationError::Network(msg)
            }
        }
        other => GenerationError::Network(other.to_string()),
    }
}

fn classify_prompt_error(err: PromptError) -> GenerationError {
    match err {
        PromptError::CompletionError(e) => classify_completion_error(e),
        other => GenerationError::Network(other.to_string()),
    }
}

// ---------------------------------------------------------------------
// GESTOR DE LLM
// ---------------------------------------------------------------------

/// Gestor de llamadas al LLM a través de Rig.
#[derive(Debug, Clone)]
pub struct LlmManager {
    pub provider: LlmProvider,
    pub chat_model: String,
    credentials: Arc<Mutex<CredentialStore>>,
}

impl LlmManager {
    /// Construye el manager a partir de la configuración.
    pub fn from_config(cfg: &AppConfig) -> Self {
        let credentials = CredentialStore::from_env(cfg.llm_provider);
        if credentials.key().is_some() {
            info!("Clave de API cargada desde {}", cfg.llm_provider.api_key_var());
        } else {
            info!("Sin clave de API en el entorno; se pedirá al usuario.");
        }
        Self {
            provider: cfg.llm_provider,
            chat_model: cfg.llm_chat_model.clone(),
            credentials: Arc::new(Mutex::new(credentials)),
        }
    }

    pub fn credentials(&self) -> MutexGuard<'_, CredentialStore> {
        self.credentials.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn api_key(&self) -> Result<String, GenerationError> {
        self.credentials()
            .key()
            .map(str::to_string)
            .ok_or(GenerationError::MissingCredential)
    }

    fn watch_credentials(&self, stream: FragmentStream) -> FragmentStream {
        let credentials = self.credentials.clone();
        Box::pin(stream.inspect(move |item| {
            if let Err(e) = item {
                note_failure(&credentials, e);
            }
        }))
    }
}

async fn prompt_agent<M: CompletionModel + 'static>(agent: Agent<M>, prompt: &str) -> Result<String, GenerationError> {
    agent.prompt(prompt).await.map_err(classify_prompt_error)
}

async fn stream_agent<M>(agent: Agent<M>, prompt: String) -> Result<FragmentStream, GenerationError>
where
    M: CompletionModel + 'static,
    M::StreamingResponse: 'static,
{
    let response = agent
        .stream_completion(prompt, Vec::new())
        .await
        .map_err(classify_completion_error)?
        .stream()
        .await
        .map_err(classify_completion_error)?;

    let fragments = response.filter_map(|item| async move {
        match item {
            Ok(StreamedAssistantContent::Text(text)) => Some(Ok(text.text)),
            Ok(_) => None,
            Err(e) => Some(Err(classify_completion_error(e))),
        }
    });
    Ok(Box::pin(fragments))
}

#[async_trait]
impl TextGenerator for LlmManager {
    fn ensure_configured(&self) -> Result<(), GenerationError> {
        self.api_key().map(|_| ())
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        use rig::client::CompletionClient as _;
        use rig::providers::{gemini, openai};

        let key = self.api_key()?;
        let result = match self.provider {
            LlmProvider::Gemini => {
                let client = gemini::Client::new(&key);
                let agent = client
                    .agent(&request.model)
                    .preamble(&request.system_instruction)
                    .temperature(request.temperature)
                    .build();
                prompt_agent(agent, &request.prompt).await
            }
            LlmProvider::OpenAI => {
                let client = openai::Client::new(&key);
                let agent = client
                    .agent(&request.model)
                    .preamble(&request.system_instruction)
                    .temperature(request.temperature)
                    .build();
                prompt_agent(agent, &request.prompt).await
            }
        };
        if let Err(e) = &result {
            note_failure(&self.credentials, e);
        }
        result
    }

    async fn generate_stream(&self, request: &GenerationRequest) -> Result<FragmentStream, GenerationError> {
        use rig::client::CompletionClient as _;
        use rig::providers::{gemini, openai};

        let key = self.api_key()?;
        let result = match self.provider {
            LlmProvider::Gemini => {
                let client = gemini::Client::new(&key);
                let agent = client
                    .agent(&request.model)
                    .preamble(&request.system_instruction)
                    .temperature(request.temperature)
                    .build();
                stream_agent(agent, request.prompt.clone()).await
            }
            LlmProvider::OpenAI => {
                let client = openai::Client::new(&key);
                let agent = client
                    .agent(&request.model)
                    .preamble(&request.system_instruction)
                    .temperature(request.temperature)
                    .build();
                stream_agent(agent, request.prompt.clone()).await
            }
        };
        match result {
            Ok(stream) => Ok(self.watch_credentials(stream)),
            Err(e) => {
                note_failure(&self.credentials, &e);
                Err(e)
            }
        }
    }
}

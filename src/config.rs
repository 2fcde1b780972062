//! Carga y gestión de configuración de la aplicación (servidor + LLM + historial).

use std::env;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use serde::Serialize;
use url::Url;

use crate::stream_parser::StreamFormat;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    OpenAI,
    Gemini,
}

impl LlmProvider {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "gemini" => Ok(Self::Gemini),
            other => Err(anyhow!("Proveedor LLM no soportado: {other}")),
        }
    }

    /// Variable de entorno de la que se lee la clave de API.
    pub fn api_key_var(&self) -> &'static str {
        match self {
            Self::OpenAI => "OPENAI_API_KEY",
            Self::Gemini => "GEMINI_API_KEY",
        }
    }

    pub fn default_chat_model(&self) -> &'static str {
        match self {
            Self::OpenAI => "gpt-4o-mini",
            Self::Gemini => "gemini-2.5-flash",
        }
    }
}

pub fn parse_stream_format(s: &str) -> Result<StreamFormat> {
    match s.to_lowercase().as_str() {
        "jsonl" | "json" | "json-lines" => Ok(StreamFormat::JsonLines),
        "markers" | "marker" => Ok(StreamFormat::Markers),
        other => Err(anyhow!("Formato de análisis no soportado: {other}")),
    }
}

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server_addr: String,
    pub frontend_dir: PathBuf,
    pub open_browser: bool,

    pub llm_provider: LlmProvider,
    pub llm_chat_model: String,
    pub llm_temperature: f64,
    pub analysis_format: StreamFormat,
    pub detect_format: bool,

    pub history_path: PathBuf,
    pub remote_history_url: Option<Url>,
    pub remote_history_token: Option<String>,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Igual que `from_env`, pero leyendo de una función arbitraria.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let server_addr = lookup("SERVER_ADDR").unwrap_or_else(|| "127.0.0.1:3322".to_string());
        let frontend_dir =
            PathBuf::from(lookup("FRONTEND_DIR").unwrap_or_else(|| "frontend".to_string()));
        let open_browser = lookup("OPEN_BROWSER")
            .map(|v| !matches!(v.to_lowercase().as_str(), "0" | "false" | "no"))
            .unwrap_or(true);

        let llm_provider_str = lookup("LLM_PROVIDER").unwrap_or_else(|| "gemini".to_string());
        let llm_provider = LlmProvider::from_str(&llm_provider_str)?;

        let llm_chat_model = lookup("LLM_CHAT_MODEL")
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| llm_provider.default_chat_model().to_string());
        let llm_temperature = match lookup("LLM_TEMPERATURE") {
            Some(raw) => raw
                .parse::<f64>()
                .map_err(|_| anyhow!("LLM_TEMPERATURE no es un número válido: {raw}"))?,
            None => 0.2,
        };
        let analysis_format =
            parse_stream_format(&lookup("ANALYSIS_FORMAT").unwrap_or_else(|| "jsonl".to_string()))?;

        let detect_format = lookup("ANALYSIS_DETECT_FORMAT")
            .map(|v| !matches!(v.to_lowercase().as_str(), "0" | "false" | "no"))
            .unwrap_or(true);

        let history_path = match lookup("HISTORY_PATH") {
            Some(path) => PathBuf::from(path),
            None => dirs::data_dir()
                .ok_or_else(|| anyhow!("No se pudo determinar el directorio de datos del usuario"))?
                .join("code-explainer")
                .join("history.json"),
        };
        let remote_history_url = lookup("REMOTE_HISTORY_URL")
            .filter(|u| !u.is_empty())
            .map(|u| Url::parse(&u).map_err(|e| anyhow!("REMOTE_HISTORY_URL inválida ({u}): {e}")))
            .transpose()?;
        let remote_history_token = lookup("REMOTE_HISTORY_TOKEN").filter(|t| !t.is_empty());

        Ok(Self {
            server_addr,
            frontend_dir,
            open_browser,
            llm_provider,
            llm_chat_model,
            llm_temperature,
            analysis_format,
            detect_format,
            history_path,
            remote_history_url,
            remote_history_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<AppConfig> {
        let vars: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_vars_are_missing() {
        let cfg = config_from(&[("HISTORY_PATH", "/tmp/h.json")]).unwrap();
        assert_eq!(cfg.server_addr, "127.0.0.1:3322");
        assert_eq!(cfg.llm_provider, LlmProvider::Gemini);
        assert_eq!(cfg.llm_chat_model, "gemini-2.5-flash");
        assert_eq!(cfg.analysis_format, StreamFormat::JsonLines);
        assert!(cfg.open_browser);
        assert!(cfg.detect_format);
        assert!(cfg.remote_history_url.is_none());
    }

    #[test]
    fn explicit_values_override_defaults() {
        let cfg = config_from(&[
            ("HISTORY_PATH", "/tmp/h.json"),
            ("LLM_PROVIDER", "OpenAI"),
            ("LLM_TEMPERATURE", "0.7"),
            ("ANALYSIS_FORMAT", "markers"),
            ("OPEN_BROWSER", "false"),
            ("ANALYSIS_DETECT_FORMAT", "no"),
            ("REMOTE_HISTORY_URL", "https://blobs.example.com/u/1"),
        ])
        .unwrap();
        assert_eq!(cfg.llm_provider, LlmProvider::OpenAI);
        assert_eq!(cfg.llm_chat_model, "gpt-4o-mini");
        assert_eq!(cfg.llm_temperature, 0.7);
        assert_eq!(cfg.analysis_format, StreamFormat::Markers);
        assert!(!cfg.open_browser);
        assert!(!cfg.detect_format);
        assert!(cfg.remote_history_url.is_some());
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(config_from(&[("HISTORY_PATH", "/h"), ("LLM_PROVIDER", "ollama")]).is_err());
        assert!(config_from(&[("HISTORY_PATH", "/h"), ("LLM_TEMPERATURE", "caliente")]).is_err());
        assert!(config_from(&[("HISTORY_PATH", "/h"), ("REMOTE_HISTORY_URL", "no es url")]).is_err());
        assert!(config_from(&[("HISTORY_PATH", "/h"), ("ANALYSIS_FORMAT", "xml")]).is_err());
    }
}

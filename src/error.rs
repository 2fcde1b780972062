//! Errores tipados en las fronteras de los componentes.

use thiserror::Error;

/// Categoría de un fallo de la API de generación.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    InvalidCredential,
    MalformedResponse,
    Network,
}

/// Fallo devuelto por el cliente de generación. La clasificación se hace una
/// sola vez, en `llm.rs`; el resto del sistema sólo ve esta enumeración.
#[derive(Debug, Clone, Error)]
pub enum GenerationError {
    #[error("No hay ninguna clave de API configurada")]
    MissingCredential,
    #[error("Clave de API no válida: {0}")]
    InvalidCredential(String),
    #[error("Respuesta del modelo con formato inesperado: {0}")]
    MalformedResponse(String),
    #[error("Error de comunicación con el modelo: {0}")]
    Network(String),
}

impl GenerationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingCredential => ErrorKind::Configuration,
            Self::InvalidCredential(_) => ErrorKind::InvalidCredential,
            Self::MalformedResponse(_) => ErrorKind::MalformedResponse,
            Self::Network(_) => ErrorKind::Network,
        }
    }

    /// Mensaje pensado para mostrarse al usuario en el panel de explicaciones.
    pub fn user_message(&self) -> String {
        match self {
            Self::MissingCredential => {
                "No hay ninguna clave de API configurada. Introduce una clave para continuar.".to_string()
            }
            Self::InvalidCredential(_) => {
                "La clave de API no es válida. Revísala e inténtalo de nuevo.".to_string()
            }
            Self::MalformedResponse(_) => {
                "El modelo devolvió una respuesta con un formato inesperado. Inténtalo de nuevo.".to_string()
            }
            Self::Network(_) => {
                "No se pudo comunicar con el servicio de IA. Comprueba tu conexión e inténtalo de nuevo."
                    .to_string()
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Demasiados ficheros: al menos {found} (máximo {limit})")]
    TooManyFiles { found: usize, limit: usize },
    #[error("La ruta no es un directorio: {0}")]
    NotADirectory(String),
    #[error("No se encontró ningún fichero de texto")]
    Empty,
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("Error de E/S en el historial: {0}")]
    Io(#[from] std::io::Error),
    #[error("Historial con JSON inválido: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Error en el almacén remoto: {0}")]
    Remote(String),
}

impl From<reqwest::Error> for HistoryError {
    fn from(err: reqwest::Error) -> Self {
        HistoryError::Remote(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_has_a_distinct_user_message() {
        let errors = [
            GenerationError::MissingCredential,
            GenerationError::InvalidCredential("x".into()),
            GenerationError::MalformedResponse("x".into()),
            GenerationError::Network("x".into()),
        ];
        let mut messages: Vec<_> = errors.iter().map(|e| e.user_message()).collect();
        messages.dedup();
        assert_eq!(messages.len(), errors.len());
        assert_eq!(errors[0].kind(), ErrorKind::Configuration);
        assert_eq!(errors[3].kind(), ErrorKind::Network);
    }
}

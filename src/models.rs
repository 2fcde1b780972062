//! Modelos de dominio: árbol de ficheros del proyecto, bloques de explicación
//! y estado de procesamiento por fichero.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Nodo del árbol de un proyecto subido.
///
/// Un nodo es un fichero si y sólo si `content` tiene valor. Un nodo con
/// hijos es siempre un directorio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileNode {
    pub name: String,
    /// Ruta relativa a la raíz, separada por `/`. Única dentro del árbol.
    pub path: String,
    pub content: Option<String>,
    #[serde(default)]
    pub children: Vec<FileNode>,
}

impl FileNode {
    pub fn file(name: impl Into<String>, path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            content: Some(content.into()),
            children: Vec::new(),
        }
    }

    pub fn directory(name: impl Into<String>, path: impl Into<String>, children: Vec<FileNode>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            content: None,
            children,
        }
    }

    pub fn is_file(&self) -> bool {
        self.content.is_some() && self.children.is_empty()
    }

    /// Devuelve los ficheros del árbol en orden de recorrido en profundidad.
    pub fn files(&self) -> Vec<&FileNode> {
        let mut out = Vec::new();
        self.collect_files(&mut out);
        out
    }

    fn collect_files<'a>(&'a self, out: &mut Vec<&'a FileNode>) {
        if self.is_file() {
            out.push(self);
        }
        for child in &self.children {
            child.collect_files(out);
        }
    }

    /// Busca un fichero por su ruta.
    pub fn find_file(&self, path: &str) -> Option<&FileNode> {
        self.files().into_iter().find(|f| f.path == path)
    }
}

/// Un par (código, explicación) producido por el modelo para un fichero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExplanationBlock {
    pub code_block: String,
    pub explanation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deep_dive_explanation: Option<String>,
}

impl ExplanationBlock {
    pub fn new(code_block: impl Into<String>, explanation: impl Into<String>) -> Self {
        Self {
            code_block: code_block.into(),
            explanation: explanation.into(),
            deep_dive_explanation: None,
        }
    }
}

/// Registro de una línea en el formato JSON-Lines que pedimos al modelo.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExplanationRecord {
    /// Fragmento de código copiado literalmente del fichero original.
    pub code_block: String,
    /// Explicación en markdown del fragmento.
    pub explanation: String,
}

impl From<ExplanationRecord> for ExplanationBlock {
    fn from(record: ExplanationRecord) -> Self {
        ExplanationBlock::new(record.code_block, record.explanation)
    }
}

/// Lista ordenada de bloques de un único fichero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Explanation {
    pub blocks: Vec<ExplanationBlock>,
    /// `true` cuando el stream que la alimentaba ha terminado.
    #[serde(default)]
    pub complete: bool,
}

/// Máquina de estados por fichero: `Idle -> Processing -> Done`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    #[default]
    Idle,
    Processing,
    Done,
}

/// Marca de "deep dive" en curso. Sólo puede haber uno en todo el sistema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeepDiveState {
    pub file: String,
    pub block_index: usize,
    pub is_loading: bool,
}

/// Entrada del historial de análisis, tal como se persiste en JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub project_name: String,
    pub file_tree: FileNode,
    #[serde(default)]
    pub explanations_cache: HashMap<String, Explanation>,
    #[serde(default)]
    pub file_summaries: HashMap<String, String>,
    #[serde(default)]
    pub project_summary: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> FileNode {
        FileNode::directory(
            "demo",
            "",
            vec![
                FileNode::directory(
                    "src",
                    "src",
                    vec![FileNode::file("main.rs", "src/main.rs", "fn main() {}")],
                ),
                FileNode::file("README.md", "README.md", "# demo"),
            ],
        )
    }

    #[test]
    fn files_are_listed_depth_first() {
        let tree = sample_tree();
        let paths: Vec<_> = tree.files().iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["src/main.rs", "README.md"]);
    }

    #[test]
    fn directories_are_not_files_even_with_content() {
        let mut dir = FileNode::directory("src", "src", vec![FileNode::file("a", "src/a", "x")]);
        dir.content = Some(String::new());
        assert!(!dir.is_file());
        assert!(dir.find_file("src").is_none());
        assert!(dir.find_file("src/a").is_some());
    }

    #[test]
    fn history_entry_uses_camel_case_keys() {
        let entry = HistoryEntry {
            id: "1".into(),
            timestamp: Utc::now(),
            project_name: "demo".into(),
            file_tree: sample_tree(),
            explanations_cache: HashMap::new(),
            file_summaries: HashMap::new(),
            project_summary: None,
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert!(value.get("projectName").is_some());
        assert!(value.get("fileTree").is_some());
        assert!(value.get("explanationsCache").is_some());
    }
}

//! Estado de la sesión: explicaciones por fichero, estados de procesamiento,
//! caché de duplicados, deep dive en curso y resúmenes.
//!
//! Todo el estado mutable compartido vive aquí, detrás de un único mutex, y
//! se inyecta en el orquestador. `reset` lo devuelve al estado inicial.
//!
//! Cada `reset`/`restore` abre una nueva generación. Las escrituras que llegan
//! de tareas asíncronas llevan la generación en la que empezaron y se
//! descartan si ya no es la actual.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use crate::cache::ExplanationCache;
use crate::models::{DeepDiveState, Explanation, ExplanationBlock, FileNode, HistoryEntry, ProcessingStatus};
use crate::projector::{self, LineProjection};
use crate::stream_parser::SegmentEvent;

/// Motivo por el que no se puede iniciar un deep dive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeepDiveRejection {
    Busy(DeepDiveState),
    NoSuchBlock,
}

struct CachedProjection {
    source: String,
    code_blocks: Vec<String>,
    projection: LineProjection,
}

#[derive(Default)]
struct SessionData {
    explanations: HashMap<String, Explanation>,
    statuses: HashMap<String, ProcessingStatus>,
    cache: ExplanationCache,
    deep_dive: Option<DeepDiveState>,
    file_summaries: HashMap<String, String>,
    project_summary: Option<String>,
    projections: HashMap<String, CachedProjection>,
    generation: u64,
}

impl SessionData {
    fn apply_event(&mut self, path: &str, event: SegmentEvent) {
        let SessionData { explanations, cache, .. } = self;
        let explanation = explanations.entry(path.to_string()).or_default();
        match event {
            SegmentEvent::Completed(mut block) => {
                if !block.code_block.trim().is_empty() {
                    block.explanation = cache.reconcile(&block.code_block, &block.explanation);
                }
                explanation.blocks.push(block);
            }
            SegmentEvent::Opened { code_block } => {
                explanation.blocks.push(ExplanationBlock::new(code_block, ""));
            }
            SegmentEvent::Delta(text) => match explanation.blocks.last_mut() {
                Some(block) => block.explanation.push_str(&text),
                None => debug!("Delta sin bloque abierto en {}; se ignora", path),
            },
            SegmentEvent::Closed => {
                if let Some(block) = explanation.blocks.last_mut() {
                    let trimmed = block.explanation.trim_end().to_string();
                    block.explanation = if block.code_block.trim().is_empty() {
                        trimmed
                    } else {
                        cache.reconcile(&block.code_block, &trimmed)
                    };
                }
            }
        }
    }
}

#[derive(Default)]
pub struct SessionStore {
    data: Mutex<SessionData>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn data(&self) -> MutexGuard<'_, SessionData> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Guarda del estado sólo si `generation` sigue siendo la actual.
    fn current(&self, generation: u64) -> Option<MutexGuard<'_, SessionData>> {
        let data = self.data();
        if data.generation == generation {
            Some(data)
        } else {
            debug!("Escritura de la generación {} descartada (actual {})", generation, data.generation);
            None
        }
    }

    pub fn generation(&self) -> u64 {
        self.data().generation
    }

    /// Vacía toda la sesión (cierre de sesión o nuevo proyecto).
    pub fn reset(&self) {
        let mut data = self.data();
        let generation = data.generation + 1;
        *data = SessionData { generation, ..SessionData::default() };
    }

    pub fn status(&self, path: &str) -> ProcessingStatus {
        self.data().statuses.get(path).copied().unwrap_or_default()
    }

    pub fn statuses(&self) -> HashMap<String, ProcessingStatus> {
        self.data().statuses.clone()
    }

    /// `Idle -> Processing` con una explicación vacía. Devuelve la generación
    /// del análisis, o `None` si el fichero ya está en proceso o terminado.
    pub fn try_begin_analysis(&self, path: &str) -> Option<u64> {
        let mut data = self.data();
        if data.statuses.get(path).copied().unwrap_or_default() != ProcessingStatus::Idle {
            return None;
        }
        data.statuses.insert(path.to_string(), ProcessingStatus::Processing);
        data.explanations.insert(path.to_string(), Explanation::default());
        Some(data.generation)
    }

    /// Aplica un evento del segmentador a la explicación del fichero.
    /// Devuelve `false` si la sesión ya no es la del análisis.
    pub fn apply_event(&self, generation: u64, path: &str, event: SegmentEvent) -> bool {
        match self.current(generation) {
            Some(mut data) => {
                data.apply_event(path, event);
                true
            }
            None => false,
        }
    }

    /// Sustituye la explicación por un único bloque con el error.
    pub fn fail_analysis(&self, generation: u64, path: &str, message: &str) {
        let Some(mut data) = self.current(generation) else {
            return;
        };
        data.explanations.insert(
            path.to_string(),
            Explanation {
                blocks: vec![ExplanationBlock::new("", format!("**Error:** {message}"))],
                complete: true,
            },
        );
    }

    /// `Processing -> Done`. Se llama siempre, haya ido bien o mal.
    pub fn finish_analysis(&self, generation: u64, path: &str) {
        let Some(mut data) = self.current(generation) else {
            return;
        };
        data.statuses.insert(path.to_string(), ProcessingStatus::Done);
        data.explanations.entry(path.to_string()).or_default().complete = true;
    }

    pub fn explanation(&self, path: &str) -> Option<Explanation> {
        self.data().explanations.get(path).cloned()
    }

    /// Proyección línea -> bloque. Sólo se recalcula si cambia el fuente o la
    /// lista de bloques de código; el texto de las explicaciones no cuenta.
    pub fn projection(&self, path: &str, source: &str) -> Option<LineProjection> {
        let mut data = self.data();
        let code_blocks: Vec<String> = data
            .explanations
            .get(path)?
            .blocks
            .iter()
            .map(|b| b.code_block.clone())
            .collect();

        if let Some(cached) = data.projections.get(path) {
            if cached.source == source && cached.code_blocks == code_blocks {
                return Some(cached.projection.clone());
            }
        }

        let blocks = &data.explanations.get(path)?.blocks;
        let projection = projector::project(source, blocks);
        data.projections.insert(
            path.to_string(),
            CachedProjection {
                source: source.to_string(),
                code_blocks,
                projection: projection.clone(),
            },
        );
        Some(projection)
    }

    // ---------------------------------------------------------------------
    // DEEP DIVE
    // ---------------------------------------------------------------------

    pub fn deep_dive(&self) -> Option<DeepDiveState> {
        self.data().deep_dive.clone()
    }

    pub fn begin_deep_dive(&self, path: &str, block_index: usize) -> Result<u64, DeepDiveRejection> {
        let mut data = self.data();
        if let Some(current) = data.deep_dive.as_ref().filter(|d| d.is_loading) {
            return Err(DeepDiveRejection::Busy(current.clone()));
        }
        let block = data
            .explanations
            .get_mut(path)
            .and_then(|e| e.blocks.get_mut(block_index))
            .ok_or(DeepDiveRejection::NoSuchBlock)?;
        block.deep_dive_explanation = Some(String::new());
        data.deep_dive = Some(DeepDiveState {
            file: path.to_string(),
            block_index,
            is_loading: true,
        });
        Ok(data.generation)
    }

    pub fn append_deep_dive(&self, generation: u64, path: &str, block_index: usize, text: &str) -> bool {
        let Some(mut data) = self.current(generation) else {
            return false;
        };
        let target = data
            .explanations
            .get_mut(path)
            .and_then(|e| e.blocks.get_mut(block_index));
        match target {
            Some(block) => block
                .deep_dive_explanation
                .get_or_insert_with(String::new)
                .push_str(text),
            None => debug!("Deep dive sobre un bloque inexistente ({}#{})", path, block_index),
        }
        true
    }

    pub fn end_deep_dive(&self, generation: u64) {
        if let Some(mut data) = self.current(generation) {
            if let Some(state) = data.deep_dive.as_mut() {
                state.is_loading = false;
            }
        }
    }

    // ---------------------------------------------------------------------
    // RESÚMENES E HISTORIAL
    // ---------------------------------------------------------------------

    pub fn set_file_summary(&self, generation: u64, path: &str, summary: String) {
        if let Some(mut data) = self.current(generation) {
            data.file_summaries.insert(path.to_string(), summary);
        }
    }

    pub fn file_summaries(&self) -> HashMap<String, String> {
        self.data().file_summaries.clone()
    }

    pub fn set_project_summary(&self, generation: u64, summary: String) {
        if let Some(mut data) = self.current(generation) {
            data.project_summary = Some(summary);
        }
    }

    pub fn project_summary(&self) -> Option<String> {
        self.data().project_summary.clone()
    }

    pub fn cached_explanations(&self) -> usize {
        self.data().cache.len()
    }

    /// Instantánea de la sesión como entrada de historial.
    pub fn to_history_entry(&self, tree: &FileNode) -> HistoryEntry {
        let data = self.data();
        HistoryEntry {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            project_name: tree.name.clone(),
            file_tree: tree.clone(),
            explanations_cache: data.explanations.clone(),
            file_summaries: data.file_summaries.clone(),
            project_summary: data.project_summary.clone(),
        }
    }

    /// Sustituye la sesión por el contenido de una entrada de historial.
    pub fn restore(&self, entry: &HistoryEntry) {
        let mut data = self.data();
        let generation = data.generation + 1;
        *data = SessionData { generation, ..SessionData::default() };
        for (path, explanation) in &entry.explanations_cache {
            for block in &explanation.blocks {
                if !block.code_block.trim().is_empty() {
                    data.cache.reconcile(&block.code_block, &block.explanation);
                }
            }
            data.statuses.insert(path.clone(), ProcessingStatus::Done);
            data.explanations.insert(path.clone(), explanation.clone());
        }
        data.file_summaries = entry.file_summaries.clone();
        data.project_summary = entry.project_summary.clone();
    }
}

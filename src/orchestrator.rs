//! Orquestación de análisis por fichero, deep dives, resúmenes y la cola de
//! "analizar todo".
//!
//! La cola procesa un fichero cada vez, en orden FIFO, para que nunca haya
//! más de una llamada de generación saliente lanzada por la cola.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::GenerationError;
use crate::llm::{GenerationRequest, TextGenerator};
use crate::models::{FileNode, ProcessingStatus};
use crate::prompts;
use crate::session::{DeepDiveRejection, SessionStore};
use crate::stream_parser::{Segmenter, StreamFormat};

/// Parámetros comunes a todas las peticiones de análisis.
#[derive(Debug, Clone)]
pub struct AnalysisSettings {
    pub model: String,
    pub temperature: f64,
    /// Formato pedido al modelo; también se usa si la autodetección no decide.
    pub format: StreamFormat,
    /// Si es `false` se confía en `format` sin mirar la respuesta.
    pub detect_format: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AnalyzeOutcome {
    Completed { blocks: usize },
    Failed { message: String },
    /// Ya estaba en proceso o terminado.
    AlreadyHandled,
    /// La sesión se reinició durante el análisis; el resultado se descarta.
    Superseded,
    NotAFile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeepDiveOutcome {
    Completed,
    Failed { message: String },
    Busy { file: String, block_index: usize },
    NoSuchBlock,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<FileNode>,
    draining: bool,
}

pub struct Orchestrator {
    session: Arc<SessionStore>,
    generator: Arc<dyn TextGenerator>,
    settings: AnalysisSettings,
    queue: Mutex<QueueState>,
}

impl Orchestrator {
    pub fn new(session: Arc<SessionStore>, generator: Arc<dyn TextGenerator>, settings: AnalysisSettings) -> Self {
        Self {
            session,
            generator,
            settings,
            queue: Mutex::new(QueueState::default()),
        }
    }

    fn queue(&self) -> MutexGuard<'_, QueueState> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn request(&self, system_instruction: &str, prompt: String) -> GenerationRequest {
        GenerationRequest {
            model: self.settings.model.clone(),
            prompt,
            system_instruction: system_instruction.to_string(),
            temperature: self.settings.temperature,
        }
    }

    pub fn queued_paths(&self) -> Vec<String> {
        self.queue().pending.iter().map(|f| f.path.clone()).collect()
    }

    /// Vacía la cola pendiente. Se llama antes de reiniciar o restaurar la
    /// sesión; el fichero en curso termina, pero sus escrituras se descartan.
    pub fn cancel_pending(&self) -> usize {
        let mut queue = self.queue();
        let dropped = queue.pending.len();
        queue.pending.clear();
        if dropped > 0 {
            info!("Cola de análisis vaciada ({} ficheros descartados)", dropped);
        }
        dropped
    }

    /// Analiza un fichero completo en streaming.
    ///
    /// Sólo devuelve `Err` por falta de credencial, antes de tocar el estado
    /// del fichero. Cualquier otro fallo acaba en un bloque de error y el
    /// fichero pasa igualmente a `Done`.
    pub async fn analyze(&self, file: &FileNode) -> Result<AnalyzeOutcome, GenerationError> {
        if !file.is_file() {
            return Ok(AnalyzeOutcome::NotAFile);
        }
        self.generator.ensure_configured()?;
        let Some(generation) = self.session.try_begin_analysis(&file.path) else {
            return Ok(AnalyzeOutcome::AlreadyHandled);
        };

        info!("Analizando {}...", file.path);
        let outcome = match self.stream_analysis(generation, file).await {
            Ok(None) => {
                info!("Análisis de {} descartado: la sesión cambió", file.path);
                return Ok(AnalyzeOutcome::Superseded);
            }
            Ok(Some(blocks)) => {
                info!("Análisis de {} completado con {} bloques", file.path, blocks);
                AnalyzeOutcome::Completed { blocks }
            }
            Err(e) => {
                error!("Error analizando {}: {}", file.path, e);
                let message = e.user_message();
                self.session.fail_analysis(generation, &file.path, &message);
                AnalyzeOutcome::Failed { message }
            }
        };
        self.session.finish_analysis(generation, &file.path);
        Ok(outcome)
    }

    /// Devuelve `None` si la sesión se reinició a mitad del stream.
    async fn stream_analysis(&self, generation: u64, file: &FileNode) -> Result<Option<usize>, GenerationError> {
        let request = self.request(
            prompts::ANALYSIS_SYSTEM_PROMPT,
            prompts::analysis_prompt(file, self.settings.format),
        );
        let mut stream = self.generator.generate_stream(&request).await?;
        let mut segmenter = if self.settings.detect_format {
            Segmenter::auto(self.settings.format)
        } else {
            Segmenter::new(self.settings.format)
        };

        while let Some(fragment) = stream.next().await {
            for event in segmenter.push(&fragment?) {
                if !self.session.apply_event(generation, &file.path, event) {
                    return Ok(None);
                }
            }
        }
        for event in segmenter.finish() {
            if !self.session.apply_event(generation, &file.path, event) {
                return Ok(None);
            }
        }
        debug!("Formato de respuesta para {}: {:?}", file.path, segmenter.format());

        Ok(Some(
            self.session
                .explanation(&file.path)
                .map(|e| e.blocks.len())
                .unwrap_or(0),
        ))
    }

    /// Explicación en profundidad de un bloque. Independiente del estado del
    /// fichero, pero sólo puede haber uno en curso en todo el sistema.
    pub async fn deep_dive(&self, file: &FileNode, block_index: usize) -> Result<DeepDiveOutcome, GenerationError> {
        self.generator.ensure_configured()?;
        let (generation, block) = match self.session.begin_deep_dive(&file.path, block_index) {
            Ok(generation) => (
                generation,
                self.session
                    .explanation(&file.path)
                    .and_then(|e| e.blocks.get(block_index).cloned()),
            ),
            Err(DeepDiveRejection::Busy(current)) => {
                return Ok(DeepDiveOutcome::Busy {
                    file: current.file,
                    block_index: current.block_index,
                })
            }
            Err(DeepDiveRejection::NoSuchBlock) => return Ok(DeepDiveOutcome::NoSuchBlock),
        };
        let Some(block) = block else {
            self.session.end_deep_dive(generation);
            return Ok(DeepDiveOutcome::NoSuchBlock);
        };

        let request = self.request(prompts::DEEP_DIVE_SYSTEM_PROMPT, prompts::deep_dive_prompt(file, &block));
        let result = async {
            let mut stream = self.generator.generate_stream(&request).await?;
            while let Some(fragment) = stream.next().await {
                if !self.session.append_deep_dive(generation, &file.path, block_index, &fragment?) {
                    break;
                }
            }
            Ok::<(), GenerationError>(())
        }
        .await;

        let outcome = match result {
            Ok(()) => DeepDiveOutcome::Completed,
            Err(e) => {
                error!("Error en el deep dive de {}#{}: {}", file.path, block_index, e);
                let message = e.user_message();
                self.session.append_deep_dive(
                    generation,
                    &file.path,
                    block_index,
                    &format!("\n\n**Error:** {message}"),
                );
                DeepDiveOutcome::Failed { message }
            }
        };
        self.session.end_deep_dive(generation);
        Ok(outcome)
    }

    /// Encola los ficheros aún no analizados y, si no hay otra cola en marcha,
    /// los procesa uno a uno en orden de llegada.
    pub async fn process_all(&self, files: &[FileNode]) -> Result<(), GenerationError> {
        self.generator.ensure_configured()?;
        {
            let mut queue = self.queue();
            for file in files.iter().filter(|f| f.is_file()) {
                let idle = self.session.status(&file.path) == ProcessingStatus::Idle;
                let queued = queue.pending.iter().any(|q| q.path == file.path);
                if idle && !queued {
                    queue.pending.push_back(file.clone());
                }
            }
            info!("Cola de análisis: {} ficheros pendientes", queue.pending.len());
            if queue.draining {
                return Ok(());
            }
            queue.draining = true;
        }
        self.drain().await
    }

    async fn drain(&self) -> Result<(), GenerationError> {
        loop {
            let next = {
                let mut queue = self.queue();
                match queue.pending.pop_front() {
                    Some(file) => file,
                    None => {
                        queue.draining = false;
                        return Ok(());
                    }
                }
            };
            if let Err(e) = self.analyze(&next).await {
                warn!("Cola detenida: {}", e);
                let mut queue = self.queue();
                queue.pending.clear();
                queue.draining = false;
                return Err(e);
            }
        }
    }

    /// Resumen breve de un fichero (llamada sin streaming).
    pub async fn summarize_file(&self, file: &FileNode) -> Result<String, GenerationError> {
        let generation = self.session.generation();
        let request = self.request(prompts::SUMMARY_SYSTEM_PROMPT, prompts::file_summary_prompt(file));
        let summary = self.generator.generate(&request).await?;
        let summary = summary.trim().to_string();
        self.session.set_file_summary(generation, &file.path, summary.clone());
        Ok(summary)
    }

    /// Visión general del proyecto a partir de los resúmenes disponibles.
    pub async fn summarize_project(&self, tree: &FileNode) -> Result<String, GenerationError> {
        let generation = self.session.generation();
        let mut summaries: Vec<(String, String)> = self.session.file_summaries().into_iter().collect();
        summaries.sort();
        let request = self.request(
            prompts::SUMMARY_SYSTEM_PROMPT,
            prompts::project_summary_prompt(tree, &summaries),
        );
        let summary = self.generator.generate(&request).await?.trim().to_string();
        self.session.set_project_summary(generation, summary.clone());
        Ok(summary)
    }
}

//! Proyección de bloques de explicación sobre líneas del fichero fuente.
//!
//! Sirve al resaltado sincronizado: línea -> bloque desde el panel de código y
//! bloque -> líneas desde el panel de explicaciones.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;

use serde::Serialize;
use tracing::debug;

use crate::matcher::{self, MatchStrategy};
use crate::models::ExplanationBlock;

/// Resultado de localizar un bloque. `Unlocatable` no es un error: la
/// explicación se sigue mostrando, sólo que sin resaltado.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockSpan {
    Located {
        start_line: usize,
        end_line: usize,
        offset: usize,
        strategy: MatchStrategy,
    },
    Unlocatable,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LineProjection {
    /// Línea (base 1) -> índice del bloque que la cubre.
    pub line_to_block: BTreeMap<usize, usize>,
    /// Un elemento por bloque, en el mismo orden.
    pub spans: Vec<BlockSpan>,
}

impl LineProjection {
    pub fn block_at_line(&self, line: usize) -> Option<usize> {
        self.line_to_block.get(&line).copied()
    }

    pub fn block_lines(&self, block_index: usize) -> Option<RangeInclusive<usize>> {
        match self.spans.get(block_index)? {
            BlockSpan::Located { start_line, end_line, .. } => Some(*start_line..=*end_line),
            BlockSpan::Unlocatable => None,
        }
    }

    pub fn unlocatable(&self) -> Vec<usize> {
        self.spans
            .iter()
            .enumerate()
            .filter(|(_, span)| matches!(span, BlockSpan::Unlocatable))
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Rangos de líneas no vacías que ningún bloque explica.
    pub fn gaps(&self, source: &str) -> Vec<RangeInclusive<usize>> {
        let mut gaps = Vec::new();
        let mut current: Option<(usize, usize)> = None;
        for (idx, line) in source.lines().enumerate() {
            let number = idx + 1;
            let uncovered = !line.trim().is_empty() && !self.line_to_block.contains_key(&number);
            match (uncovered, current) {
                (true, Some((start, _))) => current = Some((start, number)),
                (true, None) => current = Some((number, number)),
                (false, Some((start, end))) => {
                    if !line.trim().is_empty() {
                        gaps.push(start..=end);
                        current = None;
                    }
                }
                (false, None) => {}
            }
        }
        if let Some((start, end)) = current {
            gaps.push(start..=end);
        }
        gaps
    }
}

/// Recalcula la proyección completa. El cursor sólo avanza con los bloques
/// localizados; un bloque no localizado no lo mueve.
pub fn project(source: &str, blocks: &[ExplanationBlock]) -> LineProjection {
    let mut projection = LineProjection::default();
    let mut cursor = 0;

    for (index, block) in blocks.iter().enumerate() {
        match matcher::locate(source, &block.code_block, cursor) {
            Some(found) => {
                let start_line = source[..found.offset].matches('\n').count() + 1;
                let end_line = start_line + found.matched_text.matches('\n').count();
                for line in start_line..=end_line {
                    projection.line_to_block.insert(line, index);
                }
                projection.spans.push(BlockSpan::Located {
                    start_line,
                    end_line,
                    offset: found.offset,
                    strategy: found.strategy,
                });
                cursor = found.end();
            }
            None => {
                debug!("Bloque {} no localizado en el fuente; se omite del resaltado", index);
                projection.spans.push(BlockSpan::Unlocatable);
            }
        }
    }

    projection
}

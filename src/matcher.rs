//! Localización de un fragmento de código devuelto por el modelo dentro del
//! fichero original, tolerando diferencias de formato.
//!
//! Estrategias, por orden de precedencia (gana la primera que acierta):
//!   1. Subcadena exacta.
//!   2. Misma búsqueda tras convertir `\n` en `\r\n` si el fuente usa CRLF.
//!   3. Ventana de 1 a 5 líneas comparada sin tener en cuenta los espacios.

use serde::Serialize;

/// Tamaño máximo (en líneas) de la ventana de la búsqueda tolerante.
pub const MAX_WINDOW_LINES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    Exact,
    LineEndings,
    Whitespace,
}

/// Posición encontrada. `matched_text` es siempre el texto del *fuente*,
/// no el del candidato, para que las cuentas de longitud sean exactas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMatch {
    pub offset: usize,
    pub matched_text: String,
    pub strategy: MatchStrategy,
}

impl BlockMatch {
    /// Offset justo detrás del texto encontrado.
    pub fn end(&self) -> usize {
        self.offset + self.matched_text.len()
    }
}

/// Recorta y colapsa cualquier secuencia de espacios en blanco a un único espacio.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Busca `candidate` en `source` a partir del offset `search_from` (en bytes).
/// Devuelve `None` si ninguna estrategia lo localiza.
pub fn locate(source: &str, candidate: &str, search_from: usize) -> Option<BlockMatch> {
    if candidate.trim().is_empty() {
        return None;
    }
    let start = align_to_char_boundary(source, search_from)?;
    let haystack = &source[start..];

    if let Some(pos) = haystack.find(candidate) {
        return Some(BlockMatch {
            offset: start + pos,
            matched_text: candidate.to_string(),
            strategy: MatchStrategy::Exact,
        });
    }

    if source.contains("\r\n") && candidate.contains('\n') && !candidate.contains("\r\n") {
        let crlf = candidate.replace('\n', "\r\n");
        if let Some(pos) = haystack.find(&crlf) {
            let offset = start + pos;
            return Some(BlockMatch {
                offset,
                matched_text: source[offset..offset + crlf.len()].to_string(),
                strategy: MatchStrategy::LineEndings,
            });
        }
    }

    window_scan(source, start, &normalize_whitespace(candidate))
}

fn window_scan(source: &str, start: usize, normalized_candidate: &str) -> Option<BlockMatch> {
    // (inicio, fin sin el salto de línea) de cada línea desde `start`
    let mut lines = Vec::new();
    let mut line_start = start;
    for (idx, byte) in source[start..].bytes().enumerate() {
        if byte == b'\n' {
            lines.push((line_start, start + idx));
            line_start = start + idx + 1;
        }
    }
    if line_start < source.len() {
        lines.push((line_start, source.len()));
    }

    for first in 0..lines.len() {
        for size in 1..=MAX_WINDOW_LINES {
            let Some(&(_, window_end)) = lines.get(first + size - 1) else {
                break;
            };
            let window_start = lines[first].0;
            let text = &source[window_start..window_end];
            if normalize_whitespace(text) == normalized_candidate {
                return Some(BlockMatch {
                    offset: window_start,
                    matched_text: text.to_string(),
                    strategy: MatchStrategy::Whitespace,
                });
            }
        }
    }
    None
}

fn align_to_char_boundary(source: &str, mut offset: usize) -> Option<usize> {
    if offset > source.len() {
        return None;
    }
    while !source.is_char_boundary(offset) {
        offset += 1;
    }
    Some(offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_returns_its_position() {
        let source = "fn a() {}\nfn b() {}\nfn c() {}\n";
        let found = locate(source, "fn b() {}", 0).unwrap();
        assert_eq!(found.offset, 10);
        assert_eq!(found.strategy, MatchStrategy::Exact);
        assert_eq!(found.end(), 19);
    }

    #[test]
    fn exact_match_respects_search_cursor() {
        let source = "x = 1\ny = 2\nx = 1\n";
        let first = locate(source, "x = 1", 0).unwrap();
        let second = locate(source, "x = 1", first.end()).unwrap();
        assert_eq!(first.offset, 0);
        assert_eq!(second.offset, 12);
    }

    #[test]
    fn crlf_source_matches_lf_candidate() {
        let source = "header\r\nlet a = 1;\r\nlet b = 2;\r\n";
        let found = locate(source, "let a = 1;\nlet b = 2;", 0).unwrap();
        assert_eq!(found.strategy, MatchStrategy::LineEndings);
        assert_eq!(found.offset, 8);
        assert_eq!(found.matched_text, "let a = 1;\r\nlet b = 2;");
    }

    #[test]
    fn reflowed_whitespace_matches_a_line_window() {
        let source = "def f(x):\n    return   x + 1\n\nprint(f(2))\n";
        let found = locate(source, "def f(x): return x + 1", 0).unwrap();
        assert_eq!(found.strategy, MatchStrategy::Whitespace);
        assert_eq!(found.offset, 0);
        assert_eq!(found.matched_text, "def f(x):\n    return   x + 1");
    }

    #[test]
    fn window_is_limited_to_five_lines() {
        let source = "a\nb\nc\nd\ne\nf\n";
        assert!(locate(source, "a b c d e", 0).is_some());
        assert!(locate(source, "a b c d e f", 0).is_none());
    }

    #[test]
    fn missing_and_blank_candidates_are_not_found() {
        let source = "let x = 1;\n";
        assert!(locate(source, "let y = 2;", 0).is_none());
        assert!(locate(source, "   \n", 0).is_none());
        assert!(locate(source, "let x = 1;", 100).is_none());
    }

    #[test]
    fn cursor_inside_multibyte_char_is_moved_forward() {
        let source = "ñandú\nlet x = 1;";
        let found = locate(source, "let x = 1;", 1).unwrap();
        assert_eq!(&source[found.offset..found.end()], "let x = 1;");
    }
}

//! Segmentación incremental de la respuesta en streaming del modelo.
//!
//! Los fragmentos llegan con límites arbitrarios (pueden partir una línea,
//! un token o un marcador). Se soportan dos formatos de cable:
//!   - JSON-Lines: un objeto `{"code_block", "explanation"}` por línea.
//!   - Marcadores: `---CODE---` / `---EXPLANATION---` en orden repetido.

use tracing::{debug, warn};

use crate::models::{ExplanationBlock, ExplanationRecord};

pub const CODE_MARKER: &str = "---CODE---";
pub const EXPLANATION_MARKER: &str = "---EXPLANATION---";

/// Bytes que se acumulan como máximo antes de rendirse en la autodetección.
const DETECTION_LIMIT: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFormat {
    JsonLines,
    Markers,
}

/// Evento producido a partir del stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentEvent {
    /// Registro JSON-Lines completo.
    Completed(ExplanationBlock),
    /// Formato de marcadores: el código del bloque ya está cerrado.
    Opened { code_block: String },
    /// Texto que se añade a la explicación del bloque abierto.
    Delta(String),
    /// El bloque abierto ha terminado.
    Closed,
}

// ---------------------------------------------------------------------
// JSON-LINES
// ---------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct JsonLinesParser {
    buffer: String,
}

impl JsonLinesParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fragment: &str) -> Vec<SegmentEvent> {
        self.buffer.push_str(fragment);
        let Some(last_newline) = self.buffer.rfind('\n') else {
            return Vec::new();
        };
        let tail = self.buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, tail);
        complete.lines().filter_map(parse_record_line).collect()
    }

    /// Intenta aprovechar una última línea sin `\n` final.
    pub fn finish(&mut self) -> Vec<SegmentEvent> {
        let rest = std::mem::take(&mut self.buffer);
        parse_record_line(&rest).into_iter().collect()
    }
}

fn parse_record_line(line: &str) -> Option<SegmentEvent> {
    let line = line.trim();
    if line.is_empty() || line.starts_with("```") {
        return None;
    }
    match serde_json::from_str::<ExplanationRecord>(line) {
        Ok(record) => Some(SegmentEvent::Completed(record.into())),
        Err(e) => {
            warn!("Línea JSON descartada ({}): {}", e, truncate_for_log(line));
            None
        }
    }
}

fn truncate_for_log(text: &str) -> &str {
    match text.char_indices().nth(120) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// ---------------------------------------------------------------------
// MARCADORES
// ---------------------------------------------------------------------

/// Estado del segmentador por marcadores. Se pasa por valor a cada paso.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerState {
    /// Buscando `---CODE---`. `pending` guarda un posible marcador a medias.
    SeekingCode { pending: String },
    /// Acumulando código hasta `---EXPLANATION---`.
    SeekingExplanation { code: String },
    /// Emitiendo explicación hasta el siguiente `---CODE---`.
    /// `held_back` es la cola que aún podría ser el inicio de un marcador.
    StreamingExplanation { held_back: String, started: bool },
}

impl Default for MarkerState {
    fn default() -> Self {
        MarkerState::SeekingCode { pending: String::new() }
    }
}

/// Procesa un fragmento y devuelve el nuevo estado junto con los eventos.
pub fn marker_step(state: MarkerState, fragment: &str) -> (MarkerState, Vec<SegmentEvent>) {
    let mut events = Vec::new();
    let mut state = state;
    let mut input = fragment.to_string();

    loop {
        let (next, rest) = match state {
            MarkerState::SeekingCode { pending } => {
                let buf = pending + &input;
                match buf.find(CODE_MARKER) {
                    Some(pos) => (
                        MarkerState::SeekingExplanation { code: String::new() },
                        Some(buf[pos + CODE_MARKER.len()..].to_string()),
                    ),
                    None => {
                        let keep = marker_prefix_suffix_len(&buf, CODE_MARKER);
                        let pending = buf[buf.len() - keep..].to_string();
                        (MarkerState::SeekingCode { pending }, None)
                    }
                }
            }
            MarkerState::SeekingExplanation { code } => {
                let buf = code + &input;
                match buf.find(EXPLANATION_MARKER) {
                    Some(pos) => {
                        events.push(SegmentEvent::Opened {
                            code_block: strip_marker_newlines(&buf[..pos]),
                        });
                        (
                            MarkerState::StreamingExplanation { held_back: String::new(), started: false },
                            Some(buf[pos + EXPLANATION_MARKER.len()..].to_string()),
                        )
                    }
                    None => (MarkerState::SeekingExplanation { code: buf }, None),
                }
            }
            MarkerState::StreamingExplanation { held_back, started } => {
                let buf = held_back + &input;
                match buf.find(CODE_MARKER) {
                    Some(pos) => {
                        emit_delta(&mut events, &buf[..pos], started);
                        events.push(SegmentEvent::Closed);
                        (
                            MarkerState::SeekingExplanation { code: String::new() },
                            Some(buf[pos + CODE_MARKER.len()..].to_string()),
                        )
                    }
                    None => {
                        let keep = marker_prefix_suffix_len(&buf, CODE_MARKER);
                        let split = buf.len() - keep;
                        let started = emit_delta(&mut events, &buf[..split], started);
                        let held_back = buf[split..].to_string();
                        (MarkerState::StreamingExplanation { held_back, started }, None)
                    }
                }
            }
        };
        state = next;
        match rest {
            Some(rest) => input = rest,
            None => return (state, events),
        }
    }
}

/// Vacía lo que quede pendiente al terminar el stream.
pub fn marker_finish(state: MarkerState) -> Vec<SegmentEvent> {
    let mut events = Vec::new();
    match state {
        MarkerState::SeekingCode { .. } => {}
        MarkerState::SeekingExplanation { code } => {
            let code_block = strip_marker_newlines(&code);
            if !code_block.trim().is_empty() {
                events.push(SegmentEvent::Opened { code_block });
                events.push(SegmentEvent::Closed);
            }
        }
        MarkerState::StreamingExplanation { held_back, started } => {
            emit_delta(&mut events, &held_back, started);
            events.push(SegmentEvent::Closed);
        }
    }
    events
}

/// Emite `text` como delta. Antes de que empiece la explicación se descartan
/// los espacios iniciales. Devuelve si la explicación ya ha empezado.
fn emit_delta(events: &mut Vec<SegmentEvent>, text: &str, started: bool) -> bool {
    let text = if started { text } else { text.trim_start() };
    if text.is_empty() {
        return started;
    }
    events.push(SegmentEvent::Delta(text.to_string()));
    true
}

/// Longitud del sufijo más largo de `buf` que es prefijo propio de `marker`.
fn marker_prefix_suffix_len(buf: &str, marker: &str) -> usize {
    let max = (marker.len() - 1).min(buf.len());
    (1..=max)
        .rev()
        .find(|&k| {
            let start = buf.len() - k;
            buf.is_char_boundary(start) && marker.starts_with(&buf[start..])
        })
        .unwrap_or(0)
}

/// Quita un único salto de línea pegado a cada marcador.
fn strip_marker_newlines(code: &str) -> String {
    let code = code
        .strip_prefix("\r\n")
        .or_else(|| code.strip_prefix('\n'))
        .unwrap_or(code);
    let code = code
        .strip_suffix("\r\n")
        .or_else(|| code.strip_suffix('\n'))
        .unwrap_or(code);
    code.to_string()
}

#[derive(Debug, Default)]
pub struct MarkerParser {
    state: MarkerState,
}

impl MarkerParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fragment: &str) -> Vec<SegmentEvent> {
        let (next, events) = marker_step(std::mem::take(&mut self.state), fragment);
        self.state = next;
        events
    }

    pub fn finish(&mut self) -> Vec<SegmentEvent> {
        marker_finish(std::mem::take(&mut self.state))
    }
}

// ---------------------------------------------------------------------
// SEGMENTADOR CON AUTODETECCIÓN
// ---------------------------------------------------------------------

#[derive(Debug)]
enum Inner {
    Detecting { buffer: String, fallback: StreamFormat },
    Json(JsonLinesParser),
    Markers(MarkerParser),
}

/// Punto de entrada para el orquestador: decide el formato a partir del
/// primer texto significativo y delega en el parser correspondiente.
#[derive(Debug)]
pub struct Segmenter {
    inner: Inner,
}

impl Segmenter {
    pub fn new(format: StreamFormat) -> Self {
        Self { inner: Self::parser_for(format) }
    }

    pub fn auto(fallback: StreamFormat) -> Self {
        Self {
            inner: Inner::Detecting { buffer: String::new(), fallback },
        }
    }

    fn parser_for(format: StreamFormat) -> Inner {
        match format {
            StreamFormat::JsonLines => Inner::Json(JsonLinesParser::new()),
            StreamFormat::Markers => Inner::Markers(MarkerParser::new()),
        }
    }

    pub fn format(&self) -> Option<StreamFormat> {
        match self.inner {
            Inner::Detecting { .. } => None,
            Inner::Json(_) => Some(StreamFormat::JsonLines),
            Inner::Markers(_) => Some(StreamFormat::Markers),
        }
    }

    pub fn push(&mut self, fragment: &str) -> Vec<SegmentEvent> {
        match &mut self.inner {
            Inner::Json(parser) => parser.push(fragment),
            Inner::Markers(parser) => parser.push(fragment),
            Inner::Detecting { buffer, fallback } => {
                buffer.push_str(fragment);
                let Some(format) = detect_format(buffer, *fallback) else {
                    return Vec::new();
                };
                let buffered = std::mem::take(buffer);
                debug!("Formato de stream detectado: {:?}", format);
                self.inner = Self::parser_for(format);
                self.push(&buffered)
            }
        }
    }

    pub fn finish(&mut self) -> Vec<SegmentEvent> {
        if let Inner::Detecting { buffer, fallback } = &mut self.inner {
            let buffered = std::mem::take(buffer);
            let format = detect_format(&buffered, *fallback).unwrap_or(*fallback);
            self.inner = Self::parser_for(format);
            let mut events = self.push(&buffered);
            events.extend(self.finish());
            return events;
        }
        match &mut self.inner {
            Inner::Json(parser) => parser.finish(),
            Inner::Markers(parser) => parser.finish(),
            Inner::Detecting { .. } => Vec::new(),
        }
    }
}

fn detect_format(buffer: &str, fallback: StreamFormat) -> Option<StreamFormat> {
    if buffer.contains(CODE_MARKER) {
        return Some(StreamFormat::Markers);
    }
    let first_line_is_json = buffer
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with("```"))
        .map(|l| l.starts_with('{'))
        .unwrap_or(false);
    if first_line_is_json {
        return Some(StreamFormat::JsonLines);
    }
    if buffer.len() >= DETECTION_LIMIT {
        return Some(fallback);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fold_events(blocks: &mut Vec<ExplanationBlock>, events: impl IntoIterator<Item = SegmentEvent>) {
        for event in events {
            match event {
                SegmentEvent::Completed(block) => blocks.push(block),
                SegmentEvent::Opened { code_block } => blocks.push(ExplanationBlock::new(code_block, "")),
                SegmentEvent::Delta(text) => {
                    if let Some(last) = blocks.last_mut() {
                        last.explanation.push_str(&text);
                    }
                }
                SegmentEvent::Closed => {
                    if let Some(last) = blocks.last_mut() {
                        let trimmed = last.explanation.trim_end().len();
                        last.explanation.truncate(trimmed);
                    }
                }
            }
        }
    }

    fn run(segmenter: &mut Segmenter, fragments: &[&str]) -> Vec<ExplanationBlock> {
        let mut blocks = Vec::new();
        for fragment in fragments {
            fold_events(&mut blocks, segmenter.push(fragment));
        }
        fold_events(&mut blocks, segmenter.finish());
        blocks
    }

    #[test]
    fn json_lines_split_mid_record() {
        let mut parser = JsonLinesParser::new();
        let fragments = [
            "{\"code_b",
            "lock\":\"a\",\"explanation\":\"b\"}\n{\"code_block\":\"c\",\"exp",
            "lanation\":\"d\"}\n",
        ];
        let mut completed = Vec::new();
        for fragment in fragments {
            completed.extend(parser.push(fragment));
        }
        completed.extend(parser.finish());
        assert_eq!(
            completed,
            vec![
                SegmentEvent::Completed(ExplanationBlock::new("a", "b")),
                SegmentEvent::Completed(ExplanationBlock::new("c", "d")),
            ]
        );
    }

    #[test]
    fn json_lines_any_split_yields_same_records() {
        let text = "{\"code_block\":\"x = 1\",\"explanation\":\"uno\"}\n\
                    no es json\n\
                    {\"code_block\":\"y = ñ\",\"explanation\":\"dos\"}\n\
                    {\"code_block\":\"z\",\"explanation\":\"tres\"}\n";
        let chars: Vec<(usize, char)> = text.char_indices().collect();
        for step in [1usize, 2, 3, 7, 13, 40] {
            let mut parser = JsonLinesParser::new();
            let mut count = 0;
            let mut i = 0;
            while i < chars.len() {
                let start = chars[i].0;
                let end = chars.get(i + step).map(|c| c.0).unwrap_or(text.len());
                count += parser.push(&text[start..end]).len();
                i += step;
            }
            count += parser.finish().len();
            assert_eq!(count, 3, "troceado de {} caracteres", step);
        }
    }

    #[test]
    fn json_lines_discards_invalid_and_incomplete_records() {
        let mut parser = JsonLinesParser::new();
        let events = parser.push("```json\n{\"code_block\":\"a\"}\nhola\n");
        assert!(events.is_empty());
        assert!(parser.push("{\"code_block\":\"a\",\"explanation\":\"b\"}").is_empty());
        assert_eq!(parser.finish().len(), 1);
        assert!(parser.finish().is_empty());
    }

    #[test]
    fn marker_format_single_block() {
        let mut segmenter = Segmenter::new(StreamFormat::Markers);
        let blocks = run(&mut segmenter, &["---CODE---\nfoo\n---EXPLANATION---\nbar"]);
        assert_eq!(blocks, vec![ExplanationBlock::new("foo", "bar")]);
    }

    #[test]
    fn marker_split_across_fragments_matches_unsplit() {
        let mut segmenter = Segmenter::new(StreamFormat::Markers);
        let blocks = run(&mut segmenter, &["---COD", "E---\nfoo\n---EXPLANATION---\nbar"]);
        assert_eq!(blocks, vec![ExplanationBlock::new("foo", "bar")]);
    }

    #[test]
    fn next_code_marker_split_does_not_leak_into_explanation() {
        let mut segmenter = Segmenter::new(StreamFormat::Markers);
        let blocks = run(
            &mut segmenter,
            &[
                "---CODE---\nfn a() {}\n---EXPLANATION---\nPrimera ",
                "función.\n---C",
                "ODE---\nfn b() {}\n---EXPLA",
                "NATION---\nSegunda.\n",
            ],
        );
        assert_eq!(
            blocks,
            vec![
                ExplanationBlock::new("fn a() {}", "Primera función."),
                ExplanationBlock::new("fn b() {}", "Segunda."),
            ]
        );
    }

    #[test]
    fn held_back_tail_is_only_a_marker_prefix() {
        let state = MarkerState::StreamingExplanation { held_back: String::new(), started: true };
        let (state, events) = marker_step(state, "texto --");
        assert_eq!(events, vec![SegmentEvent::Delta("texto ".into())]);
        assert_eq!(
            state,
            MarkerState::StreamingExplanation { held_back: "--".into(), started: true }
        );
        let (state, events) = marker_step(state, "x");
        assert_eq!(events, vec![SegmentEvent::Delta("--x".into())]);
        assert_eq!(
            state,
            MarkerState::StreamingExplanation { held_back: String::new(), started: true }
        );
    }

    #[test]
    fn explanation_grows_incrementally() {
        let mut parser = MarkerParser::new();
        let events = parser.push("---CODE---\nx\n---EXPLANATION---\nHola");
        assert_eq!(
            events,
            vec![
                SegmentEvent::Opened { code_block: "x".into() },
                SegmentEvent::Delta("Hola".into()),
            ]
        );
        assert_eq!(parser.push(" mundo"), vec![SegmentEvent::Delta(" mundo".into())]);
        assert_eq!(parser.finish(), vec![SegmentEvent::Closed]);
    }

    #[test]
    fn code_without_explanation_is_flushed_at_end() {
        let mut parser = MarkerParser::new();
        assert!(parser.push("preámbulo\n---CODE---\nlet x = 1;\n").is_empty());
        assert_eq!(
            parser.finish(),
            vec![
                SegmentEvent::Opened { code_block: "let x = 1;".into() },
                SegmentEvent::Closed,
            ]
        );
    }

    #[test]
    fn code_keeps_indentation_and_inner_newlines() {
        let mut segmenter = Segmenter::new(StreamFormat::Markers);
        let blocks = run(
            &mut segmenter,
            &["---CODE---\r\n    if x {\n        y();\n    }\n\n---EXPLANATION---\nok"],
        );
        assert_eq!(blocks[0].code_block, "    if x {\n        y();\n    }\n");
    }

    #[test]
    fn auto_detects_both_formats() {
        let mut json = Segmenter::auto(StreamFormat::Markers);
        let blocks = run(&mut json, &["  {\"code_block\":\"a\",", "\"explanation\":\"b\"}\n"]);
        assert_eq!(json.format(), Some(StreamFormat::JsonLines));
        assert_eq!(blocks, vec![ExplanationBlock::new("a", "b")]);

        let mut markers = Segmenter::auto(StreamFormat::JsonLines);
        let blocks = run(&mut markers, &["---CO", "DE---\na\n---EXPLANATION---\nb"]);
        assert_eq!(markers.format(), Some(StreamFormat::Markers));
        assert_eq!(blocks, vec![ExplanationBlock::new("a", "b")]);
    }

    #[test]
    fn auto_falls_back_when_stream_ends_undetected() {
        let mut segmenter = Segmenter::auto(StreamFormat::JsonLines);
        let blocks = run(&mut segmenter, &["{\"code_block\":\"a\",\"explanation\":\"b\"}"]);
        assert_eq!(blocks, vec![ExplanationBlock::new("a", "b")]);
    }
}

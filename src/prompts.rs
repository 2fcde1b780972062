//! Instrucciones de sistema y plantillas de prompt para cada llamada al modelo.

use schemars::schema_for;

use crate::models::{ExplanationBlock, ExplanationRecord, FileNode};
use crate::stream_parser::{StreamFormat, CODE_MARKER, EXPLANATION_MARKER};

pub const ANALYSIS_SYSTEM_PROMPT: &str = r#"
Eres un ingeniero de software senior que explica código a otros desarrolladores.
Recorres el fichero de arriba abajo, dividiéndolo en bloques lógicos (imports, funciones,
tipos, bloques de configuración...). Para cada bloque copias el código EXACTAMENTE como
aparece en el fichero, sin reformatear, y escribes una explicación clara en markdown.
No omitas partes relevantes del fichero y no inventes código que no exista.
"#;

pub const DEEP_DIVE_SYSTEM_PROMPT: &str = r#"
Eres un ingeniero de software senior. Te piden una explicación en profundidad de un único
fragmento de código dentro de su fichero. Explica el flujo de control, los casos límite,
las decisiones de diseño y los posibles problemas. Responde en markdown.
"#;

pub const SUMMARY_SYSTEM_PROMPT: &str = r#"
Eres un ingeniero de software senior. Resumes código de forma breve y precisa, en markdown,
para alguien que va a leerlo por primera vez.
"#;

/// Prompt de análisis de un fichero en el formato de cable pedido.
pub fn analysis_prompt(file: &FileNode, format: StreamFormat) -> String {
    let content = file.content.as_deref().unwrap_or_default();
    let instructions = match format {
        StreamFormat::JsonLines => {
            let schema = schema_for!(ExplanationRecord);
            let schema = serde_json::to_string(&schema).unwrap_or_default();
            format!(
                "Responde ÚNICAMENTE con líneas JSON (JSON-Lines): un objeto por línea, sin \
                 texto adicional ni bloques ```. Cada línea debe cumplir este esquema:\n{schema}"
            )
        }
        StreamFormat::Markers => format!(
            "Para cada bloque escribe una línea con {CODE_MARKER}, después el código literal, \
             después una línea con {EXPLANATION_MARKER} y después la explicación. No uses \
             otro formato."
        ),
    };

    format!(
        "{instructions}\n\nFichero: {path}\n\n{content}",
        path = file.path
    )
}

pub fn deep_dive_prompt(file: &FileNode, block: &ExplanationBlock) -> String {
    format!(
        "Fichero: {path}\n\nContenido completo:\n{content}\n\nFragmento a analizar en \
         profundidad:\n{code}\n\nExplicación breve ya mostrada al usuario:\n{explanation}",
        path = file.path,
        content = file.content.as_deref().unwrap_or_default(),
        code = block.code_block,
        explanation = block.explanation,
    )
}

pub fn file_summary_prompt(file: &FileNode) -> String {
    format!(
        "Resume en dos o tres frases qué hace este fichero.\n\nFichero: {path}\n\n{content}",
        path = file.path,
        content = file.content.as_deref().unwrap_or_default(),
    )
}

/// `summaries` contiene (ruta, resumen) de los ficheros ya resumidos.
pub fn project_summary_prompt(tree: &FileNode, summaries: &[(String, String)]) -> String {
    let listing: Vec<String> = tree
        .files()
        .iter()
        .map(|f| match summaries.iter().find(|(path, _)| path == &f.path) {
            Some((_, summary)) => format!("- {}: {}", f.path, summary),
            None => format!("- {}", f.path),
        })
        .collect();
    format!(
        "Describe la arquitectura y el propósito del proyecto \"{name}\" a partir de sus \
         ficheros:\n{files}",
        name = tree.name,
        files = listing.join("\n"),
    )
}

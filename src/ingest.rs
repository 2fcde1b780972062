//! Ingesta de proyectos: desde un directorio local o desde texto pegado con
//! varios ficheros. En ambos casos se construye un árbol de `FileNode`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use mime_guess::MimeGuess;
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

use crate::error::IngestError;
use crate::models::FileNode;

/// Número máximo de ficheros por proyecto. Superarlo rechaza la ingesta entera.
pub const MAX_FILES: usize = 25;

const IGNORED_DIRS: [&str; 8] = [
    ".git",
    "node_modules",
    "target",
    "dist",
    "build",
    "__pycache__",
    ".venv",
    ".idea",
];

/// Extensiones de código que `mime_guess` confunde con formatos binarios
/// (`.ts` se registra como vídeo MPEG-TS).
const SOURCE_EXTENSIONS: [&str; 4] = ["ts", "mts", "cts", "tsx"];

/// Recorre recursivamente un directorio y devuelve el árbol de sus ficheros
/// de texto. El recorrido se corta en cuanto se supera `MAX_FILES`.
pub fn ingest_directory(root: &Path) -> Result<FileNode, IngestError> {
    if !root.is_dir() {
        return Err(IngestError::NotADirectory(root.display().to_string()));
    }

    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_ignored_dir(e));

    for entry in walker.filter_map(|e| e.ok()).filter(|e| e.file_type().is_file()) {
        let path = entry.path();
        if !looks_like_text(path) {
            debug!("Saltando fichero binario: {}", path.display());
            continue;
        }
        let content = match fs::read_to_string(path) {
            Ok(content) if !content.contains('\0') => content,
            _ => {
                warn!("Saltando fichero no-texto o no-UTF8: {}", path.display());
                continue;
            }
        };
        if files.len() == MAX_FILES {
            return Err(IngestError::TooManyFiles {
                found: MAX_FILES + 1,
                limit: MAX_FILES,
            });
        }
        let relative = path
            .strip_prefix(root)
            .unwrap_or(path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join("/");
        files.push((relative, content));
    }

    let name = root
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| root.display().to_string());
    let tree = build_tree(&name, files)?;
    info!("Directorio {} ingerido: {} ficheros", root.display(), tree.files().len());
    Ok(tree)
}

fn is_ignored_dir(entry: &DirEntry) -> bool {
    if !entry.file_type().is_dir() {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    let name: &str = &name;
    (name.starts_with('.') && name != ".") || IGNORED_DIRS.contains(&name)
}

fn looks_like_text(path: &Path) -> bool {
    let source_extension = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| SOURCE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
    if source_extension {
        return true;
    }
    match MimeGuess::from_path(path).first() {
        Some(mime) => {
            let binary_type = matches!(mime.type_().as_str(), "image" | "audio" | "video" | "font");
            let binary_subtype = matches!(
                mime.subtype().as_str(),
                "pdf" | "zip" | "gzip" | "octet-stream" | "x-tar" | "wasm" | "x-7z-compressed"
            );
            !binary_type && !binary_subtype
        }
        None => true,
    }
}

/// Interpreta texto pegado con varios ficheros. Formatos admitidos:
///   - `------ ruta/fichero.ext ------` seguido del contenido.
///   - `### \`fichero.ext\`` seguido de un bloque de código (formato antiguo).
///
/// Un texto sin cabeceras se trata como un único fichero `snippet.txt`.
pub fn parse_pasted_project(project_name: &str, text: &str) -> Result<FileNode, IngestError> {
    let mut files: Vec<(String, String)> = Vec::new();
    let mut current: Option<(String, Vec<&str>)> = None;

    for line in text.lines() {
        if let Some(path) = header_path(line) {
            if let Some((path, body)) = current.take() {
                files.push((path, strip_code_fence(&body.join("\n"))));
            }
            current = Some((path, Vec::new()));
        } else if let Some((_, body)) = current.as_mut() {
            body.push(line);
        }
    }
    if let Some((path, body)) = current.take() {
        files.push((path, strip_code_fence(&body.join("\n"))));
    }

    if files.is_empty() {
        if text.trim().is_empty() {
            return Err(IngestError::Empty);
        }
        files.push(("snippet.txt".to_string(), text.to_string()));
    }
    build_tree(project_name, files)
}

fn header_path(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if let Some(inner) = trimmed
        .strip_prefix("------ ")
        .and_then(|rest| rest.strip_suffix(" ------"))
    {
        let path = inner.trim();
        return (!path.is_empty()).then(|| normalize_path(path));
    }
    if let Some(inner) = trimmed
        .strip_prefix("### `")
        .and_then(|rest| rest.strip_suffix('`'))
    {
        let path = inner.trim();
        return (!path.is_empty()).then(|| normalize_path(path));
    }
    None
}

fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Quita un único bloque ``` que envuelva todo el contenido. Sin bloque sólo
/// se quitan las líneas en blanco de los extremos; la sangría se conserva.
fn strip_code_fence(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.starts_with("```") && trimmed.ends_with("```") && trimmed.len() >= 6 {
        if let Some(first_newline) = trimmed.find('\n') {
            let inner = &trimmed[first_newline + 1..trimmed.len() - 3];
            return inner.strip_suffix('\n').unwrap_or(inner).to_string();
        }
    }
    let lines: Vec<&str> = body.lines().collect();
    let Some(first) = lines.iter().position(|l| !l.trim().is_empty()) else {
        return String::new();
    };
    let last = lines.iter().rposition(|l| !l.trim().is_empty()).unwrap_or(first);
    lines[first..=last].join("\n")
}

/// Construye el árbol a partir de (ruta relativa, contenido). Aplica el
/// límite de ficheros antes de construir nada.
pub fn build_tree(project_name: &str, files: Vec<(String, String)>) -> Result<FileNode, IngestError> {
    let unique: BTreeMap<String, String> = files.into_iter().collect();
    if unique.len() > MAX_FILES {
        return Err(IngestError::TooManyFiles {
            found: unique.len(),
            limit: MAX_FILES,
        });
    }
    if unique.is_empty() {
        return Err(IngestError::Empty);
    }

    let mut root = FileNode::directory(project_name, "", Vec::new());
    for (path, content) in unique {
        insert_file(&mut root, &path, content);
    }
    sort_tree(&mut root);
    Ok(root)
}

fn insert_file(root: &mut FileNode, path: &str, content: String) {
    let parts: Vec<&str> = path.split('/').collect();
    let mut node = root;
    for depth in 0..parts.len() - 1 {
        let dir_path = parts[..=depth].join("/");
        let position = node
            .children
            .iter()
            .position(|c| c.path == dir_path && !c.is_file());
        let index = match position {
            Some(index) => index,
            None => {
                node.children
                    .push(FileNode::directory(parts[depth], dir_path, Vec::new()));
                node.children.len() - 1
            }
        };
        node = &mut node.children[index];
    }
    let name = parts.last().copied().unwrap_or(path);
    node.children.push(FileNode::file(name, path, content));
}

/// Directorios primero y después por nombre, como en un explorador.
fn sort_tree(node: &mut FileNode) {
    node.children.sort_by(|a, b| {
        let a_is_dir = !a.is_file();
        let b_is_dir = !b.is_file();
        b_is_dir.cmp(&a_is_dir).then_with(|| a.name.cmp(&b.name))
    });
    for child in &mut node.children {
        sort_tree(child);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pasted_project_with_dash_headers() {
        let text = "------ src/main.rs ------\n```rust\nfn main() {\n    hola();\n}\n```\n\
                    ------ README.md ------\n# Demo\n";
        let tree = parse_pasted_project("demo", text).unwrap();
        let main = tree.find_file("src/main.rs").unwrap();
        assert_eq!(main.content.as_deref(), Some("fn main() {\n    hola();\n}"));
        assert_eq!(tree.find_file("README.md").unwrap().content.as_deref(), Some("# Demo"));
        assert_eq!(tree.children[0].name, "src");
    }

    #[test]
    fn pasted_project_with_legacy_headers() {
        let text = "### `app.py`\n```python\nprint('hola')\n```\n### `lib/util.py`\n```\nx = 1\n```\n";
        let tree = parse_pasted_project("demo", text).unwrap();
        assert_eq!(tree.find_file("app.py").unwrap().content.as_deref(), Some("print('hola')"));
        assert_eq!(tree.find_file("lib/util.py").unwrap().content.as_deref(), Some("x = 1"));
    }

    #[test]
    fn text_without_headers_becomes_a_snippet() {
        let tree = parse_pasted_project("demo", "let x = 1;").unwrap();
        assert_eq!(tree.files().len(), 1);
        assert_eq!(tree.files()[0].path, "snippet.txt");
        assert!(matches!(parse_pasted_project("demo", "   \n"), Err(IngestError::Empty)));
    }

    #[test]
    fn twenty_six_files_are_rejected_as_a_whole() {
        let files: Vec<(String, String)> =
            (0..26).map(|i| (format!("f{i}.txt"), format!("{i}"))).collect();
        match build_tree("demo", files) {
            Err(IngestError::TooManyFiles { found, limit }) => {
                assert_eq!(found, 26);
                assert_eq!(limit, MAX_FILES);
            }
            other => panic!("se esperaba TooManyFiles, obtenido {:?}", other),
        }

        let files: Vec<(String, String)> =
            (0..25).map(|i| (format!("f{i}.txt"), format!("{i}"))).collect();
        assert_eq!(build_tree("demo", files).unwrap().files().len(), 25);
    }

    #[test]
    fn tree_nests_directories_and_sorts_dirs_first() {
        let tree = build_tree(
            "demo",
            vec![
                ("b.txt".into(), "b".into()),
                ("src/z.rs".into(), "z".into()),
                ("src/inner/a.rs".into(), "a".into()),
                ("a.txt".into(), "a".into()),
            ],
        )
        .unwrap();
        let names: Vec<_> = tree.children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["src", "a.txt", "b.txt"]);
        let src = &tree.children[0];
        assert_eq!(src.children[0].path, "src/inner");
        assert_eq!(src.children[0].children[0].path, "src/inner/a.rs");
    }

    #[test]
    fn directory_ingestion_skips_binaries_and_ignored_dirs() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        fs::write(dir.path().join("src/main.rs"), "fn main() {}\n").unwrap();
        fs::write(dir.path().join("node_modules/pkg/index.js"), "x").unwrap();
        fs::write(dir.path().join("logo.png"), [0u8, 1, 2, 3]).unwrap();
        fs::write(dir.path().join("data.bin"), [0u8, 159, 146, 150]).unwrap();

        let tree = ingest_directory(dir.path()).unwrap();
        let paths: Vec<_> = tree.files().iter().map(|f| f.path.clone()).collect();
        assert_eq!(paths, vec!["src/main.rs".to_string()]);
    }

    #[test]
    fn directory_over_the_limit_imports_nothing() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..26 {
            fs::write(dir.path().join(format!("f{i}.txt")), "x").unwrap();
        }
        assert!(matches!(
            ingest_directory(dir.path()),
            Err(IngestError::TooManyFiles { found: 26, .. })
        ));
        assert!(matches!(
            ingest_directory(&dir.path().join("f0.txt")),
            Err(IngestError::NotADirectory(_))
        ));
    }

    #[test]
    fn large_directory_stops_at_the_first_file_over_the_limit() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..40 {
            fs::write(dir.path().join(format!("f{i}.txt")), "x").unwrap();
        }
        match ingest_directory(dir.path()) {
            Err(IngestError::TooManyFiles { found, limit }) => {
                assert_eq!(found, MAX_FILES + 1);
                assert_eq!(limit, MAX_FILES);
            }
            other => panic!("se esperaba TooManyFiles, obtenido {:?}", other),
        }
    }

    #[test]
    fn empty_path_is_not_a_directory() {
        assert!(matches!(
            ingest_directory(Path::new("")),
            Err(IngestError::NotADirectory(_))
        ));
    }

    #[test]
    fn typescript_sources_are_ingested() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("app.ts"), "const x: number = 1;\n").unwrap();
        fs::write(dir.path().join("view.tsx"), "export const V = () => <div />;\n").unwrap();
        fs::write(dir.path().join("main.rs"), "fn main() {}\n").unwrap();

        let tree = ingest_directory(dir.path()).unwrap();
        let paths: Vec<_> = tree.files().iter().map(|f| f.path.clone()).collect();
        assert_eq!(paths, vec!["app.ts", "main.rs", "view.tsx"]);
        assert_eq!(
            tree.find_file("app.ts").unwrap().content.as_deref(),
            Some("const x: number = 1;\n")
        );
    }

    #[test]
    fn unfenced_pasted_files_keep_leading_indentation() {
        let text = "------ a.py ------\n\n    indented()\n  \n------ b.py ------\n\tx = 1\n  y = 2\n";
        let tree = parse_pasted_project("demo", text).unwrap();
        assert_eq!(tree.find_file("a.py").unwrap().content.as_deref(), Some("    indented()"));
        assert_eq!(tree.find_file("b.py").unwrap().content.as_deref(), Some("\tx = 1\n  y = 2"));
    }
}

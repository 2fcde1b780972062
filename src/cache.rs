//! Caché de explicaciones direccionada por contenido.
//!
//! La clave es una huella barata del bloque de código normalizado, de modo que
//! el mismo fragmento en dos ficheros distintos recibe la misma explicación.
//! No es criptográfica: una colisión sólo reutiliza una explicación.

use std::collections::HashMap;

use tracing::debug;

use crate::matcher::normalize_whitespace;

/// Huella de un bloque de código normalizado, en base 36.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockHash(String);

impl BlockHash {
    pub fn of(code_block: &str) -> Self {
        let normalized = normalize_whitespace(code_block);
        let mut hash: i32 = 0;
        for ch in normalized.chars() {
            hash = hash.wrapping_shl(5).wrapping_sub(hash).wrapping_add(ch as i32);
        }
        BlockHash(to_radix36(hash))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn to_radix36(value: i32) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let negative = value < 0;
    let mut n = (value as i64).unsigned_abs();
    if n == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while n > 0 {
        digits.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    if negative {
        digits.push(b'-');
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

/// Mapa `BlockHash -> explicación`. Sólo crece durante la sesión.
#[derive(Debug, Default)]
pub struct ExplanationCache {
    entries: HashMap<BlockHash, String>,
}

impl ExplanationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, hash: &BlockHash) -> Option<&str> {
        self.entries.get(hash).map(String::as_str)
    }

    pub fn record(&mut self, hash: BlockHash, explanation: impl Into<String>) {
        self.entries.insert(hash, explanation.into());
    }

    /// Devuelve la explicación que debe quedar guardada para `code_block`:
    /// la cacheada si existe; si no, registra `fresh` y la devuelve.
    pub fn reconcile(&mut self, code_block: &str, fresh: &str) -> String {
        let hash = BlockHash::of(code_block);
        if let Some(cached) = self.lookup(&hash) {
            debug!("Explicación reutilizada para el bloque {}", hash.as_str());
            return cached.to_string();
        }
        self.record(hash, fresh);
        fresh.to_string()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_ignores_whitespace_differences() {
        let a = BlockHash::of("fn main() {\n    run();\n}");
        let b = BlockHash::of("  fn main() { run(); }  ");
        assert_eq!(a, b);
        assert_ne!(a, BlockHash::of("fn main() { stop(); }"));
    }

    #[test]
    fn hash_is_deterministic_base36() {
        assert_eq!(BlockHash::of("").as_str(), "0");
        // "a" = 97 = 2*36 + 25
        assert_eq!(BlockHash::of("a").as_str(), "2p");
        let h = BlockHash::of("una cadena bastante larga para desbordar el hash");
        assert!(h.as_str().trim_start_matches('-').chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn radix_handles_extreme_values() {
        assert_eq!(to_radix36(-1), "-1");
        assert_eq!(to_radix36(i32::MIN), "-zik0zk");
        assert_eq!(to_radix36(35), "z");
    }

    #[test]
    fn second_identical_block_reuses_first_explanation() {
        let mut cache = ExplanationCache::new();
        let first = cache.reconcile("let x = 1;", "asigna uno");
        let second = cache.reconcile("let   x =\n1;", "otra explicación");
        assert_eq!(first, "asigna uno");
        assert_eq!(second, "asigna uno");
        assert_eq!(cache.len(), 1);
    }
}

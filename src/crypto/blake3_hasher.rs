use std::path::Path;

use blake3::Hasher;

pub struct Blake3Hasher;

impl Blake3Hasher {
    pub fn hash_content(content: &[u8]) -> String {
        let mut hasher = Hasher::new();
        hasher.update(content);
        hasher.finalize().to_hex().to_string()
    }

    /// Stable physical table name for a vault directory.
    pub fn table_name(directory: &Path) -> String {
        let digest = Self::hash_content(directory.to_string_lossy().as_bytes());
        format!("vault_{}", &digest[..16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_content_consistency() {
        let content = b"Hello, World!";
        let hash1 = Blake3Hasher::hash_content(content);
        let hash2 = Blake3Hasher::hash_content(content);
        assert_eq!(hash1, hash2);
    }

    #[test]
    fn test_hash_content_different_inputs() {
        let hash1 = Blake3Hasher::hash_content(b"Hello");
        let hash2 = Blake3Hasher::hash_content(b"World");
        assert_ne!(hash1, hash2);
    }

    #[test]
    fn test_hash_content_empty() {
        let hash = Blake3Hasher::hash_content(b"");
        assert_eq!(hash.len(), 64); // 32-byte digest, hex encoded
    }

    #[test]
    fn test_table_name_is_stable_and_sql_safe() {
        let a = Blake3Hasher::table_name(Path::new("/home/me/notes"));
        let b = Blake3Hasher::table_name(Path::new("/home/me/notes"));
        let c = Blake3Hasher::table_name(Path::new("/home/me/other"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_'));
    }
}

// src/store/fingerprint.rs

use sha2::{Digest, Sha256};

/// Dedup key: SHA-256 over `message|file|line`, hex encoded
pub fn fingerprint(message: &str, file: &str, line: u32) -> String {
    let digest = Sha256::digest(format!("{message}|{file}|{line}").as_bytes());
    format!("{digest:x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_stable_hex() {
        let a = fingerprint("boom", "/app/a.php", 10);
        assert_eq!(a, fingerprint("boom", "/app/a.php", 10));
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_each_component_matters() {
        let base = fingerprint("boom", "/app/a.php", 10);
        assert_ne!(base, fingerprint("boom!", "/app/a.php", 10));
        assert_ne!(base, fingerprint("boom", "/app/b.php", 10));
        assert_ne!(base, fingerprint("boom", "/app/a.php", 11));
    }
}

//! Content fingerprinting used for instant-upload precheck and resumable
//! state keying. Streams the file in fixed-size blocks so fingerprinting
//! a large file doesn't require holding it in memory at once.

use crate::config::HashAlgorithm;
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

const STREAM_BUFFER_SIZE: usize = 64 * 1024;

enum Hasher {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
}

impl Hasher {
    fn new(algo: HashAlgorithm) -> Self {
        match algo {
            HashAlgorithm::Md5 => Hasher::Md5(Md5::new()),
            HashAlgorithm::Sha1 => Hasher::Sha1(Sha1::new()),
            HashAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(h) => h.update(data),
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Hasher::Md5(h) => hex::encode(h.finalize()),
            Hasher::Sha1(h) => hex::encode(h.finalize()),
            Hasher::Sha256(h) => hex::encode(h.finalize()),
        }
    }
}

/// Computes a stable content fingerprint by streaming the file in
/// fixed-size blocks. Stable across runs for identical file contents.
pub async fn fingerprint_file(path: &Path, algorithm: HashAlgorithm) -> std::io::Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Hasher::new(algorithm);
    let mut buf = vec![0u8; STREAM_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize_hex())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn same_content_yields_same_fingerprint() {
        let mut f1 = tempfile::NamedTempFile::new().unwrap();
        f1.write_all(b"hello world").unwrap();
        let mut f2 = tempfile::NamedTempFile::new().unwrap();
        f2.write_all(b"hello world").unwrap();

        let fp1 = fingerprint_file(f1.path(), HashAlgorithm::Sha256).await.unwrap();
        let fp2 = fingerprint_file(f2.path(), HashAlgorithm::Sha256).await.unwrap();
        assert_eq!(fp1, fp2);
    }

    #[tokio::test]
    async fn different_content_yields_different_fingerprint() {
        let mut f1 = tempfile::NamedTempFile::new().unwrap();
        f1.write_all(b"hello world").unwrap();
        let mut f2 = tempfile::NamedTempFile::new().unwrap();
        f2.write_all(b"goodbye world").unwrap();

        let fp1 = fingerprint_file(f1.path(), HashAlgorithm::Sha256).await.unwrap();
        let fp2 = fingerprint_file(f2.path(), HashAlgorithm::Sha256).await.unwrap();
        assert_ne!(fp1, fp2);
    }
}

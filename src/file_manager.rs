//! Chunk slicing and fingerprint-derived file identity.
//!
//! Chunk descriptors are lazy: only `start`/`end`/`index`/`file_id` are
//! kept in memory, and the byte range is read from disk on demand so
//! that resident memory is bounded by `concurrency * chunk_size`, via a
//! cheap descriptor split from an on-demand reader.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, Take};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// A chunk descriptor: cheap to copy, holds no file bytes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub index: usize,
    pub start: u64,
    pub end: u64,
}

impl ChunkDescriptor {
    pub fn size(&self) -> u64 {
        self.end - self.start
    }
}

#[derive(Debug, Clone)]
pub struct FileMetadata {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    pub mime_type: Option<String>,
}

/// Default piecewise chunk-size heuristic, clamped to the configured
/// `[min_chunk_size, max_chunk_size]` range. Targets roughly 10-500
/// chunks for a file of the given size.
pub fn optimal_chunk_size(file_size: u64, min_chunk_size: u64, max_chunk_size: u64) -> u64 {
    let raw = if file_size < 10 * MIB {
        1 * MIB
    } else if file_size < 100 * MIB {
        2 * MIB
    } else if file_size < GIB {
        5 * MIB
    } else {
        (file_size / 200).clamp(10 * MIB, 50 * MIB)
    };
    raw.clamp(min_chunk_size, max_chunk_size)
}

/// Slice `file_size` bytes into contiguous, dense, gap-free chunk
/// descriptors of `chunk_size` bytes (the last one may be smaller).
pub fn create_chunks(file_size: u64, chunk_size: u64) -> Vec<ChunkDescriptor> {
    if file_size == 0 {
        return vec![ChunkDescriptor {
            index: 0,
            start: 0,
            end: 0,
        }];
    }
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::new();
    let mut start = 0u64;
    let mut index = 0usize;
    while start < file_size {
        let end = (start + chunk_size).min(file_size);
        chunks.push(ChunkDescriptor { index, start, end });
        start = end;
        index += 1;
    }
    chunks
}

/// Reads the byte range for one chunk from disk. Lazily materialized —
/// call sites should drop the returned buffer as soon as the upload of
/// that chunk is in flight.
pub async fn read_chunk_bytes(path: &Path, descriptor: ChunkDescriptor) -> std::io::Result<Vec<u8>> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(descriptor.start)).await?;
    let len = descriptor.size() as usize;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Opens a reader bounded to one chunk's byte range, for streaming the
/// chunk body straight into an HTTP request via `reqwest::Body::wrap_stream`
/// instead of materializing a `Vec<u8>` first.
pub async fn open_chunk_reader(path: &Path, descriptor: ChunkDescriptor) -> std::io::Result<Take<File>> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(descriptor.start)).await?;
    Ok(file.take(descriptor.size()))
}

/// Best-effort MIME type from a file name's extension. Returns `None`
/// for extensions outside this small table rather than guessing wrong.
pub fn guess_mime_type(name: &str) -> Option<String> {
    let ext = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "json" => "application/json",
        "txt" => "text/plain",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        _ => return None,
    };
    Some(mime.to_string())
}

/// Matches a MIME type against an `allowFileTypes`/`disallowFileTypes`
/// pattern: `*/*` matches anything, `type/*` matches by category, and an
/// unclassifiable file (`mime` is `None`) only matches the blanket `*/*`.
pub fn mime_type_matches(pattern: &str, mime: Option<&str>) -> bool {
    if pattern == "*/*" {
        return true;
    }
    let Some(mime) = mime else { return false };
    match pattern.split_once('/') {
        Some((cat, sub)) => {
            let (mime_cat, mime_sub) = mime.split_once('/').unwrap_or((mime, ""));
            (cat == "*" || cat == mime_cat) && (sub == "*" || sub == mime_sub)
        }
        None => pattern == mime,
    }
}

/// Per-upload bookkeeping between `prepare_file` and `cleanup`: resolved
/// file metadata plus the chunk plan, once known, so the pipeline doesn't
/// re-derive either after the planning phase.
struct FileRegistration {
    metadata: FileMetadata,
    chunks: Option<Vec<ChunkDescriptor>>,
}

/// Tracks the registration lifecycle `FileUpload` goes through: prepared
/// at the start of a pipeline run, its chunk plan released once dispatch
/// is done, and the whole entry dropped on completion, failure, or
/// cancellation.
#[derive(Default)]
pub struct FileRegistry {
    entries: DashMap<String, FileRegistration>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves `path`'s size and a best-effort MIME type, and registers
    /// it under `file_id` for the remainder of the upload.
    pub async fn prepare_file(&self, file_id: &str, path: &Path) -> std::io::Result<FileMetadata> {
        let metadata = tokio::fs::metadata(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload.bin".to_string());
        let mime_type = guess_mime_type(&name);
        let file = FileMetadata {
            path: path.to_path_buf(),
            name,
            size: metadata.len(),
            mime_type,
        };
        self.entries.insert(
            file_id.to_string(),
            FileRegistration {
                metadata: file.clone(),
                chunks: None,
            },
        );
        Ok(file)
    }

    pub fn set_chunks(&self, file_id: &str, chunks: Vec<ChunkDescriptor>) {
        if let Some(mut entry) = self.entries.get_mut(file_id) {
            entry.chunks = Some(chunks);
        }
    }

    /// Drops the retained chunk plan for `file_id` once every chunk task
    /// has been dispatched; the file's metadata registration is kept
    /// until `cleanup`.
    pub fn release_file_chunks(&self, file_id: &str) {
        if let Some(mut entry) = self.entries.get_mut(file_id) {
            entry.chunks = None;
        }
    }

    pub fn cleanup(&self, file_id: &str) {
        self.entries.remove(file_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_are_dense_and_sum_to_file_size() {
        let chunks = create_chunks(2_500_000, 1_000_000);
        assert_eq!(chunks.len(), 3);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i);
        }
        let total: u64 = chunks.iter().map(|c| c.size()).sum();
        assert_eq!(total, 2_500_000);
        assert_eq!(chunks.last().unwrap().size(), 500_000);
    }

    #[test]
    fn file_size_equal_to_chunk_size_yields_one_chunk() {
        let chunks = create_chunks(1_000_000, 1_000_000);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].size(), 1_000_000);
    }

    #[test]
    fn optimal_size_respects_clamp() {
        let size = optimal_chunk_size(5 * GIB, 256 * KIB, 8 * MIB);
        assert_eq!(size, 8 * MIB);
    }

    #[test]
    fn small_file_uses_one_mib_default() {
        assert_eq!(optimal_chunk_size(1 * MIB, 256 * KIB, 50 * MIB), 1 * MIB);
    }

    #[test]
    fn mime_type_guess_falls_back_to_none() {
        assert_eq!(guess_mime_type("photo.PNG").as_deref(), Some("image/png"));
        assert_eq!(guess_mime_type("archive.rar"), None);
    }

    #[test]
    fn mime_pattern_matching() {
        assert!(mime_type_matches("*/*", None));
        assert!(!mime_type_matches("image/*", None));
        assert!(mime_type_matches("image/*", Some("image/png")));
        assert!(!mime_type_matches("image/*", Some("video/mp4")));
        assert!(mime_type_matches("application/pdf", Some("application/pdf")));
    }

    #[tokio::test]
    async fn registry_tracks_prepare_release_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        tokio::fs::write(&path, b"hello").await.unwrap();

        let registry = FileRegistry::new();
        let meta = registry.prepare_file("f1", &path).await.unwrap();
        assert_eq!(meta.size, 5);

        registry.set_chunks("f1", create_chunks(5, 5));
        registry.release_file_chunks("f1");
        registry.cleanup("f1");
        assert!(registry.entries.get("f1").is_none());
    }
}

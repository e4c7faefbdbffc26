use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Error type for blob file operations
#[derive(Debug)]
pub enum BlobError {
    IoError(std::io::Error),
    PathError(String),
}

impl std::fmt::Display for BlobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlobError::IoError(e) => write!(f, "IO error: {}", e),
            BlobError::PathError(msg) => write!(f, "Path error: {}", msg),
        }
    }
}

impl std::error::Error for BlobError {}

impl From<std::io::Error> for BlobError {
    fn from(err: std::io::Error) -> Self {
        BlobError::IoError(err)
    }
}

/// Hex encoded SHA-256 of the blob contents
pub fn content_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest.iter() {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Keeps only ascii alphanumerics, falls back to jpg
fn sanitize_extension(extension: &str) -> String {
    let ext: String = extension
        .trim_start_matches('.')
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase();
    if ext.is_empty() {
        "jpg".to_string()
    } else {
        ext
    }
}

pub fn absolute_path(storage_path: &str, relative_path: &str) -> PathBuf {
    if storage_path.is_empty() {
        PathBuf::from(relative_path)
    } else {
        Path::new(storage_path).join(relative_path)
    }
}

/// Writes the blob as `<uuid>.<ext>` below the storage path
///
/// Returns (relative filename, content hash).
pub fn write_blob(
    storage_path: &str,
    image_id: &Uuid,
    extension: &str,
    bytes: &[u8],
) -> Result<(String, String), BlobError> {
    if bytes.is_empty() {
        return Err(BlobError::PathError("Refusing to store empty blob".to_string()));
    }

    let filename = format!("{}.{}", image_id, sanitize_extension(extension));
    let target = absolute_path(storage_path, &filename);

    if let Some(parent) = target.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    std::fs::write(&target, bytes)?;
    log::debug!("Blob written: {:?} ({} bytes)", target, bytes.len());

    Ok((filename, content_hash(bytes)))
}

pub fn read_blob(storage_path: &str, relative_path: &str) -> Result<Vec<u8>, BlobError> {
    Ok(std::fs::read(absolute_path(storage_path, relative_path))?)
}

/// Removes a blob file; a missing file is not an error
pub fn remove_blob(storage_path: &str, relative_path: &str) -> Result<(), BlobError> {
    match std::fs::remove_file(absolute_path(storage_path, relative_path)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BlobError::IoError(e)),
    }
}

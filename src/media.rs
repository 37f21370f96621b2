//! Media upload collaborator.
//!
//! [`MediaUploader`] is the seam the session awaits before creating a message
//! with an attachment.  [`LocalMediaStore`] is a content-addressed
//! implementation backed by a directory on disk.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::model::AttachmentKind;

#[derive(Debug)]
pub enum UploadError {
    Io(std::io::Error),
    Rejected(String),
}

impl std::fmt::Display for UploadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadError::Io(e) => write!(f, "io error: {e}"),
            UploadError::Rejected(reason) => write!(f, "upload rejected: {reason}"),
        }
    }
}

impl std::error::Error for UploadError {}

impl From<std::io::Error> for UploadError {
    fn from(e: std::io::Error) -> Self {
        UploadError::Io(e)
    }
}

/// A file picked in the composer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub name: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

impl UploadFile {
    pub fn new(name: impl Into<String>, content_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            data,
        }
    }

    /// Read a file from disk, guessing the content type from its extension.
    pub async fn from_path(path: &Path) -> Result<Self, UploadError> {
        let data = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        Ok(Self::new(name, ext_to_content_type(&ext), data))
    }

    pub fn kind(&self) -> AttachmentKind {
        if self.content_type.starts_with("image/") {
            AttachmentKind::Image
        } else {
            AttachmentKind::File
        }
    }
}

/// Uploads a file and returns a stable URL for it.
#[allow(async_fn_in_trait)]
pub trait MediaUploader {
    async fn upload(&self, file: &UploadFile) -> Result<String, UploadError>;
}

/// Stores uploads as files named by their SHA-256 content hash.
#[derive(Debug, Clone)]
pub struct LocalMediaStore {
    root: PathBuf,
}

impl LocalMediaStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Two-level prefix directories (`hash[0..2]/hash[2..4]`) keep any one
    /// directory small.
    fn media_path(&self, content_hash: &str, content_type: &str) -> PathBuf {
        let ext = content_type_to_ext(content_type);
        self.root
            .join(&content_hash[..2])
            .join(&content_hash[2..4])
            .join(format!("{content_hash}.{ext}"))
    }
}

impl MediaUploader for LocalMediaStore {
    async fn upload(&self, file: &UploadFile) -> Result<String, UploadError> {
        if file.data.is_empty() {
            return Err(UploadError::Rejected(format!("{} is empty", file.name)));
        }
        let content_hash = hex::encode(Sha256::digest(&file.data));
        let path = self.media_path(&content_hash, &file.content_type);
        if !tokio::fs::try_exists(&path).await? {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, &file.data).await?;
        }
        Ok(format!("file://{}", path.display()))
    }
}

fn content_type_to_ext(content_type: &str) -> &str {
    let base = content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim();
    match base {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/heic" => "heic",
        "application/pdf" => "pdf",
        "text/plain" => "txt",
        "application/zip" => "zip",
        _ => "bin",
    }
}

fn ext_to_content_type(ext: &str) -> &'static str {
    match ext {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

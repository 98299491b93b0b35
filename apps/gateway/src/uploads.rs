//! Multipart parsing that streams uploaded files into the upload directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use axum::extract::Multipart;
use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;
use wa_core::media::{MAX_UPLOAD_BYTES, MAX_UPLOAD_FILES, content_type_for_path, is_supported_upload};
use wa_dispatch::{Attachment, StagedUploads};

use crate::error::ApiError;

#[derive(Debug, Clone)]
pub struct UploadStore {
    dir: PathBuf,
}

impl UploadStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn ensure_dir(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await
    }

    /// `<field>-<uuid><ext>`, unique across concurrent requests.
    fn staged_path(&self, field: &str, original: &str) -> PathBuf {
        let field: String = field
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
            .collect();
        let field = if field.is_empty() { "file".to_string() } else { field };
        let ext = Path::new(original)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
            .unwrap_or_default();
        self.dir.join(format!("{field}-{}{ext}", Uuid::new_v4()))
    }
}

/// Text fields and staged files of one multipart request.
///
/// Staged files are removed when the form is dropped.
#[derive(Debug, Default)]
pub struct UploadForm {
    fields: HashMap<String, String>,
    attachments: Vec<Attachment>,
    staged: StagedUploads,
}

impl UploadForm {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    pub fn flag(&self, name: &str) -> bool {
        self.field(name)
            .is_some_and(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "on" | "yes"))
    }

    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    pub fn take_attachments(&mut self) -> Vec<Attachment> {
        std::mem::take(&mut self.attachments)
    }

    pub async fn read(store: &UploadStore, mut multipart: Multipart) -> Result<Self, ApiError> {
        let mut form = Self::default();
        while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
            let name = field.name().unwrap_or_default().to_string();
            let Some(original) = field.file_name().map(str::to_string) else {
                let text = field.text().await.map_err(multipart_error)?;
                form.fields.insert(name, text);
                continue;
            };

            if form.attachments.len() >= MAX_UPLOAD_FILES {
                return Err(ApiError::bad_request(format!(
                    "Too many files. Maximum is {MAX_UPLOAD_FILES}"
                )));
            }
            let content_type = field
                .content_type()
                .map(str::to_string)
                .unwrap_or_else(|| content_type_for_path(&original).to_string());
            if !is_supported_upload(&content_type) {
                return Err(ApiError::bad_request(format!(
                    "File type {content_type} is not supported"
                )));
            }

            let path = store.staged_path(&name, &original);
            let mut file = tokio::fs::File::create(&path)
                .await
                .map_err(|err| ApiError::internal(format!("failed to stage upload: {err}")))?;
            form.staged.track(&path);
            let mut size = 0usize;
            while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
                size += chunk.len();
                if size > MAX_UPLOAD_BYTES {
                    return Err(ApiError::PayloadTooLarge(format!(
                        "File too large. Maximum size is {}MB",
                        MAX_UPLOAD_BYTES / (1024 * 1024)
                    )));
                }
                file.write_all(&chunk)
                    .await
                    .map_err(|err| ApiError::internal(format!("failed to stage upload: {err}")))?;
            }
            file.flush()
                .await
                .map_err(|err| ApiError::internal(format!("failed to stage upload: {err}")))?;
            debug!(field = %name, file = %original, size, path = %path.display(), "upload staged");
            form.attachments
                .push(Attachment::upload(path, content_type, Some(original)));
        }
        Ok(form)
    }
}

fn multipart_error(err: MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge(err.body_text())
    } else {
        ApiError::bad_request(err.body_text())
    }
}

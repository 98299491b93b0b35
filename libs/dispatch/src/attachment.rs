use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;
use wa_core::media::content_type_for_path;
use wa_core::{MediaCapabilities, MediaPayload, classify};

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("Attachment file not found on server: {}", path.display())]
    NotFound { path: PathBuf },
    #[error("failed to read attachment {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid media url: {0}")]
    InvalidUrl(String),
    #[error("failed to download {url}: {source}")]
    Fetch {
        url: Url,
        #[source]
        source: reqwest::Error,
    },
    #[error("download of {url} answered {status}")]
    Status { url: Url, status: u16 },
    #[error("attachment is empty")]
    Empty,
}

impl AttachmentError {
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            AttachmentError::InvalidUrl(_) | AttachmentError::Empty | AttachmentError::Status { .. }
        )
    }
}

#[derive(Debug, Clone)]
pub enum AttachmentSource {
    /// A file on local disk. `staged` files were written for this request and are removed after it.
    Disk { path: PathBuf, staged: bool },
    Memory(Bytes),
    Url(Url),
}

/// A media item waiting to be materialized for a send.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub source: AttachmentSource,
    /// Declared type. Remote sources replace it with the server's `Content-Type` when present.
    pub content_type: String,
    pub filename: Option<String>,
}

impl Attachment {
    /// A file staged in the upload directory for the current request.
    pub fn upload(
        path: impl Into<PathBuf>,
        content_type: impl Into<String>,
        filename: Option<String>,
    ) -> Self {
        Self {
            source: AttachmentSource::Disk {
                path: path.into(),
                staged: true,
            },
            content_type: content_type.into(),
            filename,
        }
    }

    /// A file the gateway does not own; it is never deleted.
    pub fn local(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let content_type = content_type_for_path(&path.to_string_lossy()).to_string();
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());
        Self {
            source: AttachmentSource::Disk {
                path,
                staged: false,
            },
            content_type,
            filename,
        }
    }

    pub fn memory(
        data: impl Into<Bytes>,
        content_type: impl Into<String>,
        filename: Option<String>,
    ) -> Self {
        Self {
            source: AttachmentSource::Memory(data.into()),
            content_type: content_type.into(),
            filename,
        }
    }

    /// A remote file fetched at send time. Only http(s) URLs are accepted.
    pub fn remote(raw: &str) -> Result<Self, AttachmentError> {
        let url = Url::parse(raw.trim()).map_err(|err| AttachmentError::InvalidUrl(err.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(AttachmentError::InvalidUrl(format!(
                "unsupported scheme `{}`",
                url.scheme()
            )));
        }
        let filename = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|segment| !segment.is_empty())
            .map(str::to_string);
        Ok(Self {
            content_type: content_type_for_path(url.path()).to_string(),
            source: AttachmentSource::Url(url),
            filename,
        })
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    /// Path to remove once the request completes.
    pub fn staged_path(&self) -> Option<&Path> {
        match &self.source {
            AttachmentSource::Disk { path, staged: true } => Some(path),
            _ => None,
        }
    }

    pub fn capabilities(&self) -> MediaCapabilities {
        classify(&self.content_type)
    }

    /// Reads or downloads the bytes.
    pub async fn load(
        &self,
        http: &reqwest::Client,
        timeout: Duration,
    ) -> Result<MediaPayload, AttachmentError> {
        let (mime, data) = match &self.source {
            AttachmentSource::Disk { path, .. } => {
                let data = tokio::fs::read(path).await.map_err(|source| {
                    if source.kind() == ErrorKind::NotFound {
                        AttachmentError::NotFound { path: path.clone() }
                    } else {
                        AttachmentError::Read {
                            path: path.clone(),
                            source,
                        }
                    }
                })?;
                (self.content_type.clone(), Bytes::from(data))
            }
            AttachmentSource::Memory(data) => (self.content_type.clone(), data.clone()),
            AttachmentSource::Url(url) => self.fetch(http, url, timeout).await?,
        };
        if data.is_empty() {
            return Err(AttachmentError::Empty);
        }
        Ok(MediaPayload {
            mime,
            data,
            filename: self.filename.clone(),
        })
    }

    async fn fetch(
        &self,
        http: &reqwest::Client,
        url: &Url,
        timeout: Duration,
    ) -> Result<(String, Bytes), AttachmentError> {
        debug!(%url, "downloading attachment");
        let fetch_err = |source| AttachmentError::Fetch {
            url: url.clone(),
            source,
        };
        let response = http
            .get(url.clone())
            .timeout(timeout)
            .send()
            .await
            .map_err(fetch_err)?;
        let status = response.status();
        if !status.is_success() {
            return Err(AttachmentError::Status {
                url: url.clone(),
                status: status.as_u16(),
            });
        }
        let mime = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(';').next())
            .map(|value| value.trim().to_ascii_lowercase())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| self.content_type.clone());
        let data = response.bytes().await.map_err(fetch_err)?;
        Ok((mime, data))
    }
}

/// Removes staged upload files when dropped, whatever path the request took.
#[derive(Debug, Default)]
pub struct StagedUploads {
    paths: Vec<PathBuf>,
}

impl StagedUploads {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_attachments<'a, I>(attachments: I) -> Self
    where
        I: IntoIterator<Item = &'a Attachment>,
    {
        let mut staged = Self::new();
        for attachment in attachments {
            if let Some(path) = attachment.staged_path() {
                staged.track(path);
            }
        }
        staged
    }

    pub fn track(&mut self, path: impl Into<PathBuf>) {
        self.paths.push(path.into());
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Deletes every tracked file now. Files already gone are not an error.
    pub fn release(&mut self) {
        for path in self.paths.drain(..) {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "removed staged upload"),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => warn!(path = %path.display(), error = %err, "failed to remove staged upload"),
            }
        }
    }
}

impl Drop for StagedUploads {
    fn drop(&mut self) {
        self.release();
    }
}

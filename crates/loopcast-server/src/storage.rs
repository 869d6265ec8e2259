use std::path::{Path, PathBuf};

use anyhow::Context;
use axum::extract::multipart::Field;
use tokio::io::AsyncWriteExt;

use crate::error::ApiError;

pub const ALLOWED_EXTENSIONS: &[&str] = &["mp4", "mov", "mkv", "avi"];

/// Separates the uploader id from the original file name in stored names.
const UID_SEPARATOR: &str = "__";

/// Reduces a client-supplied name to a flat, shell- and path-safe file name.
pub fn sanitize_filename(raw: &str) -> Option<String> {
    // Browsers may send a full client path; keep only the last component.
    let base = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
    let mut out = String::with_capacity(base.len());
    for c in base.trim().chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
            out.push(c);
        } else if c.is_whitespace() {
            out.push('_');
        }
    }
    let out = out.trim_start_matches('.').to_string();
    if out.is_empty() { None } else { Some(out) }
}

pub fn has_allowed_extension(name: &str) -> bool {
    name.rsplit_once('.')
        .map(|(_, ext)| ALLOWED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn checked_video_name(raw: &str) -> Result<String, ApiError> {
    let name = sanitize_filename(raw).ok_or_else(|| ApiError::bad_request("No selected file."))?;
    if !has_allowed_extension(&name) {
        return Err(ApiError::bad_request("File type not allowed.")
            .with_hint(format!("Allowed extensions: {}", ALLOWED_EXTENSIONS.join(", "))));
    }
    Ok(name)
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct VideoEntry {
    pub id: String,
    pub name: String,
}

/// Uploaded source files. Library uploads live in `videos/` as
/// `<uid>__<name>`; files uploaded inline with a start request live in
/// `sessions/` and belong to that session.
#[derive(Debug, Clone)]
pub struct VideoStore {
    videos_dir: PathBuf,
    sessions_dir: PathBuf,
}

impl VideoStore {
    pub async fn init(videos_dir: PathBuf, sessions_dir: PathBuf) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&videos_dir)
            .await
            .with_context(|| format!("create videos dir {}", videos_dir.display()))?;
        tokio::fs::create_dir_all(&sessions_dir)
            .await
            .with_context(|| format!("create sessions dir {}", sessions_dir.display()))?;
        Ok(Self {
            videos_dir,
            sessions_dir,
        })
    }

    /// Resolves a stored library file id (as returned by upload/list).
    pub fn library_path(&self, filename: &str) -> Result<PathBuf, ApiError> {
        let filename = filename.trim();
        match sanitize_filename(filename) {
            Some(clean) if clean == filename => Ok(self.videos_dir.join(clean)),
            _ => Err(ApiError::bad_request(format!("invalid filename: {filename}"))),
        }
    }

    pub fn library_name(uid: &str, original: &str) -> Result<String, ApiError> {
        let uid = sanitize_filename(uid)
            .filter(|u| !u.contains(UID_SEPARATOR))
            .ok_or_else(|| ApiError::bad_request("invalid uid"))?;
        let name = checked_video_name(original)?;
        Ok(format!("{uid}{UID_SEPARATOR}{name}"))
    }

    pub fn session_path(&self, original: &str) -> Result<PathBuf, ApiError> {
        let name = checked_video_name(original)?;
        Ok(self
            .sessions_dir
            .join(format!("{}{UID_SEPARATOR}{name}", uuid::Uuid::new_v4())))
    }

    pub fn videos_dir(&self) -> &Path {
        &self.videos_dir
    }

    pub async fn list(&self, uid: &str) -> anyhow::Result<Vec<VideoEntry>> {
        let prefix = format!("{uid}{UID_SEPARATOR}");
        let mut out = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.videos_dir)
            .await
            .with_context(|| format!("read {}", self.videos_dir.display()))?;
        while let Some(entry) = dir.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let Some(original) = name.strip_prefix(&prefix) else {
                continue;
            };
            if !entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            out.push(VideoEntry {
                name: original.to_string(),
                id: name,
            });
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }
}

/// Streams one multipart file field to `dest` via a temp file, so a failed
/// upload never leaves a truncated video behind.
pub async fn save_field(mut field: Field<'_>, dest: &Path) -> Result<u64, ApiError> {
    let tmp = PathBuf::from(format!("{}.part", dest.display()));
    let mut file = tokio::fs::File::create(&tmp).await.map_err(|e| {
        tracing::error!(path = %tmp.display(), %e, "failed to create upload file");
        ApiError::internal("failed to store upload")
    })?;

    let mut written: u64 = 0;
    let res: Result<(), ApiError> = async {
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|e| ApiError::bad_request(format!("upload interrupted: {e}")))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|_| ApiError::internal("failed to store upload"))?;
            written = written.saturating_add(chunk.len() as u64);
        }
        file.flush()
            .await
            .map_err(|_| ApiError::internal("failed to store upload"))?;
        Ok(())
    }
    .await;

    if let Err(err) = res {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(err);
    }
    if written == 0 {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(ApiError::bad_request("uploaded file is empty"));
    }

    tokio::fs::rename(&tmp, dest).await.map_err(|e| {
        tracing::error!(path = %dest.display(), %e, "failed to persist upload");
        ApiError::internal("failed to store upload")
    })?;
    Ok(written)
}

use std::sync::Arc;

use chrono::{DateTime, Local};

use crate::blob::BlobStore;
use crate::error::BlobError;
use crate::models::AdminId;

pub const RECENT_ACTIVITY_LIMIT: usize = 10;

/// Append-only per-admin activity history, one object per admin.
pub struct ActivityLog {
    blobs: Arc<dyn BlobStore>,
}

pub fn activity_key(admin_id: AdminId) -> String {
    admin_id.to_string()
}

/// One log line per entry; embedded line breaks become spaces.
pub fn render_line(activity: &str, at: DateTime<Local>) -> String {
    let text = activity.replace("\r\n", " ").replace(['\n', '\r'], " ");
    format!("{} - {}", text, at.format("%Y-%m-%d %I:%M %p"))
}

impl ActivityLog {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    pub async fn log(&self, admin_id: AdminId, activity: &str) -> Result<(), BlobError> {
        self.log_at(admin_id, activity, Local::now()).await
    }

    pub async fn log_at(
        &self,
        admin_id: AdminId,
        activity: &str,
        at: DateTime<Local>,
    ) -> Result<(), BlobError> {
        let key = activity_key(admin_id);
        let mut content = match self.blobs.get(&key).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(BlobError::NotFound(_)) => String::new(),
            Err(err) => return Err(err),
        };
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&render_line(activity, at));
        content.push('\n');
        self.blobs.put(&key, content.into_bytes()).await
    }

    /// Last [`RECENT_ACTIVITY_LIMIT`] entries, newest first.
    pub async fn recent(&self, admin_id: AdminId) -> Result<Vec<String>, BlobError> {
        let content = match self.blobs.get(&activity_key(admin_id)).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(BlobError::NotFound(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .rev()
            .take(RECENT_ACTIVITY_LIMIT)
            .map(str::to_string)
            .collect())
    }
}

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use mini_spool_common::{DataUploader, SpoolError, UploadContext, UploadStatus};
use tracing::debug;

/// Local stand-in for an HTTP intake: every accepted payload becomes one
/// file under `outbox/<feature>/`.
pub struct DirectoryIntake {
    outbox: PathBuf,
    /// Attempts answered with 503 before the intake starts accepting.
    failures_left: AtomicU32,
}

impl DirectoryIntake {
    pub fn new(outbox: &Path) -> Self {
        Self::flaky(outbox, 0)
    }

    /// Answers the first `failures` attempts with 503.
    pub fn flaky(outbox: &Path, failures: u32) -> Self {
        Self {
            outbox: outbox.to_path_buf(),
            failures_left: AtomicU32::new(failures),
        }
    }

    pub fn outbox(&self) -> &Path {
        &self.outbox
    }
}

#[async_trait]
impl DataUploader for DirectoryIntake {
    async fn upload(&self, payload: &[u8], context: &UploadContext) -> Result<UploadStatus, SpoolError> {
        let request_id = Some(context.request_id.clone());
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Ok(UploadStatus::from_response(503, request_id));
        }

        let dir = self.outbox.join(&context.feature);
        let path = dir.join(format!("{}.payload", context.request_id));
        let written = async {
            tokio::fs::create_dir_all(&dir).await?;
            tokio::fs::write(&path, payload).await
        }
        .await;

        match written {
            Ok(()) => {
                debug!(feature = %context.feature, path = %path.display(), bytes = payload.len(), "payload stored");
                Ok(UploadStatus::from_response(202, request_id))
            }
            Err(e) => Ok(UploadStatus::from_network_error(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn context(feature: &str) -> UploadContext {
        UploadContext {
            feature: feature.to_string(),
            request_id: "req-1".to_string(),
            attempt: 1,
            events: 1,
            batch_age: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_accepted_payload_is_stored() {
        let dir = TempDir::new().unwrap();
        let intake = DirectoryIntake::new(dir.path());

        let status = intake.upload(b"[1,2]", &context("logs")).await.unwrap();

        assert_eq!(status.response_code, Some(202));
        assert_eq!(status.request_id.as_deref(), Some("req-1"));
        let stored = std::fs::read(dir.path().join("logs").join("req-1.payload")).unwrap();
        assert_eq!(stored, b"[1,2]");
    }

    #[tokio::test]
    async fn test_flaky_intake_fails_then_accepts() {
        let dir = TempDir::new().unwrap();
        let intake = DirectoryIntake::flaky(dir.path(), 1);

        assert!(intake.upload(b"x", &context("rum")).await.unwrap().needs_retry);
        assert!(!intake.upload(b"x", &context("rum")).await.unwrap().needs_retry);
    }
}

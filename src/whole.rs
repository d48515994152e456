//! Fully buffered import for local files and small payloads.
//!
//! The whole document is parsed and its header validated before anything is
//! written; persistence then goes through the same adapter as streaming.

use std::path::Path;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::ImportError;
use crate::foreign::{CanonicalSession, builtin_formats};
use crate::import::{ChapterTally, SessionData, SessionImporter};
use crate::parser::metadata_from_value;
use crate::persist::persist_chapter;
use crate::progress::{ProgressSink, ProgressTracker};
use crate::transfer;

/// Parses a whole document into canonical shape, converting foreign
/// formats. Nothing is persisted here.
pub fn canonical_session(bytes: &[u8]) -> Result<CanonicalSession, ImportError> {
    let root: Value = serde_json::from_slice(bytes).map_err(|err| ImportError::Parse {
        offset: 0,
        detail: format!("line {} column {}: {err}", err.line(), err.column()),
    })?;
    let Value::Object(mut root) = root else {
        return Err(ImportError::InvalidFormat {
            found: "non-object document".to_owned(),
        });
    };

    if let Some(metadata) = root.remove("metadata") {
        let metadata = metadata_from_value(&metadata)?;
        let chapters = match root.remove("chapters") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(chapters)) => chapters,
            Some(_) => {
                return Err(ImportError::Parse {
                    offset: 0,
                    detail: "\"chapters\" must be an array".to_owned(),
                });
            }
        };
        return Ok(CanonicalSession {
            metadata,
            chapters,
            trailing: root,
        });
    }

    match builtin_formats().into_iter().find(|f| f.detect(&root)) {
        Some(format) => {
            tracing::info!(format = format.name(), "converting foreign session format");
            format.convert(root)
        }
        None => Err(ImportError::MissingMetadata),
    }
}

impl SessionImporter {
    /// Imports a session file from disk.
    pub async fn import_from_file(
        &self,
        path: &Path,
        sink: ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<SessionData, ImportError> {
        let io_err = |source: std::io::Error| ImportError::Io {
            what: path.display().to_string(),
            source,
        };
        let len = tokio::fs::metadata(path).await.map_err(io_err)?.len();
        if len > self.config.max_content_length {
            return Err(ImportError::TooLarge {
                limit: self.config.max_content_length,
                actual: len,
            });
        }
        let bytes = tokio::fs::read(path).await.map_err(io_err)?;
        tracing::info!(path = %path.display(), bytes = bytes.len(), "importing session file");

        let mut tracker = self.tracker(sink);
        self.import_buffered(&bytes, &mut tracker, cancel).await
    }

    /// Imports a session already held in memory.
    pub async fn import_from_bytes(
        &self,
        bytes: &[u8],
        sink: ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<SessionData, ImportError> {
        let mut tracker = self.tracker(sink);
        self.import_buffered(bytes, &mut tracker, cancel).await
    }

    /// Downloads the whole body (with retries) and then imports it.
    pub async fn import_from_url(
        &self,
        url: &str,
        sink: ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<SessionData, ImportError> {
        let url = transfer::normalize_source_url(url, self.config.drive_api_key.as_deref())?;
        let mut tracker = self.tracker(sink);
        let response =
            transfer::fetch_with_retry(&self.client, &url, &self.config, &mut tracker, cancel)
                .await?;
        let bytes = transfer::read_body_capped(response, &self.config, &mut tracker, cancel).await?;
        self.import_buffered(&bytes, &mut tracker, cancel).await
    }

    async fn import_buffered(
        &self,
        bytes: &[u8],
        tracker: &mut ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<SessionData, ImportError> {
        let session = canonical_session(bytes)?;
        let total_chapters = session
            .metadata
            .chapter_count
            .unwrap_or(session.chapters.len() as u64);
        tracker.metadata_recognized(Some(total_chapters));

        let mut tally = ChapterTally::default();
        for (index, chapter) in session.chapters.into_iter().enumerate() {
            if cancel.is_cancelled() {
                tracing::warn!(chapters_kept = tally.chapters_persisted, "session import cancelled");
                return Err(ImportError::Cancelled);
            }
            let result = persist_chapter(self.store.as_ref(), index, chapter).await;
            if tally.record(index, result) {
                tracker.chapter_persisted(false);
            }
        }

        tracker.complete();
        let data = tally.finish(session.metadata, session.trailing);
        tracing::info!(
            chapters = data.chapters_persisted,
            translations = data.translations_persisted,
            skipped = data.skipped.len(),
            "session import complete"
        );
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_documents_keep_trailing_fields() {
        let session = canonical_session(
            br#"{"metadata":{"format":"lexiconforge-full-1","chapterCount":1},
                 "chapters":[{"url":"https://n.example/1"}],
                 "navigationHistory":["https://n.example/1"]}"#,
        )
        .unwrap();
        assert_eq!(session.chapters.len(), 1);
        assert_eq!(session.metadata.chapter_count, Some(1));
        assert!(session.trailing.contains_key("navigationHistory"));
    }

    #[test]
    fn foreign_tags_are_rejected_before_chapters() {
        let err = canonical_session(
            br#"{"metadata":{"format":"some-other-tool-v1"},"chapters":[{"url":"u"}]}"#,
        )
        .unwrap_err();
        assert_eq!(err.reason(), "invalid-format");
    }

    #[test]
    fn unrecognized_documents_report_missing_metadata() {
        let err = canonical_session(br#"{"chapters":[{"url":"u"}]}"#).unwrap_err();
        assert_eq!(err.reason(), "missing-metadata");
        let err = canonical_session(b"[1,2]").unwrap_err();
        assert_eq!(err.reason(), "invalid-format");
        let err = canonical_session(b"{\"metadata\":").unwrap_err();
        assert_eq!(err.reason(), "parse");
    }

    #[test]
    fn scraper_documents_are_converted() {
        let session = canonical_session(
            br#"{"novel":{"title":"N"},"chapters":[{"url":"https://n.example/1","text":"t"}]}"#,
        )
        .unwrap();
        assert!(session.metadata.format.starts_with("lexiconforge"));
        assert_eq!(session.chapters[0]["content"], "t");
    }
}

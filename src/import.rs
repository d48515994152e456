use std::sync::Arc;

use futures::{Stream, StreamExt as _};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::config::ImportConfig;
use crate::error::ImportError;
use crate::formats::SessionMetadata;
use crate::parser::{SessionEvent, SessionEventParser};
use crate::persist::{PersistOutcome, SkipReason, persist_chapter};
use crate::progress::{ProgressSink, ProgressTracker};
use crate::store::ChapterStore;
use crate::transfer;

/// Summary of a finished import.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionData {
    pub metadata: SessionMetadata,
    pub chapters_persisted: usize,
    pub translations_persisted: usize,
    pub skipped: Vec<SkippedChapter>,
    /// Top-level fields besides `metadata` and `chapters`, for the caller's
    /// final hydration.
    pub trailing: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedChapter {
    pub index: usize,
    pub reason: String,
    pub detail: String,
}

/// Running totals shared by the streaming and whole-document paths.
#[derive(Debug, Default)]
pub(crate) struct ChapterTally {
    pub(crate) chapters_persisted: usize,
    pub(crate) translations_persisted: usize,
    pub(crate) skipped: Vec<SkippedChapter>,
}

impl ChapterTally {
    /// Returns whether the chapter counts toward `chaptersLoaded`.
    pub(crate) fn record(&mut self, index: usize, result: Result<PersistOutcome, SkipReason>) -> bool {
        match result {
            Ok(outcome) => {
                self.chapters_persisted += 1;
                self.translations_persisted += outcome.versions.len();
                true
            }
            Err(reason) => {
                self.skipped.push(SkippedChapter {
                    index,
                    reason: reason.reason().to_owned(),
                    detail: reason.to_string(),
                });
                false
            }
        }
    }

    pub(crate) fn finish(self, metadata: SessionMetadata, trailing: Map<String, Value>) -> SessionData {
        SessionData {
            metadata,
            chapters_persisted: self.chapters_persisted,
            translations_persisted: self.translations_persisted,
            skipped: self.skipped,
            trailing,
        }
    }
}

/// Process-scoped import service: one HTTP client, one store, one config.
pub struct SessionImporter {
    pub(crate) client: reqwest::Client,
    pub(crate) config: ImportConfig,
    pub(crate) store: Arc<dyn ChapterStore>,
}

impl std::fmt::Debug for SessionImporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionImporter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SessionImporter {
    pub fn new(config: ImportConfig, store: Arc<dyn ChapterStore>) -> anyhow::Result<Self> {
        let client = transfer::build_http_client()?;
        Ok(Self {
            client,
            config,
            store,
        })
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ChapterStore> {
        &self.store
    }

    pub(crate) fn tracker(&self, sink: ProgressSink) -> ProgressTracker {
        ProgressTracker::new(
            sink,
            self.config.first_chapters_threshold,
            self.config.assumed_total_chapters,
        )
    }

    /// Streams a session from `url` into the store, persisting each chapter
    /// before reading further.
    pub async fn import_url(
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
        let total = response.content_length();
        let body = transfer::body_stream(response, self.config.request_timeout);
        self.stream_events(body, total, &mut tracker, cancel).await
    }

    /// Streams a session from any chunked byte source. `total` is the
    /// expected byte length, when known.
    pub async fn import_stream<S, B>(
        &self,
        chunks: S,
        total: Option<u64>,
        sink: ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<SessionData, ImportError>
    where
        S: Stream<Item = Result<B, ImportError>>,
        B: AsRef<[u8]>,
    {
        let mut tracker = self.tracker(sink);
        self.stream_events(chunks, total, &mut tracker, cancel).await
    }

    async fn stream_events<S, B>(
        &self,
        chunks: S,
        total: Option<u64>,
        tracker: &mut ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<SessionData, ImportError>
    where
        S: Stream<Item = Result<B, ImportError>>,
        B: AsRef<[u8]>,
    {
        let mut chunks = std::pin::pin!(chunks);
        let mut parser = SessionEventParser::new();
        let mut tally = ChapterTally::default();
        let mut metadata: Option<SessionMetadata> = None;
        let mut loaded = 0u64;

        let result = loop {
            let event = match parser.next_event() {
                Ok(event) => event,
                Err(err) => break Err(err),
            };
            match event {
                Some(SessionEvent::Metadata(meta)) => {
                    tracing::info!(
                        format = %meta.format,
                        chapter_count = ?meta.chapter_count,
                        "session metadata recognized"
                    );
                    tracker.metadata_recognized(meta.chapter_count);
                    metadata = Some(meta);
                }
                Some(SessionEvent::Chapter { index, value }) => {
                    if cancel.is_cancelled() {
                        break Err(ImportError::Cancelled);
                    }
                    let result = persist_chapter(self.store.as_ref(), index, value).await;
                    if tally.record(index, result) {
                        tracker.chapter_persisted(true);
                    }
                }
                Some(SessionEvent::Done { trailing }) => {
                    let Some(metadata) = metadata.take() else {
                        break Err(ImportError::MissingMetadata);
                    };
                    tracker.complete();
                    break Ok(tally.finish(metadata, trailing));
                }
                None if parser.is_finished() => {
                    break Err(ImportError::Parse {
                        offset: parser.bytes_discarded() + parser.buffered_len() as u64,
                        detail: "session document ended without completing".to_owned(),
                    });
                }
                None => {
                    let next = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break Err(ImportError::Cancelled),
                        next = tokio::time::timeout(self.config.request_timeout, chunks.next()) => next,
                    };
                    match next {
                        Ok(Some(Ok(chunk))) => {
                            let chunk = chunk.as_ref();
                            loaded += chunk.len() as u64;
                            if loaded > self.config.max_content_length {
                                break Err(ImportError::TooLarge {
                                    limit: self.config.max_content_length,
                                    actual: loaded,
                                });
                            }
                            tracker.download_progress(loaded, total);
                            parser.feed(chunk);
                        }
                        Ok(Some(Err(err))) => break Err(err),
                        Ok(None) => parser.finish(),
                        Err(_) => {
                            break Err(ImportError::Timeout {
                                url: "session body".to_owned(),
                                timeout_secs: self.config.request_timeout.as_secs(),
                            });
                        }
                    }
                }
            }
        };

        match &result {
            Ok(data) => tracing::info!(
                chapters = data.chapters_persisted,
                translations = data.translations_persisted,
                skipped = data.skipped.len(),
                bytes = loaded,
                peak_buffered = parser.peak_buffered(),
                "session import complete"
            ),
            Err(err) => tracing::warn!(
                reason = err.reason(),
                chapters_kept = tracker.chapters_loaded(),
                "session import stopped: {err}"
            ),
        }
        result
    }
}

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ImportError;

const MIB: u64 = 1024 * 1024;
const UNKNOWN_SIZE_PERCENT_CAP: u64 = 95;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStage {
    Downloading,
    Parsing,
    Importing,
    Streaming,
    Complete,
}

/// One snapshot of import progress. Each emission replaces the previous one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportProgress {
    pub stage: ImportStage,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loaded: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chapters_loaded: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_chapters: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_start_reading: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,
    pub message: String,
}

type ProgressFn = Box<dyn FnMut(ImportProgress) + Send>;
type MilestoneFn = Box<dyn FnOnce() + Send>;

/// Caller-side callbacks. Both are optional.
#[derive(Default)]
pub struct ProgressSink {
    on_progress: Option<ProgressFn>,
    on_first_chapters_ready: Option<MilestoneFn>,
}

impl ProgressSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_progress(mut self, f: impl FnMut(ImportProgress) + Send + 'static) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    pub fn on_first_chapters_ready(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_first_chapters_ready = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for ProgressSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressSink")
            .field("on_progress", &self.on_progress.is_some())
            .field("on_first_chapters_ready", &self.on_first_chapters_ready.is_some())
            .finish()
    }
}

/// Folds download, parse and persist signals into ordered [`ImportProgress`]
/// snapshots. Stages only move forward; the first-chapters milestone is a latch.
#[derive(Debug)]
pub struct ProgressTracker {
    sink: ProgressSink,
    stage: ImportStage,
    threshold: usize,
    assumed_total_chapters: usize,
    loaded: Option<u64>,
    total: Option<u64>,
    total_chapters: Option<u64>,
    chapters_loaded: usize,
    milestone_reached: bool,
}

impl ProgressTracker {
    pub fn new(sink: ProgressSink, threshold: usize, assumed_total_chapters: usize) -> Self {
        Self {
            sink,
            stage: ImportStage::Downloading,
            threshold,
            assumed_total_chapters: assumed_total_chapters.max(1),
            loaded: None,
            total: None,
            total_chapters: None,
            chapters_loaded: 0,
            milestone_reached: false,
        }
    }

    pub fn stage(&self) -> ImportStage {
        self.stage
    }

    pub fn chapters_loaded(&self) -> usize {
        self.chapters_loaded
    }

    pub fn milestone_reached(&self) -> bool {
        self.milestone_reached
    }

    pub fn download_progress(&mut self, loaded: u64, total: Option<u64>) {
        self.loaded = Some(loaded);
        self.total = total;
        if self.stage != ImportStage::Downloading {
            return;
        }
        let progress = download_percent(loaded, total);
        let message = match total {
            Some(total) => format!(
                "Downloading session: {} of {}",
                format_bytes(loaded),
                format_bytes(total)
            ),
            None => format!("Downloading session: {}", format_bytes(loaded)),
        };
        self.emit(ImportProgress {
            loaded: Some(loaded),
            total,
            ..self.snapshot(progress, message)
        });
    }

    pub fn retrying(&mut self, attempt: u32, max_retries: u32, delay: Duration, cause: &ImportError) {
        let message = format!(
            "Fetch failed ({}); retrying in {:.1}s (attempt {attempt}/{max_retries})",
            cause.reason(),
            delay.as_secs_f64()
        );
        self.emit(ImportProgress {
            retry_attempt: Some(attempt),
            max_retries: Some(max_retries),
            retry_delay_ms: Some(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)),
            ..self.snapshot(0, message)
        });
    }

    /// The document header was recognized.
    pub fn metadata_recognized(&mut self, total_chapters: Option<u64>) {
        self.total_chapters = total_chapters;
        if !self.enter(ImportStage::Parsing) {
            return;
        }
        let message = match total_chapters {
            Some(n) => format!("Session recognized: {n} chapters"),
            None => "Session recognized".to_owned(),
        };
        self.emit(ImportProgress {
            total_chapters,
            ..self.snapshot(0, message)
        });
    }

    /// A chapter finished persisting. `streaming` selects the streaming stage
    /// over the whole-document importing stage.
    pub fn chapter_persisted(&mut self, streaming: bool) {
        self.chapters_loaded += 1;
        let stage = if streaming {
            ImportStage::Streaming
        } else {
            ImportStage::Importing
        };
        self.enter(stage);

        let just_reached = !self.milestone_reached && self.chapters_loaded >= self.threshold;
        if just_reached {
            self.milestone_reached = true;
        }

        let progress = chapter_percent(
            self.chapters_loaded,
            self.total_chapters,
            self.assumed_total_chapters,
        );
        let message = match self.total_chapters {
            Some(total) => format!("Imported {} of {total} chapters", self.chapters_loaded),
            None => format!("Imported {} chapters", self.chapters_loaded),
        };
        let snapshot = self.chapter_snapshot(progress, message);
        self.emit(snapshot);

        if just_reached {
            tracing::info!(chapters = self.chapters_loaded, "first chapters ready");
            if let Some(callback) = self.sink.on_first_chapters_ready.take() {
                callback();
            }
        }
    }

    /// Emits the terminal snapshot; later calls are ignored.
    pub fn complete(&mut self) {
        if !self.enter(ImportStage::Complete) {
            return;
        }
        let message = format!("Import complete: {} chapters", self.chapters_loaded);
        let snapshot = self.chapter_snapshot(100, message);
        self.emit(snapshot);
    }

    /// Moves to `stage` and reports whether a snapshot should be emitted.
    /// `parsing` and `complete` emit once; the other stages may repeat.
    fn enter(&mut self, stage: ImportStage) -> bool {
        if stage < self.stage {
            return false;
        }
        let changed = stage != self.stage;
        self.stage = stage;
        changed
            || matches!(
                stage,
                ImportStage::Downloading | ImportStage::Importing | ImportStage::Streaming
            )
    }

    fn snapshot(&self, progress: u8, message: String) -> ImportProgress {
        ImportProgress {
            stage: self.stage,
            progress,
            loaded: None,
            total: None,
            chapters_loaded: None,
            total_chapters: None,
            can_start_reading: None,
            retry_attempt: None,
            max_retries: None,
            retry_delay_ms: None,
            message,
        }
    }

    fn chapter_snapshot(&self, progress: u8, message: String) -> ImportProgress {
        ImportProgress {
            loaded: self.loaded,
            total: self.total,
            chapters_loaded: Some(self.chapters_loaded),
            total_chapters: self.total_chapters,
            can_start_reading: Some(self.milestone_reached),
            ..self.snapshot(progress, message)
        }
    }

    fn emit(&mut self, progress: ImportProgress) {
        tracing::debug!(
            stage = ?progress.stage,
            progress = progress.progress,
            message = %progress.message,
            "import progress"
        );
        if let Some(on_progress) = self.sink.on_progress.as_mut() {
            on_progress(progress);
        }
    }
}

/// Byte progress, keeping 100 for "parsing complete". Without a known total
/// this is a rough 1% per MiB.
pub fn download_percent(loaded: u64, total: Option<u64>) -> u8 {
    let percent = match total {
        Some(total) if total > 0 => (loaded.saturating_mul(100) / total).min(99),
        _ => (loaded / MIB).min(UNKNOWN_SIZE_PERCENT_CAP),
    };
    percent as u8
}

pub fn chapter_percent(loaded: usize, total: Option<u64>, assumed_total: usize) -> u8 {
    let denominator = match total {
        Some(total) if total > 0 => total,
        _ => assumed_total.max(1) as u64,
    };
    ((loaded as u64).saturating_mul(100) / denominator).min(99) as u8
}

fn format_bytes(bytes: u64) -> String {
    format!("{:.1} MB", bytes as f64 / MIB as f64)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    fn recording_tracker(
        threshold: usize,
    ) -> (
        ProgressTracker,
        Arc<Mutex<Vec<ImportProgress>>>,
        Arc<AtomicUsize>,
    ) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let fired = Arc::new(AtomicUsize::new(0));
        let sink = ProgressSink::new()
            .on_progress({
                let events = Arc::clone(&events);
                move |p| events.lock().unwrap().push(p)
            })
            .on_first_chapters_ready({
                let fired = Arc::clone(&fired);
                move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                }
            });
        (ProgressTracker::new(sink, threshold, 500), events, fired)
    }

    #[test]
    fn milestone_fires_once_at_threshold() {
        for (chapters, expected) in [(0, 0), (5, 0), (50, 1)] {
            let (mut tracker, events, fired) = recording_tracker(10);
            tracker.metadata_recognized(Some(chapters as u64));
            for _ in 0..chapters {
                tracker.chapter_persisted(true);
            }
            tracker.complete();
            assert_eq!(fired.load(Ordering::SeqCst), expected, "chapters={chapters}");

            let events = events.lock().unwrap();
            let reading = events
                .iter()
                .filter_map(|e| e.can_start_reading)
                .collect::<Vec<_>>();
            if chapters >= 10 {
                let first_true = reading.iter().position(|r| *r).unwrap();
                assert_eq!(first_true, 9);
                assert!(reading[first_true..].iter().all(|r| *r));
            } else {
                assert!(reading.iter().all(|r| !*r));
            }
        }
    }

    #[test]
    fn stages_only_move_forward_and_complete_is_terminal() {
        let (mut tracker, events, _) = recording_tracker(2);
        tracker.download_progress(10, Some(100));
        tracker.metadata_recognized(Some(3));
        tracker.download_progress(50, Some(100));
        tracker.chapter_persisted(true);
        tracker.metadata_recognized(Some(3));
        tracker.chapter_persisted(true);
        tracker.complete();
        tracker.complete();

        let events = events.lock().unwrap();
        let stages = events.iter().map(|e| e.stage).collect::<Vec<_>>();
        assert_eq!(
            stages,
            [
                ImportStage::Downloading,
                ImportStage::Parsing,
                ImportStage::Streaming,
                ImportStage::Streaming,
                ImportStage::Complete,
            ]
        );
        let last = events.last().unwrap();
        assert_eq!(last.progress, 100);
        assert_eq!(last.chapters_loaded, Some(2));
        assert_eq!(last.loaded, Some(50));
    }

    #[test]
    fn retry_snapshot_names_attempt() {
        let (mut tracker, events, _) = recording_tracker(10);
        let cause = ImportError::Timeout {
            url: "u".to_owned(),
            timeout_secs: 60,
        };
        tracker.retrying(2, 3, Duration::from_millis(4000), &cause);
        let events = events.lock().unwrap();
        assert_eq!(events[0].retry_attempt, Some(2));
        assert_eq!(events[0].max_retries, Some(3));
        assert_eq!(events[0].retry_delay_ms, Some(4000));
        assert!(events[0].message.contains("4.0s"));
    }

    #[test]
    fn percentages() {
        assert_eq!(download_percent(50, Some(100)), 50);
        assert_eq!(download_percent(100, Some(100)), 99);
        assert_eq!(download_percent(3 * MIB, None), 3);
        assert_eq!(download_percent(400 * MIB, None), 95);
        assert_eq!(chapter_percent(5, Some(10), 500), 50);
        assert_eq!(chapter_percent(12, Some(10), 500), 99);
        assert_eq!(chapter_percent(50, None, 500), 10);
    }
}

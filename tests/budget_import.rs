mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use common::budget_alloc::BudgetAlloc;
use common::generated::chunk_stream;
use lexiconforge_import::formats::{NewTranslation, StoredChapter, StoredTranslation};
use lexiconforge_import::{ChapterStore, ImportConfig, ProgressSink, SessionImporter};
use tokio_util::sync::CancellationToken;

#[global_allocator]
static ALLOC: BudgetAlloc = BudgetAlloc::new();

/// Accepts every write and keeps only counters, so heap growth comes from the
/// import itself.
#[derive(Debug, Default)]
struct CountingStore {
    chapters: AtomicUsize,
    translations: AtomicUsize,
}

#[async_trait]
impl ChapterStore for CountingStore {
    async fn put_chapter(&self, _chapter: &StoredChapter) -> anyhow::Result<()> {
        self.chapters.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn put_translation(&self, translation: NewTranslation) -> anyhow::Result<u32> {
        self.translations.fetch_add(1, Ordering::Relaxed);
        Ok(translation.requested_version.unwrap_or(1))
    }

    async fn set_active_translation(&self, _chapter_url: &str, _version: u32) -> anyhow::Result<()> {
        Ok(())
    }

    async fn get_chapter(&self, _chapter_url: &str) -> anyhow::Result<Option<StoredChapter>> {
        Ok(None)
    }

    async fn list_chapters(&self) -> anyhow::Result<Vec<StoredChapter>> {
        Ok(Vec::new())
    }

    async fn list_translations(
        &self,
        _chapter_url: &str,
    ) -> anyhow::Result<Vec<StoredTranslation>> {
        Ok(Vec::new())
    }
}

/// Runs the streaming import over `chapters` generated chapters and returns
/// the peak heap growth seen while it ran.
async fn measure(chapters: usize) -> anyhow::Result<usize> {
    let store = Arc::new(CountingStore::default());
    let importer = SessionImporter::new(ImportConfig::default(), store.clone())?;
    let cancel = CancellationToken::new();

    let baseline = ALLOC.current_bytes();
    ALLOC.reset_peak();
    let data = importer
        .import_stream(chunk_stream(chapters, 8 * 1024), None, ProgressSink::new(), &cancel)
        .await?;
    let peak = ALLOC.peak_bytes().saturating_sub(baseline);

    assert_eq!(data.chapters_persisted, chapters);
    assert_eq!(data.translations_persisted, chapters);
    assert_eq!(store.chapters.load(Ordering::Relaxed), chapters);
    assert_eq!(store.translations.load(Ordering::Relaxed), chapters);
    Ok(peak)
}

#[tokio::test]
async fn streaming_import_peak_memory_does_not_grow_with_chapter_count() -> anyhow::Result<()> {
    let small_peak = measure(50).await?;
    let large_peak = measure(2_000).await?;

    let slack = 256 * 1024;
    assert!(
        large_peak <= small_peak + slack,
        "peak grew with chapter count: {small_peak} -> {large_peak}"
    );
    assert!(large_peak < 4 * 1024 * 1024, "peak {large_peak} bytes");
    Ok(())
}

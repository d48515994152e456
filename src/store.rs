use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::Digest as _;
use tokio::fs;

use crate::formats::{NewTranslation, StoredChapter, StoredTranslation};

/// Chapter and translation-version storage written by the import pipeline.
///
/// Chapters are keyed by URL; writing the same URL again replaces the record.
/// Translation versions are per chapter and the active version is a separate
/// pointer, so `is_active` on returned translations reflects that pointer.
#[async_trait]
pub trait ChapterStore: Send + Sync {
    async fn put_chapter(&self, chapter: &StoredChapter) -> anyhow::Result<()>;

    /// Stores a translation at its requested version, or at the next free
    /// version when none is requested. Returns the version used.
    async fn put_translation(&self, translation: NewTranslation) -> anyhow::Result<u32>;

    async fn set_active_translation(&self, chapter_url: &str, version: u32) -> anyhow::Result<()>;

    async fn get_chapter(&self, chapter_url: &str) -> anyhow::Result<Option<StoredChapter>>;

    /// All chapters ordered by chapter number, then URL.
    async fn list_chapters(&self) -> anyhow::Result<Vec<StoredChapter>>;

    /// Versions of one chapter in ascending order.
    async fn list_translations(&self, chapter_url: &str)
    -> anyhow::Result<Vec<StoredTranslation>>;

    async fn active_translation(
        &self,
        chapter_url: &str,
    ) -> anyhow::Result<Option<StoredTranslation>> {
        Ok(self
            .list_translations(chapter_url)
            .await?
            .into_iter()
            .find(|t| t.is_active))
    }
}

fn sort_chapters(chapters: &mut [StoredChapter]) {
    chapters.sort_by(|a, b| {
        let a_key = (a.chapter_number.is_none(), a.chapter_number);
        let b_key = (b.chapter_number.is_none(), b.chapter_number);
        a_key.cmp(&b_key).then_with(|| a.url.cmp(&b.url))
    });
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[derive(Debug, Default)]
struct MemoryEntry {
    chapter: Option<StoredChapter>,
    translations: BTreeMap<u32, StoredTranslation>,
    active: Option<u32>,
}

#[derive(Debug, Default)]
pub struct MemoryChapterStore {
    entries: Mutex<BTreeMap<String, MemoryEntry>>,
}

impl MemoryChapterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, MemoryEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ChapterStore for MemoryChapterStore {
    async fn put_chapter(&self, chapter: &StoredChapter) -> anyhow::Result<()> {
        let mut entries = self.lock();
        entries.entry(chapter.url.clone()).or_default().chapter = Some(chapter.clone());
        Ok(())
    }

    async fn put_translation(&self, translation: NewTranslation) -> anyhow::Result<u32> {
        let mut entries = self.lock();
        let entry = entries.entry(translation.chapter_url.clone()).or_default();
        let version = match translation.requested_version {
            Some(version) => version,
            None => entry
                .translations
                .keys()
                .next_back()
                .map_or(1, |max| max + 1),
        };
        let stored = StoredTranslation::from_new(translation, version, now_rfc3339());
        entry.translations.insert(version, stored);
        Ok(version)
    }

    async fn set_active_translation(&self, chapter_url: &str, version: u32) -> anyhow::Result<()> {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(chapter_url)
            .ok_or_else(|| anyhow::anyhow!("no translations for chapter: {chapter_url}"))?;
        if !entry.translations.contains_key(&version) {
            anyhow::bail!("translation version {version} not found for chapter: {chapter_url}");
        }
        entry.active = Some(version);
        Ok(())
    }

    async fn get_chapter(&self, chapter_url: &str) -> anyhow::Result<Option<StoredChapter>> {
        Ok(self
            .lock()
            .get(chapter_url)
            .and_then(|entry| entry.chapter.clone()))
    }

    async fn list_chapters(&self) -> anyhow::Result<Vec<StoredChapter>> {
        let mut chapters = self
            .lock()
            .values()
            .filter_map(|entry| entry.chapter.clone())
            .collect::<Vec<_>>();
        sort_chapters(&mut chapters);
        Ok(chapters)
    }

    async fn list_translations(
        &self,
        chapter_url: &str,
    ) -> anyhow::Result<Vec<StoredTranslation>> {
        let entries = self.lock();
        let Some(entry) = entries.get(chapter_url) else {
            return Ok(Vec::new());
        };
        Ok(entry
            .translations
            .values()
            .map(|t| StoredTranslation {
                is_active: entry.active == Some(t.version),
                ..t.clone()
            })
            .collect())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ActivePointer {
    version: u32,
}

/// One directory per chapter under `<base>/chapters/`:
/// `chapter.json`, `translations/vNNNNNN.json` and `active.json`.
#[derive(Debug, Clone)]
pub struct LocalFsChapterStore {
    base_dir: PathBuf,
}

impl LocalFsChapterStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn chapters_dir(&self) -> PathBuf {
        self.base_dir.join("chapters")
    }

    fn chapter_dir(&self, chapter_url: &str) -> PathBuf {
        self.chapters_dir().join(chapter_dir_name(chapter_url))
    }

    fn chapter_json_path(&self, chapter_url: &str) -> PathBuf {
        self.chapter_dir(chapter_url).join("chapter.json")
    }

    fn translations_dir(&self, chapter_url: &str) -> PathBuf {
        self.chapter_dir(chapter_url).join("translations")
    }

    fn translation_json_path(&self, chapter_url: &str, version: u32) -> PathBuf {
        self.translations_dir(chapter_url)
            .join(format!("v{version:06}.json"))
    }

    fn active_json_path(&self, chapter_url: &str) -> PathBuf {
        self.chapter_dir(chapter_url).join("active.json")
    }

    async fn stored_versions(&self, chapter_url: &str) -> anyhow::Result<Vec<u32>> {
        let dir = self.translations_dir(chapter_url);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("read dir: {}", dir.display()));
            }
        };

        let mut versions = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("read dir entry: {}", dir.display()))?
        {
            let name = entry.file_name();
            let Some(version) = name
                .to_str()
                .and_then(|n| n.strip_prefix('v'))
                .and_then(|n| n.strip_suffix(".json"))
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            versions.push(version);
        }
        versions.sort_unstable();
        Ok(versions)
    }
}

#[async_trait]
impl ChapterStore for LocalFsChapterStore {
    async fn put_chapter(&self, chapter: &StoredChapter) -> anyhow::Result<()> {
        write_json_atomic(&self.chapter_json_path(&chapter.url), chapter)
            .await
            .context("write chapter.json")
    }

    async fn put_translation(&self, translation: NewTranslation) -> anyhow::Result<u32> {
        let chapter_url = translation.chapter_url.clone();
        let version = match translation.requested_version {
            Some(version) => version,
            None => self
                .stored_versions(&chapter_url)
                .await?
                .last()
                .map_or(1, |max| max + 1),
        };
        let stored = StoredTranslation::from_new(translation, version, now_rfc3339());
        write_json_atomic(&self.translation_json_path(&chapter_url, version), &stored)
            .await
            .context("write translation version")?;
        Ok(version)
    }

    async fn set_active_translation(&self, chapter_url: &str, version: u32) -> anyhow::Result<()> {
        let path = self.translation_json_path(chapter_url, version);
        if fs::metadata(&path).await.is_err() {
            anyhow::bail!("translation version {version} not found for chapter: {chapter_url}");
        }
        write_json_atomic(&self.active_json_path(chapter_url), &ActivePointer { version })
            .await
            .context("write active.json")
    }

    async fn get_chapter(&self, chapter_url: &str) -> anyhow::Result<Option<StoredChapter>> {
        let path = self.chapter_json_path(chapter_url);
        read_json(&path)
            .await
            .with_context(|| format!("read: {}", path.display()))
    }

    async fn list_chapters(&self) -> anyhow::Result<Vec<StoredChapter>> {
        let dir = self.chapters_dir();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("read dir: {}", dir.display()));
            }
        };

        let mut chapters = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("read dir entry: {}", dir.display()))?
        {
            let path = entry.path().join("chapter.json");
            if let Some(chapter) = read_json::<StoredChapter>(&path)
                .await
                .with_context(|| format!("read: {}", path.display()))?
            {
                chapters.push(chapter);
            }
        }
        sort_chapters(&mut chapters);
        Ok(chapters)
    }

    async fn list_translations(
        &self,
        chapter_url: &str,
    ) -> anyhow::Result<Vec<StoredTranslation>> {
        let active_path = self.active_json_path(chapter_url);
        let active = read_json::<ActivePointer>(&active_path)
            .await
            .with_context(|| format!("read: {}", active_path.display()))?
            .map(|pointer| pointer.version);

        let mut translations = Vec::new();
        for version in self.stored_versions(chapter_url).await? {
            let path = self.translation_json_path(chapter_url, version);
            let Some(mut translation) = read_json::<StoredTranslation>(&path)
                .await
                .with_context(|| format!("read: {}", path.display()))?
            else {
                continue;
            };
            translation.is_active = active == Some(version);
            translations.push(translation);
        }
        Ok(translations)
    }
}

fn chapter_dir_name(chapter_url: &str) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(chapter_url.as_bytes());
    format!("c_{}", hex::encode(hasher.finalize()))
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let value = serde_json::from_slice(&bytes).context("parse json")?;
    Ok(Some(value))
}

async fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("create parent dir: {}", parent.display()))?;

    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    let data = serde_json::to_vec_pretty(value).context("serialize json")?;
    fs::write(&tmp_path, &data)
        .await
        .with_context(|| format!("write tmp: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("rename tmp to final: {}", path.display()))?;
    Ok(())
}

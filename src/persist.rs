//! Chapter persistence for both import paths.
//!
//! Wire chapters arrive in two shapes (`translations[]` and the legacy
//! singular `translationResult`). They are normalized into a [`ChapterInput`]
//! right here; nothing downstream looks at the wire shape again.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::formats::{
    ChapterRecord, DEFAULT_USAGE_MODEL, DEFAULT_USAGE_PROVIDER, NewTranslation, StoredChapter,
    TranslationRecord, UsageMetrics, WireUsageMetrics,
};
use crate::store::ChapterStore;

/// Why a chapter was left out of the store. The import keeps going.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SkipReason {
    #[error("chapter has neither url nor canonicalUrl")]
    MissingUrl,
    #[error("chapter record has an unexpected shape: {0}")]
    Malformed(String),
    #[error("chapter store rejected the chapter: {0}")]
    Storage(String),
}

impl SkipReason {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MissingUrl => "missing-url",
            Self::Malformed(_) => "malformed",
            Self::Storage(_) => "storage",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranslationInput {
    pub translation: NewTranslation,
    /// `isActive` as written in the export, if it was written at all.
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChapterInput {
    pub chapter: StoredChapter,
    pub translations: Vec<TranslationInput>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistOutcome {
    pub url: String,
    /// Versions written, in input order.
    pub versions: Vec<u32>,
    pub active_version: Option<u32>,
}

enum TranslationShape {
    Versions(Vec<TranslationRecord>),
    Legacy(Box<TranslationRecord>),
    Untranslated,
}

impl TranslationShape {
    fn of(record: &mut ChapterRecord) -> Self {
        match (record.translations.take(), record.translation_result.take()) {
            (Some(list), _) if !list.is_empty() => Self::Versions(list),
            (_, Some(single)) => Self::Legacy(Box::new(single)),
            _ => Self::Untranslated,
        }
    }

    fn into_records(self) -> Vec<TranslationRecord> {
        match self {
            Self::Versions(list) => list,
            Self::Legacy(single) => vec![*single],
            Self::Untranslated => Vec::new(),
        }
    }
}

pub fn normalize_chapter(value: Value, imported_at: &str) -> Result<ChapterInput, SkipReason> {
    if !value.is_object() {
        return Err(SkipReason::Malformed(format!(
            "expected an object, found {}",
            json_kind(&value)
        )));
    }
    let mut record: ChapterRecord =
        serde_json::from_value(value).map_err(|err| SkipReason::Malformed(err.to_string()))?;

    let url = [record.url.as_deref(), record.canonical_url.as_deref()]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|u| !u.is_empty())
        .map(str::to_owned)
        .ok_or(SkipReason::MissingUrl)?;

    let shape = TranslationShape::of(&mut record);
    let mut translations = shape
        .into_records()
        .into_iter()
        .map(|t| normalize_translation(t, &url, record.stable_id.as_deref()))
        .collect::<Vec<_>>();
    assign_versions(&mut translations)?;

    let chapter = StoredChapter {
        url,
        stable_id: record.stable_id,
        title: record.title.unwrap_or_default(),
        content: record.content.unwrap_or_default(),
        next_url: record.next_url,
        prev_url: record.prev_url,
        chapter_number: record.chapter_number,
        fan_translation: record.fan_translation,
        imported_at: imported_at.to_owned(),
    };

    Ok(ChapterInput {
        chapter,
        translations,
    })
}

fn normalize_translation(
    record: TranslationRecord,
    chapter_url: &str,
    stable_id: Option<&str>,
) -> TranslationInput {
    let usage = record.usage_metrics.unwrap_or_default();
    let usage_metrics = normalize_usage(&usage, record.provider.as_deref(), record.model.as_deref());

    let provider = first_non_empty([record.provider.as_deref(), usage.provider.as_deref()])
        .unwrap_or(DEFAULT_USAGE_PROVIDER)
        .to_owned();
    let model = first_non_empty([record.model.as_deref(), usage.model.as_deref()])
        .unwrap_or(DEFAULT_USAGE_MODEL)
        .to_owned();

    let requested_version = record
        .version
        .and_then(|v| u32::try_from(v).ok())
        .filter(|v| *v > 0);

    TranslationInput {
        translation: NewTranslation {
            chapter_url: chapter_url.to_owned(),
            stable_id: stable_id.map(str::to_owned),
            requested_version,
            translated_title: record.translated_title.unwrap_or_default(),
            translation: record.translation.unwrap_or_default(),
            footnotes: record.footnotes.unwrap_or_default(),
            suggested_illustrations: record.suggested_illustrations.unwrap_or_default(),
            usage_metrics,
            provider,
            model,
            temperature: record.temperature,
            system_prompt: record.system_prompt,
        },
        is_active: record.is_active,
    }
}

fn normalize_usage(
    usage: &WireUsageMetrics,
    provider: Option<&str>,
    model: Option<&str>,
) -> UsageMetrics {
    let count = |n: Option<f64>| {
        n.filter(|n| n.is_finite() && *n > 0.0)
            .map_or(0, |n| n.round() as u64)
    };
    let amount = |n: Option<f64>| n.filter(|n| n.is_finite()).unwrap_or(0.0);

    UsageMetrics {
        prompt_tokens: count(usage.prompt_tokens),
        completion_tokens: count(usage.completion_tokens),
        total_tokens: count(usage.total_tokens),
        estimated_cost: amount(usage.estimated_cost),
        request_time: amount(usage.request_time),
        provider: first_non_empty([usage.provider.as_deref(), provider])
            .unwrap_or(DEFAULT_USAGE_PROVIDER)
            .to_owned(),
        model: first_non_empty([usage.model.as_deref(), model])
            .unwrap_or(DEFAULT_USAGE_MODEL)
            .to_owned(),
    }
}

/// Pins every translation of a chapter to a version before anything is
/// written. Wire versions are kept unless repeated within the chapter; the
/// rest take the slots after the highest wire version, in input order, so a
/// re-import of the same chapter lands on the same versions.
fn assign_versions(translations: &mut [TranslationInput]) -> Result<(), SkipReason> {
    let mut taken = BTreeSet::new();
    let mut unpinned = Vec::new();
    for (i, input) in translations.iter_mut().enumerate() {
        match input.translation.requested_version {
            Some(version) if taken.insert(version) => {}
            _ => {
                input.translation.requested_version = None;
                unpinned.push(i);
            }
        }
    }

    let mut next = taken.last().copied().unwrap_or(0);
    for i in unpinned {
        next = next
            .checked_add(1)
            .ok_or_else(|| SkipReason::Malformed("translation version overflow".to_owned()))?;
        translations[i].translation.requested_version = Some(next);
    }
    Ok(())
}

fn first_non_empty<'a>(candidates: [Option<&'a str>; 2]) -> Option<&'a str> {
    candidates
        .into_iter()
        .flatten()
        .find(|s| !s.trim().is_empty())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Explicit `isActive: true` wins; otherwise the first version stored.
fn pick_active(inputs: &[TranslationInput], versions: &[u32]) -> Option<u32> {
    inputs
        .iter()
        .zip(versions)
        .find(|(input, _)| input.is_active == Some(true))
        .map(|(_, version)| *version)
        .or_else(|| versions.first().copied())
}

/// Writes the chapter record, then each translation version, then the
/// active pointer. Failures are reported as a [`SkipReason`] and never abort
/// the surrounding import.
pub async fn persist_chapter(
    store: &dyn ChapterStore,
    index: usize,
    value: Value,
) -> Result<PersistOutcome, SkipReason> {
    let imported_at = chrono::Utc::now().to_rfc3339();
    let input = match normalize_chapter(value, &imported_at) {
        Ok(input) => input,
        Err(reason) => {
            tracing::warn!(chapter_index = index, reason = reason.reason(), "skipping chapter: {reason}");
            return Err(reason);
        }
    };

    let url = input.chapter.url.clone();
    match write_chapter(store, input).await {
        Ok(outcome) => {
            tracing::debug!(
                chapter_index = index,
                %url,
                versions = ?outcome.versions,
                active = ?outcome.active_version,
                "persisted chapter"
            );
            Ok(outcome)
        }
        Err(err) => {
            tracing::warn!(chapter_index = index, %url, error = %format!("{err:#}"), "failed to persist chapter");
            Err(SkipReason::Storage(format!("{err:#}")))
        }
    }
}

async fn write_chapter(store: &dyn ChapterStore, input: ChapterInput) -> anyhow::Result<PersistOutcome> {
    use anyhow::Context as _;

    store
        .put_chapter(&input.chapter)
        .await
        .context("put chapter")?;

    let mut versions = Vec::with_capacity(input.translations.len());
    for translation in &input.translations {
        let version = store
            .put_translation(translation.translation.clone())
            .await
            .context("put translation")?;
        versions.push(version);
    }

    let active_version = pick_active(&input.translations, &versions);
    if let Some(version) = active_version {
        store
            .set_active_translation(&input.chapter.url, version)
            .await
            .context("set active translation")?;
    }

    Ok(PersistOutcome {
        url: input.chapter.url,
        versions,
        active_version,
    })
}

use serde::{Deserialize, Deserializer, Serialize};

/// Accepted `metadata.format` tag family.
pub const SESSION_FORMAT_PREFIX: &str = "lexiconforge";

pub const DEFAULT_USAGE_PROVIDER: &str = "OpenRouter";
pub const DEFAULT_USAGE_MODEL: &str = "unknown-model";

pub fn is_supported_format(tag: &str) -> bool {
    tag.trim().starts_with(SESSION_FORMAT_PREFIX)
}

// Wire records, as written by session exports.

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub format: String,
    #[serde(default, deserialize_with = "lenient_u64")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chapter_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exported_at: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterRecord {
    #[serde(default)]
    pub stable_id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub canonical_url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub next_url: Option<String>,
    #[serde(default)]
    pub prev_url: Option<String>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub chapter_number: Option<u64>,
    #[serde(default)]
    pub fan_translation: Option<String>,
    #[serde(default)]
    pub translations: Option<Vec<TranslationRecord>>,
    /// Legacy single-translation shape.
    #[serde(default)]
    pub translation_result: Option<TranslationRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslationRecord {
    #[serde(default, deserialize_with = "lenient_u64")]
    pub version: Option<u64>,
    #[serde(default)]
    pub translated_title: Option<String>,
    #[serde(default)]
    pub translation: Option<String>,
    #[serde(default)]
    pub footnotes: Option<Vec<Footnote>>,
    #[serde(default)]
    pub suggested_illustrations: Option<Vec<SuggestedIllustration>>,
    #[serde(default)]
    pub usage_metrics: Option<WireUsageMetrics>,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireUsageMetrics {
    #[serde(default)]
    pub prompt_tokens: Option<f64>,
    #[serde(default)]
    pub completion_tokens: Option<f64>,
    #[serde(default)]
    pub total_tokens: Option<f64>,
    #[serde(default)]
    pub estimated_cost: Option<f64>,
    #[serde(default)]
    pub request_time: Option<f64>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Footnote {
    #[serde(default)]
    pub marker: String,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestedIllustration {
    #[serde(default)]
    pub placement_marker: String,
    #[serde(default)]
    pub image_prompt: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

// Canonical records, as held by a chapter store.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetrics {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub estimated_cost: f64,
    pub request_time: f64,
    pub provider: String,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredChapter {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stable_id: Option<String>,
    pub title: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chapter_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fan_translation: Option<String>,
    pub imported_at: String,
}

/// A normalized translation waiting for a version number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTranslation {
    pub chapter_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stable_id: Option<String>,
    /// Version carried by the export; `None` lets the store assign the next one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_version: Option<u32>,
    pub translated_title: String,
    pub translation: String,
    pub footnotes: Vec<Footnote>,
    pub suggested_illustrations: Vec<SuggestedIllustration>,
    pub usage_metrics: UsageMetrics,
    pub provider: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredTranslation {
    pub chapter_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stable_id: Option<String>,
    pub version: u32,
    pub translated_title: String,
    pub translation: String,
    pub footnotes: Vec<Footnote>,
    pub suggested_illustrations: Vec<SuggestedIllustration>,
    pub usage_metrics: UsageMetrics,
    pub provider: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub is_active: bool,
    pub created_at: String,
}

impl StoredTranslation {
    pub fn from_new(translation: NewTranslation, version: u32, created_at: String) -> Self {
        Self {
            chapter_url: translation.chapter_url,
            stable_id: translation.stable_id,
            version,
            translated_title: translation.translated_title,
            translation: translation.translation,
            footnotes: translation.footnotes,
            suggested_illustrations: translation.suggested_illustrations,
            usage_metrics: translation.usage_metrics,
            provider: translation.provider,
            model: translation.model,
            temperature: translation.temperature,
            system_prompt: translation.system_prompt,
            is_active: false,
            created_at,
        }
    }
}

/// Accepts integers, integral floats and numeric strings; anything else reads as absent.
fn lenient_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0 && f.fract() == 0.0)
                .map(|f| f as u64)
        }),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

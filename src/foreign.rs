//! Adapters for session documents written by other tools.
//!
//! Each adapter converts a foreign document into the canonical shape
//! (`metadata` + camelCase chapter objects) before persistence sees it.

use serde_json::{Map, Value, json};

use crate::error::ImportError;
use crate::formats::SessionMetadata;

/// A session document in canonical shape, fully materialized.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalSession {
    pub metadata: SessionMetadata,
    pub chapters: Vec<Value>,
    pub trailing: Map<String, Value>,
}

pub trait ForeignFormat: Send + Sync {
    fn name(&self) -> &'static str;

    fn detect(&self, root: &Map<String, Value>) -> bool;

    fn convert(&self, root: Map<String, Value>) -> Result<CanonicalSession, ImportError>;
}

pub fn builtin_formats() -> Vec<Box<dyn ForeignFormat>> {
    vec![Box::new(ScraperSessionFormat)]
}

/// Output of the browser scraping extension: snake_case chapter objects under
/// `chapters`, novel details under `novel`, and no `metadata` header.
///
/// ```json
/// { "novel": { "title": "..." }, "scraped_at": "...",
///   "chapters": [ { "url": "...", "title": "...", "content": "...",
///                   "chapter_number": 1, "next_url": "...", "prev_url": "..." } ] }
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct ScraperSessionFormat;

pub const SCRAPER_FORMAT_TAG: &str = "lexiconforge-scraper-import";

const SCRAPER_CHAPTER_KEYS: [&str; 5] = [
    "chapter_number",
    "next_url",
    "prev_url",
    "original_title",
    "translated_content",
];

impl ForeignFormat for ScraperSessionFormat {
    fn name(&self) -> &'static str {
        "scraper"
    }

    fn detect(&self, root: &Map<String, Value>) -> bool {
        if root.contains_key("metadata") {
            return false;
        }
        let Some(Value::Array(chapters)) = root.get("chapters") else {
            return false;
        };
        if root.contains_key("novel") || root.contains_key("scraped_at") {
            return true;
        }
        chapters.iter().take(5).any(|chapter| {
            chapter
                .as_object()
                .is_some_and(|c| SCRAPER_CHAPTER_KEYS.iter().any(|k| c.contains_key(*k)))
        })
    }

    fn convert(&self, mut root: Map<String, Value>) -> Result<CanonicalSession, ImportError> {
        let chapters = match root.remove("chapters") {
            Some(Value::Array(chapters)) => chapters,
            _ => {
                return Err(ImportError::InvalidFormat {
                    found: "scraper document without chapters".to_owned(),
                });
            }
        };
        let exported_at = root
            .remove("scraped_at")
            .and_then(|v| v.as_str().map(str::to_owned));

        let chapters = chapters
            .into_iter()
            .enumerate()
            .map(|(i, chapter)| convert_scraped_chapter(i, chapter))
            .collect::<Vec<_>>();

        Ok(CanonicalSession {
            metadata: SessionMetadata {
                format: SCRAPER_FORMAT_TAG.to_owned(),
                chapter_count: Some(chapters.len() as u64),
                exported_at,
            },
            chapters,
            trailing: root,
        })
    }
}

fn convert_scraped_chapter(index: usize, chapter: Value) -> Value {
    // Non-objects pass through and are skipped by persistence.
    let Value::Object(mut c) = chapter else {
        return chapter;
    };
    let mut take_str = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| c.remove(*k).filter(|v| v.is_string()))
            .unwrap_or(Value::Null)
    };

    let url = take_str(&["url", "source_url"]);
    let title = take_str(&["title", "original_title"]);
    let content = take_str(&["content", "text", "body"]);
    let next_url = take_str(&["next_url"]);
    let prev_url = take_str(&["prev_url"]);
    let translated_title = take_str(&["translated_title"]);
    let translation = take_str(&["translated_content", "translation"]);
    let chapter_number = c
        .remove("chapter_number")
        .filter(|v| !v.is_null())
        .unwrap_or_else(|| json!(index + 1));

    let mut out = Map::new();
    out.insert("url".to_owned(), url);
    out.insert("title".to_owned(), title);
    out.insert("content".to_owned(), content);
    out.insert("chapterNumber".to_owned(), chapter_number);
    if !next_url.is_null() {
        out.insert("nextUrl".to_owned(), next_url);
    }
    if !prev_url.is_null() {
        out.insert("prevUrl".to_owned(), prev_url);
    }
    if !translation.is_null() {
        out.insert(
            "translations".to_owned(),
            json!([{ "translatedTitle": translated_title, "translation": translation }]),
        );
    }
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn detects_scraper_documents_only() {
        let format = ScraperSessionFormat;
        assert!(format.detect(&object(json!({
            "novel": { "title": "N" },
            "chapters": []
        }))));
        assert!(format.detect(&object(json!({
            "chapters": [{ "url": "u", "chapter_number": 1 }]
        }))));
        assert!(!format.detect(&object(json!({
            "metadata": { "format": "lexiconforge-full-1" },
            "chapters": [{ "url": "u", "chapter_number": 1 }]
        }))));
        assert!(!format.detect(&object(json!({ "chapters": [{ "url": "u" }] }))));
    }

    #[test]
    fn converts_to_canonical_chapters() {
        let session = ScraperSessionFormat
            .convert(object(json!({
                "novel": { "title": "Dao" },
                "scraped_at": "2025-03-01T00:00:00Z",
                "chapters": [
                    {
                        "url": "https://n.example/1",
                        "title": "One",
                        "text": "raw one",
                        "next_url": "https://n.example/2",
                        "translated_title": "Uno",
                        "translated_content": "uno"
                    },
                    { "url": "https://n.example/2", "title": "Two", "content": "raw two", "chapter_number": 7 }
                ]
            })))
            .unwrap();

        assert_eq!(session.metadata.format, SCRAPER_FORMAT_TAG);
        assert_eq!(session.metadata.chapter_count, Some(2));
        assert_eq!(session.metadata.exported_at.as_deref(), Some("2025-03-01T00:00:00Z"));
        assert_eq!(session.trailing.get("novel"), Some(&json!({ "title": "Dao" })));

        let first = &session.chapters[0];
        assert_eq!(first["content"], "raw one");
        assert_eq!(first["chapterNumber"], 1);
        assert_eq!(first["nextUrl"], "https://n.example/2");
        assert_eq!(first["translations"][0]["translation"], "uno");
        assert_eq!(first["translations"][0]["translatedTitle"], "Uno");

        let second = &session.chapters[1];
        assert_eq!(second["chapterNumber"], 7);
        assert!(second.get("translations").is_none());
    }
}

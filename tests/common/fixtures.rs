use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::Stream;
use lexiconforge_import::{ImportError, ImportProgress, ProgressSink};
use serde_json::{Value, json};

pub const FORMAT: &str = "lexiconforge-full-1";

pub fn chapter_url(n: usize) -> String {
    format!("https://novel.example/ch/{n}")
}

pub fn chapter(n: usize) -> Value {
    json!({
        "stableId": format!("ch-{n}"),
        "url": chapter_url(n),
        "title": format!("Chapter {n}"),
        "content": format!("Original text of chapter {n}. \"Quoted\" [brackets] {{braces}}."),
        "chapterNumber": n,
        "nextUrl": chapter_url(n + 1),
        "prevUrl": if n > 1 { Value::String(chapter_url(n - 1)) } else { Value::Null },
        "translations": [{
            "version": 1,
            "translatedTitle": format!("Translated {n}"),
            "translation": format!("Translated text of chapter {n}."),
            "footnotes": [{ "marker": "[1]", "text": "note" }],
            "suggestedIllustrations": [],
            "usageMetrics": {
                "promptTokens": 100,
                "completionTokens": 50,
                "totalTokens": 150,
                "estimatedCost": 0.001,
                "requestTime": 1.5,
                "provider": "Gemini",
                "model": "gemini-2.5-flash"
            },
            "isActive": true
        }]
    })
}

pub fn numbered_chapters(count: usize) -> Vec<Value> {
    (1..=count).map(chapter).collect()
}

/// Serializes a session with `metadata` first, as exports write it.
pub fn session_with(format: &str, chapters: &[Value]) -> Vec<u8> {
    let metadata = json!({
        "format": format,
        "chapterCount": chapters.len(),
        "exportedAt": "2026-01-01T00:00:00Z"
    });
    let chapters = chapters
        .iter()
        .map(Value::to_string)
        .collect::<Vec<_>>()
        .join(",");
    format!(
        r#"{{"metadata":{metadata},"chapters":[{chapters}],"navigationHistory":["{}"]}}"#,
        chapter_url(1)
    )
    .into_bytes()
}

pub fn session(chapters: &[Value]) -> Vec<u8> {
    session_with(FORMAT, chapters)
}

pub fn chunked(bytes: &[u8], size: usize) -> impl Stream<Item = Result<Vec<u8>, ImportError>> {
    let chunks = bytes
        .chunks(size)
        .map(|chunk| Ok(chunk.to_vec()))
        .collect::<Vec<_>>();
    futures::stream::iter(chunks)
}

/// Collects every progress snapshot and counts milestone callbacks.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    snapshots: Arc<Mutex<Vec<ImportProgress>>>,
    milestones: Arc<AtomicUsize>,
}

impl Recorder {
    pub fn sink(&self) -> ProgressSink {
        let snapshots = Arc::clone(&self.snapshots);
        let milestones = Arc::clone(&self.milestones);
        ProgressSink::new()
            .on_progress(move |p| snapshots.lock().expect("lock snapshots").push(p))
            .on_first_chapters_ready(move || {
                milestones.fetch_add(1, Ordering::SeqCst);
            })
    }

    pub fn snapshots(&self) -> Vec<ImportProgress> {
        self.snapshots.lock().expect("lock snapshots").clone()
    }

    pub fn milestone_count(&self) -> usize {
        self.milestones.load(Ordering::SeqCst)
    }
}

use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::cli::{ChaptersArgs, ImportArgs, ImportFileArgs, ImportOptions};
use crate::config::ImportConfig;
use crate::error::ImportError;
use crate::import::{SessionData, SessionImporter};
use crate::progress::{ImportProgress, ProgressSink};
use crate::store::{ChapterStore, LocalFsChapterStore};

pub async fn import(args: ImportArgs) -> anyhow::Result<()> {
    let importer = build_importer(&args.options)?;
    let cancel = cancel_on_interrupt();
    let sink = progress_sink(args.options.progress_json);

    let result = if args.buffered {
        importer.import_from_url(&args.url, sink, &cancel).await
    } else {
        importer.import_url(&args.url, sink, &cancel).await
    };
    let data = result.map_err(with_reason)?;
    print_summary(&data, args.options.progress_json)
}

pub async fn import_file(args: ImportFileArgs) -> anyhow::Result<()> {
    let importer = build_importer(&args.options)?;
    let cancel = cancel_on_interrupt();
    let sink = progress_sink(args.options.progress_json);

    let data = importer
        .import_from_file(&args.file, sink, &cancel)
        .await
        .map_err(with_reason)?;
    print_summary(&data, args.options.progress_json)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChapterLine {
    url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    chapter_number: Option<u64>,
    title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    active_version: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    translated_title: Option<String>,
    versions: usize,
}

pub async fn chapters(args: ChaptersArgs) -> anyhow::Result<()> {
    let store = LocalFsChapterStore::new(&args.store);
    let chapters = store.list_chapters().await.context("list chapters")?;

    for chapter in chapters {
        let translations = store
            .list_translations(&chapter.url)
            .await
            .with_context(|| format!("list translations: {}", chapter.url))?;
        let active = translations.iter().find(|t| t.is_active);
        let line = ChapterLine {
            chapter_number: chapter.chapter_number,
            title: chapter.title,
            active_version: active.map(|t| t.version),
            translated_title: active.map(|t| t.translated_title.clone()),
            versions: translations.len(),
            url: chapter.url,
        };

        let mut stdout = std::io::stdout().lock();
        if args.json {
            let json = serde_json::to_string(&line).context("serialize chapter line")?;
            writeln!(stdout, "{json}").context("write stdout")?;
        } else {
            let number = line
                .chapter_number
                .map_or_else(|| "-".to_owned(), |n| n.to_string());
            let active = line
                .active_version
                .map_or_else(|| "-".to_owned(), |v| format!("v{v}"));
            writeln!(
                stdout,
                "{number}\t{active}\t{}\t{}",
                line.url,
                line.translated_title.as_deref().unwrap_or(&line.title)
            )
            .context("write stdout")?;
        }
    }
    Ok(())
}

fn build_importer(options: &ImportOptions) -> anyhow::Result<SessionImporter> {
    let mut config = ImportConfig::from_env().context("load import config")?;
    if let Some(max_retries) = options.max_retries {
        config.max_retries = max_retries;
    }
    if let Some(ms) = options.retry_delay_ms {
        config.retry_base_delay = Duration::from_millis(ms);
    }
    if let Some(secs) = options.timeout_secs {
        if secs == 0 {
            anyhow::bail!("--timeout-secs must be > 0");
        }
        config.request_timeout = Duration::from_secs(secs);
    }
    if let Some(threshold) = options.first_chapters {
        config.first_chapters_threshold = threshold;
    }
    tracing::debug!(?config, store = %options.store.display(), "import config");

    std::fs::create_dir_all(&options.store)
        .with_context(|| format!("create store dir: {}", options.store.display()))?;
    let store: Arc<dyn ChapterStore> = Arc::new(LocalFsChapterStore::new(&options.store));
    SessionImporter::new(config, store).context("create importer")
}

fn progress_sink(progress_json: bool) -> ProgressSink {
    if progress_json {
        ProgressSink::new()
            .on_progress(|progress| print_json_line(&progress))
            .on_first_chapters_ready(|| {
                print_json_line(&serde_json::json!({ "event": "firstChaptersReady" }))
            })
    } else {
        ProgressSink::new().on_progress(|progress: ImportProgress| {
            tracing::debug!(
                stage = ?progress.stage,
                progress = progress.progress,
                "{}",
                progress.message
            );
        })
    }
}

fn print_json_line<T: Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(json) => {
            let mut stdout = std::io::stdout().lock();
            if let Err(err) = writeln!(stdout, "{json}") {
                tracing::warn!(error = %err, "failed to write progress line");
            }
        }
        Err(err) => tracing::warn!(error = %err, "failed to serialize progress line"),
    }
}

fn print_summary(data: &SessionData, json: bool) -> anyhow::Result<()> {
    if json {
        let line = serde_json::json!({ "event": "summary", "session": data });
        let json = serde_json::to_string(&line).context("serialize summary")?;
        println!("{json}");
        return Ok(());
    }

    println!(
        "imported {} chapters ({} translations) from {}",
        data.chapters_persisted, data.translations_persisted, data.metadata.format
    );
    for skipped in &data.skipped {
        println!("skipped chapter #{}: {}", skipped.index, skipped.detail);
    }
    Ok(())
}

fn with_reason(err: ImportError) -> anyhow::Error {
    let reason = err.reason();
    anyhow::Error::new(err).context(format!("session import failed [{reason}]"))
}

fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; cancelling import");
            token.cancel();
        }
    });
    cancel
}

use std::future::Future;
use std::time::Duration;

use futures::{Stream, StreamExt as _};
use reqwest::header::{ACCEPT, USER_AGENT};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::ImportConfig;
use crate::error::ImportError;
use crate::progress::ProgressTracker;

const USER_AGENT_VALUE: &str = concat!("lexiconforge-import/", env!("CARGO_PKG_VERSION"));

/// Rewrites known "view" links into URLs that return the raw session bytes.
///
/// - `github.com/<owner>/<repo>/blob/<ref>/<path>` becomes the
///   `raw.githubusercontent.com` equivalent.
/// - Shared-drive file links become the API media endpoint when an API key is
///   configured, otherwise the anonymous download form (which may be blocked
///   by cross-origin rules in browsers; it works from native clients).
pub fn normalize_source_url(raw: &str, drive_api_key: Option<&str>) -> Result<Url, ImportError> {
    let url = Url::parse(raw.trim()).map_err(|err| ImportError::InvalidUrl {
        url: raw.to_owned(),
        detail: err.to_string(),
    })?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ImportError::InvalidUrl {
            url: raw.to_owned(),
            detail: "must be http/https".to_owned(),
        });
    }

    match url.host_str() {
        Some("github.com") | Some("www.github.com") => Ok(github_raw_url(&url).unwrap_or(url)),
        Some("drive.google.com") => match drive_file_id(&url) {
            Some(id) => drive_download_url(&id, drive_api_key),
            None => Ok(url),
        },
        _ => Ok(url),
    }
}

fn github_raw_url(url: &Url) -> Option<Url> {
    let segments = url.path_segments()?.collect::<Vec<_>>();
    let [owner, repo, kind, rest @ ..] = segments.as_slice() else {
        return None;
    };
    if (*kind != "blob" && *kind != "raw") || rest.len() < 2 {
        return None;
    }
    let raw = format!(
        "https://raw.githubusercontent.com/{owner}/{repo}/{}",
        rest.join("/")
    );
    Url::parse(&raw).ok()
}

fn drive_file_id(url: &Url) -> Option<String> {
    let segments = url.path_segments()?.collect::<Vec<_>>();
    if let Some(pos) = segments.iter().position(|s| *s == "d")
        && let Some(id) = segments.get(pos + 1)
        && !id.is_empty()
    {
        return Some((*id).to_owned());
    }
    url.query_pairs()
        .find(|(key, value)| key == "id" && !value.is_empty())
        .map(|(_, value)| value.into_owned())
}

fn drive_download_url(file_id: &str, api_key: Option<&str>) -> Result<Url, ImportError> {
    let mut url = match api_key {
        Some(_) => Url::parse(&format!("https://www.googleapis.com/drive/v3/files/{file_id}")),
        None => Url::parse("https://drive.google.com/uc"),
    }
    .map_err(|err| ImportError::InvalidUrl {
        url: file_id.to_owned(),
        detail: err.to_string(),
    })?;
    match api_key {
        Some(key) => {
            url.query_pairs_mut()
                .append_pair("alt", "media")
                .append_pair("key", key);
        }
        None => {
            url.query_pairs_mut()
                .append_pair("export", "download")
                .append_pair("id", file_id);
        }
    }
    Ok(url)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ImportConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.retry_base_delay,
        }
    }

    /// Delay before retry number `retry` (1-based): base, 2x base, 4x base, ...
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// retry budget is spent. `on_retry(retry, delay, cause)` runs before each
/// backoff sleep.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
    mut on_retry: impl FnMut(u32, Duration, &ImportError),
) -> Result<T, ImportError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ImportError>>,
{
    let mut retries = 0u32;
    loop {
        let attempt = retries + 1;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ImportError::Cancelled),
            result = op(attempt) => result,
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() => err,
            Err(err) => return Err(err),
        };

        if retries >= policy.max_retries {
            return Err(ImportError::RetriesExhausted {
                attempts: attempt,
                last: Box::new(err),
            });
        }

        retries += 1;
        let delay = policy.delay_for(retries);
        tracing::warn!(
            attempt = retries,
            max_retries = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "fetch failed; retrying"
        );
        on_retry(retries, delay, &err);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ImportError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

pub fn build_http_client() -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()
        .map_err(|err| anyhow::anyhow!("build http client: {err}"))
}

/// One request: waits at most `request_timeout` for the response head,
/// then rejects error statuses and oversized bodies.
pub async fn fetch_once(
    client: &reqwest::Client,
    url: &Url,
    config: &ImportConfig,
) -> Result<reqwest::Response, ImportError> {
    let request = client
        .get(url.clone())
        .header(USER_AGENT, USER_AGENT_VALUE)
        .header(ACCEPT, "application/json,*/*;q=0.8")
        .send();

    let response = match tokio::time::timeout(config.request_timeout, request).await {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => return Err(classify_error(url.as_str(), &err, config.request_timeout)),
        Err(_) => {
            return Err(ImportError::Timeout {
                url: url.to_string(),
                timeout_secs: config.request_timeout.as_secs(),
            });
        }
    };

    let status = response.status();
    if !status.is_success() {
        return Err(ImportError::HttpStatus {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    if let Some(length) = response.content_length()
        && length > config.max_content_length
    {
        return Err(ImportError::TooLarge {
            limit: config.max_content_length,
            actual: length,
        });
    }

    Ok(response)
}

/// [`fetch_once`] under the configured retry policy, reporting each retry
/// through `tracker`.
pub async fn fetch_with_retry(
    client: &reqwest::Client,
    url: &Url,
    config: &ImportConfig,
    tracker: &mut ProgressTracker,
    cancel: &CancellationToken,
) -> Result<reqwest::Response, ImportError> {
    let policy = RetryPolicy::from_config(config);
    tracing::info!(%url, max_retries = policy.max_retries, "fetching session");
    retry_with_backoff(
        policy,
        cancel,
        |attempt| {
            tracing::debug!(%url, attempt, "fetch attempt");
            fetch_once(client, url, config)
        },
        |retry, delay, cause| tracker.retrying(retry, policy.max_retries, delay, cause),
    )
    .await
}

pub fn classify_error(url: &str, err: &reqwest::Error, timeout: Duration) -> ImportError {
    if err.is_timeout() {
        return ImportError::Timeout {
            url: url.to_owned(),
            timeout_secs: timeout.as_secs(),
        };
    }
    if is_connection_reset(err) {
        return ImportError::ConnectionReset {
            url: url.to_owned(),
        };
    }
    if err.is_builder() {
        return ImportError::InvalidUrl {
            url: url.to_owned(),
            detail: error_chain(err),
        };
    }
    ImportError::Network {
        url: url.to_owned(),
        detail: error_chain(err),
    }
}

fn is_connection_reset(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(io) = err.downcast_ref::<std::io::Error>()
            && matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            )
        {
            return true;
        }
        current = err.source();
    }
    false
}

fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut current = err.source();
    while let Some(source) = current {
        out.push_str(": ");
        out.push_str(&source.to_string());
        current = source.source();
    }
    out
}

/// Response body as a stream of chunks with transfer errors classified.
pub fn body_stream(
    response: reqwest::Response,
    timeout: Duration,
) -> impl Stream<Item = Result<impl AsRef<[u8]>, ImportError>> + Send {
    let url = response.url().to_string();
    response
        .bytes_stream()
        .map(move |chunk| chunk.map_err(|err| classify_error(&url, &err, timeout)))
}

/// Reads a whole body into memory, enforcing the size cap as bytes arrive.
pub async fn read_body_capped(
    response: reqwest::Response,
    config: &ImportConfig,
    tracker: &mut ProgressTracker,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, ImportError> {
    let total = response.content_length();
    let url = response.url().to_string();
    let mut body = Vec::with_capacity(total.unwrap_or(0).min(config.max_content_length) as usize);
    let stream = body_stream(response, config.request_timeout);
    let mut stream = std::pin::pin!(stream);

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ImportError::Cancelled),
            next = tokio::time::timeout(config.request_timeout, stream.next()) => next,
        };
        let chunk = match next {
            Ok(Some(chunk)) => chunk?,
            Ok(None) => break,
            Err(_) => {
                return Err(ImportError::Timeout {
                    url,
                    timeout_secs: config.request_timeout.as_secs(),
                });
            }
        };
        let chunk = chunk.as_ref();
        let loaded = body.len() as u64 + chunk.len() as u64;
        if loaded > config.max_content_length {
            return Err(ImportError::TooLarge {
                limit: config.max_content_length,
                actual: loaded,
            });
        }
        body.extend_from_slice(chunk);
        tracker.download_progress(loaded, total);
    }

    Ok(body)
}

//! Watch-state persistence, settings loading, and HTTP fetch utilities for
//! pagewatch.

use std::path::{Path, PathBuf};
use std::time::Duration;

use pw_core::{WatchSettings, WatchState};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::info_span;

pub const CRATE_NAME: &str = "pw-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("reading state file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("writing state file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("decoding state file {path}: {source}")]
    Decode {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("encoding state: {0}")]
    Encode(serde_json::Error),
}

/// File-backed fingerprint store. The whole map is replaced on every write
/// via a temp file and an atomic rename, so readers never observe a partial
/// record; the internal mutex serializes read-modify-write cycles across
/// concurrent callers.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the full map of records. A missing file is an empty state, not an
    /// error.
    pub async fn load(&self) -> Result<WatchState, StoreError> {
        match fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StoreError::Decode {
                path: self.path.clone(),
                source,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(WatchState::default()),
            Err(source) => Err(StoreError::Read {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Atomic read-modify-write: apply `mutate` to the current state and
    /// persist the result as one whole-map replace. Returns the state as
    /// persisted.
    pub async fn update<F>(&self, mutate: F) -> Result<WatchState, StoreError>
    where
        F: FnOnce(&mut WatchState),
    {
        let _guard = self.write_lock.lock().await;
        let mut state = self.load().await?;
        mutate(&mut state);
        self.persist(&state).await?;
        Ok(state)
    }

    async fn persist(&self, state: &WatchState) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(state).map_err(StoreError::Encode)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|source| StoreError::Write {
                        path: parent.to_path_buf(),
                        source,
                    })?;
            }
        }

        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, &bytes)
            .await
            .map_err(|source| StoreError::Write {
                path: temp_path.clone(),
                source,
            })?;
        fs::rename(&temp_path, &self.path)
            .await
            .map_err(|source| StoreError::Write {
                path: self.path.clone(),
                source,
            })
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("reading settings file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("writing settings file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("encoding settings: {0}")]
    Encode(serde_yaml::Error),
}

/// Load `watch.yaml`-style settings. A missing file yields defaults so a
/// fresh deployment starts with polling enabled and an empty watch list.
pub async fn load_settings(path: impl AsRef<Path>) -> Result<WatchSettings, SettingsError> {
    let path = path.as_ref();
    match fs::read_to_string(path).await {
        Ok(text) => serde_yaml::from_str(&text).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(WatchSettings::default()),
        Err(source) => Err(SettingsError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

pub async fn save_settings(
    path: impl AsRef<Path>,
    settings: &WatchSettings,
) -> Result<(), SettingsError> {
    let path = path.as_ref();
    let text = serde_yaml::to_string(settings).map_err(SettingsError::Encode)?;
    fs::write(path, text)
        .await
        .map_err(|source| SettingsError::Write {
            path: path.to_path_buf(),
            source,
        })
}

/// Apply `PAGEWATCH_*` environment overrides on top of file-backed settings.
pub fn settings_with_env_overrides(mut settings: WatchSettings) -> WatchSettings {
    if let Ok(value) = std::env::var("PAGEWATCH_IDENTIFIERS") {
        settings.identifiers = value
            .split([',', ' '])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect();
    }
    if let Some(minutes) = std::env::var("PAGEWATCH_INTERVAL_MINUTES")
        .ok()
        .and_then(|v| v.parse().ok())
    {
        settings.interval_minutes = minutes;
    }
    if let Ok(value) = std::env::var("PAGEWATCH_POLLING_ENABLED") {
        settings.polling_enabled = matches!(value.as_str(), "1" | "true" | "TRUE" | "True");
    }
    if let Ok(value) = std::env::var("PAGEWATCH_URL_TEMPLATE") {
        settings.page_url_template = value;
    }
    settings
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("building http client: {0}")]
    Client(reqwest::Error),
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Thin retrying GET client. The poll scheduler is strictly sequential, so
/// there is never more than one fetch in flight and no concurrency limiting
/// is needed here.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().map_err(FetchError::Client)?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_text(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let span = info_span!("http_fetch", url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.text().await?;
                        return Ok(FetchedPage {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

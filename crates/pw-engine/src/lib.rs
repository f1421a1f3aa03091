//! Change detection and poll orchestration for pagewatch: the change
//! detector, the single-flight poll scheduler, the notifier seam, scheduled
//! wakeups, and the bounded activity log.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use pw_capture::{
    acquire, sanitize_markup_for_hashing, sanitize_markup_for_preview, sanitize_text, Acquisition,
    CaptureConfig, CaptureMessage, DefaultContentProbe, HttpRenderHost, RenderHost,
};
use pw_core::{
    truncate_chars, CheckStatus, CycleEvent, CycleSummary, FingerprintRecord, WatchSettings,
    PREVIEW_MAX_CHARS,
};
use pw_storage::{
    load_settings, settings_with_env_overrides, HttpClientConfig, HttpFetcher, StateStore,
    StoreError,
};

pub const CRATE_NAME: &str = "pw-engine";

pub const DEFAULT_INTER_ITEM_DELAY: Duration = Duration::from_millis(200);
pub const DEFAULT_HEARTBEAT_PERIOD: Duration = Duration::from_secs(25);
pub const IMMEDIATE_POKE_DELAY: Duration = Duration::from_secs(5);
pub const ACTIVITY_LOG_CAPACITY: usize = 100;

pub const RECURRING_WAKEUP: &str = "watch-poll";
pub const IMMEDIATE_WAKEUP: &str = "watch-poll-now";
pub const HEARTBEAT_WAKEUP: &str = "heartbeat";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub settings_path: PathBuf,
    pub state_path: PathBuf,
    pub inter_item_delay: Duration,
    pub heartbeat_period: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            settings_path: PathBuf::from("watch.yaml"),
            state_path: PathBuf::from("state/watch-state.json"),
            inter_item_delay: DEFAULT_INTER_ITEM_DELAY,
            heartbeat_period: DEFAULT_HEARTBEAT_PERIOD,
        }
    }
}

/// Alert seam. A failed notification must never fail the check, so callers
/// log errors from this and move on. How repeat changes are deduplicated
/// across cycles is up to the implementation.
#[async_trait]
pub trait ChangeNotifier: Send + Sync {
    async fn change_detected(
        &self,
        identifier: &str,
        title: &str,
        preview: &str,
        url: &str,
    ) -> anyhow::Result<()>;
}

/// Default notifier: a structured log line per detected change.
pub struct LogNotifier;

#[async_trait]
impl ChangeNotifier for LogNotifier {
    async fn change_detected(
        &self,
        identifier: &str,
        title: &str,
        preview: &str,
        url: &str,
    ) -> anyhow::Result<()> {
        info!(identifier, title, url, preview, "page changed");
        Ok(())
    }
}

pub fn digest_hex(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

fn origin_of(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) => parsed.origin().ascii_serialization(),
        Err(_) => url.to_string(),
    }
}

/// Compares a fresh capture against the stored baseline and applies the
/// resulting record transition as one atomic write.
pub struct ChangeDetector {
    store: Arc<StateStore>,
    notifier: Arc<dyn ChangeNotifier>,
}

impl ChangeDetector {
    pub fn new(store: Arc<StateStore>, notifier: Arc<dyn ChangeNotifier>) -> Self {
        Self { store, notifier }
    }

    /// Record a check attempt that produced no usable content (timeout,
    /// failure, NO_CONTENT). The baseline is left untouched.
    pub async fn record_attempt(
        &self,
        identifier: &str,
        status: &CheckStatus,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        self.store
            .update(|state| {
                let record = state.records.entry(identifier.to_string()).or_default();
                record.last_check_at = Some(now);
                record.last_status = Some(status.clone());
            })
            .await?;
        Ok(())
    }

    pub async fn ingest(
        &self,
        capture: &CaptureMessage,
        page_url: &str,
    ) -> Result<CheckStatus, StoreError> {
        let identifier = capture.identifier.clone();
        let now = Utc::now();

        let text = sanitize_text(&capture.text);
        if text.is_empty() {
            let status = CheckStatus::no_content();
            self.record_attempt(&identifier, &status).await?;
            return Ok(status);
        }

        // The digest source of truth is the canonicalized markup; the
        // sanitized text feeds previews, notes, and the diff view only.
        let hash = digest_hex(&sanitize_markup_for_hashing(&capture.markup));
        let preview_markup = sanitize_markup_for_preview(&capture.markup, &origin_of(page_url));

        let mut status = CheckStatus::success(false, &text);
        let mut notify = false;
        self.store
            .update(|state| {
                let record = state.records.entry(identifier.clone()).or_default();
                let changed = record
                    .content_hash
                    .as_deref()
                    .is_some_and(|prev| prev != hash);
                if changed {
                    record.prev_snapshot_text = std::mem::take(&mut record.last_snapshot_text);
                    record.prev_snapshot_markup = std::mem::take(&mut record.last_snapshot_markup);
                    record.last_change_at = Some(now);
                }
                record.last_snapshot_text = text.clone();
                record.last_snapshot_markup = preview_markup.clone();
                record.content_hash = Some(hash.clone());
                record.last_check_at = Some(now);
                status.changed = changed;
                record.last_status = Some(status.clone());
                notify = changed;
            })
            .await?;

        if notify {
            let title = if capture.title.trim().is_empty() {
                format!("Incident {identifier}")
            } else {
                capture.title.clone()
            };
            let preview = truncate_chars(&text, PREVIEW_MAX_CHARS);
            if let Err(err) = self
                .notifier
                .change_detected(&identifier, &title, &preview, page_url)
                .await
            {
                warn!(identifier = identifier.as_str(), error = %err, "change notification failed");
            }
        }

        Ok(status)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivityEntry {
    pub at: DateTime<Utc>,
    pub line: String,
}

/// Bounded newest-first history of cycle and per-identifier outcomes.
#[derive(Debug, Default)]
pub struct ActivityLog {
    entries: Mutex<VecDeque<ActivityEntry>>,
}

impl ActivityLog {
    pub fn record(&self, line: impl Into<String>) {
        let mut entries = self.entries.lock().expect("activity log lock");
        entries.push_front(ActivityEntry {
            at: Utc::now(),
            line: line.into(),
        });
        entries.truncate(ACTIVITY_LOG_CAPACITY);
    }

    pub fn entries(&self) -> Vec<ActivityEntry> {
        self.entries
            .lock()
            .expect("activity log lock")
            .iter()
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerStatus {
    Idle,
    Running,
    Cancelling,
}

/// Merged settings + fingerprint snapshot for observers.
#[derive(Debug, Clone, Serialize)]
pub struct WatchStateView {
    pub status: SchedulerStatus,
    pub settings: WatchSettings,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub records: BTreeMap<String, FingerprintRecord>,
}

/// The poll scheduler plus its collaborators. At most one cycle runs at a
/// time; a start request while one is active is a silent no-op.
pub struct WatchEngine {
    config: EngineConfig,
    store: Arc<StateStore>,
    host: Arc<dyn RenderHost>,
    detector: ChangeDetector,
    activity: Arc<ActivityLog>,
    events: broadcast::Sender<CycleEvent>,
    status: Mutex<SchedulerStatus>,
    cancel_requested: AtomicBool,
}

impl WatchEngine {
    pub fn new(
        config: EngineConfig,
        host: Arc<dyn RenderHost>,
        notifier: Arc<dyn ChangeNotifier>,
    ) -> Self {
        let store = Arc::new(StateStore::new(config.state_path.clone()));
        let (events, _) = broadcast::channel(64);
        Self {
            detector: ChangeDetector::new(Arc::clone(&store), notifier),
            store,
            host,
            activity: Arc::new(ActivityLog::default()),
            events,
            status: Mutex::new(SchedulerStatus::Idle),
            cancel_requested: AtomicBool::new(false),
            config,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CycleEvent> {
        self.events.subscribe()
    }

    pub fn activity_entries(&self) -> Vec<ActivityEntry> {
        self.activity.entries()
    }

    pub fn status(&self) -> SchedulerStatus {
        *self.status.lock().expect("scheduler status lock")
    }

    /// Cooperative: takes effect at the next identifier boundary. Results of
    /// already-completed identifiers stand.
    pub fn request_cancel(&self) {
        let mut status = self.status.lock().expect("scheduler status lock");
        if *status == SchedulerStatus::Running {
            *status = SchedulerStatus::Cancelling;
            self.cancel_requested.store(true, Ordering::SeqCst);
            info!("cycle cancellation requested");
            self.activity.record("cycle cancellation requested");
        }
    }

    pub fn emit_tick(&self, name: &str) {
        self.emit(CycleEvent::Tick {
            name: name.to_string(),
            at: Utc::now(),
        });
    }

    pub async fn state_view(&self) -> anyhow::Result<WatchStateView> {
        let settings = self.load_effective_settings().await?;
        let state = self.store.load().await?;
        Ok(WatchStateView {
            status: self.status(),
            settings,
            last_cycle_at: state.last_cycle_at,
            records: state.records,
        })
    }

    pub async fn record(&self, identifier: &str) -> Result<FingerprintRecord, StoreError> {
        Ok(self.store.load().await?.record(identifier))
    }

    pub async fn load_effective_settings(&self) -> anyhow::Result<WatchSettings> {
        let settings = load_settings(&self.config.settings_path)
            .await
            .context("loading watch settings")?;
        Ok(settings_with_env_overrides(settings))
    }

    /// Run one full poll cycle. Returns `Ok(None)` when a cycle was already
    /// running, polling is disabled, or nothing is configured to watch.
    /// Per-identifier failures are local; storage failures abort the cycle.
    pub async fn run_cycle(&self) -> anyhow::Result<Option<CycleSummary>> {
        if !self.try_begin() {
            debug!("poll cycle already running; start request ignored");
            return Ok(None);
        }
        let outcome = self.cycle_body().await;
        self.finish();
        outcome
    }

    fn try_begin(&self) -> bool {
        let mut status = self.status.lock().expect("scheduler status lock");
        if *status != SchedulerStatus::Idle {
            return false;
        }
        *status = SchedulerStatus::Running;
        self.cancel_requested.store(false, Ordering::SeqCst);
        true
    }

    fn finish(&self) {
        *self.status.lock().expect("scheduler status lock") = SchedulerStatus::Idle;
        self.cancel_requested.store(false, Ordering::SeqCst);
    }

    async fn cycle_body(&self) -> anyhow::Result<Option<CycleSummary>> {
        let settings = self.load_effective_settings().await?;
        if !settings.polling_enabled {
            debug!("polling disabled; skipping cycle");
            return Ok(None);
        }
        let identifiers = settings.normalized_identifiers();
        if identifiers.is_empty() {
            debug!("no identifiers configured; skipping cycle");
            return Ok(None);
        }

        let cycle_id = Uuid::new_v4();
        let started_at = Utc::now();
        let capture_config = capture_config_from(&settings);

        info!(%cycle_id, count = identifiers.len(), "poll cycle started");
        self.activity.record(format!(
            "cycle started ({} identifiers)",
            identifiers.len()
        ));
        self.emit(CycleEvent::Started {
            cycle_id,
            identifiers: identifiers.clone(),
        });

        let heartbeat = self.spawn_heartbeat();
        let result = self
            .check_all(cycle_id, &settings, &identifiers, &capture_config)
            .await;
        heartbeat.abort();

        let (checked, changed_count, cancelled) = match result {
            Ok(counts) => counts,
            Err(err) => {
                self.activity.record(format!("cycle aborted: {err:#}"));
                return Err(err);
            }
        };

        let finished_at = Utc::now();
        self.store
            .update(|state| state.last_cycle_at = Some(finished_at))
            .await
            .context("recording cycle end time")?;

        self.activity.record(if cancelled {
            format!("cycle cancelled after {checked} checks, {changed_count} changed")
        } else {
            format!("cycle completed, {changed_count} changed")
        });
        self.emit(CycleEvent::Completed {
            cycle_id,
            changed_count,
            cancelled,
            at: finished_at,
        });
        info!(%cycle_id, changed_count, cancelled, "poll cycle finished");

        Ok(Some(CycleSummary {
            cycle_id,
            started_at,
            finished_at,
            checked,
            changed_count,
            cancelled,
        }))
    }

    async fn check_all(
        &self,
        cycle_id: Uuid,
        settings: &WatchSettings,
        identifiers: &[String],
        capture_config: &CaptureConfig,
    ) -> anyhow::Result<(usize, usize, bool)> {
        let mut checked = 0usize;
        let mut changed_count = 0usize;
        let mut cancelled = false;

        for (index, identifier) in identifiers.iter().enumerate() {
            if self.cancel_requested.load(Ordering::SeqCst) {
                cancelled = true;
                break;
            }

            let url = settings.page_url(identifier);
            let span = info_span!("check", %cycle_id, identifier = identifier.as_str());
            let status = self
                .check_one(identifier, &url, capture_config)
                .instrument(span)
                .await
                .with_context(|| format!("persisting check result for {identifier}"))?;

            checked += 1;
            if status.changed {
                changed_count += 1;
            }
            self.activity
                .record(format!("{identifier}: {}", describe_status(&status)));
            self.emit(CycleEvent::ItemChecked {
                cycle_id,
                identifier: identifier.clone(),
                status,
            });

            // Give the render host a breather between sessions.
            if index + 1 < identifiers.len() {
                tokio::time::sleep(self.config.inter_item_delay).await;
            }
        }

        Ok((checked, changed_count, cancelled))
    }

    async fn check_one(
        &self,
        identifier: &str,
        url: &str,
        capture_config: &CaptureConfig,
    ) -> Result<CheckStatus, StoreError> {
        match acquire(self.host.as_ref(), identifier, url, capture_config).await {
            Acquisition::Captured(message) => {
                if message.identifier != identifier {
                    let status =
                        CheckStatus::handle_error("capture does not match the pending identifier");
                    self.detector.record_attempt(identifier, &status).await?;
                    return Ok(status);
                }
                self.detector.ingest(&message, url).await
            }
            Acquisition::TimedOut => {
                warn!(identifier, "acquisition timed out");
                let status = CheckStatus::timeout();
                self.detector.record_attempt(identifier, &status).await?;
                Ok(status)
            }
            Acquisition::Failed { detail } => {
                warn!(identifier, %detail, "acquisition failed");
                let status = CheckStatus::error(&detail);
                self.detector.record_attempt(identifier, &status).await?;
                Ok(status)
            }
        }
    }

    /// Keep-alive tick for hosts that suspend idle background processes.
    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let events = self.events.clone();
        let period = self.config.heartbeat_period;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let _ = events.send(CycleEvent::Tick {
                    name: HEARTBEAT_WAKEUP.to_string(),
                    at: Utc::now(),
                });
            }
        })
    }

    fn emit(&self, event: CycleEvent) {
        let _ = self.events.send(event);
    }
}

fn describe_status(status: &CheckStatus) -> String {
    if status.ok {
        if status.changed {
            "changed".to_string()
        } else {
            "unchanged".to_string()
        }
    } else if status.is_inconclusive() {
        "no content yet".to_string()
    } else {
        format!("failed ({})", status.note)
    }
}

fn capture_config_from(settings: &WatchSettings) -> CaptureConfig {
    let mut config = CaptureConfig::default();
    if let Some(secs) = settings.capture_ceiling_secs {
        config.ceiling = Duration::from_secs(secs);
    }
    if let Some(secs) = settings.readiness_timeout_secs {
        config.readiness.timeout = Duration::from_secs(secs);
    }
    if let Some(ms) = settings.quiet_period_ms {
        config.readiness.quiet_period = Duration::from_millis(ms);
    }
    config
}

/// Convenience constructor wiring the HTTP render host and the default
/// probe/notifier, for the CLI and the web server.
pub fn http_engine(config: EngineConfig) -> anyhow::Result<Arc<WatchEngine>> {
    let fetcher = HttpFetcher::new(HttpClientConfig {
        user_agent: Some("pagewatch/0.1".to_string()),
        ..HttpClientConfig::default()
    })
    .context("building http fetcher")?;
    let host = Arc::new(HttpRenderHost::new(
        fetcher,
        Arc::new(DefaultContentProbe::default()),
    ));
    Ok(Arc::new(WatchEngine::new(config, host, Arc::new(LogNotifier))))
}

// ---------------------------------------------------------------------------
// Scheduled wakeups

/// Recurring + one-shot wakeups that trigger poll cycles. Re-arm with
/// `set_interval` when the configured period changes; `poke_soon` mirrors the
/// near-immediate check after a settings save.
pub struct WakeupSchedule {
    scheduler: JobScheduler,
    engine: Arc<WatchEngine>,
    recurring_job: Option<Uuid>,
}

impl WakeupSchedule {
    pub async fn start(engine: Arc<WatchEngine>, interval_minutes: u32) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new()
            .await
            .context("creating wakeup scheduler")?;
        let mut schedule = Self {
            scheduler,
            engine,
            recurring_job: None,
        };
        schedule.set_interval(interval_minutes).await?;
        schedule
            .scheduler
            .start()
            .await
            .context("starting wakeup scheduler")?;
        Ok(schedule)
    }

    pub async fn set_interval(&mut self, interval_minutes: u32) -> anyhow::Result<()> {
        if let Some(job_id) = self.recurring_job.take() {
            self.scheduler
                .remove(&job_id)
                .await
                .context("removing recurring wakeup")?;
        }
        let period = Duration::from_secs(u64::from(interval_minutes.max(1)) * 60);
        let engine = Arc::clone(&self.engine);
        let job = Job::new_repeated_async(period, move |_job_id, _scheduler| {
            let engine = Arc::clone(&engine);
            Box::pin(async move {
                run_wakeup(engine, RECURRING_WAKEUP).await;
            })
        })
        .context("creating recurring wakeup job")?;
        let job_id = self
            .scheduler
            .add(job)
            .await
            .context("adding recurring wakeup job")?;
        self.recurring_job = Some(job_id);
        Ok(())
    }

    pub async fn poke_soon(&self) -> anyhow::Result<()> {
        let engine = Arc::clone(&self.engine);
        let job = Job::new_one_shot_async(IMMEDIATE_POKE_DELAY, move |_job_id, _scheduler| {
            let engine = Arc::clone(&engine);
            Box::pin(async move {
                run_wakeup(engine, IMMEDIATE_WAKEUP).await;
            })
        })
        .context("creating one-shot wakeup job")?;
        self.scheduler
            .add(job)
            .await
            .context("adding one-shot wakeup job")?;
        Ok(())
    }

    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        self.scheduler
            .shutdown()
            .await
            .context("stopping wakeup scheduler")?;
        Ok(())
    }
}

async fn run_wakeup(engine: Arc<WatchEngine>, name: &str) {
    engine.emit_tick(name);
    if let Err(err) = engine.run_cycle().await {
        warn!(alarm = name, error = %err, "scheduled poll cycle failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pw_core::NO_CONTENT_NOTE;
    use tempfile::tempdir;

    #[derive(Default)]
    struct RecordingNotifier {
        calls: Mutex<Vec<(String, String, String)>>,
    }

    impl RecordingNotifier {
        fn calls(&self) -> Vec<(String, String, String)> {
            self.calls.lock().expect("notifier lock").clone()
        }
    }

    #[async_trait]
    impl ChangeNotifier for RecordingNotifier {
        async fn change_detected(
            &self,
            identifier: &str,
            title: &str,
            preview: &str,
            _url: &str,
        ) -> anyhow::Result<()> {
            self.calls.lock().expect("notifier lock").push((
                identifier.to_string(),
                title.to_string(),
                preview.to_string(),
            ));
            Ok(())
        }
    }

    fn capture(identifier: &str, text: &str, markup: &str) -> CaptureMessage {
        CaptureMessage {
            session_id: Uuid::new_v4(),
            identifier: identifier.to_string(),
            title: format!("Incident {identifier}"),
            text: text.to_string(),
            markup: markup.to_string(),
        }
    }

    fn detector_with_store(dir: &tempfile::TempDir) -> (ChangeDetector, Arc<RecordingNotifier>) {
        let store = Arc::new(StateStore::new(dir.path().join("state.json")));
        let notifier = Arc::new(RecordingNotifier::default());
        let detector = ChangeDetector::new(store, notifier.clone());
        (detector, notifier)
    }

    const URL: &str = "https://status.example.net/incident/INC-1";

    #[tokio::test]
    async fn first_observation_is_never_a_change() {
        let dir = tempdir().expect("tempdir");
        let (detector, notifier) = detector_with_store(&dir);

        let status = detector
            .ingest(
                &capture(
                    "INC-1",
                    "Status: Open",
                    "<html><body><p>Status: Open</p></body></html>",
                ),
                URL,
            )
            .await
            .expect("ingest");

        assert!(status.ok);
        assert!(!status.changed);
        assert!(notifier.calls().is_empty());
    }

    #[tokio::test]
    async fn real_change_rotates_prev_snapshot_and_notifies_once() {
        let dir = tempdir().expect("tempdir");
        let (detector, notifier) = detector_with_store(&dir);
        let store = StateStore::new(dir.path().join("state.json"));

        detector
            .ingest(
                &capture(
                    "INC-1",
                    "Status: Open",
                    "<html><body><p>Status: Open</p></body></html>",
                ),
                URL,
            )
            .await
            .expect("baseline");
        let status = detector
            .ingest(
                &capture(
                    "INC-1",
                    "Status: Resolved",
                    "<html><body><p>Status: Resolved</p></body></html>",
                ),
                URL,
            )
            .await
            .expect("second check");

        assert!(status.ok);
        assert!(status.changed);
        let record = store.load().await.expect("load").record("INC-1");
        assert_eq!(record.prev_snapshot_text, "Status: Open");
        assert_eq!(record.last_snapshot_text, "Status: Resolved");
        assert!(record.last_change_at.is_some());

        let calls = notifier.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "INC-1");
        assert_eq!(calls[0].2, "Status: Resolved");
    }

    #[tokio::test]
    async fn attribute_churn_covered_by_sanitization_is_not_a_change() {
        let dir = tempdir().expect("tempdir");
        let (detector, notifier) = detector_with_store(&dir);

        detector
            .ingest(
                &capture(
                    "INC-1",
                    "Status: Open",
                    r#"<html><body><div id="a" data-session="s1" class="b a">Status: Open</div></body></html>"#,
                ),
                URL,
            )
            .await
            .expect("baseline");
        let status = detector
            .ingest(
                &capture(
                    "INC-1",
                    "Status: Open",
                    r#"<html><body><div id="b" data-session="s2" class="a b">Status: Open</div></body></html>"#,
                ),
                URL,
            )
            .await
            .expect("second check");

        assert!(status.ok);
        assert!(!status.changed);
        assert!(notifier.calls().is_empty());
    }

    #[tokio::test]
    async fn no_content_preserves_the_baseline() {
        let dir = tempdir().expect("tempdir");
        let (detector, _notifier) = detector_with_store(&dir);
        let store = StateStore::new(dir.path().join("state.json"));

        let status = detector
            .ingest(&capture("INC-2", "   \n  ", "<html><body></body></html>"), URL)
            .await
            .expect("empty ingest");
        assert!(!status.ok);
        assert_eq!(status.note, NO_CONTENT_NOTE);

        let record = store.load().await.expect("load").record("INC-2");
        assert!(record.is_unobserved());
        assert!(record.last_check_at.is_some());

        // The next successful check is still a first observation.
        let status = detector
            .ingest(
                &capture(
                    "INC-2",
                    "Status: Investigating",
                    "<html><body><p>Status: Investigating</p></body></html>",
                ),
                URL,
            )
            .await
            .expect("second ingest");
        assert!(status.ok);
        assert!(!status.changed);
    }

    #[tokio::test]
    async fn notifier_failure_does_not_fail_the_check() {
        struct FailingNotifier;

        #[async_trait]
        impl ChangeNotifier for FailingNotifier {
            async fn change_detected(
                &self,
                _identifier: &str,
                _title: &str,
                _preview: &str,
                _url: &str,
            ) -> anyhow::Result<()> {
                anyhow::bail!("notification surface unavailable")
            }
        }

        let dir = tempdir().expect("tempdir");
        let store = Arc::new(StateStore::new(dir.path().join("state.json")));
        let detector = ChangeDetector::new(store, Arc::new(FailingNotifier));

        detector
            .ingest(
                &capture("INC-1", "a", "<html><body><p>a</p></body></html>"),
                URL,
            )
            .await
            .expect("baseline");
        let status = detector
            .ingest(
                &capture("INC-1", "b", "<html><body><p>b</p></body></html>"),
                URL,
            )
            .await
            .expect("changed check");
        assert!(status.ok);
        assert!(status.changed);
    }

    #[test]
    fn digest_is_stable() {
        assert_eq!(digest_hex("hello world"), digest_hex("hello world"));
        assert_ne!(digest_hex("hello world"), digest_hex("hello world!"));
    }

    #[test]
    fn origin_strips_path_and_query() {
        assert_eq!(
            origin_of("https://status.example.net/incident/INC-1?x=1"),
            "https://status.example.net"
        );
    }
}

//! Content acquisition for pagewatch: sanitization of captured pages, the
//! content-readiness probe, the render-host seam, and the bounded
//! event-driven capture protocol.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use ego_tree::NodeRef;
use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout_at, Instant};
use tracing::debug;
use uuid::Uuid;

use pw_storage::HttpFetcher;

pub const CRATE_NAME: &str = "pw-capture";

pub const DEFAULT_CEILING: Duration = Duration::from_secs(90);
pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(45);
pub const DEFAULT_QUIET_PERIOD: Duration = Duration::from_millis(800);
pub const DEFAULT_MIN_TEXT_LEN: usize = 100;

/// Capture messages are matched by session identity; a small mailbox is
/// plenty for the single snapshot a session reports.
pub const CAPTURE_MAILBOX_CAPACITY: usize = 8;

// ---------------------------------------------------------------------------
// Sanitization

static HORIZONTAL_WS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]+").expect("static regex"));
static REQUEST_ID_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)request[-_ ]?id[:=]?\s*[a-f0-9-]+").expect("static regex"));
static UPDATED_AT_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)updated[:=]?\s*\d{4}-\d{2}-\d{2}[ t]\d{2}:\d{2}:\d{2}(?:\.\d+)?z?")
        .expect("static regex")
});

/// Normalize captured text for storage and comparison. Horizontal whitespace
/// collapses to single spaces but line breaks survive, since the diff view is
/// line-based. Request-id tokens and "updated" timestamps are server-side
/// noise and are stripped.
pub fn sanitize_text(raw: &str) -> String {
    let collapsed = HORIZONTAL_WS.replace_all(raw, " ");
    let without_ids = REQUEST_ID_TOKEN.replace_all(&collapsed, "");
    let without_stamps = UPDATED_AT_TOKEN.replace_all(&without_ids, "");
    without_stamps.trim().to_string()
}

fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

fn is_void_element(name: &str) -> bool {
    VOID_ELEMENTS.contains(&name)
}

fn push_escaped_text(out: &mut String, text: &str) {
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
}

fn push_escaped_attr(out: &mut String, value: &str) {
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
}

/// Aggressive canonicalization used only for fingerprinting. Comments,
/// `id`/`style`/`data-*` attributes are volatile between renders of the same
/// content; class lists are sorted so a reordered class attribute hashes
/// identically. Returns the canonicalized body content. Fail-open: if the
/// document has no recognizable body, the raw string comes back unchanged.
pub fn sanitize_markup_for_hashing(raw_markup: &str) -> String {
    let doc = Html::parse_document(raw_markup);
    let Some(body_sel) = selector("body") else {
        return raw_markup.to_string();
    };
    let Some(body) = doc.select(&body_sel).next() else {
        return raw_markup.to_string();
    };
    let mut out = String::with_capacity(raw_markup.len());
    for child in body.children() {
        serialize_for_hashing(child, &mut out);
    }
    out
}

fn serialize_for_hashing(node: NodeRef<'_, Node>, out: &mut String) {
    match node.value() {
        Node::Text(text) => push_escaped_text(out, &text.text),
        Node::Element(el) => {
            let name = el.name();
            out.push('<');
            out.push_str(name);

            let mut attrs: Vec<(String, String)> = Vec::new();
            for (attr_name, attr_value) in el.attrs() {
                if attr_name == "id" || attr_name == "style" || attr_name.starts_with("data-") {
                    continue;
                }
                if attr_name == "class" {
                    let mut classes: Vec<&str> = attr_value.split_whitespace().collect();
                    classes.sort_unstable();
                    attrs.push(("class".to_string(), classes.join(" ")));
                } else {
                    attrs.push((attr_name.to_string(), attr_value.to_string()));
                }
            }
            // Canonical attribute order keeps the digest stable across parsers.
            attrs.sort();
            for (attr_name, attr_value) in &attrs {
                out.push(' ');
                out.push_str(attr_name);
                out.push_str("=\"");
                push_escaped_attr(out, attr_value);
                out.push('"');
            }
            out.push('>');

            if !is_void_element(name) {
                for child in node.children() {
                    serialize_for_hashing(child, out);
                }
                out.push_str("</");
                out.push_str(name);
                out.push('>');
            }
        }
        // Comments, doctypes and processing instructions never affect content.
        _ => {}
    }
}

/// Conservative cleanup for the human-facing preview. Active content
/// (script/iframe/object/embed, `on*` handlers, meta refresh) is removed and
/// a base element pointing at the tracked site's origin is injected when
/// missing, so relative resources resolve inside a sandboxed viewer. Visual
/// attributes are left alone. Fail-open on unparseable input.
pub fn sanitize_markup_for_preview(raw_markup: &str, origin: &str) -> String {
    let doc = Html::parse_document(raw_markup);
    let Some(base_sel) = selector("base") else {
        return raw_markup.to_string();
    };
    let has_base = doc.select(&base_sel).next().is_some();
    let root = doc.root_element();

    let mut out = String::with_capacity(raw_markup.len() + 64);
    out.push_str("<!doctype html>\n");
    serialize_for_preview(*root, origin, has_base, &mut out);
    out
}

fn serialize_for_preview(node: NodeRef<'_, Node>, origin: &str, has_base: bool, out: &mut String) {
    match node.value() {
        Node::Text(text) => push_escaped_text(out, &text.text),
        Node::Comment(comment) => {
            out.push_str("<!--");
            out.push_str(&comment.comment);
            out.push_str("-->");
        }
        Node::Element(el) => {
            let name = el.name();
            if matches!(name, "script" | "iframe" | "object" | "embed") {
                return;
            }
            if name == "meta"
                && el
                    .attr("http-equiv")
                    .is_some_and(|v| v.eq_ignore_ascii_case("refresh"))
            {
                return;
            }

            out.push('<');
            out.push_str(name);
            for (attr_name, attr_value) in el.attrs() {
                if attr_name.len() >= 2 && attr_name[..2].eq_ignore_ascii_case("on") {
                    continue;
                }
                if name == "a" && attr_name == "target" {
                    continue;
                }
                out.push(' ');
                out.push_str(attr_name);
                out.push_str("=\"");
                push_escaped_attr(out, attr_value);
                out.push('"');
            }
            out.push('>');

            if name == "head" && !has_base {
                out.push_str("<base href=\"");
                push_escaped_attr(out, origin);
                out.push_str("\">");
            }

            if !is_void_element(name) {
                for child in node.children() {
                    serialize_for_preview(child, origin, has_base, out);
                }
                out.push_str("</");
                out.push_str(name);
                out.push('>');
            }
        }
        _ => {}
    }
}

const BLOCK_TAGS: &[&str] = &[
    "address",
    "article",
    "aside",
    "blockquote",
    "dd",
    "div",
    "dl",
    "dt",
    "fieldset",
    "footer",
    "form",
    "h1",
    "h2",
    "h3",
    "h4",
    "h5",
    "h6",
    "header",
    "hr",
    "li",
    "main",
    "nav",
    "ol",
    "p",
    "pre",
    "section",
    "table",
    "tr",
    "ul",
];

/// Plain-text rendition of a page body, with line breaks at block element
/// boundaries. This is what the capture routine reports as the snapshot text.
pub fn extract_text(markup: &str) -> String {
    let doc = Html::parse_document(markup);
    let Some(body_sel) = selector("body") else {
        return String::new();
    };
    let Some(body) = doc.select(&body_sel).next() else {
        return String::new();
    };
    let mut out = String::new();
    for child in body.children() {
        collect_text(child, &mut out);
    }
    out.trim().to_string()
}

fn collect_text(node: NodeRef<'_, Node>, out: &mut String) {
    match node.value() {
        Node::Text(text) => out.push_str(&text.text),
        Node::Element(el) => {
            let name = el.name();
            if matches!(name, "script" | "style" | "template" | "noscript") {
                return;
            }
            if name == "br" {
                out.push('\n');
                return;
            }
            let block = BLOCK_TAGS.contains(&name);
            if block && !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            for child in node.children() {
                collect_text(child, out);
            }
            if block && !out.ends_with('\n') {
                out.push('\n');
            }
        }
        _ => {}
    }
}

fn extract_title(markup: &str) -> String {
    let doc = Html::parse_document(markup);
    let Some(title_sel) = selector("title") else {
        return String::new();
    };
    doc.select(&title_sel)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Content readiness

#[derive(Debug, Clone)]
pub struct ReadinessConfig {
    /// Hard deadline for the capture routine to judge content meaningful.
    pub timeout: Duration,
    /// Settle time after content first looks meaningful, to let trailing
    /// renders finish.
    pub quiet_period: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_READINESS_TIMEOUT,
            quiet_period: DEFAULT_QUIET_PERIOD,
        }
    }
}

/// Judges whether a captured document has finished rendering meaningful
/// content. Swappable per target site.
pub trait ContentProbe: Send + Sync {
    fn is_meaningful(&self, markup: &str) -> bool;
}

/// Default heuristics: reject an empty or placeholder-only application
/// container, then accept a populated main region, a populated header, a
/// card-like element, or enough visible text.
#[derive(Debug, Clone)]
pub struct DefaultContentProbe {
    pub container_selector: String,
    pub min_text_len: usize,
}

impl Default for DefaultContentProbe {
    fn default() -> Self {
        Self {
            container_selector: "#root".to_string(),
            min_text_len: DEFAULT_MIN_TEXT_LEN,
        }
    }
}

impl ContentProbe for DefaultContentProbe {
    fn is_meaningful(&self, markup: &str) -> bool {
        let doc = Html::parse_document(markup);

        if let Some(container_sel) = selector(&self.container_selector) {
            if let Some(container) = doc.select(&container_sel).next() {
                let children: Vec<ElementRef> =
                    container.children().filter_map(ElementRef::wrap).collect();
                if children.is_empty() {
                    return false;
                }
                // A lone spinner is still a loading placeholder.
                if children.len() == 1 {
                    let only = children[0].value();
                    let progressbar = only.attr("role") == Some("progressbar");
                    let spinner = only
                        .attr("class")
                        .is_some_and(|c| c.to_ascii_lowercase().contains("spinner"));
                    if progressbar || spinner {
                        return false;
                    }
                }
            }
        }

        let main_populated = selector("main, [role=\"main\"]")
            .and_then(|sel| doc.select(&sel).next())
            .is_some_and(|main| main.children().filter_map(ElementRef::wrap).next().is_some());
        let header_populated = selector("h1, h2, [data-automation-id=\"header\"]")
            .and_then(|sel| doc.select(&sel).next())
            .is_some_and(|h| !h.text().collect::<String>().trim().is_empty());
        let has_cards = selector("[class*=\"card\"]")
            .map(|sel| doc.select(&sel).next().is_some())
            .unwrap_or(false);
        let text_len = extract_text(markup).len();

        main_populated || header_populated || has_cards || text_len >= self.min_text_len
    }
}

// ---------------------------------------------------------------------------
// Render host seam

/// One isolated render context used to fetch and capture one page.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: Uuid,
    pub identifier: String,
    pub url: String,
}

/// What the injected capture routine reports back once content is ready.
#[derive(Debug, Clone)]
pub struct CaptureMessage {
    pub session_id: Uuid,
    pub identifier: String,
    pub title: String,
    pub text: String,
    pub markup: String,
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("opening render session: {0}")]
    Open(String),
    #[error("loading page: {0}")]
    Load(String),
    #[error("injecting capture routine: {0}")]
    Inject(String),
}

/// The external runtime that renders pages. Capture messages arrive through
/// a bounded mailbox handed out by `inject_capture`; dropping the receiver is
/// the unsubscribe.
#[async_trait]
pub trait RenderHost: Send + Sync {
    async fn open_session(&self, identifier: &str, url: &str) -> Result<SessionHandle, HostError>;

    /// Resolves when the session's top-level load completes.
    async fn await_load(&self, session: &SessionHandle) -> Result<(), HostError>;

    async fn inject_capture(
        &self,
        session: &SessionHandle,
        readiness: &ReadinessConfig,
    ) -> Result<mpsc::Receiver<CaptureMessage>, HostError>;

    /// Called exactly once per opened session, on every exit path.
    async fn close_session(&self, session: &SessionHandle);
}

// ---------------------------------------------------------------------------
// Acquisition protocol

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// End-to-end deadline measured from session open.
    pub ceiling: Duration,
    pub readiness: ReadinessConfig,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            ceiling: DEFAULT_CEILING,
            readiness: ReadinessConfig::default(),
        }
    }
}

/// Terminal outcome of one acquisition attempt. Never panics, never escapes
/// an error past this boundary.
#[derive(Debug, Clone)]
pub enum Acquisition {
    Captured(CaptureMessage),
    TimedOut,
    Failed { detail: String },
}

/// Run the OPENING -> WAITING_FOR_CONTENT -> terminal state machine for one
/// identifier. The session is released exactly once whichever way the attempt
/// ends; a capture racing the ceiling is ignored because the mailbox receiver
/// is dropped before the session closes.
pub async fn acquire(
    host: &dyn RenderHost,
    identifier: &str,
    url: &str,
    config: &CaptureConfig,
) -> Acquisition {
    let deadline = Instant::now() + config.ceiling;

    let session = match timeout_at(deadline, host.open_session(identifier, url)).await {
        Err(_) => return Acquisition::TimedOut,
        Ok(Err(err)) => {
            return Acquisition::Failed {
                detail: err.to_string(),
            }
        }
        Ok(Ok(session)) => session,
    };

    let outcome = drive_session(host, &session, deadline, config).await;
    host.close_session(&session).await;
    outcome
}

async fn drive_session(
    host: &dyn RenderHost,
    session: &SessionHandle,
    deadline: Instant,
    config: &CaptureConfig,
) -> Acquisition {
    match timeout_at(deadline, host.await_load(session)).await {
        Err(_) => return Acquisition::TimedOut,
        Ok(Err(err)) => {
            return Acquisition::Failed {
                detail: err.to_string(),
            }
        }
        Ok(Ok(())) => {}
    }

    let mut mailbox = match timeout_at(deadline, host.inject_capture(session, &config.readiness)).await
    {
        Err(_) => return Acquisition::TimedOut,
        Ok(Err(err)) => {
            return Acquisition::Failed {
                detail: err.to_string(),
            }
        }
        Ok(Ok(rx)) => rx,
    };

    loop {
        match timeout_at(deadline, mailbox.recv()).await {
            Err(_) => return Acquisition::TimedOut,
            Ok(None) => {
                return Acquisition::Failed {
                    detail: "capture mailbox closed before a snapshot arrived".to_string(),
                }
            }
            Ok(Some(message)) => {
                if message.session_id == session.session_id
                    && message.identifier == session.identifier
                {
                    return Acquisition::Captured(message);
                }
                debug!(
                    identifier = %session.identifier,
                    "ignoring capture message from another session"
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP-backed render host

/// Production render host that fetches pages over HTTP. A session's "load
/// complete" signal is the GET finishing; the injected capture routine is a
/// task that applies the readiness probe to the fetched body, settles, and
/// reports the snapshot into the session mailbox.
pub struct HttpRenderHost {
    fetcher: HttpFetcher,
    probe: Arc<dyn ContentProbe>,
    pages: Mutex<HashMap<Uuid, String>>,
}

impl HttpRenderHost {
    pub fn new(fetcher: HttpFetcher, probe: Arc<dyn ContentProbe>) -> Self {
        Self {
            fetcher,
            probe,
            pages: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl RenderHost for HttpRenderHost {
    async fn open_session(&self, identifier: &str, url: &str) -> Result<SessionHandle, HostError> {
        Ok(SessionHandle {
            session_id: Uuid::new_v4(),
            identifier: identifier.to_string(),
            url: url.to_string(),
        })
    }

    async fn await_load(&self, session: &SessionHandle) -> Result<(), HostError> {
        let page = self
            .fetcher
            .fetch_text(&session.url)
            .await
            .map_err(|err| HostError::Load(err.to_string()))?;
        self.pages
            .lock()
            .await
            .insert(session.session_id, page.body);
        Ok(())
    }

    async fn inject_capture(
        &self,
        session: &SessionHandle,
        readiness: &ReadinessConfig,
    ) -> Result<mpsc::Receiver<CaptureMessage>, HostError> {
        let markup = self
            .pages
            .lock()
            .await
            .get(&session.session_id)
            .cloned()
            .ok_or_else(|| HostError::Inject("load has not completed for this session".into()))?;

        let (tx, rx) = mpsc::channel(CAPTURE_MAILBOX_CAPACITY);
        let probe = Arc::clone(&self.probe);
        let readiness = readiness.clone();
        let session = session.clone();
        tokio::spawn(async move {
            // A static body renders once: meaningful content settles for the
            // quiet period, anything else waits out the readiness timeout and
            // reports whatever is there. Empty pages become NO_CONTENT
            // downstream.
            let settle = if probe.is_meaningful(&markup) {
                readiness.quiet_period
            } else {
                readiness.timeout
            };
            tokio::time::sleep(settle).await;
            let message = CaptureMessage {
                session_id: session.session_id,
                identifier: session.identifier.clone(),
                title: extract_title(&markup),
                text: extract_text(&markup),
                markup,
            };
            // The receiver may be gone if the ceiling fired first.
            let _ = tx.send(message).await;
        });
        Ok(rx)
    }

    async fn close_session(&self, session: &SessionHandle) {
        self.pages.lock().await.remove(&session.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn sanitize_text_collapses_horizontal_whitespace_but_keeps_lines() {
        let raw = "Status:\t\tOpen\nSeverity:   High";
        assert_eq!(sanitize_text(raw), "Status: Open\nSeverity: High");
    }

    #[test]
    fn sanitize_text_strips_request_ids_and_update_stamps() {
        let raw = "Impact ongoing\nrequest-id: ab12-ff00\nUpdated: 2026-08-06 12:30:55Z\nNext steps";
        let cleaned = sanitize_text(raw);
        assert!(!cleaned.to_lowercase().contains("request"));
        assert!(!cleaned.contains("2026-08-06"));
        assert!(cleaned.contains("Impact ongoing"));
        assert!(cleaned.contains("Next steps"));
    }

    #[test]
    fn sanitize_text_is_idempotent_and_total() {
        let raw = "  a\t b \n request_id= deadbeef-1 \n c ";
        let once = sanitize_text(raw);
        assert_eq!(sanitize_text(&once), once);
        assert_eq!(sanitize_text(""), "");
    }

    #[test]
    fn hashing_sanitizer_is_blind_to_volatile_attributes() {
        let a = r#"<html><body><div id="x1" style="color:red" data-session="abc" class="b a">Open</div></body></html>"#;
        let b = r#"<html><body><div id="y2" data-session="zzz" class="a b">Open</div></body></html>"#;
        assert_eq!(sanitize_markup_for_hashing(a), sanitize_markup_for_hashing(b));
    }

    #[test]
    fn hashing_sanitizer_drops_comments_and_keeps_content() {
        let markup = "<html><body><!-- build 123 --><p class=\"note\">Resolved</p></body></html>";
        let canon = sanitize_markup_for_hashing(markup);
        assert!(!canon.contains("build 123"));
        assert_eq!(canon, "<p class=\"note\">Resolved</p>");
    }

    #[test]
    fn hashing_sanitizer_sees_real_content_changes() {
        let a = "<html><body><p>Status: Open</p></body></html>";
        let b = "<html><body><p>Status: Resolved</p></body></html>";
        assert_ne!(sanitize_markup_for_hashing(a), sanitize_markup_for_hashing(b));
    }

    #[test]
    fn hashing_sanitizer_is_idempotent() {
        let markup = r#"<html><body><div class="z a">x<span data-k="1">y</span></div></body></html>"#;
        let once = sanitize_markup_for_hashing(markup);
        assert_eq!(sanitize_markup_for_hashing(&once), once);
    }

    #[test]
    fn preview_sanitizer_removes_active_content_only() {
        let markup = concat!(
            "<html><head><title>INC-1</title>",
            "<meta http-equiv=\"refresh\" content=\"5\">",
            "</head><body>",
            "<script>alert(1)</script>",
            "<iframe src=\"x\"></iframe>",
            "<div id=\"keep\" class=\"keep\" onclick=\"steal()\">Body</div>",
            "<a href=\"/next\" target=\"_blank\">next</a>",
            "</body></html>"
        );
        let safe = sanitize_markup_for_preview(markup, "https://status.example.net");
        assert!(!safe.contains("<script"));
        assert!(!safe.contains("<iframe"));
        assert!(!safe.contains("onclick"));
        assert!(!safe.contains("http-equiv"));
        assert!(!safe.contains("target="));
        assert!(safe.contains("id=\"keep\""));
        assert!(safe.contains("class=\"keep\""));
        assert!(safe.contains("<base href=\"https://status.example.net\">"));
        assert!(safe.starts_with("<!doctype html>"));
    }

    #[test]
    fn preview_sanitizer_keeps_an_existing_base() {
        let markup = "<html><head><base href=\"https://other.example.org/\"></head><body>x</body></html>";
        let safe = sanitize_markup_for_preview(markup, "https://status.example.net");
        assert!(safe.contains("https://other.example.org/"));
        assert!(!safe.contains("https://status.example.net"));
    }

    #[test]
    fn extract_text_breaks_lines_at_block_boundaries() {
        let markup = "<html><body><h1>INC-1</h1><p>Status: Open</p><div>Impact: low</div></body></html>";
        assert_eq!(extract_text(markup), "INC-1\nStatus: Open\nImpact: low");
    }

    #[test]
    fn probe_rejects_placeholder_states() {
        let probe = DefaultContentProbe::default();
        let empty_root = "<html><body><div id=\"root\"></div></body></html>";
        let spinner =
            "<html><body><div id=\"root\"><div class=\"LoadingSpinner\">.</div></div></body></html>";
        let progressbar =
            "<html><body><div id=\"root\"><div role=\"progressbar\"></div></div></body></html>";
        assert!(!probe.is_meaningful(empty_root));
        assert!(!probe.is_meaningful(spinner));
        assert!(!probe.is_meaningful(progressbar));
    }

    #[test]
    fn probe_accepts_populated_content() {
        let probe = DefaultContentProbe::default();
        let with_header = "<html><body><div id=\"root\"><div><h1>INC-9 down</h1></div></div></body></html>";
        let with_main =
            "<html><body><main><section>details</section></main></body></html>";
        let long_text = format!("<html><body><span>{}</span></body></html>", "x".repeat(200));
        assert!(probe.is_meaningful(with_header));
        assert!(probe.is_meaningful(with_main));
        assert!(probe.is_meaningful(&long_text));
    }

    #[test]
    fn probe_rejects_short_featureless_pages() {
        let probe = DefaultContentProbe::default();
        assert!(!probe.is_meaningful("<html><body><span>loading</span></body></html>"));
    }

    // -- protocol tests ----------------------------------------------------

    #[derive(Default)]
    struct FakeHostBehavior {
        fail_open: bool,
        load_delay: Option<Duration>,
        capture_delay: Option<Duration>,
        silent: bool,
        foreign_message_first: bool,
    }

    struct FakeHost {
        behavior: FakeHostBehavior,
        closes: AtomicUsize,
    }

    impl FakeHost {
        fn new(behavior: FakeHostBehavior) -> Self {
            Self {
                behavior,
                closes: AtomicUsize::new(0),
            }
        }

        fn close_count(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RenderHost for FakeHost {
        async fn open_session(
            &self,
            identifier: &str,
            url: &str,
        ) -> Result<SessionHandle, HostError> {
            if self.behavior.fail_open {
                return Err(HostError::Open("host refused".into()));
            }
            Ok(SessionHandle {
                session_id: Uuid::new_v4(),
                identifier: identifier.to_string(),
                url: url.to_string(),
            })
        }

        async fn await_load(&self, _session: &SessionHandle) -> Result<(), HostError> {
            if let Some(delay) = self.behavior.load_delay {
                tokio::time::sleep(delay).await;
            }
            Ok(())
        }

        async fn inject_capture(
            &self,
            session: &SessionHandle,
            _readiness: &ReadinessConfig,
        ) -> Result<mpsc::Receiver<CaptureMessage>, HostError> {
            let (tx, rx) = mpsc::channel(CAPTURE_MAILBOX_CAPACITY);
            if self.behavior.silent {
                // Keep the mailbox open without ever reporting.
                tokio::spawn(async move {
                    let _tx = tx;
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                });
                return Ok(rx);
            }
            let session = session.clone();
            let capture_delay = self.behavior.capture_delay.unwrap_or(Duration::from_millis(10));
            let foreign_first = self.behavior.foreign_message_first;
            tokio::spawn(async move {
                tokio::time::sleep(capture_delay).await;
                if foreign_first {
                    let _ = tx
                        .send(CaptureMessage {
                            session_id: Uuid::new_v4(),
                            identifier: "SOMETHING-ELSE".to_string(),
                            title: String::new(),
                            text: "stale".to_string(),
                            markup: "<html></html>".to_string(),
                        })
                        .await;
                }
                let _ = tx
                    .send(CaptureMessage {
                        session_id: session.session_id,
                        identifier: session.identifier.clone(),
                        title: "Incident INC-1".to_string(),
                        text: "Status: Open".to_string(),
                        markup: "<html><body><p>Status: Open</p></body></html>".to_string(),
                    })
                    .await;
            });
            Ok(rx)
        }

        async fn close_session(&self, _session: &SessionHandle) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_captures_and_releases_once() {
        let host = FakeHost::new(FakeHostBehavior::default());
        let outcome = acquire(&host, "INC-1", "https://x/incident/INC-1", &CaptureConfig::default()).await;
        match outcome {
            Acquisition::Captured(message) => {
                assert_eq!(message.identifier, "INC-1");
                assert_eq!(message.text, "Status: Open");
            }
            other => panic!("expected capture, got {other:?}"),
        }
        assert_eq!(host.close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_skips_messages_from_other_sessions() {
        let host = FakeHost::new(FakeHostBehavior {
            foreign_message_first: true,
            ..FakeHostBehavior::default()
        });
        let outcome = acquire(&host, "INC-1", "https://x/incident/INC-1", &CaptureConfig::default()).await;
        match outcome {
            Acquisition::Captured(message) => assert_eq!(message.identifier, "INC-1"),
            other => panic!("expected capture, got {other:?}"),
        }
        assert_eq!(host.close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_times_out_when_nothing_reports() {
        let host = FakeHost::new(FakeHostBehavior {
            silent: true,
            ..FakeHostBehavior::default()
        });
        let outcome = acquire(&host, "INC-1", "https://x/incident/INC-1", &CaptureConfig::default()).await;
        assert!(matches!(outcome, Acquisition::TimedOut));
        assert_eq!(host.close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_times_out_on_a_stuck_load() {
        let host = FakeHost::new(FakeHostBehavior {
            load_delay: Some(Duration::from_secs(600)),
            ..FakeHostBehavior::default()
        });
        let outcome = acquire(&host, "INC-1", "https://x/incident/INC-1", &CaptureConfig::default()).await;
        assert!(matches!(outcome, Acquisition::TimedOut));
        assert_eq!(host.close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_reports_open_failure_without_a_session_to_close() {
        let host = FakeHost::new(FakeHostBehavior {
            fail_open: true,
            ..FakeHostBehavior::default()
        });
        let outcome = acquire(&host, "INC-1", "https://x/incident/INC-1", &CaptureConfig::default()).await;
        match outcome {
            Acquisition::Failed { detail } => assert!(detail.contains("host refused")),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(host.close_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_capture_after_ceiling_is_tolerated() {
        let host = FakeHost::new(FakeHostBehavior {
            capture_delay: Some(Duration::from_secs(120)),
            ..FakeHostBehavior::default()
        });
        let outcome = acquire(&host, "INC-1", "https://x/incident/INC-1", &CaptureConfig::default()).await;
        assert!(matches!(outcome, Acquisition::TimedOut));
        assert_eq!(host.close_count(), 1);
        // Let the straggler task run to its failed send.
        tokio::time::sleep(Duration::from_secs(120)).await;
    }
}

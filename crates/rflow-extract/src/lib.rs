//! Roster extraction: browser automation contracts plus the scripted scrape
//! protocol against the legacy portal.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Months, SecondsFormat, Utc};
use rflow_core::{format_display_name, policy, Credential, RawRosterEntry, SyncError};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "rflow-extract";

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("{0}")]
    Message(String),
}

/// One live page session. Implementations drive a real headless browser
/// (remote DevTools endpoint or local binary); tests use [`ScriptedBrowser`].
#[async_trait]
pub trait BrowserSession: Send {
    async fn goto(&mut self, url: &str) -> Result<(), BrowserError>;
    async fn exists(&mut self, selector: &str) -> Result<bool, BrowserError>;
    async fn type_into(&mut self, selector: &str, text: &str) -> Result<(), BrowserError>;
    async fn click(&mut self, selector: &str) -> Result<(), BrowserError>;
    async fn wait_for_navigation(&mut self) -> Result<(), BrowserError>;
    /// Bounded wait; returns false on timeout rather than failing.
    async fn wait_for_selector(
        &mut self,
        selector: &str,
        timeout: Duration,
    ) -> Result<bool, BrowserError>;
    async fn title(&mut self) -> Result<String, BrowserError>;
    /// Full HTML of the current page.
    async fn content(&mut self) -> Result<String, BrowserError>;
    async fn field_value(&mut self, selector: &str) -> Result<Option<String>, BrowserError>;
    async fn set_field_value(&mut self, selector: &str, value: &str) -> Result<(), BrowserError>;
    async fn accept_dialogs(&mut self) -> Result<(), BrowserError>;
    async fn close(&mut self) -> Result<(), BrowserError>;
}

#[async_trait]
pub trait BrowserProvider: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, BrowserError>;
}

/// Provider for deployments with no browser backend wired in. Launch fails
/// with a clear message and the caller falls back to persisted data.
pub struct UnavailableBrowser;

#[async_trait]
impl BrowserProvider for UnavailableBrowser {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, BrowserError> {
        Err(BrowserError::Message(
            "no browser backend configured".to_string(),
        ))
    }
}

/// Selectors and markers for the portal's login and roster pages. The portal
/// is a legacy ASP.NET app with generated control names, hence the
/// substring-match selectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalProfile {
    pub login_url: String,
    pub roster_url: String,
    pub username_selector: String,
    pub password_selector: String,
    pub login_button_selector: String,
    /// Page-title substring that means we landed back on the login page.
    pub login_title_marker: String,
    /// Body substring the portal serves when throttling requests.
    pub rate_limit_marker: String,
    pub filter_from_selector: String,
    pub filter_to_selector: String,
    pub search_button_selector: String,
    pub results_table_selector: String,
    pub display_name_selector: String,
    /// Bounded wait for the result table after the search postback.
    pub result_wait: Duration,
    /// Fallback delay when the bounded wait times out (the postback is an
    /// AJAX partial update without a navigation event).
    pub fallback_delay: Duration,
}

impl PortalProfile {
    pub fn for_base_url(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            login_url: format!("{base}/Login.aspx"),
            roster_url: format!("{base}/Roster.aspx"),
            username_selector: "input[name*='UserName']".into(),
            password_selector: "input[name*='Password']".into(),
            login_button_selector: "input[name*='LoginButton']".into(),
            login_title_marker: "Login".into(),
            rate_limit_marker: "too many requests".into(),
            filter_from_selector: "input[name*='from$txtDate']".into(),
            filter_to_selector: "input[name*='to$txtDate']".into(),
            search_button_selector: "input[name*='btnSearch']".into(),
            results_table_selector: "table tr td".into(),
            display_name_selector: "input[name*='EmployeeName']".into(),
            result_wait: Duration::from_secs(10),
            fallback_delay: Duration::from_secs(5),
        }
    }
}

/// Result of one scrape attempt, successful or not. The diagnostic log is
/// returned to the caller verbatim for troubleshooting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeOutcome {
    pub success: bool,
    pub entries: Vec<RawRosterEntry>,
    pub display_name: Option<String>,
    pub log: Vec<String>,
    pub error: Option<SyncError>,
}

impl ScrapeOutcome {
    fn failure(error: SyncError, log: Vec<String>) -> Self {
        Self {
            success: false,
            entries: Vec::new(),
            display_name: None,
            log,
            error: Some(error),
        }
    }
}

pub struct ExtractionEngine {
    provider: Arc<dyn BrowserProvider>,
    profile: PortalProfile,
}

impl ExtractionEngine {
    pub fn new(provider: Arc<dyn BrowserProvider>, profile: PortalProfile) -> Self {
        Self { provider, profile }
    }

    pub async fn scrape(&self, credential: &Credential) -> ScrapeOutcome {
        self.scrape_at(credential, Utc::now()).await
    }

    /// Scrape with an explicit clock, so tests can pin the filter window.
    pub async fn scrape_at(&self, credential: &Credential, now: DateTime<Utc>) -> ScrapeOutcome {
        let mut log = Vec::new();

        if credential.username.trim().is_empty() || credential.password.is_empty() {
            log_step(&mut log, "missing portal credential, aborting before launch");
            return ScrapeOutcome::failure(SyncError::MissingCredential, log);
        }

        log_step(&mut log, "launching browser session");
        let mut session = match self.provider.launch().await {
            Ok(session) => session,
            Err(e) => {
                log_step(&mut log, &format!("browser launch failed: {e}"));
                return ScrapeOutcome::failure(SyncError::ExtractionFailed(e.to_string()), log);
            }
        };

        let result = self
            .run_protocol(session.as_mut(), credential, now, &mut log)
            .await;

        // The session is closed on every path, including protocol failures.
        if let Err(e) = session.close().await {
            warn!(error = %e, "browser session close failed");
            log_step(&mut log, &format!("session close failed: {e}"));
        } else {
            log_step(&mut log, "session closed");
        }

        match result {
            Ok((entries, display_name)) => {
                log_step(&mut log, &format!("extracted {} entries", entries.len()));
                ScrapeOutcome {
                    success: true,
                    entries,
                    display_name,
                    log,
                    error: None,
                }
            }
            Err(error) => {
                log_step(&mut log, &format!("scrape failed: {error}"));
                ScrapeOutcome::failure(error, log)
            }
        }
    }

    async fn run_protocol(
        &self,
        session: &mut dyn BrowserSession,
        credential: &Credential,
        now: DateTime<Utc>,
        log: &mut Vec<String>,
    ) -> Result<(Vec<RawRosterEntry>, Option<String>), SyncError> {
        let p = &self.profile;
        let ext = |e: BrowserError| SyncError::ExtractionFailed(e.to_string());

        log_step(log, &format!("navigating to login page {}", p.login_url));
        session.goto(&p.login_url).await.map_err(ext)?;

        if session.exists(&p.login_button_selector).await.map_err(ext)? {
            log_step(log, "login form present, submitting credentials");
            session
                .type_into(&p.username_selector, &credential.username)
                .await
                .map_err(ext)?;
            session
                .type_into(&p.password_selector, &credential.password)
                .await
                .map_err(ext)?;
            session.click(&p.login_button_selector).await.map_err(ext)?;
            session.wait_for_navigation().await.map_err(ext)?;
        } else {
            log_step(log, "no login form, assuming existing session");
        }

        log_step(log, &format!("navigating to roster page {}", p.roster_url));
        session.goto(&p.roster_url).await.map_err(ext)?;

        let title = session.title().await.map_err(ext)?;
        if title.contains(&p.login_title_marker)
            || session.exists(&p.password_selector).await.map_err(ext)?
        {
            log_step(log, "still on login page after navigation");
            return Err(SyncError::AuthenticationFailed);
        }

        let html = session.content().await.map_err(ext)?;
        if html
            .to_ascii_lowercase()
            .contains(&p.rate_limit_marker.to_ascii_lowercase())
        {
            log_step(log, "portal is throttling requests");
            return Err(SyncError::UpstreamRateLimited);
        }

        // Filter window: first day of the current month, twelve months out.
        let month_start = now
            .date_naive()
            .with_day(1)
            .unwrap_or_else(|| now.date_naive());
        let window_end = month_start + Months::new(12);
        let from = month_start.format("%d/%m/%Y").to_string();
        let to = window_end.format("%d/%m/%Y").to_string();

        let has_filter = session.exists(&p.filter_from_selector).await.map_err(ext)?
            && session.exists(&p.filter_to_selector).await.map_err(ext)?
            && session.exists(&p.search_button_selector).await.map_err(ext)?;
        if has_filter {
            log_step(log, &format!("applying date filter {from} .. {to}"));
            session
                .set_field_value(&p.filter_from_selector, &from)
                .await
                .map_err(ext)?;
            session
                .set_field_value(&p.filter_to_selector, &to)
                .await
                .map_err(ext)?;
            // The portal pops a confirm dialog on some filter changes.
            session.accept_dialogs().await.map_err(ext)?;
            session.click(&p.search_button_selector).await.map_err(ext)?;

            let appeared = session
                .wait_for_selector(&p.results_table_selector, p.result_wait)
                .await
                .map_err(ext)?;
            if !appeared {
                log_step(log, "result table wait timed out, falling back to fixed delay");
                tokio::time::sleep(p.fallback_delay).await;
            }
        } else {
            log_step(log, "date filter controls not found, parsing page as-is");
        }

        let html = session.content().await.map_err(ext)?;
        let entries = parse_roster_rows(&html, &credential.username);
        debug!(rows = entries.len(), person = %credential.username, "roster rows parsed");

        let display_name = session
            .field_value(&p.display_name_selector)
            .await
            .map_err(ext)?
            .map(|raw| format_display_name(&raw));
        if let Some(name) = &display_name {
            log_step(log, &format!("display name resolved: {name}"));
        }

        Ok((entries, display_name))
    }
}

fn log_step(log: &mut Vec<String>, msg: &str) {
    log.push(format!(
        "[{}] {msg}",
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
    ));
}

fn looks_like_portal_date(text: &str) -> bool {
    let date_part = text.split_whitespace().next().unwrap_or("");
    let segments: Vec<&str> = date_part.split('/').collect();
    segments.len() == 3
        && segments[0].len() <= 2
        && segments[1].len() <= 2
        && segments[2].len() == 4
        && segments.iter().all(|s| s.chars().all(|c| c.is_ascii_digit()) && !s.is_empty())
}

fn cell_text(cell: &ElementRef<'_>) -> String {
    cell.text().collect::<String>().trim().to_string()
}

fn has_cancel_affordance(cell: Option<&ElementRef<'_>>) -> bool {
    let Some(cell) = cell else {
        return false;
    };
    let del = Selector::parse(".del").expect("static selector");
    let cancel_link = Selector::parse("a[title*='cancel' i]").expect("static selector");
    cell.select(&del).next().is_some() || cell.select(&cancel_link).next().is_some()
}

/// Parse roster rows out of the captured results page. A data row is any
/// `tr` with at least seven cells whose start and end cells carry the
/// portal's `DD/MM/YYYY` pattern; header, pager and layout rows never do.
pub fn parse_roster_rows(html: &str, person: &str) -> Vec<RawRosterEntry> {
    let document = Html::parse_document(html);
    let row_sel = Selector::parse("tr").expect("static selector");
    let cell_sel = Selector::parse("td").expect("static selector");

    let mut out = Vec::new();
    for row in document.select(&row_sel) {
        let cells: Vec<ElementRef<'_>> = row.select(&cell_sel).collect();
        if cells.len() < 7 {
            continue;
        }
        let start = cell_text(&cells[4]);
        let end = cell_text(&cells[5]);
        if !looks_like_portal_date(&start) || !looks_like_portal_date(&end) {
            continue;
        }

        let mut entry_type = cell_text(&cells[6]);
        let style = row.value().attr("style").unwrap_or("");
        let highlighted = policy::row_style_is_highlighted(style);
        let cancelable = has_cancel_affordance(cells.get(8));
        if policy::pending_qualifier(&entry_type, highlighted, cancelable) {
            entry_type = policy::apply_pending_suffix(&entry_type);
        }

        let date = start
            .split_whitespace()
            .next()
            .unwrap_or(start.as_str())
            .to_string();
        out.push(RawRosterEntry {
            person: person.to_string(),
            date,
            start,
            end,
            entry_type,
            department: cell_text(&cells[1]),
            function: cell_text(&cells[2]),
            vessel: cell_text(&cells[3]),
        });
    }
    out
}

/// Canned page state for the scripted test browser.
#[derive(Debug, Clone, Default)]
pub struct ScriptedPage {
    pub title: String,
    pub html: String,
    /// Selectors that `exists` reports present.
    pub selectors: HashSet<String>,
    /// Form fields readable via `field_value`.
    pub fields: HashMap<String, String>,
}

/// Test double: replays canned pages instead of driving a real browser.
/// `click` follows `click_navigations` immediately, so the scripted flow
/// doesn't model AJAX timing.
#[derive(Default)]
pub struct ScriptedBrowser {
    pages: Mutex<HashMap<String, ScriptedPage>>,
    click_navigations: Mutex<HashMap<String, String>>,
    pub closed: Arc<AtomicBool>,
    pub typed: Arc<Mutex<Vec<(String, String)>>>,
    pub set_fields: Arc<Mutex<Vec<(String, String)>>>,
}

impl ScriptedBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(self, url: &str, page: ScriptedPage) -> Self {
        self.pages
            .lock()
            .expect("pages lock")
            .insert(url.to_string(), page);
        self
    }

    /// A click on `selector` lands the session on `url`.
    pub fn with_click_navigation(self, selector: &str, url: &str) -> Self {
        self.click_navigations
            .lock()
            .expect("navigations lock")
            .insert(selector.to_string(), url.to_string());
        self
    }

    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserProvider for ScriptedBrowser {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, BrowserError> {
        Ok(Box::new(ScriptedSession {
            pages: self.pages.lock().expect("pages lock").clone(),
            click_navigations: self.click_navigations.lock().expect("navigations lock").clone(),
            current: None,
            closed: Arc::clone(&self.closed),
            typed: Arc::clone(&self.typed),
            set_fields: Arc::clone(&self.set_fields),
        }))
    }
}

struct ScriptedSession {
    pages: HashMap<String, ScriptedPage>,
    click_navigations: HashMap<String, String>,
    current: Option<String>,
    closed: Arc<AtomicBool>,
    typed: Arc<Mutex<Vec<(String, String)>>>,
    set_fields: Arc<Mutex<Vec<(String, String)>>>,
}

impl ScriptedSession {
    fn page(&self) -> Result<&ScriptedPage, BrowserError> {
        let url = self
            .current
            .as_deref()
            .ok_or_else(|| BrowserError::Message("no page loaded".into()))?;
        self.pages
            .get(url)
            .ok_or_else(|| BrowserError::Message(format!("no scripted page for {url}")))
    }
}

#[async_trait]
impl BrowserSession for ScriptedSession {
    async fn goto(&mut self, url: &str) -> Result<(), BrowserError> {
        if !self.pages.contains_key(url) {
            return Err(BrowserError::Message(format!("no scripted page for {url}")));
        }
        self.current = Some(url.to_string());
        Ok(())
    }

    async fn exists(&mut self, selector: &str) -> Result<bool, BrowserError> {
        let page = self.page()?;
        Ok(page.selectors.contains(selector) || page.fields.contains_key(selector))
    }

    async fn type_into(&mut self, selector: &str, text: &str) -> Result<(), BrowserError> {
        self.typed
            .lock()
            .expect("typed lock")
            .push((selector.to_string(), text.to_string()));
        Ok(())
    }

    async fn click(&mut self, selector: &str) -> Result<(), BrowserError> {
        if let Some(url) = self.click_navigations.get(selector).cloned() {
            self.current = Some(url);
        }
        Ok(())
    }

    async fn wait_for_navigation(&mut self) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn wait_for_selector(
        &mut self,
        selector: &str,
        _timeout: Duration,
    ) -> Result<bool, BrowserError> {
        self.exists(selector).await
    }

    async fn title(&mut self) -> Result<String, BrowserError> {
        Ok(self.page()?.title.clone())
    }

    async fn content(&mut self) -> Result<String, BrowserError> {
        Ok(self.page()?.html.clone())
    }

    async fn field_value(&mut self, selector: &str) -> Result<Option<String>, BrowserError> {
        Ok(self.page()?.fields.get(selector).cloned())
    }

    async fn set_field_value(&mut self, selector: &str, value: &str) -> Result<(), BrowserError> {
        self.set_fields
            .lock()
            .expect("set_fields lock")
            .push((selector.to_string(), value.to_string()));
        Ok(())
    }

    async fn accept_dialogs(&mut self) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const ROSTER_HTML: &str = r##"
        <html><body><table>
          <tr><th>Dept</th><th>Function</th><th>Vessel</th><th>From</th><th>To</th><th>Type</th></tr>
          <tr>
            <td>x</td><td>Fleet</td><td>Deckhand</td><td>Sea Scheldt</td>
            <td>27/06/2026 08:00</td><td>27/06/2026 20:00</td><td>Day shift</td>
            <td></td><td></td>
          </tr>
          <tr style="background-color:#80FFFF">
            <td>x</td><td>Fleet</td><td>Deckhand</td><td></td>
            <td>23/03/2026</td><td>24/03/2026</td><td>Leave</td>
            <td></td><td></td>
          </tr>
          <tr>
            <td>x</td><td>Fleet</td><td>Deckhand</td><td></td>
            <td>01/04/2026</td><td>02/04/2026</td><td>Leave</td>
            <td></td><td><a title="cancel request" href="#">x</a></td>
          </tr>
          <tr><td>short</td><td>row</td></tr>
          <tr>
            <td>a</td><td>b</td><td>c</td><td>d</td>
            <td>not a date</td><td>also not</td><td>Noise</td>
          </tr>
        </table></body></html>
    "##;

    fn base_profile() -> PortalProfile {
        let mut profile = PortalProfile::for_base_url("https://portal.example/Roster");
        profile.result_wait = Duration::from_millis(0);
        profile.fallback_delay = Duration::from_millis(0);
        profile
    }

    fn login_page(profile: &PortalProfile) -> ScriptedPage {
        ScriptedPage {
            title: "Login".into(),
            html: "<html><body>login form</body></html>".into(),
            selectors: [
                profile.username_selector.clone(),
                profile.password_selector.clone(),
                profile.login_button_selector.clone(),
            ]
            .into_iter()
            .collect(),
            fields: HashMap::new(),
        }
    }

    fn roster_page(profile: &PortalProfile) -> ScriptedPage {
        ScriptedPage {
            title: "Roster".into(),
            html: ROSTER_HTML.into(),
            selectors: [
                profile.filter_from_selector.clone(),
                profile.filter_to_selector.clone(),
                profile.search_button_selector.clone(),
                profile.results_table_selector.clone(),
            ]
            .into_iter()
            .collect(),
            fields: [(
                profile.display_name_selector.clone(),
                "DOE John".to_string(),
            )]
            .into_iter()
            .collect(),
        }
    }

    fn credential() -> Credential {
        Credential {
            username: "jdoe".into(),
            password: "hunter2".into(),
        }
    }

    #[test]
    fn parses_only_date_bearing_rows() {
        let entries = parse_roster_rows(ROSTER_HTML, "jdoe");
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].entry_type, "Day shift");
        assert_eq!(entries[0].department, "Fleet");
        assert_eq!(entries[0].function, "Deckhand");
        assert_eq!(entries[0].vessel, "Sea Scheldt");
        assert_eq!(entries[0].date, "27/06/2026");
        assert_eq!(entries[0].start, "27/06/2026 08:00");
    }

    #[test]
    fn pending_inferred_from_highlight_and_cancel_affordance() {
        let entries = parse_roster_rows(ROSTER_HTML, "jdoe");
        assert_eq!(entries[1].entry_type, "Leave (pending)");
        assert_eq!(entries[2].entry_type, "Leave (pending)");
    }

    #[test]
    fn highlight_on_non_leave_rows_does_not_qualify() {
        let html = r#"<table><tr style="background:cyan">
            <td>a</td><td>Fleet</td><td>Deckhand</td><td>V</td>
            <td>01/04/2026 08:00</td><td>01/04/2026 20:00</td><td>Day shift</td>
            <td></td><td></td></tr></table>"#;
        let entries = parse_roster_rows(html, "jdoe");
        assert_eq!(entries[0].entry_type, "Day shift");
    }

    #[tokio::test]
    async fn scrape_logs_in_submits_filter_and_parses() {
        let profile = base_profile();
        let browser = Arc::new(
            ScriptedBrowser::new()
                .with_page(&profile.login_url, login_page(&profile))
                .with_page(&profile.roster_url, roster_page(&profile))
                .with_click_navigation(&profile.login_button_selector, &profile.roster_url),
        );
        let engine = ExtractionEngine::new(browser.clone(), profile.clone());

        let now = Utc.with_ymd_and_hms(2026, 6, 15, 9, 0, 0).unwrap();
        let outcome = engine.scrape_at(&credential(), now).await;

        assert!(outcome.success, "log: {:?}", outcome.log);
        assert_eq!(outcome.entries.len(), 3);
        assert_eq!(outcome.display_name.as_deref(), Some("John Doe"));
        assert!(browser.was_closed());

        let typed = browser.typed.lock().unwrap().clone();
        assert!(typed.contains(&(profile.username_selector.clone(), "jdoe".into())));

        // Filter window is first-of-month to twelve months out.
        let set = browser.set_fields.lock().unwrap().clone();
        assert!(set.contains(&(profile.filter_from_selector.clone(), "01/06/2026".into())));
        assert!(set.contains(&(profile.filter_to_selector.clone(), "01/06/2027".into())));
    }

    #[tokio::test]
    async fn roster_page_showing_login_means_auth_failure() {
        let profile = base_profile();
        let browser = Arc::new(
            ScriptedBrowser::new()
                .with_page(&profile.login_url, login_page(&profile))
                // Clicking login lands right back on the login page.
                .with_page(&profile.roster_url, login_page(&profile))
                .with_click_navigation(&profile.login_button_selector, &profile.roster_url),
        );
        let engine = ExtractionEngine::new(browser.clone(), profile);

        let outcome = engine.scrape(&credential()).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error, Some(SyncError::AuthenticationFailed));
        assert!(browser.was_closed(), "session must close on failure paths");
    }

    #[tokio::test]
    async fn throttled_portal_reports_rate_limit() {
        let profile = base_profile();
        let mut roster = roster_page(&profile);
        roster.html = "<html><body>Too many requests, slow down.</body></html>".into();
        let browser = Arc::new(
            ScriptedBrowser::new()
                .with_page(&profile.login_url, login_page(&profile))
                .with_page(&profile.roster_url, roster)
                .with_click_navigation(&profile.login_button_selector, &profile.roster_url),
        );
        let engine = ExtractionEngine::new(browser, profile);

        let outcome = engine.scrape(&credential()).await;
        assert_eq!(outcome.error, Some(SyncError::UpstreamRateLimited));
    }

    #[tokio::test]
    async fn missing_credential_never_launches_a_session() {
        let profile = base_profile();
        let browser = Arc::new(ScriptedBrowser::new());
        let engine = ExtractionEngine::new(browser.clone(), profile);

        let outcome = engine
            .scrape(&Credential {
                username: "jdoe".into(),
                password: String::new(),
            })
            .await;
        assert_eq!(outcome.error, Some(SyncError::MissingCredential));
        assert!(!browser.was_closed(), "no session should have been opened");
    }

    #[tokio::test]
    async fn already_authenticated_session_skips_login_form() {
        let profile = base_profile();
        // Login URL serves a page without the login form.
        let mut no_form = roster_page(&profile);
        no_form.title = "Home".into();
        let browser = Arc::new(
            ScriptedBrowser::new()
                .with_page(&profile.login_url, no_form)
                .with_page(&profile.roster_url, roster_page(&profile)),
        );
        let engine = ExtractionEngine::new(browser.clone(), profile);

        let outcome = engine.scrape(&credential()).await;
        assert!(outcome.success, "log: {:?}", outcome.log);
        assert!(browser.typed.lock().unwrap().is_empty());
    }
}

//! Core domain model and canonicalization for Rosterflow.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "rflow-core";

/// Failure taxonomy for the scrape-to-calendar pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum SyncError {
    #[error("missing portal credential")]
    MissingCredential,
    #[error("portal login rejected")]
    AuthenticationFailed,
    #[error("portal rate limited the session")]
    UpstreamRateLimited,
    #[error("extraction failed: {0}")]
    ExtractionFailed(String),
    #[error("store write failed: {0}")]
    PersistenceFailed(String),
    #[error("calendar container unresolved: {0}")]
    CalendarContainerUnresolved(String),
    #[error("calendar mutation failed: {0}")]
    CalendarMutationFailed(String),
    #[error("canonicalization failed: {0}")]
    Canonical(String),
}

/// Portal login material, decrypted only transiently for a scrape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

/// One roster row exactly as extracted from the portal table, before any
/// timestamp math. Date/time fields carry the portal's `DD/MM/YYYY[ HH:MM]`
/// wall-clock strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRosterEntry {
    pub person: String,
    pub date: String,
    pub start: String,
    pub end: String,
    pub entry_type: String,
    pub function: String,
    pub department: String,
    pub vessel: String,
}

/// Canonical persisted roster record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    /// Content-addressed key over (person, date, start, type). Stable across
    /// scrapes of unchanged source data.
    pub identity: String,
    pub person: String,
    pub date: NaiveDate,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub entry_type: String,
    pub function: String,
    pub department: String,
    pub vessel: String,
    pub last_seen_at: DateTime<Utc>,
}

impl RosterEntry {
    /// Canonicalize a scraped row: wall-clock strings become UTC instants and
    /// the identity key is derived. Rejects rows whose end precedes start.
    pub fn from_raw(raw: &RawRosterEntry, seen_at: DateTime<Utc>) -> Result<Self, SyncError> {
        let start = to_utc_instant(&raw.start)?;
        let end = to_utc_instant(&raw.end)?;
        if end < start {
            return Err(SyncError::Canonical(format!(
                "entry end {} precedes start {}",
                raw.end, raw.start
            )));
        }
        let date = local_date(&raw.date)?;
        let identity = identity_key(&raw.person, date, start, &raw.entry_type);
        Ok(Self {
            identity,
            person: raw.person.clone(),
            date,
            start,
            end,
            entry_type: raw.entry_type.clone(),
            function: raw.function.clone(),
            department: raw.department.clone(),
            vessel: raw.vessel.clone(),
            last_seen_at: seen_at,
        })
    }

    /// True when the entry carries wall-clock hours rather than spanning
    /// whole days (midnight-to-midnight).
    pub fn has_specific_hours(&self) -> bool {
        let midnight = NaiveTime::from_hms_opt(0, 0, 0).expect("midnight");
        !(local_wall_clock(self.start).time() == midnight
            && local_wall_clock(self.end).time() == midnight)
    }
}

/// Per-person sync bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub last_sync_at: Option<DateTime<Utc>>,
    pub interval_minutes: i64,
    pub calendar_id: Option<String>,
}

/// OAuth material for the external calendar; refresh is the calendar
/// client's responsibility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarLink {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_expiry: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: Uuid,
    pub person: String,
    pub display_name: String,
    pub encrypted_credential: Option<String>,
    pub calendar: Option<CalendarLink>,
    pub sync_state: SyncState,
}

/// Partial update applied to a user's sync bookkeeping after a run or a
/// token rotation. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatePatch {
    pub last_sync_at: Option<DateTime<Utc>>,
    pub calendar_id: Option<String>,
    pub display_name: Option<String>,
    pub access_token: Option<String>,
    pub token_expiry: Option<DateTime<Utc>>,
}

/// Human-readable outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeReport {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
}

impl ChangeReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    pub fn mutation_count(&self) -> usize {
        self.added.len() + self.modified.len() + self.removed.len()
    }
}

/// Derive the stable identity key for a roster entry. Deterministic:
/// repeated scrapes of unchanged data always produce the same key.
pub fn identity_key(
    person: &str,
    date: NaiveDate,
    start: DateTime<Utc>,
    entry_type: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(person.as_bytes());
    hasher.update(b"|");
    hasher.update(date.format("%Y-%m-%d").to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(start.to_rfc3339().as_bytes());
    hasher.update(b"|");
    hasher.update(entry_type.as_bytes());
    hex::encode(hasher.finalize())
}

// Central European zone rule: UTC+1 standard, UTC+2 daylight. Daylight runs
// from the last Sunday of March 01:00 UTC through the last Sunday of
// October 01:00 UTC.
const STANDARD_OFFSET_HOURS: i64 = 1;
const DAYLIGHT_OFFSET_HOURS: i64 = 2;

fn last_sunday(year: i32, month: u32) -> NaiveDate {
    let first_of_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .expect("valid month start");
    let last_day = first_of_next.pred_opt().expect("month has days");
    last_day - Duration::days(last_day.weekday().num_days_from_sunday() as i64)
}

fn daylight_window(year: i32) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = last_sunday(year, 3)
        .and_hms_opt(1, 0, 0)
        .expect("valid transition time");
    let end = last_sunday(year, 10)
        .and_hms_opt(1, 0, 0)
        .expect("valid transition time");
    (Utc.from_utc_datetime(&start), Utc.from_utc_datetime(&end))
}

/// Convert a portal wall-clock string (`DD/MM/YYYY[ HH:MM]`, time defaults
/// to midnight) to the UTC instant under the explicit zone rule above.
/// Idempotent: an already-canonical RFC 3339 input is returned unchanged.
pub fn to_utc_instant(text: &str) -> Result<DateTime<Utc>, SyncError> {
    let trimmed = text.trim();
    if let Ok(already) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(already.with_timezone(&Utc));
    }
    let naive = parse_wall_clock(trimmed)?;
    // Assume standard time first, then re-apply the daylight offset if the
    // candidate instant falls inside the daylight window.
    let standard = Utc.from_utc_datetime(&(naive - Duration::hours(STANDARD_OFFSET_HOURS)));
    let (dst_start, dst_end) = daylight_window(standard.year());
    if standard >= dst_start && standard < dst_end {
        Ok(Utc.from_utc_datetime(&(naive - Duration::hours(DAYLIGHT_OFFSET_HOURS))))
    } else {
        Ok(standard)
    }
}

/// The source-local calendar date of a portal date string. Accepts both
/// `DD/MM/YYYY[ HH:MM]` and already-canonical `YYYY-MM-DD` forms.
pub fn local_date(text: &str) -> Result<NaiveDate, SyncError> {
    let trimmed = text.trim();
    let date_part = trimmed.split_whitespace().next().unwrap_or(trimmed);
    let date_part = date_part.split('T').next().unwrap_or(date_part);
    if let Ok(date) = NaiveDate::parse_from_str(date_part, "%Y-%m-%d") {
        return Ok(date);
    }
    parse_date_part(date_part)
}

fn parse_wall_clock(text: &str) -> Result<NaiveDateTime, SyncError> {
    let mut parts = text.split_whitespace();
    let date_part = parts
        .next()
        .ok_or_else(|| SyncError::Canonical(format!("empty date string {text:?}")))?;
    let date = parse_date_part(date_part)?;
    let time = match parts.next() {
        Some(time_part) => parse_time_part(time_part)?,
        None => NaiveTime::from_hms_opt(0, 0, 0).expect("midnight"),
    };
    Ok(date.and_time(time))
}

fn parse_date_part(text: &str) -> Result<NaiveDate, SyncError> {
    let mut fields = text.split('/');
    let day = next_number(&mut fields, text)?;
    let month = next_number(&mut fields, text)?;
    let year = next_number(&mut fields, text)?;
    if fields.next().is_some() {
        return Err(SyncError::Canonical(format!("malformed date {text:?}")));
    }
    NaiveDate::from_ymd_opt(year as i32, month, day)
        .ok_or_else(|| SyncError::Canonical(format!("invalid calendar date {text:?}")))
}

fn parse_time_part(text: &str) -> Result<NaiveTime, SyncError> {
    let mut fields = text.split(':');
    let hours = next_number(&mut fields, text)?;
    let minutes = next_number(&mut fields, text)?;
    NaiveTime::from_hms_opt(hours, minutes, 0)
        .ok_or_else(|| SyncError::Canonical(format!("invalid time of day {text:?}")))
}

fn next_number<'a>(
    fields: &mut impl Iterator<Item = &'a str>,
    original: &str,
) -> Result<u32, SyncError> {
    fields
        .next()
        .and_then(|f| f.trim().parse::<u32>().ok())
        .ok_or_else(|| SyncError::Canonical(format!("malformed date/time {original:?}")))
}

/// Wall-clock view of a stored UTC instant under the same zone rule, used
/// when rendering `HH:MM` ranges into event titles.
pub fn local_wall_clock(instant: DateTime<Utc>) -> NaiveDateTime {
    let (dst_start, dst_end) = daylight_window(instant.year());
    let offset = if instant >= dst_start && instant < dst_end {
        DAYLIGHT_OFFSET_HOURS
    } else {
        STANDARD_OFFSET_HOURS
    };
    instant.naive_utc() + Duration::hours(offset)
}

/// Defensive retrieval-time dedup: keep first-seen per
/// `(start, end, entry_type)`, preserving input order. Idempotent.
pub fn dedupe(entries: Vec<RosterEntry>) -> Vec<RosterEntry> {
    let mut seen = std::collections::HashSet::new();
    entries
        .into_iter()
        .filter(|entry| seen.insert((entry.start, entry.end, entry.entry_type.clone())))
        .collect()
}

/// Business rules around entry types. Deliberately small and isolated: the
/// pending-request heuristic approximates the portal's state model from
/// visual/structural markers and may need refinement without touching the
/// rest of the pipeline.
pub mod policy {
    /// Leave rows are the only ones that can be pending requests.
    pub const LEAVE_MARKER: &str = "Leave";
    /// Suffix the extraction engine appends to a pending leave row's type.
    pub const PENDING_SUFFIX: &str = " (pending)";
    /// Categories that are never mirrored to the calendar.
    pub const EXCLUDED_MARKERS: [&str; 2] = ["Rest", "Reserve"];
    /// Row background colors the portal uses for unconfirmed requests.
    pub const PENDING_HIGHLIGHT_COLORS: [&str; 2] = ["#80ffff", "cyan"];

    /// True iff the row should carry the pending qualifier: a visual
    /// highlight OR a cancel affordance, on a leave-type row.
    pub fn pending_qualifier(
        entry_type: &str,
        row_highlighted: bool,
        has_cancel_affordance: bool,
    ) -> bool {
        (row_highlighted || has_cancel_affordance) && entry_type.contains(LEAVE_MARKER)
    }

    pub fn row_style_is_highlighted(style: &str) -> bool {
        let lower = style.to_ascii_lowercase();
        PENDING_HIGHLIGHT_COLORS.iter().any(|c| lower.contains(c))
    }

    pub fn apply_pending_suffix(entry_type: &str) -> String {
        if entry_type.ends_with(PENDING_SUFFIX) {
            entry_type.to_string()
        } else {
            format!("{entry_type}{PENDING_SUFFIX}")
        }
    }

    pub fn is_pending(entry_type: &str) -> bool {
        entry_type.ends_with(PENDING_SUFFIX)
    }

    /// The non-qualified sibling type a pending entry supersedes.
    pub fn base_entry_type(entry_type: &str) -> &str {
        entry_type.strip_suffix(PENDING_SUFFIX).unwrap_or(entry_type)
    }

    pub fn is_excluded_type(entry_type: &str) -> bool {
        EXCLUDED_MARKERS.iter().any(|m| entry_type.contains(m))
    }
}

/// Reformat the portal's "SURNAME Firstname" display name (surname in all
/// caps) to "Firstname Surname" title case. Falls back to the raw string
/// when the all-caps heuristic doesn't cleanly separate the two groups.
pub fn format_display_name(raw: &str) -> String {
    let words: Vec<&str> = raw.split_whitespace().collect();
    let surname_len = words
        .iter()
        .take_while(|w| is_all_caps_word(w))
        .count();
    if surname_len == 0 || surname_len == words.len() {
        return words.join(" ");
    }
    let given = words[surname_len..].join(" ");
    let surname = words[..surname_len]
        .iter()
        .map(|w| title_case_word(w))
        .collect::<Vec<_>>()
        .join(" ");
    format!("{given} {surname}")
}

fn is_all_caps_word(word: &str) -> bool {
    let mut saw_alpha = false;
    for ch in word.chars() {
        if ch.is_alphabetic() {
            saw_alpha = true;
            if !ch.is_uppercase() {
                return false;
            }
        }
    }
    saw_alpha
}

fn title_case_word(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => {
            let mut out = String::new();
            out.extend(first.to_uppercase());
            out.push_str(&chars.as_str().to_lowercase());
            out
        }
        None => String::new(),
    }
}

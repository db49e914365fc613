//! Roster store, user directory and credential encryption for Rosterflow.

use std::collections::HashMap;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, NaiveDate, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use rflow_core::{
    policy, CalendarLink, Credential, RosterEntry, SyncState, SyncStatePatch, UserRecord,
};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "rflow-storage";

/// How long superseded roster history is retained.
pub const RETENTION_DAYS: i64 = 365;
/// Interval assigned to newly created users, in minutes.
pub const DEFAULT_SYNC_INTERVAL_MINUTES: i64 = 360;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0}")]
    Message(String),
    #[error("credential cipher error: {0}")]
    Crypto(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertStats {
    pub written: usize,
    /// Non-qualified siblings removed because a pending version arrived.
    pub superseded: usize,
}

/// Persistent roster record set, keyed by entry identity. Conflict key is
/// `(person, start, end, entry_type)`, which the identity hash subsumes.
#[async_trait]
pub trait RosterStore: Send + Sync {
    async fn upsert(&self, person: &str, entries: &[RosterEntry]) -> Result<UpsertStats, StoreError>;
    async fn query(
        &self,
        person: &str,
        range: Option<(NaiveDate, NaiveDate)>,
    ) -> Result<Vec<RosterEntry>, StoreError>;
    /// Retention cleanup: drop entries dated before `cutoff`.
    async fn delete_older_than(&self, person: &str, cutoff: NaiveDate) -> Result<u64, StoreError>;
    /// Stale-data cleanup: drop today-or-future entries that were not
    /// refreshed within the current scrape window.
    async fn delete_stale_active(
        &self,
        person: &str,
        watermark: DateTime<Utc>,
        today: NaiveDate,
    ) -> Result<u64, StoreError>;
    async fn first_data_date(&self, person: &str) -> Result<Option<NaiveDate>, StoreError>;
    /// Account reset: remove every entry for the person.
    async fn purge_person(&self, person: &str) -> Result<u64, StoreError>;
}

/// Per-person account records and sync bookkeeping.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Case-insensitive lookup; creates the record on first login. A
    /// credential is required to create; when one is supplied for an
    /// existing record and differs from the stored one, it is re-encrypted
    /// and stored.
    async fn find_or_create(
        &self,
        person: &str,
        credential: Option<&Credential>,
    ) -> Result<UserRecord, StoreError>;
    async fn get(&self, person: &str) -> Result<Option<UserRecord>, StoreError>;
    async fn list(&self) -> Result<Vec<UserRecord>, StoreError>;
    async fn update_sync_state(&self, id: Uuid, patch: SyncStatePatch) -> Result<(), StoreError>;
    /// Account reset: drop the record entirely.
    async fn reset(&self, person: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct SealedCredential {
    nonce: Vec<u8>,
    ciphertext: Vec<u8>,
}

/// AES-256-GCM cipher for credentials at rest. Payloads are
/// base64(json{nonce, ciphertext}) with a fresh random nonce per seal.
#[derive(Clone)]
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCipher").finish_non_exhaustive()
    }
}

impl CredentialCipher {
    /// Build from a 64-char hex key (32 bytes).
    pub fn from_hex_key(hex_key: &str) -> Result<Self, StoreError> {
        let key = hex::decode(hex_key.trim())
            .map_err(|e| StoreError::Crypto(format!("key is not valid hex: {e}")))?;
        if key.len() != 32 {
            return Err(StoreError::Crypto(format!(
                "key must be 32 bytes, got {}",
                key.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| StoreError::Crypto(format!("cipher construction failed: {e}")))?;
        Ok(Self { cipher })
    }

    pub fn generate_hex_key() -> String {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        hex::encode(key)
    }

    pub fn seal(&self, plaintext: &str) -> Result<String, StoreError> {
        let mut nonce = [0u8; 12];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|e| StoreError::Crypto(format!("encryption failed: {e}")))?;
        let payload = SealedCredential {
            nonce: nonce.to_vec(),
            ciphertext,
        };
        let bytes = serde_json::to_vec(&payload)
            .map_err(|e| StoreError::Crypto(format!("payload serialization failed: {e}")))?;
        Ok(BASE64.encode(bytes))
    }

    pub fn open(&self, sealed: &str) -> Result<String, StoreError> {
        let bytes = BASE64
            .decode(sealed)
            .map_err(|e| StoreError::Crypto(format!("payload is not valid base64: {e}")))?;
        let payload: SealedCredential = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::Crypto(format!("payload deserialization failed: {e}")))?;
        if payload.nonce.len() != 12 {
            return Err(StoreError::Crypto("nonce must be 12 bytes".into()));
        }
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&payload.nonce), payload.ciphertext.as_ref())
            .map_err(|e| StoreError::Crypto(format!("decryption failed: {e}")))?;
        String::from_utf8(plaintext)
            .map_err(|e| StoreError::Crypto(format!("plaintext is not UTF-8: {e}")))
    }
}

/// In-memory roster store used by tests and offline runs.
#[derive(Debug, Default)]
pub struct MemoryRosterStore {
    entries: Mutex<HashMap<String, HashMap<String, RosterEntry>>>,
}

impl MemoryRosterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RosterStore for MemoryRosterStore {
    async fn upsert(&self, person: &str, entries: &[RosterEntry]) -> Result<UpsertStats, StoreError> {
        let mut map = self.entries.lock().await;
        let bucket = map.entry(person.to_string()).or_default();
        let mut stats = UpsertStats::default();

        // A pending leave supersedes its non-qualified sibling: same person
        // and start, base type. Remove the sibling before upserting.
        for entry in entries.iter().filter(|e| policy::is_pending(&e.entry_type)) {
            let base = policy::base_entry_type(&entry.entry_type).to_string();
            let start = entry.start;
            let before = bucket.len();
            bucket.retain(|_, stored| !(stored.start == start && stored.entry_type == base));
            stats.superseded += before - bucket.len();
        }

        for entry in entries {
            bucket.insert(entry.identity.clone(), entry.clone());
            stats.written += 1;
        }
        Ok(stats)
    }

    async fn query(
        &self,
        person: &str,
        range: Option<(NaiveDate, NaiveDate)>,
    ) -> Result<Vec<RosterEntry>, StoreError> {
        let map = self.entries.lock().await;
        let mut out: Vec<RosterEntry> = map
            .get(person)
            .map(|bucket| bucket.values().cloned().collect())
            .unwrap_or_default();
        if let Some((from, to)) = range {
            out.retain(|e| e.date >= from && e.date <= to);
        }
        out.sort_by_key(|e| (e.start, e.entry_type.clone()));
        Ok(out)
    }

    async fn delete_older_than(&self, person: &str, cutoff: NaiveDate) -> Result<u64, StoreError> {
        let mut map = self.entries.lock().await;
        let Some(bucket) = map.get_mut(person) else {
            return Ok(0);
        };
        let before = bucket.len();
        bucket.retain(|_, e| e.date >= cutoff);
        Ok((before - bucket.len()) as u64)
    }

    async fn delete_stale_active(
        &self,
        person: &str,
        watermark: DateTime<Utc>,
        today: NaiveDate,
    ) -> Result<u64, StoreError> {
        let mut map = self.entries.lock().await;
        let Some(bucket) = map.get_mut(person) else {
            return Ok(0);
        };
        let before = bucket.len();
        bucket.retain(|_, e| e.date < today || e.last_seen_at >= watermark);
        Ok((before - bucket.len()) as u64)
    }

    async fn first_data_date(&self, person: &str) -> Result<Option<NaiveDate>, StoreError> {
        let map = self.entries.lock().await;
        Ok(map
            .get(person)
            .and_then(|bucket| bucket.values().map(|e| e.date).min()))
    }

    async fn purge_person(&self, person: &str) -> Result<u64, StoreError> {
        let mut map = self.entries.lock().await;
        Ok(map.remove(person).map(|b| b.len() as u64).unwrap_or(0))
    }
}

/// In-memory user directory used by tests and offline runs.
pub struct MemoryUserDirectory {
    cipher: CredentialCipher,
    users: Mutex<HashMap<Uuid, UserRecord>>,
}

impl MemoryUserDirectory {
    pub fn new(cipher: CredentialCipher) -> Self {
        Self {
            cipher,
            users: Mutex::new(HashMap::new()),
        }
    }

    pub fn cipher(&self) -> &CredentialCipher {
        &self.cipher
    }

    /// Test seam: attach a calendar link to an existing record.
    pub async fn link_calendar(&self, person: &str, link: CalendarLink) {
        let mut users = self.users.lock().await;
        if let Some(user) = users
            .values_mut()
            .find(|u| u.person.eq_ignore_ascii_case(person))
        {
            user.calendar = Some(link);
        }
    }
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn find_or_create(
        &self,
        person: &str,
        credential: Option<&Credential>,
    ) -> Result<UserRecord, StoreError> {
        let mut users = self.users.lock().await;
        if let Some(user) = users
            .values_mut()
            .find(|u| u.person.eq_ignore_ascii_case(person))
        {
            if let Some(credential) = credential {
                let stored = user
                    .encrypted_credential
                    .as_deref()
                    .and_then(|sealed| self.cipher.open(sealed).ok());
                if stored.as_deref() != Some(credential.password.as_str()) {
                    user.encrypted_credential = Some(self.cipher.seal(&credential.password)?);
                    debug!(person, "stored credential rotated");
                }
            }
            return Ok(user.clone());
        }

        let Some(credential) = credential else {
            return Err(StoreError::Message(
                "credential required for first-time login".into(),
            ));
        };
        let user = UserRecord {
            id: Uuid::new_v4(),
            person: person.to_string(),
            display_name: person.to_string(),
            encrypted_credential: Some(self.cipher.seal(&credential.password)?),
            calendar: None,
            sync_state: SyncState {
                last_sync_at: None,
                interval_minutes: DEFAULT_SYNC_INTERVAL_MINUTES,
                calendar_id: None,
            },
        };
        users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn get(&self, person: &str) -> Result<Option<UserRecord>, StoreError> {
        let users = self.users.lock().await;
        Ok(users
            .values()
            .find(|u| u.person.eq_ignore_ascii_case(person))
            .cloned())
    }

    async fn list(&self) -> Result<Vec<UserRecord>, StoreError> {
        let users = self.users.lock().await;
        let mut out: Vec<UserRecord> = users.values().cloned().collect();
        out.sort_by(|a, b| a.person.cmp(&b.person));
        Ok(out)
    }

    async fn update_sync_state(&self, id: Uuid, patch: SyncStatePatch) -> Result<(), StoreError> {
        let mut users = self.users.lock().await;
        let user = users
            .get_mut(&id)
            .ok_or_else(|| StoreError::Message(format!("no user with id {id}")))?;
        if let Some(at) = patch.last_sync_at {
            user.sync_state.last_sync_at = Some(at);
        }
        if let Some(calendar_id) = patch.calendar_id {
            user.sync_state.calendar_id = Some(calendar_id);
        }
        if let Some(name) = patch.display_name {
            user.display_name = name;
        }
        if let Some(token) = patch.access_token {
            if let Some(link) = user.calendar.as_mut() {
                link.access_token = token;
                link.token_expiry = patch.token_expiry;
            }
        }
        Ok(())
    }

    async fn reset(&self, person: &str) -> Result<(), StoreError> {
        let mut users = self.users.lock().await;
        users.retain(|_, u| !u.person.eq_ignore_ascii_case(person));
        Ok(())
    }
}

/// Apply the schema. The migration file is idempotent, so this is safe to
/// run on every startup.
pub async fn apply_schema(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::raw_sql(include_str!("../migrations/0001_init.sql"))
        .execute(pool)
        .await?;
    Ok(())
}

/// Postgres-backed roster store. Schema in `migrations/0001_init.sql`.
#[derive(Debug, Clone)]
pub struct PgRosterStore {
    pool: PgPool,
}

impl PgRosterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RosterStore for PgRosterStore {
    async fn upsert(&self, person: &str, entries: &[RosterEntry]) -> Result<UpsertStats, StoreError> {
        let mut stats = UpsertStats::default();

        for entry in entries.iter().filter(|e| policy::is_pending(&e.entry_type)) {
            let result = sqlx::query(
                r#"
                DELETE FROM roster_entries
                 WHERE person = $1 AND start_at = $2 AND entry_type = $3
                "#,
            )
            .bind(person)
            .bind(entry.start)
            .bind(policy::base_entry_type(&entry.entry_type))
            .execute(&self.pool)
            .await?;
            stats.superseded += result.rows_affected() as usize;
        }

        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO roster_entries
                    (identity, person, date, start_at, end_at, entry_type,
                     function, department, vessel, last_seen_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (identity) DO UPDATE
                   SET end_at = EXCLUDED.end_at,
                       function = EXCLUDED.function,
                       department = EXCLUDED.department,
                       vessel = EXCLUDED.vessel,
                       last_seen_at = EXCLUDED.last_seen_at
                "#,
            )
            .bind(&entry.identity)
            .bind(&entry.person)
            .bind(entry.date)
            .bind(entry.start)
            .bind(entry.end)
            .bind(&entry.entry_type)
            .bind(&entry.function)
            .bind(&entry.department)
            .bind(&entry.vessel)
            .bind(entry.last_seen_at)
            .execute(&self.pool)
            .await?;
            stats.written += 1;
        }
        Ok(stats)
    }

    async fn query(
        &self,
        person: &str,
        range: Option<(NaiveDate, NaiveDate)>,
    ) -> Result<Vec<RosterEntry>, StoreError> {
        let rows = match range {
            Some((from, to)) => {
                sqlx::query(
                    r#"
                    SELECT identity, person, date, start_at, end_at, entry_type,
                           function, department, vessel, last_seen_at
                      FROM roster_entries
                     WHERE person = $1 AND date >= $2 AND date <= $3
                     ORDER BY start_at, entry_type
                    "#,
                )
                .bind(person)
                .bind(from)
                .bind(to)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT identity, person, date, start_at, end_at, entry_type,
                           function, department, vessel, last_seen_at
                      FROM roster_entries
                     WHERE person = $1
                     ORDER BY start_at, entry_type
                    "#,
                )
                .bind(person)
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(RosterEntry {
                identity: row.try_get("identity")?,
                person: row.try_get("person")?,
                date: row.try_get("date")?,
                start: row.try_get("start_at")?,
                end: row.try_get("end_at")?,
                entry_type: row.try_get("entry_type")?,
                function: row.try_get("function")?,
                department: row.try_get("department")?,
                vessel: row.try_get("vessel")?,
                last_seen_at: row.try_get("last_seen_at")?,
            });
        }
        Ok(out)
    }

    async fn delete_older_than(&self, person: &str, cutoff: NaiveDate) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM roster_entries WHERE person = $1 AND date < $2",
        )
        .bind(person)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_stale_active(
        &self,
        person: &str,
        watermark: DateTime<Utc>,
        today: NaiveDate,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM roster_entries
             WHERE person = $1 AND date >= $2 AND last_seen_at < $3
            "#,
        )
        .bind(person)
        .bind(today)
        .bind(watermark)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn first_data_date(&self, person: &str) -> Result<Option<NaiveDate>, StoreError> {
        let row = sqlx::query(
            "SELECT MIN(date) AS first_date FROM roster_entries WHERE person = $1",
        )
        .bind(person)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("first_date")?)
    }

    async fn purge_person(&self, person: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM roster_entries WHERE person = $1")
            .bind(person)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Postgres-backed user directory.
#[derive(Clone)]
pub struct PgUserDirectory {
    pool: PgPool,
    cipher: CredentialCipher,
}

impl PgUserDirectory {
    pub fn new(pool: PgPool, cipher: CredentialCipher) -> Self {
        Self { pool, cipher }
    }

    fn user_from_row(row: &sqlx::postgres::PgRow) -> Result<UserRecord, StoreError> {
        let access_token: Option<String> = row.try_get("access_token")?;
        let calendar = access_token.map(|access_token| CalendarLink {
            access_token,
            refresh_token: row.try_get("refresh_token").unwrap_or(None),
            token_expiry: row.try_get("token_expiry").unwrap_or(None),
        });
        Ok(UserRecord {
            id: row.try_get("id")?,
            person: row.try_get("person")?,
            display_name: row.try_get("display_name")?,
            encrypted_credential: row.try_get("encrypted_credential")?,
            calendar,
            sync_state: SyncState {
                last_sync_at: row.try_get("last_sync_at")?,
                interval_minutes: row.try_get("interval_minutes")?,
                calendar_id: row.try_get("calendar_id")?,
            },
        })
    }
}

const USER_COLUMNS: &str = "id, person, display_name, encrypted_credential, access_token, \
                            refresh_token, token_expiry, last_sync_at, interval_minutes, \
                            calendar_id";

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn find_or_create(
        &self,
        person: &str,
        credential: Option<&Credential>,
    ) -> Result<UserRecord, StoreError> {
        let existing = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE LOWER(person) = LOWER($1)"
        ))
        .bind(person)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = existing {
            let mut user = Self::user_from_row(&row)?;
            if let Some(credential) = credential {
                let stored = user
                    .encrypted_credential
                    .as_deref()
                    .and_then(|sealed| self.cipher.open(sealed).ok());
                if stored.as_deref() != Some(credential.password.as_str()) {
                    let sealed = self.cipher.seal(&credential.password)?;
                    sqlx::query("UPDATE users SET encrypted_credential = $2 WHERE id = $1")
                        .bind(user.id)
                        .bind(&sealed)
                        .execute(&self.pool)
                        .await?;
                    user.encrypted_credential = Some(sealed);
                }
            }
            return Ok(user);
        }

        let Some(credential) = credential else {
            return Err(StoreError::Message(
                "credential required for first-time login".into(),
            ));
        };
        let id = Uuid::new_v4();
        let sealed = self.cipher.seal(&credential.password)?;
        sqlx::query(
            r#"
            INSERT INTO users (id, person, display_name, encrypted_credential, interval_minutes)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(id)
        .bind(person)
        .bind(person)
        .bind(&sealed)
        .bind(DEFAULT_SYNC_INTERVAL_MINUTES)
        .execute(&self.pool)
        .await?;

        Ok(UserRecord {
            id,
            person: person.to_string(),
            display_name: person.to_string(),
            encrypted_credential: Some(sealed),
            calendar: None,
            sync_state: SyncState {
                last_sync_at: None,
                interval_minutes: DEFAULT_SYNC_INTERVAL_MINUTES,
                calendar_id: None,
            },
        })
    }

    async fn get(&self, person: &str) -> Result<Option<UserRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE LOWER(person) = LOWER($1)"
        ))
        .bind(person)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| Self::user_from_row(&r)).transpose()
    }

    async fn list(&self) -> Result<Vec<UserRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users ORDER BY person"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::user_from_row).collect()
    }

    async fn update_sync_state(&self, id: Uuid, patch: SyncStatePatch) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE users
               SET last_sync_at = COALESCE($2, last_sync_at),
                   calendar_id = COALESCE($3, calendar_id),
                   display_name = COALESCE($4, display_name),
                   access_token = COALESCE($5, access_token),
                   token_expiry = COALESCE($6, token_expiry)
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(patch.last_sync_at)
        .bind(patch.calendar_id)
        .bind(patch.display_name)
        .bind(patch.access_token)
        .bind(patch.token_expiry)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reset(&self, person: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM users WHERE LOWER(person) = LOWER($1)")
            .bind(person)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

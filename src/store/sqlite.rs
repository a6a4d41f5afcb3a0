use std::fmt::Display;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{Connection, DatabaseName, OptionalExtension, Row, params, params_from_iter};
use uuid::Uuid;

use super::digest::ContentDigest;
use super::schema::SCHEMA;
use super::{Pagination, Scope, Store, timestamp};
use crate::codec::Encoding;
use crate::error::{Error, Result};
use crate::types::*;

const COMPANY_COLS: &str =
    "id, name, sync_addr, sync_api_key, active, created_at, updated_at";
const USER_COLS: &str =
    "id, company_id, username, email, password_hash, role, active, created_at";
const SLICE_COLS: &str = "s.id, s.name, s.slice_type, s.content_hash, s.content_count, \
     s.content_date, s.allow_sync, s.sync_status, s.last_sync_attempt, s.last_good_sync, \
     s.created_at, s.updated_at";
// Streamed payloads are stored as blobs; reading them back as text keeps
// both kinds interchangeable.
const GRAIN_FULL: &str =
    "g.id, g.slice_id, g.grain_key, g.encoding, CAST(g.payload AS TEXT), g.source, g.created_at";
const GRAIN_BRIEF: &str =
    "g.id, g.slice_id, g.grain_key, g.encoding, NULL, g.source, g.created_at";
const SUB_COLS: &str =
    "sub.sub_id, sub.slice_id, sub.company_id, sub.name, sub.description, sub.active, sub.created_at";

/// A holder of the `updating` status older than this is presumed dead.
const STALE_SYNC_SECS: i64 = 60 * 60;
/// Keeps `IN (...)` lists well under SQLite's bound-parameter limit.
const DELETE_CHUNK: usize = 500;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Parses a text column through `FromStr`, surfacing failures as conversion
/// errors on that column.
fn parse_col<T>(row: &Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.to_string().into())
    })
}

fn parse_opt_time(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => raw.parse::<DateTime<Utc>>().map(Some).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.to_string().into())
        }),
        None => Ok(None),
    }
}

fn company_from_row(row: &Row) -> rusqlite::Result<Company> {
    Ok(Company {
        id: parse_col(row, 0)?,
        name: row.get(1)?,
        sync_addr: row.get(2)?,
        sync_api_key: row.get(3)?,
        active: row.get(4)?,
        created_at: parse_col(row, 5)?,
        updated_at: parse_col(row, 6)?,
    })
}

fn user_from_row(row: &Row) -> rusqlite::Result<User> {
    let level: i32 = row.get(5)?;
    let role = Role::try_from(level)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Integer, e.into()))?;
    Ok(User {
        id: parse_col(row, 0)?,
        company_id: parse_col(row, 1)?,
        username: row.get(2)?,
        email: row.get(3)?,
        password_hash: row.get(4)?,
        role,
        active: row.get(6)?,
        created_at: parse_col(row, 7)?,
    })
}

/// Maps `SLICE_COLS` starting at `base`. Metadata is loaded separately.
fn slice_from_row(row: &Row, base: usize) -> rusqlite::Result<Slice> {
    Ok(Slice {
        id: parse_col(row, base)?,
        name: row.get(base + 1)?,
        slice_type: parse_col(row, base + 2)?,
        content_hash: row.get(base + 3)?,
        content_count: row.get(base + 4)?,
        content_date: parse_col(row, base + 5)?,
        allow_sync: row.get(base + 6)?,
        sync_status: parse_col(row, base + 7)?,
        last_sync_attempt: parse_opt_time(row, base + 8)?,
        last_good_sync: parse_opt_time(row, base + 9)?,
        created_at: parse_col(row, base + 10)?,
        updated_at: parse_col(row, base + 11)?,
        metadata: Metadata::new(),
    })
}

fn grain_from_row(row: &Row) -> rusqlite::Result<Grain> {
    Ok(Grain {
        id: parse_col(row, 0)?,
        slice_id: parse_col(row, 1)?,
        grain_key: row.get(2)?,
        encoding: parse_col(row, 3)?,
        payload: row.get(4)?,
        source: row.get(5)?,
        created_at: parse_col(row, 6)?,
    })
}

fn subscription_from_row(row: &Row) -> rusqlite::Result<Subscription> {
    Ok(Subscription {
        sub_id: parse_col(row, 0)?,
        slice_id: parse_col(row, 1)?,
        company_id: parse_col(row, 2)?,
        name: row.get(3)?,
        description: row.get(4)?,
        active: row.get(5)?,
        created_at: parse_col(row, 6)?,
        slice: None,
    })
}

fn load_metadata(conn: &Connection, slice_id: Uuid) -> Result<Metadata> {
    let mut stmt =
        conn.prepare_cached("SELECT key, value FROM slice_metadata WHERE slice_id = ?1")?;
    let rows = stmt.query_map(params![slice_id.to_string()], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    rows.collect::<std::result::Result<Metadata, _>>()
        .map_err(Error::from)
}

fn insert_metadata(conn: &Connection, slice_id: Uuid, metadata: &Metadata) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO slice_metadata (slice_id, key, value) VALUES (?1, ?2, ?3)",
    )?;
    for (key, value) in metadata {
        stmt.execute(params![slice_id.to_string(), key, value])?;
    }
    Ok(())
}

fn fetch_slice(conn: &Connection, clause: &str, param: &str) -> Result<Slice> {
    let sql = format!("SELECT {SLICE_COLS} FROM slices s WHERE {clause}");
    let mut slice = conn
        .query_row(&sql, params![param], |row| slice_from_row(row, 0))
        .optional()?
        .ok_or(Error::NotFound)?;
    slice.metadata = load_metadata(conn, slice.id)?;
    Ok(slice)
}

/// Inserts a slice row as first seen from a remote: unlocked, with an unknown
/// content summary. `or_ignore` leaves an existing row with the same id
/// alone; a different slice holding the name is still a conflict.
fn insert_remote_slice(conn: &Connection, slice: &Slice, or_ignore: bool) -> Result<usize> {
    let conflict = if or_ignore {
        "ON CONFLICT(id) DO NOTHING"
    } else {
        ""
    };
    let sql = format!(
        "INSERT INTO slices (id, name, slice_type, content_hash, content_count, content_date,
                             allow_sync, sync_status, created_at, updated_at)
         VALUES (?1, ?2, ?3, NULL, 0, ?4, 1, 'none', ?5, ?6) {conflict}"
    );
    conn.execute(
        &sql,
        params![
            slice.id.to_string(),
            slice.name,
            slice.slice_type.as_str(),
            timestamp(&slice.content_date),
            timestamp(&slice.created_at),
            timestamp(&slice.updated_at),
        ],
    )
    .map_err(|e| Error::from_insert(e, &format!("slice '{}'", slice.name)))
}

/// Recomputes a slice's content summary, streaming each payload out of the
/// database into the digest.
fn summarize(conn: &Connection, key: &str) -> Result<()> {
    let updated_at: String = conn
        .query_row(
            "SELECT updated_at FROM slices WHERE id = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?
        .ok_or(Error::NotFound)?;

    let grains = {
        let mut stmt = conn.prepare_cached(
            "SELECT rowid, grain_key, encoding, created_at FROM grains
             WHERE slice_id = ?1 ORDER BY grain_key",
        )?;
        stmt.query_map(params![key], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                parse_col::<Encoding>(row, 2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?
    };

    let mut digest = ContentDigest::new();
    let mut latest: Option<&str> = None;
    for (rowid, grain_key, encoding, created_at) in &grains {
        let payload = conn.blob_open(DatabaseName::Main, "grains", "payload", *rowid, true)?;
        digest.add_reader(grain_key, *encoding, payload)?;
        if latest.is_none_or(|l| created_at.as_str() > l) {
            latest = Some(created_at.as_str());
        }
    }

    let count = digest.count();
    conn.execute(
        "UPDATE slices SET content_hash = ?1, content_count = ?2, content_date = ?3
         WHERE id = ?4",
        params![digest.finish(), count, latest.unwrap_or(updated_at.as_str()), key],
    )?;
    Ok(())
}

/// Follows a single grain write: an open slice is summarized again, a locked
/// one is marked unknown until it is unlocked.
fn settle_summary(conn: &Connection, key: &str) -> Result<()> {
    let open: bool = conn
        .query_row(
            "SELECT allow_sync FROM slices WHERE id = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?
        .ok_or(Error::NotFound)?;
    if open {
        return summarize(conn, key);
    }
    conn.execute(
        "UPDATE slices SET content_hash = NULL WHERE id = ?1",
        params![key],
    )?;
    Ok(())
}

fn expect_one(rows: usize) -> Result<()> {
    if rows == 0 {
        Err(Error::NotFound)
    } else {
        Ok(())
    }
}

impl Store for SqliteStore {
    fn initialize(&self) -> Result<()> {
        self.conn().execute_batch(SCHEMA)?;
        Ok(())
    }

    // Settings

    fn settings(&self) -> Result<Option<Settings>> {
        self.conn()
            .query_row(
                "SELECT server_role, server_id FROM settings WHERE id",
                [],
                |row| {
                    Ok(Settings {
                        server_role: parse_col(row, 0)?,
                        server_id: parse_col(row, 1)?,
                    })
                },
            )
            .optional()
            .map_err(Error::from)
    }

    fn save_settings(&self, settings: &Settings) -> Result<()> {
        self.conn().execute(
            "INSERT INTO settings (id, server_role, server_id) VALUES (TRUE, ?1, ?2)
             ON CONFLICT (id) DO UPDATE SET server_role = excluded.server_role,
                                            server_id = excluded.server_id",
            params![settings.server_role.as_str(), settings.server_id.to_string()],
        )?;
        Ok(())
    }

    // Company operations

    fn create_company(&self, company: &Company) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO companies (id, name, sync_addr, sync_api_key, active, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    company.id.to_string(),
                    company.name,
                    company.sync_addr,
                    company.sync_api_key,
                    company.active,
                    timestamp(&company.created_at),
                    timestamp(&company.updated_at),
                ],
            )
            .map_err(|e| Error::from_insert(e, &format!("company '{}'", company.name)))?;
        Ok(())
    }

    fn company(&self, id: Uuid) -> Result<Company> {
        let sql = format!("SELECT {COMPANY_COLS} FROM companies WHERE id = ?1");
        self.conn()
            .query_row(&sql, params![id.to_string()], company_from_row)
            .optional()?
            .ok_or(Error::NotFound)
    }

    fn company_by_name(&self, name: &str) -> Result<Option<Company>> {
        let sql = format!("SELECT {COMPANY_COLS} FROM companies WHERE lower(name) = lower(?1)");
        self.conn()
            .query_row(&sql, params![name], company_from_row)
            .optional()
            .map_err(Error::from)
    }

    fn list_companies(&self, scope: Option<&Scope>, page: Pagination) -> Result<Vec<Company>> {
        let mut values = Vec::new();
        let filter = match scope {
            Some(scope) => {
                values.push(Value::Text(scope.company_id.to_string()));
                format!("WHERE {}", scope.condition())
            }
            None => String::new(),
        };
        values.push(Value::Integer(page.limit));
        values.push(Value::Integer(page.offset));

        let sql = format!(
            "SELECT {COMPANY_COLS} FROM companies {filter} ORDER BY lower(name) LIMIT ? OFFSET ?"
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), company_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn update_company(&self, company: &Company) -> Result<()> {
        let rows = self
            .conn()
            .execute(
                "UPDATE companies SET name = ?1, sync_addr = ?2, sync_api_key = ?3, active = ?4,
                        updated_at = ?5
                 WHERE id = ?6",
                params![
                    company.name,
                    company.sync_addr,
                    company.sync_api_key,
                    company.active,
                    timestamp(&Utc::now()),
                    company.id.to_string(),
                ],
            )
            .map_err(|e| Error::from_insert(e, &format!("company '{}'", company.name)))?;
        expect_one(rows)
    }

    fn delete_company(&self, id: Uuid) -> Result<()> {
        let rows = self
            .conn()
            .execute("DELETE FROM companies WHERE id = ?1", params![id.to_string()])?;
        expect_one(rows)
    }

    // User operations

    fn create_user(&self, user: &User) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO users (id, company_id, username, email, password_hash, role, active, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    user.id.to_string(),
                    user.company_id.to_string(),
                    user.username,
                    user.email,
                    user.password_hash,
                    user.role.level(),
                    user.active,
                    timestamp(&user.created_at),
                ],
            )
            .map_err(|e| Error::from_insert(e, &format!("user '{}'", user.username)))?;
        Ok(())
    }

    fn user(&self, id: Uuid) -> Result<User> {
        let sql = format!("SELECT {USER_COLS} FROM users WHERE id = ?1");
        self.conn()
            .query_row(&sql, params![id.to_string()], user_from_row)
            .optional()?
            .ok_or(Error::NotFound)
    }

    fn user_by_username(&self, username: &str) -> Result<Option<User>> {
        let sql = format!("SELECT {USER_COLS} FROM users WHERE lower(username) = lower(?1)");
        self.conn()
            .query_row(&sql, params![username], user_from_row)
            .optional()
            .map_err(Error::from)
    }

    // Slice operations

    fn create_slice(&self, slice: &Slice) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO slices (id, name, slice_type, content_hash, content_count, content_date,
                                 allow_sync, sync_status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7, ?8, ?9)",
            params![
                slice.id.to_string(),
                slice.name,
                slice.slice_type.as_str(),
                // Empty, so summarized exactly as a refresh would.
                ContentDigest::new().finish(),
                timestamp(&slice.updated_at),
                slice.allow_sync,
                slice.sync_status.as_str(),
                timestamp(&slice.created_at),
                timestamp(&slice.updated_at),
            ],
        )
        .map_err(|e| Error::from_insert(e, &format!("slice '{}'", slice.name)))?;
        insert_metadata(&tx, slice.id, &slice.metadata)?;
        tx.commit()?;
        Ok(())
    }

    fn slice(&self, id: Uuid) -> Result<Slice> {
        fetch_slice(&self.conn(), "s.id = ?1", &id.to_string())
    }

    fn slice_by_name(&self, name: &str) -> Result<Slice> {
        fetch_slice(&self.conn(), "lower(s.name) = lower(?1)", name)
    }

    fn list_slices(
        &self,
        scope: Option<&Scope>,
        page: Pagination,
        tag: Option<&str>,
    ) -> Result<Vec<Slice>> {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        if let Some(scope) = scope {
            clauses.push(format!(
                "s.id IN (SELECT slice_id FROM subscriptions WHERE active AND {})",
                scope.condition()
            ));
            values.push(Value::Text(scope.company_id.to_string()));
        }
        if let Some(tag) = tag {
            clauses.push(
                "s.id IN (SELECT st.slice_id FROM slice_tags st JOIN tags t ON t.id = st.tag_id
                          WHERE lower(t.name) = lower(?))"
                    .to_string(),
            );
            values.push(Value::Text(tag.to_string()));
        }
        values.push(Value::Integer(page.limit));
        values.push(Value::Integer(page.offset));

        let filter = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT {SLICE_COLS} FROM slices s {filter} ORDER BY lower(s.name) LIMIT ? OFFSET ?"
        );

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let mut slices = stmt
            .query_map(params_from_iter(values), |row| slice_from_row(row, 0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for slice in &mut slices {
            slice.metadata = load_metadata(&conn, slice.id)?;
        }
        Ok(slices)
    }

    fn update_slice(&self, slice: &Slice) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let rows = tx
            .execute(
                "UPDATE slices SET name = ?1, slice_type = ?2, allow_sync = ?3, updated_at = ?4
                 WHERE id = ?5",
                params![
                    slice.name,
                    slice.slice_type.as_str(),
                    slice.allow_sync,
                    timestamp(&Utc::now()),
                    slice.id.to_string(),
                ],
            )
            .map_err(|e| Error::from_insert(e, &format!("slice '{}'", slice.name)))?;
        expect_one(rows)?;
        tx.execute(
            "DELETE FROM slice_metadata WHERE slice_id = ?1",
            params![slice.id.to_string()],
        )?;
        insert_metadata(&tx, slice.id, &slice.metadata)?;
        tx.commit()?;
        Ok(())
    }

    fn delete_slice(&self, id: Uuid) -> Result<()> {
        let rows = self
            .conn()
            .execute("DELETE FROM slices WHERE id = ?1", params![id.to_string()])?;
        expect_one(rows)
    }

    fn lock_slice(&self, id: Uuid) -> Result<()> {
        let rows = self.conn().execute(
            "UPDATE slices SET allow_sync = 0 WHERE id = ?1",
            params![id.to_string()],
        )?;
        expect_one(rows)
    }

    fn unlock_slice(&self, id: Uuid) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let key = id.to_string();
        let rows = tx.execute("UPDATE slices SET allow_sync = 1 WHERE id = ?1", params![key])?;
        expect_one(rows)?;
        let unknown: bool = tx.query_row(
            "SELECT content_hash IS NULL FROM slices WHERE id = ?1",
            params![key],
            |row| row.get(0),
        )?;
        if unknown {
            summarize(&tx, &key)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn refresh_slice(&self, id: Uuid) -> Result<Slice> {
        let conn = self.conn();
        let key = id.to_string();
        summarize(&conn, &key)?;
        fetch_slice(&conn, "s.id = ?1", &key)
    }

    fn add_slice(&self, slice: &Slice) -> Result<()> {
        insert_remote_slice(&self.conn(), slice, false)?;
        Ok(())
    }

    fn update_slice_metadata(&self, target: Uuid, source: &Slice) -> Result<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let key = target.to_string();

        let rows = tx
            .execute(
                "UPDATE slices SET name = ?1, slice_type = ?2, updated_at = ?3 WHERE id = ?4",
                params![
                    source.name,
                    source.slice_type.as_str(),
                    timestamp(&source.updated_at),
                    key,
                ],
            )
            .map_err(|e| Error::from_insert(e, &format!("slice '{}'", source.name)))?;
        expect_one(rows)?;

        let current = load_metadata(&tx, target)?;
        let changed = current != source.metadata;
        if changed {
            tx.execute("DELETE FROM slice_metadata WHERE slice_id = ?1", params![key])?;
            insert_metadata(&tx, target, &source.metadata)?;
        }
        tx.commit()?;
        Ok(changed)
    }

    fn slice_access(&self, company_id: Uuid, slice_id: Uuid) -> Result<()> {
        let allowed: bool = self.conn().query_row(
            "SELECT EXISTS (SELECT 1 FROM subscriptions
                            WHERE company_id = ?1 AND slice_id = ?2 AND active)",
            params![company_id.to_string(), slice_id.to_string()],
            |row| row.get(0),
        )?;
        if allowed {
            Ok(())
        } else {
            Err(Error::forbidden("no active subscription to this slice"))
        }
    }

    fn set_slice_sync_status(&self, id: Uuid, status: SyncStatus) -> Result<()> {
        let now = timestamp(&Utc::now());
        let rows = if status == SyncStatus::Success {
            self.conn().execute(
                "UPDATE slices SET sync_status = ?1, last_sync_attempt = ?2, last_good_sync = ?2
                 WHERE id = ?3",
                params![status.as_str(), now, id.to_string()],
            )?
        } else {
            self.conn().execute(
                "UPDATE slices SET sync_status = ?1, last_sync_attempt = ?2 WHERE id = ?3",
                params![status.as_str(), now, id.to_string()],
            )?
        };
        expect_one(rows)
    }

    fn begin_slice_sync(&self, id: Uuid) -> Result<bool> {
        let now = Utc::now();
        let stale = now - chrono::Duration::seconds(STALE_SYNC_SECS);
        let rows = self.conn().execute(
            "UPDATE slices SET sync_status = 'updating', last_sync_attempt = ?1
             WHERE id = ?2
               AND (sync_status != 'updating'
                    OR last_sync_attempt IS NULL
                    OR last_sync_attempt < ?3)",
            params![timestamp(&now), id.to_string(), timestamp(&stale)],
        )?;
        Ok(rows == 1)
    }

    // Tag operations

    fn create_tag(&self, name: &str, description: &str) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO tags (name, description) VALUES (?1, ?2)",
                params![name, description],
            )
            .map_err(|e| Error::from_insert(e, &format!("tag '{name}'")))?;
        Ok(())
    }

    fn tag_slice(&self, slice_id: Uuid, tag: &str) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO tags (name) SELECT ?1
             WHERE NOT EXISTS (SELECT 1 FROM tags WHERE lower(name) = lower(?1))",
            params![tag],
        )?;
        let rows = tx.execute(
            "INSERT OR IGNORE INTO slice_tags (tag_id, slice_id)
             SELECT id, ?2 FROM tags WHERE lower(name) = lower(?1)",
            params![tag, slice_id.to_string()],
        )?;
        tx.commit()?;
        if rows == 0 {
            tracing::debug!(%slice_id, tag, "slice already tagged");
        }
        Ok(())
    }

    // Grain operations

    fn create_grain(&self, replace: bool, grain: &Grain) -> Result<()> {
        let payload = grain
            .payload
            .as_deref()
            .ok_or_else(|| Error::BadRequest("grain has no payload".to_string()))?;
        let grain_key = grain.grain_key.to_lowercase();

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        if replace {
            tx.execute(
                "DELETE FROM grains WHERE slice_id = ?1 AND grain_key = ?2",
                params![grain.slice_id.to_string(), grain_key],
            )?;
        }
        tx.execute(
            "INSERT INTO grains (id, slice_id, grain_key, encoding, payload, source, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                grain.id.to_string(),
                grain.slice_id.to_string(),
                grain_key,
                grain.encoding.as_str(),
                payload,
                grain.source,
                timestamp(&grain.created_at),
            ],
        )
        .map_err(|e| Error::from_insert(e, &format!("grain '{grain_key}'")))?;
        settle_summary(&tx, &grain.slice_id.to_string())?;
        tx.commit()?;
        Ok(())
    }

    fn grain(&self, id: Uuid, include_payload: bool) -> Result<Grain> {
        let cols = if include_payload { GRAIN_FULL } else { GRAIN_BRIEF };
        let sql = format!("SELECT {cols} FROM grains g WHERE g.id = ?1");
        self.conn()
            .query_row(&sql, params![id.to_string()], grain_from_row)
            .optional()?
            .ok_or(Error::NotFound)
    }

    fn grain_by_key(&self, slice_id: Uuid, key: &str, include_payload: bool) -> Result<Grain> {
        let cols = if include_payload { GRAIN_FULL } else { GRAIN_BRIEF };
        let sql = format!("SELECT {cols} FROM grains g WHERE g.slice_id = ?1 AND g.grain_key = ?2");
        self.conn()
            .query_row(
                &sql,
                params![slice_id.to_string(), key.to_lowercase()],
                grain_from_row,
            )
            .optional()?
            .ok_or(Error::NotFound)
    }

    fn list_grains(
        &self,
        slice_id: Option<Uuid>,
        include_payload: bool,
        scope: Option<&Scope>,
        page: Pagination,
    ) -> Result<Vec<Grain>> {
        let cols = if include_payload { GRAIN_FULL } else { GRAIN_BRIEF };
        let mut values = Vec::new();
        let filter = match (scope, slice_id) {
            (Some(scope), Some(slice_id)) => {
                values.push(Value::Text(slice_id.to_string()));
                values.push(Value::Text(scope.company_id.to_string()));
                format!(
                    "WHERE g.slice_id = ? AND g.slice_id IN
                       (SELECT slice_id FROM subscriptions WHERE active AND {})",
                    scope.condition()
                )
            }
            (Some(scope), None) => {
                values.push(Value::Text(scope.company_id.to_string()));
                format!(
                    "WHERE g.slice_id IN
                       (SELECT slice_id FROM subscriptions WHERE active AND {})",
                    scope.condition()
                )
            }
            (None, Some(slice_id)) => {
                values.push(Value::Text(slice_id.to_string()));
                "WHERE g.slice_id = ?".to_string()
            }
            (None, None) => String::new(),
        };
        values.push(Value::Integer(page.limit));
        values.push(Value::Integer(page.offset));

        let sql = format!(
            "SELECT {cols} FROM grains g {filter} ORDER BY g.slice_id, g.grain_key LIMIT ? OFFSET ?"
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), grain_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn grains(&self, slice_id: Uuid, brief: bool) -> Result<Vec<Grain>> {
        let cols = if brief { GRAIN_BRIEF } else { GRAIN_FULL };
        let sql = format!("SELECT {cols} FROM grains g WHERE g.slice_id = ?1 ORDER BY g.grain_key");
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![slice_id.to_string()], grain_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn company_subscribed(&self, company_id: Uuid, grain_id: Uuid) -> Result<bool> {
        self.conn()
            .query_row(
                "SELECT EXISTS (SELECT 1 FROM grains g
                                JOIN subscriptions sub ON sub.slice_id = g.slice_id
                                WHERE g.id = ?1 AND sub.company_id = ?2 AND sub.active)",
                params![grain_id.to_string(), company_id.to_string()],
                |row| row.get(0),
            )
            .map_err(Error::from)
    }

    fn add_grain_from(&self, grain: &Grain, len: u64, payload: &mut dyn Read) -> Result<()> {
        let size = i64::try_from(len)
            .map_err(|_| Error::BadRequest(format!("grain '{}' is too large", grain.grain_key)))?;
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO grains (id, slice_id, grain_key, encoding, payload, source, created_at)
             VALUES (?1, ?2, ?3, ?4, zeroblob(?5), ?6, ?7)",
            params![
                grain.id.to_string(),
                grain.slice_id.to_string(),
                grain.grain_key.to_lowercase(),
                grain.encoding.as_str(),
                size,
                grain.source,
                timestamp(&grain.created_at),
            ],
        )
        .map_err(|e| Error::from_insert(e, &format!("grain '{}'", grain.grain_key)))?;

        let rowid = tx.last_insert_rowid();
        {
            let mut blob = tx.blob_open(DatabaseName::Main, "grains", "payload", rowid, false)?;
            let written = io::copy(&mut payload.take(len), &mut blob)?;
            if written != len {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("payload of grain {} ended after {written} of {len} bytes", grain.id),
                )));
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn delete_grains(&self, ids: &[Uuid]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut deleted = 0;
        for chunk in ids.chunks(DELETE_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!("DELETE FROM grains WHERE id IN ({placeholders})");
            deleted += tx.execute(&sql, params_from_iter(chunk.iter().map(Uuid::to_string)))?;
        }
        tx.commit()?;
        Ok(deleted)
    }

    fn delete_grain(&self, id: Uuid) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let key = id.to_string();
        let slice_id: String = tx
            .query_row(
                "SELECT slice_id FROM grains WHERE id = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(Error::NotFound)?;
        tx.execute("DELETE FROM grains WHERE id = ?1", params![key])?;
        settle_summary(&tx, &slice_id)?;
        tx.commit()?;
        Ok(())
    }

    // Subscription operations

    fn subscriptions(&self, company_id: Uuid) -> Result<Vec<Subscription>> {
        let sql = format!(
            "SELECT {SUB_COLS}, {SLICE_COLS} FROM subscriptions sub
             JOIN slices s ON s.id = sub.slice_id
             WHERE sub.company_id = ?1
             ORDER BY lower(sub.name)"
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let mut subs = stmt
            .query_map(params![company_id.to_string()], |row| {
                let mut sub = subscription_from_row(row)?;
                sub.slice = Some(slice_from_row(row, 7)?);
                Ok(sub)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for sub in &mut subs {
            if let Some(slice) = sub.slice.as_mut() {
                slice.metadata = load_metadata(&conn, slice.id)?;
            }
        }
        Ok(subs)
    }

    fn add_subscription(&self, sub: &Subscription, slice: &Slice) -> Result<()> {
        if sub.slice_id != slice.id {
            return Err(Error::BadRequest(
                "subscription does not reference the given slice".to_string(),
            ));
        }
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        // The slice row lands after the subscription; checked at commit.
        tx.pragma_update(None, "defer_foreign_keys", "ON")?;
        tx.execute(
            "INSERT INTO subscriptions (sub_id, slice_id, company_id, name, description, active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                sub.sub_id.to_string(),
                sub.slice_id.to_string(),
                sub.company_id.to_string(),
                sub.name,
                sub.description,
                sub.active,
                timestamp(&sub.created_at),
            ],
        )
        .map_err(|e| Error::from_insert(e, &format!("subscription '{}'", sub.name)))?;
        insert_remote_slice(&tx, slice, true)?;
        tx.commit()?;
        Ok(())
    }

    fn deactivate_subscription(&self, sub_id: Uuid) -> Result<()> {
        let rows = self.conn().execute(
            "UPDATE subscriptions SET active = 0 WHERE sub_id = ?1",
            params![sub_id.to_string()],
        )?;
        expect_one(rows)
    }

    // Activity log

    fn log_activity(
        &self,
        sub_id: Option<Uuid>,
        message: &str,
        duration: Duration,
        err: Option<&str>,
    ) -> Result<()> {
        let message = match err {
            Some(err) => format!("{message}: {err}"),
            None => message.to_string(),
        };
        let duration_ms = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        self.conn().execute(
            "INSERT INTO activity (sub_id, success, message, duration_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                sub_id.map(|id| id.to_string()),
                err.is_none(),
                message,
                duration_ms,
                timestamp(&Utc::now()),
            ],
        )?;
        Ok(())
    }

    fn list_activity(&self, page: Pagination) -> Result<Vec<Activity>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, sub_id, success, message, duration_ms, created_at FROM activity
             ORDER BY id DESC LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt.query_map(params![page.limit, page.offset], |row| {
            let sub_id = match row.get::<_, Option<String>>(1)? {
                Some(_) => Some(parse_col::<Uuid>(row, 1)?),
                None => None,
            };
            Ok(Activity {
                id: row.get(0)?,
                sub_id,
                success: row.get(2)?,
                message: row.get(3)?,
                duration_ms: row.get(4)?,
                created_at: parse_col(row, 5)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }
}

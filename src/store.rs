//! SQLite-backed reference store.
//!
//! One `reference_items` table guarded by a single `Mutex<Connection>`.
//! Every mutating call is its own committed unit; there is no transaction
//! spanning claim, render and apply.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension, Row};
use sha2::{Digest, Sha256};

use crate::clock::{self, Clock};
use crate::model::{COLUMNS, TAG_COLUMNS};
use crate::{
    Error, ItemEdit, ItemStatus, ListFilter, NewReference, ReferenceItem, Result, StatusCounts,
    Tags,
};

/// Idempotent DDL for the reference table.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS reference_items (
    id TEXT PRIMARY KEY,
    brand TEXT NOT NULL,
    season TEXT NOT NULL,
    item TEXT NOT NULL,
    source_url TEXT NOT NULL,
    image_path TEXT NOT NULL DEFAULT '',
    captured_at TEXT NOT NULL DEFAULT '',
    SILHOUETTE TEXT NOT NULL DEFAULT '',
    COLOR TEXT NOT NULL DEFAULT '',
    DETAIL TEXT NOT NULL DEFAULT '',
    MATERIAL TEXT NOT NULL DEFAULT '',
    MOOD TEXT NOT NULL DEFAULT '',
    FUNCTION TEXT NOT NULL DEFAULT '',
    USE_CASE TEXT NOT NULL DEFAULT '',
    fit_key TEXT NOT NULL DEFAULT '',
    apc_fit_score INTEGER,
    notes TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'PENDING',
    error_message TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS ux_reference_items_partition
    ON reference_items (brand, season, item, source_url);

CREATE INDEX IF NOT EXISTS idx_reference_items_status
    ON reference_items (status, created_at);
";

/// Durable table of capture items.
///
/// Create with [`ReferenceStore::open`] for a file-backed database or
/// [`ReferenceStore::in_memory`] for tests. The store is `Send + Sync` and
/// is shared behind an `Arc` by workers.
pub struct ReferenceStore {
    conn: Mutex<Connection>,
    clock: Clock,
}

impl ReferenceStore {
    /// Open or create the database at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        debug!("Reference store opened at {}", path.display());
        Self::init(conn)
    }

    /// In-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(CREATE_TABLES)?;
        let newest: Option<String> =
            conn.query_row("SELECT MAX(updated_at) FROM reference_items", [], |row| {
                row.get(0)
            })?;
        let clock = Clock::starting_after(newest.as_deref().and_then(clock::parse_stamp));
        Ok(Self {
            conn: Mutex::new(conn),
            clock,
        })
    }

    /// Acquire the connection lock.
    pub(crate) fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::LockPoisoned)
    }

    /// Next strictly increasing write stamp.
    ///
    /// Takes the locked connection so stamps are issued in the same order
    /// as the writes that carry them.
    pub(crate) fn stamp(&self, _held: &Connection) -> Result<String> {
        self.clock.tick()
    }

    /// Fetch one item by id.
    pub fn get(&self, id: &str) -> Result<Option<ReferenceItem>> {
        let conn = self.lock_conn()?;
        let sql = format!("SELECT {} FROM reference_items WHERE id = ?1", select_columns());
        let item = conn
            .query_row(&sql, [id], map_row)
            .optional()?;
        Ok(item)
    }

    /// Fetch the item occupying `reference`'s dedup partition, if any.
    pub fn get_by_partition(&self, reference: &NewReference) -> Result<Option<ReferenceItem>> {
        let conn = self.lock_conn()?;
        let sql = format!(
            "SELECT {} FROM reference_items \
             WHERE brand = ?1 AND season = ?2 AND item = ?3 AND source_url = ?4",
            select_columns()
        );
        let item = conn
            .query_row(
                &sql,
                params![
                    reference.brand,
                    reference.season,
                    reference.item,
                    reference.source_url
                ],
                map_row,
            )
            .optional()?;
        Ok(item)
    }

    /// Filtered listing, most recently updated first.
    pub fn list(&self, filter: &ListFilter) -> Result<Vec<ReferenceItem>> {
        let mut conds: Vec<&str> = Vec::new();
        let mut args: Vec<Value> = Vec::new();
        for (column, needle) in [
            ("brand LIKE ? ESCAPE '\\'", &filter.brand),
            ("season LIKE ? ESCAPE '\\'", &filter.season),
            ("item LIKE ? ESCAPE '\\'", &filter.item),
        ] {
            let needle = needle.trim();
            if !needle.is_empty() {
                conds.push(column);
                args.push(Value::Text(format!("%{}%", escape_like(needle))));
            }
        }
        if let Some(status) = filter.status {
            conds.push("status = ?");
            args.push(Value::Text(status.as_str().to_string()));
        }
        let where_sql = if conds.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conds.join(" AND "))
        };
        args.push(Value::Integer(i64::try_from(filter.limit).unwrap_or(i64::MAX)));

        let sql = format!(
            "SELECT {} FROM reference_items {} ORDER BY updated_at DESC LIMIT ?",
            select_columns(),
            where_sql
        );
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args), map_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Count items per status.
    pub fn stats(&self) -> Result<StatusCounts> {
        let conn = self.lock_conn()?;
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM reference_items GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            let status: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            Ok((status, count))
        })?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let (status, count) = row?;
            let count = usize::try_from(count).unwrap_or(0);
            counts.total += count;
            match status.parse::<ItemStatus>() {
                Ok(ItemStatus::Pending) => counts.pending = count,
                Ok(ItemStatus::Processing) => counts.processing = count,
                Ok(ItemStatus::Success) => counts.success = count,
                Ok(ItemStatus::Failed) => counts.failed = count,
                Err(_) => {}
            }
        }
        Ok(counts)
    }

    /// Register an externally supplied image directly as SUCCESS.
    ///
    /// Returns the new id, or `None` when the partition already exists (the
    /// existing row is left untouched).
    pub fn register_asset(&self, reference: &NewReference, image_path: &str) -> Result<Option<String>> {
        let id = new_item_id(reference);
        let captured = clock::captured_at(clock::local_now());
        let conn = self.lock_conn()?;
        let stamp = self.stamp(&conn)?;
        let changed = conn.execute(
            "INSERT INTO reference_items \
             (id, brand, season, item, source_url, image_path, captured_at, status, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9) \
             ON CONFLICT(brand, season, item, source_url) DO NOTHING",
            params![
                id,
                reference.brand,
                reference.season,
                reference.item,
                reference.source_url,
                image_path,
                captured,
                ItemStatus::Success.as_str(),
                stamp,
            ],
        )?;
        if changed == 0 {
            debug!("Asset {} already registered", reference.source_url);
            return Ok(None);
        }
        Ok(Some(id))
    }

    /// Apply manual tag/metadata edits. Status is never changed by an edit.
    ///
    /// Returns the number of rows that existed and were updated.
    pub fn apply_edits(&self, edits: &[ItemEdit]) -> Result<usize> {
        if edits.is_empty() {
            return Ok(0);
        }
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let mut updated = 0usize;
        {
            let tag_sets: Vec<String> = TAG_COLUMNS
                .iter()
                .enumerate()
                .map(|(i, column)| format!("{} = ?{}", column, i + 1))
                .collect();
            let mut stmt = tx.prepare(&format!(
                "UPDATE reference_items SET {}, \
                 fit_key = ?8, apc_fit_score = ?9, notes = ?10, updated_at = ?11 \
                 WHERE id = ?12",
                tag_sets.join(", ")
            ))?;
            for edit in edits.iter().filter(|e| !e.id.trim().is_empty()) {
                let [silhouette, color, detail, material, mood, function, use_case] =
                    edit.tags.values();
                let stamp = self.stamp(&tx)?;
                updated += stmt.execute(params![
                    silhouette,
                    color,
                    detail,
                    material,
                    mood,
                    function,
                    use_case,
                    edit.fit_key,
                    edit.fit_score,
                    edit.notes,
                    stamp,
                    edit.id,
                ])?;
            }
        }
        tx.commit()?;
        info!("Applied {} manual edit(s)", updated);
        Ok(updated)
    }

    /// Dump the whole table as CSV, most recently updated first.
    pub fn export_csv(&self, target: &Path) -> Result<PathBuf> {
        let items = self.list(&ListFilter {
            limit: usize::MAX,
            ..ListFilter::default()
        })?;

        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut out = BufWriter::new(fs::File::create(target)?);
        writeln!(out, "{}", COLUMNS.join(","))?;
        for item in &items {
            writeln!(out, "{}", csv_record(item))?;
        }
        out.flush()?;
        info!("Exported {} item(s) to {}", items.len(), target.display());
        Ok(target.to_path_buf())
    }
}

pub(crate) fn select_columns() -> String {
    COLUMNS.join(", ")
}

/// Map a row selected with [`select_columns`] to an item.
pub(crate) fn map_row(row: &Row<'_>) -> rusqlite::Result<ReferenceItem> {
    let status: String = row.get(17)?;
    let status = status.parse::<ItemStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(17, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(ReferenceItem {
        id: row.get(0)?,
        brand: row.get(1)?,
        season: row.get(2)?,
        item: row.get(3)?,
        source_url: row.get(4)?,
        image_path: row.get(5)?,
        captured_at: row.get(6)?,
        tags: Tags {
            silhouette: row.get(7)?,
            color: row.get(8)?,
            detail: row.get(9)?,
            material: row.get(10)?,
            mood: row.get(11)?,
            function: row.get(12)?,
            use_case: row.get(13)?,
        },
        fit_key: row.get(14)?,
        fit_score: row.get(15)?,
        notes: row.get(16)?,
        status,
        error_message: row.get(18)?,
        created_at: row.get(19)?,
        updated_at: row.get(20)?,
    })
}

/// `{brand}_{season}_{item}_{16 hex}`; the suffix hashes the partition with
/// wall-clock nanos and a process-wide counter.
pub(crate) fn new_item_id(reference: &NewReference) -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();

    let mut hasher = Sha256::new();
    for part in [
        &reference.brand,
        &reference.season,
        &reference.item,
        &reference.source_url,
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update(nanos.to_le_bytes());
    hasher.update(COUNTER.fetch_add(1, Ordering::Relaxed).to_le_bytes());
    let digest = hasher.finalize();

    format!(
        "{}_{}_{}_{}",
        reference.brand,
        reference.season,
        reference.item,
        hex::encode(&digest[..8])
    )
}

/// `?, ?, ?` for an `IN (...)` list.
pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn escape_like(raw: &str) -> String {
    raw.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn csv_record(item: &ReferenceItem) -> String {
    let score = item.fit_score.map(|s| s.to_string()).unwrap_or_default();
    let mut fields: Vec<&str> = vec![
        item.id.as_str(),
        item.brand.as_str(),
        item.season.as_str(),
        item.item.as_str(),
        item.source_url.as_str(),
        item.image_path.as_str(),
        item.captured_at.as_str(),
    ];
    fields.extend(item.tags.values());
    fields.extend([
        item.fit_key.as_str(),
        score.as_str(),
        item.notes.as_str(),
        item.status.as_str(),
        item.error_message.as_str(),
        item.created_at.as_str(),
        item.updated_at.as_str(),
    ]);
    fields
        .into_iter()
        .map(csv_field)
        .collect::<Vec<_>>()
        .join(",")
}

/// RFC 4180 quoting.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

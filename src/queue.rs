//! Queue operations on the reference store: dedup-checked enqueue,
//! selection, atomic claims, resets and the stale-claim sweep.

use std::collections::HashSet;
use std::time::Duration;

use log::{debug, info, warn};
use rusqlite::types::Value;
use rusqlite::{params, TransactionBehavior};

use crate::clock;
use crate::store::{map_row, new_item_id, placeholders, select_columns};
use crate::{EnqueueReport, Error, ItemStatus, NewReference, ReferenceItem, ReferenceStore, Result};

/// Error text recorded on items recovered by [`ReferenceStore::recover_stale`].
pub const STALE_CLAIM_ERROR: &str = "capture interrupted: claim went stale";

/// Ids per `IN (...)` statement.
const ID_CHUNK: usize = 500;

/// Split pasted text into URLs: one per line, trimmed, blanks dropped and
/// repeats removed (first occurrence wins).
pub fn parse_url_list(raw: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| seen.insert(*line))
        .map(str::to_string)
        .collect()
}

impl ReferenceStore {
    /// Insert each reference as PENDING.
    ///
    /// A reference whose (brand, season, item, source URL) partition already
    /// exists is skipped and counted as duplicated; the stored row is never
    /// overwritten.
    pub fn enqueue(&self, references: &[NewReference]) -> Result<EnqueueReport> {
        let mut report = EnqueueReport::default();
        if references.is_empty() {
            return Ok(report);
        }

        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO reference_items \
                 (id, brand, season, item, source_url, status, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7) \
                 ON CONFLICT(brand, season, item, source_url) DO NOTHING",
            )?;
            for reference in references {
                let stamp = self.stamp(&tx)?;
                let changed = stmt.execute(params![
                    new_item_id(reference),
                    reference.brand,
                    reference.season,
                    reference.item,
                    reference.source_url,
                    ItemStatus::Pending.as_str(),
                    stamp,
                ])?;
                if changed == 0 {
                    debug!("Duplicate reference skipped: {}", reference.source_url);
                    report.duplicated += 1;
                } else {
                    report.inserted += 1;
                }
            }
        }
        tx.commit()?;

        info!(
            "Enqueued {} reference(s), {} duplicate(s) skipped",
            report.inserted, report.duplicated
        );
        Ok(report)
    }

    /// Up to `limit` PENDING items, oldest created first.
    pub fn select_pending(&self, limit: usize) -> Result<Vec<ReferenceItem>> {
        self.select_by_status(ItemStatus::Pending, "created_at ASC", limit)
    }

    /// Up to `limit` FAILED items, most recently updated first.
    pub fn select_failed(&self, limit: usize) -> Result<Vec<ReferenceItem>> {
        self.select_by_status(ItemStatus::Failed, "updated_at DESC", limit)
    }

    fn select_by_status(
        &self,
        status: ItemStatus,
        order: &str,
        limit: usize,
    ) -> Result<Vec<ReferenceItem>> {
        let conn = self.lock_conn()?;
        let sql = format!(
            "SELECT {} FROM reference_items WHERE status = ?1 ORDER BY {}, id ASC LIMIT ?2",
            select_columns(),
            order
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![status.as_str(), sql_limit(limit)], map_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Set exactly `ids` to PROCESSING in one transaction, whatever their
    /// current status. Returns the number of rows written.
    ///
    /// This is the unconditional "claim what I just selected" write; callers
    /// racing other claimers should use [`ReferenceStore::claim_pending`].
    pub fn claim_batch(&self, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let affected = self.bulk_update(
            "UPDATE reference_items SET status = ?, updated_at = ? WHERE id IN",
            ItemStatus::Processing,
            ids,
            "",
        )?;
        info!("Claimed {} item(s) for processing", affected);
        Ok(affected)
    }

    /// Atomically select the `limit` oldest PENDING items and flip them to
    /// PROCESSING.
    ///
    /// Selection and update share one IMMEDIATE transaction, so concurrent
    /// claimers never receive the same item. The returned items reflect their
    /// claimed state.
    pub fn claim_pending(&self, limit: usize) -> Result<Vec<ReferenceItem>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut items = {
            let sql = format!(
                "SELECT {} FROM reference_items WHERE status = ?1 \
                 ORDER BY created_at ASC, id ASC LIMIT ?2",
                select_columns()
            );
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map(
                params![ItemStatus::Pending.as_str(), sql_limit(limit)],
                map_row,
            )?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        if !items.is_empty() {
            let stamp = self.stamp(&tx)?;
            for chunk in items.chunks(ID_CHUNK) {
                let sql = format!(
                    "UPDATE reference_items SET status = ?, updated_at = ? \
                     WHERE status = ? AND id IN ({})",
                    placeholders(chunk.len())
                );
                let mut args = vec![
                    Value::Text(ItemStatus::Processing.as_str().to_string()),
                    Value::Text(stamp.clone()),
                    Value::Text(ItemStatus::Pending.as_str().to_string()),
                ];
                args.extend(chunk.iter().map(|item| Value::Text(item.id.clone())));
                tx.execute(&sql, rusqlite::params_from_iter(args))?;
            }
            for item in &mut items {
                item.status = ItemStatus::Processing;
                item.updated_at = stamp.clone();
            }
        }
        tx.commit()?;

        if !items.is_empty() {
            info!("Claimed {} pending item(s)", items.len());
        }
        Ok(items)
    }

    /// Return FAILED items among `ids` to PENDING and clear their error text.
    ///
    /// Ids that no longer exist or are not FAILED are left alone, so the
    /// returned count can be smaller than `ids.len()`.
    pub fn reset_to_pending(&self, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let affected = self.bulk_update(
            "UPDATE reference_items SET status = ?, error_message = '', updated_at = ? WHERE id IN",
            ItemStatus::Pending,
            ids,
            "AND status = 'FAILED'",
        )?;
        info!("Reset {} failed item(s) to pending", affected);
        Ok(affected)
    }

    /// Mark PROCESSING items not updated within `older_than` as FAILED.
    ///
    /// Items stranded by a crash between claim and apply become retryable
    /// through [`ReferenceStore::reset_to_pending`].
    pub fn recover_stale(&self, older_than: Duration) -> Result<usize> {
        let age = chrono::Duration::from_std(older_than)
            .map_err(|e| Error::Config(format!("stale age out of range: {}", e)))?;
        let cutoff = clock::format_stamp(clock::now() - age);
        let conn = self.lock_conn()?;
        let stamp = self.stamp(&conn)?;
        let affected = conn.execute(
            "UPDATE reference_items SET status = ?1, error_message = ?2, updated_at = ?3 \
             WHERE status = ?4 AND updated_at < ?5",
            params![
                ItemStatus::Failed.as_str(),
                STALE_CLAIM_ERROR,
                stamp,
                ItemStatus::Processing.as_str(),
                cutoff,
            ],
        )?;
        if affected > 0 {
            warn!("Recovered {} stale processing item(s) as failed", affected);
        }
        Ok(affected)
    }

    /// `{head} (?, ...) {tail}` over `ids` in chunks, inside one transaction.
    fn bulk_update(
        &self,
        head: &str,
        status: ItemStatus,
        ids: &[String],
        tail: &str,
    ) -> Result<usize> {
        let mut conn = self.lock_conn()?;
        let stamp = self.stamp(&conn)?;
        let tx = conn.transaction()?;
        let mut affected = 0usize;
        for chunk in ids.chunks(ID_CHUNK) {
            let sql = format!("{} ({}) {}", head, placeholders(chunk.len()), tail);
            let mut args = vec![
                Value::Text(status.as_str().to_string()),
                Value::Text(stamp.clone()),
            ];
            args.extend(chunk.iter().map(|id| Value::Text(id.clone())));
            affected += tx.execute(&sql, rusqlite::params_from_iter(args))?;
        }
        tx.commit()?;
        Ok(affected)
    }
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

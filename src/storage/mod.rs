use crate::models::{Listing, ListingRecord, RunRecord};
use anyhow::{Context, Result};
use chrono::{NaiveDateTime, Utc};
use duckdb::{Connection, ToSql, params, params_from_iter};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

// ── Schema ────────────────────────────────────────────────────────────────────

const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS listings (
    listing_id     VARCHAR PRIMARY KEY,
    url            VARCHAR NOT NULL,
    building_name  VARCHAR,
    address        VARCHAR,
    station_access VARCHAR,
    rent           VARCHAR,
    layout         VARCHAR,
    area           VARCHAR,
    age_floors     VARCHAR,
    unit_floor     VARCHAR NOT NULL DEFAULT '',
    physical_key   VARCHAR NOT NULL DEFAULT '',
    first_seen_at  TIMESTAMP NOT NULL,
    -- NULL until a delivery attempt
    notified_at    TIMESTAMP
);

CREATE SEQUENCE IF NOT EXISTS run_log_id_seq START 1;

CREATE TABLE IF NOT EXISTS run_log (
    id              BIGINT PRIMARY KEY DEFAULT nextval('run_log_id_seq'),
    run_at          TIMESTAMP NOT NULL,
    listings_found  BIGINT,
    new_listings    BIGINT,
    error           VARCHAR
);

CREATE TABLE IF NOT EXISTS schema_version (
    version     INTEGER PRIMARY KEY,
    applied_at  TIMESTAMP NOT NULL
);
"#;

// Databases created before floor-level dedup lack these columns.
const ADDITIVE_MIGRATIONS: &str = r#"
ALTER TABLE listings ADD COLUMN IF NOT EXISTS unit_floor   VARCHAR DEFAULT '';
ALTER TABLE listings ADD COLUMN IF NOT EXISTS physical_key VARCHAR DEFAULT '';
"#;

const SCHEMA_VERSION: i32 = 2;

const LISTING_COLUMNS: &str = "listing_id, url, building_name, address, station_access, \
     rent, layout, area, age_floors, unit_floor, physical_key, first_seen_at, notified_at";

// ── Repository ────────────────────────────────────────────────────────────────

/// Persisted record of seen listings plus the run log.
///
/// Each write runs in its own transaction; an error drops the transaction
/// uncommitted, which rolls it back.
pub struct Repository {
    conn: Connection,
}

impl Repository {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Could not create dir {:?}", parent))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open DuckDB at {:?}", path))?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self { conn: Connection::open_in_memory()? })
    }

    pub fn run_migrations(&self) -> Result<()> {
        info!("Running migrations…");
        self.conn.execute_batch(DDL).context("DDL failed")?;
        self.conn
            .execute_batch(ADDITIVE_MIGRATIONS)
            .context("Column migration failed")?;
        self.conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (?, ?)",
            params![SCHEMA_VERSION, now()],
        )?;
        info!("Migrations done.");
        Ok(())
    }

    // ── Dedup ─────────────────────────────────────────────────────────────────

    /// Candidates not seen before, in input order.
    ///
    /// A candidate is dropped when its id is stored or already returned for
    /// this batch, or (floor known) when its physical key is stored or
    /// already taken by an earlier candidate of this batch.
    pub fn filter_new(&self, candidates: &[Listing]) -> Result<Vec<Listing>> {
        if candidates.is_empty() {
            return Ok(vec![]);
        }

        let ids: Vec<&str> = candidates.iter().map(|l| l.listing_id.as_str()).collect();
        let known_ids = self.existing(
            "SELECT listing_id FROM listings WHERE listing_id IN",
            &ids,
        )?;

        let pkeys: Vec<String> = candidates
            .iter()
            .filter(|l| l.has_physical_key())
            .map(Listing::physical_key)
            .collect();
        let pkey_refs: Vec<&str> = pkeys.iter().map(String::as_str).collect();
        let known_pkeys = self.existing(
            "SELECT physical_key FROM listings WHERE physical_key <> '' AND physical_key IN",
            &pkey_refs,
        )?;

        let mut seen_ids = HashSet::new();
        let mut seen_pkeys = HashSet::new();
        let mut fresh = Vec::new();
        for l in candidates {
            if known_ids.contains(&l.listing_id) {
                continue;
            }
            if seen_ids.contains(l.listing_id.as_str()) {
                debug!("{}: listed on more than one page in this run", l.listing_id);
                continue;
            }
            if l.has_physical_key() {
                let pk = l.physical_key();
                if known_pkeys.contains(&pk) {
                    debug!("{}: same room already stored under another id", l.listing_id);
                    continue;
                }
                if !seen_pkeys.insert(pk) {
                    debug!("{}: same room listed twice in this run", l.listing_id);
                    continue;
                }
            }
            seen_ids.insert(l.listing_id.as_str());
            fresh.push(l.clone());
        }
        Ok(fresh)
    }

    /// Values of the single selected column that match `keys`.
    fn existing(&self, select_in: &str, keys: &[&str]) -> Result<HashSet<String>> {
        if keys.is_empty() {
            return Ok(HashSet::new());
        }
        let sql = format!("{} ({})", select_in, placeholders(keys.len()));
        let mut stmt = self.conn.prepare(&sql)?;
        let found = stmt
            .query_map(params_from_iter(keys.iter()), |r| r.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(found)
    }

    /// Remove delisted units. An empty `current_ids` never deletes anything.
    pub fn delete_expired(&self, current_ids: &[String]) -> Result<usize> {
        if current_ids.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.unchecked_transaction()?;
        let sql = format!(
            "DELETE FROM listings WHERE listing_id NOT IN ({})",
            placeholders(current_ids.len())
        );
        let deleted = tx
            .execute(&sql, params_from_iter(current_ids.iter()))
            .context("delete expired listings")?;
        tx.commit()?;
        Ok(deleted)
    }

    /// Insert new listings — idempotent, existing ids are left untouched.
    pub fn save_listings(&self, listings: &[Listing]) -> Result<usize> {
        if listings.is_empty() {
            return Ok(0);
        }

        let seen_at = now();
        let tx = self.conn.unchecked_transaction()?;
        let sql = r#"
            INSERT OR IGNORE INTO listings
                (listing_id, url, building_name, address, station_access,
                 rent, layout, area, age_floors, unit_floor, physical_key,
                 first_seen_at, notified_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
        "#;

        let mut inserted = 0;
        for l in listings {
            inserted += tx
                .execute(sql, params![
                    l.listing_id, l.url, l.building_name, l.address, l.station_access,
                    l.rent, l.layout, l.area, l.age_floors,
                    l.unit_floor, l.physical_key(),
                    seen_at,
                ])
                .with_context(|| format!("insert listing {}", l.listing_id))?;
        }

        tx.commit()?;
        info!("Saved {} listings ({} new rows)", listings.len(), inserted);
        Ok(inserted)
    }

    /// Stamp `notified_at` on the given ids; unknown ids are ignored.
    pub fn mark_notified(&self, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.unchecked_transaction()?;
        let sql = format!(
            "UPDATE listings SET notified_at = ? WHERE listing_id IN ({})",
            placeholders(ids.len())
        );
        let stamp = now();
        let mut args: Vec<&dyn ToSql> = vec![&stamp];
        args.extend(ids.iter().map(|id| id as &dyn ToSql));
        let updated = tx
            .execute(&sql, params_from_iter(args))
            .context("mark listings notified")?;
        tx.commit()?;
        Ok(updated)
    }

    // ── Lookups ───────────────────────────────────────────────────────────────

    pub fn get_listing(&self, id: &str) -> Result<Option<ListingRecord>> {
        let sql = format!("SELECT {} FROM listings WHERE listing_id = ?", LISTING_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![id], row_to_record)?;
        Ok(rows.next().transpose()?)
    }

    /// Most recently seen first. `limit = None` returns everything.
    pub fn list_listings(&self, limit: Option<usize>) -> Result<Vec<ListingRecord>> {
        let mut sql = format!(
            "SELECT {} FROM listings ORDER BY first_seen_at DESC, listing_id",
            LISTING_COLUMNS
        );
        if let Some(n) = limit {
            sql.push_str(&format!(" LIMIT {}", n));
        }
        let mut stmt = self.conn.prepare(&sql)?;
        let records = stmt
            .query_map([], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn listing_count(&self) -> Result<i64> {
        let mut s = self.conn.prepare("SELECT COUNT(*) FROM listings")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    pub fn notified_count(&self) -> Result<i64> {
        let mut s = self
            .conn
            .prepare("SELECT COUNT(*) FROM listings WHERE notified_at IS NOT NULL")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    // ── Run log ───────────────────────────────────────────────────────────────

    pub fn append_run_record(&self, found: usize, new: usize, error: Option<&str>) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO run_log (run_at, listings_found, new_listings, error) VALUES (?, ?, ?, ?)",
                params![now(), found as i64, new as i64, error],
            )
            .context("append run record")?;
        Ok(())
    }

    pub fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let sql = format!(
            "SELECT id, run_at, listings_found, new_listings, error FROM run_log ORDER BY id DESC LIMIT {}",
            limit
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let runs = stmt
            .query_map([], |r| {
                Ok(RunRecord {
                    id: r.get(0)?,
                    run_at: r.get::<_, NaiveDateTime>(1)?.and_utc(),
                    listings_found: r.get::<_, Option<i64>>(2)?.unwrap_or(0),
                    new_listings: r.get::<_, Option<i64>>(3)?.unwrap_or(0),
                    error: r.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }
}

fn row_to_record(r: &duckdb::Row<'_>) -> duckdb::Result<ListingRecord> {
    let text = |i: usize| -> duckdb::Result<String> { Ok(r.get::<_, Option<String>>(i)?.unwrap_or_default()) };
    Ok(ListingRecord {
        listing_id: r.get(0)?,
        url: r.get(1)?,
        building_name: text(2)?,
        address: text(3)?,
        station_access: text(4)?,
        rent: text(5)?,
        layout: text(6)?,
        area: text(7)?,
        age_floors: text(8)?,
        unit_floor: text(9)?,
        physical_key: text(10)?,
        first_seen_at: r.get::<_, NaiveDateTime>(11)?.and_utc(),
        notified_at: r.get::<_, Option<NaiveDateTime>>(12)?.map(|t| t.and_utc()),
    })
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    fn repo() -> Repository {
        let repo = Repository::open_in_memory().unwrap();
        repo.run_migrations().unwrap();
        repo
    }

    fn listing(id: &str, floor: &str) -> Listing {
        Listing {
            listing_id: id.to_string(),
            url: format!("https://suumo.jp/chintai/{}/", id),
            building_name: "パークハイツ新宿".into(),
            address: "東京都新宿区西新宿1".into(),
            station_access: "JR山手線/新宿駅 歩5分".into(),
            rent: "10万円".into(),
            layout: "1K".into(),
            area: "25.5m2".into(),
            age_floors: "築5年10階建".into(),
            unit_floor: floor.to_string(),
        }
    }

    fn ids(listings: &[Listing]) -> Vec<&str> {
        listings.iter().map(|l| l.listing_id.as_str()).collect()
    }

    fn owned_ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let repo = repo();
        assert_ok!(repo.run_migrations());
        assert_eq!(repo.listing_count().unwrap(), 0);
    }

    #[test]
    fn test_everything_new_on_empty_store() {
        let repo = repo();
        let batch = vec![listing("jnc_1", "3階"), listing("jnc_2", "")];
        assert_eq!(ids(&repo.filter_new(&batch).unwrap()), vec!["jnc_1", "jnc_2"]);
        assert!(repo.filter_new(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_filter_after_save_is_empty() {
        let repo = repo();
        let batch = vec![listing("jnc_1", "3階"), listing("jnc_2", "4階"), listing("jnc_3", "")];

        let fresh = repo.filter_new(&batch).unwrap();
        repo.save_listings(&fresh).unwrap();

        assert!(repo.filter_new(&fresh).unwrap().is_empty());
        assert!(repo.filter_new(&batch).unwrap().is_empty());
    }

    #[test]
    fn test_same_room_twice_in_batch_keeps_first() {
        let repo = repo();
        let batch = vec![listing("jnc_1", "3階"), listing("jnc_2", "3階")];
        assert_eq!(ids(&repo.filter_new(&batch).unwrap()), vec!["jnc_1"]);
    }

    #[test]
    fn test_same_id_on_two_pages_is_returned_once() {
        let repo = repo();
        let batch = vec![listing("jnc_1", ""), listing("jnc_2", "4階"), listing("jnc_1", "")];

        let fresh = repo.filter_new(&batch).unwrap();

        assert_eq!(ids(&fresh), vec!["jnc_1", "jnc_2"]);
        assert_eq!(repo.save_listings(&fresh).unwrap(), fresh.len());
    }

    #[test]
    fn test_same_room_under_new_id_is_not_new() {
        let repo = repo();
        repo.save_listings(&[listing("jnc_1", "3階")]).unwrap();

        let batch = vec![listing("jnc_9", "3階"), listing("jnc_10", "5階")];
        assert_eq!(ids(&repo.filter_new(&batch).unwrap()), vec!["jnc_10"]);
    }

    #[test]
    fn test_unknown_floor_only_dedups_by_id() {
        let repo = repo();
        repo.save_listings(&[listing("jnc_1", "")]).unwrap();

        let batch = vec![listing("jnc_1", ""), listing("jnc_2", ""), listing("jnc_3", "")];
        assert_eq!(ids(&repo.filter_new(&batch).unwrap()), vec!["jnc_2", "jnc_3"]);
    }

    #[test]
    fn test_order_follows_candidates() {
        let repo = repo();
        repo.save_listings(&[listing("jnc_b", "")]).unwrap();
        let batch = vec![
            listing("jnc_c", ""),
            listing("jnc_b", ""),
            listing("jnc_a", "2階"),
            listing("jnc_d", "2階"),
            listing("jnc_e", "7階"),
        ];
        assert_eq!(ids(&repo.filter_new(&batch).unwrap()), vec!["jnc_c", "jnc_a", "jnc_e"]);
    }

    #[test]
    fn test_save_twice_keeps_one_row_and_first_seen() {
        let repo = repo();
        let batch = vec![listing("jnc_1", "3階"), listing("jnc_2", "")];

        assert_eq!(repo.save_listings(&batch).unwrap(), 2);
        let first = repo.get_listing("jnc_1").unwrap().unwrap();

        let mut changed = batch.clone();
        changed[0].rent = "12万円".into();
        repo.save_listings(&changed).unwrap();

        assert_eq!(repo.listing_count().unwrap(), 2);
        let again = repo.get_listing("jnc_1").unwrap().unwrap();
        assert_eq!(again.first_seen_at, first.first_seen_at);
        assert_eq!(again.rent, "10万円");
        assert_eq!(again.physical_key, "東京都新宿区西新宿1|3階|1K|25.5m2");
        assert_eq!(again.notified_at, None);
    }

    #[test]
    fn test_delete_expired_with_empty_ids_is_noop() {
        let repo = repo();
        repo.save_listings(&[listing("jnc_1", ""), listing("jnc_2", "")]).unwrap();

        assert_eq!(repo.delete_expired(&[]).unwrap(), 0);
        assert_eq!(repo.listing_count().unwrap(), 2);
    }

    #[test]
    fn test_delete_expired_removes_absent_ids() {
        let repo = repo();
        repo.save_listings(&[listing("jnc_1", ""), listing("jnc_2", ""), listing("jnc_3", "")])
            .unwrap();

        let deleted = repo.delete_expired(&owned_ids(&["jnc_2", "jnc_99"])).unwrap();

        assert_eq!(deleted, 2);
        assert!(repo.get_listing("jnc_1").unwrap().is_none());
        assert!(repo.get_listing("jnc_2").unwrap().is_some());
        assert!(repo.get_listing("jnc_3").unwrap().is_none());
    }

    #[test]
    fn test_delisted_room_is_new_again() {
        let repo = repo();
        repo.save_listings(&[listing("jnc_1", "3階")]).unwrap();
        repo.delete_expired(&owned_ids(&["jnc_other"])).unwrap();

        let batch = vec![listing("jnc_1", "3階")];
        assert_eq!(ids(&repo.filter_new(&batch).unwrap()), vec!["jnc_1"]);
    }

    #[test]
    fn test_mark_notified() {
        let repo = repo();
        repo.save_listings(&[listing("jnc_1", ""), listing("jnc_2", "")]).unwrap();

        let updated = repo.mark_notified(&owned_ids(&["jnc_1", "jnc_unknown"])).unwrap();

        assert_eq!(updated, 1);
        assert!(repo.get_listing("jnc_1").unwrap().unwrap().notified_at.is_some());
        assert!(repo.get_listing("jnc_2").unwrap().unwrap().notified_at.is_none());
        assert_eq!(repo.notified_count().unwrap(), 1);
        assert_eq!(repo.mark_notified(&[]).unwrap(), 0);
    }

    #[test]
    fn test_run_log_is_append_only() {
        let repo = repo();
        repo.append_run_record(12, 3, None).unwrap();
        repo.append_run_record(0, 0, Some("boom")).unwrap();

        let runs = repo.recent_runs(10).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].error.as_deref(), Some("boom"));
        assert_eq!(runs[1].listings_found, 12);
        assert_eq!(runs[1].new_listings, 3);
        assert!(runs[0].id > runs[1].id);
    }

    #[test]
    fn test_list_listings_limit() {
        let repo = repo();
        repo.save_listings(&[listing("jnc_1", ""), listing("jnc_2", ""), listing("jnc_3", "")])
            .unwrap();
        assert_eq!(repo.list_listings(Some(2)).unwrap().len(), 2);
        assert_eq!(repo.list_listings(None).unwrap().len(), 3);
    }

    #[test]
    fn test_legacy_table_gains_columns_without_data_loss() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("suumo.duckdb");

        {
            let repo = Repository::open(&path).unwrap();
            repo.conn
                .execute_batch(
                    r#"CREATE TABLE listings (
                        listing_id VARCHAR PRIMARY KEY, url VARCHAR NOT NULL,
                        building_name VARCHAR, address VARCHAR, station_access VARCHAR,
                        rent VARCHAR, layout VARCHAR, area VARCHAR, age_floors VARCHAR,
                        first_seen_at TIMESTAMP NOT NULL, notified_at TIMESTAMP);
                       INSERT INTO listings VALUES ('jnc_old', 'https://suumo.jp/chintai/jnc_old/',
                        'ビル', '東京都', '', '9万円', '1DK', '30m2', '', TIMESTAMP '2024-01-01 00:00:00', NULL);"#,
                )
                .unwrap();
        }

        let repo = Repository::open(&path).unwrap();
        repo.run_migrations().unwrap();

        let old = repo.get_listing("jnc_old").unwrap().unwrap();
        assert_eq!(old.rent, "9万円");
        assert_eq!(old.unit_floor, "");
        assert_eq!(old.physical_key, "");

        // an empty legacy key never blocks a new room
        let fresh = repo.filter_new(&[listing("jnc_new", "3階")]).unwrap();
        assert_eq!(ids(&fresh), vec!["jnc_new"]);
    }
}

use std::collections::HashSet;
use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::info;

use crate::chain::PoolMetadata;
use crate::error::ServiceError;
use crate::store::migrations::BASE_MIGRATION;
use crate::votes::{pools_json, PoolWeight, StoredVote, VoteChangeRecord};

/// Single-writer store over one SQLite file. Every public method takes the
/// connection lock for the duration of its statement(s).
pub struct Store {
    conn: Mutex<Connection>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertVote {
    Inserted,
    Updated { old_pools: Vec<PoolWeight> },
    /// Identical (block, pools) retry; nothing written.
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingOutcome {
    Created,
    Updated,
    AlreadyExists,
}

#[derive(Debug, Clone, Serialize)]
pub struct Binding {
    pub voter: String,
    pub external: String,
    pub updated_at: String,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        self.conn.lock().execute_batch(BASE_MIGRATION)?;
        Ok(())
    }

    // ---- votes ----

    pub fn upsert_vote(
        &self,
        voter: &str,
        pools: &[PoolWeight],
        signature: &str,
        message: &str,
        block_number: u64,
        total_weight: u64,
    ) -> Result<UpsertVote, ServiceError> {
        let conn = self.conn.lock();
        let existing: Option<(String, i64)> = conn
            .query_row(
                "SELECT pools_json, block_number FROM votes WHERE voter = ?1",
                params![voter],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let new_json = pools_json(pools);
        if let Some((old_json, stored_block)) = existing {
            if stored_block as u64 == block_number && old_json == new_json {
                return Ok(UpsertVote::Unchanged);
            }
            if stored_block as u64 >= block_number {
                return Err(ServiceError::StaleBlock);
            }
            conn.execute(
                r#"
UPDATE votes
SET pools_json = ?2, signature = ?3, message = ?4, block_number = ?5,
    total_weight = ?6, updated_at = ?7
WHERE voter = ?1
"#,
                params![
                    voter,
                    new_json,
                    signature,
                    message,
                    block_number as i64,
                    total_weight as i64,
                    Utc::now().to_rfc3339()
                ],
            )?;
            info!("OVERWRITE vote for {voter}: {old_json} -> {new_json}");
            let old_pools = serde_json::from_str(&old_json).unwrap_or_default();
            Ok(UpsertVote::Updated { old_pools })
        } else {
            conn.execute(
                r#"
INSERT INTO votes(voter, pools_json, signature, message, block_number, total_weight, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
"#,
                params![
                    voter,
                    new_json,
                    signature,
                    message,
                    block_number as i64,
                    total_weight as i64,
                    Utc::now().to_rfc3339()
                ],
            )?;
            info!("NEW VOTE for {voter}: {new_json}");
            Ok(UpsertVote::Inserted)
        }
    }

    pub fn current_vote(&self, voter: &str) -> Result<Option<StoredVote>, ServiceError> {
        let conn = self.conn.lock();
        let vote = conn
            .query_row(
                r#"
SELECT voter, pools_json, signature, message, block_number, total_weight, updated_at
FROM votes WHERE voter = ?1
"#,
                params![voter],
                row_to_vote,
            )
            .optional()?;
        Ok(vote)
    }

    pub fn all_votes(&self) -> Result<Vec<StoredVote>, ServiceError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
SELECT voter, pools_json, signature, message, block_number, total_weight, updated_at
FROM votes ORDER BY voter
"#,
        )?;
        let rows = stmt
            .query_map([], row_to_vote)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ---- vote-change history ----

    pub fn record_vote_change(&self, record: &VoteChangeRecord) -> Result<(), ServiceError> {
        self.conn.lock().execute(
            r#"
INSERT INTO vote_history(voter, old_pools, new_pools, change_timestamp, cooldown_until, change_count)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
"#,
            params![
                record.voter,
                pools_json(&record.old_pools),
                pools_json(&record.new_pools),
                record.change_timestamp,
                record.cooldown_until,
                record.change_count as i64
            ],
        )?;
        Ok(())
    }

    pub fn latest_change(&self, voter: &str) -> Result<Option<VoteChangeRecord>, ServiceError> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                r#"
SELECT voter, old_pools, new_pools, change_timestamp, cooldown_until, change_count
FROM vote_history
WHERE voter = ?1
ORDER BY change_timestamp DESC, id DESC
LIMIT 1
"#,
                params![voter],
                row_to_change,
            )
            .optional()?;
        Ok(record)
    }

    pub fn vote_history(
        &self,
        voter: &str,
        limit: usize,
    ) -> Result<Vec<VoteChangeRecord>, ServiceError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
SELECT voter, old_pools, new_pools, change_timestamp, cooldown_until, change_count
FROM vote_history
WHERE voter = ?1
ORDER BY change_timestamp DESC, id DESC
LIMIT ?2
"#,
        )?;
        let rows = stmt
            .query_map(params![voter, limit as i64], row_to_change)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn cleanup_expired_cooldowns(&self, now: i64) -> Result<usize, ServiceError> {
        let removed = self.conn.lock().execute(
            "DELETE FROM vote_history WHERE cooldown_until < ?1",
            params![now],
        )?;
        Ok(removed)
    }

    // ---- bindings ----

    pub fn upsert_binding(
        &self,
        voter: &str,
        external: &str,
    ) -> Result<BindingOutcome, ServiceError> {
        let conn = self.conn.lock();
        let current: Option<String> = conn
            .query_row(
                "SELECT external FROM bindings WHERE voter = ?1",
                params![voter],
                |row| row.get(0),
            )
            .optional()?;
        if current.as_deref() == Some(external) {
            return Ok(BindingOutcome::AlreadyExists);
        }

        let taken: Option<String> = conn
            .query_row(
                "SELECT voter FROM bindings WHERE external = ?1",
                params![external],
                |row| row.get(0),
            )
            .optional()?;
        if taken.is_some_and(|owner| owner != voter) {
            return Err(ServiceError::InvalidInput);
        }

        let now = Utc::now().to_rfc3339();
        let outcome = if current.is_some() {
            conn.execute(
                "UPDATE bindings SET external = ?2, updated_at = ?3 WHERE voter = ?1",
                params![voter, external, now],
            )?;
            BindingOutcome::Updated
        } else {
            conn.execute(
                "INSERT INTO bindings(voter, external, updated_at) VALUES (?1, ?2, ?3)",
                params![voter, external, now],
            )?;
            BindingOutcome::Created
        };
        info!("address claim for {voter}: {external}");
        Ok(outcome)
    }

    pub fn binding_for_voter(&self, voter: &str) -> Result<Option<Binding>, ServiceError> {
        let conn = self.conn.lock();
        let binding = conn
            .query_row(
                "SELECT voter, external, updated_at FROM bindings WHERE voter = ?1",
                params![voter],
                row_to_binding,
            )
            .optional()?;
        Ok(binding)
    }

    pub fn binding_for_external(&self, external: &str) -> Result<Option<Binding>, ServiceError> {
        let conn = self.conn.lock();
        let binding = conn
            .query_row(
                "SELECT voter, external, updated_at FROM bindings WHERE external = ?1",
                params![external],
                row_to_binding,
            )
            .optional()?;
        Ok(binding)
    }

    pub fn all_bindings(&self) -> Result<Vec<Binding>, ServiceError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT voter, external, updated_at FROM bindings ORDER BY voter")?;
        let rows = stmt
            .query_map([], row_to_binding)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ---- pool metadata ----

    pub fn upsert_pool(&self, pool: &PoolMetadata) -> Result<(), ServiceError> {
        self.conn.lock().execute(
            r#"
INSERT INTO pools(address, token0, token1, fee, liquidity, symbol0, symbol1)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
ON CONFLICT(address) DO UPDATE SET
    token0 = excluded.token0, token1 = excluded.token1, fee = excluded.fee,
    liquidity = excluded.liquidity, symbol0 = excluded.symbol0, symbol1 = excluded.symbol1
"#,
            params![
                pool.address,
                pool.token0,
                pool.token1,
                pool.fee as i64,
                pool.liquidity.to_string(),
                pool.symbol0,
                pool.symbol1
            ],
        )?;
        Ok(())
    }

    pub fn pool(&self, address: &str) -> Result<Option<PoolMetadata>, ServiceError> {
        let conn = self.conn.lock();
        let pool = conn
            .query_row(
                "SELECT address, token0, token1, fee, liquidity, symbol0, symbol1 FROM pools WHERE address = ?1",
                params![address],
                row_to_pool,
            )
            .optional()?;
        Ok(pool)
    }

    pub fn all_pools(&self) -> Result<Vec<PoolMetadata>, ServiceError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT address, token0, token1, fee, liquidity, symbol0, symbol1 FROM pools ORDER BY address",
        )?;
        let rows = stmt
            .query_map([], row_to_pool)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn pools_missing_symbols(&self) -> Result<Vec<String>, ServiceError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT address FROM pools WHERE symbol0 IS NULL OR symbol1 IS NULL")?;
        let rows = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Pool addresses referenced by a current vote AND present in the pools
    /// table; the position fetcher's target set.
    pub fn voted_pool_addresses(&self) -> Result<Vec<String>, ServiceError> {
        let votes = self.all_votes()?;
        let known: HashSet<String> = self
            .all_pools()?
            .into_iter()
            .map(|pool| pool.address)
            .collect();
        let mut out: Vec<String> = votes
            .iter()
            .flat_map(|vote| vote.pools.iter())
            .map(|entry| entry.pool.clone())
            .filter(|address| known.contains(address))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        out.sort();
        Ok(out)
    }
}

fn row_to_vote(row: &Row<'_>) -> rusqlite::Result<StoredVote> {
    let pools_raw: String = row.get(1)?;
    let updated_raw: String = row.get(6)?;
    let updated_at = DateTime::parse_from_rfc3339(&updated_raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    Ok(StoredVote {
        voter: row.get(0)?,
        pools: serde_json::from_str(&pools_raw).unwrap_or_default(),
        signature: row.get(2)?,
        message: row.get(3)?,
        block_number: row.get::<_, i64>(4)? as u64,
        total_weight: row.get::<_, i64>(5)? as u64,
        updated_at,
    })
}

fn row_to_change(row: &Row<'_>) -> rusqlite::Result<VoteChangeRecord> {
    let old_raw: String = row.get(1)?;
    let new_raw: String = row.get(2)?;
    Ok(VoteChangeRecord {
        voter: row.get(0)?,
        old_pools: serde_json::from_str(&old_raw).unwrap_or_default(),
        new_pools: serde_json::from_str(&new_raw).unwrap_or_default(),
        change_timestamp: row.get(3)?,
        cooldown_until: row.get(4)?,
        change_count: row.get::<_, i64>(5)? as u32,
    })
}

fn row_to_binding(row: &Row<'_>) -> rusqlite::Result<Binding> {
    Ok(Binding {
        voter: row.get(0)?,
        external: row.get(1)?,
        updated_at: row.get(2)?,
    })
}

fn row_to_pool(row: &Row<'_>) -> rusqlite::Result<PoolMetadata> {
    let liquidity_raw: String = row.get(4)?;
    Ok(PoolMetadata {
        address: row.get(0)?,
        token0: row.get(1)?,
        token1: row.get(2)?,
        fee: row.get::<_, i64>(3)? as u32,
        liquidity: liquidity_raw.parse().unwrap_or(0),
        symbol0: row.get(5)?,
        symbol1: row.get(6)?,
    })
}

//! Shared test fixtures: a throwaway on-disk database plus ledger seeding
//! helpers and a stub metadata resolver.

use crate::agcommon::assets::AssetMetadataResolver;
use crate::agcommon::db::Database;
use crate::agcommon::error::Result;
use crate::agcommon::models::AssetMetadataEntry;
use async_trait::async_trait;
use rusqlite::params;
use std::collections::HashMap;

/// Fresh database in a temp directory. Keep the TempDir alive for the test's
/// duration or the file disappears under the pool.
pub(crate) fn test_db() -> (tempfile::TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::new(dir.path().join("agent_stats.db"), 4).unwrap();
    (dir, db)
}

/// Create the externally-owned ledger tables the service reads from.
pub(crate) fn create_ledger_tables(db: &Database) {
    let conn = db.conn().unwrap();
    conn.execute_batch(
        "CREATE TABLE units (
            unit TEXT PRIMARY KEY,
            timestamp INTEGER NOT NULL
        );
        CREATE TABLE agent_responses (
            response_id INTEGER PRIMARY KEY,
            agent_address TEXT NOT NULL,
            trigger_address TEXT NOT NULL,
            trigger_unit TEXT NOT NULL,
            response_unit TEXT NULL,
            bounced INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE outputs (
            unit TEXT NOT NULL,
            address TEXT NOT NULL,
            asset TEXT NULL,
            amount INTEGER NOT NULL
        );
        CREATE TABLE agent_balances (
            address TEXT NOT NULL,
            asset TEXT NOT NULL,
            balance INTEGER NOT NULL
        );
        CREATE TABLE assets (
            asset TEXT PRIMARY KEY,
            cap INTEGER NULL,
            definer_address TEXT NOT NULL
        );",
    )
    .unwrap();
    db.ensure_ledger_indexes().unwrap();
}

/// Seed one ledger execution event: the trigger unit with its timestamp, the
/// response row, outputs paid to the agent on the trigger unit (inflows) and
/// outputs paid to third parties on the response unit (outflows).
pub(crate) fn seed_event(
    db: &Database,
    id: i64,
    timestamp: i64,
    agent: &str,
    trigger_address: &str,
    bounced: bool,
    inflows: &[(Option<&str>, i64)],
    outflows: &[(&str, Option<&str>, i64)],
) {
    let conn = db.conn().unwrap();
    let trigger_unit = format!("t{}", id);
    let response_unit = format!("r{}", id);

    conn.execute(
        "INSERT INTO units (unit, timestamp) VALUES (?1, ?2)",
        params![trigger_unit, timestamp],
    )
    .unwrap();
    conn.execute(
        "INSERT INTO agent_responses (response_id, agent_address, trigger_address, trigger_unit, response_unit, bounced)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![id, agent, trigger_address, trigger_unit, response_unit, bounced as i64],
    )
    .unwrap();

    for (asset, amount) in inflows {
        conn.execute(
            "INSERT INTO outputs (unit, address, asset, amount) VALUES (?1, ?2, ?3, ?4)",
            params![trigger_unit, agent, asset, amount],
        )
        .unwrap();
    }
    for (address, asset, amount) in outflows {
        conn.execute(
            "INSERT INTO outputs (unit, address, asset, amount) VALUES (?1, ?2, ?3, ?4)",
            params![response_unit, address, asset, amount],
        )
        .unwrap();
    }
}

pub(crate) fn seed_balance(db: &Database, address: &str, asset: &str, balance: i64) {
    let conn = db.conn().unwrap();
    conn.execute(
        "INSERT INTO agent_balances (address, asset, balance) VALUES (?1, ?2, ?3)",
        params![address, asset, balance],
    )
    .unwrap();
}

pub(crate) fn seed_asset(db: &Database, asset: &str, cap: Option<i64>, definer: &str) {
    let conn = db.conn().unwrap();
    conn.execute(
        "INSERT INTO assets (asset, cap, definer_address) VALUES (?1, ?2, ?3)",
        params![asset, cap, definer],
    )
    .unwrap();
}

/// In-memory metadata resolver for tests.
pub(crate) struct StubResolver {
    pub entries: HashMap<String, AssetMetadataEntry>,
}

impl StubResolver {
    pub(crate) fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub(crate) fn with(entries: &[(&str, &str, i32)]) -> Self {
        Self {
            entries: entries
                .iter()
                .map(|(id, name, decimals)| {
                    (
                        id.to_string(),
                        AssetMetadataEntry {
                            name: name.to_string(),
                            decimals: *decimals,
                        },
                    )
                })
                .collect(),
        }
    }
}

#[async_trait]
impl AssetMetadataResolver for StubResolver {
    async fn resolve(&self, assets: Option<&[String]>) -> Result<HashMap<String, AssetMetadataEntry>> {
        match assets {
            None => Ok(self.entries.clone()),
            Some(ids) => Ok(ids
                .iter()
                .filter_map(|id| self.entries.get(id).map(|m| (id.clone(), m.clone())))
                .collect()),
        }
    }
}

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::vault::schema::VaultStorage;
use crate::vault::types::Address;

/// Singleton registry row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStateRecord {
    pub implementation: Address,
    pub next_strategy_id: u64,
    pub salt: String,
}

/// One vault known to the registry, in creation order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryVaultRecord {
    pub address: Address,
    pub strategy_symbol: String,
    pub strategy_id: u64,
    pub creator: Address,
    pub ordinal: u64,
}

#[derive(Clone)]
pub struct VaultDb {
    conn: Arc<Mutex<Connection>>,
}

impl VaultDb {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open vault db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS registry_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                implementation TEXT NOT NULL,
                next_strategy_id INTEGER NOT NULL,
                salt TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS registry_vaults (
                address TEXT PRIMARY KEY,
                strategy_symbol TEXT NOT NULL UNIQUE,
                strategy_id INTEGER NOT NULL,
                creator TEXT NOT NULL,
                ordinal INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_registry_vaults_ordinal ON registry_vaults(ordinal ASC)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS vault_storage (
                address TEXT PRIMARY KEY,
                schema_version INTEGER NOT NULL,
                implementation TEXT NOT NULL,
                storage_json TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn save_registry(
        &self,
        state: &RegistryStateRecord,
        vaults: &[RegistryVaultRecord],
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO registry_state (id, implementation, next_strategy_id, salt, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
               implementation = excluded.implementation,
               next_strategy_id = excluded.next_strategy_id,
               salt = excluded.salt,
               updated_at = excluded.updated_at",
            params![
                state.implementation.as_str(),
                state.next_strategy_id as i64,
                state.salt,
                now
            ],
        )?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO registry_vaults
                 (address, strategy_symbol, strategy_id, creator, ordinal)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for v in vaults {
                stmt.execute(params![
                    v.address.as_str(),
                    v.strategy_symbol,
                    v.strategy_id as i64,
                    v.creator.as_str(),
                    v.ordinal as i64
                ])?;
            }
        }
        tx.commit().context("commit registry snapshot")?;
        Ok(())
    }

    pub async fn load_registry(
        &self,
    ) -> Result<Option<(RegistryStateRecord, Vec<RegistryVaultRecord>)>> {
        let conn = self.conn.lock().await;
        let state = conn
            .query_row(
                "SELECT implementation, next_strategy_id, salt FROM registry_state WHERE id = 1",
                [],
                |row| {
                    let implementation: String = row.get(0)?;
                    let next: i64 = row.get(1)?;
                    let salt: String = row.get(2)?;
                    Ok(RegistryStateRecord {
                        implementation: Address::new(implementation),
                        next_strategy_id: next.max(1) as u64,
                        salt,
                    })
                },
            )
            .optional()?;
        let Some(state) = state else {
            return Ok(None);
        };

        let mut stmt = conn.prepare_cached(
            "SELECT address, strategy_symbol, strategy_id, creator, ordinal
             FROM registry_vaults ORDER BY ordinal ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let address: String = row.get(0)?;
            let strategy_symbol: String = row.get(1)?;
            let strategy_id: i64 = row.get(2)?;
            let creator: String = row.get(3)?;
            let ordinal: i64 = row.get(4)?;
            Ok(RegistryVaultRecord {
                address: Address::new(address),
                strategy_symbol,
                strategy_id: strategy_id.max(0) as u64,
                creator: Address::new(creator),
                ordinal: ordinal.max(0) as u64,
            })
        })?;
        let mut vaults = Vec::new();
        for r in rows {
            vaults.push(r?);
        }
        Ok(Some((state, vaults)))
    }

    pub async fn save_vault(&self, storage: &VaultStorage) -> Result<()> {
        let json = storage
            .to_json()
            .with_context(|| format!("encode storage for {}", storage.profile.address))?;
        let now = chrono::Utc::now().timestamp();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO vault_storage (address, schema_version, implementation, storage_json, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(address) DO UPDATE SET
               schema_version = excluded.schema_version,
               implementation = excluded.implementation,
               storage_json = excluded.storage_json,
               updated_at = excluded.updated_at",
            params![
                storage.profile.address.as_str(),
                storage.schema_version as i64,
                storage.implementation.as_str(),
                json,
                now
            ],
        )?;
        Ok(())
    }

    /// Stored snapshot for `address`, migrated to the current schema.
    pub async fn load_vault_storage(&self, address: &Address) -> Result<Option<VaultStorage>> {
        let conn = self.conn.lock().await;
        let json: Option<String> = conn
            .query_row(
                "SELECT storage_json FROM vault_storage WHERE address = ?1",
                params![address.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        match json {
            Some(raw) => {
                let storage = VaultStorage::from_json(&raw)
                    .with_context(|| format!("decode storage for {}", address))?;
                Ok(Some(storage))
            }
            None => Ok(None),
        }
    }

    /// Raw stored schema version, before migration.
    pub async fn stored_schema_version(&self, address: &Address) -> Result<Option<u32>> {
        let conn = self.conn.lock().await;
        let version: Option<i64> = conn
            .query_row(
                "SELECT schema_version FROM vault_storage WHERE address = ?1",
                params![address.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version.map(|v| v.max(0) as u32))
    }

    /// Write a raw snapshot as-is (used to import legacy exports).
    pub async fn import_raw_storage(
        &self,
        address: &Address,
        schema_version: u32,
        implementation: &Address,
        storage_json: &str,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO vault_storage
             (address, schema_version, implementation, storage_json, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                address.as_str(),
                schema_version as i64,
                implementation.as_str(),
                storage_json,
                now
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn create_test_db() -> (VaultDb, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap();
        let db = VaultDb::new(db_path).unwrap();
        (db, temp_file)
    }

    #[tokio::test]
    async fn test_empty_registry_loads_none() {
        let (db, _temp) = create_test_db();
        assert!(db.load_registry().await.unwrap().is_none());
        assert!(db
            .load_vault_storage(&Address::new("0xvault"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_registry_roundtrip_preserves_order() {
        let (db, _temp) = create_test_db();
        let state = RegistryStateRecord {
            implementation: Address::new("0ximpl1"),
            next_strategy_id: 3,
            salt: "salt".to_string(),
        };
        let vaults = vec![
            RegistryVaultRecord {
                address: Address::new("0xb"),
                strategy_symbol: "BTC-PERP-LONG".to_string(),
                strategy_id: 2,
                creator: Address::new("0xc"),
                ordinal: 1,
            },
            RegistryVaultRecord {
                address: Address::new("0xa"),
                strategy_symbol: "ETH-PERP-LONG".to_string(),
                strategy_id: 1,
                creator: Address::new("0xc"),
                ordinal: 0,
            },
        ];
        db.save_registry(&state, &vaults).await.unwrap();

        let (loaded_state, loaded) = db.load_registry().await.unwrap().unwrap();
        assert_eq!(loaded_state, state);
        assert_eq!(loaded[0].strategy_symbol, "ETH-PERP-LONG");
        assert_eq!(loaded[1].strategy_symbol, "BTC-PERP-LONG");

        // Second save updates in place
        let state2 = RegistryStateRecord {
            implementation: Address::new("0ximpl2"),
            ..state
        };
        db.save_registry(&state2, &vaults).await.unwrap();
        let (loaded_state, loaded) = db.load_registry().await.unwrap().unwrap();
        assert_eq!(loaded_state.implementation, Address::new("0ximpl2"));
        assert_eq!(loaded.len(), 2);
    }
}

//! Session persistence for the protocol adapter
//!
//! Everything the protocol library asks us to remember lives in one SQLite file
//! under the configured session directory. Records are opaque blobs filed by
//! namespace and key in a single `wa_kv` table; only the device record and the
//! LID/phone mapping (which is looked up from both sides) get tables of their own.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
#[cfg(test)]
use std::str::FromStr;

use wacore::appstate::hash::HashState;
use wacore::appstate::processor::AppStateMutationMAC;
use wacore::store::Device;
use wacore::store::error::{Result, StoreError, db_err};
use wacore::store::traits::{
    AppStateSyncKey, AppSyncStore, DeviceListRecord, DeviceStore, LidPnMappingEntry, ProtocolStore,
    SignalStore,
};

const SCHEMA: [&str; 4] = [
    "CREATE TABLE IF NOT EXISTS wa_device (
        id      INTEGER PRIMARY KEY,
        data    BLOB NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS wa_kv (
        ns      TEXT NOT NULL,
        key     TEXT NOT NULL,
        device  INTEGER NOT NULL,
        value   BLOB NOT NULL,
        PRIMARY KEY (ns, key, device)
    )",
    "CREATE TABLE IF NOT EXISTS wa_lid_map (
        lid             TEXT NOT NULL,
        phone           TEXT NOT NULL,
        created_at      INTEGER NOT NULL,
        updated_at      INTEGER NOT NULL,
        source          TEXT NOT NULL DEFAULT '',
        device          INTEGER NOT NULL,
        PRIMARY KEY (lid, device)
    )",
    "CREATE INDEX IF NOT EXISTS idx_lid_map_phone ON wa_lid_map (phone, device)",
];

/// Record namespaces inside `wa_kv`.
mod ns {
    pub const IDENTITY: &str = "identity";
    pub const SESSION: &str = "session";
    pub const PREKEY: &str = "prekey";
    pub const SIGNED_PREKEY: &str = "signed_prekey";
    pub const SENDER_KEY: &str = "sender_key";
    pub const SYNC_KEY: &str = "sync_key";
    pub const APP_VERSION: &str = "app_version";
    pub const MUTATION_MAC: &str = "mutation_mac";
    pub const BASE_KEY: &str = "base_key";
    pub const DEVICE_LIST: &str = "device_list";

    /// Per-group sets: one namespace per group so they can be listed and cleared.
    pub fn skdm(group: &str) -> String {
        format!("skdm:{group}")
    }

    pub fn forget(group: &str) -> String {
        format!("forget:{group}")
    }
}

fn blob_key(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// SQLite-backed store handed to the protocol library as its backend.
#[derive(Clone)]
pub struct SqlxStore {
    pool: SqlitePool,
    device: i32,
}

impl SqlxStore {
    /// Open (or create) `session.db` inside `session_dir`.
    pub async fn open_dir(session_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(session_dir)
            .map_err(|e| StoreError::Connection(format!("{}: {e}", session_dir.display())))?;
        let opts = SqliteConnectOptions::new()
            .filename(session_dir.join("session.db"))
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        Self::connect(opts, 4).await
    }

    /// Throwaway store for tests.
    #[cfg(test)]
    async fn in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(":memory:")
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        // One connection: every in-memory connection is its own database.
        Self::connect(opts, 1).await
    }

    async fn connect(opts: SqliteConnectOptions, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let store = Self { pool, device: 1 };
        for stmt in SCHEMA {
            sqlx::query(stmt)
                .execute(&store.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(store)
    }

    /// Whether a usable paired device record is on disk.
    pub async fn device_exists(&self) -> Result<bool> {
        Ok(self.load_device_bytes().await?.is_some_and(|bytes| {
            rmp_serde::from_slice::<Device>(&bytes).is_ok()
        }))
    }

    /// Drop every record, forcing a fresh pairing on the next connect.
    pub async fn wipe(&self) -> Result<()> {
        for table in ["wa_device", "wa_kv", "wa_lid_map"] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    async fn get(&self, ns: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT value FROM wa_kv WHERE ns = ? AND key = ? AND device = ?")
            .bind(ns)
            .bind(key)
            .bind(self.device)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(|r| r.get("value")))
    }

    async fn put(&self, ns: &str, key: &str, value: &[u8]) -> Result<()> {
        sqlx::query(
            "INSERT INTO wa_kv (ns, key, device, value) VALUES (?, ?, ?, ?)
             ON CONFLICT(ns, key, device) DO UPDATE SET value = excluded.value",
        )
        .bind(ns)
        .bind(key)
        .bind(self.device)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn delete(&self, ns: &str, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM wa_kv WHERE ns = ? AND key = ? AND device = ?")
            .bind(ns)
            .bind(key)
            .bind(self.device)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn list(&self, ns: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let rows = sqlx::query("SELECT key, value FROM wa_kv WHERE ns = ? AND device = ?")
            .bind(ns)
            .bind(self.device)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get("key"), r.get("value")))
            .collect())
    }

    async fn clear(&self, ns: &str) -> Result<()> {
        sqlx::query("DELETE FROM wa_kv WHERE ns = ? AND device = ?")
            .bind(ns)
            .bind(self.device)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn load_device_bytes(&self) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT data FROM wa_device WHERE id = ?")
            .bind(self.device)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(|r| r.get("data")))
    }

    async fn lid_entry(&self, column: &str, value: &str) -> Result<Option<LidPnMappingEntry>> {
        let sql = format!(
            "SELECT lid, phone, created_at, updated_at, source
             FROM wa_lid_map WHERE {column} = ? AND device = ?"
        );
        let row = sqlx::query(&sql)
            .bind(value)
            .bind(self.device)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(|r| lid_from_row(&r)))
    }
}

fn lid_from_row(r: &sqlx::sqlite::SqliteRow) -> LidPnMappingEntry {
    LidPnMappingEntry {
        lid: r.get("lid"),
        phone_number: r.get("phone"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
        learning_source: r.get("source"),
    }
}

fn base_key_slot(address: &str, message_id: &str) -> String {
    format!("{address}|{message_id}")
}

fn mutation_slot(name: &str, index_mac: &[u8]) -> String {
    format!("{name}|{}", blob_key(index_mac))
}

#[async_trait]
impl SignalStore for SqlxStore {
    async fn put_identity(&self, address: &str, key: [u8; 32]) -> Result<()> {
        self.put(ns::IDENTITY, address, &key).await
    }

    async fn load_identity(&self, address: &str) -> Result<Option<Vec<u8>>> {
        self.get(ns::IDENTITY, address).await
    }

    async fn delete_identity(&self, address: &str) -> Result<()> {
        self.delete(ns::IDENTITY, address).await
    }

    async fn get_session(&self, address: &str) -> Result<Option<Vec<u8>>> {
        self.get(ns::SESSION, address).await
    }

    async fn put_session(&self, address: &str, session: &[u8]) -> Result<()> {
        self.put(ns::SESSION, address, session).await
    }

    async fn delete_session(&self, address: &str) -> Result<()> {
        self.delete(ns::SESSION, address).await
    }

    // The uploaded flag only matters to the server; nothing reads it back.
    async fn store_prekey(&self, id: u32, record: &[u8], _uploaded: bool) -> Result<()> {
        self.put(ns::PREKEY, &id.to_string(), record).await
    }

    async fn load_prekey(&self, id: u32) -> Result<Option<Vec<u8>>> {
        self.get(ns::PREKEY, &id.to_string()).await
    }

    async fn remove_prekey(&self, id: u32) -> Result<()> {
        self.delete(ns::PREKEY, &id.to_string()).await
    }

    async fn store_signed_prekey(&self, id: u32, record: &[u8]) -> Result<()> {
        self.put(ns::SIGNED_PREKEY, &id.to_string(), record).await
    }

    async fn load_signed_prekey(&self, id: u32) -> Result<Option<Vec<u8>>> {
        self.get(ns::SIGNED_PREKEY, &id.to_string()).await
    }

    async fn load_all_signed_prekeys(&self) -> Result<Vec<(u32, Vec<u8>)>> {
        let mut keys: Vec<(u32, Vec<u8>)> = self
            .list(ns::SIGNED_PREKEY)
            .await?
            .into_iter()
            .filter_map(|(key, value)| key.parse().ok().map(|id| (id, value)))
            .collect();
        keys.sort_by_key(|(id, _)| *id);
        Ok(keys)
    }

    async fn remove_signed_prekey(&self, id: u32) -> Result<()> {
        self.delete(ns::SIGNED_PREKEY, &id.to_string()).await
    }

    async fn put_sender_key(&self, address: &str, record: &[u8]) -> Result<()> {
        self.put(ns::SENDER_KEY, address, record).await
    }

    async fn get_sender_key(&self, address: &str) -> Result<Option<Vec<u8>>> {
        self.get(ns::SENDER_KEY, address).await
    }

    async fn delete_sender_key(&self, address: &str) -> Result<()> {
        self.delete(ns::SENDER_KEY, address).await
    }
}

#[async_trait]
impl AppSyncStore for SqlxStore {
    async fn get_sync_key(&self, key_id: &[u8]) -> Result<Option<AppStateSyncKey>> {
        match self.get(ns::SYNC_KEY, &blob_key(key_id)).await? {
            Some(bytes) => decode_json(&bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn set_sync_key(&self, key_id: &[u8], key: AppStateSyncKey) -> Result<()> {
        self.put(ns::SYNC_KEY, &blob_key(key_id), &encode_json(&key)?)
            .await
    }

    async fn get_version(&self, name: &str) -> Result<HashState> {
        match self.get(ns::APP_VERSION, name).await? {
            Some(bytes) => decode_json(&bytes),
            None => Ok(HashState::default()),
        }
    }

    async fn set_version(&self, name: &str, state: HashState) -> Result<()> {
        self.put(ns::APP_VERSION, name, &encode_json(&state)?).await
    }

    // Only the latest value MAC per index is ever looked up, so the version
    // is not part of the slot.
    async fn put_mutation_macs(
        &self,
        name: &str,
        _version: u64,
        mutations: &[AppStateMutationMAC],
    ) -> Result<()> {
        for m in mutations {
            self.put(ns::MUTATION_MAC, &mutation_slot(name, &m.index_mac), &m.value_mac)
                .await?;
        }
        Ok(())
    }

    async fn get_mutation_mac(&self, name: &str, index_mac: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get(ns::MUTATION_MAC, &mutation_slot(name, index_mac))
            .await
    }

    async fn delete_mutation_macs(&self, name: &str, index_macs: &[Vec<u8>]) -> Result<()> {
        for mac in index_macs {
            self.delete(ns::MUTATION_MAC, &mutation_slot(name, mac))
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ProtocolStore for SqlxStore {
    async fn get_skdm_recipients(&self, group_jid: &str) -> Result<Vec<String>> {
        let rows = self.list(&ns::skdm(group_jid)).await?;
        Ok(rows.into_iter().map(|(jid, _)| jid).collect())
    }

    async fn add_skdm_recipients(&self, group_jid: &str, device_jids: &[String]) -> Result<()> {
        let set = ns::skdm(group_jid);
        for jid in device_jids {
            self.put(&set, jid, &[]).await?;
        }
        Ok(())
    }

    async fn clear_skdm_recipients(&self, group_jid: &str) -> Result<()> {
        self.clear(&ns::skdm(group_jid)).await
    }

    async fn get_lid_mapping(&self, lid: &str) -> Result<Option<LidPnMappingEntry>> {
        self.lid_entry("lid", lid).await
    }

    async fn get_pn_mapping(&self, phone: &str) -> Result<Option<LidPnMappingEntry>> {
        self.lid_entry("phone", phone).await
    }

    async fn put_lid_mapping(&self, entry: &LidPnMappingEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO wa_lid_map (lid, phone, created_at, updated_at, source, device)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(lid, device) DO UPDATE SET
                phone = excluded.phone,
                updated_at = excluded.updated_at,
                source = excluded.source",
        )
        .bind(&entry.lid)
        .bind(&entry.phone_number)
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .bind(&entry.learning_source)
        .bind(self.device)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_all_lid_mappings(&self) -> Result<Vec<LidPnMappingEntry>> {
        let rows = sqlx::query(
            "SELECT lid, phone, created_at, updated_at, source FROM wa_lid_map WHERE device = ?",
        )
        .bind(self.device)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.iter().map(lid_from_row).collect())
    }

    async fn save_base_key(&self, address: &str, message_id: &str, base_key: &[u8]) -> Result<()> {
        self.put(ns::BASE_KEY, &base_key_slot(address, message_id), base_key)
            .await
    }

    async fn has_same_base_key(
        &self,
        address: &str,
        message_id: &str,
        current_base_key: &[u8],
    ) -> Result<bool> {
        let stored = self
            .get(ns::BASE_KEY, &base_key_slot(address, message_id))
            .await?;
        Ok(stored.as_deref() == Some(current_base_key))
    }

    async fn delete_base_key(&self, address: &str, message_id: &str) -> Result<()> {
        self.delete(ns::BASE_KEY, &base_key_slot(address, message_id))
            .await
    }

    async fn update_device_list(&self, record: DeviceListRecord) -> Result<()> {
        self.put(ns::DEVICE_LIST, &record.user, &encode_json(&record)?)
            .await
    }

    async fn get_devices(&self, user: &str) -> Result<Option<DeviceListRecord>> {
        match self.get(ns::DEVICE_LIST, user).await? {
            Some(bytes) => decode_json(&bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn mark_forget_sender_key(&self, group_jid: &str, participant: &str) -> Result<()> {
        self.put(&ns::forget(group_jid), participant, &[]).await
    }

    async fn consume_forget_marks(&self, group_jid: &str) -> Result<Vec<String>> {
        let set = ns::forget(group_jid);
        let marks: Vec<String> = self.list(&set).await?.into_iter().map(|(p, _)| p).collect();
        if !marks.is_empty() {
            self.clear(&set).await?;
        }
        Ok(marks)
    }
}

#[async_trait]
impl DeviceStore for SqlxStore {
    async fn save(&self, device: &Device) -> Result<()> {
        let bytes =
            rmp_serde::to_vec(device).map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query(
            "INSERT INTO wa_device (id, data) VALUES (?, ?)
             ON CONFLICT(id) DO UPDATE SET data = excluded.data",
        )
        .bind(self.device)
        .bind(&bytes)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn load(&self) -> Result<Option<Device>> {
        let Some(bytes) = self.load_device_bytes().await? else {
            return Ok(None);
        };
        match rmp_serde::from_slice(&bytes) {
            Ok(device) => Ok(Some(device)),
            Err(e) => {
                tracing::warn!("WhatsApp: unreadable device record, pairing again: {}", e);
                sqlx::query("DELETE FROM wa_device WHERE id = ?")
                    .bind(self.device)
                    .execute(&self.pool)
                    .await
                    .map_err(db_err)?;
                Ok(None)
            }
        }
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.load_device_bytes().await?.is_some())
    }

    async fn create(&self) -> Result<i32> {
        Ok(self.device)
    }
}

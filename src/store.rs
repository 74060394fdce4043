//! SQLite-backed presence history.
//!
//! One row per hardware address plus an append-only scan log. A whole cycle
//! (every device's counters and the scan row) is written in one transaction.

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;

use crate::error::{StoreError, StoreResult};
use crate::models::{DeviceRecord, DeviceSummary, HardwareAddr, HistoryStats, ScanRecord};

/// Longest note accepted, in characters.
pub const MAX_NOTE_LEN: usize = 1024;

#[derive(Debug, Clone)]
pub struct PresenceStore {
    pool: SqlitePool,
}

impl PresenceStore {
    /// Open (creating if needed) the database file at `path` and migrate it.
    pub async fn open(path: &Path) -> StoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        Self::connect(options).await
    }

    /// Private in-memory database, used by tests and `--database :memory:`.
    pub async fn in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        Self::connect(options).await
    }

    async fn connect(options: SqliteConnectOptions) -> StoreResult<Self> {
        // A single long-lived connection: store operations serialize and an
        // in-memory database survives for the life of the pool.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn load_devices(&self) -> StoreResult<Vec<DeviceRecord>> {
        let rows = sqlx::query_as::<_, DeviceRow>(
            r#"
            SELECT mac, ip, hostname, notes, total_scans, scans_seen_online,
                   consecutive_offline, first_seen, last_seen, last_seen_online
            FROM devices
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DeviceRecord::try_from).collect()
    }

    pub async fn device(&self, hardware_id: &HardwareAddr) -> StoreResult<Option<DeviceRecord>> {
        let row = sqlx::query_as::<_, DeviceRow>(
            r#"
            SELECT mac, ip, hostname, notes, total_scans, scans_seen_online,
                   consecutive_offline, first_seen, last_seen, last_seen_online
            FROM devices
            WHERE mac = ?1
            "#,
        )
        .bind(hardware_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(DeviceRecord::try_from).transpose()
    }

    /// Persist one reconciled cycle atomically.
    ///
    /// Notes are never written here so a note set while the cycle was running
    /// survives the commit.
    pub async fn commit_cycle(&self, records: &[DeviceRecord], scan: &ScanRecord) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        for record in records {
            sqlx::query(
                r#"
                INSERT INTO devices (
                    mac, ip, hostname, notes, total_scans, scans_seen_online,
                    consecutive_offline, first_seen, last_seen, last_seen_online, updated_at
                )
                VALUES (?1, ?2, ?3, '', ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT (mac) DO UPDATE SET
                    ip = excluded.ip,
                    hostname = excluded.hostname,
                    total_scans = excluded.total_scans,
                    scans_seen_online = excluded.scans_seen_online,
                    consecutive_offline = excluded.consecutive_offline,
                    last_seen = excluded.last_seen,
                    last_seen_online = excluded.last_seen_online,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(record.hardware_id.as_str())
            .bind(record.address.to_string())
            .bind(record.name.as_deref())
            .bind(i64::from(record.total_scans))
            .bind(i64::from(record.scans_online))
            .bind(i64::from(record.consecutive_offline))
            .bind(record.first_seen)
            .bind(record.last_seen)
            .bind(record.last_seen_online)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO scans (scan_time, devices_found, scan_method)
            VALUES (?1, ?2, ?3)
            "#,
        )
        .bind(scan.scanned_at)
        .bind(i64::from(scan.devices_found))
        .bind(&scan.method)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Set the free-text note of a device.
    ///
    /// `id` is a hardware address or a network address; an address matching
    /// several records resolves to the one seen most recently.
    pub async fn set_note(&self, id: &str, text: &str) -> StoreResult<DeviceRecord> {
        let text = text.trim_end();
        if text.chars().count() > MAX_NOTE_LEN {
            return Err(StoreError::InvalidNote(format!(
                "note exceeds {MAX_NOTE_LEN} characters"
            )));
        }

        let hardware_id = self
            .resolve_id(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let result = sqlx::query("UPDATE devices SET notes = ?1, updated_at = ?2 WHERE mac = ?3")
            .bind(text)
            .bind(Utc::now())
            .bind(hardware_id.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }

        self.device(&hardware_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn resolve_id(&self, id: &str) -> StoreResult<Option<HardwareAddr>> {
        if let Ok(hardware_id) = id.parse::<HardwareAddr>() {
            return Ok(self.device(&hardware_id).await?.map(|r| r.hardware_id));
        }

        let Ok(address) = id.trim().parse::<Ipv4Addr>() else {
            return Ok(None);
        };

        // Every known device gets `last_seen` each cycle, so a stale record
        // left at a reassigned address ties on it. Rank by the last time the
        // device actually answered.
        let mac: Option<String> = sqlx::query_scalar(
            r#"
            SELECT mac
            FROM devices
            WHERE ip = ?1
            ORDER BY last_seen_online DESC, consecutive_offline ASC, last_seen DESC
            LIMIT 1
            "#,
        )
        .bind(address.to_string())
        .fetch_optional(&self.pool)
        .await?;

        mac.map(|mac| {
            mac.parse::<HardwareAddr>().map_err(|message| StoreError::Corrupt {
                key: mac.clone(),
                message,
            })
        })
        .transpose()
    }

    pub async fn scan_count(&self) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM scans")
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Scan log, newest first.
    pub async fn recent_scans(&self, limit: u32) -> StoreResult<Vec<ScanRecord>> {
        let rows = sqlx::query_as::<_, ScanRow>(
            r#"
            SELECT scan_time, devices_found, scan_method
            FROM scans
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ScanRecord {
                scanned_at: row.scan_time,
                devices_found: u32::try_from(row.devices_found).unwrap_or(0),
                method: row.scan_method,
            })
            .collect())
    }

    /// Aggregate view of the whole history, most recently seen devices first.
    pub async fn history_stats(&self, now: DateTime<Utc>) -> StoreResult<HistoryStats> {
        let mut records = self.load_devices().await?;
        let total_scans = self.scan_count().await?;

        let day_ago = now - Duration::hours(24);
        let active_24h = records
            .iter()
            .filter(|r| r.last_seen_online.is_some_and(|at| at > day_ago))
            .count() as u64;

        records.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));

        Ok(HistoryStats {
            total_devices: records.len() as u64,
            total_scans,
            active_24h,
            devices: records.iter().map(DeviceSummary::from).collect(),
        })
    }
}

#[derive(sqlx::FromRow)]
struct DeviceRow {
    mac: String,
    ip: String,
    hostname: Option<String>,
    notes: String,
    total_scans: i64,
    scans_seen_online: i64,
    consecutive_offline: i64,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    last_seen_online: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct ScanRow {
    scan_time: DateTime<Utc>,
    devices_found: i64,
    scan_method: String,
}

impl TryFrom<DeviceRow> for DeviceRecord {
    type Error = StoreError;

    fn try_from(row: DeviceRow) -> Result<Self, Self::Error> {
        let corrupt = |message: String| StoreError::Corrupt {
            key: row.mac.clone(),
            message,
        };
        let counter = |name: &str, value: i64| {
            u32::try_from(value).map_err(|_| corrupt(format!("{name} out of range: {value}")))
        };

        Ok(DeviceRecord {
            hardware_id: row.mac.parse().map_err(|e: String| corrupt(e))?,
            address: row
                .ip
                .parse()
                .map_err(|_| corrupt(format!("bad address {}", row.ip)))?,
            total_scans: counter("total_scans", row.total_scans)?,
            scans_online: counter("scans_seen_online", row.scans_seen_online)?,
            consecutive_offline: counter("consecutive_offline", row.consecutive_offline)?,
            name: row.hostname,
            note: row.notes,
            first_seen: row.first_seen,
            last_seen: row.last_seen,
            last_seen_online: row.last_seen_online,
        })
    }
}

//! Persistence store
//!
//! Four tables with hand-written mapping: channels, devices, device types
//! and their points. Soft deletion is a nullable `deleted_at`; disabled
//! points keep their row with `enabled = 0`. The schema is created at
//! startup; every statement is plain SQL against the shared pool.

use chrono::{DateTime, Utc};
use common::SqliteClient;
use gridflux_comlink::{ByteOrder, WordOrder};
use gridflux_model::{Access, Channel, Device, DeviceTypePoint};
use gridflux_protocols::modbus::{DataType, Parity, RegKind, TransportKind};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::info;

use crate::error::{AcqError, Result};

/// Create the schema when absent
pub async fn migrate(db: &SqliteClient) -> Result<()> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS channels (
            id               TEXT PRIMARY KEY,
            name             TEXT NOT NULL DEFAULT '',
            plugin           TEXT NOT NULL,
            transport        TEXT NOT NULL,
            tcp_host         TEXT NOT NULL DEFAULT '',
            tcp_port         INTEGER NOT NULL DEFAULT 0,
            backup_host      TEXT NOT NULL DEFAULT '',
            backup_port      INTEGER NOT NULL DEFAULT 0,
            device           TEXT NOT NULL DEFAULT '',
            device2          TEXT NOT NULL DEFAULT '',
            baud             INTEGER NOT NULL DEFAULT 19200,
            data_bits        INTEGER NOT NULL DEFAULT 8,
            stop_bits        INTEGER NOT NULL DEFAULT 1,
            parity           TEXT NOT NULL DEFAULT 'none',
            byte_order       TEXT NOT NULL DEFAULT 'big',
            word_order       TEXT NOT NULL DEFAULT 'high_first',
            timeout_ms       INTEGER NOT NULL DEFAULT 500,
            send_interval_ms INTEGER NOT NULL DEFAULT 200,
            retry_max        INTEGER NOT NULL DEFAULT 0,
            retry_delay_ms   INTEGER NOT NULL DEFAULT 300,
            enabled          INTEGER NOT NULL DEFAULT 1,
            created_at       TEXT NOT NULL,
            updated_at       TEXT NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_channels_device ON channels(device)",
        r#"
        CREATE TABLE IF NOT EXISTS devices (
            id               TEXT PRIMARY KEY,
            channel_id       TEXT NOT NULL,
            name             TEXT NOT NULL,
            device_type      TEXT NOT NULL,
            unit_id          INTEGER NOT NULL DEFAULT 1,
            poll_interval_ms INTEGER NOT NULL DEFAULT 1000,
            serial_number    TEXT NOT NULL DEFAULT '',
            software_version TEXT NOT NULL DEFAULT '',
            model            TEXT NOT NULL DEFAULT '',
            enabled          INTEGER NOT NULL DEFAULT 1,
            created_at       TEXT NOT NULL,
            updated_at       TEXT NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_devices_channel ON devices(channel_id)",
        r#"
        CREATE TABLE IF NOT EXISTS device_types (
            id         TEXT PRIMARY KEY,
            type_key   TEXT NOT NULL UNIQUE,
            name_en    TEXT NOT NULL,
            vendor     TEXT NOT NULL DEFAULT '',
            model      TEXT NOT NULL DEFAULT '',
            version    TEXT NOT NULL DEFAULT '',
            checksum   TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS device_type_points (
            id         TEXT PRIMARY KEY,
            type_key   TEXT NOT NULL,
            point_code TEXT NOT NULL,
            kind       TEXT NOT NULL,
            name_i18n  TEXT NOT NULL DEFAULT '{}',
            unit       TEXT NOT NULL DEFAULT '',
            rw         TEXT NOT NULL DEFAULT 'R',
            enabled    INTEGER NOT NULL DEFAULT 1,
            fc         INTEGER NOT NULL,
            address    INTEGER NOT NULL,
            quantity   INTEGER NOT NULL DEFAULT 1,
            data_type  TEXT NOT NULL,
            bit_index  INTEGER,
            byte_order TEXT,
            scale      REAL NOT NULL DEFAULT 1,
            "offset"   REAL NOT NULL DEFAULT 0,
            precision  INTEGER NOT NULL DEFAULT 0,
            enum_map   TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT,
            UNIQUE (type_key, point_code)
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_points_type ON device_type_points(type_key)",
    ];

    for statement in statements {
        sqlx::query(statement).execute(db.pool()).await?;
    }
    info!("schema ready");
    Ok(())
}

// ============================================================================
// Enum <-> column text
// ============================================================================

fn transport_to_str(t: TransportKind) -> &'static str {
    t.as_str()
}

fn parse_transport(s: &str) -> Result<TransportKind> {
    match s {
        "tcp" => Ok(TransportKind::Tcp),
        "rtu-client" => Ok(TransportKind::RtuClient),
        "rtu-server" => Ok(TransportKind::RtuServer),
        "tcp-server" => Ok(TransportKind::TcpServer),
        other => Err(AcqError::config(format!("unknown transport {other:?}"))),
    }
}

fn parity_to_str(p: Parity) -> &'static str {
    match p {
        Parity::None => "none",
        Parity::Even => "even",
        Parity::Odd => "odd",
    }
}

fn parse_parity(s: &str) -> Parity {
    match s {
        "even" => Parity::Even,
        "odd" => Parity::Odd,
        _ => Parity::None,
    }
}

fn byte_order_to_str(b: ByteOrder) -> &'static str {
    match b {
        ByteOrder::Big => "big",
        ByteOrder::Little => "little",
    }
}

fn parse_byte_order(s: &str) -> ByteOrder {
    if s == "little" {
        ByteOrder::Little
    } else {
        ByteOrder::Big
    }
}

fn word_order_to_str(w: WordOrder) -> &'static str {
    match w {
        WordOrder::HighFirst => "high_first",
        WordOrder::LowFirst => "low_first",
    }
}

fn parse_word_order(s: &str) -> WordOrder {
    if s == "low_first" {
        WordOrder::LowFirst
    } else {
        WordOrder::HighFirst
    }
}

fn parse_timestamp(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|text| {
        DateTime::parse_from_rfc3339(&text)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    })
}

// ============================================================================
// Channels
// ============================================================================

fn channel_from_row(row: &SqliteRow) -> Result<Channel> {
    Ok(Channel {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        plugin: row.try_get("plugin")?,
        transport: parse_transport(row.try_get::<String, _>("transport")?.as_str())?,
        tcp_host: row.try_get("tcp_host")?,
        tcp_port: row.try_get::<i64, _>("tcp_port")? as u16,
        backup_host: row.try_get("backup_host")?,
        backup_port: row.try_get::<i64, _>("backup_port")? as u16,
        device: row.try_get("device")?,
        device2: row.try_get("device2")?,
        baud: row.try_get::<i64, _>("baud")? as u32,
        data_bits: row.try_get::<i64, _>("data_bits")? as u8,
        stop_bits: row.try_get::<i64, _>("stop_bits")? as u8,
        parity: parse_parity(row.try_get::<String, _>("parity")?.as_str()),
        byte_order: parse_byte_order(row.try_get::<String, _>("byte_order")?.as_str()),
        word_order: parse_word_order(row.try_get::<String, _>("word_order")?.as_str()),
        timeout_ms: row.try_get::<i64, _>("timeout_ms")? as u64,
        send_interval_ms: row.try_get::<i64, _>("send_interval_ms")? as u64,
        retry_max: row.try_get::<i64, _>("retry_max")? as u32,
        retry_delay_ms: row.try_get::<i64, _>("retry_delay_ms")? as u64,
        enabled: row.try_get::<i64, _>("enabled")? != 0,
        created_at: parse_timestamp(row.try_get("created_at").ok()),
        updated_at: parse_timestamp(row.try_get("updated_at").ok()),
    })
}

/// Insert or update one channel row
pub async fn upsert_channel(db: &SqliteClient, channel: &Channel) -> Result<()> {
    channel.validate().map_err(AcqError::Link)?;
    let now = Utc::now().to_rfc3339();
    sqlx::query(
        r#"
        INSERT INTO channels (
            id, name, plugin, transport, tcp_host, tcp_port, backup_host,
            backup_port, device, device2, baud, data_bits, stop_bits, parity,
            byte_order, word_order, timeout_ms, send_interval_ms, retry_max,
            retry_delay_ms, enabled, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            plugin = excluded.plugin,
            transport = excluded.transport,
            tcp_host = excluded.tcp_host,
            tcp_port = excluded.tcp_port,
            backup_host = excluded.backup_host,
            backup_port = excluded.backup_port,
            device = excluded.device,
            device2 = excluded.device2,
            baud = excluded.baud,
            data_bits = excluded.data_bits,
            stop_bits = excluded.stop_bits,
            parity = excluded.parity,
            byte_order = excluded.byte_order,
            word_order = excluded.word_order,
            timeout_ms = excluded.timeout_ms,
            send_interval_ms = excluded.send_interval_ms,
            retry_max = excluded.retry_max,
            retry_delay_ms = excluded.retry_delay_ms,
            enabled = excluded.enabled,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&channel.id)
    .bind(&channel.name)
    .bind(&channel.plugin)
    .bind(transport_to_str(channel.transport))
    .bind(&channel.tcp_host)
    .bind(i64::from(channel.tcp_port))
    .bind(&channel.backup_host)
    .bind(i64::from(channel.backup_port))
    .bind(&channel.device)
    .bind(&channel.device2)
    .bind(i64::from(channel.baud))
    .bind(i64::from(channel.data_bits))
    .bind(i64::from(channel.stop_bits))
    .bind(parity_to_str(channel.parity))
    .bind(byte_order_to_str(channel.byte_order))
    .bind(word_order_to_str(channel.word_order))
    .bind(channel.timeout_ms as i64)
    .bind(channel.send_interval_ms as i64)
    .bind(i64::from(channel.retry_max))
    .bind(channel.retry_delay_ms as i64)
    .bind(i64::from(channel.enabled))
    .bind(&now)
    .bind(&now)
    .execute(db.pool())
    .await?;
    Ok(())
}

pub async fn get_channel(db: &SqliteClient, id: &str) -> Result<Option<Channel>> {
    let row = sqlx::query("SELECT * FROM channels WHERE id = ?")
        .bind(id)
        .fetch_optional(db.pool())
        .await?;
    row.as_ref().map(channel_from_row).transpose()
}

pub async fn list_channels(db: &SqliteClient, enabled_only: bool) -> Result<Vec<Channel>> {
    let sql = if enabled_only {
        "SELECT * FROM channels WHERE enabled = 1 ORDER BY id"
    } else {
        "SELECT * FROM channels ORDER BY id"
    };
    let rows = sqlx::query(sql).fetch_all(db.pool()).await?;
    rows.iter().map(channel_from_row).collect()
}

pub async fn delete_channel(db: &SqliteClient, id: &str) -> Result<()> {
    sqlx::query("DELETE FROM channels WHERE id = ?")
        .bind(id)
        .execute(db.pool())
        .await?;
    Ok(())
}

/// Make sure a serial bus from the startup configuration has a channel row;
/// an existing row for the device path is left untouched
pub async fn ensure_serial_channel(db: &SqliteClient, device: &str, device2: &str) -> Result<()> {
    let existing: Option<String> =
        sqlx::query_scalar("SELECT id FROM channels WHERE device = ?")
            .bind(device)
            .fetch_optional(db.pool())
            .await?;
    if existing.is_some() {
        return Ok(());
    }
    let channel = Channel::default_serial(device, device2);
    upsert_channel(db, &channel).await?;
    info!(device, id = %channel.id, "serial channel seeded");
    Ok(())
}

// ============================================================================
// Devices
// ============================================================================

fn device_from_row(row: &SqliteRow) -> Result<Device> {
    Ok(Device {
        id: row.try_get("id")?,
        channel_id: row.try_get("channel_id")?,
        name: row.try_get("name")?,
        device_type: row.try_get("device_type")?,
        unit_id: row.try_get::<i64, _>("unit_id")? as u8,
        poll_interval_ms: row.try_get::<i64, _>("poll_interval_ms")? as u64,
        serial_number: row.try_get("serial_number")?,
        software_version: row.try_get("software_version")?,
        model: row.try_get("model")?,
        enabled: row.try_get::<i64, _>("enabled")? != 0,
        created_at: parse_timestamp(row.try_get("created_at").ok()),
        updated_at: parse_timestamp(row.try_get("updated_at").ok()),
    })
}

pub async fn upsert_device(db: &SqliteClient, device: &Device) -> Result<()> {
    device.validate().map_err(AcqError::Link)?;
    let now = Utc::now().to_rfc3339();
    sqlx::query(
        r#"
        INSERT INTO devices (
            id, channel_id, name, device_type, unit_id, poll_interval_ms,
            serial_number, software_version, model, enabled, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            channel_id = excluded.channel_id,
            name = excluded.name,
            device_type = excluded.device_type,
            unit_id = excluded.unit_id,
            poll_interval_ms = excluded.poll_interval_ms,
            serial_number = excluded.serial_number,
            software_version = excluded.software_version,
            model = excluded.model,
            enabled = excluded.enabled,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&device.id)
    .bind(&device.channel_id)
    .bind(&device.name)
    .bind(&device.device_type)
    .bind(i64::from(device.unit_id))
    .bind(device.poll_interval_ms as i64)
    .bind(&device.serial_number)
    .bind(&device.software_version)
    .bind(&device.model)
    .bind(i64::from(device.enabled))
    .bind(&now)
    .bind(&now)
    .execute(db.pool())
    .await?;
    Ok(())
}

pub async fn list_devices_for_channel(db: &SqliteClient, channel_id: &str) -> Result<Vec<Device>> {
    let rows =
        sqlx::query("SELECT * FROM devices WHERE channel_id = ? AND enabled = 1 ORDER BY unit_id")
            .bind(channel_id)
            .fetch_all(db.pool())
            .await?;
    rows.iter().map(device_from_row).collect()
}

// ============================================================================
// Device-type points
// ============================================================================

fn point_from_row(row: &SqliteRow) -> Result<DeviceTypePoint> {
    let kind_text: String = row.try_get("kind")?;
    let kind = RegKind::parse(&kind_text)
        .ok_or_else(|| AcqError::config(format!("unknown point kind {kind_text:?}")))?;
    let data_type_text: String = row.try_get("data_type")?;
    let data_type = DataType::parse(&data_type_text)
        .ok_or_else(|| AcqError::config(format!("unknown data type {data_type_text:?}")))?;
    let rw_text: String = row.try_get("rw")?;

    let name_i18n: std::collections::HashMap<String, String> =
        serde_json::from_str(row.try_get::<String, _>("name_i18n")?.as_str())?;
    let enum_map = row
        .try_get::<Option<String>, _>("enum_map")?
        .map(|text| serde_json::from_str(&text))
        .transpose()?;

    Ok(DeviceTypePoint {
        id: row.try_get("id")?,
        type_key: row.try_get("type_key")?,
        point_code: row.try_get("point_code")?,
        kind,
        name_i18n,
        unit: row.try_get("unit")?,
        rw: Access::normalize(&rw_text),
        enabled: row.try_get::<i64, _>("enabled")? != 0,
        function_code: row.try_get::<i64, _>("fc")? as u8,
        address: row.try_get::<i64, _>("address")? as u16,
        quantity: row.try_get::<i64, _>("quantity")? as u16,
        data_type,
        bit_index: row.try_get::<Option<i64>, _>("bit_index")?.map(|v| v as u8),
        byte_order: row.try_get("byte_order")?,
        scale: row.try_get("scale")?,
        offset: row.try_get("offset")?,
        precision: row.try_get::<i64, _>("precision")? as i32,
        enum_map,
        created_at: parse_timestamp(row.try_get("created_at").ok()),
        updated_at: parse_timestamp(row.try_get("updated_at").ok()),
        deleted_at: parse_timestamp(row.try_get("deleted_at").ok()),
    })
}

/// Enabled, live points of one device type, in address order
pub async fn load_type_points(db: &SqliteClient, type_key: &str) -> Result<Vec<DeviceTypePoint>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM device_type_points
        WHERE type_key = ? AND enabled = 1 AND deleted_at IS NULL
        ORDER BY fc, address
        "#,
    )
    .bind(type_key)
    .fetch_all(db.pool())
    .await?;
    rows.iter().map(point_from_row).collect()
}

/// Every point row of a type, including disabled and soft-deleted ones
pub async fn load_all_type_points(
    db: &SqliteClient,
    type_key: &str,
) -> Result<Vec<DeviceTypePoint>> {
    let rows = sqlx::query(
        "SELECT * FROM device_type_points WHERE type_key = ? ORDER BY point_code",
    )
    .bind(type_key)
    .fetch_all(db.pool())
    .await?;
    rows.iter().map(point_from_row).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_roundtrip() {
        let db = SqliteClient::in_memory().await.unwrap();
        migrate(&db).await.unwrap();

        let mut channel = Channel::default_tcp("ch-1", "127.0.0.1", 1502);
        channel.byte_order = ByteOrder::Little;
        channel.word_order = WordOrder::LowFirst;
        channel.retry_max = 2;
        upsert_channel(&db, &channel).await.unwrap();

        let loaded = get_channel(&db, "ch-1").await.unwrap().unwrap();
        assert_eq!(loaded.tcp_host, "127.0.0.1");
        assert_eq!(loaded.byte_order, ByteOrder::Little);
        assert_eq!(loaded.word_order, WordOrder::LowFirst);
        assert_eq!(loaded.retry_max, 2);
        assert!(loaded.created_at.is_some());

        // Update keeps the row unique by id
        channel.tcp_port = 1503;
        upsert_channel(&db, &channel).await.unwrap();
        let all = list_channels(&db, false).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].tcp_port, 1503);
    }

    #[tokio::test]
    async fn test_enabled_filter() {
        let db = SqliteClient::in_memory().await.unwrap();
        migrate(&db).await.unwrap();

        let mut on = Channel::default_tcp("ch-on", "h", 1);
        on.enabled = true;
        let mut off = Channel::default_tcp("ch-off", "h", 1);
        off.enabled = false;
        upsert_channel(&db, &on).await.unwrap();
        upsert_channel(&db, &off).await.unwrap();

        let enabled = list_channels(&db, true).await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, "ch-on");
    }

    #[tokio::test]
    async fn test_ensure_serial_channel_is_idempotent() {
        let db = SqliteClient::in_memory().await.unwrap();
        migrate(&db).await.unwrap();

        ensure_serial_channel(&db, "/dev/ttyS0", "/dev/ttyS1")
            .await
            .unwrap();
        ensure_serial_channel(&db, "/dev/ttyS0", "/dev/ttyS1")
            .await
            .unwrap();

        let all = list_channels(&db, false).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].plugin, "mbus");
        assert_eq!(all[0].baud, 19_200);
    }

    #[tokio::test]
    async fn test_device_roundtrip() {
        let db = SqliteClient::in_memory().await.unwrap();
        migrate(&db).await.unwrap();

        let device = Device::new("ch-1", "inverter-1", "inv-x", 17);
        upsert_device(&db, &device).await.unwrap();

        let loaded = list_devices_for_channel(&db, "ch-1").await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].unit_id, 17);
        assert_eq!(loaded[0].device_type, "inv-x");
    }
}

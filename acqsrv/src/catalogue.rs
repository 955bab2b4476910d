//! Device-type catalogue import
//!
//! A validated spec is upserted by `type_key`, points by `(type_key,
//! point_code)`. Points present in storage but absent from the new spec are
//! either soft-deleted (revivable by a later import) or disabled, per the
//! operator's choice. The whole import is one transaction; a checksum of
//! the canonical serialised spec short-circuits unchanged re-imports so
//! they leave storage untouched.

use std::path::Path;

use chrono::Utc;
use common::SqliteClient;
use gridflux_model::{parse_spec, validate_spec, TypeSpec};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Result;

/// What to do with points missing from the new spec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    /// Mark missing points deleted; a later import revives them
    SoftDeleteMissing,
    /// Flip missing points to `enabled = false`
    DisableMissing,
}

/// Summary of one import
#[derive(Debug, Clone)]
pub struct ImportOutcome {
    pub type_key: String,
    pub points_upserted: usize,
    pub checksum: String,
    /// The stored checksum already matched; nothing was written
    pub unchanged: bool,
}

/// Import one spec document (raw YAML or JSON bytes)
pub async fn import_spec_bytes(
    db: &SqliteClient,
    data: &[u8],
    mode: ImportMode,
) -> Result<ImportOutcome> {
    let spec = parse_spec(data)?;
    import_spec(db, spec, mode).await
}

/// Import one parsed spec
pub async fn import_spec(
    db: &SqliteClient,
    mut spec: TypeSpec,
    mode: ImportMode,
) -> Result<ImportOutcome> {
    validate_spec(&mut spec)?;

    // Canonical form: the validated spec, defaults filled in, as JSON
    let canonical = serde_json::to_vec(&spec)?;
    let checksum = hex::encode(Sha256::digest(&canonical));

    let stored: Option<String> =
        sqlx::query_scalar("SELECT checksum FROM device_types WHERE type_key = ? AND deleted_at IS NULL")
            .bind(&spec.type_key)
            .fetch_optional(db.pool())
            .await?;
    if stored.as_deref() == Some(checksum.as_str()) {
        info!(type_key = %spec.type_key, "catalogue unchanged, skipping import");
        return Ok(ImportOutcome {
            type_key: spec.type_key,
            points_upserted: 0,
            checksum,
            unchanged: true,
        });
    }

    let now = Utc::now().to_rfc3339();
    let mut tx = db.pool().begin().await?;

    // 1) Upsert the type row
    sqlx::query(
        r#"
        INSERT INTO device_types (
            id, type_key, name_en, vendor, model, version, checksum,
            created_at, updated_at, deleted_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
        ON CONFLICT(type_key) DO UPDATE SET
            name_en = excluded.name_en,
            vendor = excluded.vendor,
            model = excluded.model,
            version = excluded.version,
            checksum = excluded.checksum,
            updated_at = excluded.updated_at,
            deleted_at = NULL
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&spec.type_key)
    .bind(&spec.name_en)
    .bind(&spec.vendor)
    .bind(&spec.model)
    .bind(&spec.version)
    .bind(&checksum)
    .bind(&now)
    .bind(&now)
    .execute(&mut *tx)
    .await?;

    // 2) Upsert every point; an update revives a soft-deleted row
    for point in &spec.points {
        let name_i18n = serde_json::to_string(&point.name_i18n)?;
        let enum_map = point
            .modbus
            .enum_map
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO device_type_points (
                id, type_key, point_code, kind, name_i18n, unit, rw, enabled,
                fc, address, quantity, data_type, bit_index, byte_order,
                scale, "offset", precision, enum_map, created_at, updated_at,
                deleted_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
            ON CONFLICT(type_key, point_code) DO UPDATE SET
                kind = excluded.kind,
                name_i18n = excluded.name_i18n,
                unit = excluded.unit,
                rw = excluded.rw,
                enabled = 1,
                fc = excluded.fc,
                address = excluded.address,
                quantity = excluded.quantity,
                data_type = excluded.data_type,
                bit_index = excluded.bit_index,
                byte_order = excluded.byte_order,
                scale = excluded.scale,
                "offset" = excluded."offset",
                precision = excluded.precision,
                enum_map = excluded.enum_map,
                updated_at = excluded.updated_at,
                deleted_at = NULL
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&spec.type_key)
        .bind(&point.code)
        .bind(&point.kind)
        .bind(&name_i18n)
        .bind(&point.unit)
        .bind(&point.rw)
        .bind(i64::from(point.modbus.fc))
        .bind(i64::from(point.modbus.address))
        .bind(i64::from(point.modbus.quantity))
        .bind(&point.modbus.data_type)
        .bind(point.modbus.bit_index.map(i64::from))
        .bind(&point.modbus.byte_order)
        .bind(point.modbus.scale)
        .bind(point.modbus.offset)
        .bind(i64::from(point.modbus.precision))
        .bind(&enum_map)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
    }

    // 3) Points in storage but absent from this spec
    let placeholders = vec!["?"; spec.points.len()].join(", ");
    match mode {
        ImportMode::SoftDeleteMissing => {
            let sql = format!(
                "UPDATE device_type_points SET deleted_at = ?, updated_at = ? \
                 WHERE type_key = ? AND deleted_at IS NULL AND point_code NOT IN ({placeholders})"
            );
            let mut query = sqlx::query(&sql).bind(&now).bind(&now).bind(&spec.type_key);
            for point in &spec.points {
                query = query.bind(&point.code);
            }
            query.execute(&mut *tx).await?;
        }
        ImportMode::DisableMissing => {
            let sql = format!(
                "UPDATE device_type_points SET enabled = 0, updated_at = ? \
                 WHERE type_key = ? AND enabled = 1 AND point_code NOT IN ({placeholders})"
            );
            let mut query = sqlx::query(&sql).bind(&now).bind(&spec.type_key);
            for point in &spec.points {
                query = query.bind(&point.code);
            }
            query.execute(&mut *tx).await?;
        }
    }

    tx.commit().await?;

    info!(
        type_key = %spec.type_key,
        points = spec.points.len(),
        %checksum,
        "catalogue imported"
    );
    Ok(ImportOutcome {
        points_upserted: spec.points.len(),
        type_key: spec.type_key,
        checksum,
        unchanged: false,
    })
}

/// Import every spec file found in a directory (the startup seeder)
///
/// Files ending in `.yaml`, `.yml` or `.json` are imported in name order
/// with soft-delete-missing semantics. A missing directory is not an error;
/// a file that fails to import is logged and skipped.
pub async fn seed_from_dir(db: &SqliteClient, dir: &Path) -> Result<usize> {
    if !dir.is_dir() {
        return Ok(0);
    }

    let mut paths: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml") | Some("json")
            )
        })
        .collect();
    paths.sort();

    let mut imported = 0;
    for path in paths {
        let data = std::fs::read(&path)?;
        match import_spec_bytes(db, &data, ImportMode::SoftDeleteMissing).await {
            Ok(outcome) => {
                info!(file = %path.display(), type_key = %outcome.type_key, "seeded device type");
                imported += 1;
            }
            Err(e) => {
                warn!(file = %path.display(), error = %e, "seed import failed");
            }
        }
    }
    Ok(imported)
}

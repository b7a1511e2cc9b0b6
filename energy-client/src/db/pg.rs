use sqlx::{
    postgres::{PgPool, PgRow},
    FromRow, Postgres, QueryBuilder, Row, Transaction,
};
use time::OffsetDateTime;

use super::BucketStore;
use crate::{
    domain::{
        Bucket, BucketKey, BucketWindow, Channel, ChannelStats, ChargeFold, ChargeSample,
        EnergyCounters, Extrema, InstantReading, PowerFold, Reading, Resolution,
    },
    error::StoreError,
};

const CHARGE_PREFIX: &str = "charge";

/// `BucketStore` over Postgres. Schema lives in `sql/schema/`.
///
/// Each upsert is a single `INSERT .. ON CONFLICT DO UPDATE`; Postgres holds
/// the row lock for the duration of the statement, so concurrent folds into
/// one key serialize and folds into different keys do not contend. The fold
/// id is claimed in `applied_folds` inside the same transaction.
#[derive(Debug, Clone)]
pub struct PgBucketStore {
    pool: PgPool,
}

impl PgBucketStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl<'r> FromRow<'r, PgRow> for InstantReading {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            location: row.try_get("location")?,
            ts: row.try_get("ts")?,
            site: row.try_get("site_power")?,
            load: row.try_get("load_power")?,
            battery: row.try_get("battery_power")?,
            solar: row.try_get("solar_power")?,
        })
    }
}

impl<'r> FromRow<'r, PgRow> for ChargeSample {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            location: row.try_get("location")?,
            ts: row.try_get("ts")?,
            percent_charged: row.try_get("percent_charged")?,
        })
    }
}

/// Upsert for one extrema column group. `$1` location, `$2` bucket_start,
/// `$3` value, `$4` ts, and with energy `$5` imported, `$6` exported.
///
/// Extrema only move on a strictly greater/lower value, so ties keep the
/// first recorded timestamp. `count = 0` marks a group created by another
/// channel's first sample.
fn extrema_upsert_sql(table: &str, p: &str, with_energy: bool) -> String {
    let (energy_cols, energy_vals, energy_set) = if with_energy {
        (
            format!(", {p}_imported, {p}_exported"),
            ", $5, $6",
            format!(
                ",\n            {p}_imported = b.{p}_imported + EXCLUDED.{p}_imported,\n            {p}_exported = b.{p}_exported + EXCLUDED.{p}_exported"
            ),
        )
    } else {
        (String::new(), "", String::new())
    };

    format!(
        r#"
        INSERT INTO {table} AS b
            (location, bucket_start, {p}_hi, {p}_hi_time, {p}_lo, {p}_lo_time, {p}_count, {p}_sum{energy_cols})
        VALUES ($1, $2, $3, $4, $3, $4, 1, $3{energy_vals})
        ON CONFLICT (location, bucket_start) DO UPDATE SET
            {p}_hi = CASE WHEN b.{p}_count = 0 OR EXCLUDED.{p}_hi > b.{p}_hi
                          THEN EXCLUDED.{p}_hi ELSE b.{p}_hi END,
            {p}_hi_time = CASE WHEN b.{p}_count = 0 OR EXCLUDED.{p}_hi > b.{p}_hi
                               THEN EXCLUDED.{p}_hi_time ELSE b.{p}_hi_time END,
            {p}_lo = CASE WHEN b.{p}_count = 0 OR EXCLUDED.{p}_lo < b.{p}_lo
                          THEN EXCLUDED.{p}_lo ELSE b.{p}_lo END,
            {p}_lo_time = CASE WHEN b.{p}_count = 0 OR EXCLUDED.{p}_lo < b.{p}_lo
                               THEN EXCLUDED.{p}_lo_time ELSE b.{p}_lo_time END,
            {p}_count = b.{p}_count + 1,
            {p}_sum = b.{p}_sum + EXCLUDED.{p}_sum{energy_set}
        "#
    )
}

/// Claims `fold_id` for this transaction. `false` when it was applied before.
async fn claim_fold(tx: &mut Transaction<'_, Postgres>, fold_id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO applied_folds (fold_id) VALUES ($1) ON CONFLICT (fold_id) DO NOTHING",
    )
    .bind(fold_id)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected() == 1)
}

fn bucket_columns() -> String {
    let mut cols = String::from("location, bucket_start");
    for channel in Channel::ALL {
        let p = channel.as_str();
        cols.push_str(&format!(
            ", {p}_hi, {p}_hi_time, {p}_lo, {p}_lo_time, {p}_count, {p}_sum, {p}_imported, {p}_exported"
        ));
    }
    let p = CHARGE_PREFIX;
    cols.push_str(&format!(
        ", {p}_hi, {p}_hi_time, {p}_lo, {p}_lo_time, {p}_count, {p}_sum"
    ));
    cols
}

fn extrema_from_row(row: &PgRow, p: &str) -> Result<Option<Extrema>, sqlx::Error> {
    let count: i64 = row.try_get(format!("{p}_count").as_str())?;
    if count == 0 {
        return Ok(None);
    }
    Ok(Some(Extrema {
        hi: row.try_get(format!("{p}_hi").as_str())?,
        hi_time: row.try_get(format!("{p}_hi_time").as_str())?,
        lo: row.try_get(format!("{p}_lo").as_str())?,
        lo_time: row.try_get(format!("{p}_lo_time").as_str())?,
        count,
        sum: row.try_get(format!("{p}_sum").as_str())?,
    }))
}

fn channel_from_row(row: &PgRow, channel: Channel) -> Result<Option<ChannelStats>, sqlx::Error> {
    let p = channel.as_str();
    let Some(power) = extrema_from_row(row, p)? else {
        return Ok(None);
    };
    Ok(Some(ChannelStats {
        power,
        imported: row.try_get(format!("{p}_imported").as_str())?,
        exported: row.try_get(format!("{p}_exported").as_str())?,
    }))
}

fn bucket_from_row(row: &PgRow, resolution: Resolution) -> Result<Bucket, sqlx::Error> {
    Ok(Bucket {
        location: row.try_get("location")?,
        resolution,
        bucket_start: row.try_get("bucket_start")?,
        site: channel_from_row(row, Channel::Site)?,
        load: channel_from_row(row, Channel::Load)?,
        battery: channel_from_row(row, Channel::Battery)?,
        solar: channel_from_row(row, Channel::Solar)?,
        charge: extrema_from_row(row, CHARGE_PREFIX)?,
    })
}

#[async_trait::async_trait]
impl BucketStore for PgBucketStore {
    async fn record_reading(&self, reading: &Reading) -> Result<bool, StoreError> {
        let mut builder = QueryBuilder::<Postgres>::new("INSERT INTO raw_readings (event_id, location, ts");
        for channel in Channel::ALL {
            let p = channel.as_str();
            builder.push(format_args!(", {p}_power, {p}_imported_total, {p}_exported_total"));
        }
        builder.push(", percent_charged) VALUES (");

        let mut values = builder.separated(", ");
        values.push_bind(reading.event_id());
        values.push_bind(&reading.location);
        values.push_bind(reading.ts);
        for channel in Channel::ALL {
            let c = reading.channel(channel);
            values.push_bind(c.power);
            values.push_bind(c.energy.map(|e| e.imported));
            values.push_bind(c.energy.map(|e| e.exported));
        }
        values.push_bind(reading.percent_charged);
        values.push_unseparated(") ON CONFLICT (event_id) DO NOTHING");

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_charge(&self, charge: &ChargeSample) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO charge_readings (location, ts, percent_charged)
            VALUES ($1, $2, $3)
            ON CONFLICT (location, ts) DO NOTHING
            "#,
        )
        .bind(&charge.location)
        .bind(charge.ts)
        .bind(charge.percent_charged)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_instant(&self, location: &str) -> Result<InstantReading, StoreError> {
        sqlx::query_as::<_, InstantReading>(
            r#"
            SELECT location, ts, site_power, load_power, battery_power, solar_power
            FROM raw_readings
            WHERE location = $1
            ORDER BY ts DESC
            LIMIT 1
            "#,
        )
        .bind(location)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("no raw reading for location {location}")))
    }

    async fn latest_charge(&self, location: &str) -> Result<ChargeSample, StoreError> {
        sqlx::query_as::<_, ChargeSample>(
            r#"
            SELECT location, ts, percent_charged
            FROM charge_readings
            WHERE location = $1
            ORDER BY ts DESC
            LIMIT 1
            "#,
        )
        .bind(location)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("no charge reading for location {location}")))
    }

    async fn previous_counters(
        &self,
        location: &str,
        channel: Channel,
        before: OffsetDateTime,
    ) -> Result<Option<EnergyCounters>, StoreError> {
        let p = channel.as_str();
        let sql = format!(
            r#"
            SELECT {p}_imported_total, {p}_exported_total
            FROM raw_readings
            WHERE location = $1 AND ts < $2
              AND {p}_imported_total IS NOT NULL
              AND {p}_exported_total IS NOT NULL
            ORDER BY ts DESC
            LIMIT 1
            "#
        );
        let row: Option<(Option<f64>, Option<f64>)> = sqlx::query_as(&sql)
            .bind(location)
            .bind(before)
            .fetch_optional(&self.pool)
            .await?;

        Ok(match row {
            Some((Some(imported), Some(exported))) => Some(EnergyCounters { imported, exported }),
            _ => None,
        })
    }

    async fn upsert_power(
        &self,
        fold_id: &str,
        keys: &[BucketKey],
        fold: &PowerFold,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        if !claim_fold(&mut tx, fold_id).await? {
            return Ok(false);
        }
        for key in keys {
            let sql = extrema_upsert_sql(key.resolution.table(), fold.channel.as_str(), true);
            sqlx::query(&sql)
                .bind(&key.location)
                .bind(key.bucket_start)
                .bind(fold.power)
                .bind(fold.ts)
                .bind(fold.imported)
                .bind(fold.exported)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn upsert_charge(
        &self,
        fold_id: &str,
        keys: &[BucketKey],
        fold: &ChargeFold,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        if !claim_fold(&mut tx, fold_id).await? {
            return Ok(false);
        }
        for key in keys {
            let sql = extrema_upsert_sql(key.resolution.table(), CHARGE_PREFIX, false);
            sqlx::query(&sql)
                .bind(&key.location)
                .bind(key.bucket_start)
                .bind(fold.percent_charged)
                .bind(fold.ts)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn buckets(
        &self,
        location: &str,
        resolution: Resolution,
        window: &BucketWindow,
    ) -> Result<Vec<Bucket>, StoreError> {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT ");
        builder.push(bucket_columns());
        builder.push(format_args!(" FROM {} WHERE location = ", resolution.table()));
        builder.push_bind(location);

        match window {
            BucketWindow::Latest { .. } => {
                builder.push(" ORDER BY bucket_start DESC");
            }
            BucketWindow::Range { begin, end, .. } => {
                builder.push(" AND bucket_start >= ");
                builder.push_bind(*begin);
                builder.push(" AND bucket_start <= ");
                builder.push_bind(*end);
                builder.push(" ORDER BY bucket_start ASC");
            }
        }
        if let Some(limit) = window.limit() {
            builder.push(" LIMIT ");
            builder.push_bind(i64::from(limit));
        }

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| bucket_from_row(row, resolution).map_err(StoreError::from))
            .collect()
    }
}

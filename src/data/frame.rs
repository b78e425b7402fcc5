//! Canonical frame schemas and the shared read / merge / write primitives
//! used by both storage backends.
//!
//! All timestamps are UTC-naïve `Datetime[ms]`. Merges concatenate the
//! existing and incoming frames, deduplicate on the primary key keeping the
//! later row (new wins on collision), and sort ascending. Writes go through
//! a sibling temp file plus rename so readers always observe a complete file.

use std::fs::File;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::NaiveDateTime;
use polars::prelude::*;

pub const TIMESTAMP_COL: &str = "timestamp";
pub const BAR_PRICE_COLS: &[&str] = &["open", "high", "low", "close"];
pub const BAR_OPTIONAL_COLS: &[&str] = &["dividends", "splits"];

pub const TRADE_TIME_COL: &str = "trade_time";
/// Deduplication key for raw trade rows.
pub const TRADE_KEY_COLS: &[&str] = &["trans_id", "tick_id"];

fn timestamp_dtype() -> DataType {
    DataType::Datetime(TimeUnit::Milliseconds, None)
}

pub fn bar_schema() -> Schema {
    let mut fields = vec![Field::new(TIMESTAMP_COL.into(), timestamp_dtype())];
    for name in BAR_PRICE_COLS {
        fields.push(Field::new((*name).into(), DataType::Float64));
    }
    fields.push(Field::new("volume".into(), DataType::Float64));
    for name in BAR_OPTIONAL_COLS {
        fields.push(Field::new((*name).into(), DataType::Float64));
    }
    Schema::from_iter(fields)
}

pub fn trade_schema() -> Schema {
    Schema::from_iter([
        Field::new(TRADE_TIME_COL.into(), timestamp_dtype()),
        Field::new("distribution_time".into(), timestamp_dtype()),
        Field::new("venue".into(), DataType::String),
        Field::new("isin".into(), DataType::String),
        Field::new("price".into(), DataType::Float64),
        Field::new("volume".into(), DataType::Float64),
        Field::new("trans_id".into(), DataType::Int64),
        Field::new("tick_id".into(), DataType::Int64),
    ])
}

pub fn empty_bar_frame() -> DataFrame {
    DataFrame::empty_with_schema(&bar_schema())
}

pub fn empty_trade_frame() -> DataFrame {
    DataFrame::empty_with_schema(&trade_schema())
}

/// Build a bar frame from parallel component vectors (epoch milliseconds for
/// the timestamps). Dividend/split vectors may be empty, in which case the
/// columns are zero-filled.
pub fn bars_from_components(
    ts_ms: Vec<i64>,
    open: Vec<f64>,
    high: Vec<f64>,
    low: Vec<f64>,
    close: Vec<f64>,
    volume: Vec<f64>,
    dividends: Vec<f64>,
    splits: Vec<f64>,
) -> Result<DataFrame> {
    let n = ts_ms.len();
    let zeros = |v: Vec<f64>| if v.is_empty() { vec![0.0; n] } else { v };
    let ts = Column::new(TIMESTAMP_COL.into(), ts_ms).cast(&timestamp_dtype())?;
    let df = DataFrame::new(
        n,
        vec![
            ts,
            Column::new("open".into(), open),
            Column::new("high".into(), high),
            Column::new("low".into(), low),
            Column::new("close".into(), close),
            Column::new("volume".into(), volume),
            Column::new("dividends".into(), zeros(dividends)),
            Column::new("splits".into(), zeros(splits)),
        ],
    )
    .context("Failed to assemble bar frame")?;
    normalize_bars(df)
}

/// Enforce the canonical bar schema on a provider or on-disk frame:
/// lowercase column names, UTC-naïve millisecond timestamps, Float64 values,
/// deterministic column order, unique ascending timestamps.
pub fn normalize_bars(df: DataFrame) -> Result<DataFrame> {
    let mut df = lowercase_columns(df)?;

    let ts_source = ["timestamp", "datetime", "date"]
        .into_iter()
        .find(|c| df.schema().contains(c));
    let Some(ts_source) = ts_source else {
        bail!("bar frame has no timestamp column");
    };
    if ts_source != TIMESTAMP_COL {
        df.rename(ts_source, TIMESTAMP_COL.into())?;
    }
    df = cast_timestamp(df, TIMESTAMP_COL)?;

    let schema = df.schema().clone();
    for required in ["open", "high", "low", "close", "volume"] {
        if !schema.contains(required) {
            bail!("bar frame missing required column: {required}");
        }
    }

    let mut lf = df.lazy();
    for name in BAR_OPTIONAL_COLS {
        if !schema.contains(name) {
            lf = lf.with_column(lit(0.0f64).alias(*name));
        }
    }
    let numeric: Vec<Expr> = ["open", "high", "low", "close", "volume"]
        .into_iter()
        .chain(BAR_OPTIONAL_COLS.iter().copied())
        .map(|c| col(c).cast(DataType::Float64).alias(c))
        .collect();
    let ordered: Vec<Expr> = std::iter::once(TIMESTAMP_COL)
        .chain(["open", "high", "low", "close", "volume"])
        .chain(BAR_OPTIONAL_COLS.iter().copied())
        .map(col)
        .collect();
    let df = lf.with_columns(numeric).select(ordered).collect()?;

    dedup_sorted(df, &[TIMESTAMP_COL], TIMESTAMP_COL)
}

/// Enforce the canonical trade schema; dedups on `(trans_id, tick_id)`.
pub fn normalize_trades(df: DataFrame) -> Result<DataFrame> {
    let mut df = lowercase_columns(df)?;
    for required in [
        TRADE_TIME_COL,
        "distribution_time",
        "venue",
        "isin",
        "price",
        "volume",
        "trans_id",
        "tick_id",
    ] {
        if !df.schema().contains(required) {
            bail!("trade frame missing required column: {required}");
        }
    }
    df = cast_timestamp(df, TRADE_TIME_COL)?;
    df = cast_timestamp(df, "distribution_time")?;
    let df = df
        .lazy()
        .with_columns([
            col("price").cast(DataType::Float64),
            col("volume").cast(DataType::Float64),
            col("trans_id").cast(DataType::Int64),
            col("tick_id").cast(DataType::Int64),
        ])
        .select([
            col(TRADE_TIME_COL),
            col("distribution_time"),
            col("venue"),
            col("isin"),
            col("price"),
            col("volume"),
            col("trans_id"),
            col("tick_id"),
        ])
        .collect()?;
    dedup_sorted(df, TRADE_KEY_COLS, TRADE_TIME_COL)
}

fn lowercase_columns(mut df: DataFrame) -> Result<DataFrame> {
    let renames: Vec<(String, String)> = df
        .get_column_names()
        .iter()
        .filter(|name| name.as_str() != name.to_lowercase())
        .map(|name| (name.to_string(), name.to_lowercase()))
        .collect();
    for (from, to) in renames {
        df.rename(&from, to.into())?;
    }
    Ok(df)
}

fn cast_timestamp(df: DataFrame, name: &str) -> Result<DataFrame> {
    let dtype = df.column(name)?.dtype().clone();
    let casted = match dtype {
        DataType::Datetime(TimeUnit::Milliseconds, None) => df,
        DataType::Datetime(_, _) | DataType::Date | DataType::Int64 => df
            .lazy()
            .with_column(col(name).cast(timestamp_dtype()).alias(name))
            .collect()?,
        DataType::String => df
            .lazy()
            .with_column(
                col(name)
                    .cast(DataType::Date)
                    .cast(timestamp_dtype())
                    .alias(name),
            )
            .collect()?,
        other => bail!("column {name} has unsupported timestamp dtype: {other:?}"),
    };
    Ok(casted)
}

/// Concat + dedup-keep-last + sort. The later frame's rows win on key
/// collision because they appear after the existing rows in the concat.
pub fn merge_frames(
    existing: DataFrame,
    new: DataFrame,
    keys: &[&str],
    sort_col: &str,
) -> Result<DataFrame> {
    let merged = if existing.height() == 0 {
        new
    } else if new.height() == 0 {
        existing
    } else {
        concat(
            [existing.lazy(), new.lazy()],
            UnionArgs {
                rechunk: true,
                to_supertypes: true,
                diagonal: true,
                ..Default::default()
            },
        )?
        .collect()?
    };
    dedup_sorted(merged, keys, sort_col)
}

fn dedup_sorted(df: DataFrame, keys: &[&str], sort_col: &str) -> Result<DataFrame> {
    let key_cols: Vec<String> = keys.iter().map(|k| (*k).to_string()).collect();
    let deduped = df.unique::<String, String>(Some(&key_cols), UniqueKeepStrategy::Last, None)?;
    let sorted = deduped
        .lazy()
        .sort([sort_col], SortMultipleOptions::default())
        .collect()?;
    Ok(sorted)
}

/// Read a columnar file; a parse failure deletes the file and returns an
/// empty frame with the given schema. Missing files are also empty.
pub fn read_parquet_or_recover(path: &Path, schema: &Schema) -> DataFrame {
    if !path.exists() {
        return DataFrame::empty_with_schema(schema);
    }
    let read = File::open(path)
        .context("Failed to open parquet file")
        .and_then(|file| {
            ParquetReader::new(file)
                .finish()
                .context("Failed to read parquet file")
        });
    match read {
        Ok(df) => df,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                %err,
                "Corrupt columnar file, deleting and treating as empty"
            );
            if let Err(rm_err) = std::fs::remove_file(path) {
                tracing::warn!(path = %path.display(), %rm_err, "Failed to delete corrupt file");
            }
            DataFrame::empty_with_schema(schema)
        }
    }
}

/// Write a frame via temp file + flush + rename in the target directory.
pub fn write_parquet_atomic(df: &mut DataFrame, path: &Path) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("No parent directory for {}", path.display()))?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create dir: {}", parent.display()))?;

    let tmp_path = path.with_extension("parquet.tmp");
    let file = File::create(&tmp_path)
        .with_context(|| format!("Failed to create temp file: {}", tmp_path.display()))?;
    ParquetWriter::new(file)
        .finish(df)
        .context("Failed to write parquet")?;
    // The writer consumed the handle; reopen to flush file contents to disk
    // before the rename commits them.
    File::open(&tmp_path)
        .and_then(|f| f.sync_all())
        .with_context(|| format!("Failed to flush {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path).with_context(|| {
        format!("Failed to rename {} → {}", tmp_path.display(), path.display())
    })?;
    #[cfg(unix)]
    {
        let _ = File::open(parent).and_then(|d| d.sync_all());
    }
    Ok(())
}

/// Largest timestamp in the column, if any rows are present.
pub fn max_timestamp(df: &DataFrame, name: &str) -> Result<Option<NaiveDateTime>> {
    if df.height() == 0 {
        return Ok(None);
    }
    let ms = df.column(name)?.cast(&DataType::Int64)?;
    Ok(ms
        .i64()?
        .max()
        .and_then(|v| chrono::DateTime::from_timestamp_millis(v).map(|dt| dt.naive_utc())))
}

pub fn to_epoch_ms(ts: NaiveDateTime) -> i64 {
    ts.and_utc().timestamp_millis()
}

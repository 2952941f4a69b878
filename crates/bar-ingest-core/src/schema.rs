use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{ArrayRef, Int64Array, StringArray, TimestampMicrosecondArray};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::DateTime;
use chrono_tz::Tz;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;

use crate::candle::Candle;
use crate::error::StoreError;

/// Arrow schema of a series file. The timestamp column is annotated with the
/// canonical timezone so external readers see wall-clock times.
pub fn candle_schema(tz: Tz) -> Schema {
    Schema::new(vec![
        Field::new(
            "timestamp",
            DataType::Timestamp(TimeUnit::Microsecond, Some(tz.name().into())),
            false,
        ),
        Field::new("open", DataType::Utf8, false),
        Field::new("high", DataType::Utf8, false),
        Field::new("low", DataType::Utf8, false),
        Field::new("close", DataType::Utf8, false),
        Field::new("volume", DataType::Int64, false),
    ])
}

pub fn candles_to_record_batch(candles: &[Candle], tz: Tz) -> Result<RecordBatch, StoreError> {
    let schema = Arc::new(candle_schema(tz));

    let timestamps: Vec<i64> = candles.iter().map(Candle::key).collect();
    let opens: Vec<String> = candles.iter().map(|c| c.open.to_string()).collect();
    let highs: Vec<String> = candles.iter().map(|c| c.high.to_string()).collect();
    let lows: Vec<String> = candles.iter().map(|c| c.low.to_string()).collect();
    let closes: Vec<String> = candles.iter().map(|c| c.close.to_string()).collect();
    let volumes: Vec<i64> = candles.iter().map(|c| c.volume).collect();

    let columns: Vec<ArrayRef> = vec![
        Arc::new(TimestampMicrosecondArray::from(timestamps).with_timezone(tz.name())),
        Arc::new(StringArray::from_iter_values(opens)),
        Arc::new(StringArray::from_iter_values(highs)),
        Arc::new(StringArray::from_iter_values(lows)),
        Arc::new(StringArray::from_iter_values(closes)),
        Arc::new(Int64Array::from(volumes)),
    ];

    Ok(RecordBatch::try_new(schema, columns)?)
}

fn string_column<'a>(
    batch: &'a RecordBatch,
    index: usize,
    name: &str,
) -> Result<&'a StringArray, StoreError> {
    batch
        .column(index)
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| StoreError::InvalidData(format!("expected {name} column")))
}

/// Decode a batch, placing every timestamp in `tz`.
pub fn record_batch_to_candles(batch: &RecordBatch, tz: Tz) -> Result<Vec<Candle>, StoreError> {
    if batch.num_columns() != 6 {
        return Err(StoreError::InvalidData(format!(
            "expected 6 columns, found {}",
            batch.num_columns()
        )));
    }

    let timestamps = batch
        .column(0)
        .as_any()
        .downcast_ref::<TimestampMicrosecondArray>()
        .ok_or_else(|| StoreError::InvalidData("expected timestamp column".into()))?;
    let opens = string_column(batch, 1, "open")?;
    let highs = string_column(batch, 2, "high")?;
    let lows = string_column(batch, 3, "low")?;
    let closes = string_column(batch, 4, "close")?;
    let volumes = batch
        .column(5)
        .as_any()
        .downcast_ref::<Int64Array>()
        .ok_or_else(|| StoreError::InvalidData("expected volume column".into()))?;

    let mut candles = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        let micros = timestamps.value(i);
        let timestamp = DateTime::from_timestamp_micros(micros)
            .ok_or_else(|| StoreError::InvalidData(format!("invalid timestamp: {micros}")))?
            .with_timezone(&tz);

        let open = opens
            .value(i)
            .parse()
            .map_err(|e| StoreError::InvalidData(format!("invalid open: {e}")))?;
        let high = highs
            .value(i)
            .parse()
            .map_err(|e| StoreError::InvalidData(format!("invalid high: {e}")))?;
        let low = lows
            .value(i)
            .parse()
            .map_err(|e| StoreError::InvalidData(format!("invalid low: {e}")))?;
        let close = closes
            .value(i)
            .parse()
            .map_err(|e| StoreError::InvalidData(format!("invalid close: {e}")))?;

        candles.push(Candle {
            timestamp,
            open,
            high,
            low,
            close,
            volume: volumes.value(i),
        });
    }

    Ok(candles)
}

/// Write candles to `path`, fsyncing before returning.
pub fn write_parquet(path: &Path, candles: &[Candle], tz: Tz) -> Result<(), StoreError> {
    let batch = candles_to_record_batch(candles, tz)?;

    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();

    let file = File::create(path)?;
    let sync_handle = file.try_clone()?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(&batch)?;
    writer.close()?;
    sync_handle.sync_all()?;

    Ok(())
}

pub fn read_parquet(path: &Path, tz: Tz) -> Result<Vec<Candle>, StoreError> {
    let file = File::open(path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let reader = builder.build()?;

    let mut all_candles = Vec::new();
    for batch in reader {
        let batch = batch?;
        let mut candles = record_batch_to_candles(&batch, tz)?;
        all_candles.append(&mut candles);
    }

    Ok(all_candles)
}

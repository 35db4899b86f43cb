//! K-way merge over ordered reading cursors.

use async_stream::try_stream;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

use super::ReadingStream;
use crate::reading::TelemetryReading;

/// Merge several timestamp-ascending cursors into one ascending stream.
///
/// Holds at most one buffered reading per cursor, so memory stays O(cursors)
/// no matter how large the underlying result sets are. Ties are broken by
/// cursor index, which keeps the merge deterministic.
pub(crate) fn merge_ordered(mut cursors: Vec<ReadingStream>) -> ReadingStream {
    Box::pin(try_stream! {
        let mut heads: Vec<Option<TelemetryReading>> = Vec::with_capacity(cursors.len());
        let mut heap: BinaryHeap<Reverse<(DateTime<Utc>, usize)>> = BinaryHeap::new();

        for (idx, cursor) in cursors.iter_mut().enumerate() {
            match cursor.next().await {
                Some(first) => {
                    let reading = first?;
                    heap.push(Reverse((reading.ts, idx)));
                    heads.push(Some(reading));
                }
                None => heads.push(None),
            }
        }

        while let Some(Reverse((_, idx))) = heap.pop() {
            let reading = heads[idx].take().expect("heap entry has a buffered head");
            yield reading;

            if let Some(next) = cursors[idx].next().await {
                let reading = next?;
                heap.push(Reverse((reading.ts, idx)));
                heads[idx] = Some(reading);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::{DeviceId, TelemetryValue};
    use crate::storage::StorageError;
    use chrono::TimeZone;
    use futures::TryStreamExt;

    fn reading(device: DeviceId, hour: u32) -> TelemetryReading {
        TelemetryReading::new(
            device,
            "temp",
            Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap(),
            TelemetryValue::Integer(hour as i64),
        )
    }

    fn cursor(readings: Vec<TelemetryReading>) -> ReadingStream {
        Box::pin(futures::stream::iter(
            readings.into_iter().map(Ok::<_, StorageError>),
        ))
    }

    #[tokio::test]
    async fn merges_in_timestamp_order() {
        let device = DeviceId::new();
        let merged = merge_ordered(vec![
            cursor(vec![reading(device, 1), reading(device, 4)]),
            cursor(vec![reading(device, 2), reading(device, 3), reading(device, 5)]),
        ]);
        let hours: Vec<u32> = merged
            .try_collect::<Vec<_>>()
            .await
            .unwrap()
            .iter()
            .map(|r| match r.value {
                TelemetryValue::Integer(h) => h as u32,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(hours, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn empty_cursors_are_skipped() {
        let device = DeviceId::new();
        let merged = merge_ordered(vec![
            cursor(vec![]),
            cursor(vec![reading(device, 2)]),
            cursor(vec![]),
        ]);
        let collected = merged.try_collect::<Vec<_>>().await.unwrap();
        assert_eq!(collected.len(), 1);
    }

    #[tokio::test]
    async fn no_cursors_yields_empty_stream() {
        let merged = merge_ordered(vec![]);
        assert!(merged.try_collect::<Vec<_>>().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cursor_errors_propagate() {
        let device = DeviceId::new();
        let failing: ReadingStream = Box::pin(futures::stream::iter(vec![
            Ok(reading(device, 1)),
            Err(StorageError::Backend("cursor lost".into())),
        ]));
        let merged = merge_ordered(vec![failing]);
        let result = merged.try_collect::<Vec<_>>().await;
        assert!(result.is_err());
    }
}

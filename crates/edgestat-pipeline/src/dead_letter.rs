//! Dead-letter sink for deliveries that exhausted their retries
//!
//! Each dead-lettered group becomes one NDJSON blob under `dead-letter/`,
//! one record per delivery, for manual inspection and replay.

use edgestat_core::time::now_ms;
use edgestat_storage::{BlobStore, StorageError};
use serde::Serialize;

use crate::queue::Delivery;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeadLetterRecord<'a> {
    delivery_id: u64,
    attempts: u32,
    reason: &'a str,
    failed_at: i64,
    /// Original body: parsed JSON when it is JSON, raw text otherwise
    body: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct DeadLetterSink {
    blobs: BlobStore,
}

impl DeadLetterSink {
    pub fn new(blobs: BlobStore) -> Self {
        Self { blobs }
    }

    /// Write `deliveries` to a fresh dead-letter blob. Returns its path.
    pub async fn write(
        &self,
        deliveries: &[Delivery],
        reason: &str,
    ) -> Result<String, StorageError> {
        let failed_at = now_ms();
        let path = self.blobs.key(&format!(
            "dead-letter/{}-{}.ndjson",
            failed_at,
            uuid::Uuid::new_v4()
        ));

        let mut data = Vec::new();
        for delivery in deliveries {
            let body = serde_json::from_slice(&delivery.body).unwrap_or_else(|_| {
                serde_json::Value::String(String::from_utf8_lossy(&delivery.body).into_owned())
            });
            let record = DeadLetterRecord {
                delivery_id: delivery.id,
                attempts: delivery.attempts,
                reason,
                failed_at,
                body,
            };
            serde_json::to_writer(&mut data, &record)?;
            data.push(b'\n');
        }

        self.blobs.write(&path, data).await?;
        Ok(path)
    }
}

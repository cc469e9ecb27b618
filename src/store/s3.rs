use std::io::Write;

use async_trait::async_trait;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use flate2::Compression;
use flate2::write::GzEncoder;
use tracing::{debug, info, warn};

use super::csv_dir::encode_csv;
use super::{StoreError, TableStore, TableWrite};
use crate::schema::TableSchema;

/// Tables as immutable CSV objects in a bucket, one object per table per
/// append, under Hive-style `table=`/`partition=` prefixes. Each object
/// carries its own header so partitions can be read independently.
pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
    gzip: bool,
}

impl S3Store {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>, prefix: &str, gzip: bool) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: prefix.trim_matches('/').to_string(),
            gzip,
        }
    }

    /// Builds a store from the ambient AWS configuration (env vars,
    /// instance profile, ...).
    pub async fn from_env(bucket: impl Into<String>, prefix: &str, gzip: bool) -> Self {
        let config = aws_config::load_from_env().await;
        Self::new(aws_sdk_s3::Client::new(&config), bucket, prefix, gzip)
    }

    pub fn schema_key(&self, table: &str) -> String {
        self.key(&format!("table={table}/_schema.json"))
    }

    pub fn object_key(&self, table: &str, partition: Option<&str>, object_id: &str) -> String {
        let ext = if self.gzip { "csv.gz" } else { "csv" };
        match partition {
            Some(p) => self.key(&format!("table={table}/partition={p}/part-{object_id}.{ext}")),
            None => self.key(&format!("table={table}/part-{object_id}.{ext}")),
        }
    }

    fn key(&self, rest: &str) -> String {
        if self.prefix.is_empty() {
            rest.to_string()
        } else {
            format!("{}/{rest}", self.prefix)
        }
    }

    async fn read_schema(&self, table: &str) -> Result<Option<TableSchema>, StoreError> {
        let key = self.schema_key(table);
        match self.client.get_object().bucket(&self.bucket).key(&key).send().await {
            Ok(out) => {
                let bytes = out
                    .body
                    .collect()
                    .await
                    .map_err(|e| StoreError::Remote(e.to_string()))?
                    .into_bytes();
                Ok(Some(serde_json::from_slice(&bytes)?))
            }
            Err(err) if err.as_service_error().is_some_and(|e| e.is_no_such_key()) => Ok(None),
            Err(err) => Err(StoreError::Remote(format!("{}", DisplayErrorContext(&err)))),
        }
    }

    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), StoreError> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type);
        if self.gzip && key.ends_with(".gz") {
            request = request.content_encoding("gzip");
        }
        request
            .send()
            .await
            .map_err(|e| StoreError::Remote(format!("{}", DisplayErrorContext(&e))))?;
        Ok(())
    }

    /// Deletes objects uploaded earlier in a failed append.
    async fn rollback(&self, keys: &[String]) {
        for key in keys {
            match self
                .client
                .delete_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
            {
                Ok(_) => debug!(bucket = %self.bucket, key = %key, "Rolled back upload"),
                Err(e) => warn!(
                    bucket = %self.bucket,
                    key = %key,
                    error = %DisplayErrorContext(&e),
                    "Failed to roll back upload"
                ),
            }
        }
    }
}

fn gzip(bytes: &[u8]) -> Result<Vec<u8>, StoreError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

#[async_trait]
impl TableStore for S3Store {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn ensure_schema(&self, schema: &TableSchema) -> Result<(), StoreError> {
        match self.read_schema(&schema.name).await? {
            Some(existing) => {
                let found: Vec<_> = existing
                    .columns
                    .iter()
                    .map(|c| (c.name.clone(), c.ty))
                    .collect();
                if schema.same_layout(&found) {
                    Ok(())
                } else {
                    Err(StoreError::SchemaConflict {
                        table: schema.name.clone(),
                        expected: schema.describe(),
                        found: existing.describe(),
                    })
                }
            }
            None => {
                let key = self.schema_key(&schema.name);
                self.put(&key, serde_json::to_vec_pretty(schema)?, "application/json")
                    .await?;
                info!(bucket = %self.bucket, key = %key, "Created table schema object");
                Ok(())
            }
        }
    }

    async fn append(&self, writes: &[TableWrite<'_>]) -> Result<u64, StoreError> {
        let pending: Vec<_> = writes.iter().filter(|w| !w.batch.is_empty()).collect();

        let mut checked: Vec<&str> = Vec::new();
        for write in &pending {
            let table = write.schema.name.as_str();
            if checked.contains(&table) {
                continue;
            }
            if self.read_schema(table).await?.is_none() {
                return Err(StoreError::MissingTable(table.to_string()));
            }
            checked.push(table);
        }

        let mut staged = Vec::with_capacity(pending.len());
        for write in pending {
            let csv = encode_csv(write.batch, true)?;
            let body = if self.gzip { gzip(&csv)? } else { csv };
            let partition = write.partition.map(ToString::to_string);
            let key = self.object_key(
                &write.schema.name,
                partition.as_deref(),
                &uuid::Uuid::new_v4().to_string(),
            );
            staged.push((key, body, write.batch.len() as u64));
        }

        let mut uploaded: Vec<String> = Vec::with_capacity(staged.len());
        let mut written = 0;
        for (key, body, rows) in staged {
            debug!(bucket = %self.bucket, key = %key, rows, "Uploading table object");
            if let Err(e) = self.put(&key, body, "text/csv").await {
                self.rollback(&uploaded).await;
                return Err(e);
            }
            uploaded.push(key);
            written += rows;
        }
        Ok(written)
    }
}

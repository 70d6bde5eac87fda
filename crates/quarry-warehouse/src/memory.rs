//! In-memory warehouse
//!
//! A complete, in-process [`WarehouseClient`] used for local runs and tests.
//!
//! ## How It Works
//!
//! 1. Tables are registered with an Avro record schema and their rows
//! 2. Query texts are mapped to a result table (or to a failure)
//! 3. A submitted job reports `done` after a configurable number of polls
//! 4. A read session splits the result rows round-robin across partitions,
//!    so rows keep their relative order inside each partition
//! 5. Each partition is served as Avro-encoded blocks of `rows_per_block` rows
//!
//! Faults can be injected per partition index to exercise failure paths.

use std::collections::HashMap;
use std::sync::Arc;

use apache_avro::types::Value;
use apache_avro::{to_avro_datum, Schema};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tracing::debug;

use crate::client::{PartitionStream, WarehouseClient};
use crate::error::{Result, WarehouseError};
use crate::types::{
    ErrorEntry, JobHandle, JobStatistics, PartitionHandle, QueryRequest, ReadSession,
    RemoteJobStatus, RowBlock, TableMetadata, TableRef,
};

const RESULTS_DATASET: &str = "_results";

/// A table held by the in-memory warehouse.
#[derive(Debug, Clone)]
pub struct MemoryTable {
    schema_json: String,
    schema: Schema,
    rows: Vec<Value>,
}

impl MemoryTable {
    /// Build a table from an Avro record schema and JSON objects.
    ///
    /// Each object is resolved against the schema, so JSON integers fill
    /// `int` columns and `null` fills nullable unions.
    pub fn new(schema_json: &str, rows: Vec<serde_json::Value>) -> Result<Self> {
        let schema = Schema::parse_str(schema_json)
            .map_err(|e| WarehouseError::Schema(format!("invalid Avro schema: {}", e)))?;
        let rows = rows
            .into_iter()
            .map(|row| {
                Value::from(row)
                    .resolve(&schema)
                    .map_err(|e| WarehouseError::Schema(format!("row does not match schema: {}", e)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            schema_json: schema_json.to_string(),
            schema,
            rows,
        })
    }

    /// Build a table of nullable string columns.
    ///
    /// Column names are sanitized into valid Avro names.
    pub fn from_string_columns(columns: &[String], rows: Vec<Vec<Option<String>>>) -> Result<Self> {
        let names: Vec<String> = columns.iter().map(|c| avro_name(c)).collect();
        let fields: Vec<serde_json::Value> = names
            .iter()
            .map(|name| serde_json::json!({"name": name, "type": ["null", "string"]}))
            .collect();
        let schema_json = serde_json::json!({
            "type": "record",
            "name": "Row",
            "fields": fields,
        })
        .to_string();
        let schema = Schema::parse_str(&schema_json)
            .map_err(|e| WarehouseError::Schema(format!("invalid column set: {}", e)))?;

        let rows = rows
            .into_iter()
            .map(|cells| {
                if cells.len() != names.len() {
                    return Err(WarehouseError::Schema(format!(
                        "row has {} cells, expected {}",
                        cells.len(),
                        names.len()
                    )));
                }
                let fields = names
                    .iter()
                    .cloned()
                    .zip(cells)
                    .map(|(name, cell)| {
                        let value = match cell {
                            Some(s) => Value::Union(1, Box::new(Value::String(s))),
                            None => Value::Union(0, Box::new(Value::Null)),
                        };
                        (name, value)
                    })
                    .collect();
                Ok(Value::Record(fields))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            schema_json,
            schema,
            rows,
        })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn encode_row(&self, row: &Value) -> Result<Vec<u8>> {
        Ok(to_avro_datum(&self.schema, row.clone())?)
    }

    fn encoded_size(&self) -> Result<u64> {
        let mut total = 0u64;
        for row in &self.rows {
            total += self.encode_row(row)?.len() as u64;
        }
        Ok(total)
    }
}

/// Turn an arbitrary column label into a valid Avro field name.
fn avro_name(label: &str) -> String {
    let mut name: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert(0, '_');
    }
    name
}

/// Fault injected into one partition, applied after its first block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionFault {
    /// The stream fails with a transport error.
    Transport(String),
    /// The stream yields a block with bytes left over after its announced rows.
    CorruptBlock,
    /// The stream yields a block announcing rows without a payload.
    MissingPayload,
    /// The stream never yields again.
    Stall,
}

#[derive(Debug, Clone)]
enum QueryPlan {
    Table(String),
    Fail(Vec<ErrorEntry>),
    Reject(String),
}

#[derive(Debug)]
struct MemoryJob {
    plan: QueryPlan,
    polls_remaining: u32,
}

#[derive(Debug)]
struct PartitionData {
    blocks: Vec<RowBlock>,
    fault: Option<PartitionFault>,
}

/// Record of one `create_read_session` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub table: TableRef,
    pub max_partitions: u32,
    pub granted: usize,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<String, Arc<MemoryTable>>,
    queries: HashMap<String, QueryPlan>,
    jobs: HashMap<String, MemoryJob>,
    partitions: HashMap<String, PartitionData>,
    faults: HashMap<usize, PartitionFault>,
    submitted: Vec<QueryRequest>,
    session_requests: Vec<SessionRequest>,
    next_job: u64,
    next_session: u64,
}

/// In-process warehouse.
#[derive(Debug)]
pub struct InMemoryWarehouse {
    project_id: String,
    polls_until_done: u32,
    available_partitions: u32,
    rows_per_block: usize,
    state: Mutex<State>,
}

impl InMemoryWarehouse {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            polls_until_done: 1,
            available_partitions: 4,
            rows_per_block: 100,
            state: Mutex::new(State::default()),
        }
    }

    /// Number of status fetches before a job reports `done` (minimum 1).
    pub fn with_polls_until_done(mut self, polls: u32) -> Self {
        self.polls_until_done = polls.max(1);
        self
    }

    /// Upper bound on partitions granted per session (minimum 1).
    pub fn with_available_partitions(mut self, partitions: u32) -> Self {
        self.available_partitions = partitions.max(1);
        self
    }

    /// Rows per encoded block (minimum 1).
    pub fn with_rows_per_block(mut self, rows: usize) -> Self {
        self.rows_per_block = rows.max(1);
        self
    }

    pub fn register_table(&self, table_id: impl Into<String>, table: MemoryTable) {
        self.state.lock().tables.insert(table_id.into(), Arc::new(table));
    }

    /// Answer `query` with the rows of a registered table.
    pub fn on_query(&self, query: impl Into<String>, table_id: impl Into<String>) {
        self.state
            .lock()
            .queries
            .insert(query.into().trim().to_string(), QueryPlan::Table(table_id.into()));
    }

    /// Let `query` run, then finish with the given reported errors.
    pub fn fail_query(&self, query: impl Into<String>, errors: Vec<ErrorEntry>) {
        self.state
            .lock()
            .queries
            .insert(query.into().trim().to_string(), QueryPlan::Fail(errors));
    }

    /// Refuse `query` at submission.
    pub fn reject_query(&self, query: impl Into<String>, message: impl Into<String>) {
        self.state
            .lock()
            .queries
            .insert(query.into().trim().to_string(), QueryPlan::Reject(message.into()));
    }

    /// Inject a fault into partition `index` of every later session.
    pub fn inject_fault(&self, index: usize, fault: PartitionFault) {
        self.state.lock().faults.insert(index, fault);
    }

    pub fn submitted_queries(&self) -> Vec<QueryRequest> {
        self.state.lock().submitted.clone()
    }

    pub fn session_requests(&self) -> Vec<SessionRequest> {
        self.state.lock().session_requests.clone()
    }

    fn table(&self, table: &TableRef) -> Result<Arc<MemoryTable>> {
        self.state
            .lock()
            .tables
            .get(&table.table_id)
            .cloned()
            .ok_or_else(|| WarehouseError::NotFound(format!("table {}", table)))
    }

    /// Split rows round-robin over `count` partitions and encode them in blocks.
    fn partition_blocks(&self, table: &MemoryTable, count: usize) -> Result<Vec<Vec<RowBlock>>> {
        let mut per_partition: Vec<Vec<&Value>> = vec![Vec::new(); count];
        for (i, row) in table.rows.iter().enumerate() {
            per_partition[i % count].push(row);
        }

        per_partition
            .into_iter()
            .map(|rows| {
                rows.chunks(self.rows_per_block)
                    .map(|chunk| {
                        let mut payload = Vec::new();
                        for row in chunk {
                            payload.extend(table.encode_row(row)?);
                        }
                        Ok(RowBlock::new(chunk.len() as u64, payload))
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect()
    }
}

/// A copy of `model` with junk appended past its last datum, which no decoder
/// can consume exactly.
fn corrupt_block(model: Option<&Result<RowBlock>>) -> RowBlock {
    let (row_count, mut payload) = match model {
        Some(Ok(block)) => (
            block.row_count,
            block.payload.as_ref().map(|p| p.to_vec()).unwrap_or_default(),
        ),
        _ => (0, Vec::new()),
    };
    payload.extend_from_slice(&[0xff; 8]);
    RowBlock::new(row_count.max(1), payload)
}

#[async_trait]
impl WarehouseClient for InMemoryWarehouse {
    async fn submit_query(&self, request: &QueryRequest) -> Result<JobHandle> {
        let mut state = self.state.lock();
        state.submitted.push(request.clone());

        let plan = state
            .queries
            .get(request.query.trim())
            .cloned()
            .ok_or_else(|| WarehouseError::Api {
                message: "Unrecognized query".to_string(),
                errors: vec![ErrorEntry::new("invalidQuery", "Unrecognized query")],
            })?;
        if let QueryPlan::Reject(message) = plan {
            return Err(WarehouseError::Api {
                message: message.clone(),
                errors: vec![ErrorEntry::new("invalid", message)],
            });
        }

        state.next_job += 1;
        let job_id = format!("job_{}", state.next_job);
        state.jobs.insert(
            job_id.clone(),
            MemoryJob {
                plan,
                polls_remaining: self.polls_until_done,
            },
        );
        debug!(job_id = %job_id, "in-memory job submitted");

        Ok(JobHandle {
            project_id: request
                .project_id
                .clone()
                .unwrap_or_else(|| self.project_id.clone()),
            job_id,
        })
    }

    async fn get_job_status(&self, job: &JobHandle) -> Result<RemoteJobStatus> {
        let (plan, done) = {
            let mut state = self.state.lock();
            let entry = state
                .jobs
                .get_mut(&job.job_id)
                .ok_or_else(|| WarehouseError::NotFound(format!("job {}", job)))?;
            entry.polls_remaining = entry.polls_remaining.saturating_sub(1);
            (entry.plan.clone(), entry.polls_remaining == 0)
        };

        if !done {
            return Ok(RemoteJobStatus::default());
        }

        match plan {
            QueryPlan::Table(table_id) => {
                let destination = TableRef::new(&job.project_id, RESULTS_DATASET, table_id);
                let table = self.table(&destination)?;
                Ok(RemoteJobStatus {
                    done: true,
                    statistics: Some(JobStatistics {
                        total_bytes_processed: Some(table.encoded_size()?),
                    }),
                    destination_table: Some(destination),
                    ..Default::default()
                })
            }
            QueryPlan::Fail(errors) => Ok(RemoteJobStatus {
                done: true,
                error_result: errors.first().cloned(),
                errors,
                ..Default::default()
            }),
            QueryPlan::Reject(message) => Err(WarehouseError::Api {
                message,
                errors: Vec::new(),
            }),
        }
    }

    async fn get_table_metadata(&self, table: &TableRef) -> Result<TableMetadata> {
        let data = self.table(table)?;
        Ok(TableMetadata {
            num_rows: data.len() as u64,
            num_bytes: Some(data.encoded_size()?),
        })
    }

    async fn create_read_session(
        &self,
        table: &TableRef,
        max_partitions: u32,
    ) -> Result<ReadSession> {
        let data = self.table(table)?;

        let requested = if max_partitions == 0 {
            self.available_partitions
        } else {
            max_partitions.min(self.available_partitions)
        };
        let count = (requested as usize).min(data.len());
        let blocks = if count == 0 {
            Vec::new()
        } else {
            self.partition_blocks(&data, count)?
        };

        let mut state = self.state.lock();
        state.next_session += 1;
        let name = format!("sessions/{}", state.next_session);

        let mut partitions = Vec::with_capacity(count);
        for (index, blocks) in blocks.into_iter().enumerate() {
            let handle = PartitionHandle::new(format!("{}/streams/{}", name, index));
            let fault = state.faults.get(&index).cloned();
            state
                .partitions
                .insert(handle.name.clone(), PartitionData { blocks, fault });
            partitions.push(handle);
        }
        state.session_requests.push(SessionRequest {
            table: table.clone(),
            max_partitions,
            granted: partitions.len(),
        });

        Ok(ReadSession {
            name,
            table: table.clone(),
            avro_schema: data.schema_json.clone(),
            partitions,
        })
    }

    async fn open_partition_stream(&self, partition: &PartitionHandle) -> Result<PartitionStream> {
        let data = self
            .state
            .lock()
            .partitions
            .remove(&partition.name)
            .ok_or_else(|| WarehouseError::NotFound(format!("partition {}", partition)))?;

        let mut items: Vec<Result<RowBlock>> = data.blocks.into_iter().map(Ok).collect();
        let at = items.len().min(1);
        let stream = match data.fault {
            None => stream::iter(items).boxed(),
            Some(PartitionFault::Transport(message)) => {
                items.insert(at, Err(WarehouseError::Transport(message)));
                stream::iter(items).boxed()
            }
            Some(PartitionFault::CorruptBlock) => {
                items.insert(at, Ok(corrupt_block(items.first())));
                stream::iter(items).boxed()
            }
            Some(PartitionFault::MissingPayload) => {
                items.insert(
                    at,
                    Ok(RowBlock {
                        row_count: 1,
                        payload: None,
                    }),
                );
                stream::iter(items).boxed()
            }
            Some(PartitionFault::Stall) => {
                items.truncate(at);
                stream::iter(items).chain(stream::pending()).boxed()
            }
        };
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::RowDecoder;

    const SCHEMA: &str = r#"{
        "type": "record",
        "name": "Row",
        "fields": [
            {"name": "id", "type": "int"},
            {"name": "city", "type": ["null", "string"]}
        ]
    }"#;

    fn cities() -> MemoryTable {
        MemoryTable::new(
            SCHEMA,
            vec![
                serde_json::json!({"id": 1, "city": "Lisbon"}),
                serde_json::json!({"id": 2, "city": null}),
                serde_json::json!({"id": 3, "city": "Oslo"}),
            ],
        )
        .unwrap()
    }

    fn warehouse() -> InMemoryWarehouse {
        let warehouse = InMemoryWarehouse::new("proj")
            .with_available_partitions(2)
            .with_rows_per_block(1);
        warehouse.register_table("cities", cities());
        warehouse.on_query("SELECT * FROM cities", "cities");
        warehouse
    }

    async fn collect(warehouse: &InMemoryWarehouse, session: &ReadSession) -> Vec<Vec<String>> {
        let decoder = warehouse.row_decoder(session).unwrap();
        let mut rows = Vec::new();
        for partition in &session.partitions {
            let mut stream = warehouse.open_partition_stream(partition).await.unwrap();
            while let Some(block) = stream.next().await {
                let block = block.unwrap();
                rows.extend(
                    decoder
                        .decode_rows(block.payload.as_ref().unwrap(), block.row_count)
                        .unwrap(),
                );
            }
        }
        rows
    }

    #[test]
    fn test_avro_name_sanitizing() {
        assert_eq!(avro_name("user id"), "user_id");
        assert_eq!(avro_name("1st"), "_1st");
        assert_eq!(avro_name(""), "_");
        assert_eq!(avro_name("ok_name"), "ok_name");
    }

    #[test]
    fn test_string_columns_row_width_checked() {
        let err = MemoryTable::from_string_columns(
            &["a".to_string(), "b".to_string()],
            vec![vec![Some("x".to_string())]],
        )
        .unwrap_err();
        assert!(matches!(err, WarehouseError::Schema(_)));
    }

    #[test]
    fn test_json_rows_must_match_schema() {
        let err = MemoryTable::new(SCHEMA, vec![serde_json::json!({"id": "nope", "city": null})])
            .unwrap_err();
        assert!(matches!(err, WarehouseError::Schema(_)));
    }

    #[tokio::test]
    async fn test_job_completes_after_configured_polls() {
        let warehouse = warehouse().with_polls_until_done(3);
        let job = warehouse
            .submit_query(&QueryRequest::new("SELECT * FROM cities"))
            .await
            .unwrap();
        assert!(!warehouse.get_job_status(&job).await.unwrap().done);
        assert!(!warehouse.get_job_status(&job).await.unwrap().done);

        let status = warehouse.get_job_status(&job).await.unwrap();
        assert!(status.done);
        assert!(!status.failed());
        assert_eq!(status.destination_table.unwrap().table_id, "cities");
    }

    #[tokio::test]
    async fn test_unknown_query_rejected() {
        let warehouse = warehouse();
        let err = warehouse
            .submit_query(&QueryRequest::new("SELECT 42"))
            .await
            .unwrap_err();
        assert_eq!(err.reported_errors()[0].reason, "invalidQuery");
        assert_eq!(warehouse.submitted_queries().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_query_reports_errors() {
        let warehouse = warehouse();
        warehouse.fail_query("SELECT broken", vec![ErrorEntry::new("quota", "exceeded")]);

        let job = warehouse
            .submit_query(&QueryRequest::new("SELECT broken"))
            .await
            .unwrap();
        let status = warehouse.get_job_status(&job).await.unwrap();
        assert!(status.failed());
        assert_eq!(status.errors, vec![ErrorEntry::new("quota", "exceeded")]);
    }

    #[tokio::test]
    async fn test_read_session_splits_rows_round_robin() {
        let warehouse = warehouse();
        let table = TableRef::new("proj", RESULTS_DATASET, "cities");
        let session = warehouse.create_read_session(&table, 10).await.unwrap();
        assert_eq!(session.partitions.len(), 2);

        let rows = collect(&warehouse, &session).await;
        let ids: Vec<&str> = rows.iter().map(|r| r[0].as_str()).collect();
        assert_eq!(ids, vec!["1", "3", "2"]);

        let requests = warehouse.session_requests();
        assert_eq!(requests[0].max_partitions, 10);
        assert_eq!(requests[0].granted, 2);
    }

    #[tokio::test]
    async fn test_single_partition_keeps_order() {
        let warehouse = warehouse();
        let table = TableRef::new("proj", RESULTS_DATASET, "cities");
        let session = warehouse.create_read_session(&table, 1).await.unwrap();
        assert_eq!(session.partitions.len(), 1);

        let rows = collect(&warehouse, &session).await;
        assert_eq!(rows[0], vec!["1", "Lisbon"]);
        assert_eq!(rows[1], vec!["2", ""]);
        assert_eq!(rows[2], vec!["3", "Oslo"]);
    }

    #[tokio::test]
    async fn test_empty_table_has_no_partitions() {
        let warehouse = warehouse();
        warehouse.register_table("empty", MemoryTable::new(SCHEMA, vec![]).unwrap());
        let table = TableRef::new("proj", RESULTS_DATASET, "empty");
        let session = warehouse.create_read_session(&table, 10).await.unwrap();
        assert!(session.partitions.is_empty());
    }

    #[tokio::test]
    async fn test_partition_stream_opens_once() {
        let warehouse = warehouse();
        let table = TableRef::new("proj", RESULTS_DATASET, "cities");
        let session = warehouse.create_read_session(&table, 1).await.unwrap();
        let partition = &session.partitions[0];

        assert!(warehouse.open_partition_stream(partition).await.is_ok());
        let err = warehouse.open_partition_stream(partition).await.err().unwrap();
        assert!(matches!(err, WarehouseError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_transport_fault_after_first_block() {
        let warehouse = warehouse();
        warehouse.inject_fault(0, PartitionFault::Transport("connection reset".into()));
        let table = TableRef::new("proj", RESULTS_DATASET, "cities");
        let session = warehouse.create_read_session(&table, 1).await.unwrap();

        let mut stream = warehouse
            .open_partition_stream(&session.partitions[0])
            .await
            .unwrap();
        assert!(stream.next().await.unwrap().is_ok());
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, WarehouseError::Transport(_)));
    }

    #[tokio::test]
    async fn test_corrupt_block_never_decodes() {
        let warehouse = warehouse();
        warehouse.inject_fault(0, PartitionFault::CorruptBlock);
        let table = TableRef::new("proj", RESULTS_DATASET, "cities");
        let session = warehouse.create_read_session(&table, 1).await.unwrap();
        let decoder = warehouse.row_decoder(&session).unwrap();

        let mut stream = warehouse
            .open_partition_stream(&session.partitions[0])
            .await
            .unwrap();
        let good = stream.next().await.unwrap().unwrap();
        assert_eq!(
            decoder
                .decode_rows(good.payload.as_ref().unwrap(), good.row_count)
                .unwrap(),
            vec![vec!["1".to_string(), "Lisbon".to_string()]]
        );

        let bad = stream.next().await.unwrap().unwrap();
        let err = decoder
            .decode_rows(bad.payload.as_ref().unwrap(), bad.row_count)
            .unwrap_err();
        assert!(err.to_string().contains("trailing bytes"), "{}", err);
    }
}

// Vector store module
// Persistent nearest-neighbour index over chunk vectors, backed by LanceDB


use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{
    Array, FixedSizeListArray, Float32Array, Int64Array, RecordBatchIterator, StringArray,
    UInt32Array,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::Utc;
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase, Select};
use lancedb::{Connection, DistanceType, Table};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::chunking::Chunk;
use crate::config::Config;

const TABLE_NAME: &str = "chunks";

#[derive(Error, Debug)]
pub enum StoreError {
    /// The database directory could not be created or connected to
    #[error("Failed to open vector database: {0}")]
    Connection(String),

    #[error("Vector database error: {0}")]
    Database(String),

    /// Every vector in the store shares one dimension, fixed by the first upsert
    #[error("Vector dimension mismatch: store holds {expected}-dimensional vectors, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Invalid record: {0}")]
    InvalidRecord(String),
}

impl StoreError {
    /// Only a failed connection is worth retrying; everything else repeats deterministically
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

fn database_error(context: &'static str) -> impl FnOnce(lancedb::Error) -> StoreError {
    move |e| StoreError::Database(format!("{}: {}", context, e))
}

/// A chunk together with its embedding, the unit written to the store
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRecord {
    /// Text and metadata; `chunk.id` is the upsert key
    pub chunk: Chunk,
    /// Embedding of `chunk.embedding_text()`
    pub vector: Vec<f32>,
}

impl ChunkRecord {
    #[inline]
    pub fn new(chunk: Chunk, vector: Vec<f32>) -> Self {
        Self { chunk, vector }
    }
}

/// Metadata restriction for queries and bulk deletes; empty matches everything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
///
/// Set fields are combined with AND.
pub struct ChunkFilter {
    pub chapter: Option<u32>,
    /// Exact section label such as `"1.2"`
    pub section: Option<String>,
    pub document_id: Option<String>,
}

impl ChunkFilter {
    /// Records of a single chapter
    #[inline]
    pub fn chapter(chapter: u32) -> Self {
        Self {
            chapter: Some(chapter),
            ..Self::default()
        }
    }

    /// Records produced from one source document
    #[inline]
    pub fn document(document_id: impl Into<String>) -> Self {
        Self {
            document_id: Some(document_id.into()),
            ..Self::default()
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.chapter.is_none() && self.section.is_none() && self.document_id.is_none()
    }

    /// SQL predicate understood by LanceDB, `None` when the filter is empty
    fn predicate(&self) -> Option<String> {
        let mut clauses = Vec::new();
        if let Some(chapter) = self.chapter {
            clauses.push(format!("chapter = {}", chapter));
        }
        if let Some(section) = &self.section {
            clauses.push(format!("section = '{}'", escape_literal(section)));
        }
        if let Some(document_id) = &self.document_id {
            clauses.push(format!("document_id = '{}'", escape_literal(document_id)));
        }
        (!clauses.is_empty()).then(|| clauses.join(" AND "))
    }
}

fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

/// A query hit; `score` is `1 - cosine distance`, higher is closer
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    /// Chunk id, equal to `chunk.id`
    pub id: String,
    pub score: f32,
    pub chunk: Chunk,
    /// Insertion order, used to break score ties
    pub seq: i64,
}

/// Snapshot of the store contents, as shown by `status`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total_chunks: usize,
    /// Distinct chapter numbers, ascending
    pub chapters: Vec<u32>,
    /// Number of distinct section labels
    pub sections: usize,
    /// Distinct document ids, sorted
    pub documents: Vec<String>,
    /// Vector dimension, `None` until the first upsert
    pub dimension: Option<usize>,
}

#[derive(Default)]
struct StoreState {
    table: Option<Table>,
    dimension: Option<usize>,
    last_seq: i64,
}

/// Vector database store using LanceDB for similarity search
///
/// Queries share the read side of the lock; upserts, deletes and resets take
/// the write side, so a reset never overlaps an in-flight query.
pub struct VectorStore {
    connection: Connection,
    path: PathBuf,
    state: RwLock<StoreState>,
}

impl std::fmt::Debug for VectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl VectorStore {
    /// Open the store under the configured base directory
    #[inline]
    pub async fn new(config: &Config) -> Result<Self, StoreError> {
        Self::open(&config.vector_database_path()).await
    }

    /// Open (or create) a store at `path`
    #[inline]
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        debug!("Initializing LanceDB at path: {:?}", path);

        std::fs::create_dir_all(path).map_err(|e| {
            StoreError::Connection(format!(
                "Failed to create vector database directory: {}",
                e
            ))
        })?;

        let uri = format!("file://{}", path.display());
        let connection = lancedb::connect(&uri)
            .execute()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let table_names = connection
            .table_names()
            .execute()
            .await
            .map_err(database_error("Failed to list tables"))?;

        let mut state = StoreState::default();
        if table_names.iter().any(|name| name == TABLE_NAME) {
            let table = connection
                .open_table(TABLE_NAME)
                .execute()
                .await
                .map_err(database_error("Failed to open existing table"))?;
            let dimension = detect_vector_dimension(&table).await?;
            info!("Opened chunk table with {}-dimensional vectors", dimension);
            state.dimension = Some(dimension);
            state.table = Some(table);
        } else {
            debug!("No chunk table yet, it will be created on first upsert");
        }

        Ok(Self {
            connection,
            path: path.to_path_buf(),
            state: RwLock::new(state),
        })
    }

    /// Directory holding the LanceDB files
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Dimension of the stored vectors, `None` until the first upsert
    #[inline]
    pub async fn dimension(&self) -> Option<usize> {
        self.state.read().await.dimension
    }

    /// Insert or replace records by chunk id
    ///
    /// All vectors must share the store's dimension. Each record gets a fresh
    /// insertion sequence number, later than any assigned before.
    #[inline]
    pub async fn upsert(&self, records: &[ChunkRecord]) -> Result<(), StoreError> {
        let Some(first) = records.first() else {
            debug!("No records to upsert");
            return Ok(());
        };

        let dimension = first.vector.len();
        if dimension == 0 {
            return Err(StoreError::InvalidRecord(format!(
                "chunk {} has an empty vector",
                first.chunk.id
            )));
        }
        if let Some(record) = records.iter().find(|r| r.vector.len() != dimension) {
            return Err(StoreError::DimensionMismatch {
                expected: dimension,
                actual: record.vector.len(),
            });
        }

        let mut state = self.state.write().await;

        if let Some(expected) = state.dimension {
            if expected != dimension {
                return Err(StoreError::DimensionMismatch {
                    expected,
                    actual: dimension,
                });
            }
        }

        let first_seq = Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or(0)
            .max(state.last_seq + 1);
        let batch = create_record_batch(records, dimension, first_seq)?;
        state.last_seq = first_seq + i64::try_from(records.len()).unwrap_or(i64::MAX) - 1;

        if let Some(table) = &state.table {
            let schema = batch.schema();
            let reader = RecordBatchIterator::new(std::iter::once(Ok(batch)), schema);
            let mut merge = table.merge_insert(&["id"]);
            merge
                .when_matched_update_all(None)
                .when_not_matched_insert_all();
            merge
                .execute(Box::new(reader))
                .await
                .map_err(database_error("Failed to upsert chunks"))?;
        } else {
            info!("Creating chunk table with {} dimensions", dimension);
            let schema = batch.schema();
            let reader = RecordBatchIterator::new(std::iter::once(Ok(batch)), schema);
            let table = self
                .connection
                .create_table(TABLE_NAME, reader)
                .execute()
                .await
                .map_err(database_error("Failed to create chunk table"))?;
            state.table = Some(table);
            state.dimension = Some(dimension);
        }

        debug!("Upserted {} chunks", records.len());
        Ok(())
    }

    /// Delete records by id, returning how many existed
    #[inline]
    pub async fn delete(&self, ids: &[String]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let quoted: Vec<String> = ids
            .iter()
            .map(|id| format!("'{}'", escape_literal(id)))
            .collect();
        self.delete_where(format!("id IN ({})", quoted.join(", ")))
            .await
    }

    /// Delete every record matching `filter`; an empty filter deletes nothing
    #[inline]
    pub async fn delete_matching(&self, filter: &ChunkFilter) -> Result<usize, StoreError> {
        match filter.predicate() {
            Some(predicate) => self.delete_where(predicate).await,
            None => {
                warn!("Refusing to delete with an empty filter, use reset instead");
                Ok(0)
            }
        }
    }

    /// Delete the records of `document_id` whose ids are not in `keep`
    ///
    /// Used after re-ingesting a document to drop chunks the new version no
    /// longer produces.
    #[inline]
    pub async fn delete_document_except(
        &self,
        document_id: &str,
        keep: &[String],
    ) -> Result<usize, StoreError> {
        let mut predicate = format!("document_id = '{}'", escape_literal(document_id));
        if !keep.is_empty() {
            let quoted: Vec<String> = keep
                .iter()
                .map(|id| format!("'{}'", escape_literal(id)))
                .collect();
            predicate.push_str(&format!(" AND id NOT IN ({})", quoted.join(", ")));
        }
        self.delete_where(predicate).await
    }

    async fn delete_where(&self, predicate: String) -> Result<usize, StoreError> {
        let state = self.state.write().await;
        let Some(table) = &state.table else {
            return Ok(0);
        };

        let matching = table
            .count_rows(Some(predicate.clone()))
            .await
            .map_err(database_error("Failed to count rows to delete"))?;
        if matching == 0 {
            return Ok(0);
        }

        table
            .delete(&predicate)
            .await
            .map_err(database_error("Failed to delete chunks"))?;

        debug!("Deleted {} chunks where {}", matching, predicate);
        Ok(matching)
    }

    /// Drop every record; the next upsert starts a fresh table of any dimension
    #[inline]
    pub async fn reset(&self) -> Result<(), StoreError> {
        let mut state = self.state.write().await;

        if state.table.is_some() {
            info!("Dropping chunk table");
            self.connection
                .drop_table(TABLE_NAME)
                .await
                .map_err(database_error("Failed to drop table"))?;
        }
        state.table = None;
        state.dimension = None;

        Ok(())
    }

    /// Total number of stored chunks
    #[inline]
    pub async fn count(&self) -> Result<usize, StoreError> {
        self.count_matching(&ChunkFilter::default()).await
    }

    /// Number of stored chunks matching `filter`
    #[inline]
    pub async fn count_matching(&self, filter: &ChunkFilter) -> Result<usize, StoreError> {
        let state = self.state.read().await;
        match &state.table {
            Some(table) => table
                .count_rows(filter.predicate())
                .await
                .map_err(database_error("Failed to count rows")),
            None => Ok(0),
        }
    }

    /// The `k` records closest to `vector`, best first, ties in insertion order
    #[inline]
    pub async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &ChunkFilter,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        let state = self.state.read().await;
        let Some(table) = &state.table else {
            debug!("Query against empty store");
            return Ok(Vec::new());
        };
        if k == 0 {
            return Ok(Vec::new());
        }
        if let Some(expected) = state.dimension {
            if expected != vector.len() {
                return Err(StoreError::DimensionMismatch {
                    expected,
                    actual: vector.len(),
                });
            }
        }

        // Widen the search until the k-th score is not tied with anything
        // beyond the fetched rows, so ties resolve by insertion order
        let mut limit = k.saturating_mul(2);
        loop {
            let mut results = search(table, vector, limit, filter).await?;
            results.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.seq.cmp(&b.seq)));

            let exhausted = results.len() < limit;
            let tied_at_boundary = results.len() > k
                && results.last().map(|last| last.score) == Some(results[k - 1].score);
            if exhausted || !tied_at_boundary {
                results.truncate(k);
                debug!("Query returned {} chunks", results.len());
                return Ok(results);
            }

            debug!("Score tie at the top-{} boundary, widening search past {}", k, limit);
            limit = limit.saturating_mul(2);
        }
    }

    /// Summary of what the store holds
    #[inline]
    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        let state = self.state.read().await;
        let Some(table) = &state.table else {
            return Ok(StoreStats::default());
        };

        let total_chunks = table
            .count_rows(None)
            .await
            .map_err(database_error("Failed to count rows"))?;
        if total_chunks == 0 {
            return Ok(StoreStats {
                dimension: state.dimension,
                ..StoreStats::default()
            });
        }

        let mut stream = table
            .query()
            .select(Select::columns(&["chapter", "section", "document_id"]))
            .limit(total_chunks)
            .execute()
            .await
            .map_err(database_error("Failed to scan chunk metadata"))?;

        let mut chapters = BTreeSet::new();
        let mut sections = BTreeSet::new();
        let mut documents = BTreeSet::new();
        while let Some(batch) = stream
            .try_next()
            .await
            .map_err(database_error("Failed to read metadata stream"))?
        {
            let chapter_column = column::<UInt32Array>(&batch, "chapter")?;
            let section_column = column::<StringArray>(&batch, "section")?;
            let document_column = column::<StringArray>(&batch, "document_id")?;
            for row in 0..batch.num_rows() {
                chapters.insert(chapter_column.value(row));
                sections.insert(section_column.value(row).to_string());
                documents.insert(document_column.value(row).to_string());
            }
        }

        Ok(StoreStats {
            total_chunks,
            chapters: chapters.into_iter().collect(),
            sections: sections.len(),
            documents: documents.into_iter().collect(),
            dimension: state.dimension,
        })
    }
}

async fn search(
    table: &Table,
    vector: &[f32],
    limit: usize,
    filter: &ChunkFilter,
) -> Result<Vec<ScoredChunk>, StoreError> {
    let mut query = table
        .vector_search(vector)
        .map_err(database_error("Failed to create vector search"))?
        .column("vector")
        .distance_type(DistanceType::Cosine)
        .limit(limit);
    if let Some(predicate) = filter.predicate() {
        query = query.only_if(predicate);
    }

    let mut stream = query
        .execute()
        .await
        .map_err(database_error("Failed to execute search"))?;

    let mut results = Vec::new();
    while let Some(batch) = stream
        .try_next()
        .await
        .map_err(database_error("Failed to read result stream"))?
    {
        results.extend(parse_scored_batch(&batch)?);
    }
    Ok(results)
}

async fn detect_vector_dimension(table: &Table) -> Result<usize, StoreError> {
    let schema = table
        .schema()
        .await
        .map_err(database_error("Failed to get table schema"))?;

    schema
        .fields()
        .iter()
        .find(|field| field.name() == "vector")
        .and_then(|field| match field.data_type() {
            DataType::FixedSizeList(_, size) => usize::try_from(*size).ok(),
            _ => None,
        })
        .ok_or_else(|| {
            StoreError::Database("Could not find vector column or determine dimension".to_string())
        })
}

fn create_schema(dimension: usize) -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new(
            "vector",
            DataType::FixedSizeList(
                Arc::new(Field::new("item", DataType::Float32, true)),
                i32::try_from(dimension).unwrap_or(i32::MAX),
            ),
            false,
        ),
        Field::new("text", DataType::Utf8, false),
        Field::new("chapter", DataType::UInt32, false),
        Field::new("chapter_title", DataType::Utf8, false),
        Field::new("section", DataType::Utf8, false),
        Field::new("title", DataType::Utf8, false),
        Field::new("word_count", DataType::UInt32, false),
        Field::new("document_id", DataType::Utf8, false),
        Field::new("chunk_index", DataType::UInt32, false),
        Field::new("seq", DataType::Int64, false),
        Field::new("created_at", DataType::Utf8, false),
    ]))
}

fn to_u32(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

fn create_record_batch(
    records: &[ChunkRecord],
    dimension: usize,
    first_seq: i64,
) -> Result<RecordBatch, StoreError> {
    let created_at = Utc::now().to_rfc3339();

    let mut flat_values = Vec::with_capacity(records.len() * dimension);
    for record in records {
        flat_values.extend_from_slice(&record.vector);
    }
    let field = Arc::new(Field::new("item", DataType::Float32, true));
    let vector_array = FixedSizeListArray::try_new(
        field,
        i32::try_from(dimension).unwrap_or(i32::MAX),
        Arc::new(Float32Array::from(flat_values)),
        None,
    )
    .map_err(|e| StoreError::InvalidRecord(format!("Failed to create vector array: {}", e)))?;

    let chunks = records.iter().map(|r| &r.chunk);
    let arrays: Vec<Arc<dyn Array>> = vec![
        Arc::new(StringArray::from_iter_values(chunks.clone().map(|c| c.id.as_str()))),
        Arc::new(vector_array),
        Arc::new(StringArray::from_iter_values(chunks.clone().map(|c| c.text.as_str()))),
        Arc::new(UInt32Array::from_iter_values(chunks.clone().map(|c| c.chapter))),
        Arc::new(StringArray::from_iter_values(
            chunks.clone().map(|c| c.chapter_title.as_str()),
        )),
        Arc::new(StringArray::from_iter_values(chunks.clone().map(|c| c.section.as_str()))),
        Arc::new(StringArray::from_iter_values(chunks.clone().map(|c| c.title.as_str()))),
        Arc::new(UInt32Array::from_iter_values(
            chunks.clone().map(|c| to_u32(c.word_count)),
        )),
        Arc::new(StringArray::from_iter_values(
            chunks.clone().map(|c| c.document_id.as_str()),
        )),
        Arc::new(UInt32Array::from_iter_values(
            chunks.clone().map(|c| to_u32(c.chunk_index)),
        )),
        Arc::new(Int64Array::from_iter_values(
            (0..records.len()).map(|i| first_seq + i64::try_from(i).unwrap_or(i64::MAX)),
        )),
        Arc::new(StringArray::from_iter_values(
            records.iter().map(|_| created_at.as_str()),
        )),
    ];

    RecordBatch::try_new(create_schema(dimension), arrays)
        .map_err(|e| StoreError::InvalidRecord(format!("Failed to create record batch: {}", e)))
}

fn column<'a, T: Array + 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T, StoreError> {
    batch
        .column_by_name(name)
        .ok_or_else(|| StoreError::Database(format!("Missing {} column", name)))?
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| StoreError::Database(format!("Invalid {} column type", name)))
}

fn parse_scored_batch(batch: &RecordBatch) -> Result<Vec<ScoredChunk>, StoreError> {
    let ids = column::<StringArray>(batch, "id")?;
    let texts = column::<StringArray>(batch, "text")?;
    let chapters = column::<UInt32Array>(batch, "chapter")?;
    let chapter_titles = column::<StringArray>(batch, "chapter_title")?;
    let sections = column::<StringArray>(batch, "section")?;
    let titles = column::<StringArray>(batch, "title")?;
    let word_counts = column::<UInt32Array>(batch, "word_count")?;
    let document_ids = column::<StringArray>(batch, "document_id")?;
    let chunk_indices = column::<UInt32Array>(batch, "chunk_index")?;
    let seqs = column::<Int64Array>(batch, "seq")?;
    let distances = column::<Float32Array>(batch, "_distance")?;

    let results = (0..batch.num_rows())
        .map(|row| {
            let distance = if distances.is_null(row) {
                1.0
            } else {
                distances.value(row)
            };
            ScoredChunk {
                id: ids.value(row).to_string(),
                score: 1.0 - distance,
                seq: seqs.value(row),
                chunk: Chunk {
                    id: ids.value(row).to_string(),
                    document_id: document_ids.value(row).to_string(),
                    chunk_index: chunk_indices.value(row) as usize,
                    chapter: chapters.value(row),
                    chapter_title: chapter_titles.value(row).to_string(),
                    section: sections.value(row).to_string(),
                    title: titles.value(row).to_string(),
                    text: texts.value(row).to_string(),
                    word_count: word_counts.value(row) as usize,
                },
            }
        })
        .collect();

    Ok(results)
}

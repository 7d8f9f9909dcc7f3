use std::str::FromStr;

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, Transaction};

use crate::config::AppConfig;
use crate::models::{ParagraphRange, StoredChunk, YearSpan};

const CHUNK_COLUMNS: &str =
    "id, content, source_document, paragraph_start, paragraph_end, year_start, year_end";

#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub id: String,
    pub chunk: StoredChunk,
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(config: &AppConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;

        let options = SqliteConnectOptions::from_str(&config.sqlite_dsn())?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Single-connection in-memory database; each pooled connection would
    /// otherwise see its own empty schema.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                source_document TEXT NOT NULL,
                paragraph_start INTEGER NOT NULL,
                paragraph_end INTEGER NOT NULL,
                year_start INTEGER,
                year_end INTEGER
            );

            CREATE INDEX IF NOT EXISTS chunks_year_end ON chunks (year_end);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn insert_chunks(&self, records: &[ChunkRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            insert_chunk_tx(&mut tx, record).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_chunk(&self, chunk_id: &str) -> Result<Option<StoredChunk>> {
        let sql = format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(chunk_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| row_to_record(row).chunk))
    }

    pub async fn search_chunk_ids_by_term(&self, term: &str, limit: i64) -> Result<Vec<String>> {
        let needle = term.trim().to_lowercase();
        if needle.is_empty() || limit <= 0 {
            return Ok(vec![]);
        }

        let rows = sqlx::query(
            r#"
            SELECT id
            FROM chunks
            WHERE lower(content) LIKE ?
            ORDER BY COALESCE(year_start, 9999) ASC, rowid ASC
            LIMIT ?
            "#,
        )
        .bind(format!("%{needle}%"))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|row| row.get::<String, _>("id")).collect())
    }

    /// Latest year any chunk mentioning one of `terms` reaches. Metadata only.
    pub async fn latest_year_for_terms(&self, terms: &[String]) -> Result<Option<i32>> {
        if terms.is_empty() {
            return Ok(None);
        }

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT MAX(year_end) AS latest FROM chunks WHERE ");
        for (idx, term) in terms.iter().enumerate() {
            if idx > 0 {
                qb.push(" OR ");
            }
            qb.push("lower(content) LIKE ");
            qb.push_bind(format!("%{}%", term.to_lowercase()));
        }

        let row = qb.build().fetch_one(&self.pool).await?;
        let latest: Option<i64> = row.try_get("latest")?;
        Ok(latest.and_then(|year| i32::try_from(year).ok()))
    }
}

async fn insert_chunk_tx(tx: &mut Transaction<'_, Sqlite>, record: &ChunkRecord) -> Result<()> {
    let chunk = &record.chunk;
    sqlx::query(
        r#"
        INSERT INTO chunks (id, content, source_document, paragraph_start, paragraph_end, year_start, year_end)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.id)
    .bind(&chunk.text)
    .bind(&chunk.source_document)
    .bind(i64::from(chunk.paragraph_range.start))
    .bind(i64::from(chunk.paragraph_range.end))
    .bind(chunk.year_span.map(|span| i64::from(span.start)))
    .bind(chunk.year_span.map(|span| i64::from(span.end)))
    .execute(&mut **tx)
    .await?;

    Ok(())
}

fn row_to_record(row: SqliteRow) -> ChunkRecord {
    let year_start: Option<i64> = row.get("year_start");
    let year_end: Option<i64> = row.get("year_end");
    let year_span = match (year_start, year_end) {
        (Some(start), Some(end)) => Some(YearSpan::new(start as i32, end as i32)),
        (Some(year), None) | (None, Some(year)) => Some(YearSpan::new(year as i32, year as i32)),
        (None, None) => None,
    };

    ChunkRecord {
        id: row.get("id"),
        chunk: StoredChunk {
            text: row.get("content"),
            source_document: row.get("source_document"),
            paragraph_range: ParagraphRange::new(
                row.get::<i64, _>("paragraph_start").max(0) as u32,
                row.get::<i64, _>("paragraph_end").max(0) as u32,
            ),
            year_span,
        },
    }
}

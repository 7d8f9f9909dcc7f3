use std::path::PathBuf;

use anyhow::Result;
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::{Field, Schema, Value};
use tantivy::{Index, TantivyDocument};

#[derive(Clone)]
pub struct TantivyStore {
    index_dir: PathBuf,
}

#[derive(Clone, Copy)]
struct TantivyFields {
    chunk_id: Field,
    content: Field,
}

impl TantivyStore {
    pub fn new(index_dir: PathBuf) -> Self {
        Self { index_dir }
    }

    pub fn is_available(&self) -> bool {
        self.index_dir.join("meta.json").exists()
    }

    /// Chunk ids whose content matches `term`; multi-word terms are matched as phrases.
    pub fn lookup_term(&self, term: &str, limit: usize) -> Result<Vec<String>> {
        let cleaned = term.replace('"', " ");
        let cleaned = cleaned.trim();
        if cleaned.is_empty() || !self.is_available() {
            return Ok(vec![]);
        }

        let index = Index::open_in_dir(&self.index_dir)?;
        let fields = resolve_fields(&index.schema())?;
        let reader = index.reader()?;
        let searcher = reader.searcher();

        let query_parser = QueryParser::for_index(&index, vec![fields.content]);
        let query_text = if cleaned.contains(char::is_whitespace) {
            format!("\"{cleaned}\"")
        } else {
            cleaned.to_string()
        };
        let query = query_parser.parse_query(&query_text)?;
        let top_docs = searcher.search(&query, &TopDocs::with_limit(limit))?;

        let mut out = Vec::with_capacity(top_docs.len());
        for (_score, addr) in top_docs {
            let doc = searcher.doc::<TantivyDocument>(addr)?;
            if let Some(chunk_id) = doc
                .get_first(fields.chunk_id)
                .and_then(|value| value.as_str())
            {
                out.push(chunk_id.to_string());
            }
        }

        Ok(out)
    }
}

fn resolve_fields(schema: &Schema) -> Result<TantivyFields> {
    Ok(TantivyFields {
        chunk_id: schema
            .get_field("chunk_id")
            .map_err(|err| anyhow::anyhow!(err.to_string()))?,
        content: schema
            .get_field("content")
            .map_err(|err| anyhow::anyhow!(err.to_string()))?,
    })
}

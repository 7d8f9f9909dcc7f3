use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use crate::error::GenerationError;
use crate::gateway::Generator;
use crate::models::{ParagraphRange, StoredChunk, YearSpan};
use crate::store::ChunkStore;

type Handler = Box<dyn Fn(&str) -> Result<String, GenerationError> + Send + Sync>;

pub struct ScriptedGenerator {
    script: Mutex<VecDeque<Result<String, GenerationError>>>,
    fallback: Handler,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn with_handler(
        handler: impl Fn(&str) -> Result<String, GenerationError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Box::new(handler),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn always(text: &str) -> Self {
        let text = text.to_string();
        Self::with_handler(move |_| Ok(text.clone()))
    }

    pub fn failing(err: GenerationError) -> Self {
        Self::with_handler(move |_| Err(err.clone()))
    }

    /// Replays `script` in order, then fails every further call.
    pub fn sequence(script: Vec<Result<String, GenerationError>>) -> Self {
        let generator = Self::with_handler(|_| {
            Err(GenerationError::InvalidRequest("script exhausted".to_string()))
        });
        *generator.script.lock().unwrap() = script.into();
        generator
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, prompt: &str, _max_tokens: usize) -> Result<String, GenerationError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if let Some(next) = self.script.lock().unwrap().pop_front() {
            return next;
        }
        (self.fallback)(prompt)
    }
}

#[derive(Default)]
pub struct MemoryChunkStore {
    chunks: Vec<(String, StoredChunk)>,
    semantic: HashMap<String, Vec<String>>,
    latest_year_override: Option<Option<i32>>,
    lookups: Mutex<Vec<String>>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunk(
        mut self,
        id: &str,
        document: &str,
        paragraphs: (u32, u32),
        years: Option<(i32, i32)>,
        text: &str,
    ) -> Self {
        self.chunks.push((
            id.to_string(),
            StoredChunk {
                text: text.to_string(),
                source_document: document.to_string(),
                paragraph_range: ParagraphRange::new(paragraphs.0, paragraphs.1),
                year_span: years.map(|(a, b)| YearSpan::new(a, b)),
            },
        ));
        self
    }

    pub fn with_semantic(mut self, needle: &str, ids: &[&str]) -> Self {
        self.semantic.insert(
            needle.to_lowercase(),
            ids.iter().map(|id| id.to_string()).collect(),
        );
        self
    }

    /// Pins the metadata answer regardless of the stored chunks.
    pub fn with_latest_year(mut self, year: Option<i32>) -> Self {
        self.latest_year_override = Some(year);
        self
    }

    pub fn lookups(&self) -> Vec<String> {
        self.lookups.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn lookup_by_term(&self, term: &str) -> Result<Vec<String>> {
        self.lookups.lock().unwrap().push(term.to_string());
        let needle = term.to_lowercase();
        Ok(self
            .chunks
            .iter()
            .filter(|(_, chunk)| chunk.text.to_lowercase().contains(&needle))
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn similarity_search(&self, query_text: &str, k: usize) -> Result<Vec<String>> {
        let lower = query_text.to_lowercase();
        let mut out: Vec<String> = Vec::new();
        let mut needles: Vec<&String> = self.semantic.keys().collect();
        needles.sort();
        for needle in needles {
            if !lower.contains(needle.as_str()) {
                continue;
            }
            for id in &self.semantic[needle] {
                if !out.contains(id) {
                    out.push(id.clone());
                }
            }
        }
        out.truncate(k);
        Ok(out)
    }

    async fn get_chunk(&self, id: &str) -> Result<Option<StoredChunk>> {
        Ok(self
            .chunks
            .iter()
            .find(|(chunk_id, _)| chunk_id == id)
            .map(|(_, chunk)| chunk.clone()))
    }

    async fn latest_year_for_terms(&self, terms: &[String]) -> Result<Option<i32>> {
        if let Some(year) = self.latest_year_override {
            return Ok(year);
        }
        Ok(self
            .chunks
            .iter()
            .filter(|(_, chunk)| {
                let text = chunk.text.to_lowercase();
                terms.iter().any(|term| text.contains(&term.to_lowercase()))
            })
            .filter_map(|(_, chunk)| chunk.year_span.map(|span| span.end))
            .max())
    }
}

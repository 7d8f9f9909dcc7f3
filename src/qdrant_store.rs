use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Clone)]
pub struct VectorHit {
    pub chunk_id: String,
    pub score: f32,
}

#[derive(Clone)]
pub struct QdrantStore {
    client: Client,
    base_url: String,
    collection: String,
}

impl QdrantStore {
    pub fn new(base_url: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            collection: collection.into(),
        }
    }

    pub async fn search(&self, vector: &[f32], limit: usize) -> Result<Vec<VectorHit>> {
        if vector.is_empty() || limit == 0 {
            return Ok(vec![]);
        }

        let url = format!(
            "{}/collections/{}/points/search",
            self.base_url, self.collection
        );

        let body = json!({
            "vector": vector,
            "limit": limit,
            "with_payload": true,
        });

        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .context("failed to contact qdrant during search")?
            .error_for_status()
            .context("qdrant search returned non-success status")?
            .json::<QdrantSearchResponse>()
            .await
            .context("failed to decode qdrant search response")?;

        Ok(hits_from_response(response))
    }
}

fn hits_from_response(response: QdrantSearchResponse) -> Vec<VectorHit> {
    response
        .result
        .into_iter()
        .filter_map(|point| {
            let payload = point.payload?;
            let chunk_id = payload.chunk_id.or(payload.id)?;
            Some(VectorHit {
                chunk_id,
                score: point.score,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Deserialize)]
struct QdrantPayload {
    chunk_id: Option<String>,
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QdrantSearchResponse {
    result: Vec<QdrantResultPoint>,
}

#[derive(Debug, Deserialize)]
struct QdrantResultPoint {
    score: f32,
    payload: Option<QdrantPayload>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hits_prefer_chunk_id_and_skip_bare_points() {
        let response: QdrantSearchResponse = serde_json::from_value(json!({
            "result": [
                { "score": 0.91, "payload": { "chunk_id": "c1", "id": "p1" } },
                { "score": 0.80, "payload": { "id": "c2" } },
                { "score": 0.70, "payload": null },
                { "score": 0.60, "payload": {} }
            ]
        }))
        .unwrap();

        let hits = hits_from_response(response);
        let ids: Vec<&str> = hits.iter().map(|hit| hit.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2"]);
        assert!((hits[0].score - 0.91).abs() < f32::EPSILON);
    }
}

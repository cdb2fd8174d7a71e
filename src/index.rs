use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::models::{IndexNode, ScoredNode};

pub const DOCSTORE_FILE: &str = "docstore.json";
pub const VECTOR_STORE_FILE: &str = "default__vector_store.json";
pub const INDEX_STORE_FILE: &str = "index_store.json";

/// A previously persisted vector index, loaded read-only.
#[derive(Debug)]
pub struct VectorIndex {
    nodes: Vec<IndexNode>,
    dimension: usize,
}

#[derive(Deserialize)]
struct DocStoreFile {
    #[serde(rename = "docstore/data", default)]
    data: HashMap<String, StoredNode>,
}

#[derive(Deserialize)]
struct StoredNode {
    #[serde(rename = "__data__")]
    data: StoredNodeData,
}

#[derive(Deserialize)]
struct StoredNodeData {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct VectorStoreFile {
    #[serde(default)]
    embedding_dict: HashMap<String, Vec<f32>>,
}

#[derive(Deserialize)]
struct IndexStoreFile {
    #[serde(rename = "index_store/data", default)]
    data: HashMap<String, IndexStruct>,
}

#[derive(Deserialize)]
struct IndexStruct {
    #[serde(rename = "__type__")]
    kind: String,
}

impl VectorIndex {
    pub fn load(persist_dir: &Path) -> Result<Self> {
        if !persist_dir.is_dir() {
            anyhow::bail!(
                "index storage directory not found: {}",
                persist_dir.display()
            );
        }

        let index_store: IndexStoreFile = read_json(&persist_dir.join(INDEX_STORE_FILE))?;
        if !index_store
            .data
            .values()
            .any(|index| index.kind == "vector_store")
        {
            anyhow::bail!(
                "{} does not contain a vector_store index",
                persist_dir.join(INDEX_STORE_FILE).display()
            );
        }

        let docstore: DocStoreFile = read_json(&persist_dir.join(DOCSTORE_FILE))?;
        let vectors: VectorStoreFile = read_json(&persist_dir.join(VECTOR_STORE_FILE))?;

        let mut docs = docstore.data;
        let mut nodes = Vec::with_capacity(vectors.embedding_dict.len());
        for (id, embedding) in vectors.embedding_dict {
            let stored = docs.remove(&id).with_context(|| {
                format!("embedding for node {id} has no matching entry in {DOCSTORE_FILE}")
            })?;
            nodes.push(IndexNode {
                id,
                text: stored.data.text,
                embedding,
            });
        }
        nodes.sort_by(|a, b| a.id.cmp(&b.id));

        Self::from_nodes(nodes)
    }

    pub fn from_nodes(nodes: Vec<IndexNode>) -> Result<Self> {
        let dimension = nodes.first().map(|n| n.embedding.len()).unwrap_or(0);
        if let Some(bad) = nodes.iter().find(|n| n.embedding.len() != dimension) {
            anyhow::bail!(
                "node {} has embedding dimension {} but the index uses {}",
                bad.id,
                bad.embedding.len(),
                dimension
            );
        }

        Ok(Self { nodes, dimension })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn top_k(&self, query: &[f32], k: usize) -> Vec<ScoredNode> {
        if k == 0 || query.is_empty() {
            return vec![];
        }

        let mut scored: Vec<(f32, &IndexNode)> = self
            .nodes
            .iter()
            .map(|node| (cosine_similarity(query, &node.embedding), node))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));

        scored
            .into_iter()
            .take(k)
            .map(|(score, node)| ScoredNode {
                node_id: node.id.clone(),
                text: node.text.clone(),
                score,
            })
            .collect()
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed reading index storage file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("corrupt index storage file {}", path.display()))
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
pub(crate) mod tests {
    use serde_json::json;

    use super::*;

    pub(crate) fn write_storage(dir: &Path, nodes: &[(&str, &str, Vec<f32>)]) {
        let docstore: serde_json::Map<String, serde_json::Value> = nodes
            .iter()
            .map(|(id, text, _)| {
                (
                    id.to_string(),
                    json!({ "__data__": { "id_": id, "text": text, "metadata": {} }, "__type__": "1" }),
                )
            })
            .collect();
        let embeddings: serde_json::Map<String, serde_json::Value> = nodes
            .iter()
            .map(|(id, _, embedding)| (id.to_string(), json!(embedding)))
            .collect();

        std::fs::write(
            dir.join(DOCSTORE_FILE),
            json!({ "docstore/data": docstore }).to_string(),
        )
        .unwrap();
        std::fs::write(
            dir.join(VECTOR_STORE_FILE),
            json!({ "embedding_dict": embeddings, "text_id_to_ref_doc_id": {} }).to_string(),
        )
        .unwrap();
        std::fs::write(
            dir.join(INDEX_STORE_FILE),
            json!({ "index_store/data": { "idx": { "__type__": "vector_store", "__data__": "{}" } } })
                .to_string(),
        )
        .unwrap();
    }

    pub(crate) fn sample_index() -> VectorIndex {
        VectorIndex::from_nodes(vec![
            IndexNode {
                id: "crpc-41d".to_string(),
                text: "41D. Right of arrested person to meet an advocate of his choice".to_string(),
                embedding: vec![1.0, 0.0],
            },
            IndexNode {
                id: "bnss-38".to_string(),
                text: "38. Right of arrested person to meet an advocate".to_string(),
                embedding: vec![0.8, 0.6],
            },
            IndexNode {
                id: "bnss-39".to_string(),
                text: "39. Arrest on refusal to give name and residence".to_string(),
                embedding: vec![0.0, 1.0],
            },
        ])
        .unwrap()
    }

    #[test]
    fn loads_persisted_storage() {
        let dir = tempfile::tempdir().unwrap();
        write_storage(
            dir.path(),
            &[("b", "second", vec![0.0, 1.0]), ("a", "first", vec![1.0, 0.0])],
        );

        let index = VectorIndex::load(dir.path()).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.dimension(), 2);
        assert_eq!(index.top_k(&[1.0, 0.0], 1)[0].text, "first");
    }

    #[test]
    fn missing_storage_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(VectorIndex::load(&dir.path().join("nope")).is_err());

        let err = VectorIndex::load(dir.path()).unwrap_err();
        assert!(format!("{err:#}").contains(INDEX_STORE_FILE));
    }

    #[test]
    fn corrupt_or_inconsistent_storage_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write_storage(dir.path(), &[("a", "first", vec![1.0, 0.0])]);
        std::fs::write(dir.path().join(DOCSTORE_FILE), "{ not json").unwrap();
        assert!(VectorIndex::load(dir.path()).is_err());

        write_storage(dir.path(), &[("a", "first", vec![1.0, 0.0])]);
        std::fs::write(
            dir.path().join(VECTOR_STORE_FILE),
            json!({ "embedding_dict": { "a": [1.0, 0.0], "ghost": [0.0, 1.0] } }).to_string(),
        )
        .unwrap();
        assert!(VectorIndex::load(dir.path()).is_err());
    }

    #[test]
    fn mixed_dimensions_are_rejected() {
        let result = VectorIndex::from_nodes(vec![
            IndexNode {
                id: "a".to_string(),
                text: String::new(),
                embedding: vec![1.0, 0.0],
            },
            IndexNode {
                id: "b".to_string(),
                text: String::new(),
                embedding: vec![1.0, 0.0, 0.0],
            },
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn top_k_orders_by_cosine_similarity() {
        let index = sample_index();
        let hits = index.top_k(&[1.0, 0.0], 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].node_id, "crpc-41d");
        assert_eq!(hits[1].node_id, "bnss-38");
        assert!((hits[0].score - 1.0).abs() < 1e-6);
        assert!((hits[1].score - 0.8).abs() < 1e-6);
        assert!(index.top_k(&[1.0, 0.0], 0).is_empty());
    }

    #[test]
    fn zero_vectors_score_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }
}

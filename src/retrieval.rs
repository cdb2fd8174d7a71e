use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::future::try_join_all;
use regex::Regex;

use crate::config::RetrievalConfig;
use crate::index::VectorIndex;
use crate::llm::LanguageModel;
use crate::models::ScoredNode;

/// Embeds the query and looks it up in the loaded index.
#[derive(Clone)]
pub struct VectorRetriever {
    index: Arc<VectorIndex>,
    llm: Arc<dyn LanguageModel>,
    top_k: usize,
}

impl VectorRetriever {
    pub fn new(index: Arc<VectorIndex>, llm: Arc<dyn LanguageModel>, top_k: usize) -> Self {
        Self { index, llm, top_k }
    }

    pub async fn retrieve(&self, query: &str) -> Result<Vec<ScoredNode>> {
        let embedding = self
            .llm
            .embed(query)
            .await
            .with_context(|| format!("failed to embed retrieval query {query:?}"))?;
        if !self.index.is_empty() && embedding.len() != self.index.dimension() {
            anyhow::bail!(
                "query embedding has dimension {} but the index uses {}",
                embedding.len(),
                self.index.dimension()
            );
        }
        Ok(self.index.top_k(&embedding, self.top_k))
    }
}

/// Generates extra phrasings of a query, retrieves for each, and fuses the
/// hits by keeping the best score per node.
#[derive(Clone)]
pub struct FusionRetriever {
    retriever: VectorRetriever,
    llm: Arc<dyn LanguageModel>,
    similarity_top_k: usize,
    num_queries: usize,
    use_async: bool,
    query_gen_prompt: String,
}

impl FusionRetriever {
    pub fn new(
        retriever: VectorRetriever,
        llm: Arc<dyn LanguageModel>,
        config: &RetrievalConfig,
    ) -> Self {
        Self {
            retriever,
            llm,
            similarity_top_k: config.similarity_top_k,
            num_queries: config.num_queries.max(1),
            use_async: config.use_async,
            query_gen_prompt: config.query_gen_prompt.clone(),
        }
    }

    pub async fn retrieve(&self, query: &str) -> Result<Vec<ScoredNode>> {
        let mut queries = vec![query.to_string()];
        if self.num_queries > 1 {
            queries.extend(self.generate_queries(query).await?);
        }
        tracing::info!(?queries, "fusion retrieval queries");

        let results = if self.use_async {
            try_join_all(queries.iter().map(|q| self.retriever.retrieve(q))).await?
        } else {
            let mut results = Vec::with_capacity(queries.len());
            for q in &queries {
                results.push(self.retriever.retrieve(q).await?);
            }
            results
        };

        Ok(fuse_results(results, self.similarity_top_k))
    }

    async fn generate_queries(&self, query: &str) -> Result<Vec<String>> {
        let prompt = self
            .query_gen_prompt
            .replace("{num_queries}", &self.num_queries.to_string())
            .replace("{query}", query);
        let response = self
            .llm
            .complete(&prompt)
            .await
            .context("failed to generate fusion queries")?;

        Ok(parse_generated_queries(&response, self.num_queries - 1))
    }
}

fn parse_generated_queries(response: &str, limit: usize) -> Vec<String> {
    let numbering = Regex::new(r"^\s*(?:\d+[.)]|[-*])\s*")
        .unwrap_or_else(|_| Regex::new("^").unwrap());

    response
        .lines()
        .map(|line| numbering.replace(line, "").trim().to_string())
        .filter(|line| !line.is_empty())
        .take(limit)
        .collect()
}

fn fuse_results(results: Vec<Vec<ScoredNode>>, top_k: usize) -> Vec<ScoredNode> {
    let mut best: HashMap<String, ScoredNode> = HashMap::new();
    for node in results.into_iter().flatten() {
        match best.get(&node.node_id) {
            Some(existing) if existing.score >= node.score => {}
            _ => {
                best.insert(node.node_id.clone(), node);
            }
        }
    }

    let mut fused: Vec<ScoredNode> = best.into_values().collect();
    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.node_id.cmp(&b.node_id))
    });
    fused.truncate(top_k);
    fused
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_QUERY_GEN_PROMPT;
    use crate::index::tests::sample_index;
    use crate::llm::testing::FakeModel;

    fn node(id: &str, score: f32) -> ScoredNode {
        ScoredNode {
            node_id: id.to_string(),
            text: format!("text {id}"),
            score,
        }
    }

    fn retrieval_config(num_queries: usize, use_async: bool) -> RetrievalConfig {
        RetrievalConfig {
            similarity_top_k: 2,
            num_queries,
            use_async,
            query_gen_prompt: DEFAULT_QUERY_GEN_PROMPT.to_string(),
            fixed_query: "41D".to_string(),
        }
    }

    #[test]
    fn fusion_keeps_best_score_per_node() {
        let fused = fuse_results(
            vec![
                vec![node("a", 0.4), node("b", 0.9)],
                vec![node("a", 0.7), node("c", 0.1)],
            ],
            2,
        );
        assert_eq!(fused, vec![node("b", 0.9), node("a", 0.7)]);
    }

    #[test]
    fn generated_queries_drop_numbering_and_blanks() {
        let parsed = parse_generated_queries(
            "1. What is section 41D in CrPC?\n\n2) Section 41D BNSS equivalent\n- extra",
            2,
        );
        assert_eq!(
            parsed,
            vec!["What is section 41D in CrPC?", "Section 41D BNSS equivalent"]
        );
    }

    #[tokio::test]
    async fn vector_retriever_returns_top_k() {
        let llm = Arc::new(FakeModel::default());
        let retriever = VectorRetriever::new(Arc::new(sample_index()), llm.clone(), 2);
        let hits = retriever.retrieve("41D").await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].node_id, "crpc-41d");
        assert_eq!(llm.embedded_queries(), vec!["41D"]);
    }

    #[tokio::test]
    async fn mismatched_embedding_dimension_is_an_error() {
        let llm = Arc::new(FakeModel::default());
        let index = VectorIndex::from_nodes(vec![crate::models::IndexNode {
            id: "wide".to_string(),
            text: "three dimensional node".to_string(),
            embedding: vec![1.0, 0.0, 0.0],
        }])
        .unwrap();
        let retriever = VectorRetriever::new(Arc::new(index), llm, 2);

        let err = retriever.retrieve("41D").await.unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("dimension 2"), "{message}");
        assert!(message.contains("uses 3"), "{message}");
    }

    #[tokio::test]
    async fn fusion_retrieves_for_original_and_generated_queries() {
        let llm = Arc::new(FakeModel::with_tokens(&[]));
        let retriever = VectorRetriever::new(Arc::new(sample_index()), llm.clone(), 2);
        let fusion = FusionRetriever::new(retriever, llm.clone(), &retrieval_config(2, true));

        let hits = fusion.retrieve("41D").await.unwrap();

        let mut embedded = llm.embedded_queries();
        embedded.sort();
        assert_eq!(embedded, vec!["41D", "alternate query"]);
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().any(|h| h.node_id == "crpc-41d"));
        assert!(hits.iter().any(|h| h.node_id == "bnss-39"));
    }

    #[tokio::test]
    async fn single_query_skips_generation() {
        let llm = Arc::new(FakeModel::with_tokens(&[]));
        let retriever = VectorRetriever::new(Arc::new(sample_index()), llm.clone(), 2);
        let fusion = FusionRetriever::new(retriever, llm.clone(), &retrieval_config(1, false));

        let hits = fusion.retrieve("41D").await.unwrap();
        assert_eq!(llm.embedded_queries(), vec!["41D"]);
        assert_eq!(hits[0].node_id, "crpc-41d");
        assert_eq!(hits[1].node_id, "bnss-38");
    }
}

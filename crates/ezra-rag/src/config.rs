//! Engine configuration with validated defaults.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration for the support engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory for persisted index artifacts.
    pub data_dir: PathBuf,
    pub retrieval: RetrievalConfig,
    pub confidence: ConfidenceConfig,
    pub agent: AgentConfig,
    pub completion: CompletionConfig,
    pub embedding: EmbeddingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ezra-rag");
        Self {
            data_dir,
            retrieval: RetrievalConfig::default(),
            confidence: ConfidenceConfig::default(),
            agent: AgentConfig::default(),
            completion: CompletionConfig::default(),
            embedding: EmbeddingConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.retrieval.top_k > 0, "retrieval.top_k must be positive");
        anyhow::ensure!(
            self.retrieval.fusion_limit >= self.retrieval.top_k,
            "retrieval.fusion_limit must be at least top_k"
        );
        anyhow::ensure!(
            self.retrieval.fusion_k > 0,
            "retrieval.fusion_k must be positive"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.confidence.low_score),
            "confidence.low_score must be in [0, 1]"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.confidence.gap_ratio),
            "confidence.gap_ratio must be in [0, 1]"
        );
        anyhow::ensure!(
            self.agent.max_iterations > 0,
            "agent.max_iterations must be positive"
        );
        anyhow::ensure!(self.agent.max_searches > 0, "agent.max_searches must be positive");
        anyhow::ensure!(
            self.completion.max_tokens > 0,
            "completion.max_tokens must be positive"
        );
        Ok(())
    }

    /// Path of the persisted sparse-index artifact.
    pub fn sparse_index_path(&self) -> PathBuf {
        self.data_dir.join("sparse_index.json")
    }
}

/// Retrieval pipeline tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Final number of passages returned per query.
    pub top_k: usize,
    /// Candidates pulled from each individual signal before fusion.
    pub signal_top_n: usize,
    /// Reciprocal-rank-fusion constant.
    pub fusion_k: usize,
    /// Fused shortlist size handed to the reranker.
    pub fusion_limit: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            signal_top_n: 20,
            fusion_k: 60,
            fusion_limit: 30,
        }
    }
}

/// Confidence gate thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceConfig {
    /// Minimum acceptable top score.
    pub low_score: f32,
    /// Minimum relative gap between the top two scores.
    pub gap_ratio: f32,
    /// Minimum salient-term overlap between query and top passage.
    pub min_overlap: usize,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            low_score: 0.15,
            gap_ratio: 0.1,
            min_overlap: 1,
        }
    }
}

/// Per-turn tool budgets and loop bounds for the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub max_searches: u32,
    pub max_clarifications: u32,
    pub max_final_answers: u32,
    pub max_capability_explanations: u32,
    /// Hard cap on planner iterations in one turn.
    pub max_iterations: u32,
    /// History messages kept in planner context.
    pub max_history_messages: usize,
    /// Lowercased keywords that mark a question as in-scope for the
    /// support domain. Used as a cheap topical pre-filter only.
    pub topic_keywords: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let topic_keywords = [
            "מערכת",
            "תמיכה",
            "עזרה",
            "תקלה",
            "בעיה",
            "הגדרות",
            "דוח",
            "לקוח",
            "משימה",
            "חשבונית",
            "הרשאות",
            "סיסמה",
            "system",
            "support",
            "feature",
            "how to",
            "troubleshoot",
            "manage",
            "create",
            "edit",
            "delete",
            "report",
            "password",
            "crm",
        ];
        Self {
            max_searches: 5,
            max_clarifications: 1,
            max_final_answers: 1,
            max_capability_explanations: 1,
            max_iterations: 10,
            max_history_messages: 20,
            topic_keywords: topic_keywords.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Chat-completion service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            max_tokens: 800,
            temperature: 0.2,
        }
    }
}

/// Embedding service settings. Embeddings are optional; without them the
/// engine runs sparse-only with lexical reranking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub enabled: bool,
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    /// Entries kept in the embedding LRU cache.
    pub cache_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "text-embedding-3-small".to_string(),
            cache_size: 1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn default_thresholds_match_tuning() {
        let config = EngineConfig::default();
        assert_eq!(config.retrieval.fusion_k, 60);
        assert_eq!(config.retrieval.fusion_limit, 30);
        assert!((config.confidence.low_score - 0.15).abs() < f32::EPSILON);
        assert_eq!(config.agent.max_searches, 5);
        assert_eq!(config.agent.max_iterations, 10);
    }

    #[test]
    fn rejects_zero_top_k() {
        let mut config = EngineConfig::default();
        config.retrieval.top_k = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_gate() {
        let mut config = EngineConfig::default();
        config.confidence.low_score = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = EngineConfig::default();
        std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();
        let loaded = EngineConfig::from_file(&path).unwrap();
        assert_eq!(loaded.retrieval.top_k, config.retrieval.top_k);
        assert_eq!(loaded.completion.model, config.completion.model);
    }
}

//! OpenAI-shaped embeddings response, as far as the broker needs to merge it.

use std::ops::AddAssign;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Token usage reported for one embeddings call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl AddAssign for EmbeddingUsage {
    fn add_assign(&mut self, other: Self) {
        self.prompt_tokens += other.prompt_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Embeddings response. Items in `data` are kept opaque.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    #[serde(default = "default_object")]
    pub object: String,
    #[serde(default)]
    pub data: Vec<Value>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub usage: EmbeddingUsage,
}

fn default_object() -> String {
    "list".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_accumulates() {
        let mut usage = EmbeddingUsage { prompt_tokens: 3, total_tokens: 3 };
        usage += EmbeddingUsage { prompt_tokens: 4, total_tokens: 5 };
        assert_eq!(usage, EmbeddingUsage { prompt_tokens: 7, total_tokens: 8 });
    }

    #[test]
    fn test_missing_fields_default() {
        let resp: EmbeddingResponse = serde_json::from_str(r#"{"data":[{"index":0}]}"#).unwrap();
        assert_eq!(resp.object, "list");
        assert_eq!(resp.data.len(), 1);
        assert_eq!(resp.usage, EmbeddingUsage::default());
    }
}

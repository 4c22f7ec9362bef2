use serde::{Deserialize, Serialize};

/// One line of `crawl.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlRecord {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub retrieved_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved_path: Option<String>,
    pub assets_stored: usize,
    pub assets_reused: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub asset_failures: Vec<AssetFailureRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetFailureRecord {
    pub url: String,
    pub error: String,
}

/// One line of `localize.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalizeRecord {
    pub input_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved_path: Option<String>,
    pub assets_stored: usize,
    pub assets_reused: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub asset_failures: Vec<AssetFailureRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AssetFailureRecord {
    pub fn from_failures(failures: &[crate::page::AssetFailure]) -> Vec<Self> {
        failures
            .iter()
            .map(|failure| Self {
                url: failure.url.to_string(),
                error: failure.error.to_string(),
            })
            .collect()
    }
}

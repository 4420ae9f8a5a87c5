//! config — one JSON document holding every tuned constant of a session
//!
//! Every section and every field is optional; whatever is missing keeps its
//! default, so a config file only needs to name what it changes.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::detection::ExtractorConfig;
use crate::pipeline::AnalyzerConfig;
use crate::remote::RemoteConfig;
use crate::rendering::OverlayConfig;
use crate::table::TableDetectorConfig;
use crate::tracking::TrackerConfig;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub analyzer: AnalyzerConfig,
    pub table: TableDetectorConfig,
    pub extractor: ExtractorConfig,
    pub tracker: TrackerConfig,
    pub remote: RemoteConfig,
    pub overlay: OverlayConfig,
}

impl AnalysisConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

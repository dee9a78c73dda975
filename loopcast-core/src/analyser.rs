//! Client for the audio analyser sidecar: BPM/key detection and tag
//! extraction. A 90s request deadline matches the sidecar's own
//! documented worst case for a five-minute track; callers additionally
//! wrap the call in the audio queue's own 90s inner deadline so a hung
//! sidecar can't stall a whole worker past the 300s outer job deadline.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// What to extract. `full()` requests everything; narrower constructors
/// exist for callers (tests, future endpoints) that only need one facet.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisOptions {
    pub bpm: bool,
    pub key: bool,
    pub tags: bool,
}

impl AnalysisOptions {
    pub fn full() -> Self {
        Self {
            bpm: true,
            key: true,
            tags: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BpmResult {
    pub value: f32,
    pub confidence: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeyResult {
    pub value: String,
    pub camelot: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TagsResult {
    #[serde(default)]
    pub top_tags: Vec<String>,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub moods: Vec<String>,
    #[serde(default)]
    pub instruments: Vec<String>,
    #[serde(default)]
    pub has_vocals: Option<bool>,
    #[serde(default)]
    pub is_danceable: Option<bool>,
    #[serde(default)]
    pub arousal: Option<f32>,
    #[serde(default)]
    pub valence: Option<f32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnalysisResult {
    pub bpm: Option<BpmResult>,
    pub key: Option<KeyResult>,
    pub tags: Option<TagsResult>,
}

impl AnalysisResult {
    pub fn into_detected_attributes(self) -> crate::domain::DetectedAttributes {
        let tags = self.tags.unwrap_or_default();
        crate::domain::DetectedAttributes {
            detected_bpm: self.bpm.as_ref().map(|b| b.value),
            detected_bpm_confidence: self.bpm.as_ref().map(|b| b.confidence),
            detected_key: self.key.as_ref().map(|k| k.value.clone()),
            detected_key_camelot: self.key.as_ref().map(|k| k.camelot.clone()),
            detected_key_confidence: self.key.as_ref().map(|k| k.confidence),
            detected_tags: tags.top_tags,
            detected_genres: tags.genres,
            detected_moods: tags.moods,
            detected_instruments: tags.instruments,
            has_vocals: tags.has_vocals,
            is_danceable: tags.is_danceable,
            arousal: tags.arousal,
            valence: tags.valence,
        }
    }
}

/// HTTP client for the audio analyser sidecar.
#[derive(Clone)]
pub struct AnalyserClient {
    http: reqwest::Client,
    base_url: String,
}

impl AnalyserClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    /// Submit raw audio bytes for analysis. Failure here is non-fatal to
    /// the audio processing pipeline - callers treat it as "no detected
    /// attributes" rather than failing the whole job.
    pub async fn analyse(&self, audio_bytes: &[u8], options: &AnalysisOptions) -> Result<AnalysisResult> {
        let url = format!("{}/analyse", self.base_url.trim_end_matches('/'));

        let response = self
            .http
            .post(&url)
            .query(&[
                ("bpm", options.bpm.to_string()),
                ("key", options.key.to_string()),
                ("tags", options.tags.to_string()),
            ])
            .body(audio_bytes.to_vec())
            .send()
            .await
            .map_err(Error::from)?;

        if !response.status().is_success() {
            return Err(Error::Upstream {
                service: "analyser".to_string(),
                message: format!("analyse returned {}", response.status()),
            });
        }

        response.json().await.map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_options_request_everything() {
        let options = AnalysisOptions::full();
        assert!(options.bpm && options.key && options.tags);
    }

    #[test]
    fn missing_facets_produce_none_detected_attributes() {
        let result = AnalysisResult::default();
        let detected = result.into_detected_attributes();
        assert!(detected.detected_bpm.is_none());
        assert!(detected.detected_key.is_none());
        assert!(detected.detected_tags.is_empty());
    }

    #[test]
    fn full_result_flattens_into_detected_attributes() {
        let result = AnalysisResult {
            bpm: Some(BpmResult { value: 128.0, confidence: 0.9 }),
            key: Some(KeyResult {
                value: "A minor".to_string(),
                camelot: "8A".to_string(),
                confidence: 0.8,
            }),
            tags: Some(TagsResult {
                top_tags: vec!["house".to_string()],
                genres: vec!["electronic".to_string()],
                moods: vec![],
                instruments: vec![],
                has_vocals: Some(false),
                is_danceable: Some(true),
                arousal: Some(0.6),
                valence: Some(0.7),
            }),
        };
        let detected = result.into_detected_attributes();
        assert_eq!(detected.detected_bpm, Some(128.0));
        assert_eq!(detected.detected_key_camelot.as_deref(), Some("8A"));
        assert_eq!(detected.detected_genres, vec!["electronic".to_string()]);
        assert_eq!(detected.is_danceable, Some(true));
    }
}

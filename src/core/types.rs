// Domain types shared by the resolver, the pipeline and the HTTP layer

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Canonical identity of a cached remedy: (label, language code)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemedyKey {
    pub label: String,
    pub language_code: String,
}

impl RemedyKey {
    pub fn new(label: impl Into<String>, language_code: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            language_code: language_code.into(),
        }
    }

    /// Cache document id, `"<label>::<languageCode>"` (exact, case-sensitive)
    pub fn document_id(&self) -> String {
        format!("{}::{}", self.label, self.language_code)
    }
}

impl std::fmt::Display for RemedyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}", self.label, self.language_code)
    }
}

/// Localized remedy for a pest or disease
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Remedy {
    pub diagnosis: String,
    pub causal_agent: String,
    pub treatments: Vec<String>,
    pub language_code: String,
    pub generated_at: DateTime<Utc>,
}

impl Remedy {
    /// No treatment steps; well-formed but not useful on its own
    pub fn is_degraded(&self) -> bool {
        self.treatments.is_empty()
    }
}

/// Which tier produced a remedy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTag {
    Cache,
    Generated,
    Fallback,
}

impl SourceTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTag::Cache => "cache",
            SourceTag::Generated => "generated",
            SourceTag::Fallback => "fallback",
        }
    }
}

impl std::fmt::Display for SourceTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one key resolution, shared verbatim with every coalesced waiter
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub remedy: Remedy,
    pub source: SourceTag,
}

/// Persisted form of a remedy (document id `"<label>::<languageCode>"`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub diagnosis: String,
    #[serde(default)]
    pub causal_agent: String,
    #[serde(default)]
    pub treatments: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl CacheEntry {
    pub fn from_remedy(remedy: &Remedy) -> Self {
        Self {
            diagnosis: remedy.diagnosis.clone(),
            causal_agent: remedy.causal_agent.clone(),
            treatments: remedy.treatments.clone(),
            language: Some(remedy.language_code.clone()),
            timestamp: Some(
                remedy
                    .generated_at
                    .to_rfc3339_opts(SecondsFormat::Millis, true),
            ),
            source: Some(SourceTag::Generated.as_str().to_string()),
        }
    }

    /// Decode a raw cache document for `key`.
    ///
    /// Returns the reason when the document is malformed: blank diagnosis,
    /// wrong field types, or a `language` field naming another language.
    pub fn decode(key: &RemedyKey, document: serde_json::Value) -> Result<Remedy, String> {
        let entry: CacheEntry =
            serde_json::from_value(document).map_err(|e| format!("undecodable document: {}", e))?;

        if entry.diagnosis.trim().is_empty() {
            return Err("missing diagnosis".to_string());
        }

        if let Some(language) = entry.language.as_deref() {
            if language != key.language_code {
                return Err(format!(
                    "language mismatch (document: {}, requested: {})",
                    language, key.language_code
                ));
            }
        }

        let generated_at = entry
            .timestamp
            .as_deref()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(Remedy {
            diagnosis: entry.diagnosis,
            causal_agent: entry.causal_agent,
            treatments: entry.treatments,
            language_code: key.language_code.clone(),
            generated_at,
        })
    }
}

/// Classifier output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub label: String,
    pub confidence: f32,
    pub index: usize,
}

/// Static description of a supported language
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LanguageDescriptor {
    pub code: &'static str,
    #[serde(rename = "name")]
    pub display_name: &'static str,
    /// Name in the language's own script, used to steer generation
    #[serde(skip)]
    pub native_name: &'static str,
}

/// Externally visible prediction result
#[derive(Debug, Clone, Serialize)]
#[serde(into = "PredictionBody")]
pub struct PredictionResult {
    pub prediction: Classification,
    pub recommendation: Remedy,
    pub language: LanguageDescriptor,
    pub source: SourceTag,
    pub predicted_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct PredictionBody {
    pub status: &'static str,
    pub prediction: PredictionView,
    pub recommendation: RecommendationView,
    pub language: LanguageDescriptor,
    pub source: SourceTag,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct PredictionView {
    pub label: String,
    pub confidence: f32,
    pub index: usize,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct RecommendationView {
    pub diagnosis: String,
    pub causal_agent: String,
    pub treatments: Vec<String>,
}

impl From<PredictionResult> for PredictionBody {
    fn from(result: PredictionResult) -> Self {
        let timestamp = result
            .predicted_at
            .to_rfc3339_opts(SecondsFormat::Millis, true);

        PredictionBody {
            status: "success",
            prediction: PredictionView {
                label: result.prediction.label,
                confidence: result.prediction.confidence,
                index: result.prediction.index,
                timestamp: timestamp.clone(),
            },
            recommendation: RecommendationView {
                diagnosis: result.recommendation.diagnosis,
                causal_agent: result.recommendation.causal_agent,
                treatments: result.recommendation.treatments,
            },
            language: result.language,
            source: result.source,
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_document_id_format() {
        let key = RemedyKey::new("Tomato___Early_blight", "ta");
        assert_eq!(key.document_id(), "Tomato___Early_blight::ta");

        // Case-sensitive, no normalization
        let upper = RemedyKey::new("tomato___early_blight", "TA");
        assert_ne!(key.document_id(), upper.document_id());
    }

    #[test]
    fn test_decode_well_formed_document() {
        let key = RemedyKey::new("Rice___Blast", "hi");
        let doc = json!({
            "diagnosis": "धान का ब्लास्ट रोग",
            "causal_agent": "Magnaporthe oryzae",
            "treatments": ["ट्राइसाइक्लाज़ोल का छिड़काव"],
            "language": "hi",
            "timestamp": "2025-06-10T19:30:00.000Z",
            "source": "generated"
        });

        let remedy = CacheEntry::decode(&key, doc).unwrap();
        assert_eq!(remedy.language_code, "hi");
        assert_eq!(remedy.treatments.len(), 1);
        assert_eq!(remedy.generated_at.to_rfc3339_opts(SecondsFormat::Millis, true), "2025-06-10T19:30:00.000Z");
    }

    #[test]
    fn test_decode_rejects_missing_or_blank_diagnosis() {
        let key = RemedyKey::new("Rice___Blast", "en");
        assert!(CacheEntry::decode(&key, json!({"treatments": ["x"]})).is_err());
        assert!(CacheEntry::decode(&key, json!({"diagnosis": "   "})).is_err());
        assert!(CacheEntry::decode(&key, json!({"diagnosis": 42})).is_err());
    }

    #[test]
    fn test_decode_rejects_language_mismatch() {
        let key = RemedyKey::new("Rice___Blast", "ta");
        let doc = json!({"diagnosis": "Blast", "language": "en"});
        assert!(CacheEntry::decode(&key, doc).is_err());
    }

    #[test]
    fn test_decode_tolerates_legacy_documents() {
        // Older documents carry only the three remedy fields
        let key = RemedyKey::new("Rice___Blast", "en");
        let remedy = CacheEntry::decode(&key, json!({"diagnosis": "Blast"})).unwrap();
        assert_eq!(remedy.causal_agent, "");
        assert!(remedy.is_degraded());
    }

    #[test]
    fn test_prediction_result_json_shape() {
        let result = PredictionResult {
            prediction: Classification {
                label: "Tomato___Late_blight".to_string(),
                confidence: 0.95,
                index: 3,
            },
            recommendation: Remedy {
                diagnosis: "Late blight".to_string(),
                causal_agent: "Phytophthora infestans".to_string(),
                treatments: vec!["Apply copper fungicide".to_string()],
                language_code: "en".to_string(),
                generated_at: Utc::now(),
            },
            language: LanguageDescriptor {
                code: "en",
                display_name: "English",
                native_name: "English",
            },
            source: SourceTag::Generated,
            predicted_at: Utc::now(),
        };

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"], "success");
        assert_eq!(value["source"], "generated");
        assert_eq!(value["prediction"]["index"], 3);
        assert_eq!(value["recommendation"]["causal_agent"], "Phytophthora infestans");
        assert_eq!(value["language"], json!({"code": "en", "name": "English"}));
        assert!(value["timestamp"].is_string());
    }
}

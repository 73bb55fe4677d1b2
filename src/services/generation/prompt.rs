// Prompt construction and response parsing for remedy generation

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::core::types::{LanguageDescriptor, Remedy};

/// Build the remedy prompt for a classifier label.
///
/// The language is named by its native name (e.g. `Tamil (தமிழ்)`) so the
/// model answers in the native script.
pub fn build_prompt(label: &str, language: &LanguageDescriptor) -> String {
    let language_name = language.native_name;

    format!(
        r#"You are an expert agricultural pathologist specializing in Indian farming practices.

Analyze this plant disease/pest: "{label}"

Answer ONLY in {language_name}, written in its native script. Do not mix in any other language except for scientific names and product names.

Structure the answer as:
1. DIAGNOSIS: the condition, its symptoms, and its impact on the crop
2. CAUSAL_AGENT: scientific name and type of pathogen/pest (fungus, bacteria, virus, insect, etc.)
3. TREATMENTS: 3-4 practical steps for Indian farmers covering:
   - local/organic remedies using common household items
   - chemical pesticides/fungicides available in Indian markets
   - preventive agricultural practices
   - cultural management techniques

Respond with a single valid JSON object with exactly these keys:
{{
    "diagnosis": "diagnosis in {language_name}",
    "causal_agent": "causal agent in {language_name}",
    "treatments": [
        "treatment 1 in {language_name}",
        "treatment 2 in {language_name}",
        "treatment 3 in {language_name}"
    ]
}}

Use simple, farmer-friendly language and prefer cost-effective options for small-scale farmers."#
    )
}

#[derive(Debug, Deserialize)]
struct GeneratedRemedy {
    diagnosis: String,
    #[serde(default)]
    causal_agent: String,
    #[serde(default)]
    treatments: Vec<String>,
}

/// Parse generated text into a remedy for `language_code`.
///
/// Accepts a bare JSON object or one wrapped in a markdown code fence. Fails
/// when the text is not such an object or the diagnosis is blank.
pub fn parse_remedy(
    text: &str,
    language_code: &str,
    generated_at: DateTime<Utc>,
) -> Result<Remedy, String> {
    let body = strip_code_fence(text);

    let parsed: GeneratedRemedy =
        serde_json::from_str(body).map_err(|e| format!("response is not a remedy object: {}", e))?;

    let diagnosis = parsed.diagnosis.trim().to_string();
    if diagnosis.is_empty() {
        return Err("empty diagnosis".to_string());
    }

    let treatments = parsed
        .treatments
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();

    Ok(Remedy {
        diagnosis,
        causal_agent: parsed.causal_agent.trim().to_string(),
        treatments,
        language_code: language_code.to_string(),
        generated_at,
    })
}

fn strip_code_fence(text: &str) -> &str {
    let mut body = text.trim();
    if let Some(rest) = body.strip_prefix("```json") {
        body = rest;
    } else if let Some(rest) = body.strip_prefix("```") {
        body = rest;
    }
    if let Some(rest) = body.strip_suffix("```") {
        body = rest;
    }
    body.trim()
}

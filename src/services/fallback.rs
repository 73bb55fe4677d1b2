// Static, label-agnostic remedies served when neither the cache nor the
// generation backend produced an answer.

use chrono::Utc;

use crate::core::types::Remedy;

const LABEL_PLACEHOLDER: &str = "{label}";

/// Per-language fallback text. `diagnosis` may contain `{label}`.
struct FallbackTemplate {
    language_code: &'static str,
    diagnosis: &'static str,
    causal_agent: &'static str,
    treatments: &'static [&'static str],
}

const ENGLISH: FallbackTemplate = FallbackTemplate {
    language_code: "en",
    diagnosis: "Plant condition identified as {label}. Please consult with local agricultural extension officer for detailed diagnosis.",
    causal_agent: "Requires professional diagnosis",
    treatments: &[
        "Consult local agricultural extension officer",
        "Take sample to nearest Krishi Vigyan Kendra (KVK)",
        "Contact helpline: 1800-180-1551 (Kisan Call Centre)",
        "Maintain proper field hygiene and crop rotation",
    ],
};

static TEMPLATES: &[FallbackTemplate] = &[
    ENGLISH,
    FallbackTemplate {
        language_code: "hi",
        diagnosis: "पौधे की स्थिति {label} के रूप में पहचानी गई। विस्तृत निदान के लिए स्थानीय कृषि विस्तार अधिकारी से सलाह लें।",
        causal_agent: "व्यावसायिक निदान की आवश्यकता",
        treatments: &[
            "स्थानीय कृषि विस्तार अधिकारी से सलाह लें",
            "निकटतम कृषि विज्ञान केन्द्र (KVK) में नमूना ले जाएं",
            "हेल्पलाइन संपर्क करें: 1800-180-1551 (किसान कॉल सेंटर)",
            "उचित खेत स्वच्छता और फसल चक्र बनाए रखें",
        ],
    },
    FallbackTemplate {
        language_code: "ta",
        diagnosis: "தாவர நிலை {label} என அடையாளம் காணப்பட்டுள்ளது. விரிவான நோயறிதலுக்கு உள்ளூர் விவசாய விரிவாக்க அதிகாரியுடன் கலந்தாலோசிக்கவும்.",
        causal_agent: "தொழில்முறை நோயறிதல் தேவை",
        treatments: &[
            "உள்ளூர் விவசாய விரிவாக்க அதிகாரியுடன் கலந்தாலோசிக்கவும்",
            "அருகிலுள்ள கிருஷி விஞ்ஞான் கேந்திராவிற்கு (KVK) மாதிரி எடுத்துச் செல்லுங்கள்",
            "உதவி எண்ணை தொடர்பு கொள்ளுங்கள்: 1800-180-1551 (கிசான் கால் சென்டர்)",
            "சரியான வயல் சுகாதாரம் மற்றும் பயிர் சுழற்சியை பராமரிக்கவும்",
        ],
    },
];

/// Language-aware default remedies. Total: never fails, never empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct FallbackCatalog;

impl FallbackCatalog {
    /// Fallback remedy for `label` in `language_code`.
    ///
    /// Languages without a bespoke template get the English text, still
    /// tagged with the requested language code.
    pub fn get(&self, label: &str, language_code: &str) -> Remedy {
        let template = TEMPLATES
            .iter()
            .find(|t| t.language_code == language_code)
            .unwrap_or(&ENGLISH);

        Remedy {
            diagnosis: template.diagnosis.replace(LABEL_PLACEHOLDER, label),
            causal_agent: template.causal_agent.to_string(),
            treatments: template.treatments.iter().map(|t| t.to_string()).collect(),
            language_code: language_code.to_string(),
            generated_at: Utc::now(),
        }
    }

    /// Whether `language_code` has its own localized template
    pub fn has_localized(&self, language_code: &str) -> bool {
        TEMPLATES.iter().any(|t| t.language_code == language_code)
    }
}

// Supported languages for recommendations
//
// The table order is the canonical listing order.

use crate::core::errors::LanguageError;
use crate::core::types::LanguageDescriptor;

const fn lang(
    code: &'static str,
    display_name: &'static str,
    native_name: &'static str,
) -> LanguageDescriptor {
    LanguageDescriptor {
        code,
        display_name,
        native_name,
    }
}

static LANGUAGES: [LanguageDescriptor; 12] = [
    lang("en", "English", "English"),
    lang("hi", "Hindi", "Hindi (हिन्दी)"),
    lang("ta", "Tamil", "Tamil (தமிழ்)"),
    lang("te", "Telugu", "Telugu (తెలుగు)"),
    lang("kn", "Kannada", "Kannada (ಕನ್ನಡ)"),
    lang("ml", "Malayalam", "Malayalam (മലയാളം)"),
    lang("mr", "Marathi", "Marathi (मराठी)"),
    lang("gu", "Gujarati", "Gujarati (ગુજરાતી)"),
    lang("bn", "Bengali", "Bengali (বাংলা)"),
    lang("pa", "Punjabi", "Punjabi (ਪੰਜਾਬੀ)"),
    lang("or", "Odia", "Odia (ଓଡ଼ିଆ)"),
    lang("as", "Assamese", "Assamese (অসমীয়া)"),
];

/// Default language for requests that do not name one
pub const DEFAULT_LANGUAGE: &str = "en";

/// Static catalog of the supported language codes
#[derive(Debug, Clone, Copy, Default)]
pub struct LanguageCatalog;

impl LanguageCatalog {
    pub fn is_supported(&self, code: &str) -> bool {
        LANGUAGES.iter().any(|l| l.code == code)
    }

    pub fn describe(&self, code: &str) -> Result<LanguageDescriptor, LanguageError> {
        LANGUAGES
            .iter()
            .find(|l| l.code == code)
            .copied()
            .ok_or_else(|| LanguageError::UnknownLanguage(code.to_string()))
    }

    pub fn list_all(&self) -> &'static [LanguageDescriptor] {
        &LANGUAGES
    }

    /// Comma-separated codes, for error messages
    pub fn supported_codes(&self) -> String {
        LANGUAGES
            .iter()
            .map(|l| l.code)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

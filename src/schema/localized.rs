use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Text in several locales, e.g. `{"_base": "en", "en": "Name", "fr": "Nom"}`.
///
/// `_base` names the locale the text was originally written in.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalizedString(pub IndexMap<String, String>);

impl LocalizedString {
    /// Single-locale string with base locale `en`
    pub fn new(text: impl Into<String>) -> Self {
        let mut map = IndexMap::new();
        map.insert("_base".to_string(), "en".to_string());
        map.insert("en".to_string(), text.into());
        Self(map)
    }

    /// Text for `locale`, falling back to the base locale, then `en`, then
    /// whatever is present.
    pub fn localize(&self, locale: Option<&str>) -> &str {
        let base = self.0.get("_base").map(String::as_str);
        [locale, base, Some("en")]
            .into_iter()
            .flatten()
            .find_map(|l| self.0.get(l).filter(|_| l != "_base"))
            .or_else(|| {
                self.0
                    .iter()
                    .find(|(k, _)| k.as_str() != "_base")
                    .map(|(_, v)| v)
            })
            .map(String::as_str)
            .unwrap_or("")
    }
}

impl From<&str> for LocalizedString {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_localize_fallbacks() {
        let s: LocalizedString =
            serde_json::from_value(json!({ "_base": "fr", "fr": "Nom", "en": "Name" })).unwrap();
        assert_eq!(s.localize(Some("en")), "Name");
        assert_eq!(s.localize(Some("es")), "Nom");
        assert_eq!(s.localize(None), "Nom");

        let s: LocalizedString = serde_json::from_value(json!({ "es": "Nombre" })).unwrap();
        assert_eq!(s.localize(Some("en")), "Nombre");
        assert_eq!(LocalizedString::default().localize(None), "");
    }
}

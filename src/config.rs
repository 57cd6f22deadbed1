//! Control configuration state.
//!
//! Every field is typed; the string-keyed attribute view exists for the host
//! framework, which stores and syncs attributes as text.

use crate::errors::{GeminiControlError, Result};
use crate::types::{ControlOptions, GenerationConfig, SafetySetting};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

pub const ATTR_API_KEY: &str = "api_key";
pub const ATTR_PROMPT: &str = "prompt";
pub const ATTR_VALUE: &str = "value";
pub const ATTR_MODEL: &str = "model";
pub const ATTR_SHOW_RESPONSE: &str = "show_response";
pub const ATTR_GENERATION_CONFIG: &str = "generation_config";
pub const ATTR_SAFETY_SETTINGS: &str = "safety_settings";
pub const ATTR_SYSTEM_PROMPT: &str = "system_prompt";
pub const ATTR_RESPONSE: &str = "response";

/// Attributes the host may write.
pub const WRITABLE_ATTRIBUTES: &[&str] = &[
    ATTR_API_KEY,
    ATTR_PROMPT,
    ATTR_VALUE,
    ATTR_MODEL,
    ATTR_SHOW_RESPONSE,
    ATTR_GENERATION_CONFIG,
    ATTR_SAFETY_SETTINGS,
    ATTR_SYSTEM_PROMPT,
];

/// A JSON-valued attribute, always held as text.
///
/// Structured values are serialized once when set; strings are kept verbatim
/// and never validated, so reading back returns exactly what was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonAttr(String);

impl JsonAttr {
    pub fn from_value<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self(serde_json::to_string(value)?))
    }

    pub fn from_text(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

/// Value handed to [`ControlState::set_attr`].
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Text(String),
    Bool(bool),
    Json(serde_json::Value),
}

impl AttrValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttrValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Wire form used when syncing with the host.
    pub fn to_wire(&self) -> String {
        match self {
            AttrValue::Text(s) => s.clone(),
            AttrValue::Bool(b) => b.to_string(),
            AttrValue::Json(v) => v.to_string(),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Text(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::Text(value)
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::Bool(value)
    }
}

impl From<serde_json::Value> for AttrValue {
    fn from(value: serde_json::Value) -> Self {
        AttrValue::Json(value)
    }
}

/// Configuration snapshot of one control.
#[derive(Debug, Clone, Default)]
pub struct ControlState {
    api_key: Option<String>,
    prompt: Option<String>,
    value: Option<String>,
    model: Option<String>,
    show_response: Option<bool>,
    generation_config: Option<JsonAttr>,
    safety_settings: Option<JsonAttr>,
    system_prompt: Option<String>,
    response: Option<String>,
    dirty: BTreeSet<&'static str>,
}

impl ControlState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the initial state. Only values actually provided count as
    /// unsynced, so absent ones never clear what the backend already has.
    pub fn from_options(options: &ControlOptions) -> Result<Self> {
        let mut state = Self::new();
        if let Some(api_key) = &options.api_key {
            state.set_api_key(Some(api_key.clone()));
        }
        if let Some(prompt) = &options.prompt {
            state.set_prompt(Some(prompt.clone()));
        }
        if let Some(value) = &options.value {
            state.set_value(Some(value.clone()));
        }
        if let Some(model) = &options.model {
            state.set_model(Some(model.clone()));
        }
        state.set_show_response(Some(options.show_response.unwrap_or(true)));
        if let Some(config) = &options.generation_config {
            state.set_generation_config(config)?;
        }
        if let Some(settings) = &options.safety_settings {
            state.set_safety_settings(settings)?;
        }
        if let Some(system_prompt) = &options.system_prompt {
            state.set_system_prompt(Some(system_prompt.clone()));
        }
        Ok(state)
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    pub fn set_api_key(&mut self, api_key: Option<String>) {
        self.api_key = api_key;
        self.mark(ATTR_API_KEY);
    }

    pub fn prompt(&self) -> Option<&str> {
        self.prompt.as_deref()
    }

    pub fn set_prompt(&mut self, prompt: Option<String>) {
        self.prompt = prompt;
        self.mark(ATTR_PROMPT);
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    pub fn set_value(&mut self, value: Option<String>) {
        self.value = value;
        self.mark(ATTR_VALUE);
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn set_model(&mut self, model: Option<String>) {
        self.model = model;
        self.mark(ATTR_MODEL);
    }

    pub fn show_response(&self) -> Option<bool> {
        self.show_response
    }

    pub fn set_show_response(&mut self, show_response: Option<bool>) {
        self.show_response = show_response;
        self.mark(ATTR_SHOW_RESPONSE);
    }

    /// Stored JSON text; parsing it back is up to the caller.
    pub fn generation_config(&self) -> Option<&str> {
        self.generation_config.as_ref().map(JsonAttr::as_str)
    }

    pub fn set_generation_config(&mut self, config: &GenerationConfig) -> Result<()> {
        self.set_generation_config_json(Some(JsonAttr::from_value(config)?));
        Ok(())
    }

    pub fn set_generation_config_json(&mut self, config: Option<JsonAttr>) {
        self.generation_config = config;
        self.mark(ATTR_GENERATION_CONFIG);
    }

    pub fn safety_settings(&self) -> Option<&str> {
        self.safety_settings.as_ref().map(JsonAttr::as_str)
    }

    pub fn set_safety_settings(&mut self, settings: &[SafetySetting]) -> Result<()> {
        self.set_safety_settings_json(Some(JsonAttr::from_value(&settings)?));
        Ok(())
    }

    pub fn set_safety_settings_json(&mut self, settings: Option<JsonAttr>) {
        self.safety_settings = settings;
        self.mark(ATTR_SAFETY_SETTINGS);
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    pub fn set_system_prompt(&mut self, system_prompt: Option<String>) {
        self.system_prompt = system_prompt;
        self.mark(ATTR_SYSTEM_PROMPT);
    }

    /// Latest response pushed by the backend.
    pub fn response(&self) -> Option<&str> {
        self.response.as_deref()
    }

    /// Backend-side update; not synced back.
    pub(crate) fn record_response(&mut self, response: String) {
        self.response = Some(response);
    }

    /// Reads an attribute by its host-facing name.
    pub fn get_attr(&self, name: &str) -> Result<Option<AttrValue>> {
        let text = |v: &Option<String>| v.clone().map(AttrValue::Text);
        let value = match name {
            ATTR_API_KEY => text(&self.api_key),
            ATTR_PROMPT => text(&self.prompt),
            ATTR_VALUE => text(&self.value),
            ATTR_MODEL => text(&self.model),
            ATTR_SHOW_RESPONSE => self.show_response.map(AttrValue::Bool),
            ATTR_GENERATION_CONFIG => self
                .generation_config
                .as_ref()
                .map(|j| AttrValue::Text(j.as_str().to_string())),
            ATTR_SAFETY_SETTINGS => self
                .safety_settings
                .as_ref()
                .map(|j| AttrValue::Text(j.as_str().to_string())),
            ATTR_SYSTEM_PROMPT => text(&self.system_prompt),
            ATTR_RESPONSE => text(&self.response),
            _ => return Err(unknown_attr(name)),
        };
        Ok(value)
    }

    /// Writes an attribute by its host-facing name. `None` clears it.
    ///
    /// JSON attributes serialize non-string values and keep strings as-is.
    /// Plain attributes take their natural type only.
    pub fn set_attr(&mut self, name: &str, value: Option<AttrValue>) -> Result<()> {
        match name {
            ATTR_GENERATION_CONFIG => {
                self.set_generation_config_json(value.map(json_attr).transpose()?)
            }
            ATTR_SAFETY_SETTINGS => {
                self.set_safety_settings_json(value.map(json_attr).transpose()?)
            }
            ATTR_SHOW_RESPONSE => {
                let flag = match value {
                    None => None,
                    Some(AttrValue::Bool(b)) => Some(b),
                    Some(other) => return Err(type_mismatch(name, "a boolean", &other)),
                };
                self.set_show_response(flag);
            }
            ATTR_RESPONSE => {
                return Err(GeminiControlError::validation(
                    "response is read-only",
                    Some(ATTR_RESPONSE),
                ));
            }
            ATTR_API_KEY | ATTR_PROMPT | ATTR_VALUE | ATTR_MODEL | ATTR_SYSTEM_PROMPT => {
                let text = match value {
                    None => None,
                    Some(AttrValue::Text(s)) => Some(s),
                    Some(other) => return Err(type_mismatch(name, "a string", &other)),
                };
                match name {
                    ATTR_API_KEY => self.set_api_key(text),
                    ATTR_PROMPT => self.set_prompt(text),
                    ATTR_VALUE => self.set_value(text),
                    ATTR_MODEL => self.set_model(text),
                    _ => self.set_system_prompt(text),
                }
            }
            _ => return Err(unknown_attr(name)),
        }
        Ok(())
    }

    /// Full wire snapshot of the writable attributes.
    pub fn attributes(&self) -> BTreeMap<String, Option<String>> {
        WRITABLE_ATTRIBUTES
            .iter()
            .map(|name| (name.to_string(), self.wire_value(name)))
            .collect()
    }

    /// Attributes changed since the last call, in wire form.
    pub fn take_dirty(&mut self) -> BTreeMap<String, Option<String>> {
        let dirty = std::mem::take(&mut self.dirty);
        dirty
            .into_iter()
            .map(|name| (name.to_string(), self.wire_value(name)))
            .collect()
    }

    /// Marks attributes unsynced again after a failed sync.
    pub(crate) fn mark_unsynced<'a>(&mut self, names: impl IntoIterator<Item = &'a str>) {
        for name in names {
            if let Some(known) = WRITABLE_ATTRIBUTES.iter().find(|known| **known == name) {
                self.mark(*known);
            }
        }
    }

    fn wire_value(&self, name: &str) -> Option<String> {
        self.get_attr(name)
            .ok()
            .flatten()
            .map(|value| value.to_wire())
    }

    fn mark(&mut self, name: &'static str) {
        self.dirty.insert(name);
    }
}

fn json_attr(value: AttrValue) -> Result<JsonAttr> {
    match value {
        AttrValue::Text(s) => Ok(JsonAttr::from_text(s)),
        AttrValue::Bool(b) => JsonAttr::from_value(&b),
        AttrValue::Json(v) => JsonAttr::from_value(&v),
    }
}

fn unknown_attr(name: &str) -> GeminiControlError {
    GeminiControlError::validation(format!("Unknown attribute: {}", name), Some(name))
}

fn type_mismatch(name: &str, expected: &str, got: &AttrValue) -> GeminiControlError {
    GeminiControlError::validation(
        format!("{} expects {}, got {:?}", name, expected, got),
        Some(name),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SafetyCategory, SafetyThreshold};
    use serde_json::{json, Value};

    fn read_json(state: &ControlState, name: &str) -> Value {
        let text = state.get_attr(name).unwrap().unwrap();
        serde_json::from_str(text.as_text().unwrap()).unwrap()
    }

    #[test]
    fn test_structured_values_are_stored_as_json() {
        let mut state = ControlState::new();
        let config = json!({
            "temperature": 0.7,
            "topK": 40,
            "topP": 0.95,
            "maxOutputTokens": 1024,
            "stopSequences": ["STOP"]
        });
        let settings = json!([
            {"category": "harassment", "threshold": "block_medium_and_above"},
            {"category": "hate_speech", "threshold": "block_none"}
        ]);

        state
            .set_attr(ATTR_GENERATION_CONFIG, Some(config.clone().into()))
            .unwrap();
        state
            .set_attr(ATTR_SAFETY_SETTINGS, Some(settings.clone().into()))
            .unwrap();

        assert_eq!(read_json(&state, ATTR_GENERATION_CONFIG), config);
        assert_eq!(read_json(&state, ATTR_SAFETY_SETTINGS), settings);
    }

    #[test]
    fn test_string_values_are_stored_verbatim() {
        let mut state = ControlState::new();
        let raw = r#"{"temperature": 0.2,   "topK": 3}"#;
        state.set_attr(ATTR_GENERATION_CONFIG, Some(raw.into())).unwrap();
        assert_eq!(state.generation_config(), Some(raw));

        // not validated either
        state
            .set_attr(ATTR_SAFETY_SETTINGS, Some("not json".into()))
            .unwrap();
        assert_eq!(state.safety_settings(), Some("not json"));
    }

    #[test]
    fn test_typed_setters_match_wire_shape() {
        let mut state = ControlState::new();
        state
            .set_safety_settings(&[SafetySetting::new(
                SafetyCategory::Harassment,
                SafetyThreshold::BlockOnlyHigh,
            )])
            .unwrap();
        assert_eq!(
            state.safety_settings(),
            Some(r#"[{"category":"harassment","threshold":"block_only_high"}]"#)
        );

        let config = GenerationConfig {
            temperature: Some(0.5),
            max_output_tokens: Some(64),
            ..Default::default()
        };
        state.set_generation_config(&config).unwrap();
        let back: GenerationConfig =
            serde_json::from_str(state.generation_config().unwrap()).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_response_is_read_only() {
        let mut state = ControlState::new();
        let err = state
            .set_attr(ATTR_RESPONSE, Some("forged".into()))
            .unwrap_err();
        assert!(matches!(err, GeminiControlError::Validation { .. }));

        state.record_response("real".to_string());
        assert_eq!(
            state.get_attr(ATTR_RESPONSE).unwrap(),
            Some(AttrValue::Text("real".to_string()))
        );
    }

    #[test]
    fn test_unknown_and_mistyped_attributes() {
        let mut state = ControlState::new();
        assert!(state.get_attr("colour").is_err());
        assert!(state.set_attr("colour", Some("red".into())).is_err());
        assert!(state.set_attr(ATTR_SHOW_RESPONSE, Some("yes".into())).is_err());
        assert!(state.set_attr(ATTR_MODEL, Some(true.into())).is_err());
    }

    #[test]
    fn test_dirty_tracking() {
        let mut state = ControlState::from_options(&ControlOptions {
            api_key: Some("KEY".to_string()),
            ..Default::default()
        })
        .unwrap();

        let first = state.take_dirty();
        assert_eq!(first.len(), 2);
        assert_eq!(first.get(ATTR_API_KEY), Some(&Some("KEY".to_string())));
        assert_eq!(first.get(ATTR_SHOW_RESPONSE), Some(&Some("true".to_string())));
        assert!(state.take_dirty().is_empty());

        state.set_attr(ATTR_MODEL, Some("gemini-2.0-flash".into())).unwrap();
        state.set_attr(ATTR_API_KEY, None).unwrap();
        let second = state.take_dirty();
        assert_eq!(second.len(), 2);
        assert_eq!(second.get(ATTR_API_KEY), Some(&None));
        assert_eq!(
            second.get(ATTR_MODEL),
            Some(&Some("gemini-2.0-flash".to_string()))
        );
    }

    #[test]
    fn test_absent_options_are_not_synced() {
        let mut state = ControlState::from_options(&ControlOptions::default()).unwrap();
        let dirty = state.take_dirty();
        assert!(!dirty.contains_key(ATTR_API_KEY));
        assert!(!dirty.contains_key(ATTR_MODEL));
        assert_eq!(dirty.len(), 1);
    }

    #[test]
    fn test_mark_unsynced_restores_known_names() {
        let mut state = ControlState::new();
        state.set_model(Some("m1".to_string()));
        let taken = state.take_dirty();

        state.mark_unsynced(taken.keys().map(String::as_str).chain(["colour"]));
        let again = state.take_dirty();
        assert_eq!(again.len(), 1);
        assert_eq!(again.get(ATTR_MODEL), Some(&Some("m1".to_string())));
    }

    #[test]
    fn test_attributes_snapshot() {
        let state = ControlState::new();
        let attrs = state.attributes();
        assert_eq!(attrs.len(), WRITABLE_ATTRIBUTES.len());
        assert!(!attrs.contains_key(ATTR_RESPONSE));
        assert!(attrs.values().all(Option::is_none));
    }
}

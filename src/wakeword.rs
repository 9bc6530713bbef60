//! Text-level wake phrase gating for the always-listening variant.
//!
//! The gate matches live transcript text against a target phrase and its
//! known phonetic confusions, then commits the utterance after a period with
//! no new partial transcripts.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use strum::{Display, EnumString};
use tokio::time::Instant;

use crate::config::ConfigError;

/// Match must begin within this many characters under `Medium`
pub const MEDIUM_LEAD_IN_CHARS: usize = 20;

static DEFAULT_VARIANTS: Lazy<HashMap<String, Vec<String>>> = Lazy::new(|| {
    let table: &[(&str, &[&str])] = &[
        ("eve", &["evie", "eave", "eeve", "heave", "evening"]),
        ("jarvis", &["harvest", "service", "jervis", "travis", "drivers"]),
        ("computer", &["computor", "commuter"]),
        ("system", &["cistem", "cistern"]),
    ];
    table
        .iter()
        .map(|(phrase, variants)| {
            (
                phrase.to_string(),
                variants.iter().map(|v| v.to_string()).collect(),
            )
        })
        .collect()
});

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Sensitivity {
    /// Phrase may appear anywhere
    Low,
    /// Phrase must start within the first `MEDIUM_LEAD_IN_CHARS` characters
    #[default]
    Medium,
    /// Phrase must be the very first token group
    High,
}

impl Sensitivity {
    pub fn accepts_offset(self, char_offset: usize) -> bool {
        match self {
            Sensitivity::High => char_offset == 0,
            Sensitivity::Medium => char_offset < MEDIUM_LEAD_IN_CHARS,
            Sensitivity::Low => true,
        }
    }
}

/// Canonical phrase -> phonetic variants. Plain data, loadable from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariantTable(HashMap<String, Vec<String>>);

impl Default for VariantTable {
    fn default() -> Self {
        VariantTable(DEFAULT_VARIANTS.clone())
    }
}

impl VariantTable {
    pub fn empty() -> Self {
        VariantTable(HashMap::new())
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let raw: HashMap<String, Vec<String>> = serde_json::from_str(&text)?;
        Ok(VariantTable(
            raw.into_iter()
                .map(|(k, v)| (k.to_lowercase(), v))
                .collect(),
        ))
    }

    pub fn variants_for(&self, phrase: &str) -> &[String] {
        self.0
            .get(&phrase.trim().to_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn insert(&mut self, phrase: &str, variants: Vec<String>) {
        self.0.insert(phrase.trim().to_lowercase(), variants);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WakeWordConfig {
    pub phrase: String,
    pub sensitivity: Sensitivity,
    /// Silence after the last partial transcript before the utterance commits
    pub silence_commit_ms: u64,
    /// JSON variant table replacing the built-in one
    pub variants_file: Option<PathBuf>,
}

impl Default for WakeWordConfig {
    fn default() -> Self {
        Self {
            phrase: "Eve".to_string(),
            sensitivity: Sensitivity::Medium,
            silence_commit_ms: 1500,
            variants_file: None,
        }
    }
}

impl WakeWordConfig {
    pub fn variant_table(&self) -> Result<VariantTable, ConfigError> {
        match &self.variants_file {
            Some(path) => VariantTable::from_file(path),
            None => Ok(VariantTable::default()),
        }
    }
}

/// What a partial transcript did to the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateAction {
    /// Dormant and no wake phrase found
    Ignored,
    /// Wake phrase found; the gate is now collecting the utterance
    Activated,
    /// Already active; the silence timer was refreshed
    Extended,
}

pub struct WakeWordGate {
    pattern: Regex,
    variant_count: usize,
    sensitivity: Sensitivity,
    silence_commit: Duration,
    active: bool,
    utterance: String,
    deadline: Option<Instant>,
}

impl WakeWordGate {
    pub fn new(config: &WakeWordConfig, variants: &VariantTable) -> Result<Self, ConfigError> {
        let phrase = config.phrase.trim();
        if phrase.is_empty() {
            return Err(ConfigError::Invalid("wake phrase cannot be empty".to_string()));
        }

        let mut alternatives: Vec<String> = std::iter::once(phrase.to_lowercase())
            .chain(variants.variants_for(phrase).iter().map(|v| v.to_lowercase()))
            .filter(|v| !v.trim().is_empty())
            .collect();
        // longest first so the regex prefers the fullest match; ties sorted
        // so equal variants sit together for dedup
        alternatives.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        alternatives.dedup();
        let variant_count = alternatives.len().saturating_sub(1);

        let body = alternatives
            .iter()
            .map(|alt| {
                alt.split_whitespace()
                    .map(regex::escape)
                    .collect::<Vec<_>>()
                    .join(r"\s+")
            })
            .collect::<Vec<_>>()
            .join("|");

        let pattern = RegexBuilder::new(&format!(r"\b(?:{})\b", body))
            .case_insensitive(true)
            .build()
            .map_err(|e| ConfigError::Invalid(format!("wake phrase pattern: {}", e)))?;

        log::info!(
            "WakeWord: Target '{}' with {} variant(s), sensitivity {}",
            phrase,
            variant_count,
            config.sensitivity
        );

        Ok(Self {
            pattern,
            variant_count,
            sensitivity: config.sensitivity,
            silence_commit: Duration::from_millis(config.silence_commit_ms),
            active: false,
            utterance: String::new(),
            deadline: None,
        })
    }

    /// Does `candidate` contain the wake phrase at an accepted position?
    pub fn test(&self, candidate: &str) -> bool {
        let text = candidate.trim_start();
        match self.pattern.find(text) {
            Some(m) => {
                let offset = text[..m.start()].chars().count();
                self.sensitivity.accepts_offset(offset)
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Distinct alternatives besides the phrase itself
    pub fn variant_count(&self) -> usize {
        self.variant_count
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Feed the accumulated transcript of the current utterance.
    pub fn on_partial(&mut self, text: &str, now: Instant) -> GateAction {
        if !self.active {
            if !self.test(text) {
                return GateAction::Ignored;
            }
            log::info!("WakeWord: Wake phrase detected in '{}'", text.trim());
            self.active = true;
            self.utterance = text.trim().to_string();
            self.deadline = Some(now + self.silence_commit);
            return GateAction::Activated;
        }

        self.utterance = text.trim().to_string();
        self.deadline = Some(now + self.silence_commit);
        GateAction::Extended
    }

    /// Commit the utterance if the silence timer has expired. The gate
    /// returns to dormant listening either way once the timer fires.
    pub fn poll_commit(&mut self, now: Instant) -> Option<String> {
        match self.deadline {
            Some(deadline) if self.active && now >= deadline => {
                let utterance = std::mem::take(&mut self.utterance);
                self.reset();
                if utterance.is_empty() {
                    None
                } else {
                    log::info!("WakeWord: Committing utterance '{}'", utterance);
                    Some(utterance)
                }
            }
            _ => None,
        }
    }

    pub fn reset(&mut self) {
        self.active = false;
        self.utterance.clear();
        self.deadline = None;
    }
}

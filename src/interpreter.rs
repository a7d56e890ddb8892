//! Chat message classification.

use regex::RegexSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Damage,
    Heal,
    Ignore,
}

/// Classifies a chat message as damage, heal, or noise. Pure: no state beyond
/// the compiled keyword sets.
///
/// A message matching both a trigger and a heal keyword is ignored, and
/// multiple occurrences of a keyword still count as a single unit of effect.
pub struct Interpreter {
    triggers: RegexSet,
    heals: RegexSet,
}

impl Interpreter {
    /// Build from the comma-separated keyword lists given at boot.
    pub fn new(trigger_csv: &str, heal_csv: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            triggers: build_set(trigger_csv)?,
            heals: build_set(heal_csv)?,
        })
    }

    pub fn classify(&self, message: &str) -> Effect {
        let has_hit = self.triggers.is_match(message);
        let has_heal = self.heals.is_match(message);
        match (has_hit, has_heal) {
            (true, false) => Effect::Damage,
            (false, true) => Effect::Heal,
            _ => Effect::Ignore,
        }
    }
}

/// Case-insensitive substring matchers, one pattern per keyword.
/// `regex::escape` handles keywords containing `.*+?^${}()|[]\`.
fn build_set(csv: &str) -> Result<RegexSet, regex::Error> {
    let patterns: Vec<String> = csv
        .split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(|k| format!("(?i){}", regex::escape(k)))
        .collect();
    RegexSet::new(patterns)
}

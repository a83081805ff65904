//! Judge selection: provider families and same-family exclusion.
//!
//! A judge never scores summaries produced by its own provider family.
//! Family membership is a closed substring table over model identifiers.

use crate::errors::SelectorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelFamily {
    Anthropic,
    OpenAi,
    Google,
    Meta,
    Mistral,
    Unknown,
}

impl ModelFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
            Self::Google => "google",
            Self::Meta => "meta",
            Self::Mistral => "mistral",
            Self::Unknown => "unknown",
        }
    }
}

/// Substring table mapping model-id fragments to provider families.
/// First match wins, so more specific fragments come first.
const FAMILY_TABLE: &[(&str, ModelFamily)] = &[
    ("claude", ModelFamily::Anthropic),
    ("anthropic", ModelFamily::Anthropic),
    ("gpt", ModelFamily::OpenAi),
    ("o1-", ModelFamily::OpenAi),
    ("o3-", ModelFamily::OpenAi),
    ("o4-", ModelFamily::OpenAi),
    ("davinci", ModelFamily::OpenAi),
    ("gemini", ModelFamily::Google),
    ("gemma", ModelFamily::Google),
    ("bison", ModelFamily::Google),
    ("llama", ModelFamily::Meta),
    ("mixtral", ModelFamily::Mistral),
    ("mistral", ModelFamily::Mistral),
    ("codestral", ModelFamily::Mistral),
];

pub fn family_of(model_id: &str) -> ModelFamily {
    let id = model_id.to_ascii_lowercase();
    for (fragment, family) in FAMILY_TABLE {
        if id.contains(fragment) {
            return *family;
        }
    }
    ModelFamily::Unknown
}

/// Judges eligible to score `generator`'s output: same-family judges are
/// excluded (unknown families are never treated as matching), and the
/// survivors are ordered family-diverse: one judge per family first,
/// then the rest in their original order.
pub fn select_judges(
    generator: &str,
    available: &[String],
    min_judges: usize,
) -> Result<Vec<String>, SelectorError> {
    let generator_family = family_of(generator);

    let eligible: Vec<&String> = available
        .iter()
        .filter(|judge| {
            let family = family_of(judge);
            family == ModelFamily::Unknown || family != generator_family
        })
        .collect();

    if eligible.len() < min_judges {
        return Err(SelectorError::InsufficientJudges {
            generator: generator.to_string(),
            needed: min_judges,
            available: eligible.len(),
        });
    }

    let mut seen_families = Vec::new();
    let mut picked: Vec<String> = Vec::with_capacity(eligible.len());
    let mut rest: Vec<String> = Vec::new();
    for judge in &eligible {
        let family = family_of(judge);
        if family != ModelFamily::Unknown && seen_families.contains(&family) {
            rest.push((*judge).clone());
        } else {
            seen_families.push(family);
            picked.push((*judge).clone());
        }
    }
    picked.extend(rest);
    Ok(picked)
}

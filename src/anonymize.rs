//! Opaque, run-stable tokens standing in for model identities.
//!
//! Four namespaces are numbered independently: maker, base model, system
//! prompt variant and temperature. Distinct values in each namespace are
//! sorted and enumerated, so the same real value always gets the same token
//! within a run regardless of which effective ids it appears in.

use crate::model_id::{IDEAL_MODEL_ID, parse_effective_model_id, resolve_maker};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

/// Maker token for ids whose provider cannot be resolved
pub const UNKNOWN_MAKER_TOKEN: &str = "MK_4999";
pub const UNKNOWN_MAKER_NAME: &str = "Unknown maker";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenCategory {
    Maker,
    Model,
    System,
    Temperature,
}

impl TokenCategory {
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Maker => "MK",
            Self::Model => "MD",
            Self::System => "SP",
            Self::Temperature => "TMP",
        }
    }
}

/// Numbering policy for token namespaces
pub trait AnonymizationScheme: Send + Sync {
    /// Token for the `index`-th distinct value (in sorted order) of `category`
    fn token(&self, category: TokenCategory, index: usize) -> String;

    fn unknown_maker_token(&self) -> String {
        UNKNOWN_MAKER_TOKEN.to_string()
    }
}

/// `PREFIX_{offset + index}`, with a separate offset per namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequentialScheme {
    pub maker_offset: usize,
    pub model_offset: usize,
    pub system_offset: usize,
    pub temperature_offset: usize,
}

impl Default for SequentialScheme {
    fn default() -> Self {
        Self {
            maker_offset: 5000,
            model_offset: 6000,
            system_offset: 7000,
            temperature_offset: 8000,
        }
    }
}

impl AnonymizationScheme for SequentialScheme {
    fn token(&self, category: TokenCategory, index: usize) -> String {
        let offset = match category {
            TokenCategory::Maker => self.maker_offset,
            TokenCategory::Model => self.model_offset,
            TokenCategory::System => self.system_offset,
            TokenCategory::Temperature => self.temperature_offset,
        };
        format!("{}_{}", category.prefix(), offset + index)
    }
}

fn token_number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+").expect("valid token number regex"))
}

/// Normalize a loosely written token ("md 6001", "Md_6001", "6001") to `MD_6001`
pub fn canonical_token(category: TokenCategory, raw: &str) -> Option<String> {
    let number = token_number_re().find(raw)?.as_str();
    Some(format!("{}_{}", category.prefix(), number))
}

/// Tokens applying to one effective id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelTokens {
    pub maker: String,
    pub model: String,
    pub system: Option<String>,
    pub temperature: Option<String>,
}

impl ModelTokens {
    /// `MK_5000_MD_6001[_SP_7000][_TMP_8000]`
    pub fn composite(&self) -> String {
        let mut token = format!("{}_{}", self.maker, self.model);
        if let Some(system) = &self.system {
            token.push('_');
            token.push_str(system);
        }
        if let Some(temperature) = &self.temperature {
            token.push('_');
            token.push_str(temperature);
        }
        token
    }

    /// Maker and model only, for references to the base model
    pub fn base_composite(&self) -> String {
        format!("{}_{}", self.maker, self.model)
    }
}

/// Bidirectional mapping between real effective ids and their tokens.
///
/// Built once per run and read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct AnonymizationMapping {
    forward: BTreeMap<String, ModelTokens>,
    makers: BTreeMap<String, String>,
    maker_tokens: BTreeMap<String, String>,
    models: BTreeMap<String, String>,
    systems: BTreeMap<String, usize>,
    temperatures: BTreeMap<String, f64>,
}

impl AnonymizationMapping {
    /// Build from the run's effective ids; the ideal pseudo-model is skipped
    pub fn build(model_ids: &[String], scheme: &dyn AnonymizationScheme) -> Self {
        let parsed: Vec<_> = model_ids
            .iter()
            .filter(|id| id.as_str() != IDEAL_MODEL_ID)
            .map(|id| (id, parse_effective_model_id(id), resolve_maker(id)))
            .collect();

        let maker_names: BTreeSet<&str> = parsed.iter().filter_map(|(_, _, maker)| *maker).collect();
        let base_ids: BTreeSet<&str> = parsed.iter().map(|(_, p, _)| p.base_id.as_str()).collect();
        let sys_indices: BTreeSet<usize> = parsed.iter().filter_map(|(_, p, _)| p.sys_index).collect();
        let mut temperatures: Vec<f64> = parsed.iter().filter_map(|(_, p, _)| p.temperature).collect();
        temperatures.sort_by(|a, b| a.total_cmp(b));
        temperatures.dedup();

        let mut mapping = Self::default();
        for (idx, maker) in maker_names.iter().enumerate() {
            let token = scheme.token(TokenCategory::Maker, idx);
            mapping.makers.insert(token.clone(), maker.to_string());
            mapping.maker_tokens.insert(maker.to_string(), token);
        }
        let model_tokens: BTreeMap<&str, String> = base_ids
            .iter()
            .enumerate()
            .map(|(idx, base)| (*base, scheme.token(TokenCategory::Model, idx)))
            .collect();
        for (base, token) in &model_tokens {
            mapping.models.insert(token.clone(), base.to_string());
        }
        let system_tokens: BTreeMap<usize, String> = sys_indices
            .iter()
            .enumerate()
            .map(|(idx, sys)| (*sys, scheme.token(TokenCategory::System, idx)))
            .collect();
        for (sys, token) in &system_tokens {
            mapping.systems.insert(token.clone(), *sys);
        }
        let temperature_tokens: Vec<(f64, String)> = temperatures
            .iter()
            .enumerate()
            .map(|(idx, temp)| (*temp, scheme.token(TokenCategory::Temperature, idx)))
            .collect();
        for (temp, token) in &temperature_tokens {
            mapping.temperatures.insert(token.clone(), *temp);
        }

        let unknown = scheme.unknown_maker_token();
        for (id, parsed, maker) in &parsed {
            let maker_token = match maker {
                Some(name) => mapping.maker_tokens.get(*name).cloned(),
                None => None,
            };
            let maker_token = maker_token.unwrap_or_else(|| {
                mapping
                    .makers
                    .entry(unknown.clone())
                    .or_insert_with(|| UNKNOWN_MAKER_NAME.to_string());
                unknown.clone()
            });
            let Some(model_token) = model_tokens.get(parsed.base_id.as_str()).cloned() else {
                continue;
            };
            let tokens = ModelTokens {
                maker: maker_token,
                model: model_token,
                system: parsed.sys_index.and_then(|s| system_tokens.get(&s).cloned()),
                temperature: parsed.temperature.and_then(|t| {
                    temperature_tokens
                        .iter()
                        .find(|(value, _)| *value == t)
                        .map(|(_, token)| token.clone())
                }),
            };
            mapping.forward.insert(id.to_string(), tokens);
        }

        mapping
    }

    pub fn tokens(&self, model_id: &str) -> Option<&ModelTokens> {
        self.forward.get(model_id)
    }

    pub fn composite_token(&self, model_id: &str) -> Option<String> {
        self.tokens(model_id).map(ModelTokens::composite)
    }

    /// Real effective ids with their tokens, sorted by id
    pub fn entries(&self) -> impl Iterator<Item = (&str, &ModelTokens)> {
        self.forward.iter().map(|(id, tokens)| (id.as_str(), tokens))
    }

    pub fn maker_name(&self, token: &str) -> Option<&str> {
        self.makers.get(token).map(String::as_str)
    }

    /// Token of a canonical maker seen in this run
    pub fn maker_token(&self, maker: &str) -> Option<&str> {
        self.maker_tokens.get(maker).map(String::as_str)
    }

    pub fn model_base_id(&self, token: &str) -> Option<&str> {
        self.models.get(token).map(String::as_str)
    }

    pub fn system_index(&self, token: &str) -> Option<usize> {
        self.systems.get(token).copied()
    }

    pub fn temperature(&self, token: &str) -> Option<f64> {
        self.temperatures.get(token).copied()
    }

    /// The single effective id matching the given canonical tokens.
    ///
    /// Omitted system or temperature tokens match any variant, but the result
    /// must still be unique; ambiguous or unknown combinations give `None`.
    pub fn resolve(
        &self,
        maker: &str,
        model: &str,
        system: Option<&str>,
        temperature: Option<&str>,
    ) -> Option<&str> {
        let mut matches = self.forward.iter().filter(|(_, tokens)| {
            tokens.maker == maker
                && tokens.model == model
                && system.is_none_or(|s| tokens.system.as_deref() == Some(s))
                && temperature.is_none_or(|t| tokens.temperature.as_deref() == Some(t))
        });
        let (id, _) = matches.next()?;
        if matches.next().is_some() {
            return None;
        }
        Some(id.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}

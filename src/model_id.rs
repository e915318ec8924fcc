//! Effective model identifiers and maker resolution.
//!
//! An effective id is a base model id plus optional variant suffixes, e.g.
//! `openai:gpt-4o-mini[sp_idx:1][temp:0.7]`. It keys one generation cell's output.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;

/// Reserved id of the ideal-answer pseudo-model.
pub const IDEAL_MODEL_ID: &str = "IDEAL_BENCHMARK";

/// Providers that route to other vendors' models as `router:vendor/model`.
const ROUTER_PROVIDERS: &[&str] = &["openrouter", "together", "fireworks", "groq", "bedrock"];

/// Vendor alias (lowercase) to canonical maker name.
const KNOWN_MAKERS: &[(&str, &str)] = &[
    ("openai", "OpenAI"),
    ("anthropic", "Anthropic"),
    ("google", "Google"),
    ("gemini", "Google"),
    ("vertex", "Google"),
    ("meta", "Meta"),
    ("meta-llama", "Meta"),
    ("mistral", "Mistral"),
    ("mistralai", "Mistral"),
    ("xai", "xAI"),
    ("x-ai", "xAI"),
    ("deepseek", "DeepSeek"),
    ("cohere", "Cohere"),
    ("qwen", "Qwen"),
    ("alibaba", "Qwen"),
    ("microsoft", "Microsoft"),
    ("moonshotai", "Moonshot"),
];

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedModelId {
    pub base_id: String,
    pub sys_index: Option<usize>,
    pub temperature: Option<f64>,
}

fn suffix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[(sp_idx|temp):([^\]]+)\]").expect("valid suffix regex"))
}

/// Build the effective id for one cell.
pub fn effective_model_id(base_id: &str, sys_index: Option<usize>, temperature: Option<f64>) -> String {
    let mut id = base_id.to_string();
    if let Some(idx) = sys_index {
        id.push_str(&format!("[sp_idx:{}]", idx));
    }
    if let Some(temp) = temperature {
        id.push_str(&format!("[temp:{}]", format_temperature(temp)));
    }
    id
}

/// Split an effective id into base id and variant components.
///
/// Malformed suffixes are ignored rather than rejected.
pub fn parse_effective_model_id(id: &str) -> ParsedModelId {
    let Some(start) = id.find('[') else {
        return ParsedModelId {
            base_id: id.to_string(),
            sys_index: None,
            temperature: None,
        };
    };

    let mut parsed = ParsedModelId {
        base_id: id[..start].to_string(),
        sys_index: None,
        temperature: None,
    };
    for caps in suffix_re().captures_iter(&id[start..]) {
        match &caps[1] {
            "sp_idx" => parsed.sys_index = caps[2].parse().ok(),
            "temp" => parsed.temperature = caps[2].parse().ok(),
            _ => {}
        }
    }
    parsed
}

pub fn base_model_id(id: &str) -> String {
    parse_effective_model_id(id).base_id
}

pub fn format_temperature(temp: f64) -> String {
    format!("{}", temp)
}

/// The vendor segment a base id names, lowercased.
fn vendor_segment(base_id: &str) -> String {
    let lower = base_id.to_lowercase();
    match lower.split_once(':') {
        Some((provider, rest)) if ROUTER_PROVIDERS.contains(&provider) => match rest.split_once('/') {
            Some((vendor, _)) => vendor.to_string(),
            None => provider.to_string(),
        },
        Some((provider, _)) => provider.to_string(),
        None => match lower.split_once('/') {
            Some((vendor, _)) => vendor.to_string(),
            None => lower,
        },
    }
}

/// Canonical maker of a base or effective id, or `None` for unknown providers.
pub fn resolve_maker(id: &str) -> Option<&'static str> {
    let vendor = vendor_segment(&base_model_id(id));
    KNOWN_MAKERS
        .iter()
        .find(|(alias, _)| *alias == vendor)
        .map(|(_, maker)| *maker)
}

/// Canonical maker for a bare alias or maker name, case-insensitively.
pub fn canonical_maker(name: &str) -> Option<&'static str> {
    KNOWN_MAKERS
        .iter()
        .find(|(alias, maker)| alias.eq_ignore_ascii_case(name) || maker.eq_ignore_ascii_case(name))
        .map(|(_, maker)| *maker)
}

/// Every maker alias and canonical name, lowercased and longest first.
pub fn known_maker_names() -> Vec<String> {
    let unique: BTreeSet<String> = KNOWN_MAKERS
        .iter()
        .flat_map(|(alias, maker)| [alias.to_lowercase(), maker.to_lowercase()])
        .collect();
    let mut names: Vec<String> = unique.into_iter().collect();
    names.sort_by_key(|n| std::cmp::Reverse(n.len()));
    names
}

/// Model name without provider or vendor prefixes.
pub fn short_model_name(base_id: &str) -> &str {
    let after_provider = base_id.split_once(':').map(|(_, rest)| rest).unwrap_or(base_id);
    after_provider
        .rsplit_once('/')
        .map(|(_, name)| name)
        .unwrap_or(after_provider)
}

/// Human-readable name used in reports and deanonymized summaries.
pub fn display_name(id: &str) -> String {
    if id == IDEAL_MODEL_ID {
        return "Ideal Response".to_string();
    }
    let parsed = parse_effective_model_id(id);
    let name = short_model_name(&parsed.base_id);
    let mut variants = Vec::new();
    if let Some(idx) = parsed.sys_index {
        variants.push(format!("sys {}", idx));
    }
    if let Some(temp) = parsed.temperature {
        variants.push(format!("temp {}", format_temperature(temp)));
    }
    if variants.is_empty() {
        name.to_string()
    } else {
        format!("{} ({})", name, variants.join(", "))
    }
}

//! Executive summary: anonymized report out, deanonymized and parsed insights back.
//!
//! The summarizer model only ever sees opaque tokens. What it writes is mapped
//! back to display names, tolerating the looser spellings models produce, and
//! tagged sections are then extracted one span at a time. A malformed span is
//! dropped on its own without failing the parse.

use crate::anonymize::{
    AnonymizationMapping, TokenCategory, UNKNOWN_MAKER_TOKEN, canonical_token,
};
use crate::caller::{CallRequest, ModelCaller};
use crate::config::RunConfig;
use crate::model_id::{
    IDEAL_MODEL_ID, base_model_id, canonical_maker, display_name, format_temperature,
    known_maker_names,
};
use crate::models::{
    ConversationMessage, EvaluationResults, ExecutiveSummary, ModelGrades, ModelStatSummary,
    PromptResponseData, Role, Statistics, StructuredInsights,
};
use regex::{Captures, Regex};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Grade dimensions and the label spellings that name them
const GRADE_DIMENSIONS: &[(&str, &str)] = &[
    ("adherence", r"(?i)\b(?:adherence|instruction)"),
    ("clarity", r"(?i)\b(?:clarity|readability)"),
    ("tone", r"(?i)\b(?:tone|style)"),
    ("depth", r"(?i)\b(?:depth|detail)"),
    ("coherence", r"(?i)\b(?:coherence|conversational|flow)"),
    ("helpfulness", r"(?i)\b(?:helpfulness|actionability)"),
    ("credibility", r"(?i)\b(?:credibility|ethos)"),
    ("empathy", r"(?i)\b(?:empathy|pathos)"),
    ("creativity", r"(?i)\b(?:creativity|originality)"),
    ("safety", r"(?i)\b(?:safety|self-awareness)"),
    ("argumentation", r"(?i)\b(?:argumentation|logos|persuasiveness)"),
    ("efficiency", r"(?i)\b(?:efficiency|succinctness)"),
    ("humility", r"(?i)\b(?:humility|epistemic)"),
];

const SECTION_TAGS: &[&str] = &["key_finding", "strength", "weakness", "pattern", "topic"];

fn dimension_res() -> &'static [(&'static str, Regex)] {
    static RES: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    RES.get_or_init(|| {
        GRADE_DIMENSIONS
            .iter()
            .map(|(name, pattern)| (*name, Regex::new(pattern).expect("valid dimension regex")))
            .collect()
    })
}

fn section_res() -> &'static HashMap<&'static str, Regex> {
    static RES: OnceLock<HashMap<&'static str, Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        SECTION_TAGS
            .iter()
            .map(|tag| {
                let pattern = format!(r"(?is)<{tag}\b[^>]*>(.*?)</{tag}\s*>");
                (*tag, Regex::new(&pattern).expect("valid section regex"))
            })
            .collect()
    })
}

fn grade_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)<grade\b([^>]*)>(.*?)</grade\s*>").expect("valid grade regex")
    })
}

fn ref_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)<ref\b([^>]*?)/?>").expect("valid ref regex"))
}

fn attr_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(\w+)\s*=\s*"([^"]*)""#).expect("valid attribute regex"))
}

/// Composite token in its exact, spaced or spelled-out forms
fn composite_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(concat!(
            r"(?i)\b(?:maker\s+(?:mk[_\s]?)?|mk[_\s]?)(\d+)",
            r"[_\s,]+(?:model\s+(?:md[_\s]?)?|md[_\s]?)(\d+)",
            r"(?:[_\s,]+(?:system\s+(?:sp[_\s]?)?|sys\s+(?:sp[_\s]?)?|sp[_\s]?)(\d+))?",
            r"(?:[_\s,]+(?:temperature\s+(?:tmp[_\s]?)?|temp\s+(?:tmp[_\s]?)?|tmp[_\s]?)(\d+))?",
        ))
        .expect("valid composite regex")
    })
}

fn standalone_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(MK|MD|SP|TMP)_(\d+)\b").expect("valid token regex"))
}

fn maker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let names: Vec<String> = known_maker_names().iter().map(|n| regex::escape(n)).collect();
        Regex::new(&format!(r"(?i)\b(?:{})\b", names.join("|"))).expect("valid maker regex")
    })
}

fn score_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+(?:\.\d+)?)\s*(/\s*10\b)?").expect("valid score regex"))
}

fn parse_attributes(raw: &str) -> HashMap<String, String> {
    attr_re()
        .captures_iter(raw)
        .map(|caps| (caps[1].to_lowercase(), caps[2].trim().to_string()))
        .collect()
}

/// A 0 to 10 score from "X/10", "X", or a bare number above 10 read as tenths
pub fn extract_score(text: &str) -> Option<f64> {
    let caps = score_re().captures(text)?;
    let value: f64 = caps[1].parse().ok()?;
    let score = if caps.get(2).is_some() || value <= 10.0 {
        value
    } else {
        value / 10.0
    };
    (0.0..=10.0).contains(&score).then_some(score)
}

/// Dimension scores inside a grade block, first mention of a dimension wins
fn parse_grade_dimensions(body: &str) -> BTreeMap<String, f64> {
    let mut grades = BTreeMap::new();
    for segment in body.split(['\n', ';', ',']) {
        let (label, value) = match segment.split_once([':', '=']) {
            Some((label, value)) => (label, value),
            None => (segment, segment),
        };
        let Some((dimension, _)) = dimension_res().iter().find(|(_, re)| re.is_match(label)) else {
            continue;
        };
        if let Some(score) = extract_score(value) {
            grades.entry(dimension.to_string()).or_insert(score);
        }
    }
    grades
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Escaped needle that cannot match inside a longer word.
///
/// `\b` is only added on a side that ends in a word character, so ids
/// ending in `]` or `)` still match before punctuation.
fn whole_word_pattern(needle: &str) -> String {
    let mut pattern = String::new();
    if needle.chars().next().is_some_and(is_word_char) {
        pattern.push_str(r"\b");
    }
    pattern.push_str(&regex::escape(needle));
    if needle.chars().next_back().is_some_and(is_word_char) {
        pattern.push_str(r"\b");
    }
    pattern
}

/// Swaps real identities for tokens and back
pub struct SummaryTextCodec {
    mapping: AnonymizationMapping,
    replacements: HashMap<String, String>,
    identity_re: Option<Regex>,
}

impl SummaryTextCodec {
    pub fn new(mapping: AnonymizationMapping) -> Self {
        // keyed by lowercased needle; matching is case-insensitive
        let mut replacements: HashMap<String, String> = HashMap::new();
        for (id, tokens) in mapping.entries() {
            let base = base_model_id(id);
            for (needle, token) in [
                (id.to_string(), tokens.composite()),
                (display_name(id), tokens.composite()),
                (base.clone(), tokens.base_composite()),
                (display_name(&base), tokens.base_composite()),
            ] {
                if !needle.trim().is_empty() {
                    replacements.entry(needle.to_lowercase()).or_insert(token);
                }
            }
        }

        let mut needles: Vec<&String> = replacements.keys().collect();
        needles.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        let identity_re = if needles.is_empty() {
            None
        } else {
            let alternation = needles
                .iter()
                .map(|n| whole_word_pattern(n))
                .collect::<Vec<_>>()
                .join("|");
            match Regex::new(&format!("(?i){}", alternation)) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(error = %e, "Could not build identity pattern; only maker names will be scrubbed");
                    None
                }
            }
        };

        Self {
            mapping,
            replacements,
            identity_re,
        }
    }

    pub fn mapping(&self) -> &AnonymizationMapping {
        &self.mapping
    }

    /// Replace every real identity with its token, then scrub maker names
    pub fn anonymize(&self, text: &str) -> String {
        let replaced = match &self.identity_re {
            Some(re) => re
                .replace_all(text, |caps: &Captures| {
                    self.replacements
                        .get(&caps[0].to_lowercase())
                        .cloned()
                        .unwrap_or_else(|| caps[0].to_string())
                })
                .into_owned(),
            None => text.to_string(),
        };

        maker_re()
            .replace_all(&replaced, |caps: &Captures| {
                canonical_maker(&caps[0])
                    .and_then(|maker| self.mapping.maker_token(maker))
                    .unwrap_or(UNKNOWN_MAKER_TOKEN)
                    .to_string()
            })
            .into_owned()
    }

    /// Real effective id for token attributes such as `maker="MK_5000" model="MD_6001"`
    fn resolve_attributes(&self, attrs: &HashMap<String, String>) -> Option<&str> {
        let maker = canonical_token(TokenCategory::Maker, attrs.get("maker")?)?;
        let model = canonical_token(TokenCategory::Model, attrs.get("model")?)?;
        let system = attrs
            .get("sys")
            .or_else(|| attrs.get("system"))
            .and_then(|s| canonical_token(TokenCategory::System, s));
        let temperature = attrs
            .get("temp")
            .or_else(|| attrs.get("temperature"))
            .and_then(|t| canonical_token(TokenCategory::Temperature, t));
        self.mapping
            .resolve(&maker, &model, system.as_deref(), temperature.as_deref())
    }

    /// Display name for a composite; the base model when variants are left out
    fn resolve_composite(
        &self,
        maker: &str,
        model: &str,
        system: Option<&str>,
        temperature: Option<&str>,
    ) -> Option<String> {
        let maker = canonical_token(TokenCategory::Maker, maker)?;
        let model = canonical_token(TokenCategory::Model, model)?;
        let system = system.and_then(|s| canonical_token(TokenCategory::System, s));
        let temperature = temperature.and_then(|t| canonical_token(TokenCategory::Temperature, t));

        if let Some(id) = self
            .mapping
            .resolve(&maker, &model, system.as_deref(), temperature.as_deref())
        {
            return Some(display_name(id));
        }
        if system.is_some() || temperature.is_some() {
            return None;
        }
        self.mapping
            .entries()
            .find(|(_, tokens)| tokens.maker == maker && tokens.model == model)
            .map(|(id, _)| display_name(&base_model_id(id)))
    }

    fn resolve_standalone(&self, prefix: &str, number: &str) -> Option<String> {
        match prefix.to_uppercase().as_str() {
            "MK" => self
                .mapping
                .maker_name(&format!("MK_{}", number))
                .map(str::to_string),
            "MD" => self
                .mapping
                .model_base_id(&format!("MD_{}", number))
                .map(display_name),
            "SP" => self
                .mapping
                .system_index(&format!("SP_{}", number))
                .map(|idx| format!("system prompt {}", idx)),
            "TMP" => self
                .mapping
                .temperature(&format!("TMP_{}", number))
                .map(|t| format!("temperature {}", format_temperature(t))),
            _ => None,
        }
    }

    /// Map tokens in model-written text back to display names; unknown tokens stay as written
    pub fn deanonymize(&self, text: &str) -> String {
        let refs = ref_re().replace_all(text, |caps: &Captures| {
            let attrs = parse_attributes(&caps[1]);
            match self.resolve_attributes(&attrs) {
                Some(id) => display_name(id),
                None => caps[0].to_string(),
            }
        });

        let composites = composite_re().replace_all(&refs, |caps: &Captures| {
            self.resolve_composite(
                &caps[1],
                &caps[2],
                caps.get(3).map(|m| m.as_str()),
                caps.get(4).map(|m| m.as_str()),
            )
            .unwrap_or_else(|| caps[0].to_string())
        });

        standalone_re()
            .replace_all(&composites, |caps: &Captures| {
                self.resolve_standalone(&caps[1], &caps[2])
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }

    /// Tagged sections of summarizer output; `None` when nothing was recognized
    pub fn parse_structured(&self, text: &str) -> Option<StructuredInsights> {
        let sections = section_res();
        let collect = |tag: &str| -> Vec<String> {
            sections
                .get(tag)
                .map(|re| {
                    re.captures_iter(text)
                        .map(|caps| self.deanonymize(caps[1].trim()))
                        .filter(|content| !content.is_empty())
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut insights = StructuredInsights {
            key_findings: collect("key_finding"),
            strengths: collect("strength"),
            weaknesses: collect("weakness"),
            patterns: collect("pattern"),
            topics: collect("topic"),
            grades: Vec::new(),
        };

        for caps in grade_re().captures_iter(text) {
            let attrs = parse_attributes(&caps[1]);
            let Some(model_id) = self.resolve_attributes(&attrs) else {
                debug!(attributes = %caps[1].trim(), "Dropping grade for unknown model");
                continue;
            };
            let grades = parse_grade_dimensions(&caps[2]);
            if grades.is_empty() {
                debug!(model = %model_id, "Dropping grade without recognizable dimensions");
                continue;
            }
            insights.grades.push(ModelGrades {
                model_id: model_id.to_string(),
                grades,
            });
        }

        (!insights.is_empty()).then_some(insights)
    }
}

const SUMMARY_INSTRUCTIONS: &str = r#"You are writing the executive summary of a comparative evaluation of language models.
Models are identified only by opaque tokens such as MK_5000_MD_6001 (maker, model, and optionally
system prompt variant SP_ and temperature TMP_). Refer to models only by these tokens, or with
<ref maker="MK_..." model="MD_..." sys="SP_..." temp="TMP_..."/>.

Write a short narrative, then mark up your analysis with these tags:
<key_finding>...</key_finding> for the most important conclusions
<strength>...</strength> and <weakness>...</weakness> for notable model behaviour
<pattern>...</pattern> for trends across prompts
<topic>...</topic> for subject areas the prompts covered
<grade maker="MK_..." model="MD_..." sys="SP_..." temp="TMP_...">
dimension: X/10, one per line
</grade> for each model, omitting sys and temp when the token has none."#;

const SUMMARY_MAX_TOKENS: u32 = 4000;
const DEFAULT_MAX_RESPONSE_CHARS: usize = 1500;

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}

fn format_score(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{:.3}", v))
}

fn format_summary(summary: &ModelStatSummary) -> String {
    format!(
        "{} (sd {})",
        format_score(summary.average),
        format_score(summary.stddev)
    )
}

fn render_context(context: &[ConversationMessage]) -> String {
    context
        .iter()
        .filter_map(|m| {
            let role = match m.role {
                Role::System => "System",
                Role::User => "User",
                Role::Assistant => "Assistant",
            };
            m.content.as_deref().map(|c| format!("{}: {}", role, c))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Writes the executive summary through a summarizer model
pub struct Summarizer {
    caller: Arc<dyn ModelCaller>,
    model_id: String,
    timeout: Option<Duration>,
    max_response_chars: usize,
}

impl Summarizer {
    pub fn new(caller: Arc<dyn ModelCaller>, model_id: impl Into<String>) -> Self {
        Self {
            caller,
            model_id: model_id.into(),
            timeout: None,
            max_response_chars: DEFAULT_MAX_RESPONSE_CHARS,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Report on the run in real names; anonymized before it is sent
    fn build_report(
        &self,
        codec: &SummaryTextCodec,
        config: &RunConfig,
        responses: &[PromptResponseData],
        evaluation: &EvaluationResults,
        statistics: Option<&Statistics>,
    ) -> String {
        let label = |model_id: &str| {
            codec
                .mapping()
                .composite_token(model_id)
                .unwrap_or_else(|| model_id.to_string())
        };
        let mut report = String::new();
        let _ = writeln!(report, "# {}", config.title);
        if let Some(description) = &config.description {
            let _ = writeln!(report, "{}", description);
        }

        if let Some(stats) = statistics {
            let _ = writeln!(report, "\n## Overall scores");
            for (model_id, summary) in &stats.per_model_hybrid {
                let _ = writeln!(report, "- {}: hybrid {}", label(model_id.as_str()), format_summary(summary));
            }
        }

        for data in responses {
            let _ = writeln!(report, "\n## Prompt {}", data.prompt_id);
            let _ = writeln!(report, "{}", render_context(&data.prompt_context));
            if let Some(ideal) = &data.ideal_response {
                let _ = writeln!(report, "\nIdeal answer: {}", truncate_chars(ideal, self.max_response_chars));
            }
            for (model_id, detail) in &data.model_responses {
                if model_id == IDEAL_MODEL_ID {
                    continue;
                }
                let _ = writeln!(
                    report,
                    "\n### {} (similarity {}, coverage {})",
                    label(model_id.as_str()),
                    format_score(evaluation.similarity(&data.prompt_id, model_id)),
                    format_score(evaluation.coverage(&data.prompt_id, model_id)),
                );
                if detail.has_error {
                    let _ = writeln!(report, "[no response: generation failed]");
                } else {
                    let _ = writeln!(
                        report,
                        "{}",
                        truncate_chars(&detail.final_assistant_response, self.max_response_chars)
                    );
                }
            }
        }
        report
    }

    /// Summarize the run. Any failure is logged and yields `None`.
    pub async fn summarize(
        &self,
        config: &RunConfig,
        effective_models: &[String],
        responses: &[PromptResponseData],
        evaluation: &EvaluationResults,
        statistics: Option<&Statistics>,
    ) -> Option<ExecutiveSummary> {
        let mapping = AnonymizationMapping::build(effective_models, &config.anonymization);
        if mapping.is_empty() {
            debug!("No models in the run; nothing to summarize");
            return None;
        }
        let codec = SummaryTextCodec::new(mapping);
        let report = codec.anonymize(&self.build_report(&codec, config, responses, evaluation, statistics));

        let mut request = CallRequest::new(self.model_id.clone(), vec![ConversationMessage::user(report)])
            .system_prompt(Some(SUMMARY_INSTRUCTIONS.to_string()))
            .temperature(Some(0.3))
            .max_tokens(SUMMARY_MAX_TOKENS);
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }

        info!(model = %self.model_id, "Requesting executive summary");
        let raw = match self.caller.call(request).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(model = %self.model_id, error = %e, "Executive summary failed; continuing without it");
                return None;
            }
        };

        let structured = codec.parse_structured(&raw);
        if structured.is_none() {
            debug!("Summary had no tagged sections; keeping it as prose");
        }
        Some(ExecutiveSummary {
            model_id: self.model_id.clone(),
            content: codec.deanonymize(&raw),
            structured,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anonymize::SequentialScheme;
    use crate::errors::CallError;
    use crate::models::ModelResponseDetail;
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn run_models() -> Vec<String> {
        [
            "openai:gpt-4o[temp:0.7]",
            "openai:gpt-4o[temp:0.2]",
            "anthropic:claude-3-haiku[temp:0.2]",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    fn codec_for(model_ids: &[&str]) -> SummaryTextCodec {
        let ids: Vec<String> = model_ids.iter().map(|s| s.to_string()).collect();
        SummaryTextCodec::new(AnonymizationMapping::build(&ids, &SequentialScheme::default()))
    }

    fn codec() -> SummaryTextCodec {
        SummaryTextCodec::new(AnonymizationMapping::build(&run_models(), &SequentialScheme::default()))
    }

    #[test]
    fn test_anonymize_replaces_ids_and_scrubs_makers() {
        let codec = codec();
        let text = "openai:gpt-4o[temp:0.7] and gpt-4o (temp 0.2) from OpenAI beat Anthropic's \
claude-3-haiku; Mistral was not tested.";
        let anonymized = codec.anonymize(text);

        assert!(anonymized.contains("MK_5001_MD_6001_TMP_8001"));
        assert!(anonymized.contains("MK_5001_MD_6001_TMP_8000"));
        assert!(anonymized.contains("MK_5000_MD_6000;"));
        assert!(anonymized.contains("from MK_5001 beat MK_5000's"));
        assert!(anonymized.contains(UNKNOWN_MAKER_TOKEN));
        let lower = anonymized.to_lowercase();
        for leaked in ["openai", "anthropic", "gpt-4o", "claude", "mistral"] {
            assert!(!lower.contains(leaked), "{} leaked into {}", leaked, anonymized);
        }
    }

    #[test]
    fn test_anonymize_ignores_case() {
        let codec = codec_for(&["openai:gpt-4o", "anthropic:claude-3-haiku"]);
        assert_eq!(
            codec.anonymize("I am GPT-4o. Claude-3-Haiku here."),
            "I am MK_5001_MD_6001. MK_5000_MD_6000 here."
        );
        assert_eq!(codec.anonymize("OPENAI:GPT-4O"), "MK_5001_MD_6001");
    }

    #[test]
    fn test_anonymize_matches_whole_words_only() {
        let codec = codec_for(&["openai:o1"]);
        assert_eq!(
            codec.anonymize("Call foo1 then go1 and the o1 model"),
            "Call foo1 then go1 and the MK_5000_MD_6000 model"
        );
        assert_eq!(codec.anonymize("o1_mini o1x (o1)"), "o1_mini o1x (MK_5000_MD_6000)");
    }

    #[test]
    fn test_deanonymize_variants_roundtrip() {
        let codec = codec();
        for id in run_models() {
            let token = codec.mapping().composite_token(&id).unwrap();
            let expected = display_name(&id);

            assert_eq!(codec.deanonymize(&codec.anonymize(&id)), expected);
            assert_eq!(codec.deanonymize(&token), expected);
            assert_eq!(codec.deanonymize(&token.replace('_', " ")), expected);
            assert_eq!(codec.deanonymize(&token.to_lowercase()), expected);
        }

        assert_eq!(
            codec.deanonymize("Maker 5001 Model 6001 Temp 8001 was verbose."),
            "gpt-4o (temp 0.7) was verbose."
        );
        assert_eq!(codec.deanonymize("Maker MK_5000 Model MD_6000 won."), "claude-3-haiku (temp 0.2) won.");
    }

    #[test]
    fn test_deanonymize_partial_and_unknown_tokens() {
        let codec = codec();
        assert_eq!(codec.deanonymize("MK_5001_MD_6001 overall"), "gpt-4o overall");
        assert_eq!(codec.deanonymize("MK_5000 did well"), "Anthropic did well");
        assert_eq!(codec.deanonymize("MD_6001 again"), "gpt-4o again");
        assert_eq!(codec.deanonymize("at TMP_8001"), "at temperature 0.7");
        assert_eq!(codec.deanonymize("MK_9999 is unknown"), "MK_9999 is unknown");
        assert_eq!(codec.deanonymize("MK_9999_MD_6001 too"), "MK_9999_MD_6001 too");
        assert_eq!(
            codec.deanonymize("MK_5001_MD_6001_TMP_8009 stays"),
            "MK_5001_MD_6001_TMP_8009 stays"
        );
    }

    #[test]
    fn test_deanonymize_ref_tags() {
        let codec = codec();
        let text = r#"See <ref maker="MK_5001" model="MD_6001" temp="TMP_8000"/> and <ref maker="MK_1" model="MD_2" />."#;
        assert_eq!(
            codec.deanonymize(text),
            r#"See gpt-4o (temp 0.2) and <ref maker="MK_1" model="MD_2" />."#
        );
    }

    #[test]
    fn test_parse_structured_without_tags_is_none() {
        assert!(codec().parse_structured("Just some prose about MK_5000.").is_none());
    }

    #[test]
    fn test_parse_structured_sections_and_grades() {
        let codec = codec();
        let text = r#"Overview.
<key_finding>MK_5001_MD_6001_TMP_8001 was most thorough.</key_finding>
<key_finding>  </key_finding>
<strength>Clear structure</strength>
<weakness>MK_5000 hedged a lot</weakness>
<topic>geography</topic>
<grade maker="MK_5001" model="MD_6001" temp="TMP_8001">
Adherence: 9/10
Clarity: 85
Instruction following: 3
Tone: 7
Vibes: 10
</grade>
<grade maker="MK_7777" model="MD_6001">clarity: 5</grade>
<grade maker="MK_5000" model="MD_6000">nothing numeric here</grade>"#;

        let insights = codec.parse_structured(text).unwrap();
        assert_eq!(insights.key_findings, vec!["gpt-4o (temp 0.7) was most thorough."]);
        assert_eq!(insights.strengths, vec!["Clear structure"]);
        assert_eq!(insights.weaknesses, vec!["Anthropic hedged a lot"]);
        assert_eq!(insights.topics, vec!["geography"]);
        assert!(insights.patterns.is_empty());

        assert_eq!(insights.grades.len(), 1);
        let grades = &insights.grades[0];
        assert_eq!(grades.model_id, "openai:gpt-4o[temp:0.7]");
        assert_eq!(grades.grades.get("adherence"), Some(&9.0));
        assert_eq!(grades.grades.get("clarity"), Some(&8.5));
        assert_eq!(grades.grades.get("tone"), Some(&7.0));
        assert_eq!(grades.grades.len(), 3);
    }

    #[test]
    fn test_extract_score() {
        assert_eq!(extract_score(" 8/10"), Some(8.0));
        assert_eq!(extract_score("7.5"), Some(7.5));
        assert_eq!(extract_score("92"), Some(9.2));
        assert_eq!(extract_score("12/10"), None);
        assert_eq!(extract_score("great"), None);
    }

    struct RecordingSummarizer {
        reply: Result<String, CallError>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ModelCaller for RecordingSummarizer {
        async fn call(&self, request: CallRequest) -> Result<String, CallError> {
            let content = request.messages[0].content.clone().unwrap_or_default();
            self.seen.lock().unwrap().push(content);
            self.reply.clone()
        }
    }

    fn run_fixture() -> (RunConfig, Vec<PromptResponseData>) {
        let config: RunConfig = toml::from_str(
            r#"
id = "r"
title = "Capitals"
models = ["openai:gpt-4o", "anthropic:claude-3-haiku"]
temperatures = [0.2, 0.7]

[[prompts]]
id = "p1"
prompt = "Capital of France? Answer like OpenAI would."
ideal = "Paris"
"#,
        )
        .unwrap();

        let mut model_responses = BTreeMap::new();
        for id in run_models() {
            model_responses.insert(
                id.clone(),
                ModelResponseDetail {
                    final_assistant_response: format!("Paris, says {}", id),
                    full_conversation_history: Vec::new(),
                    system_prompt_used: None,
                    temperature_used: None,
                    has_error: false,
                    error_message: None,
                    fixture_used: false,
                    tool_calls: Vec::new(),
                },
            );
        }
        let responses = vec![PromptResponseData {
            prompt_id: "p1".to_string(),
            prompt_context: vec![ConversationMessage::user("Capital of France? Answer like OpenAI would.")],
            ideal_response: Some("Paris".to_string()),
            model_responses,
        }];
        (config, responses)
    }

    #[tokio::test]
    async fn test_summarizer_sends_anonymized_report() {
        let (config, responses) = run_fixture();
        let caller = Arc::new(RecordingSummarizer {
            reply: Ok("All good.\n<key_finding>MK_5000_MD_6000_TMP_8000 was terse.</key_finding>".to_string()),
            seen: Mutex::new(Vec::new()),
        });
        let summarizer = Summarizer::new(caller.clone(), "openai:gpt-4o");

        let summary = summarizer
            .summarize(&config, &run_models(), &responses, &EvaluationResults::default(), None)
            .await
            .unwrap();

        let sent = caller.seen.lock().unwrap()[0].to_lowercase();
        assert!(!sent.contains("openai"));
        assert!(!sent.contains("claude"));
        assert!(sent.contains("mk_5000_md_6000_tmp_8000"));

        assert!(summary.content.contains("claude-3-haiku (temp 0.2) was terse."));
        let structured = summary.structured.unwrap();
        assert_eq!(structured.key_findings, vec!["claude-3-haiku (temp 0.2) was terse."]);
    }

    #[tokio::test]
    async fn test_summarizer_uses_configured_numbering() {
        let (mut config, responses) = run_fixture();
        config.anonymization = SequentialScheme {
            maker_offset: 100,
            ..SequentialScheme::default()
        };
        let caller = Arc::new(RecordingSummarizer {
            reply: Ok("<key_finding>MK_100_MD_6000_TMP_8000 was terse.</key_finding>".to_string()),
            seen: Mutex::new(Vec::new()),
        });

        let summary = Summarizer::new(caller.clone(), "openai:gpt-4o")
            .summarize(&config, &run_models(), &responses, &EvaluationResults::default(), None)
            .await
            .unwrap();

        let sent = caller.seen.lock().unwrap()[0].to_lowercase();
        assert!(sent.contains("### mk_101_md_6001_tmp_8001"));
        assert!(!sent.contains("mk_5000"));
        assert_eq!(
            summary.structured.unwrap().key_findings,
            vec!["claude-3-haiku (temp 0.2) was terse."]
        );
    }

    #[tokio::test]
    async fn test_summarizer_skips_run_without_models() {
        let (config, responses) = run_fixture();
        let caller = Arc::new(RecordingSummarizer {
            reply: Ok("unused".to_string()),
            seen: Mutex::new(Vec::new()),
        });
        let summary = Summarizer::new(caller.clone(), "openai:gpt-4o")
            .summarize(&config, &[], &responses, &EvaluationResults::default(), None)
            .await;
        assert!(summary.is_none());
        assert!(caller.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_summarizer_failure_yields_none() {
        let (config, responses) = run_fixture();
        let caller = Arc::new(RecordingSummarizer {
            reply: Err(CallError::provider("openai:gpt-4o", "quota exceeded", false)),
            seen: Mutex::new(Vec::new()),
        });
        let summary = Summarizer::new(caller, "openai:gpt-4o")
            .summarize(&config, &run_models(), &responses, &EvaluationResults::default(), None)
            .await;
        assert!(summary.is_none());
    }

    #[tokio::test]
    async fn test_untagged_summary_kept_as_prose() {
        let (config, responses) = run_fixture();
        let caller = Arc::new(RecordingSummarizer {
            reply: Ok("MK_5001_MD_6001_TMP_8001 rambled.".to_string()),
            seen: Mutex::new(Vec::new()),
        });
        let summary = Summarizer::new(caller, "openai:gpt-4o")
            .summarize(&config, &run_models(), &responses, &EvaluationResults::default(), None)
            .await
            .unwrap();
        assert!(summary.structured.is_none());
        assert_eq!(summary.content, "gpt-4o (temp 0.7) rambled.");
    }
}

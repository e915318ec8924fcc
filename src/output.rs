use crate::model_id::display_name;
use crate::models::{FinalResults, ModelStatSummary, Statistics};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Output format options
#[derive(Debug, Clone, Copy, ValueEnum, Serialize, Deserialize)]
pub enum OutputFormat {
    Plain,
    Json,
}

/// Print run results in the specified format
pub fn print_results(results: &FinalResults, format: OutputFormat) {
    match format {
        OutputFormat::Plain => print!("{}", render_plain(results)),
        OutputFormat::Json => match serde_json::to_string_pretty(results) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Error serializing results to JSON: {}", e),
        },
    }
}

fn cell(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{:.3}", v))
}

fn summary_cells(summary: Option<&ModelStatSummary>) -> (String, String) {
    match summary {
        Some(s) => (cell(s.average), cell(s.stddev)),
        None => ("-".to_string(), "-".to_string()),
    }
}

fn render_statistics(out: &mut String, stats: &Statistics) {
    if stats.per_model_hybrid.is_empty() {
        let _ = writeln!(out, "No statistics available.");
        return;
    }

    let _ = writeln!(
        out,
        "{:<40} {:<8} {:<8} {:<8} {:<8}",
        "Model", "Hybrid", "StdDev", "Sim", "Coverage"
    );
    let _ = writeln!(out, "{}", "-".repeat(76));
    for (model_id, hybrid) in &stats.per_model_hybrid {
        let (similarity, _) = summary_cells(stats.per_model_similarity.get(model_id));
        let (coverage, _) = summary_cells(stats.per_model_coverage.get(model_id));
        let _ = writeln!(
            out,
            "{:<40} {:<8} {:<8} {:<8} {:<8}",
            display_name(model_id),
            cell(hybrid.average),
            cell(hybrid.stddev),
            similarity,
            coverage
        );
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "Overall hybrid: {}", cell(stats.overall_hybrid.average));
    if let Some(best) = &stats.best_model {
        let _ = writeln!(out, "Best model: {} ({:.3})", display_name(&best.model_id), best.score);
    }
    if let Some(worst) = &stats.worst_model {
        let _ = writeln!(out, "Worst model: {} ({:.3})", display_name(&worst.model_id), worst.score);
    }
    if let Some(prompt) = &stats.most_differentiating_prompt {
        let _ = writeln!(
            out,
            "Most differentiating prompt: {} (stddev {:.3})",
            prompt.prompt_id, prompt.stddev
        );
    }
}

/// Plain text report of one run
pub fn render_plain(results: &FinalResults) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "=== {} ({}) ===", results.config_title, results.config_id);
    let _ = writeln!(
        out,
        "Run: {} at {}",
        results.run_label,
        results.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
    );
    let _ = writeln!(
        out,
        "{} prompts x {} models",
        results.prompt_ids.len(),
        results.effective_models.len()
    );
    let _ = writeln!(out);

    let _ = writeln!(out, "📊 STATISTICS");
    let _ = writeln!(out, "-------------");
    match &results.statistics {
        Some(stats) => render_statistics(&mut out, stats),
        None => {
            let _ = writeln!(out, "No statistics available.");
        }
    }
    if !results.evaluation_results.failed_methods.is_empty() {
        let _ = writeln!(
            out,
            "Failed evaluation methods: {}",
            results.evaluation_results.failed_methods.join(", ")
        );
    }
    let _ = writeln!(out);

    let error_count: usize = results.errors.values().map(|row| row.len()).sum();
    if error_count > 0 {
        let _ = writeln!(out, "⚠️  ERRORS ({})", error_count);
        let _ = writeln!(out, "-------------");
        for (prompt_id, row) in &results.errors {
            for (model_id, message) in row {
                let _ = writeln!(out, "  • {} / {}: {}", prompt_id, display_name(model_id), message);
            }
        }
        let _ = writeln!(out);
    }

    if let Some(summary) = &results.executive_summary {
        let _ = writeln!(out, "📝 EXECUTIVE SUMMARY ({})", summary.model_id);
        let _ = writeln!(out, "-------------------");
        let _ = writeln!(out, "{}", summary.content.trim());
        if let Some(structured) = &summary.structured {
            for finding in &structured.key_findings {
                let _ = writeln!(out, "  • {}", finding);
            }
        }
        let _ = writeln!(out);
    }

    out
}

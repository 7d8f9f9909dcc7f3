use std::fs::File;
use std::io::{BufRead, BufReader};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use chronicle::config::AppConfig;
use chronicle::models::{AnswerStatus, QueryOptions};
use chronicle::pipeline::NarrativeService;
use chronicle::PipelineError;

#[derive(Parser, Debug)]
#[command(name = "eval")]
#[command(about = "Run a narrative evaluation set against the local index")]
struct Cli {
    #[arg(long, default_value = "eval/prompts.jsonl")]
    file: String,
    #[arg(long, default_value_t = 0)]
    related_questions: usize,
    #[arg(long)]
    timeout_secs: Option<u64>,
    #[arg(long, default_value_t = false)]
    verbose: bool,
}

#[derive(Debug, Deserialize)]
struct EvalPrompt {
    id: String,
    question: String,
    #[serde(default)]
    expect_contains: Vec<String>,
    #[serde(default)]
    expect_no_information: Option<bool>,
    #[serde(default)]
    expect_latest_year: Option<i32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = AppConfig::from_env();
    let service = NarrativeService::connect(&config).await?;

    let prompts = load_prompts(&cli.file)?;
    if prompts.is_empty() {
        anyhow::bail!("no prompts found in {}", cli.file);
    }

    let mut total = 0usize;
    let mut passed = 0usize;
    let mut degraded = 0usize;
    let mut no_information = 0usize;
    let mut skipped_batches = 0usize;
    let mut review_iterations = 0usize;
    let mut latest_year_expectations = 0usize;
    let mut latest_year_hits = 0usize;

    for prompt in prompts {
        let options = QueryOptions {
            related_questions: Some(cli.related_questions),
            max_review_iterations: None,
            timeout: cli.timeout_secs.map(Duration::from_secs),
        };

        let answer = match service.answer_query(&prompt.question, options).await {
            Ok(answer) => answer,
            Err(PipelineError::RateLimitedDaily) => {
                eprintln!("daily request budget exhausted at prompt {}; stopping", prompt.id);
                break;
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed eval prompt {}", prompt.id));
            }
        };
        total += 1;

        let narrative_lower = answer.narrative.to_lowercase();
        let is_no_information = answer.status == AnswerStatus::NoInformation;
        if is_no_information {
            no_information += 1;
        }
        if answer.degraded {
            degraded += 1;
        }
        skipped_batches += answer.diagnostics.batches_skipped.len();
        review_iterations += answer.diagnostics.review_iterations_used;

        let mut pass = prompt
            .expect_contains
            .iter()
            .all(|needle| narrative_lower.contains(&needle.to_lowercase()));
        if prompt.expect_no_information.unwrap_or(false) != is_no_information {
            pass = false;
        }

        if let Some(expected) = prompt.expect_latest_year {
            latest_year_expectations += 1;
            let reached = answer
                .paragraphs
                .iter()
                .filter_map(|p| p.years.map(|y| y.end))
                .max()
                .is_some_and(|latest| latest >= expected);
            if reached {
                latest_year_hits += 1;
            } else {
                pass = false;
            }
        }

        if pass {
            passed += 1;
        }

        if cli.verbose {
            println!("--- {} ---", prompt.id);
            println!("Q: {}", prompt.question);
            println!("A: {}", answer.narrative.replace('\n', " "));
            println!(
                "degraded={} skipped={} iterations={} failed={:?}",
                answer.degraded,
                answer.diagnostics.batches_skipped.len(),
                answer.diagnostics.review_iterations_used,
                answer.diagnostics.failed_checks
            );
            println!();
        }
    }

    println!("Eval prompts: {}", total);
    println!("Pass rate: {:.1}%", ratio(passed, total) * 100.0);
    println!("Degraded rate: {:.1}%", ratio(degraded, total) * 100.0);
    println!("No-information rate: {:.1}%", ratio(no_information, total) * 100.0);
    println!("Skipped batches: {}", skipped_batches);
    println!(
        "Average review iterations: {:.2}",
        if total > 0 {
            review_iterations as f32 / total as f32
        } else {
            0.0
        }
    );
    if latest_year_expectations > 0 {
        println!(
            "Latest-year coverage hit-rate: {:.1}% ({}/{})",
            ratio(latest_year_hits, latest_year_expectations) * 100.0,
            latest_year_hits,
            latest_year_expectations
        );
    }

    Ok(())
}

fn load_prompts(path: &str) -> Result<Vec<EvalPrompt>> {
    let file = File::open(path).with_context(|| format!("failed opening {}", path))?;
    let reader = BufReader::new(file);
    let mut prompts = Vec::new();

    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let parsed: EvalPrompt = serde_json::from_str(trimmed)
            .with_context(|| format!("invalid JSON at {} line {}", path, idx + 1))?;
        prompts.push(parsed);
    }

    Ok(prompts)
}

fn ratio(n: usize, d: usize) -> f32 {
    if d == 0 {
        return 0.0;
    }
    n as f32 / d as f32
}

use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod error;
mod record;
mod resolve;
mod sheet;
mod similarity;

use config::Config;
use error::Result;
use record::{RecordStore, RemovalSet};
use resolve::{discover_clusters, Resolver};
use similarity::{MatchKind, SimilarityEngine};

/// qdedup - Find and curate duplicate questions in a spreadsheet question bank
#[derive(Parser)]
#[command(name = "qdedup")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true, default_value = ".qdedup.toml")]
    config: PathBuf,

    /// Quiet mode - only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate questions and list duplicate clusters without changing anything
    Check {
        /// Question bank workbook
        input: PathBuf,

        /// Similarity threshold (0 to 100)
        #[arg(short, long, value_parser = clap::value_parser!(u8).range(0..=100))]
        threshold: Option<u8>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Interactively choose duplicates to discard, then write the cleaned workbook
    Dedupe {
        /// Question bank workbook
        input: PathBuf,

        /// Output workbook
        #[arg(short, long, default_value = "out.xlsx")]
        output: PathBuf,

        /// Similarity threshold (0 to 100)
        #[arg(short, long, value_parser = clap::value_parser!(u8).range(0..=100))]
        threshold: Option<u8>,

        /// Workbook mapping document references to classifier text
        #[arg(long)]
        classifiers: Option<PathBuf>,
    },

    /// Write the categorized workbook without resolving duplicates
    Export {
        /// Question bank workbook
        input: PathBuf,

        /// Output workbook
        #[arg(short, long, default_value = "out.xlsx")]
        output: PathBuf,
    },

    /// Show category and answer statistics
    Stats {
        /// Question bank workbook
        input: PathBuf,
    },
}

#[derive(Serialize)]
struct ClusterReport<'a> {
    cluster: usize,
    members: Vec<MemberReport<'a>>,
}

#[derive(Serialize)]
struct MemberReport<'a> {
    qid: i64,
    row: usize,
    category: &'a str,
    text: &'a str,
    score: Option<u8>,
    rule: Option<&'static str>,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.quiet);

    let result = Config::load(&cli.config).and_then(|config| match cli.command {
        Commands::Check { input, threshold, json } => {
            cmd_check(&input, config.with_threshold(threshold)?, json)
        }
        Commands::Dedupe { input, output, threshold, classifiers } => {
            let mut config = config.with_threshold(threshold)?;
            if classifiers.is_some() {
                config.classifiers = classifiers;
            }
            cmd_dedupe(&input, &output, &config)
        }
        Commands::Export { input, output } => cmd_export(&input, &output, &config),
        Commands::Stats { input } => cmd_stats(&input, &config),
    });

    if let Err(e) = result {
        eprintln!("{}: {}", "error".red().bold(), e);
        std::process::exit(1);
    }
}

fn init_tracing(quiet: bool) {
    let filter = EnvFilter::try_from_env("QDEDUP_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if quiet { "warn" } else { "qdedup=info,warn" })
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_writer(io::stderr))
        .init();
}

/// Read, parse and validate the question bank. Progress goes to the log so
/// stdout stays clean for `--json`.
fn load_bank(input: &Path, config: &Config) -> Result<RecordStore> {
    tracing::info!(path = %input.display(), "parsing question bank");

    let table = sheet::read_first_sheet(input)?;
    let bank = sheet::parse_questions(&table, config)?;

    if bank.store.is_empty() {
        tracing::warn!(path = %input.display(), "no questions found");
    }
    let categories: Vec<&str> = bank.store.categories().into_iter().collect();
    tracing::info!(
        questions = bank.store.len(),
        skipped = bank.skipped,
        short_qid_limit = config.short_qid_limit,
        categories = %categories.join(", "),
        "question bank loaded"
    );

    let failed = record::validate_all(&bank.store, config);
    if failed > 0 {
        tracing::warn!(failed, "questions failed validation");
    }

    Ok(bank.store)
}

fn rule_label(kind: MatchKind) -> &'static str {
    match kind {
        MatchKind::Exact => "exact",
        MatchKind::Normalized => "normalized",
        MatchKind::Skipped => "skipped",
        MatchKind::Statistical => "tfidf",
    }
}

fn cmd_check(input: &Path, config: Config, json: bool) -> Result<()> {
    let store = load_bank(input, &config)?;
    let start = Instant::now();

    let engine = SimilarityEngine::new(config.similarity_threshold);
    let clusters = discover_clusters(&store, engine);
    let elapsed = start.elapsed();

    if json {
        let output: Vec<ClusterReport<'_>> = clusters
            .iter()
            .enumerate()
            .map(|(i, cluster)| ClusterReport {
                cluster: i + 1,
                members: cluster
                    .members
                    .iter()
                    .map(|m| MemberReport {
                        qid: m.record.domain_id,
                        row: m.record.source_row,
                        category: &m.record.category,
                        text: &m.record.text,
                        score: m.score.map(|s| s.value),
                        rule: m.score.map(|s| rule_label(s.kind)),
                    })
                    .collect(),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if clusters.is_empty() {
        println!("{}", "No duplicates found above threshold.".green());
        eprintln!("Duplicate check: {:?} ({} questions)", elapsed, store.len());
        return Ok(());
    }

    println!(
        "{} duplicate clusters found (threshold: {}%)",
        clusters.len().to_string().yellow().bold(),
        config.similarity_threshold
    );
    eprintln!("Duplicate check: {:?} ({} questions)\n", elapsed, store.len());

    for (i, cluster) in clusters.iter().enumerate() {
        let seed = cluster.seed();
        println!(
            "{} {}: QID={} [{}] {}",
            "DUP".yellow(),
            i + 1,
            seed.domain_id.to_string().cyan(),
            seed.category,
            seed.text
        );
        for member in &cluster.members[1..] {
            let Some(score) = member.score else {
                continue;
            };
            println!(
                "  {} {}% {} QID={} row {}",
                "~".dimmed(),
                score.value,
                rule_label(score.kind).dimmed(),
                member.record.domain_id,
                member.record.source_row
            );
        }
        println!();
    }

    Ok(())
}

fn cmd_dedupe(input: &Path, output: &Path, config: &Config) -> Result<()> {
    let store = load_bank(input, config)?;

    let classifiers = match &config.classifiers {
        Some(path) => sheet::load_classifiers(path)?,
        None => HashMap::new(),
    };

    println!(
        "{} {} questions (threshold: {}%, '{}' stops early)",
        "Reviewing".cyan().bold(),
        store.len(),
        config.similarity_threshold,
        config.termination_keyword
    );

    let resolution = {
        let stdin = io::stdin();
        let stdout = io::stdout();
        Resolver::new(&store, config, &classifiers).run(&mut stdin.lock(), &mut stdout.lock())?
    };
    tracing::info!(
        outcome = ?resolution.outcome,
        clusters = resolution.clusters_presented,
        removed = ?resolution.removals.iter().collect::<Vec<_>>(),
        "resolution finished"
    );
    if !resolution.outcome.is_complete() {
        tracing::warn!(
            scanned = resolution.records_scanned,
            total = store.len(),
            "duplicate review stopped early, output may still contain duplicates"
        );
    }
    if resolution.removals.is_empty() {
        println!("{}", "No questions marked for removal.".dimmed());
    }

    write_output(output, &store, &resolution.removals, config)
}

fn cmd_export(input: &Path, output: &Path, config: &Config) -> Result<()> {
    let store = load_bank(input, config)?;
    write_output(output, &store, &RemovalSet::new(), config)
}

fn write_output(
    output: &Path,
    store: &RecordStore,
    removals: &RemovalSet,
    config: &Config,
) -> Result<()> {
    let summary = sheet::export(output, store, removals, config.split_by_category)?;

    println!();
    println!("{}", "Export".green().bold());
    println!("  Questions written: {}", summary.written.to_string().cyan());
    println!("  Questions removed: {}", summary.excluded.to_string().cyan());
    println!("  Sheets:            {}", summary.sheets.to_string().cyan());
    println!("{} {}", "Written to".green(), output.display().to_string().cyan());
    Ok(())
}

fn cmd_stats(input: &Path, config: &Config) -> Result<()> {
    let store = load_bank(input, config)?;

    let mut per_category: BTreeMap<&str, usize> = BTreeMap::new();
    let mut answer_counts: BTreeMap<usize, usize> = BTreeMap::new();
    let mut qid_counts: HashMap<i64, usize> = HashMap::new();
    for record in &store {
        *per_category.entry(&record.category).or_insert(0) += 1;
        *answer_counts.entry(record.answers.len()).or_insert(0) += 1;
        *qid_counts.entry(record.domain_id).or_insert(0) += 1;
    }

    println!();
    println!("{}", "Question Bank Statistics".green().bold());
    println!("  Questions:   {}", store.len().to_string().cyan());
    println!("  Categories:  {}", per_category.len().to_string().cyan());

    let mut repeated: Vec<(i64, usize)> = qid_counts.into_iter().filter(|(_, n)| *n > 1).collect();
    repeated.sort_unstable();
    if !repeated.is_empty() {
        println!(
            "  {} {}",
            "Repeated QIDs:".yellow(),
            repeated
                .iter()
                .map(|(qid, n)| format!("{qid} (x{n})"))
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    println!("\n{}", "Questions per category".cyan());
    let max = per_category.values().copied().max().unwrap_or(1);
    for (category, count) in &per_category {
        let bar_len = (count * 30 / max).max(1);
        let bar = "█".repeat(bar_len);
        println!("  {:>24} {:>5} {}", category, count, bar.dimmed());
    }

    println!("\n{}", "Answers per question".cyan());
    for (answers, count) in &answer_counts {
        let flag = if *answers < config.min_answers || *answers >= config.max_answers {
            "!".yellow().to_string()
        } else {
            " ".to_string()
        };
        println!("  {}{:>3} answers: {}", flag, answers, count);
    }

    Ok(())
}

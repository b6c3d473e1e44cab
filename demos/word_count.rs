//! Word frequency counter pipeline
//!
//! Reads lines from stdin, splits into words, counts frequencies in batches
//! on several workers, and prints the top-N words.
//!
//! Usage: cargo run --example word_count --release
//!        (Then type lines of text and press Ctrl-D to finish)

use staged_pipeline::{Many2One, One2Many, Pipeline, Source};
use std::collections::HashMap;
use std::io::{self, BufRead, BufReader};

fn clean(word: &str) -> Option<String> {
    let cleaned: String = word
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect();
    (cleaned.len() > 2).then_some(cleaned)
}

fn count(words: Vec<String>) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for word in words {
        *counts.entry(word).or_insert(0) += 1;
    }
    counts
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    println!("Word Frequency Counter Pipeline");
    println!("================================");
    println!("Enter lines of text (Ctrl-D to finish):");
    println!();

    let lines = BufReader::new(io::stdin())
        .lines()
        .map(|line| line.map_err(anyhow::Error::from));

    let mut running = Pipeline::new(Source::try_new(lines).named("reader").buffer_size(100))
        .then(
            One2Many::new(|line: String| {
                line.split_whitespace()
                    .filter_map(clean)
                    .collect::<Vec<_>>()
            })
            .named("cleaner")
            .buffer_size(200),
        )
        .then(
            Many2One::with_combine(100, count)
                .named("counter")
                .workers(2)
                .buffer_size(50),
        )
        .enter()?;

    let mut totals: HashMap<String, usize> = HashMap::new();
    for partial in running.by_ref() {
        for (word, n) in partial? {
            *totals.entry(word).or_insert(0) += n;
        }
    }

    let mut top: Vec<_> = totals.into_iter().collect();
    top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    println!("\n=== Top 10 Words ===");
    for (i, (word, n)) in top.iter().take(10).enumerate() {
        println!("{:2}. {} ({})", i + 1, word, n);
    }

    println!("\n{}", running.metrics_summary());
    running.exit()?;

    println!("Processing complete!");
    Ok(())
}

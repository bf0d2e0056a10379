use std::path::PathBuf;

use clap::{Parser, Subcommand};
use common::storage::types::index_point::SourceKind;

#[derive(Debug, Parser)]
#[command(name = "recall", version, about = "Answer questions from your own files, browsing history and screen captures")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Answer a question from the indexed data
    Ask {
        question: String,

        /// Restrict retrieval to a source (repeatable)
        #[arg(long = "source", value_parser = parse_source)]
        sources: Vec<SourceKind>,

        /// Only evidence at or after this unix timestamp
        #[arg(long)]
        since: Option<i64>,

        /// Only evidence at or before this unix timestamp
        #[arg(long)]
        until: Option<i64>,

        /// Override the number of evidence items kept
        #[arg(long)]
        k_final: Option<usize>,
    },
    /// Chunk a text file, record its provenance and index it
    IngestText { path: PathBuf },
    /// Show the embedding backend and collection sizes
    Status,
}

fn parse_source(value: &str) -> Result<SourceKind, String> {
    value.parse::<SourceKind>().map_err(|err| err.to_string())
}

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use qsrr_clusters::prelude::*;

#[derive(Parser)]
#[command(name = "qsrr-cli")]
#[command(about = "Retention dataset utilities: leak-free splits, aggregation, stats")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum AggregateMode {
    Mean,
    Median,
}

#[derive(Subcommand)]
enum Commands {
    /// Split a dataset into train/test files without compound leakage.
    Split {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(long)]
        train: PathBuf,
        #[arg(long)]
        test: PathBuf,
        /// Fraction of compounds moved to the test file.
        #[arg(short, long, default_value_t = 0.2)]
        fraction: f32,
        #[arg(short, long)]
        seed: Option<u64>,
    },
    /// Collapse repeat measurements into one record per compound.
    Aggregate {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(short, long, value_enum, default_value_t = AggregateMode::Median)]
        mode: AggregateMode,
        /// Compounds with fewer records than this are dropped.
        #[arg(long, default_value_t = 1)]
        min_records: usize,
    },
    /// Record and compound counts, plus overlap against another file.
    Stats {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(long)]
        against: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Split {
            input,
            train,
            test,
            fraction,
            seed,
        } => {
            let mut data = Dataset::load_from_file(&input)?;
            let held_out = data.split_by_compounds(SplitSize::Fraction(fraction), seed);
            let overlap = data.count_identical(&held_out, &RawSmiles)?;
            anyhow::ensure!(overlap == 0, "split left {overlap} shared compounds");
            data.save_to_file(&train)?;
            held_out.save_to_file(&test)?;
            println!(
                "train: {} records ({} compounds), test: {} records ({} compounds)",
                data.len(),
                data.compounds().len(),
                held_out.len(),
                held_out.compounds().len()
            );
        }
        Commands::Aggregate {
            input,
            output,
            mode,
            min_records,
        } => {
            let data = Dataset::load_from_file(&input)?;
            let mode = match mode {
                AggregateMode::Mean => Aggregate::Mean,
                AggregateMode::Median => Aggregate::Median,
            };
            let aggregated = data.aggregate_by_compounds(&RawSmiles, mode, min_records)?;
            aggregated.save_to_file(&output)?;
            println!(
                "{} records collapsed to {} compounds",
                data.len(),
                aggregated.len()
            );
        }
        Commands::Stats { input, against } => {
            let data = Dataset::load_from_file(&input)?;
            println!(
                "{}: {} records, {} compounds",
                input.display(),
                data.len(),
                data.compounds().len()
            );
            if let Some(other_path) = against {
                let other = Dataset::load_from_file(&other_path)?;
                let shared = data.count_identical(&other, &RawSmiles)?;
                println!(
                    "{}: {} records, {} compounds, {shared} shared with {}",
                    other_path.display(),
                    other.len(),
                    other.compounds().len(),
                    input.display()
                );
            }
        }
    }

    Ok(())
}

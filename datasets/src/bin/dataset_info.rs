use anyhow::{Context, Result};
use clap::Parser;
use datasets::{EvaluationConfig, MapDataset, ReducibleDataset};
use log::info;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "dataset_info")]
#[command(about = "Print summary statistics of a dataset file", long_about = None)]
struct Args {
    /// Dataset file written by MapDataset::write
    path: PathBuf,

    /// Decode role-maps on first access
    #[arg(long)]
    lazy: bool,

    /// Sum over all bins instead of the safe data range
    #[arg(long)]
    all_bins: bool,

    /// Evaluation config JSON file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Also print the summary of the dataset summed over energy
    #[arg(long)]
    image: bool,

    /// Print JSON instead of text
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => EvaluationConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => EvaluationConfig::default(),
    };

    let dataset = MapDataset::read(&args.path, None, args.lazy, config)
        .with_context(|| format!("Failed to read dataset {}", args.path.display()))?;
    info!("Read dataset '{}' ({})", dataset.name(), dataset.stat_type());

    let mut summaries = vec![dataset.info(!args.all_bins)?];
    if args.image {
        let image = dataset
            .to_image(Some(&format!("{}-image", dataset.name())))
            .context("Failed to sum dataset over energy")?;
        summaries.push(image.info(!args.all_bins)?);
    }

    for summary in &summaries {
        if args.json {
            println!("{}", serde_json::to_string_pretty(summary)?);
        } else {
            println!("{summary}");
        }
    }
    Ok(())
}

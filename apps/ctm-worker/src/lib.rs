use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use ctm_service::{Pipeline, Providers, matching::StageReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Stage {
	/// Condition lists, indexes and candidate retrieval.
	Retrieve,
	/// Criterion-level eligibility judgments.
	Match,
	/// Trial-level self-assessments.
	Assess,
	All,
}
impl Stage {
	pub fn includes(self, other: Self) -> bool {
		self == Self::All || self == other
	}
}

#[derive(Debug, Parser)]
#[command(
	version = ctm_cli::VERSION,
	rename_all = "kebab",
	styles = ctm_cli::styles(),
)]
pub struct Args {
	#[arg(long, short = 'c', value_name = "FILE")]
	pub config: PathBuf,
	#[arg(long, value_enum, default_value_t = Stage::All)]
	pub stage: Stage,
}

pub async fn run(args: Args) -> color_eyre::Result<()> {
	let config = ctm_config::load(&args.config)?;
	let filter = EnvFilter::new(config.service.log_level.clone());

	tracing_subscriber::fmt().with_env_filter(filter).init();

	let pipeline = Pipeline::load(config, Providers::default())?;
	let mut reports = serde_json::Map::new();

	if args.stage.includes(Stage::Retrieve) {
		insert_report(&mut reports, "retrieve", pipeline.run_retrieval().await?)?;
	}
	if args.stage.includes(Stage::Match) {
		insert_report(&mut reports, "match", pipeline.run_matching().await?)?;
	}
	if args.stage.includes(Stage::Assess) {
		insert_report(&mut reports, "assess", pipeline.run_assessment().await?)?;
	}

	let json = serde_json::to_string_pretty(&reports)?;

	println!("{json}");

	Ok(())
}

fn insert_report(
	reports: &mut serde_json::Map<String, serde_json::Value>,
	stage: &str,
	report: StageReport,
) -> color_eyre::Result<()> {
	if report.retryable > 0 {
		tracing::warn!(stage, retryable = report.retryable, "Some units will be retried on the next run.");
	}

	reports.insert(stage.to_string(), serde_json::to_value(report)?);

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn stage_defaults_to_all() {
		let args = Args::try_parse_from(["ctm-worker", "--config", "ctm.toml"]).expect("parse");

		assert_eq!(args.stage, Stage::All);
		assert!(args.stage.includes(Stage::Match));
	}

	#[test]
	fn single_stage_runs_alone() {
		let args = Args::try_parse_from(["ctm-worker", "-c", "ctm.toml", "--stage", "assess"])
			.expect("parse");

		assert!(args.stage.includes(Stage::Assess));
		assert!(!args.stage.includes(Stage::Retrieve));
	}
}

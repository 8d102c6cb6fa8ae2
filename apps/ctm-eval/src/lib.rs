pub mod metrics;

use std::{collections::BTreeMap, fs, path::PathBuf};

use clap::Parser;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use ctm_service::{
	MatchScorer, Pipeline, Providers, ScoreVariant,
	pipeline::CohortRanking,
	ranking::{self, MissingData, RankedTrial},
	retrieval::{self, Recall},
};
use metrics::{CohortMetrics, PatientMetrics, RankingEvaluator};

#[derive(Debug, Parser)]
#[command(
	version = ctm_cli::VERSION,
	rename_all = "kebab",
	styles = ctm_cli::styles(),
)]
pub struct Args {
	#[arg(long, short = 'c', value_name = "FILE")]
	pub config: PathBuf,
	/// Write the report here instead of stdout.
	#[arg(long, short = 'o', value_name = "FILE")]
	pub output: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
pub struct EvalReport {
	pub dataset: DatasetInfo,
	pub settings: EvalSettings,
	pub summary: EvalSummary,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub variants: Option<BTreeMap<ScoreVariant, CohortMetrics>>,
	pub missing: MissingSummary,
	pub patients: Vec<PatientReport>,
}

/// Substituted defaults plus patients the metric rules left out.
#[derive(Debug, Serialize)]
pub struct MissingSummary {
	#[serde(flatten)]
	pub data: MissingData,
	pub patients_skipped_for_metrics: usize,
	pub patients_skipped_for_auc: usize,
}

#[derive(Debug, Serialize)]
pub struct DatasetInfo {
	pub name: String,
	pub trial_count: usize,
	pub patient_count: usize,
	pub corpus_fingerprint: String,
}

#[derive(Debug, Serialize)]
pub struct EvalSettings {
	pub cutoff: u32,
	pub fusion_k: u32,
	pub candidate_limit: u32,
	pub lexical_weight: f32,
	pub dense_weight: f32,
	pub match_epsilon: f64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub max_trials_per_patient: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct EvalSummary {
	#[serde(flatten)]
	pub metrics: CohortMetrics,
	pub recall: Recall,
}

#[derive(Debug, Serialize)]
pub struct PatientReport {
	pub patient_id: String,
	pub recall: Recall,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub metrics: Option<PatientMetrics>,
	pub ranked: Vec<RankedTrial>,
}

pub async fn run(args: Args) -> color_eyre::Result<()> {
	let config = ctm_config::load(&args.config)?;
	let filter = EnvFilter::new(config.service.log_level.clone());

	tracing_subscriber::fmt().with_env_filter(filter).init();

	let pipeline = Pipeline::load(config, Providers::default())?;
	let report = build_report(&pipeline)?;
	let json = serde_json::to_string_pretty(&report)?;

	tracing::info!(
		patients = report.summary.metrics.evaluated_patients,
		skipped = report.summary.metrics.skipped_patients,
		"Evaluation finished."
	);

	match args.output {
		Some(path) => fs::write(&path, format!("{json}\n"))?,
		None => println!("{json}"),
	}

	Ok(())
}

/// Ranks every patient from the caches and scores the rankings against ground truth.
pub fn build_report(pipeline: &Pipeline) -> ctm_service::Result<EvalReport> {
	let cfg = pipeline.config();
	let dataset = pipeline.dataset();
	let cohort = pipeline.rank()?;
	let evaluator = RankingEvaluator::new(cfg.evaluation.cutoff);
	let scored = cohort
		.patients
		.iter()
		.map(|patient| patient.ranked.labels_and_scores())
		.collect::<Vec<_>>();
	let metrics = evaluator.evaluate(scored.iter().map(Vec::as_slice));
	let variants = cfg
		.evaluation
		.variants
		.then(|| evaluate_variants(&cohort, &evaluator, cfg.ranking.match_epsilon));
	let patients = cohort
		.patients
		.iter()
		.zip(&scored)
		.map(|(patient, items)| PatientReport {
			patient_id: patient.patient_id.clone(),
			recall: patient.recall,
			metrics: evaluator.evaluate_patient(items),
			ranked: patient.ranked.ranked.clone(),
		})
		.collect();

	Ok(EvalReport {
		dataset: DatasetInfo {
			name: cfg.dataset.name.clone(),
			trial_count: dataset.corpus.len(),
			patient_count: dataset.patients.len(),
			corpus_fingerprint: dataset.corpus.fingerprint()?,
		},
		settings: EvalSettings {
			cutoff: cfg.evaluation.cutoff,
			fusion_k: cfg.retrieval.fusion_k,
			candidate_limit: cfg.retrieval.candidate_limit,
			lexical_weight: cfg.retrieval.lexical_weight,
			dense_weight: cfg.retrieval.dense_weight,
			match_epsilon: cfg.ranking.match_epsilon,
			max_trials_per_patient: cfg.matching.max_trials_per_patient,
		},
		summary: EvalSummary {
			metrics,
			recall: retrieval::mean_recall(cohort.patients.iter().map(|patient| &patient.recall)),
		},
		variants,
		missing: MissingSummary {
			data: cohort.missing,
			patients_skipped_for_metrics: metrics.skipped_patients,
			patients_skipped_for_auc: metrics.evaluated_patients - metrics.auc_patients,
		},
		patients,
	})
}

/// Re-ranks every patient by each single-signal score. Trials where a variant is undefined are
/// dropped from that variant's ranking only.
fn evaluate_variants(
	cohort: &CohortRanking,
	evaluator: &RankingEvaluator,
	match_epsilon: f64,
) -> BTreeMap<ScoreVariant, CohortMetrics> {
	let scorer = MatchScorer::new(match_epsilon);
	let mut out = BTreeMap::new();

	for variant in ScoreVariant::ALL {
		let scored = cohort
			.patients
			.iter()
			.map(|patient| {
				ranking::rank_by(&patient.patient_id, &patient.records, |record| {
					variant.value(&scorer, &record.counts(), record.self_assessment.as_ref())
				})
				.labels_and_scores()
			})
			.collect::<Vec<_>>();

		out.insert(variant, evaluator.evaluate(scored.iter().map(Vec::as_slice)));
	}

	out
}

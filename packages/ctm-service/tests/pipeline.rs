use std::{collections::HashMap, sync::Arc};

use ctm_domain::{CriterionGroup, EligibilityLabel, PatientNote};
use ctm_service::{
	Caches, EligibilityOracle, Error, HybridFusionRetriever, LexicalIndex, LlmOracle, OracleError,
	Pipeline, VectorIndex,
	matching::{self, MatchRecord},
};
use ctm_storage::{JsonLogStore, KvStore, MemoryStore};
use ctm_testkit::{FlakyEmbedding, HashEmbedding, ScriptedChat, ScriptedOracle, UnusedEmbedding};

fn pipeline(oracle: Arc<ScriptedOracle>, caches: Caches, generate: bool) -> Pipeline {
	let dir = std::env::temp_dir();
	let mut cfg = ctm_testkit::test_config(&dir);

	cfg.conditions.generate = generate;

	let dataset = ctm_testkit::toy_dataset(
		vec![
			ctm_testkit::patient("p1", "Adult with wheezing.", &[("T1", 2), ("T2", 1), ("T3", 0)]),
			ctm_testkit::patient("p2", "Child with alpha rash.", &[("T1", 0), ("T3", 2)]),
		],
		&[("p1", &["alpha", "beta"])],
	);

	Pipeline::new(cfg, dataset, caches, Arc::new(UnusedEmbedding), oracle.clone(), oracle)
}

fn scripted() -> Arc<ScriptedOracle> {
	Arc::new(
		ScriptedOracle::new()
			.with_label("T2", CriterionGroup::Exclusion, EligibilityLabel::Excluded)
			.with_assessment("T1", 80.0, 60.0),
	)
}

#[tokio::test]
async fn lexical_only_fusion_matches_formula() {
	let corpus = ctm_testkit::toy_corpus();
	let lexical = LexicalIndex::build(&corpus, &Default::default()).expect("index");
	let cfg = ctm_testkit::embedding_config("test-query");
	let retriever = HybridFusionRetriever::new(&lexical, None, &cfg, &UnusedEmbedding, 60, 10);
	let conditions = vec!["alpha".to_string(), "beta".to_string()];
	let fused = retriever.retrieve_scored("p1", &conditions, 2, 1.0, 0.0).await.expect("retrieve");

	assert_eq!(fused.len(), 2);
	assert_eq!(fused[0].trial_id, "T2");
	assert!((fused[0].score - (1.0 / 61.0 + 1.0 / 60.0 / 2.0)).abs() < 1e-15);
	assert_eq!(fused[1].trial_id, "T1");
	assert!((fused[1].score - 1.0 / 60.0).abs() < 1e-15);

	let none = retriever.retrieve("p1", &[], 2, 1.0, 0.0).await.expect("retrieve");

	assert!(none.is_empty());
}

#[tokio::test]
async fn trial_embeddings_are_computed_once() {
	let corpus = ctm_testkit::toy_corpus();
	let cfg = ctm_testkit::embedding_config("test-article");
	let store = MemoryStore::new();
	let embedding = HashEmbedding::new();
	let first = VectorIndex::build(&corpus, &cfg, &embedding, &store).await.expect("build");

	assert_eq!(first.len(), corpus.len());
	assert_eq!(embedding.embedded_texts(), corpus.len());
	assert_eq!(embedding.calls(), 3);

	let second = VectorIndex::build(&corpus, &cfg, &embedding, &store).await.expect("rebuild");

	assert_eq!(second.len(), corpus.len());
	assert_eq!(embedding.embedded_texts(), corpus.len());

	let query_cfg = ctm_testkit::embedding_config("test-query");
	let hits = second
		.search_texts(&query_cfg, &embedding, &["gamma".to_string()], corpus.len())
		.await
		.expect("search");
	let t3 = hits[0].iter().find(|(trial_id, _)| trial_id == "T3").expect("T3 must be ranked");

	assert_eq!(hits[0].len(), corpus.len());
	assert!(t3.1 >= 2.0, "Unexpected similarity: {}", t3.1);
}

#[tokio::test]
async fn hybrid_fusion_sums_lexical_and_dense_contributions() {
	let corpus = ctm_testkit::toy_corpus();
	let lexical = LexicalIndex::build(&corpus, &Default::default()).expect("index");
	let article_cfg = ctm_testkit::embedding_config("test-article");
	let query_cfg = ctm_testkit::embedding_config("test-query");
	let embedding = HashEmbedding::new();
	let vector =
		VectorIndex::build(&corpus, &article_cfg, &embedding, &MemoryStore::new()).await.expect("build");
	let retriever =
		HybridFusionRetriever::new(&lexical, Some(&vector), &query_cfg, &embedding, 60, 10);
	let conditions = vec!["alpha".to_string(), "beta gamma".to_string()];
	let fused = retriever
		.retrieve_scored("p1", &conditions, corpus.len(), 1.0, 1.0)
		.await
		.expect("retrieve");
	let mut expected = HashMap::<String, f64>::new();

	for (condition_index, condition) in conditions.iter().enumerate() {
		let decay = 1.0 / (condition_index as f64 + 1.0);
		let query = HashEmbedding::vector(condition, ctm_testkit::TEST_DIMENSIONS as usize);
		let lexical_ids = lexical.search(condition, 10).into_iter().map(|(trial_id, _)| trial_id);
		let dense_ids =
			vector.search(&query, 10).expect("search").into_iter().map(|(trial_id, _)| trial_id);

		for (rank, trial_id) in lexical_ids.enumerate().chain(dense_ids.enumerate()) {
			*expected.entry(trial_id).or_default() += 1.0 / (rank as f64 + 60.0) * decay;
		}
	}

	// Dense search ranks every trial, so the fused set is the whole corpus.
	assert_eq!(fused.len(), corpus.len());
	assert_eq!(expected.len(), corpus.len());

	for candidate in &fused {
		let want = expected[&candidate.trial_id];

		assert!(
			(candidate.score - want).abs() < 1e-12,
			"{}: fused {} != {}",
			candidate.trial_id,
			candidate.score,
			want
		);
	}

	let lexical_only =
		retriever.retrieve_scored("p1", &conditions, corpus.len(), 1.0, 0.0).await.expect("retrieve");
	let t1_lexical = lexical_only.iter().find(|candidate| candidate.trial_id == "T1").expect("T1");
	let t1_hybrid = fused.iter().find(|candidate| candidate.trial_id == "T1").expect("T1");

	assert!(t1_hybrid.score > t1_lexical.score);
	assert!(fused.windows(2).all(|pair| pair[0].score >= pair[1].score));
}

#[tokio::test]
async fn embedding_build_resumes_after_a_failed_batch() {
	let dir = tempfile::tempdir().expect("Failed to create temp dir.");
	let path = dir.path().join("trial_embeddings.jsonl");
	let corpus = ctm_testkit::toy_corpus();
	let cfg = ctm_testkit::embedding_config("test-article");
	// Batches of two: the second of three requests fails.
	let embedding = FlakyEmbedding::new(2);

	{
		let store = JsonLogStore::open(&path).expect("Failed to open store.");
		let err = VectorIndex::build(&corpus, &cfg, &embedding, &store)
			.await
			.expect_err("Expected the second batch to fail.");

		assert!(matches!(err, Error::Provider(_)), "Unexpected error: {err}");
		assert_eq!(
			store.keys().expect("keys"),
			vec!["toy/test-article/T1".to_string(), "toy/test-article/T2".to_string()]
		);
		assert_eq!(embedding.embedded_texts(), 2);
	}

	let store = JsonLogStore::open(&path).expect("Failed to reopen store.");
	let index = VectorIndex::build(&corpus, &cfg, &embedding, &store).await.expect("resume");

	assert_eq!(index.len(), corpus.len());
	assert_eq!(store.len(), corpus.len());
	assert_eq!(embedding.embedded_texts(), corpus.len());
	assert_eq!(embedding.calls(), 4);
}

#[tokio::test]
async fn rejected_oracle_requests_abort_the_stage() {
	let oracle = scripted();
	let caches = Caches::in_memory();
	let pipeline = pipeline(oracle.clone(), caches.clone(), false);

	pipeline.run_retrieval().await.expect("retrieval");
	oracle.fail_next("T2", OracleError::Fatal { message: "401 Unauthorized".to_string() });

	let err = pipeline.run_matching().await.expect_err("Expected matching to abort.");

	assert!(matches!(err, Error::Oracle(OracleError::Fatal { .. })), "Unexpected error: {err}");
	assert!(!caches.matching.contains(&matching::match_key("p1", 1, "T2")).expect("contains"));

	let resumed = pipeline.run_matching().await.expect("matching");

	assert_eq!(resumed.retryable, 0);
	assert!(caches.matching.contains(&matching::match_key("p1", 1, "T2")).expect("contains"));
}

#[tokio::test]
async fn full_run_ranks_and_is_idempotent() {
	let oracle = scripted();
	let pipeline = pipeline(oracle.clone(), Caches::in_memory(), false);
	let retrieval = pipeline.run_retrieval().await.expect("retrieval");

	assert_eq!(retrieval.completed, 2);

	let matching = pipeline.run_matching().await.expect("matching");
	let assessment = pipeline.run_assessment().await.expect("assessment");

	assert_eq!(matching.completed, assessment.completed);
	assert_eq!(matching.retryable, 0);

	let first = pipeline.rank().expect("rank");
	let p1 = &first.patients[0];
	let order = p1.ranked.ranked.iter().map(|trial| trial.trial_id.as_str()).collect::<Vec<_>>();

	assert_eq!(order, vec!["T1", "T2"]);
	assert!((p1.ranked.ranked[0].score - (2.0 / (2.0 + 1e-9) + 1.4)).abs() < 1e-9);
	assert!((p1.ranked.ranked[1].score - (2.0 / (2.0 + 1e-9) - 1.0 + 0.5)).abs() < 1e-9);
	assert_eq!(p1.recall.recall, Some(1.0));

	let judge_calls = oracle.judge_calls();
	let assess_calls = oracle.assess_calls();
	let again = pipeline.run_matching().await.expect("matching");

	pipeline.run_assessment().await.expect("assessment");

	assert_eq!(again.completed, 0);
	assert_eq!(again.cached, matching.completed);
	assert_eq!(oracle.judge_calls(), judge_calls);
	assert_eq!(oracle.assess_calls(), assess_calls);
	assert_eq!(
		serde_json::to_string(&first).expect("serialize"),
		serde_json::to_string(&pipeline.rank().expect("rank")).expect("serialize")
	);
}

#[tokio::test]
async fn retryable_failures_are_retried_on_resume() {
	let oracle = scripted();
	let caches = Caches::in_memory();
	let pipeline = pipeline(oracle.clone(), caches.clone(), false);

	pipeline.run_retrieval().await.expect("retrieval");
	oracle.fail_next("T2", OracleError::Retryable { message: "rate limited".to_string() });

	let first = pipeline.run_matching().await.expect("matching");

	assert_eq!(first.retryable, 1);
	assert!(!caches.matching.contains(&matching::match_key("p1", 1, "T2")).expect("contains"));

	let second = pipeline.run_matching().await.expect("matching");

	assert_eq!(second.retryable, 0);
	assert_eq!(second.completed, 1);
	assert!(caches.matching.contains(&matching::match_key("p1", 1, "T2")).expect("contains"));
}

#[tokio::test]
async fn malformed_replies_are_cached_as_empty() {
	let oracle = scripted();
	let caches = Caches::in_memory();
	let pipeline = pipeline(oracle.clone(), caches.clone(), false);

	pipeline.run_retrieval().await.expect("retrieval");
	oracle.fail_next("T1", OracleError::Malformed { message: "not json".to_string() });

	let report = pipeline.run_matching().await.expect("matching");

	assert_eq!(report.malformed, 1);

	let record: MatchRecord =
		ctm_storage::get_typed(caches.matching.as_ref(), &matching::match_key("p1", 2, "T1"))
			.expect("get")
			.expect("record must be cached");

	assert!(record.inclusion.is_empty());
	assert_eq!(record.malformed, vec![CriterionGroup::Inclusion]);
	assert_eq!(record.exclusion.len(), 1);

	let ranking = pipeline.rank().expect("rank");

	assert_eq!(ranking.missing.malformed_judgments, 1);
	assert_eq!(ranking.missing.missing_self_assessment, ranking.missing.pairs);
}

#[tokio::test]
async fn generated_conditions_are_cached_and_retried() {
	let oracle = Arc::new(ScriptedOracle::new().with_conditions("rash", &["gamma"]));
	let caches = Caches::in_memory();
	let pipeline = pipeline(oracle.clone(), caches.clone(), true);

	oracle.fail_next("rash", OracleError::Retryable { message: "timeout".to_string() });

	let first = pipeline.run_retrieval().await.expect("retrieval");

	assert_eq!(first.completed, 1);
	assert_eq!(first.missing, 1);
	assert!(!caches.candidates.contains("p2").expect("contains"));

	let second = pipeline.run_retrieval().await.expect("retrieval");

	assert_eq!(second.completed, 1);
	assert_eq!(pipeline.candidate_ids().expect("ids")["p2"], vec!["T3".to_string()]);

	let calls = oracle.generate_calls();

	pipeline.run_retrieval().await.expect("retrieval");

	assert_eq!(oracle.generate_calls(), calls);
}

#[tokio::test]
async fn file_caches_survive_reopening() {
	let dir = tempfile::tempdir().expect("Failed to create temp dir.");
	let oracle = scripted();

	{
		let caches = Caches::open(dir.path(), "toy").expect("open");
		let pipeline = pipeline(oracle.clone(), caches, false);

		pipeline.run_retrieval().await.expect("retrieval");
		pipeline.run_matching().await.expect("matching");
	}

	let calls = oracle.judge_calls();
	let caches = Caches::open(dir.path(), "toy").expect("reopen");
	let pipeline = pipeline(oracle.clone(), caches, false);
	let report = pipeline.run_matching().await.expect("matching");

	assert_eq!(report.completed, 0);
	assert_eq!(oracle.judge_calls(), calls);
	assert!(dir.path().join("toy").join("matching.jsonl").exists());
}

#[tokio::test]
async fn llm_oracle_parses_and_types_failures() {
	let chat = Arc::new(ScriptedChat::new("not json at all"));

	chat.push(Ok("```json\n{\"0\": [\"Adult.\", [0], \"included\"], \"1\": [\"?\", [], \"excluded\"]}\n```"
		.to_string()));
	chat.push(Err(ctm_providers::Error::InvalidConfig { message: "bad header".to_string() }));

	let cfg = ctm_testkit::test_config(&std::env::temp_dir());
	let oracle = LlmOracle::new(cfg.providers.oracle.clone(), chat.clone(), 5);
	let trial = ctm_testkit::trial("T1", "Alpha study", "alpha");
	let note = PatientNote::from_text("A 40-year-old adult.");
	let criteria = trial.criteria(CriterionGroup::Inclusion, 5);
	let judged = oracle.judge(&note, &trial, CriterionGroup::Inclusion, &criteria).await.expect("judge");

	assert_eq!(judged.len(), 1);
	assert_eq!(judged[&0].label, EligibilityLabel::Included);

	let rejected = oracle.judge(&note, &trial, CriterionGroup::Inclusion, &criteria).await;

	assert!(matches!(rejected, Err(OracleError::Fatal { .. })));

	let malformed = oracle.judge(&note, &trial, CriterionGroup::Inclusion, &criteria).await;

	assert!(matches!(malformed, Err(OracleError::Malformed { .. })));
	assert_eq!(chat.calls(), 3);
}

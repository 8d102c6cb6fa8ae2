use serde_json::json;

use ctm_storage::{Error, JsonLogStore, KvStore, MemoryStore};

#[test]
fn existing_keys_are_never_overwritten() {
	let dir = tempfile::tempdir().expect("Failed to create temp dir.");
	let store = JsonLogStore::open(dir.path().join("cache.jsonl")).expect("Failed to open store.");

	assert!(store.insert_if_absent("p1/inclusion/NCT1", json!({"0": "first"})).expect("insert"));
	assert!(!store.insert_if_absent("p1/inclusion/NCT1", json!({"0": "second"})).expect("insert"));
	assert_eq!(
		store.get("p1/inclusion/NCT1").expect("get"),
		Some(json!({"0": "first"}))
	);
}

#[test]
fn reopened_store_sees_persisted_entries() {
	let dir = tempfile::tempdir().expect("Failed to create temp dir.");
	let path = dir.path().join("nested").join("cache.jsonl");

	{
		let store = JsonLogStore::open(&path).expect("Failed to open store.");

		store.insert_if_absent("a", json!(1)).expect("insert");
		store.insert_if_absent("b", json!([1.0, 2.0])).expect("insert");
	}

	let reopened = JsonLogStore::open(&path).expect("Failed to reopen store.");

	assert_eq!(reopened.keys().expect("keys"), vec!["a".to_string(), "b".to_string()]);
	assert_eq!(reopened.get("b").expect("get"), Some(json!([1.0, 2.0])));
}

#[test]
fn batch_insert_skips_present_keys() {
	let store = MemoryStore::new();

	store.insert_if_absent("a", json!("kept")).expect("insert");

	let inserted = store
		.insert_many_if_absent(vec![
			("a".to_string(), json!("dropped")),
			("b".to_string(), json!("new")),
		])
		.expect("batch insert");

	assert_eq!(inserted, 1);
	assert_eq!(store.get("a").expect("get"), Some(json!("kept")));
	assert_eq!(store.len(), 2);
}

#[test]
fn corrupt_interior_line_is_reported() {
	let dir = tempfile::tempdir().expect("Failed to create temp dir.");
	let path = dir.path().join("cache.jsonl");

	std::fs::write(&path, "{\"key\": \"a\"\n{\"key\":\"b\",\"value\":1}\n")
		.expect("Failed to write corrupt file.");

	let err = JsonLogStore::open(&path).expect_err("Expected corrupt file error.");

	assert!(matches!(err, Error::Corrupt { .. }), "Unexpected error: {err}");
}

#[test]
fn truncated_trailing_line_is_ignored_on_reopen() {
	let dir = tempfile::tempdir().expect("Failed to create temp dir.");
	let path = dir.path().join("cache.jsonl");

	{
		let store = JsonLogStore::open(&path).expect("Failed to open store.");

		store.insert_if_absent("NCT1", json!([0.1, 0.2])).expect("insert");
		store.insert_if_absent("NCT2", json!([0.3, 0.4])).expect("insert");
	}

	let full = std::fs::read(&path).expect("Failed to read log.");

	// Cut the second record mid-value, as a crash during the append would.
	std::fs::write(&path, &full[..full.len() - 6]).expect("Failed to truncate log.");

	let reopened = JsonLogStore::open(&path).expect("Failed to reopen store.");

	assert_eq!(reopened.keys().expect("keys"), vec!["NCT1".to_string()]);
	assert!(reopened.insert_if_absent("NCT2", json!([0.5, 0.6])).expect("insert"));
	drop(reopened);

	let again = JsonLogStore::open(&path).expect("Failed to reopen store.");

	assert_eq!(again.get("NCT2").expect("get"), Some(json!([0.5, 0.6])));
	assert_eq!(again.len(), 2);
}

#[test]
fn duplicate_lines_replay_first_key_wins() {
	let dir = tempfile::tempdir().expect("Failed to create temp dir.");
	let path = dir.path().join("cache.jsonl");

	std::fs::write(
		&path,
		"{\"key\":\"a\",\"value\":\"first\"}\n{\"key\":\"a\",\"value\":\"second\"}\n",
	)
	.expect("Failed to write log.");

	let store = JsonLogStore::open(&path).expect("Failed to open store.");

	assert_eq!(store.get("a").expect("get"), Some(json!("first")));

	// Opening compacts the log down to one line per key.
	let raw = std::fs::read_to_string(&path).expect("Failed to read log.");

	assert_eq!(raw.lines().count(), 1);
}

#[test]
fn appends_grow_the_log_linearly() {
	let dir = tempfile::tempdir().expect("Failed to create temp dir.");
	let path = dir.path().join("cache.jsonl");
	let store = JsonLogStore::open(&path).expect("Failed to open store.");
	let vector = json!(vec![0.25_f64; 64]);
	let mut sizes = Vec::new();

	for batch in 0..8 {
		let entries = (0..16)
			.map(|offset| (format!("NCT{:04}", batch * 16 + offset), vector.clone()))
			.collect();

		assert_eq!(store.insert_many_if_absent(entries).expect("batch insert"), 16);

		sizes.push(std::fs::metadata(&path).expect("Failed to stat log.").len());
	}

	let step = sizes[0];

	for (index, size) in sizes.iter().enumerate() {
		assert_eq!(*size, step * (index as u64 + 1));
	}
}

#[test]
fn compaction_preserves_entries() {
	let dir = tempfile::tempdir().expect("Failed to create temp dir.");
	let path = dir.path().join("cache.jsonl");
	let store = JsonLogStore::open(&path).expect("Failed to open store.");

	store.insert_if_absent("b", json!(2)).expect("insert");
	store.insert_if_absent("a", json!(1)).expect("insert");
	store.compact().expect("compact");
	store.insert_if_absent("c", json!(3)).expect("insert after compaction");
	drop(store);

	let reopened = JsonLogStore::open(&path).expect("Failed to reopen store.");

	assert_eq!(
		reopened.keys().expect("keys"),
		vec!["a".to_string(), "b".to_string(), "c".to_string()]
	);
	assert_eq!(std::fs::read_to_string(&path).expect("read").lines().count(), 3);
}

#[test]
fn typed_helpers_round_trip_through_the_store() {
	let store = MemoryStore::new();

	ctm_storage::insert_typed(&store, "scores", &vec![0.5_f64, 1.5]).expect("insert");

	let scores: Option<Vec<f64>> = ctm_storage::get_typed(&store, "scores").expect("get");

	assert_eq!(scores, Some(vec![0.5, 1.5]));
}

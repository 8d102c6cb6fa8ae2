use std::{collections::BTreeMap, sync::Mutex};

use serde_json::Value;

use crate::{KvStore, Result};

#[derive(Debug, Default)]
pub struct MemoryStore {
	entries: Mutex<BTreeMap<String, Value>>,
}
impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.entries.lock().unwrap_or_else(|err| err.into_inner()).len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

impl KvStore for MemoryStore {
	fn get(&self, key: &str) -> Result<Option<Value>> {
		let entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());

		Ok(entries.get(key).cloned())
	}

	fn contains(&self, key: &str) -> Result<bool> {
		let entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());

		Ok(entries.contains_key(key))
	}

	fn insert_if_absent(&self, key: &str, value: Value) -> Result<bool> {
		let mut entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());

		if entries.contains_key(key) {
			return Ok(false);
		}

		entries.insert(key.to_string(), value);

		Ok(true)
	}

	fn insert_many_if_absent(&self, batch: Vec<(String, Value)>) -> Result<usize> {
		let mut entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());
		let mut inserted = 0;

		for (key, value) in batch {
			if entries.contains_key(&key) {
				continue;
			}

			entries.insert(key, value);

			inserted += 1;
		}

		Ok(inserted)
	}

	fn keys(&self) -> Result<Vec<String>> {
		let entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());

		Ok(entries.keys().cloned().collect())
	}
}

use std::{
	collections::BTreeMap,
	fs::{self, File, OpenOptions},
	io::{Seek, SeekFrom, Write},
	path::{Path, PathBuf},
	sync::Mutex,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::NamedTempFile;

use crate::{Error, KvStore, Result};

#[derive(Serialize)]
struct RecordRef<'a> {
	key: &'a str,
	value: &'a Value,
}

#[derive(Deserialize)]
struct Record {
	key: String,
	value: Value,
}

#[derive(Debug)]
struct LogState {
	entries: BTreeMap<String, Value>,
	file: Option<File>,
	len: u64,
}

/// What replaying a log found besides its entries.
#[derive(Debug, Default)]
struct Replay {
	entries: BTreeMap<String, Value>,
	duplicates: usize,
	torn_tail: bool,
}

/// JSON-lines log on disk. Every write appends one `{"key", "value"}` line per new key and
/// syncs before the in-memory view changes.
///
/// Replay is first-key-wins. A torn last line is dropped on open, so a reopened store only
/// ever holds complete entries.
#[derive(Debug)]
pub struct JsonLogStore {
	path: PathBuf,
	state: Mutex<LogState>,
}
impl JsonLogStore {
	pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
		let path = path.into();
		let replay = if path.exists() {
			let raw = fs::read(&path).map_err(|source| Error::Io { path: path.clone(), source })?;

			replay(&path, &raw)?
		} else {
			Replay::default()
		};
		let store = Self {
			path,
			state: Mutex::new(LogState { entries: replay.entries, file: None, len: 0 }),
		};

		if replay.torn_tail || replay.duplicates > 0 {
			tracing::warn!(
				path = %store.path.display(),
				torn_tail = replay.torn_tail,
				duplicates = replay.duplicates,
				"Cache log needs repair. Compacting."
			);

			store.compact()?;
		}

		tracing::debug!(path = %store.path.display(), entries = store.len(), "Opened cache log.");

		Ok(store)
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn len(&self) -> usize {
		self.state.lock().unwrap_or_else(|err| err.into_inner()).entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Rewrites the log with one line per key through a temp file and rename.
	pub fn compact(&self) -> Result<()> {
		let mut state = self.state.lock().unwrap_or_else(|err| err.into_inner());
		let parent = self.parent_dir()?;
		let mut payload = Vec::new();

		for (key, value) in &state.entries {
			encode_line(&mut payload, key, value)?;
		}

		let mut tmp = NamedTempFile::new_in(&parent)
			.map_err(|source| Error::Io { path: parent.clone(), source })?;

		tmp.write_all(&payload).map_err(|source| Error::Io { path: tmp.path().to_path_buf(), source })?;
		tmp.as_file()
			.sync_all()
			.map_err(|source| Error::Io { path: tmp.path().to_path_buf(), source })?;
		tmp.persist(&self.path)
			.map_err(|err| Error::Io { path: self.path.clone(), source: err.error })?;

		// The old handle points at the replaced inode.
		state.file = None;
		state.len = payload.len() as u64;

		Ok(())
	}

	fn parent_dir(&self) -> Result<PathBuf> {
		let parent = match self.path.parent() {
			Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
			_ => PathBuf::from("."),
		};

		fs::create_dir_all(&parent).map_err(|source| Error::Io { path: parent.clone(), source })?;

		Ok(parent)
	}

	fn append(&self, state: &mut LogState, payload: &[u8]) -> Result<()> {
		let mut file = match state.file.take() {
			Some(file) => file,
			None => {
				self.parent_dir()?;

				let mut file = OpenOptions::new()
					.create(true)
					.append(true)
					.open(&self.path)
					.map_err(|source| Error::Io { path: self.path.clone(), source })?;

				state.len = file
					.seek(SeekFrom::End(0))
					.map_err(|source| Error::Io { path: self.path.clone(), source })?;

				file
			},
		};
		let written = file.write_all(payload).and_then(|()| file.sync_data());

		if let Err(source) = written {
			// Cut a partial append so the next write starts on a fresh line.
			let _ = file.set_len(state.len);

			state.file = Some(file);

			return Err(Error::Io { path: self.path.clone(), source });
		}

		state.len += payload.len() as u64;
		state.file = Some(file);

		Ok(())
	}
}

impl KvStore for JsonLogStore {
	fn get(&self, key: &str) -> Result<Option<Value>> {
		let state = self.state.lock().unwrap_or_else(|err| err.into_inner());

		Ok(state.entries.get(key).cloned())
	}

	fn contains(&self, key: &str) -> Result<bool> {
		let state = self.state.lock().unwrap_or_else(|err| err.into_inner());

		Ok(state.entries.contains_key(key))
	}

	fn insert_if_absent(&self, key: &str, value: Value) -> Result<bool> {
		let inserted = self.insert_many_if_absent(vec![(key.to_string(), value)])?;

		Ok(inserted == 1)
	}

	fn insert_many_if_absent(&self, batch: Vec<(String, Value)>) -> Result<usize> {
		let mut state = self.state.lock().unwrap_or_else(|err| err.into_inner());
		let mut fresh = BTreeMap::new();

		for (key, value) in batch {
			if state.entries.contains_key(&key) || fresh.contains_key(&key) {
				continue;
			}

			fresh.insert(key, value);
		}

		if fresh.is_empty() {
			return Ok(0);
		}

		let mut payload = Vec::new();

		for (key, value) in &fresh {
			encode_line(&mut payload, key, value)?;
		}

		self.append(&mut state, &payload)?;

		let inserted = fresh.len();

		state.entries.extend(fresh);

		Ok(inserted)
	}

	fn keys(&self) -> Result<Vec<String>> {
		let state = self.state.lock().unwrap_or_else(|err| err.into_inner());

		Ok(state.entries.keys().cloned().collect())
	}
}

fn encode_line(buf: &mut Vec<u8>, key: &str, value: &Value) -> Result<()> {
	serde_json::to_writer(&mut *buf, &RecordRef { key, value })?;
	buf.push(b'\n');

	Ok(())
}

fn replay(path: &Path, raw: &[u8]) -> Result<Replay> {
	let mut out = Replay::default();
	let mut lines = raw.split(|byte| *byte == b'\n').peekable();

	while let Some(line) = lines.next() {
		// The segment after the final newline is empty unless the last append was torn.
		let is_tail = lines.peek().is_none();

		if line.iter().all(u8::is_ascii_whitespace) {
			continue;
		}

		let record = match serde_json::from_slice::<Record>(line) {
			Ok(record) => record,
			Err(_) if is_tail => {
				out.torn_tail = true;

				break;
			},
			Err(source) => return Err(Error::Corrupt { path: path.to_path_buf(), source }),
		};

		if is_tail {
			// Complete record without its newline; keep it but rewrite the file.
			out.torn_tail = true;
		}
		if out.entries.contains_key(&record.key) {
			out.duplicates += 1;

			continue;
		}

		out.entries.insert(record.key, record.value);
	}

	Ok(out)
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn replay_keeps_the_first_value_per_key() {
		let raw = b"{\"key\":\"a\",\"value\":1}\n{\"key\":\"a\",\"value\":2}\n{\"key\":\"b\",\"value\":3}\n";
		let replay = replay(Path::new("cache.jsonl"), raw).expect("replay");

		assert_eq!(replay.entries.get("a"), Some(&json!(1)));
		assert_eq!(replay.entries.get("b"), Some(&json!(3)));
		assert_eq!(replay.duplicates, 1);
		assert!(!replay.torn_tail);
	}

	#[test]
	fn replay_drops_a_torn_tail() {
		let raw = b"{\"key\":\"a\",\"value\":1}\n{\"key\":\"b\",\"va";
		let replay = replay(Path::new("cache.jsonl"), raw).expect("replay");

		assert_eq!(replay.entries.len(), 1);
		assert!(replay.torn_tail);
	}

	#[test]
	fn replay_rejects_a_broken_interior_line() {
		let raw = b"{\"key\":\"a\",\"va\n{\"key\":\"b\",\"value\":1}\n";
		let err = replay(Path::new("cache.jsonl"), raw).expect_err("Expected corrupt log.");

		assert!(matches!(err, Error::Corrupt { .. }), "Unexpected error: {err}");
	}
}

pub mod file;
pub mod memory;

mod error;

pub use error::Error;
pub use file::JsonLogStore;
pub use memory::MemoryStore;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Append-only key-value cache. A key, once written, is never overwritten; writes are
/// all-or-nothing per key.
pub trait KvStore
where
	Self: Send + Sync,
{
	fn get(&self, key: &str) -> Result<Option<Value>>;

	fn contains(&self, key: &str) -> Result<bool>;

	/// Returns `false` and leaves the stored value untouched when `key` already exists.
	fn insert_if_absent(&self, key: &str, value: Value) -> Result<bool>;

	/// Inserts every absent key in one append. Returns the number of keys inserted.
	fn insert_many_if_absent(&self, entries: Vec<(String, Value)>) -> Result<usize>;

	/// Keys in ascending order.
	fn keys(&self) -> Result<Vec<String>>;
}

pub fn get_typed<T>(store: &dyn KvStore, key: &str) -> Result<Option<T>>
where
	T: DeserializeOwned,
{
	let Some(value) = store.get(key)? else { return Ok(None) };

	serde_json::from_value(value)
		.map(Some)
		.map_err(|err| Error::InvalidValue { key: key.to_string(), message: err.to_string() })
}

pub fn insert_typed<T>(store: &dyn KvStore, key: &str, value: &T) -> Result<bool>
where
	T: Serialize,
{
	store.insert_if_absent(key, serde_json::to_value(value)?)
}

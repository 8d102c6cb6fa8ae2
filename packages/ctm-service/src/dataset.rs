use std::{
	collections::{BTreeMap, HashMap},
	fs,
	path::{Path, PathBuf},
};

use serde::{Deserialize, de::DeserializeOwned};

use ctm_domain::Trial;

use crate::{Error, Result};

/// Trials in file order. Insertion order is the tie-break for both indexes.
#[derive(Debug, Clone)]
pub struct Corpus {
	name: String,
	trials: Vec<Trial>,
	by_id: HashMap<String, usize>,
}
impl Corpus {
	pub fn new(name: impl Into<String>, trials: Vec<Trial>) -> Result<Self> {
		let name = name.into();

		if trials.is_empty() {
			return Err(Error::EmptyCorpus { name });
		}

		let mut by_id = HashMap::with_capacity(trials.len());

		for (idx, trial) in trials.iter().enumerate() {
			if trial.id.trim().is_empty() {
				return Err(Error::InvalidRequest {
					message: format!("Trial at position {idx} has an empty id."),
				});
			}
			if by_id.insert(trial.id.clone(), idx).is_some() {
				return Err(Error::InvalidRequest {
					message: format!("Trial id {} appears more than once.", trial.id),
				});
			}
		}

		Ok(Self { name, trials, by_id })
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn trials(&self) -> &[Trial] {
		&self.trials
	}

	pub fn get(&self, trial_id: &str) -> Option<&Trial> {
		self.by_id.get(trial_id).map(|idx| &self.trials[*idx])
	}

	pub fn len(&self) -> usize {
		self.trials.len()
	}

	pub fn is_empty(&self) -> bool {
		self.trials.is_empty()
	}

	/// Content hash of the corpus. Index artifacts built from a different corpus version never
	/// collide with this one.
	pub fn fingerprint(&self) -> Result<String> {
		let mut hasher = blake3::Hasher::new();

		for trial in &self.trials {
			hasher.update(&serde_json::to_vec(trial)?);
			hasher.update(b"\n");
		}

		Ok(hasher.finalize().to_hex()[..16].to_string())
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PatientQuery {
	#[serde(alias = "_id")]
	pub patient_id: String,
	#[serde(alias = "text")]
	pub note_text: String,
	#[serde(default)]
	pub ground_truth: BTreeMap<String, u8>,
}
impl PatientQuery {
	pub fn label(&self, trial_id: &str) -> Option<u8> {
		self.ground_truth.get(trial_id).copied()
	}

	pub fn positives(&self) -> impl Iterator<Item = (&str, u8)> {
		self.ground_truth
			.iter()
			.filter(|(_, label)| **label > 0)
			.map(|(trial_id, label)| (trial_id.as_str(), *label))
	}
}

/// Corpus, patients and any supplied condition lists for one run.
#[derive(Debug, Clone)]
pub struct Dataset {
	pub corpus: Corpus,
	pub patients: Vec<PatientQuery>,
	pub supplied_conditions: BTreeMap<String, Vec<String>>,
}
impl Dataset {
	pub fn load(cfg: &ctm_config::Dataset) -> Result<Self> {
		let corpus = load_corpus(&cfg.name, &cfg.corpus_path)?;
		let patients = load_queries(&cfg.queries_path)?;
		let supplied_conditions = match cfg.conditions_path.as_deref() {
			Some(path) => load_conditions(path)?,
			None => BTreeMap::new(),
		};

		Ok(Self { corpus, patients, supplied_conditions })
	}
}

/// Reads a JSONL corpus. Any line that is not a complete trial record aborts the load.
pub fn load_corpus(name: &str, path: &Path) -> Result<Corpus> {
	let trials: Vec<Trial> = read_jsonl(path)?;
	let corpus = Corpus::new(name, trials).map_err(|err| match err {
		Error::InvalidRequest { message } => Error::InvalidDataset { path: path.to_path_buf(), message },
		other => other,
	})?;

	tracing::info!(corpus = name, trials = corpus.len(), "Loaded trial corpus.");

	Ok(corpus)
}

pub fn load_queries(path: &Path) -> Result<Vec<PatientQuery>> {
	let queries: Vec<PatientQuery> = read_jsonl(path)?;
	let mut seen = HashMap::new();

	for (idx, query) in queries.iter().enumerate() {
		if query.patient_id.trim().is_empty() {
			return Err(invalid(path, format!("Patient at line {} has an empty patient_id.", idx + 1)));
		}
		if let Some(previous) = seen.insert(query.patient_id.as_str(), idx) {
			return Err(invalid(
				path,
				format!(
					"Patient {} appears on lines {} and {}.",
					query.patient_id,
					previous + 1,
					idx + 1
				),
			));
		}
		if let Some((trial_id, label)) = query.ground_truth.iter().find(|(_, label)| **label > 2) {
			return Err(invalid(
				path,
				format!(
					"Patient {} has label {label} for {trial_id}; labels must be 0, 1 or 2.",
					query.patient_id
				),
			));
		}
	}

	tracing::info!(patients = queries.len(), "Loaded patient queries.");

	Ok(queries)
}

/// Reads the supplied condition lists: a JSON object of patient id to ordered strings.
pub fn load_conditions(path: &Path) -> Result<BTreeMap<String, Vec<String>>> {
	let raw = read(path)?;
	let conditions: BTreeMap<String, Vec<String>> =
		serde_json::from_str(&raw).map_err(|err| invalid(path, err.to_string()))?;

	Ok(conditions
		.into_iter()
		.map(|(patient_id, list)| {
			let list = list
				.into_iter()
				.map(|condition| condition.trim().to_string())
				.filter(|condition| !condition.is_empty())
				.collect();

			(patient_id, list)
		})
		.collect())
}

fn read_jsonl<T>(path: &Path) -> Result<Vec<T>>
where
	T: DeserializeOwned,
{
	let raw = read(path)?;
	let mut out = Vec::new();

	for (idx, line) in raw.lines().enumerate() {
		if line.trim().is_empty() {
			continue;
		}

		let record = serde_json::from_str(line)
			.map_err(|err| invalid(path, format!("Line {}: {err}", idx + 1)))?;

		out.push(record);
	}

	Ok(out)
}

fn read(path: &Path) -> Result<String> {
	fs::read_to_string(path).map_err(|source| Error::ReadDataset { path: path.to_path_buf(), source })
}

fn invalid(path: &Path, message: String) -> Error {
	Error::InvalidDataset { path: PathBuf::from(path), message }
}

use unicode_normalization::UnicodeNormalization;
use unicode_segmentation::UnicodeSegmentation;

pub fn tokenize(text: &str) -> Vec<String> {
	let normalized: String = text.nfkc().collect::<String>().to_lowercase();

	normalized.unicode_words().map(str::to_string).collect()
}

pub fn split_sentences(text: &str) -> Vec<String> {
	text.unicode_sentences()
		.map(str::trim)
		.filter(|sentence| !sentence.is_empty())
		.map(str::to_string)
		.collect()
}

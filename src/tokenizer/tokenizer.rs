use regex::Regex;
use rust_stemmers::{Algorithm, Stemmer};
use std::collections::{HashMap, HashSet};
use stop_words::{get, LANGUAGE};
use unicode_segmentation::UnicodeSegmentation;

use crate::config::TokenizerConfig;
use crate::error::{Result, ShoalError};

/// Text analyzer: split, lowercase, drop stop words, stem.
///
/// The same instance must be used at index and query time so terms line up.
pub struct Tokenizer {
    config: TokenizerConfig,
    separators: Option<Regex>,
    stemmer: Option<Stemmer>,
    stopwords: HashSet<String>,
}

impl Tokenizer {
    /// Create a new tokenizer from configuration
    pub fn new(config: &TokenizerConfig) -> Result<Self> {
        let (algorithm, stop_language) = language(&config.language).ok_or_else(|| {
            ShoalError::InvalidConfig(format!("unsupported language '{}'", config.language))
        })?;

        let separators = match &config.separators {
            Some(pattern) => Some(Regex::new(pattern).map_err(|e| {
                ShoalError::InvalidConfig(format!("invalid separator pattern: {}", e))
            })?),
            None => None,
        };

        let stemmer = config.stem.then(|| Stemmer::create(algorithm));

        let stopwords = if config.remove_stopwords {
            get(stop_language)
                .into_iter()
                .map(|s| s.to_lowercase())
                .collect()
        } else {
            HashSet::new()
        };

        Ok(Self {
            config: config.clone(),
            separators,
            stemmer,
            stopwords,
        })
    }

    /// Tokenize text into a vector of terms
    pub fn tokenize(&self, text: &str) -> Vec<String> {
        self.tokenize_with_positions_ordered(text)
            .into_iter()
            .map(|(token, _)| token)
            .collect()
    }

    /// Compute term frequencies for a tokenized document
    pub fn compute_term_frequencies(&self, text: &str) -> HashMap<String, u32> {
        let mut freq = HashMap::new();
        for token in self.tokenize(text) {
            *freq.entry(token).or_insert(0) += 1;
        }
        freq
    }

    /// Map from each term to its positions in the text
    pub fn tokenize_with_positions(&self, text: &str) -> HashMap<String, Vec<u32>> {
        let mut positions: HashMap<String, Vec<u32>> = HashMap::new();
        for (token, pos) in self.tokenize_with_positions_ordered(text) {
            positions.entry(token).or_default().push(pos);
        }
        positions
    }

    /// Tokenize and return (term, position) pairs in order
    ///
    /// Positions are 0-indexed and count every raw word, so dropped stop words
    /// and out-of-range tokens still leave a gap.
    pub fn tokenize_with_positions_ordered(&self, text: &str) -> Vec<(String, u32)> {
        let mut results = Vec::new();
        for (pos, word) in self.words(text).into_iter().enumerate() {
            if let Some(token) = self.normalize(word) {
                results.push((token, pos as u32));
            }
        }
        results
    }

    /// Analyze a single query term the same way document text is analyzed
    pub fn normalize_term(&self, term: &str) -> Option<String> {
        self.normalize(term)
    }

    fn words<'a>(&self, text: &'a str) -> Vec<&'a str> {
        match &self.separators {
            Some(re) => re.split(text).filter(|w| !w.is_empty()).collect(),
            None => text.unicode_words().collect(),
        }
    }

    fn normalize(&self, word: &str) -> Option<String> {
        let mut token = if self.config.lowercase {
            word.to_lowercase()
        } else {
            word.to_string()
        };

        let len = token.chars().count();
        if len < self.config.min_token_length || len > self.config.max_token_length {
            return None;
        }
        if self.stopwords.contains(&token.to_lowercase()) {
            return None;
        }
        if let Some(stemmer) = &self.stemmer {
            token = stemmer.stem(&token).to_string();
        }
        Some(token)
    }
}

fn language(name: &str) -> Option<(Algorithm, LANGUAGE)> {
    match name.to_lowercase().as_str() {
        "english" | "en" => Some((Algorithm::English, LANGUAGE::English)),
        "french" | "fr" => Some((Algorithm::French, LANGUAGE::French)),
        "german" | "de" => Some((Algorithm::German, LANGUAGE::German)),
        "spanish" | "es" => Some((Algorithm::Spanish, LANGUAGE::Spanish)),
        "italian" | "it" => Some((Algorithm::Italian, LANGUAGE::Italian)),
        "portuguese" | "pt" => Some((Algorithm::Portuguese, LANGUAGE::Portuguese)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TokenizerConfig {
        TokenizerConfig {
            min_token_length: 2,
            max_token_length: 50,
            ..TokenizerConfig::default()
        }
    }

    #[test]
    fn test_basic_tokenization() {
        let tokenizer = Tokenizer::new(&config()).unwrap();
        let tokens = tokenizer.tokenize("Hello World! This is a test.");

        assert!(tokens.contains(&"hello".to_string()));
        assert!(tokens.contains(&"world".to_string()));
        assert!(tokens.contains(&"test".to_string()));
        assert!(!tokens.contains(&"a".to_string()));
    }

    #[test]
    fn test_stopword_removal() {
        let tokenizer = Tokenizer::new(&config().with_stopwords(true)).unwrap();
        let tokens = tokenizer.tokenize("This is a document about the system");

        assert!(!tokens.contains(&"this".to_string()));
        assert!(!tokens.contains(&"the".to_string()));
        assert!(tokens.contains(&"document".to_string()));
    }

    #[test]
    fn test_stemming() {
        let tokenizer = Tokenizer::new(&config().with_stemming(true)).unwrap();
        let tokens = tokenizer.tokenize("running runs");
        assert!(tokens.iter().all(|t| t == "run"));
    }

    #[test]
    fn test_term_frequencies() {
        let tokenizer = Tokenizer::new(&config()).unwrap();
        let freq = tokenizer.compute_term_frequencies("apple apple banana");
        assert_eq!(freq.get("apple"), Some(&2));
        assert_eq!(freq.get("banana"), Some(&1));
    }

    #[test]
    fn test_min_max_token_length() {
        let config = TokenizerConfig {
            min_token_length: 3,
            max_token_length: 5,
            ..TokenizerConfig::default()
        };
        let tokenizer = Tokenizer::new(&config).unwrap();
        let tokens = tokenizer.tokenize("a ab abc abcd abcde abcdef");
        assert_eq!(tokens, vec!["abc", "abcd", "abcde"]);
    }

    #[test]
    fn test_positions_count_stopwords() {
        let tokenizer = Tokenizer::new(&config().with_stopwords(true)).unwrap();
        let positions = tokenizer.tokenize_with_positions("rust the programming");

        assert_eq!(positions.get("rust"), Some(&vec![0]));
        assert_eq!(positions.get("programming"), Some(&vec![2]));
        assert!(positions.get("the").is_none());
    }

    #[test]
    fn test_tokenize_with_positions_ordered() {
        let tokenizer = Tokenizer::new(&config()).unwrap();
        let ordered = tokenizer.tokenize_with_positions_ordered("rust is great for rust");
        assert_eq!(ordered.len(), 5);
        assert_eq!(ordered[0], ("rust".to_string(), 0));
        assert_eq!(ordered[4], ("rust".to_string(), 4));
    }

    #[test]
    fn test_custom_separators() {
        let tokenizer = Tokenizer::new(&config().with_separators(r"[,;]+")).unwrap();
        let tokens = tokenizer.tokenize("New York;San Francisco,,Paris");
        assert_eq!(tokens, vec!["new york", "san francisco", "paris"]);
    }

    #[test]
    fn test_invalid_config() {
        assert!(Tokenizer::new(&config().with_separators("[")).is_err());
        let bad = TokenizerConfig {
            language: "klingon".to_string(),
            ..TokenizerConfig::default()
        };
        assert!(Tokenizer::new(&bad).is_err());
    }
}

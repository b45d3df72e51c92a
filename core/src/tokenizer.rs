use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

lazy_static! {
    // ASCII word characters and whitespace only; accented letters are stripped.
    static ref PUNCT: Regex = Regex::new(r"[^A-Za-z0-9_\t\n\x0C\r ]").expect("valid regex");
    static ref BUILTIN_STOPWORDS: HashSet<String> = {
        let words: &[&str] = &[
            "a","about","above","after","again","against","all","am","an","and","any","are","as","at",
            "be","because","been","before","being","below","between","both","but","by",
            "can","cannot","could",
            "did","do","does","doing","down","during",
            "each","few","for","from","further",
            "had","has","have","having","he","her","here","hers","herself","him","himself","his","how",
            "i","if","in","into","is","it","its","itself",
            "me","more","most","my","myself",
            "no","nor","not","of","off","on","once","only","or","other","ought","our","ours","ourselves","out","over","own",
            "same","she","should","so","some","such",
            "than","that","the","their","theirs","them","themselves","then","there","these","they","this","those","through","to","too",
            "under","until","up","very",
            "was","we","were","what","when","where","which","while","who","whom","why","with","would",
            "you","your","yours","yourself","yourselves"
        ];
        words.iter().map(|w| w.to_string()).collect()
    };
}

/// Stop-word set, loaded once at startup and read-only afterwards.
#[derive(Debug, Clone)]
pub struct StopWords(Arc<HashSet<String>>);

impl StopWords {
    /// Built-in English list.
    pub fn builtin() -> Self {
        Self(Arc::new(BUILTIN_STOPWORDS.clone()))
    }

    pub fn empty() -> Self {
        Self(Arc::new(HashSet::new()))
    }

    /// One word per line; surrounding whitespace and blank lines are ignored.
    pub fn from_file<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let mut words = HashSet::new();
        for line in reader.lines() {
            let line = line?;
            let word = line.trim();
            if !word.is_empty() {
                words.insert(word.to_string());
            }
        }
        Ok(Self(Arc::new(words)))
    }

    pub fn contains(&self, word: &str) -> bool {
        self.0.contains(word)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for StopWords {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(Arc::new(iter.into_iter().map(Into::into).collect()))
    }
}

#[derive(Debug, Clone)]
pub struct Tokenizer {
    stopwords: StopWords,
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new(StopWords::builtin())
    }
}

impl Tokenizer {
    pub fn new(stopwords: StopWords) -> Self {
        Self { stopwords }
    }

    /// Lowercase, strip everything that is neither an ASCII word character
    /// nor ASCII whitespace, split on whitespace, drop stop words.
    pub fn tokenize(&self, text: &str) -> Vec<String> {
        if text.is_empty() {
            return Vec::new();
        }
        let lowered = text.to_lowercase();
        let clean = PUNCT.replace_all(&lowered, "");
        clean
            .split_whitespace()
            .filter(|w| !self.stopwords.contains(w))
            .map(str::to_string)
            .collect()
    }
}

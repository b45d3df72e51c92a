//! Startup corpus loading from `.json` / `.jsonl` files.
//!
//! A `.json` file holds one document object or an array of them; a `.jsonl`
//! file holds one object per line. `body` is accepted for `content`.
//! Seeding only runs against an empty document store, so restarting with
//! `--seed` does not add the corpus again.

use anyhow::{Context, Result};
use pulse_core::{NewDocument, SearchService};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Deserialize)]
struct InputDoc {
    title: String,
    #[serde(alias = "body")]
    content: String,
    #[serde(default)]
    tags: Vec<String>,
}

impl From<InputDoc> for NewDocument {
    fn from(doc: InputDoc) -> Self {
        NewDocument { title: doc.title, content: doc.content, tags: doc.tags }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SeedReport {
    /// The store already held documents, so nothing was read.
    pub skipped: bool,
    pub files: usize,
    pub indexed: usize,
    pub pending: usize,
    pub rejected: usize,
}

/// Input files under `input`, in a stable order.
pub fn collect_files(input: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = Vec::new();
    if input.is_dir() {
        for entry in WalkDir::new(input).into_iter().filter_map(|e| e.ok()) {
            let p = entry.path();
            if p.is_file() {
                if let Some(ext) = p.extension().and_then(|s| s.to_str()) {
                    if matches!(ext, "json" | "jsonl") {
                        files.push(p.to_path_buf());
                    }
                }
            }
        }
    } else if input.is_file() {
        files.push(input.to_path_buf());
    }
    files.sort();
    files
}

fn read_jsonl(file: &Path) -> Result<Vec<InputDoc>> {
    let reader = BufReader::new(File::open(file)?);
    let mut docs = Vec::new();
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let doc: InputDoc = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}", file.display(), n + 1))?;
        docs.push(doc);
    }
    Ok(docs)
}

fn read_json(file: &Path) -> Result<Vec<InputDoc>> {
    let reader = BufReader::new(File::open(file)?);
    let json: serde_json::Value = serde_json::from_reader(reader)?;
    let docs = match json {
        serde_json::Value::Array(arr) => arr
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<InputDoc>, _>>()?,
        serde_json::Value::Object(_) => vec![serde_json::from_value(json)?],
        _ => Vec::new(),
    };
    Ok(docs)
}

/// Submits every document found under `input` through the service, unless
/// the service already has documents.
pub async fn seed(service: &SearchService, input: &Path) -> Result<SeedReport> {
    let existing = service.document_count().await?;
    if existing > 0 {
        tracing::info!(existing, "document store already populated, skipping seed");
        return Ok(SeedReport { skipped: true, ..SeedReport::default() });
    }

    let mut report = SeedReport::default();
    for file in collect_files(input) {
        let docs = if file.extension().and_then(|s| s.to_str()) == Some("jsonl") {
            read_jsonl(&file)
        } else {
            read_json(&file)
        }
        .with_context(|| format!("reading {}", file.display()))?;
        report.files += 1;

        for doc in docs {
            match service.add_document(doc.into()).await {
                Ok(added) if added.indexed_immediately => report.indexed += 1,
                Ok(_) => report.pending += 1,
                Err(e) if e.is_client_error() => {
                    tracing::warn!(file = %file.display(), error = %e, "skipping seed document");
                    report.rejected += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
    tracing::info!(
        files = report.files,
        indexed = report.indexed,
        pending = report.pending,
        rejected = report.rejected,
        "seeded corpus"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::{MemoryStore, ServiceConfig, SledDocumentStore, SystemClock, Tokenizer};
    use std::fs;
    use std::sync::Arc;

    fn service() -> SearchService {
        SearchService::new(
            Arc::new(MemoryStore::new()),
            Arc::new(SledDocumentStore::temporary().unwrap()),
            Arc::new(SystemClock),
            Tokenizer::default(),
            ServiceConfig::default(),
        )
    }

    #[tokio::test]
    async fn seeds_json_and_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("a.json"),
            r#"[{"title":"One","content":"first walrus"},{"title":"Two","body":"second walrus"}]"#,
        )
        .unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(
            dir.path().join("nested/b.jsonl"),
            "{\"title\":\"Three\",\"content\":\"third walrus\",\"tags\":[\"x\"]}\n\n{\"title\":\"\",\"content\":\"blank title\"}\n",
        )
        .unwrap();
        fs::write(dir.path().join("ignored.txt"), "not a corpus file").unwrap();

        let svc = service();
        let report = seed(&svc, dir.path()).await.unwrap();
        assert_eq!(report, SeedReport { skipped: false, files: 2, indexed: 3, pending: 0, rejected: 1 });
        assert_eq!(svc.search("walrus", 1).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn seeding_twice_adds_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = dir.path().join("corpus.jsonl");
        fs::write(&corpus, "{\"title\":\"Once\",\"content\":\"lonely narwhal\"}\n").unwrap();

        let svc = service();
        assert_eq!(seed(&svc, &corpus).await.unwrap().indexed, 1);
        let again = seed(&svc, &corpus).await.unwrap();
        assert_eq!(again, SeedReport { skipped: true, ..SeedReport::default() });
        assert_eq!(svc.document_count().await.unwrap(), 1);
        assert_eq!(svc.search("narwhal", 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        fs::write(&path, "{\"title\": 3}\n").unwrap();
        let err = seed(&service(), &path).await.unwrap_err();
        assert!(format!("{err:#}").contains("bad.jsonl"));
    }
}

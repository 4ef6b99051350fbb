use crate::Result;
use serde_yaml::{Mapping, Value};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Name of the document always placed first in retrieved context.
pub const INDEX_DOCUMENT: &str = "index";

/// Name of the document whose front-matter feeds `identity.*` interpolation.
pub const IDENTITY_DOCUMENT: &str = "identity";

/// A named text asset with optional YAML front-matter
#[derive(Debug, Clone)]
pub struct MemoryDocument {
    pub name: String,
    pub front_matter: Mapping,
    pub body: String,
    pub tags: Vec<String>,
    pub headings: Vec<String>,
}

impl MemoryDocument {
    /// Stringified scalar from the front-matter, if the key holds one.
    pub fn scalar(&self, key: &str) -> Option<String> {
        match self.front_matter.get(Value::from(key))? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

/// Cache of memory documents backed by a flat directory
///
/// Documents are keyed by name (`<name>.md` on disk). A missing document is
/// not an error: it loads as an empty body with a warning, so prompts degrade
/// instead of failing.
pub struct MemoryStore {
    dir: PathBuf,
    cache: Mutex<HashMap<String, Arc<MemoryDocument>>>,
}

impl MemoryStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir
            .join(format!("{name}.{}", crate::constants::MEMORY_FILE_EXTENSION))
    }

    pub async fn load(&self, name: &str) -> Result<Arc<MemoryDocument>> {
        {
            let cache = self.cache.lock().await;
            if let Some(doc) = cache.get(name) {
                return Ok(doc.clone());
            }
        }

        let doc = match tokio::fs::read_to_string(self.path_for(name)).await {
            Ok(raw) => parse_document(name, &raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Memory document {:?} not found, using empty body", name);
                parse_document(name, "")
            }
            Err(e) => return Err(e.into()),
        };

        let doc = Arc::new(doc);
        let mut cache = self.cache.lock().await;
        cache.insert(name.to_string(), doc.clone());
        Ok(doc)
    }

    /// Overwrites a document on disk and refreshes the cache.
    pub async fn write(&self, name: &str, content: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.path_for(name), content).await?;
        let mut cache = self.cache.lock().await;
        cache.insert(name.to_string(), Arc::new(parse_document(name, content)));
        debug!("Memory document {:?} written ({} bytes)", name, content.len());
        Ok(())
    }

    /// Assembles memory context for a task in four additive layers:
    /// the `index` document, the skill's declared dependencies, keyword
    /// matches against tags/headings, and (reserved) thread-derived
    /// injection handled by the caller. Deduplicated by name, order kept.
    pub async fn retrieve(
        &self,
        task_text: &str,
        skill_deps: &[String],
    ) -> Result<Vec<(String, String)>> {
        let mut included: HashSet<String> = HashSet::new();
        let mut out: Vec<(String, String)> = Vec::new();

        // Layer 1: the index document always leads.
        let index = self.load(INDEX_DOCUMENT).await?;
        included.insert(INDEX_DOCUMENT.to_string());
        out.push((INDEX_DOCUMENT.to_string(), index.body.clone()));

        // Layer 2: skill dependencies, in declaration order.
        for dep in skill_deps {
            if !included.insert(dep.clone()) {
                continue;
            }
            let doc = self.load(dep).await?;
            out.push((dep.clone(), doc.body.clone()));
        }

        // Layer 3: keyword matches over every document in the directory.
        let keywords = tokenize(task_text);
        if !keywords.is_empty() {
            for name in self.list_names().await? {
                if included.contains(&name) {
                    continue;
                }
                let doc = self.load(&name).await?;
                if matches_keywords(&doc, &keywords) {
                    included.insert(name.clone());
                    out.push((name, doc.body.clone()));
                }
            }
        }

        // Layer 4 (thread-derived injection) is assembled by the prompt
        // builder, not here.
        Ok(out)
    }

    async fn list_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str())
                == Some(crate::constants::MEMORY_FILE_EXTENSION)
            {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Splits a leading `---`-delimited front-matter block from the body.
///
/// Returns the raw front-matter text (without fences) and the remaining
/// body. Content without a front-matter fence is all body.
pub fn split_front_matter(raw: &str) -> (Option<&str>, &str) {
    let rest = match raw.strip_prefix("---") {
        Some(rest) => rest,
        None => return (None, raw),
    };
    let rest = match rest.strip_prefix("\r\n").or_else(|| rest.strip_prefix('\n')) {
        Some(rest) => rest,
        None => return (None, raw),
    };
    match find_closing_fence(rest) {
        Some(fence_start) => {
            let front = &rest[..fence_start];
            let after = &rest[fence_start..];
            let body = after.splitn(2, '\n').nth(1).unwrap_or("");
            (Some(front), body)
        }
        None => (None, raw),
    }
}

fn find_closing_fence(rest: &str) -> Option<usize> {
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            return Some(offset);
        }
        offset += line.len();
    }
    None
}

fn parse_document(name: &str, raw: &str) -> MemoryDocument {
    let (front_raw, body) = split_front_matter(raw);
    let front_matter = front_raw
        .and_then(|raw| serde_yaml::from_str::<Mapping>(raw).ok())
        .unwrap_or_default();

    let tags = match front_matter.get(Value::from("tags")) {
        Some(Value::Sequence(seq)) => seq
            .iter()
            .filter_map(|v| v.as_str().map(|s| s.to_lowercase()))
            .collect(),
        _ => Vec::new(),
    };

    let headings = body
        .lines()
        .filter(|line| line.trim_start().starts_with('#'))
        .map(|line| line.trim().to_string())
        .collect();

    MemoryDocument {
        name: name.to_string(),
        front_matter,
        body: body.to_string(),
        tags,
        headings,
    }
}

/// Lowercase words of length >= 2 with punctuation stripped, deduplicated.
fn tokenize(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut words = Vec::new();
    for word in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 2)
    {
        if seen.insert(word.to_string()) {
            words.push(word.to_string());
        }
    }
    words
}

fn matches_keywords(doc: &MemoryDocument, keywords: &[String]) -> bool {
    for keyword in keywords {
        if doc.tags.iter().any(|tag| tag == keyword) {
            return true;
        }
        for heading in &doc.headings {
            let heading_lower = heading.to_lowercase();
            let mut heading_words = heading_lower
                .split(|c: char| !c.is_alphanumeric())
                .filter(|w| w.len() >= 2);
            if heading_words.any(|w| w == keyword) {
                return true;
            }
        }
    }
    false
}

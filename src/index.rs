// SPDX-FileCopyrightText: The rcoredump contributors
//
// SPDX-License-Identifier: GPL-3.0-only

//! A document store + full-text search index over [`Coredump`], keyed by
//! uid, with sort/pagination and a query language supporting barewords,
//! phrases, timestamp ranges, boolean wildcards and free-form metadata
//! lookups.
//!
//! There is one implementation today (tantivy, an embedded full-text search
//! library), selected by `-index-type` through [`open`] the way the design
//! notes ask for dynamic dispatch over a narrow capability trait.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use tantivy::collector::TopDocs;
use tantivy::query::{AllQuery, BooleanQuery, Occur, Query, QueryParser, TermQuery};
use tantivy::schema::{
    IndexRecordOption, OwnedValue, Schema, SchemaBuilder, Value, FAST, INDEXED, STORED, STRING,
    TEXT,
};
use tantivy::{Index as TantivyIndexHandle, IndexReader, IndexWriter, ReloadPolicy, Term};

use crate::error::IndexError;
use crate::wire::chrono_compat::Timestamp;
use crate::wire::{Coredump, Uid};

/// A result page plus the total number of documents matching the query,
/// before pagination.
pub struct SearchResults {
    pub results: Vec<Coredump>,
    pub total: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    DumpedAt,
    Hostname,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// The document store + search contract. One implementation (tantivy)
/// exists today; new backends implement this trait and are selected in
/// [`open`].
#[async_trait]
pub trait Index: Send + Sync {
    async fn index(&self, doc: Coredump) -> Result<(), IndexError>;
    async fn find(&self, uid: Uid) -> Result<Coredump, IndexError>;
    async fn delete(&self, uid: Uid) -> Result<(), IndexError>;
    async fn search(
        &self,
        query: &str,
        sort_field: SortField,
        sort_order: SortOrder,
        limit: usize,
        offset: usize,
    ) -> Result<SearchResults, IndexError>;
}

/// Constructs the configured [`Index`] implementation.
pub fn open(index_type: &str, data_dir: &Path) -> anyhow::Result<std::sync::Arc<dyn Index>> {
    match index_type {
        "tantivy" => Ok(std::sync::Arc::new(TantivyIndex::open(data_dir)?)),
        other => anyhow::bail!("unknown index type {other:?}"),
    }
}

/// Maximum number of matching documents collected before in-memory
/// sort/pagination. A fleet's worth of core dumps is not web-scale, so a
/// generous, explicit cap keeps sort/pagination simple without needing
/// tantivy's fast-field sort machinery; if a query legitimately matches
/// more than this, results are truncated and `total` reflects the cap, not
/// the true match count.
const SEARCH_CAP: usize = 100_000;

struct Fields {
    uid: tantivy::schema::Field,
    dumped_at: tantivy::schema::Field,
    hostname: tantivy::schema::Field,
    executable: tantivy::schema::Field,
    executable_path: tantivy::schema::Field,
    executable_hash: tantivy::schema::Field,
    executable_size: tantivy::schema::Field,
    core_size: tantivy::schema::Field,
    lang: tantivy::schema::Field,
    trace: tantivy::schema::Field,
    analyzed_at: tantivy::schema::Field,
    analyzed: tantivy::schema::Field,
    forwarder_version: tantivy::schema::Field,
    indexer_version: tantivy::schema::Field,
    meta_json: tantivy::schema::Field,
    meta_text: tantivy::schema::Field,
}

fn build_schema() -> (Schema, Fields) {
    let mut builder: SchemaBuilder = Schema::builder();
    let uid = builder.add_text_field("uid", STRING | STORED);
    let dumped_at = builder.add_i64_field("dumped_at", INDEXED | STORED | FAST);
    let hostname = builder.add_text_field("hostname", TEXT | STORED);
    let executable = builder.add_text_field("executable", TEXT | STORED);
    let executable_path = builder.add_text_field("executable_path", TEXT | STORED);
    let executable_hash = builder.add_text_field("executable_hash", STRING | STORED);
    let executable_size = builder.add_i64_field("executable_size", INDEXED | STORED);
    let core_size = builder.add_i64_field("core_size", INDEXED | STORED);
    let lang = builder.add_text_field("lang", STRING | STORED);
    let trace = builder.add_text_field("trace", TEXT | STORED);
    let analyzed_at = builder.add_i64_field("analyzed_at", INDEXED | STORED);
    let analyzed = builder.add_text_field("analyzed", STRING | STORED);
    let forwarder_version = builder.add_text_field("forwarder_version", STRING | STORED);
    let indexer_version = builder.add_text_field("indexer_version", STRING | STORED);
    let meta_json = builder.add_text_field("meta_json", STORED);
    let meta_text = builder.add_text_field("meta_text", TEXT);
    let schema = builder.build();
    (
        schema,
        Fields {
            uid,
            dumped_at,
            hostname,
            executable,
            executable_path,
            executable_hash,
            executable_size,
            core_size,
            lang,
            trace,
            analyzed_at,
            analyzed,
            forwarder_version,
            indexer_version,
            meta_json,
            meta_text,
        },
    )
}

pub struct TantivyIndex {
    fields: Fields,
    index: TantivyIndexHandle,
    writer: Mutex<IndexWriter>,
    reader: IndexReader,
}

impl TantivyIndex {
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        let dir = data_dir.join("index");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating index directory {}", dir.display()))?;
        let (schema, fields) = build_schema();
        let mmap_dir = tantivy::directory::MmapDirectory::open(&dir)
            .with_context(|| format!("opening index directory {}", dir.display()))?;
        let index = TantivyIndexHandle::open_or_create(mmap_dir, schema)
            .context("opening or creating tantivy index")?;
        let writer = index
            .writer(50_000_000)
            .context("creating tantivy index writer")?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()
            .context("creating tantivy index reader")?;
        Ok(TantivyIndex {
            fields,
            index,
            writer: Mutex::new(writer),
            reader,
        })
    }

    fn to_document(&self, c: &Coredump) -> anyhow::Result<tantivy::TantivyDocument> {
        let f = &self.fields;
        let mut d = tantivy::TantivyDocument::default();
        d.add_text(f.uid, c.uid.to_hex());
        d.add_i64(f.dumped_at, c.dumped_at.unix_seconds());
        d.add_text(f.hostname, &c.hostname);
        d.add_text(f.executable, &c.executable);
        d.add_text(f.executable_path, &c.executable_path);
        d.add_text(f.executable_hash, &c.executable_hash);
        d.add_i64(f.executable_size, c.executable_size as i64);
        d.add_i64(f.core_size, c.core_size as i64);
        if let Some(lang) = &c.lang {
            d.add_text(f.lang, lang);
        }
        if let Some(trace) = &c.trace {
            d.add_text(f.trace, trace);
        }
        if let Some(at) = c.analyzed_at {
            d.add_i64(f.analyzed_at, at.unix_seconds());
        }
        d.add_text(f.analyzed, if c.analyzed { "T" } else { "F" });
        d.add_text(f.forwarder_version, &c.forwarder_version);
        d.add_text(f.indexer_version, &c.indexer_version);
        let meta_json = serde_json::to_string(&c.metadata).context("serializing metadata")?;
        d.add_text(f.meta_json, meta_json);
        for (k, v) in &c.metadata {
            d.add_text(f.meta_text, format!("{k}:{v}"));
        }
        Ok(d)
    }

    fn from_document(&self, doc: &tantivy::TantivyDocument) -> Result<Coredump, IndexError> {
        let f = &self.fields;
        let get_str = |field: tantivy::schema::Field| -> Option<String> {
            doc.get_first(field)
                .and_then(|v: &OwnedValue| v.as_str())
                .map(|s| s.to_string())
        };
        let get_i64 = |field: tantivy::schema::Field| -> Option<i64> {
            doc.get_first(field).and_then(|v: &OwnedValue| v.as_i64())
        };
        let uid_hex = get_str(f.uid).ok_or_else(|| IndexError::Schema("missing uid".into()))?;
        let uid = Uid::from_hex(&uid_hex)
            .map_err(|e| IndexError::Schema(format!("corrupted uid {uid_hex:?}: {e}")))?;
        let dumped_at = Timestamp::from_unix_seconds(
            get_i64(f.dumped_at).ok_or_else(|| IndexError::Schema("missing dumped_at".into()))?,
        );
        let metadata: BTreeMap<String, String> = match get_str(f.meta_json) {
            Some(text) => serde_json::from_str(&text)
                .map_err(|e| IndexError::Schema(format!("corrupted meta_json: {e}")))?,
            None => BTreeMap::new(),
        };
        Ok(Coredump {
            uid,
            dumped_at,
            hostname: get_str(f.hostname).unwrap_or_default(),
            executable: get_str(f.executable).unwrap_or_default(),
            executable_path: get_str(f.executable_path).unwrap_or_default(),
            executable_hash: get_str(f.executable_hash).unwrap_or_default(),
            executable_size: get_i64(f.executable_size).unwrap_or(0) as u64,
            core_size: get_i64(f.core_size).unwrap_or(0) as u64,
            lang: get_str(f.lang),
            trace: get_str(f.trace),
            analyzed_at: get_i64(f.analyzed_at).map(Timestamp::from_unix_seconds),
            analyzed: get_str(f.analyzed).as_deref() == Some("T"),
            metadata,
            forwarder_version: get_str(f.forwarder_version).unwrap_or_default(),
            indexer_version: get_str(f.indexer_version).unwrap_or_default(),
        })
    }

    fn compiled_query(&self, query: &str) -> anyhow::Result<CompiledQuery> {
        compile_query(query, &self.fields, &self.index)
    }
}

/// The result of compiling a user query string: a tantivy query over the
/// fields it natively understands, plus Rust-side predicates for the parts
/// of the grammar tantivy's query parser does not express (timestamp
/// ranges, the `analyzed:F*`/`T*` boolean wildcard, and `meta.<key>:<value>`
/// lookups against the free-form metadata map).
struct CompiledQuery {
    tantivy_query: Box<dyn Query>,
    post_filters: Vec<PostFilter>,
}

enum PostFilter {
    DumpedBefore(i64),
    DumpedAfter(i64),
    AnalyzedIs(bool),
    MetaEquals(String, String),
    /// An unsupported field name was referenced; unknown fields match
    /// nothing rather than erroring.
    NeverMatches,
}

impl PostFilter {
    fn matches(&self, c: &Coredump) -> bool {
        match self {
            PostFilter::DumpedBefore(t) => c.dumped_at.unix_seconds() < *t,
            PostFilter::DumpedAfter(t) => c.dumped_at.unix_seconds() > *t,
            PostFilter::AnalyzedIs(want) => c.analyzed == *want,
            PostFilter::MetaEquals(k, v) => c.metadata.get(k).map(|x| x.as_str()) == Some(v.as_str()),
            PostFilter::NeverMatches => false,
        }
    }
}

/// Splits a query string on whitespace, keeping `"..."` phrases (which may
/// contain spaces) as a single token.
fn split_clauses(query: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in query.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn unquote(s: &str) -> &str {
    s.strip_prefix('"').and_then(|s| s.strip_suffix('"')).unwrap_or(s)
}

const KNOWN_FIELDS: &[&str] = &[
    "uid",
    "dumped_at",
    "hostname",
    "executable",
    "executable_path",
    "executable_hash",
    "executable_size",
    "core_size",
    "lang",
    "trace",
    "analyzed_at",
    "analyzed",
    "forwarder_version",
    "indexer_version",
];

fn compile_query(
    query: &str,
    fields: &Fields,
    index: &TantivyIndexHandle,
) -> anyhow::Result<CompiledQuery> {
    let query = query.trim();
    if query.is_empty() || query == "*" {
        return Ok(CompiledQuery {
            tantivy_query: Box::new(AllQuery),
            post_filters: Vec::new(),
        });
    }

    let mut post_filters = Vec::new();
    let mut passthrough = Vec::new();

    for clause in split_clauses(query) {
        let Some(colon) = find_top_level_colon(&clause) else {
            passthrough.push(clause);
            continue;
        };
        let field = &clause[..colon];
        let value = &clause[colon + 1..];

        if let Some(key) = field.strip_prefix("meta.") {
            post_filters.push(PostFilter::MetaEquals(
                key.to_string(),
                unquote(value).to_string(),
            ));
            continue;
        }

        if field == "analyzed" && (value == "F*" || value == "T*") {
            post_filters.push(PostFilter::AnalyzedIs(value == "T*"));
            continue;
        }

        if field == "dumped_at" && (value.starts_with('<') || value.starts_with('>')) {
            let lt = value.starts_with('<');
            let ts_str = unquote(&value[1..]);
            let Some(ts) = Timestamp::parse_rfc3339(ts_str) else {
                anyhow::bail!("invalid timestamp in range clause: {ts_str:?}");
            };
            post_filters.push(if lt {
                PostFilter::DumpedBefore(ts.unix_seconds())
            } else {
                PostFilter::DumpedAfter(ts.unix_seconds())
            });
            continue;
        }

        if !KNOWN_FIELDS.contains(&field) {
            post_filters.push(PostFilter::NeverMatches);
            continue;
        }

        passthrough.push(clause);
    }

    if post_filters.iter().any(|f| matches!(f, PostFilter::NeverMatches)) {
        // an unknown field can never match; short-circuit the whole query.
        return Ok(CompiledQuery {
            tantivy_query: Box::new(BooleanQuery::new(vec![(
                Occur::Must,
                Box::new(TermQuery::new(
                    Term::from_field_text(fields.uid, "\u{0}unmatchable\u{0}"),
                    IndexRecordOption::Basic,
                )),
            )])),
            post_filters: vec![PostFilter::NeverMatches],
        });
    }

    let tantivy_query: Box<dyn Query> = if passthrough.is_empty() {
        Box::new(AllQuery)
    } else {
        let default_fields = vec![
            fields.hostname,
            fields.executable,
            fields.executable_path,
            fields.trace,
            fields.meta_text,
        ];
        let mut parser = QueryParser::for_index(index, default_fields);
        parser.set_conjunction_by_default();
        let text = passthrough.join(" ");
        parser
            .parse_query(&text)
            .with_context(|| format!("parsing query {text:?}"))?
    };

    Ok(CompiledQuery {
        tantivy_query,
        post_filters,
    })
}

/// Finds the first `:` not inside a `"..."` phrase, used to split a clause
/// into `field:value`. Bareword clauses (no top-level colon) return `None`.
fn find_top_level_colon(clause: &str) -> Option<usize> {
    let mut in_quotes = false;
    for (i, c) in clause.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ':' if !in_quotes => return Some(i),
            _ => {}
        }
    }
    None
}

#[async_trait]
impl Index for TantivyIndex {
    async fn index(&self, doc: Coredump) -> Result<(), IndexError> {
        let document = self
            .to_document(&doc)
            .map_err(|e| IndexError::Schema(e.to_string()))?;
        let uid_term = Term::from_field_text(self.fields.uid, &doc.uid.to_hex());
        let mut writer = self.writer.lock().expect("tantivy writer poisoned");
        writer.delete_term(uid_term);
        writer.add_document(document).map_err(|e| IndexError::Io(e.into()))?;
        writer.commit().map_err(|e| IndexError::Io(e.into()))?;
        drop(writer);
        self.reader.reload().map_err(|e| IndexError::Io(e.into()))?;
        Ok(())
    }

    async fn find(&self, uid: Uid) -> Result<Coredump, IndexError> {
        let searcher = self.reader.searcher();
        let term = Term::from_field_text(self.fields.uid, &uid.to_hex());
        let query = TermQuery::new(term, IndexRecordOption::Basic);
        let top = searcher
            .search(&query, &TopDocs::with_limit(1))
            .map_err(|e| IndexError::Io(e.into()))?;
        let Some((_, addr)) = top.into_iter().next() else {
            return Err(IndexError::NotFound);
        };
        let doc: tantivy::TantivyDocument =
            searcher.doc(addr).map_err(|e| IndexError::Io(e.into()))?;
        self.from_document(&doc)
    }

    async fn delete(&self, uid: Uid) -> Result<(), IndexError> {
        let term = Term::from_field_text(self.fields.uid, &uid.to_hex());
        let mut writer = self.writer.lock().expect("tantivy writer poisoned");
        writer.delete_term(term);
        writer.commit().map_err(|e| IndexError::Io(e.into()))?;
        drop(writer);
        self.reader.reload().map_err(|e| IndexError::Io(e.into()))?;
        Ok(())
    }

    async fn search(
        &self,
        query: &str,
        sort_field: SortField,
        sort_order: SortOrder,
        limit: usize,
        offset: usize,
    ) -> Result<SearchResults, IndexError> {
        let compiled = self
            .compiled_query(query)
            .map_err(|e| IndexError::Schema(e.to_string()))?;

        let mut candidates = Vec::new();
        if !compiled
            .post_filters
            .iter()
            .any(|f| matches!(f, PostFilter::NeverMatches))
        {
            let searcher = self.reader.searcher();
            let top = searcher
                .search(&compiled.tantivy_query, &TopDocs::with_limit(SEARCH_CAP))
                .map_err(|e| IndexError::Io(e.into()))?;
            for (_, addr) in top {
                let doc: tantivy::TantivyDocument =
                    searcher.doc(addr).map_err(|e| IndexError::Io(e.into()))?;
                let coredump = self.from_document(&doc)?;
                if compiled.post_filters.iter().all(|f| f.matches(&coredump)) {
                    candidates.push(coredump);
                }
            }
        }

        match sort_field {
            SortField::DumpedAt => candidates.sort_by_key(|c| c.dumped_at.unix_seconds()),
            SortField::Hostname => candidates.sort_by(|a, b| a.hostname.cmp(&b.hostname)),
        }
        if sort_order == SortOrder::Desc {
            candidates.reverse();
        }

        let total = candidates.len();
        let results = candidates.into_iter().skip(offset).take(limit).collect();
        Ok(SearchResults { results, total })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn sample(uid: Uid, hostname: &str, secs: i64, service: &str) -> Coredump {
        let mut metadata = BTreeMap::new();
        metadata.insert("service".to_string(), service.to_string());
        Coredump {
            uid,
            dumped_at: Timestamp::from_unix_seconds(secs),
            hostname: hostname.to_string(),
            executable: "x".to_string(),
            executable_path: "/bin/x".to_string(),
            executable_hash: "aa".to_string(),
            executable_size: 4,
            core_size: 5,
            lang: None,
            trace: None,
            analyzed_at: None,
            analyzed: false,
            metadata,
            forwarder_version: "1".to_string(),
            indexer_version: "1".to_string(),
        }
    }

    #[tokio::test]
    async fn find_round_trips_index() {
        let dir = tempfile::tempdir().unwrap();
        let index = TantivyIndex::open(dir.path()).unwrap();
        let uid = Uid::new();
        let doc = sample(uid, "h1", 100, "s");
        index.index(doc.clone()).await.unwrap();
        let found = index.find(uid).await.unwrap();
        assert_eq!(found.hostname, "h1");
        assert_eq!(found.metadata.get("service").unwrap(), "s");
    }

    #[tokio::test]
    async fn reindexing_is_upsert() {
        let dir = tempfile::tempdir().unwrap();
        let index = TantivyIndex::open(dir.path()).unwrap();
        let uid = Uid::new();
        index.index(sample(uid, "h1", 100, "s")).await.unwrap();
        index.index(sample(uid, "h2", 100, "s")).await.unwrap();
        let results = index
            .search("*", SortField::DumpedAt, SortOrder::Desc, 50, 0)
            .await
            .unwrap();
        assert_eq!(results.total, 1);
        assert_eq!(results.results[0].hostname, "h2");
    }

    #[tokio::test]
    async fn search_by_metadata_matches_meta_prefix_query() {
        let dir = tempfile::tempdir().unwrap();
        let index = TantivyIndex::open(dir.path()).unwrap();
        index.index(sample(Uid::new(), "h1", 100, "api")).await.unwrap();
        index.index(sample(Uid::new(), "h2", 100, "worker")).await.unwrap();
        let results = index
            .search(
                "meta.service:api",
                SortField::DumpedAt,
                SortOrder::Desc,
                50,
                0,
            )
            .await
            .unwrap();
        assert_eq!(results.total, 1);
        assert_eq!(results.results[0].hostname, "h1");
    }

    #[tokio::test]
    async fn delete_removes_document() {
        let dir = tempfile::tempdir().unwrap();
        let index = TantivyIndex::open(dir.path()).unwrap();
        let uid = Uid::new();
        index.index(sample(uid, "h1", 100, "s")).await.unwrap();
        index.delete(uid).await.unwrap();
        assert!(matches!(index.find(uid).await.unwrap_err(), IndexError::NotFound));
    }

    #[tokio::test]
    async fn unknown_field_matches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let index = TantivyIndex::open(dir.path()).unwrap();
        index.index(sample(Uid::new(), "h1", 100, "s")).await.unwrap();
        let results = index
            .search("bogus_field:x", SortField::DumpedAt, SortOrder::Desc, 50, 0)
            .await
            .unwrap();
        assert_eq!(results.total, 0);
    }

    #[tokio::test]
    async fn size_zero_returns_empty_list_with_correct_total() {
        let dir = tempfile::tempdir().unwrap();
        let index = TantivyIndex::open(dir.path()).unwrap();
        index.index(sample(Uid::new(), "h1", 100, "s")).await.unwrap();
        let results = index
            .search("*", SortField::DumpedAt, SortOrder::Desc, 0, 0)
            .await
            .unwrap();
        assert_eq!(results.total, 1);
        assert!(results.results.is_empty());
    }

    #[tokio::test]
    async fn sort_by_dumped_at_desc_is_non_increasing() {
        let dir = tempfile::tempdir().unwrap();
        let index = TantivyIndex::open(dir.path()).unwrap();
        index.index(sample(Uid::new(), "h1", 100, "s")).await.unwrap();
        index.index(sample(Uid::new(), "h2", 300, "s")).await.unwrap();
        index.index(sample(Uid::new(), "h3", 200, "s")).await.unwrap();
        let results = index
            .search("*", SortField::DumpedAt, SortOrder::Desc, 50, 0)
            .await
            .unwrap();
        let timestamps: Vec<_> = results
            .results
            .iter()
            .map(|c| c.dumped_at.unix_seconds())
            .collect();
        assert_eq!(timestamps, vec![300, 200, 100]);
    }

    #[tokio::test]
    async fn analyzed_wildcard_finds_unanalyzed() {
        let dir = tempfile::tempdir().unwrap();
        let index = TantivyIndex::open(dir.path()).unwrap();
        let mut analyzed_doc = sample(Uid::new(), "h1", 100, "s");
        analyzed_doc.analyzed = true;
        index.index(analyzed_doc).await.unwrap();
        index.index(sample(Uid::new(), "h2", 100, "s")).await.unwrap();
        let results = index
            .search("analyzed:F*", SortField::DumpedAt, SortOrder::Desc, 50, 0)
            .await
            .unwrap();
        assert_eq!(results.total, 1);
        assert_eq!(results.results[0].hostname, "h2");
    }

    /// Documents the concurrent analyze+delete anomaly: nothing in `Index`
    /// stops a late write-back from resurrecting a document that a
    /// concurrent cleanup already deleted. This is an accepted anomaly, not
    /// a bug to fix here; the test exists so a future change that removes
    /// the anomaly (e.g. a generation counter) has to consciously update it.
    #[tokio::test]
    async fn reindex_after_delete_resurrects_document() {
        let dir = tempfile::tempdir().unwrap();
        let index = TantivyIndex::open(dir.path()).unwrap();
        let uid = Uid::new();
        let doc = sample(uid, "h1", 100, "s");
        index.index(doc.clone()).await.unwrap();
        index.delete(uid).await.unwrap();
        assert!(matches!(index.find(uid).await.unwrap_err(), IndexError::NotFound));

        // The analyzer's write-back races the delete and loses.
        index.index(doc).await.unwrap();
        assert!(index.find(uid).await.is_ok());
    }

    #[tokio::test]
    async fn dumped_at_range_query_filters() {
        let dir = tempfile::tempdir().unwrap();
        let index = TantivyIndex::open(dir.path()).unwrap();
        index.index(sample(Uid::new(), "h1", 100, "s")).await.unwrap();
        index.index(sample(Uid::new(), "h2", 2_000_000_000, "s")).await.unwrap();
        let results = index
            .search(
                r#"dumped_at:<"2020-01-01T00:00:00Z""#,
                SortField::DumpedAt,
                SortOrder::Desc,
                50,
                0,
            )
            .await
            .unwrap();
        assert_eq!(results.total, 1);
        assert_eq!(results.results[0].hostname, "h1");
    }
}

//! Search Query Service.
//!
//! Only pairs whose index entry is `ready` take part in ranked search. An
//! empty query lists documents instead, exactly as the registry list would,
//! with the same filters.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use super::catalog::Catalog;
use super::index::IndexCoordinator;
use super::pagination::{Filters, PageResult, Pageable, Paginator, SortKey, SortSpec, SortValue};
use super::registry::validate_list_filters;
use super::schema::{Document, DocumentType, IndexKey, SearchHit};
use super::scoring::{CorpusStats, Scorer};
use super::tokenizer::query_terms;
use crate::error::Result;

/// Filter keys accepted by a ranked [`SearchService::search`]. An empty
/// query takes the registry's list filters instead.
pub const SEARCH_FILTERS: &[&str] = &["library", "type", "version", "document_id", "tag"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchRequest {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub filters: Filters,
    pub page: Option<i64>,
    pub size: Option<i64>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }
}

/// A hit plus what filters need to see but the wire form leaves out.
#[derive(Debug, Clone)]
struct Candidate {
    hit: SearchHit,
    tags: BTreeSet<String>,
}

impl Pageable for Candidate {
    fn identifier(&self) -> Cow<'_, str> {
        match &self.hit.version {
            Some(v) => Cow::Owned(format!("{}@{v}", self.hit.document_id)),
            None => Cow::Borrowed(&self.hit.document_id),
        }
    }

    fn sequence(&self) -> u64 {
        self.hit.seq
    }

    fn matches(&self, key: &str, value: &str) -> bool {
        match key {
            "library" => self.hit.library == value,
            "type" => self.hit.doc_type.as_str().eq_ignore_ascii_case(value),
            "version" => self.hit.version.as_deref() == Some(value),
            "document_id" => self.hit.document_id == value,
            "tag" => self.tags.contains(value),
            _ => false,
        }
    }

    fn sort_value(&self, field: &str) -> Option<SortValue> {
        match field {
            "score" => Some(SortValue::Float(self.hit.score)),
            "built_at" => self.hit.built_at.map(|t| SortValue::Int(t.timestamp_micros())),
            _ => None,
        }
    }
}

pub struct SearchService {
    catalog: Arc<Catalog>,
    index: Arc<IndexCoordinator>,
    scorer: Arc<dyn Scorer>,
    paginator: Paginator,
}

impl SearchService {
    pub fn new(catalog: Arc<Catalog>, index: Arc<IndexCoordinator>, scorer: Arc<dyn Scorer>, paginator: Paginator) -> Self {
        Self {
            catalog,
            index,
            scorer,
            paginator,
        }
    }

    pub fn scorer_name(&self) -> &'static str {
        self.scorer.name()
    }

    pub fn search(&self, request: &SearchRequest) -> Result<PageResult<SearchHit>> {
        let page = self.paginator.request(request.page, request.size);
        if request.query.trim().is_empty() {
            validate_list_filters(&request.filters)?;
            let documents = self.catalog.documents();
            return Ok(self
                .paginator
                .paginate(&documents, &request.filters, page, None)
                .map(|d| self.listing_hit(d)));
        }

        request.filters.ensure_keys(SEARCH_FILTERS)?;
        if let Some(t) = request.filters.get("type") {
            t.parse::<DocumentType>()?;
        }
        let terms = query_terms(&request.query);
        if terms.is_empty() {
            // only stop words or single characters
            return Ok(PageResult::empty(page));
        }

        let eligible: Vec<Candidate> = self
            .ready_candidates()
            .into_iter()
            .filter(|c| request.filters.active().all(|(k, v)| c.matches(k, v)))
            .collect();
        let scope: HashSet<IndexKey> = eligible.iter().filter_map(candidate_key).collect();

        let matches = self.index.backend().query(&terms, &scope)?;
        let stats = CorpusStats::new(self.eligible_lengths(&scope), &matches);
        let by_key: HashMap<IndexKey, Candidate> = eligible
            .into_iter()
            .filter_map(|c| Some((candidate_key(&c)?, c)))
            .collect();

        let scored: Vec<Candidate> = matches
            .iter()
            .filter_map(|m| {
                let mut candidate = by_key.get(&m.key)?.clone();
                candidate.hit.score = self.scorer.score(&terms, m, &stats);
                (candidate.hit.score > 0.0).then_some(candidate)
            })
            .collect();

        tracing::debug!(
            query = %request.query,
            eligible = scope.len(),
            matched = scored.len(),
            scorer = self.scorer.name(),
            "search executed"
        );

        let ranking = SortSpec::by([SortKey::desc("score"), SortKey::desc("built_at")]);
        Ok(self
            .paginator
            .paginate(&scored, &Filters::new(), page, Some(&ranking))
            .map(|c| c.hit))
    }

    fn eligible_lengths(&self, scope: &HashSet<IndexKey>) -> Vec<usize> {
        self.index
            .ready_entries()
            .into_iter()
            .filter(|e| scope.contains(&e.key()))
            .map(|e| e.token_count)
            .collect()
    }

    fn ready_candidates(&self) -> Vec<Candidate> {
        self.index
            .ready_entries()
            .into_iter()
            .filter_map(|entry| {
                let document = self.catalog.document(&entry.document_id)?;
                Some(Candidate {
                    hit: SearchHit {
                        document_id: document.id,
                        version: Some(entry.version),
                        name: document.name,
                        library: document.library,
                        doc_type: document.doc_type,
                        score: 0.0,
                        snippet: entry.snippet,
                        built_at: entry.built_at,
                        seq: document.seq,
                    },
                    tags: document.tags,
                })
            })
            .collect()
    }

    /// A document as an unranked hit, carrying its current version's snippet.
    fn listing_hit(&self, document: Document) -> SearchHit {
        let current = document
            .current_version
            .as_deref()
            .map(|v| self.index.get_status(&document.id, v));
        let (snippet, built_at) = current.map(|e| (e.snippet, e.built_at)).unwrap_or_default();
        SearchHit {
            document_id: document.id,
            version: document.current_version,
            name: document.name,
            library: document.library,
            doc_type: document.doc_type,
            score: 0.0,
            snippet,
            built_at,
            seq: document.seq,
        }
    }
}

fn candidate_key(c: &Candidate) -> Option<IndexKey> {
    c.hit
        .version
        .as_ref()
        .map(|v| IndexKey::new(&c.hit.document_id, v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docs::backend::MemoryIndexBackend;
    use crate::docs::catalog::{NewDocument, Transition};
    use crate::docs::index::IndexSettings;
    use crate::docs::schema::{DocumentType, IndexStatus, VersionMetadata, VersionStatus};
    use crate::docs::scoring::{ScorerKind, TermFrequencyScorer};
    use crate::docs::storage::{ContentStore, MemoryStorage};
    use crate::error::DocError;
    use std::time::Duration;

    struct Harness {
        catalog: Arc<Catalog>,
        store: Arc<MemoryStorage>,
        index: Arc<IndexCoordinator>,
        search: SearchService,
    }

    fn harness() -> Harness {
        let catalog = Arc::new(Catalog::new());
        let store = Arc::new(MemoryStorage::new());
        let index = Arc::new(IndexCoordinator::new(
            catalog.clone(),
            store.clone(),
            Arc::new(MemoryIndexBackend::new()),
            IndexSettings::default(),
        ));
        let search = SearchService::new(catalog.clone(), index.clone(), Arc::new(TermFrequencyScorer), Paginator::default());
        Harness {
            catalog,
            store,
            index,
            search,
        }
    }

    /// Add a completed version, creating the document when `document_id` is `None`.
    async fn add(h: &Harness, document_id: Option<&str>, library: &str, label: &str, text: &str) -> IndexKey {
        let meta = VersionMetadata::new(DocumentType::Markdown);
        let v = match document_id {
            Some(id) => h.catalog.add_version(id, label, &meta).unwrap(),
            None => {
                let new = NewDocument {
                    name: format!("{library} guide"),
                    library: library.into(),
                    doc_type: DocumentType::Markdown,
                    description: String::new(),
                    tags: ["rust".to_string()].into_iter().collect(),
                };
                h.catalog.create_document(new, label, &meta).unwrap().version
            }
        };
        let content_ref = h.store.store(text.as_bytes(), None).await.unwrap();
        h.catalog
            .transition(&v.key(), v.uid, Transition::to(VersionStatus::Processing))
            .unwrap();
        h.catalog
            .transition(
                &v.key(),
                v.uid,
                Transition {
                    content_ref: Some(content_ref),
                    ..Transition::to(VersionStatus::Completed)
                },
            )
            .unwrap();
        v.key()
    }

    async fn index_ready(h: &Harness, key: &IndexKey) {
        h.index.build_index(&key.document_id, &key.version).unwrap();
        for _ in 0..200 {
            if h.index.get_status(&key.document_id, &key.version).status == IndexStatus::Ready {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("index for {key} never became ready");
    }

    #[tokio::test]
    async fn only_ready_pairs_are_searchable() {
        let h = harness();
        let a = add(&h, None, "tokio", "1.0", "foo appears here").await;
        let b = add(&h, None, "serde", "1.0", "foo also here").await;
        index_ready(&h, &a).await;
        let _ = b;

        let result = h.search.search(&SearchRequest::new("foo")).unwrap();
        assert_eq!(result.total, 1);
        assert_eq!(result.items[0].document_id, a.document_id);
        assert_eq!(result.items[0].version.as_deref(), Some("1.0"));
        assert!(result.items[0].score > 0.0);

        let none = h.search.search(&SearchRequest::new("missing")).unwrap();
        assert!(none.items.is_empty());
        assert_eq!(none.total, 0);
    }

    #[tokio::test]
    async fn ranks_by_score_and_applies_filters() {
        let h = harness();
        let a = add(&h, None, "tokio", "1.0", "runtime scheduler runtime").await;
        let b = add(&h, Some(&a.document_id), "tokio", "2.0", "runtime").await;
        let c = add(&h, None, "serde", "1.0", "runtime derive").await;
        for key in [&a, &b, &c] {
            index_ready(&h, key).await;
        }

        let result = h.search.search(&SearchRequest::new("runtime scheduler")).unwrap();
        assert_eq!(result.total, 3);
        assert_eq!(result.items[0].version.as_deref(), Some("1.0"));
        assert_eq!(result.items[0].document_id, a.document_id);

        let mut filtered = SearchRequest::new("runtime");
        filtered.filters = Filters::new().with("library", "serde");
        let result = h.search.search(&filtered).unwrap();
        assert_eq!(result.total, 1);
        assert_eq!(result.items[0].document_id, c.document_id);

        filtered.filters = Filters::new().with("version", "2.0");
        assert_eq!(h.search.search(&filtered).unwrap().total, 1);

        filtered.filters = Filters::new().with("author", "x");
        assert!(matches!(h.search.search(&filtered), Err(DocError::Validation(_))));
    }

    #[tokio::test]
    async fn empty_query_lists_documents() {
        let h = harness();
        let a = add(&h, None, "tokio", "1.0", "alpha").await;
        add(&h, None, "serde", "1.0", "beta").await;

        let result = h.search.search(&SearchRequest::default()).unwrap();
        assert_eq!(result.total, 2);
        assert_eq!(result.items[0].document_id, a.document_id);
        assert!(result.items.iter().all(|hit| hit.score == 0.0));

        let mut req = SearchRequest::default();
        req.filters = Filters::new().with("library", "serde");
        assert_eq!(h.search.search(&req).unwrap().total, 1);

        // same filters as the registry list, including status and name
        req.filters = Filters::new().with("status", "completed").with("name", "TOKIO");
        let result = h.search.search(&req).unwrap();
        assert_eq!(result.total, 1);
        assert_eq!(result.items[0].document_id, a.document_id);
        assert_eq!(result.items[0].version.as_deref(), Some("1.0"));

        for bad in [
            Filters::new().with("status", "archived"),
            Filters::new().with("type", "spreadsheet"),
            Filters::new().with("document_id", "x"),
        ] {
            req.filters = bad;
            assert!(matches!(h.search.search(&req), Err(DocError::Validation(_))));
        }
    }

    #[tokio::test]
    async fn ranked_search_rejects_unknown_types() {
        let h = harness();
        let a = add(&h, None, "tokio", "1.0", "runtime").await;
        index_ready(&h, &a).await;

        let mut req = SearchRequest::new("runtime");
        req.filters = Filters::new().with("type", "spreadsheet");
        assert!(matches!(h.search.search(&req), Err(DocError::Validation(_))));

        req.filters = Filters::new().with("type", "MARKDOWN");
        assert_eq!(h.search.search(&req).unwrap().total, 1);
    }

    #[tokio::test]
    async fn deleted_index_drops_out_of_results() {
        let h = harness();
        let a = add(&h, None, "tokio", "1.0", "foo").await;
        index_ready(&h, &a).await;
        assert_eq!(h.search.search(&SearchRequest::new("foo")).unwrap().total, 1);
        h.index.delete_index(&a.document_id, None).unwrap();
        assert_eq!(h.search.search(&SearchRequest::new("foo")).unwrap().total, 0);
    }

    #[tokio::test]
    async fn pagination_past_the_end_keeps_total() {
        let h = harness();
        for i in 0..3 {
            let key = add(&h, None, &format!("lib{i}"), "1.0", "shared term").await;
            index_ready(&h, &key).await;
        }
        let mut req = SearchRequest::new("shared");
        req.page = Some(5);
        req.size = Some(2);
        let result = h.search.search(&req).unwrap();
        assert!(result.items.is_empty());
        assert_eq!(result.total, 3);
    }

    #[tokio::test]
    async fn bm25_scorer_is_pluggable() {
        let h = harness();
        let a = add(&h, None, "tokio", "1.0", "foo bar").await;
        index_ready(&h, &a).await;
        let bm25 = SearchService::new(h.catalog.clone(), h.index.clone(), ScorerKind::Bm25.build(), Paginator::default());
        assert_eq!(bm25.scorer_name(), "bm25");
        let result = bm25.search(&SearchRequest::new("foo")).unwrap();
        assert_eq!(result.total, 1);
        assert!(result.items[0].score > 0.0);
    }
}

//! Pagination and filtering shared by every list-shaped operation.
//!
//! Filters are AND-ed; absent or blank values impose no constraint. Items are
//! ordered by creation sequence unless a [`SortSpec`] is given, and remaining
//! ties are always broken by identifier so the same inputs yield the same page.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::error::DocError;

/// Number of page links shown around the current page.
pub const DEFAULT_PAGE_WINDOW: usize = 5;

/// A 1-based page request, already clamped to the configured bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: usize,
    pub size: usize,
}

impl PageRequest {
    /// Clamp `page` to `>= 1` and `size` to `[1, max_size]`.
    pub fn clamped(page: i64, size: i64, max_size: usize) -> Self {
        let max_size = max_size.max(1);
        let page = usize::try_from(page.max(1)).unwrap_or(1);
        let size = usize::try_from(size.max(1)).unwrap_or(1).min(max_size);
        Self { page, size }
    }

    pub fn offset(&self) -> usize {
        (self.page - 1).saturating_mul(self.size)
    }
}

/// Filter criteria keyed by field name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filters(BTreeMap<String, String>);

impl Filters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Value for `key`, or `None` when absent or blank.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())
    }

    /// Constraints that actually apply (blank values dropped).
    pub fn active(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .map(|(k, v)| (k.as_str(), v.trim()))
            .filter(|(_, v)| !v.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.active().next().is_none()
    }

    /// Reject keys the caller does not support.
    pub fn ensure_keys(&self, allowed: &[&str]) -> Result<(), DocError> {
        match self.active().find(|(k, _)| !allowed.contains(k)) {
            Some((key, _)) => Err(DocError::validation(format!(
                "unsupported filter '{key}' (allowed: {})",
                allowed.join(", ")
            ))),
            None => Ok(()),
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Filters {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// A comparable value produced by an item for an explicit sort key.
#[derive(Debug, Clone, PartialEq)]
pub enum SortValue {
    Int(i64),
    Float(f64),
}

impl SortValue {
    fn compare(&self, other: &SortValue) -> Ordering {
        match (self, other) {
            (SortValue::Int(a), SortValue::Int(b)) => a.cmp(b),
            (SortValue::Float(a), SortValue::Float(b)) => a.total_cmp(b),
            (SortValue::Int(a), SortValue::Float(b)) => (*a as f64).total_cmp(b),
            (SortValue::Float(a), SortValue::Int(b)) => a.total_cmp(&(*b as f64)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    #[serde(default)]
    pub descending: bool,
}

impl SortKey {
    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: true,
        }
    }
}

/// Ordered list of sort keys, most significant first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec(pub Vec<SortKey>);

impl SortSpec {
    pub fn by(keys: impl IntoIterator<Item = SortKey>) -> Self {
        Self(keys.into_iter().collect())
    }
}

/// Anything that can be listed through [`paginate`].
pub trait Pageable {
    /// Final tie-breaker.
    fn identifier(&self) -> Cow<'_, str>;

    /// Creation/insertion order.
    fn sequence(&self) -> u64;

    /// Whether the item satisfies one filter constraint.
    fn matches(&self, key: &str, value: &str) -> bool;

    fn sort_value(&self, _field: &str) -> Option<SortValue> {
        None
    }
}

/// One page of a larger ordered collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageResult<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub size: usize,
}

impl<T> PageResult<T> {
    pub fn empty(request: PageRequest) -> Self {
        Self {
            items: Vec::new(),
            total: 0,
            page: request.page,
            size: request.size,
        }
    }

    pub fn pages(&self) -> usize {
        total_pages(self.total, self.size)
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> PageResult<U> {
        PageResult {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            page: self.page,
            size: self.size,
        }
    }
}

pub fn total_pages(total: usize, size: usize) -> usize {
    if size == 0 {
        return 0;
    }
    total.div_ceil(size)
}

fn compare_items<T: Pageable>(a: &T, b: &T, sort: Option<&SortSpec>) -> Ordering {
    if let Some(spec) = sort {
        for key in &spec.0 {
            let ord = match (a.sort_value(&key.field), b.sort_value(&key.field)) {
                (Some(x), Some(y)) => {
                    let ord = x.compare(&y);
                    if key.descending {
                        ord.reverse()
                    } else {
                        ord
                    }
                }
                // Items lacking the key go last regardless of direction.
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
    } else {
        let ord = a.sequence().cmp(&b.sequence());
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.identifier().cmp(&b.identifier())
}

/// Select the requested page of `all` after filtering and ordering.
///
/// A page past the end yields no items but still reports the full `total`.
pub fn paginate<T: Pageable + Clone>(
    all: &[T],
    filters: &Filters,
    request: PageRequest,
    sort: Option<&SortSpec>,
) -> PageResult<T> {
    let mut matching: Vec<&T> = all
        .iter()
        .filter(|item| filters.active().all(|(k, v)| item.matches(k, v)))
        .collect();
    matching.sort_by(|a, b| compare_items(*a, *b, sort));

    let total = matching.len();
    let items = matching
        .into_iter()
        .skip(request.offset())
        .take(request.size)
        .cloned()
        .collect();

    PageResult {
        items,
        total,
        page: request.page,
        size: request.size,
    }
}

/// Contiguous page numbers to show around `current`, at most `max_visible` wide.
pub fn page_window(total: usize, size: usize, current: usize, max_visible: usize) -> Vec<usize> {
    let pages = total_pages(total, size);
    if pages == 0 || max_visible == 0 {
        return Vec::new();
    }
    let visible = max_visible.min(pages);
    let current = current.clamp(1, pages);
    let mut start = current.saturating_sub(visible / 2).max(1);
    if start + visible - 1 > pages {
        start = pages - visible + 1;
    }
    (start..start + visible).collect()
}

/// Page-size policy taken from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Paginator {
    pub default_page_size: usize,
    pub max_page_size: usize,
    pub window: usize,
}

impl Default for Paginator {
    fn default() -> Self {
        Self {
            default_page_size: 10,
            max_page_size: 100,
            window: DEFAULT_PAGE_WINDOW,
        }
    }
}

impl Paginator {
    pub fn request(&self, page: Option<i64>, size: Option<i64>) -> PageRequest {
        PageRequest::clamped(
            page.unwrap_or(1),
            size.unwrap_or(self.default_page_size as i64),
            self.max_page_size,
        )
    }

    pub fn paginate<T: Pageable + Clone>(
        &self,
        all: &[T],
        filters: &Filters,
        request: PageRequest,
        sort: Option<&SortSpec>,
    ) -> PageResult<T> {
        let request = PageRequest::clamped(request.page as i64, request.size as i64, self.max_page_size);
        paginate(all, filters, request, sort)
    }

    pub fn window(&self, total: usize, size: usize, current: usize) -> Vec<usize> {
        page_window(total, size, current, self.window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        id: String,
        seq: u64,
        color: &'static str,
        weight: i64,
    }

    impl Pageable for Item {
        fn identifier(&self) -> Cow<'_, str> {
            Cow::Borrowed(&self.id)
        }

        fn sequence(&self) -> u64 {
            self.seq
        }

        fn matches(&self, key: &str, value: &str) -> bool {
            match key {
                "color" => self.color == value,
                _ => false,
            }
        }

        fn sort_value(&self, field: &str) -> Option<SortValue> {
            match field {
                "weight" => Some(SortValue::Int(self.weight)),
                _ => None,
            }
        }
    }

    fn items(n: usize) -> Vec<Item> {
        (1..=n)
            .map(|i| Item {
                id: format!("item-{i:03}"),
                seq: i as u64,
                color: if i % 2 == 0 { "red" } else { "blue" },
                weight: (i % 3) as i64,
            })
            .collect()
    }

    #[test]
    fn third_page_of_twenty_five() {
        let all = items(25);
        let result = paginate(&all, &Filters::new(), PageRequest::clamped(3, 10, 100), None);
        assert_eq!(result.total, 25);
        assert_eq!(result.items.len(), 5);
        assert_eq!(result.items[0].seq, 21);
        assert_eq!(result.items[4].seq, 25);
        assert_eq!(result.pages(), 3);
    }

    #[test]
    fn page_past_end_is_empty_with_total() {
        let all = items(25);
        let result = paginate(&all, &Filters::new(), PageRequest::clamped(4, 10, 100), None);
        assert!(result.items.is_empty());
        assert_eq!(result.total, 25);
        assert_eq!(result.page, 4);
    }

    #[test]
    fn request_is_clamped() {
        assert_eq!(PageRequest::clamped(0, 0, 100), PageRequest { page: 1, size: 1 });
        assert_eq!(PageRequest::clamped(-3, 500, 100), PageRequest { page: 1, size: 100 });
        assert_eq!(PageRequest::clamped(2, 20, 0), PageRequest { page: 2, size: 1 });
    }

    #[test]
    fn filters_are_anded_and_blank_ignored() {
        let all = items(10);
        let filters = Filters::new().with("color", "red").with("unused", "  ");
        let result = paginate(&all, &filters, PageRequest::clamped(1, 100, 100), None);
        assert_eq!(result.total, 5);
        assert!(result.items.iter().all(|i| i.color == "red"));

        let none = Filters::new().with("color", "red").with("shape", "square");
        let result = paginate(&all, &none, PageRequest::clamped(1, 100, 100), None);
        assert_eq!(result.total, 0);
    }

    #[test]
    fn items_and_total_share_the_predicate() {
        let all = items(9);
        let filters = Filters::new().with("color", "blue");
        let page = paginate(&all, &filters, PageRequest::clamped(1, 2, 100), None);
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 2);
        assert!(page.items.iter().all(|i| i.color == "blue"));
    }

    #[test]
    fn default_order_is_insertion_then_identifier() {
        let mut all = items(3);
        all.reverse();
        all.push(Item {
            id: "item-000".into(),
            seq: 2,
            color: "red",
            weight: 0,
        });
        let result = paginate(&all, &Filters::new(), PageRequest::clamped(1, 10, 100), None);
        let ids: Vec<&str> = result.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["item-001", "item-000", "item-002", "item-003"]);
    }

    #[test]
    fn explicit_sort_breaks_ties_by_identifier() {
        let all = items(6);
        let spec = SortSpec::by([SortKey::desc("weight")]);
        let result = paginate(&all, &Filters::new(), PageRequest::clamped(1, 10, 100), Some(&spec));
        let ids: Vec<&str> = result.items.iter().map(|i| i.id.as_str()).collect();
        // weights: 1→1, 2→2, 3→0, 4→1, 5→2, 6→0
        assert_eq!(
            ids,
            vec!["item-002", "item-005", "item-001", "item-004", "item-003", "item-006"]
        );
    }

    #[test]
    fn paginate_is_idempotent() {
        let all = items(17);
        let filters = Filters::new().with("color", "red");
        let request = PageRequest::clamped(2, 3, 100);
        let first = paginate(&all, &filters, request, None);
        let second = paginate(&all, &filters, request, None);
        assert_eq!(first, second);
    }

    #[test]
    fn unsupported_filter_keys_are_rejected() {
        let filters = Filters::new().with("library", "x").with("colour", "red");
        let err = filters.ensure_keys(&["library"]).unwrap_err();
        assert!(err.to_string().contains("colour"));
        assert!(Filters::new().with("colour", "").ensure_keys(&["library"]).is_ok());
    }

    #[test]
    fn window_is_centered_and_clamped() {
        assert_eq!(page_window(100, 10, 5, 5), vec![3, 4, 5, 6, 7]);
        assert_eq!(page_window(100, 10, 1, 5), vec![1, 2, 3, 4, 5]);
        assert_eq!(page_window(100, 10, 10, 5), vec![6, 7, 8, 9, 10]);
        assert_eq!(page_window(100, 10, 42, 5), vec![6, 7, 8, 9, 10]);
        assert_eq!(page_window(25, 10, 2, 5), vec![1, 2, 3]);
        assert_eq!(page_window(0, 10, 1, 5), Vec::<usize>::new());
    }

    #[test]
    fn window_spans_min_of_five_and_pages() {
        for total in 1..80 {
            for current in 1..10 {
                let w = page_window(total, 7, current, 5);
                assert_eq!(w.len(), total_pages(total, 7).min(5));
                assert!(w.windows(2).all(|p| p[1] == p[0] + 1));
            }
        }
    }

    #[test]
    fn paginator_applies_defaults() {
        let p = Paginator::default();
        assert_eq!(p.request(None, None), PageRequest { page: 1, size: 10 });
        assert_eq!(p.request(Some(3), Some(1000)), PageRequest { page: 3, size: 100 });
    }
}

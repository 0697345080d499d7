//! Pagination helpers for listing queries

use serde::{Deserialize, Serialize};

/// Clamp `[start, end)` into `list` and return that slice.
///
/// `start` is clamped to `[0, len]` and `end` to `[start, len]`, so any pair of
/// bounds yields a valid, possibly empty, slice.
///
/// ```
/// use core_library::pagination::secure_sublist;
///
/// let list = [1, 2, 3, 4];
/// assert_eq!(secure_sublist(&list, 1, 3), &[2, 3]);
/// assert_eq!(secure_sublist(&list, -5, 99), &list);
/// assert!(secure_sublist(&list, 3, 1).is_empty());
/// ```
pub fn secure_sublist<T>(list: &[T], start: i64, end: i64) -> &[T] {
    let len = list.len();
    let start = clamp_index(start, len);
    let end = clamp_index(end, len).max(start);
    &list[start..end]
}

fn clamp_index(index: i64, len: usize) -> usize {
    if index <= 0 {
        0
    } else {
        usize::try_from(index).map_or(len, |i| i.min(len))
    }
}

/// Window into a listing.
///
/// A `limit` of 0 or less means "up to the end".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub limit: i64,
    pub offset: i64,
}

impl PageRequest {
    /// ```
    /// use core_library::pagination::PageRequest;
    ///
    /// let request = PageRequest::new(20, 40);
    /// assert_eq!(request.bounds(), (40, 60));
    /// ```
    pub fn new(limit: i64, offset: i64) -> Self {
        Self { limit, offset }
    }

    /// Everything from the start.
    pub fn all() -> Self {
        Self::new(0, 0)
    }

    /// `[start, end)` to hand to [`secure_sublist`]. Negative offsets start
    /// at 0.
    pub fn bounds(&self) -> (i64, i64) {
        let start = self.offset.max(0);
        let end = if self.limit <= 0 {
            i64::MAX
        } else {
            start.saturating_add(self.limit)
        };
        (start, end)
    }

    pub fn slice<'a, T>(&self, list: &'a [T]) -> &'a [T] {
        let (start, end) = self.bounds();
        secure_sublist(list, start, end)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(50, 0)
    }
}

/// One page of results plus the size of the whole listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Number of items across all pages
    pub total: u64,
    pub offset: i64,
    pub limit: i64,
}

impl<T: Clone> Page<T> {
    /// Cut `request`'s window out of the full listing.
    pub fn from_listing(all: &[T], request: PageRequest) -> Self {
        Self {
            items: request.slice(all).to_vec(),
            total: all.len() as u64,
            offset: request.offset,
            limit: request.limit,
        }
    }
}

impl<T> Page<T> {
    pub fn empty(request: PageRequest) -> Self {
        Self {
            items: Vec::new(),
            total: 0,
            offset: request.offset,
            limit: request.limit,
        }
    }

    /// Whether items exist after this page.
    pub fn has_next(&self) -> bool {
        let consumed = self.offset.max(0) as u64 + self.items.len() as u64;
        self.limit > 0 && consumed < self.total
    }

    pub fn map<U, F>(self, f: F) -> Page<U>
    where
        F: FnMut(T) -> U,
    {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            offset: self.offset,
            limit: self.limit,
        }
    }
}

//! Sorting, page requests and page/slice results.

use crate::query::Path;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub path: Path,
    pub direction: Direction,
}

impl Order {
    pub fn asc(path: impl Into<Path>) -> Self {
        Self {
            path: path.into(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(path: impl Into<Path>) -> Self {
        Self {
            path: path.into(),
            direction: Direction::Desc,
        }
    }
}

/// An ordered list of sort keys. Empty means unsorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sort {
    orders: Vec<Order>,
}

impl Sort {
    pub fn unsorted() -> Self {
        Self::default()
    }

    /// Sort by several properties in the same direction.
    pub fn by(direction: Direction, properties: &[&str]) -> Self {
        Self {
            orders: properties
                .iter()
                .map(|p| Order {
                    path: Path::from(*p),
                    direction,
                })
                .collect(),
        }
    }

    pub fn asc(property: &str) -> Self {
        Self::by(Direction::Asc, &[property])
    }

    pub fn desc(property: &str) -> Self {
        Self::by(Direction::Desc, &[property])
    }

    pub fn from_orders(orders: Vec<Order>) -> Self {
        Self { orders }
    }

    /// This sort followed by `other`.
    pub fn and(mut self, other: Sort) -> Self {
        self.orders.extend(other.orders);
        self
    }

    pub fn orders(&self) -> &[Order] {
        &self.orders
    }

    pub fn is_unsorted(&self) -> bool {
        self.orders.is_empty()
    }
}

/// Zero-based page index, page size and sort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    page: u64,
    size: u64,
    sort: Sort,
}

impl PageRequest {
    /// A size of zero is raised to one.
    pub fn of(page: u64, size: u64) -> Self {
        Self {
            page,
            size: size.max(1),
            sort: Sort::unsorted(),
        }
    }

    pub fn of_sorted(page: u64, size: u64, sort: Sort) -> Self {
        Self::of(page, size).with_sort(sort)
    }

    pub fn with_sort(mut self, sort: Sort) -> Self {
        self.sort = sort;
        self
    }

    pub fn page(&self) -> u64 {
        self.page
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn sort(&self) -> &Sort {
        &self.sort
    }

    pub fn offset(&self) -> u64 {
        self.page.saturating_mul(self.size)
    }

    pub fn next(&self) -> Self {
        Self {
            page: self.page + 1,
            ..self.clone()
        }
    }

    pub fn previous_or_first(&self) -> Self {
        Self {
            page: self.page.saturating_sub(1),
            ..self.clone()
        }
    }

    /// Same request with the size capped to `max`.
    pub fn capped(&self, max: u64) -> Self {
        Self {
            size: self.size.min(max.max(1)),
            ..self.clone()
        }
    }
}

/// One page of results plus the total across all pages.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    content: Vec<T>,
    number: u64,
    size: u64,
    total_elements: u64,
}

impl<T> Page<T> {
    pub fn new(content: Vec<T>, request: &PageRequest, total_elements: u64) -> Self {
        Self {
            content,
            number: request.page(),
            size: request.size(),
            total_elements,
        }
    }

    /// Build a page, only calling `count` when the total cannot be derived from the content:
    /// a first page that is not full, or a non-empty last page that is not full.
    pub fn from_partial(content: Vec<T>, request: &PageRequest, count: impl FnOnce() -> u64) -> Self {
        let total = Self::known_total(content.len(), request).unwrap_or_else(count);
        Self::new(content, request, total)
    }

    /// The total implied by a page of `len` rows, when no count query is needed.
    pub fn known_total(len: usize, request: &PageRequest) -> Option<u64> {
        let len = len as u64;
        if request.offset() == 0 && len < request.size() {
            Some(len)
        } else if len != 0 && len < request.size() {
            Some(request.offset() + len)
        } else {
            None
        }
    }

    pub fn content(&self) -> &[T] {
        &self.content
    }

    pub fn into_content(self) -> Vec<T> {
        self.content
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn number_of_elements(&self) -> usize {
        self.content.len()
    }

    pub fn total_elements(&self) -> u64 {
        self.total_elements
    }

    pub fn total_pages(&self) -> u64 {
        self.total_elements.div_ceil(self.size.max(1))
    }

    pub fn is_first(&self) -> bool {
        self.number == 0
    }

    pub fn is_last(&self) -> bool {
        !self.has_next()
    }

    pub fn has_next(&self) -> bool {
        self.number + 1 < self.total_pages()
    }

    pub fn has_previous(&self) -> bool {
        self.number > 0
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            content: self.content.into_iter().map(f).collect(),
            number: self.number,
            size: self.size,
            total_elements: self.total_elements,
        }
    }
}

/// A page without a total; `has_next` comes from fetching one extra row.
#[derive(Debug, Clone, PartialEq)]
pub struct Slice<T> {
    content: Vec<T>,
    number: u64,
    size: u64,
    has_next: bool,
}

impl<T> Slice<T> {
    /// `content` may hold up to `size + 1` rows; the extra row only signals a next slice.
    pub fn from_lookahead(mut content: Vec<T>, request: &PageRequest) -> Self {
        let has_next = content.len() as u64 > request.size();
        content.truncate(request.size() as usize);
        Self {
            content,
            number: request.page(),
            size: request.size(),
            has_next,
        }
    }

    pub fn content(&self) -> &[T] {
        &self.content
    }

    pub fn into_content(self) -> Vec<T> {
        self.content
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn has_next(&self) -> bool {
        self.has_next
    }

    pub fn is_first(&self) -> bool {
        self.number == 0
    }

    pub fn is_last(&self) -> bool {
        !self.has_next
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Slice<U> {
        Slice {
            content: self.content.into_iter().map(f).collect(),
            number: self.number,
            size: self.size,
            has_next: self.has_next,
        }
    }
}

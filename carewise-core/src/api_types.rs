use serde::{Deserialize, Serialize};

pub const DEFAULT_PER_PAGE: usize = 25;
pub const MAX_PER_PAGE: usize = 200;

/// 1-based page selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    #[serde(default = "PageRequest::default_page")]
    pub page: usize,
    #[serde(default = "PageRequest::default_per_page")]
    pub per_page: usize,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: Self::default_page(),
            per_page: Self::default_per_page(),
        }
    }
}

impl PageRequest {
    fn default_page() -> usize {
        1
    }

    fn default_per_page() -> usize {
        DEFAULT_PER_PAGE
    }

    pub fn new(page: usize, per_page: usize) -> Self {
        Self { page, per_page }.normalized()
    }

    /// Clamps to page >= 1 and 1..=MAX_PER_PAGE items.
    pub fn normalized(self) -> Self {
        Self {
            page: self.page.max(1),
            per_page: self.per_page.clamp(1, MAX_PER_PAGE),
        }
    }

    pub fn offset(&self) -> usize {
        (self.page.max(1) - 1).saturating_mul(self.per_page)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
    pub total_pages: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub pagination: Pagination,
}

impl<T> Page<T> {
    /// Slices an already ordered result set.
    pub fn from_vec(all: Vec<T>, request: PageRequest) -> Self {
        let request = request.normalized();
        let total = all.len();
        let items = all
            .into_iter()
            .skip(request.offset())
            .take(request.per_page)
            .collect();
        Self {
            items,
            pagination: Pagination {
                page: request.page,
                per_page: request.per_page,
                total,
                total_pages: total.div_ceil(request.per_page),
            },
        }
    }
}

/// Standard API envelope: `{success, data|error, pagination?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<Pagination>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            pagination: None,
        }
    }

    pub fn error(error: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            pagination: None,
        }
    }

    pub fn with_pagination(mut self, pagination: Pagination) -> Self {
        self.pagination = Some(pagination);
        self
    }
}

impl<T> ApiResponse<Vec<T>> {
    pub fn page(page: Page<T>) -> Self {
        Self::success(page.items).with_pagination(page.pagination)
    }
}

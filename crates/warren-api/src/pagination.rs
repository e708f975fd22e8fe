use serde::Deserialize;

use warren_types::api::{Collection, PageLinks, PageMeta};

pub const DEFAULT_PER_PAGE: u32 = 10;
pub const MAX_PER_PAGE: u32 = 100;

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
}

fn default_page() -> u32 {
    1
}

fn default_per_page() -> u32 {
    DEFAULT_PER_PAGE
}

impl PageQuery {
    /// Clamps into the allowed range: page >= 1, 1 <= per_page <= 100.
    pub fn clamped(&self) -> (u32, u32) {
        (self.page.max(1), self.per_page.clamp(1, MAX_PER_PAGE))
    }
}

/// Builds the collection envelope: items, paging metadata, and
/// self/next/prev links relative to `base_path`.
pub fn collection<T>(
    items: Vec<T>,
    page: u32,
    per_page: u32,
    total_items: u64,
    base_path: &str,
) -> Collection<T> {
    let total_pages = total_items.div_ceil(per_page as u64) as u32;

    let link = |p: u32| format!("{}?page={}&per_page={}", base_path, p, per_page);

    Collection {
        items,
        meta: PageMeta {
            page,
            per_page,
            total_pages,
            total_items,
        },
        links: PageLinks {
            self_link: link(page),
            next: (page < total_pages).then(|| link(page + 1)),
            prev: (page > 1).then(|| link(page - 1)),
        },
    }
}

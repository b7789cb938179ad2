//! Product catalog slice. Cached so the catalog stays browsable offline.

use serde::{Deserialize, Serialize};

use crate::api::types::{CategoryDto, ProductDto};
use crate::sync::queue::now_ms;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductState {
    pub products: Vec<ProductDto>,
    pub categories: Vec<CategoryDto>,
    /// Milliseconds since the Unix epoch.
    pub last_fetched_at: Option<u64>,

    #[serde(skip)]
    pub loading: bool,
    #[serde(skip)]
    pub error: Option<String>,
}

impl ProductState {
    pub fn replace(&mut self, products: Vec<ProductDto>, categories: Vec<CategoryDto>) {
        self.products = products;
        self.categories = categories;
        self.last_fetched_at = Some(now_ms());
        self.error = None;
    }

    pub fn product(&self, id: u64) -> Option<&ProductDto> {
        self.products.iter().find(|p| p.id == id)
    }

    pub fn in_category(&self, category_id: u64) -> impl Iterator<Item = &ProductDto> {
        self.products
            .iter()
            .filter(move |p| p.category_id == Some(category_id))
    }
}

//! Shared DTO types used across multiple endpoints.

use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::persistence::Page;

/// Pagination query parameters for list endpoints.
#[derive(Debug, Clone, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct PaginationParams {
    /// Page number (1-indexed). Defaults to 1.
    #[serde(default = "default_page")]
    pub page: u32,
    /// Items per page (max 100). Defaults to 50.
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_page() -> u32 {
    1
}

fn default_limit() -> u32 {
    50
}

impl PaginationParams {
    /// Clamped page request.
    #[must_use]
    pub fn page(&self) -> Page {
        Page::new(self.page, self.limit)
    }
}

/// Count of rows touched by a bulk update.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct UpdatedResponse {
    /// Rows updated.
    pub updated: u64,
}

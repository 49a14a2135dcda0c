pub mod rest;

pub use rest::{create_metrics_router, create_rest_api, ApiError};

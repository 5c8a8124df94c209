//! Browser form for scheduling and cancelling notifications.

use std::path::Path;

use axum::Router;
use tower_http::services::{ServeDir, ServeFile};

/// `GET /` serves `index.html`; `/static/*` serves the rest of `dir`.
pub fn router(dir: impl AsRef<Path>) -> Router {
    let dir = dir.as_ref();
    Router::new()
        .route_service("/", ServeFile::new(dir.join("index.html")))
        .nest_service("/static", ServeDir::new(dir))
}

use crate::{
    error::{AppError, AppResult},
    state::AppState,
};
use actix_web::{http::header::ContentType, web, HttpResponse};
use std::io;
use std::path::PathBuf;
use tracing::warn;

pub const LANDING_DOCUMENT: &str = "index.html";

fn landing_path(public_dir: &str) -> PathBuf {
    PathBuf::from(public_dir).join(LANDING_DOCUMENT)
}

/// Serves the browser client page from `<public_dir>/index.html`.
pub async fn landing_page(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let path = landing_path(&state.config().server.public_dir);

    match tokio::fs::read(&path).await {
        Ok(body) => Ok(HttpResponse::Ok()
            .content_type(ContentType::html())
            .body(body)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "Landing document missing");
            Err(AppError::NotFound(LANDING_DOCUMENT.to_string()))
        }
        Err(err) => Err(err.into()),
    }
}

pub async fn not_found() -> HttpResponse {
    HttpResponse::NotFound()
        .content_type(ContentType::plaintext())
        .body("Not found")
}

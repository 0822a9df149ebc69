use crate::{audio::format::PcmFormat, error::AppResult, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Read-only view of the effective configuration.
///
/// Configuration is fixed at startup; change it through `config.toml` or
/// `APP_*` environment variables and restart.
pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = state.config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config,
        "format": {
            "sample_rate": PcmFormat::BRIDGE.sample_rate,
            "channels": PcmFormat::BRIDGE.channels,
            "sample_format": PcmFormat::BRIDGE.sample_format_arg(),
            "bytes_per_frame": PcmFormat::BRIDGE.bytes_per_frame()
        }
    })))
}

use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::handlers;
use super::middleware::{auth_gate, content_type_guard, security_headers};
use super::static_files;
use crate::state::AppState;

/// Create the main application router.
///
/// Route shape follows the published API: first match wins, non-reserved
/// GETs fall through to the SPA shell, unrouted mutating methods are 400.
pub fn create_router(state: Arc<AppState>) -> Router {
    let api_routes = Router::new()
        // Apps
        .route("/apps", get(handlers::apps::get_apps).post(handlers::apps::save_app))
        .route("/apps/reorder", post(handlers::apps::reorder_apps))
        .route("/apps/delete", post(handlers::apps::delete_app))
        .route("/apps/launch", post(handlers::apps::launch_app))
        .route("/apps/close", post(handlers::apps::close_app))
        .route("/apps/purge_autosync", post(handlers::apps::purge_autosync))
        .route("/apps/:id", delete(handlers::apps::delete_app_by_index))
        .route("/apps/:id/cover", get(handlers::apps::get_app_cover))
        // Config
        .route(
            "/config",
            get(handlers::config::get_config)
                .post(handlers::config::save_config)
                .patch(handlers::config::patch_config),
        )
        .route("/metadata", get(handlers::get_metadata))
        .route("/configLocale", get(handlers::get_locale))
        .route("/restart", post(handlers::restart))
        .route("/quit", post(handlers::quit))
        .route("/password", post(handlers::save_password))
        // Pairing
        .route("/pin", post(handlers::clients::save_pin))
        .route("/otp", post(handlers::clients::get_otp))
        // Clients
        .route("/clients/list", get(handlers::clients::list_clients))
        .route("/clients/update", post(handlers::clients::update_client))
        .route("/clients/unpair", post(handlers::clients::unpair))
        .route("/clients/unpair-all", post(handlers::clients::unpair_all))
        .route("/clients/disconnect", post(handlers::clients::disconnect))
        .route("/clients/hdr-profiles", get(handlers::clients::hdr_profiles))
        // Display
        .route("/display-devices", get(handlers::display::get_display_devices))
        .route(
            "/framegen/edid-refresh",
            get(handlers::display::get_framegen_edid_refresh),
        )
        .route("/health/vigem", get(handlers::display::get_vigem_health))
        .route(
            "/reset-display-device-persistence",
            post(handlers::display::reset_persistence),
        )
        .route("/display/export_golden", post(handlers::display::export_golden))
        .route("/display/golden_status", get(handlers::display::golden_status))
        .route("/display/golden", delete(handlers::display::delete_golden))
        // WebRTC
        .route(
            "/webrtc/sessions",
            get(handlers::webrtc::list_sessions).post(handlers::webrtc::create_session),
        )
        .route(
            "/webrtc/sessions/:id",
            get(handlers::webrtc::get_session).delete(handlers::webrtc::close_session),
        )
        .route("/webrtc/sessions/:id/offer", post(handlers::webrtc::set_offer))
        .route("/webrtc/sessions/:id/answer", get(handlers::webrtc::get_answer))
        .route(
            "/webrtc/sessions/:id/ice",
            get(handlers::webrtc::get_ice_candidates).post(handlers::webrtc::add_ice_candidates),
        )
        .route("/webrtc/sessions/:id/ice/stream", get(handlers::webrtc::ice_stream))
        // Tokens
        .route("/token", post(handlers::auth::create_api_token))
        .route("/tokens", get(handlers::auth::list_api_tokens))
        .route("/token/:hash", delete(handlers::auth::delete_api_token))
        // Auth
        .route("/auth/login", post(handlers::auth::login))
        .route("/auth/refresh", post(handlers::auth::refresh))
        .route("/auth/logout", post(handlers::auth::logout))
        .route("/auth/status", get(handlers::auth::status))
        .route("/auth/sessions", get(handlers::auth::list_sessions))
        .route("/auth/sessions/:hash", delete(handlers::auth::delete_session))
        // Session / logs / control channel
        .route("/ws", get(super::ws::ws_handler))
        .route("/session/status", get(handlers::session_status))
        .route("/logs", get(handlers::get_logs))
        .route("/logs/export", get(handlers::export_logs))
        .route("/logs/export_crash", get(handlers::export_logs))
        // Playnite
        .route("/playnite/status", get(handlers::playnite::status))
        .route("/playnite/games", get(handlers::playnite::games))
        .route("/playnite/categories", get(handlers::playnite::categories))
        .route("/playnite/plugins", get(handlers::playnite::plugins))
        .route("/playnite/sync", post(handlers::playnite::force_sync))
        .route("/playnite/launch", post(handlers::playnite::launch_game))
        .route("/playnite/stop", post(handlers::playnite::stop_game));

    Router::new()
        .nest("/api", api_routes)
        .fallback(static_files::fallback)
        .layer(middleware::from_fn_with_state(state.clone(), auth_gate))
        .layer(middleware::from_fn(content_type_guard))
        .layer(middleware::from_fn_with_state(state.clone(), security_headers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

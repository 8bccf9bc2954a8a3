//! HTTP service hosting the stateless helper functions used by the chat
//! client: conversation title generation and voice transcription.

pub mod error;
pub mod rate_limit;
pub mod title;
pub mod transcribe;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::Method;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::FunctionsConfig;
use crate::providers::{ChatGateway, GatewayProvider};
use crate::services::remote::SupabaseClient;

use rate_limit::AnonymousLimiter;
use transcribe::{IdentityVerifier, SupabaseVerifier, Transcriber, WhisperTranscriber};

#[derive(Clone)]
pub struct FunctionsState {
    pub config: Arc<FunctionsConfig>,
    /// `None` when no gateway key is configured.
    pub title_gateway: Option<Arc<dyn ChatGateway>>,
    pub transcriber: Arc<dyn Transcriber>,
    /// `None` treats every caller as anonymous.
    pub identity: Option<Arc<dyn IdentityVerifier>>,
    pub anonymous_limiter: AnonymousLimiter,
}

impl FunctionsState {
    pub fn from_config(config: FunctionsConfig) -> Self {
        let title_gateway = config.gateway_api_key.clone().map(|key| {
            Arc::new(GatewayProvider::new(config.gateway_url.clone(), Some(key)))
                as Arc<dyn ChatGateway>
        });
        let transcriber = Arc::new(WhisperTranscriber::new(
            config.transcription_url.clone(),
            config.openai_api_key.clone(),
        ));
        let identity = config.supabase_url.clone().map(|url| {
            Arc::new(SupabaseVerifier::new(SupabaseClient::new(
                url,
                config.supabase_anon_key.clone(),
            ))) as Arc<dyn IdentityVerifier>
        });
        let anonymous_limiter = AnonymousLimiter::hourly(config.anonymous_transcription_limit);

        Self {
            config: Arc::new(config),
            title_gateway,
            transcriber,
            identity,
            anonymous_limiter,
        }
    }
}

pub fn build_router(state: FunctionsState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/functions/v1/generate-title", post(title::generate_title_handler))
        .route("/functions/v1/transcribe", post(transcribe::transcribe_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub async fn serve(state: FunctionsState, addr: SocketAddr) -> anyhow::Result<()> {
    let limiter = state.anonymous_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            limiter.purge_expired().await;
        }
    });

    let app = build_router(state);
    info!(addr = %addr, "Starting functions server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

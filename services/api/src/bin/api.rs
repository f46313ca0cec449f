//! services/api/src/bin/api.rs

use api_lib::{
    adapters::{
        analysis_llm::OpenAiAnalysisAdapter, db::DbAdapter, scoring_llm::OpenAiScoringAdapter,
    },
    config::Config,
    error::ApiError,
    web::{
        analysis_task::spawn_analysis_worker, increment_attempt_handler, list_flags_handler,
        replace_transcript_handler, request_evaluation_handler, require_supervisor,
        rest::ApiDoc, start_session_handler, state::AppState, submit_feedback_handler,
        ws_handler,
    },
};
use async_openai::{config::OpenAIConfig, Client};
use axum::{
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Arc::new(Config::from_env()?);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded. Starting server...");

    // --- 2. Connect to Database & Run Migrations ---
    info!("Connecting to database...");
    let db_pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;
    let db_adapter = Arc::new(DbAdapter::new(db_pool.clone()));
    info!("Running database migrations...");
    db_adapter.run_migrations().await?;
    info!("Database migrations complete.");

    // --- 3. Initialize Service Adapters ---
    let openai_config = OpenAIConfig::new().with_api_key(
        config
            .openai_api_key
            .as_ref()
            .ok_or_else(|| ApiError::Internal("OPENAI_API_KEY is required".to_string()))?,
    );
    let openai_client = Client::with_config(openai_config);

    let scoring_adapter = Arc::new(OpenAiScoringAdapter::new(
        openai_client.clone(),
        config.scoring_model.clone(),
    ));
    let analysis_adapter = Arc::new(OpenAiAnalysisAdapter::new(
        openai_client.clone(),
        config.analysis_model.clone(),
    ));

    // --- 4. Spawn the Post-Session Analysis Worker ---
    let analysis_queue = spawn_analysis_worker(
        db_adapter.clone(),
        analysis_adapter.clone(),
        config.inference_timeout,
    );

    // --- 5. Build the Shared AppState ---
    let app_state = Arc::new(AppState {
        db: db_adapter,
        config: config.clone(),
        scoring_adapter,
        analysis_adapter,
        analysis_queue,
    });

    // --- 6. Create the Web Router ---
    // Trainee-facing routes plus the live channel.
    let session_routes = Router::new()
        .route("/sessions", post(start_session_handler))
        .route("/sessions/{session_id}/attempts", post(increment_attempt_handler))
        .route(
            "/sessions/{session_id}/transcript",
            post(replace_transcript_handler),
        )
        .route(
            "/sessions/{session_id}/evaluation",
            post(request_evaluation_handler),
        )
        .route("/sessions/{session_id}/feedback", post(submit_feedback_handler))
        .route("/ws", get(ws_handler));

    // Supervisor-only routes.
    let supervisor_routes = Router::new()
        .route("/flags", get(list_flags_handler))
        .layer(axum_middleware::from_fn_with_state(
            app_state.clone(),
            require_supervisor,
        ));

    let api_router = Router::new()
        .merge(session_routes)
        .merge(supervisor_routes)
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    // Merge the API router with the Swagger UI router for a complete application.
    let app = Router::new()
        .merge(api_router)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    // --- 7. Start the Server ---
    info!("Starting server on {}", config.bind_address);
    info!(
        "Swagger UI available at http://{}/swagger-ui",
        config.bind_address
    );
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

mod auth;
mod config;
mod constants;
mod db;
mod error;
mod inference;
mod ollama;
mod registry;
mod routes;
#[cfg(test)]
mod test_utils;

use auth::{TokenSigner, UsersStore};
use axum::ServiceExt;
use axum::{
    Router,
    http::{HeaderValue, Method, header},
};
use clap::Parser;
use config::{Config, CorsMode};
use db::Db;
use error::GatewayError;
use inference::InferenceService;
use ollama::OllamaClient;
use registry::{GrantsStore, ModelResolver, ModelsStore, UsageStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::normalize_path::NormalizePath;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa_axum::{router::OpenApiRouter, routes};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");
pub const BUILD_TIME: &str = env!("BUILD_TIME");

pub struct AppState {
    pub config: Config,
    pub users: UsersStore,
    pub models: ModelsStore,
    pub grants: GrantsStore,
    pub usage: UsageStore,
    pub resolver: ModelResolver,
    pub ollama: OllamaClient,
    pub inference: InferenceService,
    pub signer: TokenSigner,
}

impl AppState {
    pub fn new(config: Config, db: Db) -> Result<Self, GatewayError> {
        let users = UsersStore::new(db.clone());
        let models = ModelsStore::new(db.clone());
        let grants = GrantsStore::new(db.clone());
        let usage = UsageStore::new(db);
        let resolver = ModelResolver::new(models.clone(), grants.clone(), usage.clone());

        let ollama = OllamaClient::new(&config.ollama_url, config.ollama_timeout)?;
        let inference = InferenceService::new(ollama.clone(), usage.clone());

        let signer = match &config.jwt_secret {
            Some(secret) => TokenSigner::new(secret, config.token_ttl),
            None => {
                warn!("JWT_SECRET_KEY is not set; using a random secret, tokens won't survive a restart");
                TokenSigner::ephemeral(config.token_ttl)
            }
        };

        Ok(Self {
            config,
            users,
            models,
            grants,
            usage,
            resolver,
            ollama,
            inference,
            signer,
        })
    }
}

/// Current time as epoch milliseconds
pub fn timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(Parser)]
#[command(name = "ollama-gateway")]
#[command(about = "Access-controlled gateway and model registry for Ollama")]
struct Args {
    /// Host to bind to
    #[arg(short = 'H', long, env = "GATEWAY_HOST")]
    host: Option<String>,

    /// Port to bind to
    #[arg(short, long, env = "GATEWAY_PORT")]
    port: Option<u16>,
}

fn cors_layer(mode: &CorsMode) -> CorsLayer {
    let mode = mode.clone();
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            origin.to_str().is_ok_and(|o| mode.allows(o))
        }))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::HeaderName::from_static("x-request-id"),
        ])
        .expose_headers([header::HeaderName::from_static("x-request-id")])
        .allow_credentials(true)
}

/// The full application router, without trailing-slash normalization
pub fn build_app(state: Arc<AppState>) -> Router {
    let auth_routes = OpenApiRouter::<Arc<AppState>>::new()
        .routes(routes!(routes::auth::login))
        .routes(routes!(routes::auth::register, routes::auth::list_users))
        .routes(routes!(routes::auth::me))
        .routes(routes!(
            routes::auth::get_user,
            routes::auth::update_user,
            routes::auth::delete_user
        ));

    let registry_routes = OpenApiRouter::<Arc<AppState>>::new()
        // Models
        .routes(routes!(
            routes::registry::list_models,
            routes::registry::create_model
        ))
        .routes(routes!(
            routes::registry::get_model,
            routes::registry::update_model,
            routes::registry::delete_model
        ))
        .routes(routes!(routes::registry::set_default_model))
        .routes(routes!(routes::registry::sync_ollama_models))
        .routes(routes!(routes::registry::get_default_model))
        // Access grants
        .routes(routes!(routes::registry::create_grant))
        .routes(routes!(
            routes::registry::update_grant,
            routes::registry::delete_grant
        ))
        .routes(routes!(routes::registry::list_user_grants))
        .routes(routes!(routes::registry::list_model_grants))
        // Usage
        .routes(routes!(
            routes::registry::record_usage,
            routes::registry::list_usage
        ))
        .routes(routes!(routes::registry::usage_stats));

    // Backend-bound routes share one in-flight bound
    let inference_routes = OpenApiRouter::<Arc<AppState>>::new()
        .routes(routes!(routes::gateway::autocomplete))
        .routes(routes!(routes::gateway::chat))
        .layer(GlobalConcurrencyLimitLayer::new(
            state.config.max_concurrent_inference.max(1),
        ));

    let (api_router, openapi) = OpenApiRouter::with_openapi(Default::default())
        .nest("/auth", auth_routes)
        .nest("/registry", registry_routes)
        .merge(inference_routes)
        .routes(routes!(routes::gateway::list_models))
        .routes(routes!(routes::health::health))
        .routes(routes!(routes::health::version))
        .split_for_parts();

    // Swagger UI + OpenAPI document (accessible without authentication)
    let swagger_routes = Router::new().merge(
        utoipa_swagger_ui::SwaggerUi::new("/swagger").url("/api-docs/openapi.json", openapi),
    );

    Router::new()
        .merge(swagger_routes)
        .merge(api_router)
        .layer(cors_layer(&state.config.cors_mode))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = Config::from_env();

    let db = Db::open(&config.db_path)
        .await
        .expect("Failed to initialize database");

    let host = args.host.unwrap_or_else(|| config.host.clone());
    let port = args.port.unwrap_or(config.port);

    match &config.cors_mode {
        CorsMode::AllowAll => info!("CORS: Allowing all origins"),
        CorsMode::LocalhostOnly => info!("CORS: Localhost only"),
        CorsMode::AllowList(list) => info!("CORS: Allowing origins: {:?}", list),
    }
    if !config.open_registration {
        info!("Open registration disabled; only admins can create users");
    }

    let state = Arc::new(AppState::new(config, db).expect("Failed to initialize state"));
    info!("Ollama backend: {}", state.ollama.base_url());

    let app = NormalizePath::trim_trailing_slash(build_app(state));

    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .expect("Invalid address");
    info!(
        "Starting ollama-gateway v{}-{} (built {})",
        VERSION, GIT_HASH, BUILD_TIME
    );
    info!("Listening on http://{}", addr);
    info!("API docs: http://{}/swagger", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind address");
    axum::serve(
        listener,
        ServiceExt::<axum::extract::Request>::into_make_service(app),
    )
    .await
    .expect("Server error");
}

// src/main.rs - LifeLink blood donation coordination backend
use actix_web::{
    middleware::{Compress, DefaultHeaders, Logger},
    web, App, HttpResponse, HttpServer,
};
use actix_cors::Cors;
use actix_web::http::header;
use actix_web_httpauth::middleware::HttpAuthentication;
use anyhow::Context;
use sqlx::{migrate::MigrateDatabase, sqlite::SqliteConnectOptions, Sqlite, SqlitePool};
use std::env;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod audit;
mod auth;
mod auth_handlers;
mod config;
mod db;
mod error;
mod inventory_handlers;
mod models;
mod request_handlers;

use auth::{jwt_middleware, AuthService, RegisterRequest, UserRole};
use auth_handlers::{login, me, register};
use config::{load_config, Config};
use inventory_handlers::{add_units, delete_unit, get_inventory, get_inventory_stats};
use request_handlers::{
    create_request, dispatch_request, donate_request, fulfill_request, get_all_requests,
    get_broadcasts, get_my_requests,
};

pub struct AppState {
    pub db_pool: SqlitePool,
    pub config: Config,
}

// ==================== MAIN ====================

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration (this calls load_env_file internally)
    let config = load_config()?;

    setup_logging(&config)?;

    if config.is_production() {
        validate_production_config(&config)?;
    }

    setup_database(&config.database.url).await?;
    let pool = create_database_pool(&config.database).await?;
    db::run_migrations(&pool).await?;

    let auth_service = Arc::new(AuthService::new(&config.auth));

    seed_default_accounts(&pool, &auth_service).await?;

    let app_state = Arc::new(AppState {
        db_pool: pool.clone(),
        config: config.clone(),
    });

    let bind_address = format!("{}:{}", config.server.host, config.server.port);
    log::info!("Starting LifeLink server at http://{}", bind_address);

    let workers = config.server.workers;

    let mut server = HttpServer::new(move || {
        let cors = setup_cors(&config.security.allowed_origins);
        let security_headers = setup_security_headers(&config.security);

        App::new()
            .wrap(cors)
            .wrap(security_headers)
            .wrap(Logger::default())
            .wrap(Compress::default())
            .app_data(web::Data::new(app_state.clone()))
            .app_data(web::Data::new(auth_service.clone()))
            // Health check (no auth)
            .route(
                "/health",
                web::get().to(|| async { HttpResponse::Ok().body("OK") }),
            )
            // Auth: login/register are public, profile requires a token
            .service(
                web::scope("/auth")
                    .route("/login", web::post().to(login))
                    .route("/register", web::post().to(register))
                    .service(
                        web::resource("/me")
                            .wrap(HttpAuthentication::bearer(jwt_middleware))
                            .route(web::get().to(me)),
                    ),
            )
            // Inventory
            .service(
                web::scope("/inventory")
                    .wrap(HttpAuthentication::bearer(jwt_middleware))
                    .route("", web::get().to(get_inventory))
                    .route("/add", web::post().to(add_units))
                    .route("/stats", web::get().to(get_inventory_stats))
                    .route("/{id}", web::delete().to(delete_unit)),
            )
            // Blood requests
            .service(
                web::scope("/requests")
                    .wrap(HttpAuthentication::bearer(jwt_middleware))
                    .route("/all", web::get().to(get_all_requests))
                    .route("/my-requests", web::get().to(get_my_requests))
                    .route("/broadcasts", web::get().to(get_broadcasts))
                    .route("/create", web::post().to(create_request))
                    .route("/{id}/fulfill", web::post().to(fulfill_request))
                    .route("/{id}/dispatch", web::post().to(dispatch_request))
                    .route("/{id}/donate", web::post().to(donate_request)),
            )
    })
    .bind(&bind_address)?;

    if let Some(workers) = workers {
        server = server.workers(workers);
    }

    server.run().await.context("Server failed to run")?;

    Ok(())
}

// ==================== HELPER FUNCTIONS ====================

fn setup_cors(allowed_origins: &[String]) -> Cors {
    let mut cors = Cors::default()
        .allowed_methods(vec!["GET", "POST", "PUT", "DELETE", "OPTIONS"])
        .allowed_headers(vec![
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
        ])
        .max_age(3600);

    let is_production = env::var("LIFELINK_ENV").as_deref() == Ok("production");

    if allowed_origins.contains(&"*".to_string()) {
        if is_production {
            panic!("Cannot start server with wildcard CORS in production");
        }
        log::warn!("Using wildcard CORS (*) in development mode");
        cors = cors.allow_any_origin().allow_any_header().allow_any_method();
    } else {
        for origin in allowed_origins {
            if origin.is_empty() {
                continue;
            }
            cors = cors.allowed_origin(origin);
        }
    }

    cors
}

fn setup_logging(config: &Config) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.as_str()));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

fn validate_production_config(config: &Config) -> anyhow::Result<()> {
    if config.auth.jwt_secret.len() < 32 {
        anyhow::bail!("Insecure JWT secret in production! Must be at least 32 characters.");
    }

    if config.security.allowed_origins.contains(&"*".to_string()) {
        anyhow::bail!("Wildcard CORS origins not allowed in production!");
    }

    Ok(())
}

async fn setup_database(database_url: &str) -> anyhow::Result<()> {
    if !Sqlite::database_exists(database_url).await.unwrap_or(false) {
        log::info!("Creating database: {}", database_url);
        Sqlite::create_database(database_url).await?;
    }
    Ok(())
}

async fn create_database_pool(
    db_config: &crate::config::DatabaseConfig,
) -> anyhow::Result<SqlitePool> {
    let filename = db_config
        .url
        .strip_prefix("sqlite:")
        .unwrap_or(&db_config.url);

    let options = SqliteConnectOptions::new()
        .filename(filename)
        .create_if_missing(true);

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(db_config.max_connections)
        .min_connections(db_config.min_connections)
        .connect_with(options)
        .await?;

    Ok(pool)
}

fn setup_security_headers(config: &crate::config::SecurityConfig) -> DefaultHeaders {
    let mut headers = DefaultHeaders::new()
        .add(("X-Content-Type-Options", "nosniff"))
        .add(("X-Frame-Options", "DENY"))
        .add(("Referrer-Policy", "strict-origin-when-cross-origin"));

    if config.require_https {
        headers = headers.add((
            "Strict-Transport-Security",
            "max-age=31536000; includeSubDomains; preload",
        ));
    }

    headers
}

/// Create the stock demo accounts against an empty database so the
/// dashboards are usable on first start.
async fn seed_default_accounts(
    pool: &SqlitePool,
    auth_service: &AuthService,
) -> anyhow::Result<()> {
    let user_count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
        .fetch_one(pool)
        .await?;

    if user_count.0 > 0 {
        return Ok(());
    }

    let password =
        env::var("SEED_ACCOUNT_PASSWORD").unwrap_or_else(|_| "password123".to_string());

    let accounts = [
        (
            "hospital@lifelink.com",
            "LifeLink General Hospital",
            UserRole::Hospital,
            None,
        ),
        (
            "clinic@lifelink.com",
            "City Care Clinic",
            UserRole::Clinic,
            None,
        ),
        (
            "bloodbank@lifelink.com",
            "Central Blood Bank",
            UserRole::BloodBank,
            None,
        ),
        (
            "patient@lifelink.com",
            "John Doe",
            UserRole::Patient,
            Some("O+"),
        ),
    ];

    for (smart_id, full_name, role, blood_group) in accounts {
        let request = RegisterRequest {
            smart_id: smart_id.to_string(),
            full_name: full_name.to_string(),
            password: password.clone(),
            role: role.as_str().to_string(),
            blood_group: blood_group.map(str::to_string),
        };

        auth::User::create(pool, request, role, auth_service)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to seed account {}: {}", smart_id, e))?;

        log::info!("Seeded account: {} ({})", smart_id, role.as_str());
    }

    log::warn!("Default accounts created with the development password. Change them before exposing the server.");

    Ok(())
}

// src/auth_handlers.rs - Authentication route handlers
use actix_web::{web, HttpRequest, HttpResponse};
use std::sync::Arc;
use validator::Validate;

use crate::auth::{
    get_current_user, AuthService, LoginRequest, LoginResponse, RegisterRequest, User, UserInfo,
    UserRole,
};
use crate::error::{ApiError, ApiResult};
use crate::AppState;

// ==================== LOGIN ====================

pub async fn login(
    app_state: web::Data<Arc<AppState>>,
    auth_service: web::Data<Arc<AuthService>>,
    request: web::Json<LoginRequest>,
) -> ApiResult<HttpResponse> {
    request.validate()?;

    let user = User::find_by_smart_id(&app_state.db_pool, &request.smart_id)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("Invalid credentials".to_string()))?;

    if !auth_service.verify_password(&request.password, &user.password_hash)? {
        log::warn!("Failed login attempt for {}", user.smart_id);
        return Err(ApiError::Unauthorized("Invalid credentials".to_string()));
    }

    let token = auth_service.generate_token(&user)?;

    log::info!("User {} logged in ({})", user.smart_id, user.role);

    Ok(HttpResponse::Ok().json(LoginResponse {
        access_token: token,
        token_type: "bearer".to_string(),
        role: user.role,
    }))
}

// ==================== REGISTER ====================

pub async fn register(
    app_state: web::Data<Arc<AppState>>,
    auth_service: web::Data<Arc<AuthService>>,
    request: web::Json<RegisterRequest>,
) -> ApiResult<HttpResponse> {
    request.validate()?;

    let role = UserRole::from_str(&request.role)
        .ok_or_else(|| ApiError::BadRequest("Invalid role specified".to_string()))?;

    if !role.self_registrable() {
        return Err(ApiError::Forbidden(
            "Only patient and donor accounts can self-register".to_string(),
        ));
    }

    if User::find_by_smart_id(&app_state.db_pool, &request.smart_id)
        .await?
        .is_some()
    {
        return Err(ApiError::BadRequest(
            "Smart Identifier already registered".to_string(),
        ));
    }

    let user = User::create(&app_state.db_pool, request.into_inner(), role, &auth_service).await?;

    log::info!("New user registered: {} ({})", user.smart_id, user.role);

    Ok(HttpResponse::Created().json(serde_json::json!({
        "message": "User registered successfully"
    })))
}

// ==================== CURRENT USER ====================

pub async fn me(
    app_state: web::Data<Arc<AppState>>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;

    let user = User::find_by_id(&app_state.db_pool, &claims.sub).await?;

    Ok(HttpResponse::Ok().json(UserInfo::from(user)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;

    use crate::config::{AuthConfig, Config};

    // Single connection: each pooled in-memory connection would otherwise
    // get its own empty database.
    async fn test_state() -> web::Data<Arc<AppState>> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::db::run_migrations(&pool).await.unwrap();
        web::Data::new(Arc::new(AppState {
            db_pool: pool,
            config: Config::default(),
        }))
    }

    fn test_auth_service() -> web::Data<Arc<AuthService>> {
        web::Data::new(Arc::new(AuthService::new(&AuthConfig {
            jwt_secret: "test_secret_123456789012345678901234567890".to_string(),
            token_expiration_hours: 1,
            bcrypt_cost: 4, // keep the test fast
        })))
    }

    fn register_body(smart_id: &str, role: &str) -> web::Json<RegisterRequest> {
        web::Json(RegisterRequest {
            smart_id: smart_id.to_string(),
            full_name: "Jane Donor".to_string(),
            password: "password123".to_string(),
            role: role.to_string(),
            blood_group: Some("O+".to_string()),
        })
    }

    #[actix_rt::test]
    async fn test_register_rejects_duplicate_smart_id() {
        let state = test_state().await;
        let service = test_auth_service();

        let first = register(
            state.clone(),
            service.clone(),
            register_body("donor@lifelink.com", "donor"),
        )
        .await
        .unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);

        // Same smart id again: a 400 with a detail body, never a raw
        // UNIQUE constraint error
        let second = register(
            state.clone(),
            service.clone(),
            register_body("donor@lifelink.com", "donor"),
        )
        .await;
        assert!(matches!(second, Err(ApiError::BadRequest(_))));

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
            .fetch_one(&state.db_pool)
            .await
            .unwrap();
        assert_eq!(count.0, 1);
    }

    #[actix_rt::test]
    async fn test_register_rejects_institutional_roles() {
        let state = test_state().await;
        let service = test_auth_service();

        for role in ["hospital", "clinic", "bloodbank"] {
            let result = register(
                state.clone(),
                service.clone(),
                register_body("staff@lifelink.com", role),
            )
            .await;
            assert!(matches!(result, Err(ApiError::Forbidden(_))));
        }
    }

    #[actix_rt::test]
    async fn test_login_rejects_wrong_password() {
        let state = test_state().await;
        let service = test_auth_service();

        register(
            state.clone(),
            service.clone(),
            register_body("donor@lifelink.com", "donor"),
        )
        .await
        .unwrap();

        let result = login(
            state.clone(),
            service.clone(),
            web::Json(LoginRequest {
                smart_id: "donor@lifelink.com".to_string(),
                password: "wrong-password".to_string(),
            }),
        )
        .await;
        assert!(matches!(result, Err(ApiError::Unauthorized(_))));
    }
}

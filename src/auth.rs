// src/auth.rs - Users, roles, JWT auth service and bearer middleware
use actix_web::{dev::ServiceRequest, web, HttpMessage, HttpRequest};
use actix_web_httpauth::extractors::bearer::BearerAuth;
use bcrypt::{hash, verify};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;
use validator::Validate;

use crate::config::AuthConfig;
use crate::error::{ApiError, ApiResult};
use crate::models::BloodGroup;

// ======== USER MODEL ========

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: String,
    pub smart_id: String,
    pub full_name: String,
    pub password_hash: String,
    pub role: String,
    pub blood_group: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ======== USER ROLE ========

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum UserRole {
    Patient,
    Donor,
    Hospital,
    Clinic,
    BloodBank,
}

impl UserRole {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "patient" => Some(UserRole::Patient),
            "donor" => Some(UserRole::Donor),
            "hospital" => Some(UserRole::Hospital),
            "clinic" => Some(UserRole::Clinic),
            "bloodbank" => Some(UserRole::BloodBank),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Patient => "patient",
            UserRole::Donor => "donor",
            UserRole::Hospital => "hospital",
            UserRole::Clinic => "clinic",
            UserRole::BloodBank => "bloodbank",
        }
    }

    /// Roles a user may pick at self-registration. Institutional accounts
    /// are provisioned out of band.
    pub fn self_registrable(&self) -> bool {
        matches!(self, UserRole::Patient | UserRole::Donor)
    }

    // ======== INVENTORY PERMISSIONS ========
    pub fn can_add_inventory(&self) -> bool {
        matches!(self, UserRole::Hospital | UserRole::BloodBank)
    }

    pub fn can_delete_inventory(&self) -> bool {
        matches!(self, UserRole::BloodBank)
    }

    pub fn can_view_inventory(&self) -> bool {
        true // network view, all roles
    }

    // ======== REQUEST PERMISSIONS ========
    pub fn can_create_requests(&self) -> bool {
        matches!(self, UserRole::Patient | UserRole::Hospital | UserRole::Clinic)
    }

    pub fn can_view_all_requests(&self) -> bool {
        matches!(self, UserRole::Hospital | UserRole::BloodBank)
    }

    pub fn can_approve_requests(&self) -> bool {
        matches!(self, UserRole::BloodBank)
    }

    pub fn can_dispatch_requests(&self) -> bool {
        matches!(self, UserRole::BloodBank)
    }

    pub fn can_donate(&self) -> bool {
        matches!(self, UserRole::Donor)
    }

    pub fn all_role_strings() -> Vec<&'static str> {
        vec!["patient", "donor", "hospital", "clinic", "bloodbank"]
    }
}

impl std::fmt::Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ======== REQUEST/RESPONSE STRUCTS ========

#[derive(Debug, Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(length(min = 1, message = "Smart ID is required"))]
    pub smart_id: String,
    #[validate(length(min = 1, message = "Password is required"))]
    pub password: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RegisterRequest {
    #[validate(length(min = 3, max = 255, message = "Smart ID must be 3-255 characters"))]
    pub smart_id: String,
    #[validate(length(min = 1, max = 255, message = "Full name is required"))]
    pub full_name: String,
    #[validate(length(min = 8, message = "Password must be at least 8 characters"))]
    pub password: String,
    #[validate(length(min = 1, message = "Role is required"))]
    pub role: String,
    pub blood_group: Option<String>,
}

/// Login body the dashboards expect: token plus the role used for routing.
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: String,
    pub role: String,
}

#[derive(Debug, Serialize)]
pub struct UserInfo {
    pub smart_id: String,
    pub full_name: String,
    pub role: String,
    pub blood_group: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<User> for UserInfo {
    fn from(user: User) -> Self {
        Self {
            smart_id: user.smart_id,
            full_name: user.full_name,
            role: user.role,
            blood_group: user.blood_group,
            created_at: user.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user id
    pub smart_id: String,
    pub full_name: String,
    pub role: UserRole,
    pub exp: i64,
    pub iat: i64,
}

// ======== AUTH SERVICE ========

pub struct AuthService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    bcrypt_cost: u32,
    token_expiration: Duration,
}

impl AuthService {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(config.jwt_secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            bcrypt_cost: config.bcrypt_cost,
            token_expiration: Duration::hours(config.token_expiration_hours),
        }
    }

    pub fn hash_password(&self, password: &str) -> ApiResult<String> {
        hash(password, self.bcrypt_cost)
            .map_err(|_| ApiError::InternalServerError("Failed to hash password".to_string()))
    }

    pub fn verify_password(&self, password: &str, password_hash: &str) -> ApiResult<bool> {
        verify(password, password_hash)
            .map_err(|_| ApiError::InternalServerError("Password verification failed".to_string()))
    }

    pub fn generate_token(&self, user: &User) -> ApiResult<String> {
        let now = Utc::now();
        let exp = now + self.token_expiration;

        let claims = Claims {
            sub: user.id.clone(),
            smart_id: user.smart_id.clone(),
            full_name: user.full_name.clone(),
            role: UserRole::from_str(&user.role)
                .ok_or_else(|| ApiError::AuthError("Unknown user role".to_string()))?,
            exp: exp.timestamp(),
            iat: now.timestamp(),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|_| ApiError::AuthError("Failed to generate token".to_string()))
    }

    pub fn verify_token(&self, token: &str) -> ApiResult<Claims> {
        let validation = Validation::default();
        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|err| match err.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    ApiError::AuthError("Token expired".to_string())
                }
                jsonwebtoken::errors::ErrorKind::InvalidToken => {
                    ApiError::AuthError("Invalid token".to_string())
                }
                _ => ApiError::AuthError("Token verification failed".to_string()),
            })
    }
}

// ======== SMART ID VALIDATION ========

/// A Smart ID is either a 10-digit phone number or an email address.
pub fn validate_smart_id(smart_id: &str) -> ApiResult<()> {
    let is_phone = smart_id.len() == 10 && smart_id.chars().all(|c| c.is_ascii_digit());
    let is_email = smart_id.contains('@') && smart_id.contains('.') && smart_id.len() >= 5;

    if is_phone || is_email {
        Ok(())
    } else {
        Err(ApiError::ValidationError(
            "Smart ID must be a 10-digit phone number or an email address".to_string(),
        ))
    }
}

// ======== USER METHODS ========

impl User {
    pub async fn find_by_smart_id(pool: &SqlitePool, smart_id: &str) -> ApiResult<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE smart_id = ?")
            .bind(smart_id)
            .fetch_optional(pool)
            .await?;
        Ok(user)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> ApiResult<User> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_one(pool)
            .await
            .map_err(|_| ApiError::NotFound("User not found".to_string()))
    }

    pub async fn create(
        pool: &SqlitePool,
        request: RegisterRequest,
        role: UserRole,
        auth_service: &AuthService,
    ) -> ApiResult<User> {
        validate_smart_id(&request.smart_id)?;

        if let Some(ref group) = request.blood_group {
            if !BloodGroup::is_valid(group) {
                return Err(ApiError::invalid_blood_group(group));
            }
        }

        let password_hash = auth_service.hash_password(&request.password)?;

        let user = User {
            id: Uuid::new_v4().to_string(),
            smart_id: request.smart_id,
            full_name: request.full_name,
            password_hash,
            role: role.as_str().to_string(),
            blood_group: request.blood_group,
            created_at: Utc::now(),
        };

        sqlx::query(
            r#"INSERT INTO users (id, smart_id, full_name, password_hash, role, blood_group, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&user.id)
        .bind(&user.smart_id)
        .bind(&user.full_name)
        .bind(&user.password_hash)
        .bind(&user.role)
        .bind(&user.blood_group)
        .bind(&user.created_at)
        .execute(pool)
        .await?;

        Ok(user)
    }
}

// ======== HELPER FUNCTIONS ========

pub fn get_current_user(req: &HttpRequest) -> ApiResult<Claims> {
    req.extensions()
        .get::<Claims>()
        .cloned()
        .ok_or_else(|| ApiError::Unauthorized("No user information found".to_string()))
}

// ======== JWT MIDDLEWARE ========

pub async fn jwt_middleware(
    req: ServiceRequest,
    credentials: BearerAuth,
) -> Result<ServiceRequest, (actix_web::Error, ServiceRequest)> {
    let token = credentials.token();

    let auth_service = match req.app_data::<web::Data<std::sync::Arc<AuthService>>>() {
        Some(svc) => svc,
        None => {
            log::error!("AuthService not found in app data");
            return Err((
                ApiError::InternalServerError("Auth service not available".to_string()).into(),
                req,
            ));
        }
    };

    match auth_service.verify_token(token) {
        Ok(claims) => {
            req.extensions_mut().insert(claims);
            Ok(req)
        }
        Err(err) => {
            log::warn!("JWT verification failed: {}", err);
            Err((err.into(), req))
        }
    }
}

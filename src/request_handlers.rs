// src/request_handlers.rs - Blood request lifecycle endpoints
//
// Lifecycle: Pending -> Approved (fulfill, reserves units),
// Approved -> Dispatched (dispatch, ships reserved units),
// Pending -> Fulfilled (a donor volunteers for a broadcast).
use actix_web::{web, HttpRequest, HttpResponse};
use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::audit;
use crate::auth::get_current_user;
use crate::error::{ApiError, ApiResult};
use crate::models::{
    is_valid_urgency, BloodGroup, BloodRequest, BloodRequestWithBroadcasts, CreateRequestBody,
    RequestStatus,
};
use crate::AppState;

/// Name recorded on requests approved without human action.
const AUTO_ALLOCATION: &str = "LifeLink Auto-Allocation";
const NETWORK_ALLOCATION: &str = "LifeLink Network";

// ==================== RESERVATION ====================

/// Flip up to `count` Available units of `blood_group` to Reserved,
/// earliest expiry first (FEFO). Returns how many were reserved.
pub async fn reserve_available_units(
    conn: &mut SqliteConnection,
    blood_group: &str,
    count: i64,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"UPDATE inventory_units SET status = 'Reserved'
           WHERE id IN (
               SELECT id FROM inventory_units
               WHERE blood_group = ? AND status = 'Available'
               ORDER BY expiry_date ASC
               LIMIT ?
           )"#,
    )
    .bind(blood_group)
    .bind(count)
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}

async fn count_available(
    conn: &mut SqliteConnection,
    blood_group: &str,
) -> Result<i64, sqlx::Error> {
    let count: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM inventory_units WHERE blood_group = ? AND status = 'Available'",
    )
    .bind(blood_group)
    .fetch_one(conn)
    .await?;
    Ok(count.0)
}

/// Back-in-stock trigger: scan Pending requests for `blood_group` oldest
/// first and approve every one the current stock can fully cover.
pub async fn run_back_in_stock_approvals(
    pool: &SqlitePool,
    blood_group: &str,
) -> ApiResult<u32> {
    let pending: Vec<(String, i64)> = sqlx::query_as(
        "SELECT id, units_needed FROM blood_requests
         WHERE blood_group = ? AND status = 'Pending'
         ORDER BY created_at ASC",
    )
    .bind(blood_group)
    .fetch_all(pool)
    .await?;

    let mut approved = 0u32;

    for (request_id, units_needed) in pending {
        let mut tx = pool.begin().await?;

        if count_available(&mut tx, blood_group).await? < units_needed {
            tx.rollback().await?;
            continue;
        }

        reserve_available_units(&mut tx, blood_group, units_needed).await?;

        // Status predicate guards against a concurrent approval of the
        // same request
        let updated = sqlx::query(
            "UPDATE blood_requests SET status = 'Approved', fulfilled_by = ?
             WHERE id = ? AND status = 'Pending'",
        )
        .bind(AUTO_ALLOCATION)
        .bind(&request_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            continue;
        }

        tx.commit().await?;
        log::info!("Auto-approved request {} ({})", request_id, blood_group);
        approved += 1;
    }

    Ok(approved)
}

// ==================== CREATE REQUEST ====================

pub async fn create_request(
    app_state: web::Data<Arc<AppState>>,
    request: web::Json<CreateRequestBody>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    request.validate()?;

    let claims = get_current_user(&http_request)?;
    if !claims.role.can_create_requests() {
        return Err(ApiError::Forbidden(
            "Only patients, hospitals and clinics can request blood".to_string(),
        ));
    }

    let group = BloodGroup::from_str(&request.blood_group)
        .ok_or_else(|| ApiError::invalid_blood_group(&request.blood_group))?;
    if !is_valid_urgency(&request.urgency) {
        return Err(ApiError::ValidationError(format!(
            "Invalid urgency '{}'",
            request.urgency
        )));
    }

    let request_id = Uuid::new_v4().to_string();
    let now = Utc::now();

    let mut tx = app_state.db_pool.begin().await?;

    let available = count_available(&mut tx, group.as_str()).await?;

    let (status, fulfilled_by, broadcast_list) = if available >= request.units {
        // Auto-approve against current stock
        reserve_available_units(&mut tx, group.as_str(), request.units).await?;
        (
            RequestStatus::Approved,
            Some(NETWORK_ALLOCATION.to_string()),
            Vec::new(),
        )
    } else {
        // Not coverable: broadcast to compatible donors instead
        let mut donors: Vec<String> = Vec::new();
        for donor_group in group.compatible_donor_groups() {
            let mut found: Vec<(String,)> = sqlx::query_as(
                "SELECT smart_id FROM users WHERE role = 'donor' AND blood_group = ?",
            )
            .bind(donor_group)
            .fetch_all(&mut *tx)
            .await?;
            donors.extend(found.drain(..).map(|(s,)| s));
        }
        (RequestStatus::Pending, None, donors)
    };

    sqlx::query(
        r#"INSERT INTO blood_requests
           (id, requester_id, requester_name, blood_group, units_needed, urgency, hospital_name, status, fulfilled_by, created_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&request_id)
    .bind(&claims.sub)
    .bind(&claims.full_name)
    .bind(group.as_str())
    .bind(request.units)
    .bind(&request.urgency)
    .bind(&request.hospital)
    .bind(status.as_str())
    .bind(&fulfilled_by)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    for donor_smart_id in &broadcast_list {
        sqlx::query(
            "INSERT OR IGNORE INTO request_broadcasts (request_id, donor_smart_id, created_at)
             VALUES (?, ?, ?)",
        )
        .bind(&request_id)
        .bind(donor_smart_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    audit::audit(
        &app_state.db_pool,
        &claims.sub,
        "create",
        "blood_request",
        &request_id,
        &format!(
            "Requested {} unit(s) of {} ({}) -> {}",
            request.units,
            group,
            request.urgency,
            status.as_str()
        ),
        &http_request,
    )
    .await;

    Ok(HttpResponse::Created().json(serde_json::json!({
        "message": "Blood request processed",
        "status": status.as_str(),
        "request_id": request_id,
        "broadcast_count": broadcast_list.len(),
    })))
}

// ==================== LIST ENDPOINTS ====================

async fn attach_broadcasts(
    pool: &SqlitePool,
    requests: Vec<BloodRequest>,
) -> ApiResult<Vec<BloodRequestWithBroadcasts>> {
    let mut result = Vec::with_capacity(requests.len());
    for request in requests {
        let broadcasted_to: Vec<(String,)> = sqlx::query_as(
            "SELECT donor_smart_id FROM request_broadcasts WHERE request_id = ? ORDER BY donor_smart_id",
        )
        .bind(&request.id)
        .fetch_all(pool)
        .await?;

        result.push(BloodRequestWithBroadcasts {
            request,
            broadcasted_to: broadcasted_to.into_iter().map(|(s,)| s).collect(),
        });
    }
    Ok(result)
}

pub async fn get_all_requests(
    app_state: web::Data<Arc<AppState>>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    if !claims.role.can_view_all_requests() {
        return Err(ApiError::Forbidden(
            "Only hospitals and blood banks can view all requests".to_string(),
        ));
    }

    let requests: Vec<BloodRequest> =
        sqlx::query_as("SELECT * FROM blood_requests ORDER BY created_at DESC")
            .fetch_all(&app_state.db_pool)
            .await?;

    let response = attach_broadcasts(&app_state.db_pool, requests).await?;
    Ok(HttpResponse::Ok().json(response))
}

pub async fn get_my_requests(
    app_state: web::Data<Arc<AppState>>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;

    let requests: Vec<BloodRequest> = sqlx::query_as(
        "SELECT * FROM blood_requests WHERE requester_id = ? ORDER BY created_at DESC",
    )
    .bind(&claims.sub)
    .fetch_all(&app_state.db_pool)
    .await?;

    let response = attach_broadcasts(&app_state.db_pool, requests).await?;
    Ok(HttpResponse::Ok().json(response))
}

pub async fn get_broadcasts(
    app_state: web::Data<Arc<AppState>>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;

    // Still-open requests broadcast to THIS user
    let requests: Vec<BloodRequest> = sqlx::query_as(
        r#"SELECT r.* FROM blood_requests r
           JOIN request_broadcasts b ON b.request_id = r.id
           WHERE b.donor_smart_id = ? AND r.status = 'Pending'
           ORDER BY r.created_at DESC"#,
    )
    .bind(&claims.smart_id)
    .fetch_all(&app_state.db_pool)
    .await?;

    let response = attach_broadcasts(&app_state.db_pool, requests).await?;
    Ok(HttpResponse::Ok().json(response))
}

// ==================== LIFECYCLE ACTIONS ====================

async fn fetch_request(pool: &SqlitePool, id: &str) -> ApiResult<BloodRequest> {
    sqlx::query_as::<_, BloodRequest>("SELECT * FROM blood_requests WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ApiError::request_not_found(id))
}

fn request_status(request: &BloodRequest) -> ApiResult<RequestStatus> {
    RequestStatus::from_str(&request.status)
        .ok_or_else(|| ApiError::InternalServerError("Unknown request status".to_string()))
}

/// Manual approval by blood bank staff: reserves units for the request.
pub async fn fulfill_request(
    app_state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    if !claims.role.can_approve_requests() {
        return Err(ApiError::Forbidden(
            "Only blood banks can approve requests".to_string(),
        ));
    }

    let request_id = path.into_inner();
    let request = fetch_request(&app_state.db_pool, &request_id).await?;

    let status = request_status(&request)?;
    if !status.can_transition_to(RequestStatus::Approved) {
        return Err(ApiError::invalid_transition(&request.status, "approved"));
    }

    let mut tx = app_state.db_pool.begin().await?;

    let available = count_available(&mut tx, &request.blood_group).await?;
    if available < request.units_needed {
        tx.rollback().await?;
        return Err(ApiError::insufficient_stock(available, request.units_needed));
    }

    reserve_available_units(&mut tx, &request.blood_group, request.units_needed).await?;

    // The status read above can go stale under concurrent approvals; the
    // predicate makes exactly one of them win
    let updated = sqlx::query(
        "UPDATE blood_requests SET status = 'Approved', fulfilled_by = ?
         WHERE id = ? AND status = 'Pending'",
    )
    .bind(&claims.full_name)
    .bind(&request_id)
    .execute(&mut *tx)
    .await?;

    if updated.rows_affected() == 0 {
        tx.rollback().await?;
        let current = fetch_request(&app_state.db_pool, &request_id).await?;
        return Err(ApiError::invalid_transition(&current.status, "approved"));
    }

    tx.commit().await?;

    audit::audit(
        &app_state.db_pool,
        &claims.sub,
        "approve",
        "blood_request",
        &request_id,
        &format!(
            "Approved request for {} unit(s) of {}",
            request.units_needed, request.blood_group
        ),
        &http_request,
    )
    .await;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "message": "Request approved",
        "status": RequestStatus::Approved.as_str(),
    })))
}

/// Distribution step: ships the reserved units.
pub async fn dispatch_request(
    app_state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    if !claims.role.can_dispatch_requests() {
        return Err(ApiError::Forbidden(
            "Only blood banks can dispatch requests".to_string(),
        ));
    }

    let request_id = path.into_inner();
    let request = fetch_request(&app_state.db_pool, &request_id).await?;

    let status = request_status(&request)?;
    if !status.can_transition_to(RequestStatus::Dispatched) {
        return Err(ApiError::invalid_transition(&request.status, "dispatched"));
    }

    let mut tx = app_state.db_pool.begin().await?;

    // Ship the reserved units for this group, earliest expiry first
    sqlx::query(
        r#"UPDATE inventory_units SET status = 'Dispatched'
           WHERE id IN (
               SELECT id FROM inventory_units
               WHERE blood_group = ? AND status = 'Reserved'
               ORDER BY expiry_date ASC
               LIMIT ?
           )"#,
    )
    .bind(&request.blood_group)
    .bind(request.units_needed)
    .execute(&mut *tx)
    .await?;

    let updated = sqlx::query(
        "UPDATE blood_requests SET status = 'Dispatched' WHERE id = ? AND status = 'Approved'",
    )
    .bind(&request_id)
    .execute(&mut *tx)
    .await?;

    if updated.rows_affected() == 0 {
        tx.rollback().await?;
        let current = fetch_request(&app_state.db_pool, &request_id).await?;
        return Err(ApiError::invalid_transition(&current.status, "dispatched"));
    }

    tx.commit().await?;

    audit::audit(
        &app_state.db_pool,
        &claims.sub,
        "dispatch",
        "blood_request",
        &request_id,
        &format!(
            "Dispatched {} unit(s) of {}",
            request.units_needed, request.blood_group
        ),
        &http_request,
    )
    .await;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "message": "Blood units dispatched",
        "status": RequestStatus::Dispatched.as_str(),
    })))
}

/// A donor volunteers for a broadcast request.
pub async fn donate_request(
    app_state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    if !claims.role.can_donate() {
        return Err(ApiError::Forbidden(
            "Only donors can offer a donation".to_string(),
        ));
    }

    let request_id = path.into_inner();
    let request = fetch_request(&app_state.db_pool, &request_id).await?;

    let status = request_status(&request)?;
    if !status.can_transition_to(RequestStatus::Fulfilled) {
        return Err(ApiError::invalid_transition(&request.status, "fulfilled"));
    }

    let updated = sqlx::query(
        "UPDATE blood_requests SET status = 'Fulfilled', fulfilled_by = ?
         WHERE id = ? AND status = 'Pending'",
    )
    .bind(format!("Donor: {}", claims.full_name))
    .bind(&request_id)
    .execute(&app_state.db_pool)
    .await?;

    if updated.rows_affected() == 0 {
        let current = fetch_request(&app_state.db_pool, &request_id).await?;
        return Err(ApiError::invalid_transition(&current.status, "fulfilled"));
    }

    audit::audit(
        &app_state.db_pool,
        &claims.sub,
        "donate",
        "blood_request",
        &request_id,
        "Donor accepted broadcast request",
        &http_request,
    )
    .await;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "message": "Thank you for donating!",
        "status": RequestStatus::Fulfilled.as_str(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::HttpMessage;
    use chrono::Duration;

    use crate::auth::{Claims, UserRole};
    use crate::config::Config;

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

    async fn insert_account(pool: &SqlitePool, user_id: &str, smart_id: &str, role: &str) {
        sqlx::query(
            "INSERT OR IGNORE INTO users (id, smart_id, full_name, password_hash, role, created_at)
             VALUES (?, ?, 'Test Account', 'x', ?, ?)",
        )
        .bind(user_id)
        .bind(smart_id)
        .bind(role)
        .bind(Utc::now())
        .execute(pool)
        .await
        .unwrap();
    }

    fn claims_for(role: UserRole, smart_id: &str, full_name: &str) -> Claims {
        let now = Utc::now();
        Claims {
            sub: format!("id-{}", smart_id),
            smart_id: smart_id.to_string(),
            full_name: full_name.to_string(),
            role,
            exp: (now + Duration::hours(1)).timestamp(),
            iat: now.timestamp(),
        }
    }

    fn request_with(claims: Claims) -> HttpRequest {
        let req = actix_web::test::TestRequest::default().to_http_request();
        req.extensions_mut().insert(claims);
        req
    }

    async fn insert_unit(pool: &SqlitePool, id: &str, group: &str, status: &str, expiry_days: i64) {
        let now = Utc::now();
        sqlx::query(
            r#"INSERT INTO inventory_units
               (id, isbt_id, blood_group, component_type, collection_date, expiry_date, status, institution_id, created_at)
               VALUES (?, ?, ?, 'Whole Blood', ?, ?, ?, 'Central Blood Bank', ?)"#,
        )
        .bind(id)
        .bind(format!("W-TEST-{}", id))
        .bind(group)
        .bind(now)
        .bind(now + Duration::days(expiry_days))
        .bind(status)
        .bind(now)
        .execute(pool)
        .await
        .unwrap();
    }

    async fn insert_donor(pool: &SqlitePool, smart_id: &str, group: &str) {
        sqlx::query(
            "INSERT INTO users (id, smart_id, full_name, password_hash, role, blood_group, created_at)
             VALUES (?, ?, ?, 'x', 'donor', ?, ?)",
        )
        .bind(format!("id-{}", smart_id))
        .bind(smart_id)
        .bind(smart_id)
        .bind(group)
        .bind(Utc::now())
        .execute(pool)
        .await
        .unwrap();
    }

    async fn insert_request(
        pool: &SqlitePool,
        id: &str,
        group: &str,
        units: i64,
        status: &str,
        age_minutes: i64,
    ) {
        insert_account(pool, "id-req", "requester@x.com", "patient").await;
        sqlx::query(
            r#"INSERT INTO blood_requests
               (id, requester_id, requester_name, blood_group, units_needed, urgency, status, created_at)
               VALUES (?, 'id-req', 'John Doe', ?, ?, 'Standard', ?, ?)"#,
        )
        .bind(id)
        .bind(group)
        .bind(units)
        .bind(status)
        .bind(Utc::now() - Duration::minutes(age_minutes))
        .execute(pool)
        .await
        .unwrap();
    }

    async fn unit_status(pool: &SqlitePool, id: &str) -> String {
        let row: (String,) = sqlx::query_as("SELECT status FROM inventory_units WHERE id = ?")
            .bind(id)
            .fetch_one(pool)
            .await
            .unwrap();
        row.0
    }

    async fn request_row(pool: &SqlitePool, id: &str) -> (String, Option<String>) {
        sqlx::query_as("SELECT status, fulfilled_by FROM blood_requests WHERE id = ?")
            .bind(id)
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[actix_rt::test]
    async fn test_reservation_is_fefo() {
        let state = test_state().await;
        let pool = &state.db_pool;

        insert_unit(pool, "late", "A+", "Available", 40).await;
        insert_unit(pool, "soon", "A+", "Available", 5).await;
        insert_unit(pool, "mid", "A+", "Available", 20).await;

        let mut conn = pool.acquire().await.unwrap();
        let reserved = reserve_available_units(&mut conn, "A+", 2).await.unwrap();
        drop(conn);
        assert_eq!(reserved, 2);

        assert_eq!(unit_status(pool, "soon").await, "Reserved");
        assert_eq!(unit_status(pool, "mid").await, "Reserved");
        assert_eq!(unit_status(pool, "late").await, "Available");
    }

    #[actix_rt::test]
    async fn test_reservation_ignores_other_groups() {
        let state = test_state().await;
        let pool = &state.db_pool;

        insert_unit(pool, "a", "A+", "Available", 10).await;
        insert_unit(pool, "b", "B+", "Available", 10).await;

        let mut conn = pool.acquire().await.unwrap();
        let reserved = reserve_available_units(&mut conn, "A+", 5).await.unwrap();
        drop(conn);
        assert_eq!(reserved, 1);
        assert_eq!(unit_status(pool, "b").await, "Available");
    }

    #[actix_rt::test]
    async fn test_back_in_stock_approves_oldest_first() {
        let state = test_state().await;
        let pool = &state.db_pool;

        // Oldest needs 2, newer needs 2; only 3 units land in stock
        insert_request(pool, "old", "O+", 2, "Pending", 60).await;
        insert_request(pool, "new", "O+", 2, "Pending", 5).await;
        insert_unit(pool, "u1", "O+", "Available", 10).await;
        insert_unit(pool, "u2", "O+", "Available", 20).await;
        insert_unit(pool, "u3", "O+", "Available", 30).await;

        let approved = run_back_in_stock_approvals(pool, "O+").await.unwrap();
        assert_eq!(approved, 1);

        let (old_status, old_by) = request_row(pool, "old").await;
        assert_eq!(old_status, "Approved");
        assert_eq!(old_by.as_deref(), Some(AUTO_ALLOCATION));

        let (new_status, _) = request_row(pool, "new").await;
        assert_eq!(new_status, "Pending");

        let available: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM inventory_units WHERE status = 'Available'",
        )
        .fetch_one(pool)
        .await
        .unwrap();
        assert_eq!(available.0, 1);
    }

    #[actix_rt::test]
    async fn test_create_request_auto_approves_with_stock() {
        let state = test_state().await;
        let pool = &state.db_pool;

        insert_unit(pool, "u1", "A+", "Available", 10).await;
        insert_unit(pool, "u2", "A+", "Available", 20).await;
        insert_account(pool, "id-9876543210", "9876543210", "patient").await;

        let req = request_with(claims_for(UserRole::Patient, "9876543210", "John Doe"));
        let body = web::Json(CreateRequestBody {
            blood_group: "A+".to_string(),
            units: 2,
            hospital: Some("City General".to_string()),
            urgency: "Urgent".to_string(),
        });

        let response = create_request(state.clone(), body, req).await.unwrap();
        assert_eq!(response.status(), actix_web::http::StatusCode::CREATED);

        let (status, fulfilled_by): (String, Option<String>) =
            sqlx::query_as("SELECT status, fulfilled_by FROM blood_requests")
                .fetch_one(pool)
                .await
                .unwrap();
        assert_eq!(status, "Approved");
        assert_eq!(fulfilled_by.as_deref(), Some(NETWORK_ALLOCATION));

        assert_eq!(unit_status(pool, "u1").await, "Reserved");
        assert_eq!(unit_status(pool, "u2").await, "Reserved");
    }

    #[actix_rt::test]
    async fn test_create_request_broadcasts_without_stock() {
        let state = test_state().await;
        let pool = &state.db_pool;

        insert_donor(pool, "donor.a@x.com", "A+").await;
        insert_donor(pool, "donor.o@x.com", "O-").await;
        insert_donor(pool, "donor.b@x.com", "B+").await; // incompatible
        insert_account(pool, "id-clinic@x.com", "clinic@x.com", "clinic").await;

        let req = request_with(claims_for(UserRole::Clinic, "clinic@x.com", "City Care Clinic"));
        let body = web::Json(CreateRequestBody {
            blood_group: "A+".to_string(),
            units: 1,
            hospital: None,
            urgency: "Standard".to_string(),
        });

        create_request(state.clone(), body, req).await.unwrap();

        let (status, _) : (String, Option<String>) =
            sqlx::query_as("SELECT status, fulfilled_by FROM blood_requests")
                .fetch_one(pool)
                .await
                .unwrap();
        assert_eq!(status, "Pending");

        let broadcasts: Vec<(String,)> = sqlx::query_as(
            "SELECT donor_smart_id FROM request_broadcasts ORDER BY donor_smart_id",
        )
        .fetch_all(pool)
        .await
        .unwrap();
        let donors: Vec<&str> = broadcasts.iter().map(|(s,)| s.as_str()).collect();
        assert_eq!(donors, vec!["donor.a@x.com", "donor.o@x.com"]);
    }

    #[actix_rt::test]
    async fn test_fulfill_rejects_insufficient_stock() {
        let state = test_state().await;
        let pool = &state.db_pool;

        insert_request(pool, "r1", "AB-", 3, "Pending", 10).await;
        insert_unit(pool, "u1", "AB-", "Available", 10).await;

        let req = request_with(claims_for(UserRole::BloodBank, "bank@x.com", "Central Blood Bank"));
        let result =
            fulfill_request(state.clone(), web::Path::from("r1".to_string()), req).await;

        assert!(matches!(result, Err(ApiError::BadRequest(_))));
        // Nothing was reserved and the request stayed Pending
        assert_eq!(unit_status(pool, "u1").await, "Available");
        let (status, _) = request_row(pool, "r1").await;
        assert_eq!(status, "Pending");
    }

    #[actix_rt::test]
    async fn test_fulfill_reserves_and_records_approver() {
        let state = test_state().await;
        let pool = &state.db_pool;

        insert_request(pool, "r1", "O-", 2, "Pending", 10).await;
        insert_unit(pool, "u1", "O-", "Available", 5).await;
        insert_unit(pool, "u2", "O-", "Available", 15).await;
        insert_unit(pool, "u3", "O-", "Available", 25).await;

        let req = request_with(claims_for(UserRole::BloodBank, "bank@x.com", "Central Blood Bank"));
        fulfill_request(state.clone(), web::Path::from("r1".to_string()), req)
            .await
            .unwrap();

        let (status, fulfilled_by) = request_row(pool, "r1").await;
        assert_eq!(status, "Approved");
        assert_eq!(fulfilled_by.as_deref(), Some("Central Blood Bank"));

        assert_eq!(unit_status(pool, "u1").await, "Reserved");
        assert_eq!(unit_status(pool, "u2").await, "Reserved");
        assert_eq!(unit_status(pool, "u3").await, "Available");
    }

    #[actix_rt::test]
    async fn test_dispatch_requires_approved() {
        let state = test_state().await;
        let pool = &state.db_pool;

        insert_request(pool, "r1", "A+", 1, "Pending", 10).await;

        let req = request_with(claims_for(UserRole::BloodBank, "bank@x.com", "Central Blood Bank"));
        let result =
            dispatch_request(state.clone(), web::Path::from("r1".to_string()), req).await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));

        let (status, _) = request_row(pool, "r1").await;
        assert_eq!(status, "Pending");
    }

    #[actix_rt::test]
    async fn test_dispatch_ships_reserved_units() {
        let state = test_state().await;
        let pool = &state.db_pool;

        insert_request(pool, "r1", "B-", 2, "Approved", 10).await;
        insert_unit(pool, "u1", "B-", "Reserved", 5).await;
        insert_unit(pool, "u2", "B-", "Reserved", 15).await;
        insert_unit(pool, "u3", "B-", "Available", 25).await;

        let req = request_with(claims_for(UserRole::BloodBank, "bank@x.com", "Central Blood Bank"));
        dispatch_request(state.clone(), web::Path::from("r1".to_string()), req)
            .await
            .unwrap();

        let (status, _) = request_row(pool, "r1").await;
        assert_eq!(status, "Dispatched");
        assert_eq!(unit_status(pool, "u1").await, "Dispatched");
        assert_eq!(unit_status(pool, "u2").await, "Dispatched");
        assert_eq!(unit_status(pool, "u3").await, "Available");
    }

    #[actix_rt::test]
    async fn test_donate_fulfills_pending_request() {
        let state = test_state().await;
        let pool = &state.db_pool;

        insert_request(pool, "r1", "O+", 1, "Pending", 10).await;

        let req = request_with(claims_for(UserRole::Donor, "donor@x.com", "Jane Donor"));
        donate_request(state.clone(), web::Path::from("r1".to_string()), req)
            .await
            .unwrap();

        let (status, fulfilled_by) = request_row(pool, "r1").await;
        assert_eq!(status, "Fulfilled");
        assert_eq!(fulfilled_by.as_deref(), Some("Donor: Jane Donor"));
    }

    #[actix_rt::test]
    async fn test_donate_requires_donor_role() {
        let state = test_state().await;
        let pool = &state.db_pool;

        insert_request(pool, "r1", "O+", 1, "Pending", 10).await;

        let req = request_with(claims_for(UserRole::Patient, "p@x.com", "John Doe"));
        let result = donate_request(state.clone(), web::Path::from("r1".to_string()), req).await;
        assert!(matches!(result, Err(ApiError::Forbidden(_))));
    }

    #[actix_rt::test]
    async fn test_fulfill_twice_reserves_only_once() {
        let state = test_state().await;
        let pool = &state.db_pool;

        insert_request(pool, "r1", "A+", 1, "Pending", 10).await;
        insert_unit(pool, "u1", "A+", "Available", 5).await;
        insert_unit(pool, "u2", "A+", "Available", 15).await;

        let bank = || claims_for(UserRole::BloodBank, "bank@x.com", "Central Blood Bank");

        fulfill_request(state.clone(), web::Path::from("r1".to_string()), request_with(bank()))
            .await
            .unwrap();
        let result = fulfill_request(
            state.clone(),
            web::Path::from("r1".to_string()),
            request_with(bank()),
        )
        .await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));

        // Exactly one unit reserved, not two
        let reserved: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM inventory_units WHERE status = 'Reserved'",
        )
        .fetch_one(pool)
        .await
        .unwrap();
        assert_eq!(reserved.0, 1);
    }

    #[actix_rt::test]
    async fn test_fulfilled_by_survives_competing_actions() {
        let state = test_state().await;
        let pool = &state.db_pool;

        insert_request(pool, "r1", "O+", 1, "Pending", 10).await;
        insert_unit(pool, "u1", "O+", "Available", 5).await;

        let donor = request_with(claims_for(UserRole::Donor, "d@x.com", "Jane Donor"));
        donate_request(state.clone(), web::Path::from("r1".to_string()), donor)
            .await
            .unwrap();

        let bank = request_with(claims_for(UserRole::BloodBank, "bank@x.com", "Central Blood Bank"));
        let result = fulfill_request(state.clone(), web::Path::from("r1".to_string()), bank).await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));

        let (status, fulfilled_by) = request_row(pool, "r1").await;
        assert_eq!(status, "Fulfilled");
        assert_eq!(fulfilled_by.as_deref(), Some("Donor: Jane Donor"));
        assert_eq!(unit_status(pool, "u1").await, "Available");
    }

    #[actix_rt::test]
    async fn test_terminal_states_reject_everything() {
        let state = test_state().await;
        let pool = &state.db_pool;

        insert_request(pool, "done", "A+", 1, "Dispatched", 10).await;
        insert_request(pool, "given", "A+", 1, "Fulfilled", 10).await;

        let bank = || claims_for(UserRole::BloodBank, "bank@x.com", "Central Blood Bank");
        let donor = || claims_for(UserRole::Donor, "d@x.com", "Jane Donor");

        for id in ["done", "given"] {
            let result = fulfill_request(
                state.clone(),
                web::Path::from(id.to_string()),
                request_with(bank()),
            )
            .await;
            assert!(matches!(result, Err(ApiError::BadRequest(_))));

            let result = donate_request(
                state.clone(),
                web::Path::from(id.to_string()),
                request_with(donor()),
            )
            .await;
            assert!(matches!(result, Err(ApiError::BadRequest(_))));
        }
    }
}

// src/inventory_handlers.rs - Blood unit inventory endpoints
use actix_web::{web, HttpRequest, HttpResponse};
use chrono::{Duration, Utc};
use rand::Rng;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::audit;
use crate::auth::get_current_user;
use crate::error::{ApiError, ApiResult};
use crate::models::{
    is_valid_component_type, AddUnitsRequest, BloodGroup, GroupCount, InventoryStats,
    InventoryUnit, UnitStatus,
};
use crate::request_handlers::run_back_in_stock_approvals;
use crate::AppState;

/// Whole blood shelf life in days.
const SHELF_LIFE_DAYS: i64 = 42;

/// The dashboards' "Expiring Soon" window.
pub const EXPIRING_SOON_DAYS: i64 = 7;

// ==================== LIST INVENTORY ====================

pub async fn get_inventory(
    app_state: web::Data<Arc<AppState>>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    // Network view: every role sees all units
    let claims = get_current_user(&http_request)?;
    if !claims.role.can_view_inventory() {
        return Err(ApiError::Forbidden(
            "Not allowed to view the inventory".to_string(),
        ));
    }

    let units: Vec<InventoryUnit> =
        sqlx::query_as("SELECT * FROM inventory_units ORDER BY created_at DESC")
            .fetch_all(&app_state.db_pool)
            .await?;

    Ok(HttpResponse::Ok().json(units))
}

// ==================== ADD UNITS ====================

/// Mock ISBT-128 donation identifier, e.g. "W1234 56789 01".
fn generate_isbt_id() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "W{:04} {:05} {:02}",
        rng.gen_range(1000..10000),
        rng.gen_range(10000..100000),
        rng.gen_range(10..100)
    )
}

pub async fn add_units(
    app_state: web::Data<Arc<AppState>>,
    request: web::Json<AddUnitsRequest>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    request.validate()?;

    let claims = get_current_user(&http_request)?;
    if !claims.role.can_add_inventory() {
        return Err(ApiError::Forbidden(
            "Only hospitals and blood banks can add inventory".to_string(),
        ));
    }

    if !BloodGroup::is_valid(&request.blood_group) {
        return Err(ApiError::invalid_blood_group(&request.blood_group));
    }
    if !is_valid_component_type(&request.component_type) {
        return Err(ApiError::ValidationError(format!(
            "Invalid component type '{}'",
            request.component_type
        )));
    }

    let now = Utc::now();
    let collection_date = request.collection_date.unwrap_or(now);
    let expiry_date = collection_date + Duration::days(SHELF_LIFE_DAYS);
    // The institution holding the units is the authenticated account
    let institution = claims.full_name.clone();

    let mut units = Vec::with_capacity(request.quantity as usize);
    let mut tx = app_state.db_pool.begin().await?;

    for _ in 0..request.quantity {
        let unit = InventoryUnit {
            id: Uuid::new_v4().to_string(),
            isbt_id: generate_isbt_id(),
            blood_group: request.blood_group.clone(),
            component_type: request.component_type.clone(),
            collection_date,
            expiry_date,
            status: UnitStatus::Available.as_str().to_string(),
            institution_id: institution.clone(),
            created_at: now,
        };

        sqlx::query(
            r#"INSERT INTO inventory_units
               (id, isbt_id, blood_group, component_type, collection_date, expiry_date, status, institution_id, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&unit.id)
        .bind(&unit.isbt_id)
        .bind(&unit.blood_group)
        .bind(&unit.component_type)
        .bind(&unit.collection_date)
        .bind(&unit.expiry_date)
        .bind(&unit.status)
        .bind(&unit.institution_id)
        .bind(&unit.created_at)
        .execute(&mut *tx)
        .await?;

        units.push(unit);
    }

    tx.commit().await?;

    // Back-in-stock trigger: pending requests for this group may now be coverable
    let approved = run_back_in_stock_approvals(&app_state.db_pool, &request.blood_group).await?;
    if approved > 0 {
        log::info!(
            "Auto-approved {} pending request(s) for {} after restock",
            approved,
            request.blood_group
        );
    }

    audit::audit(
        &app_state.db_pool,
        &claims.sub,
        "create",
        "inventory_unit",
        "",
        &format!(
            "Added {} {} unit(s) of {}",
            request.quantity, request.component_type, request.blood_group
        ),
        &http_request,
    )
    .await;

    Ok(HttpResponse::Created().json(serde_json::json!({
        "message": format!("Successfully added {} units", request.quantity),
        "units": units,
    })))
}

// ==================== DELETE UNIT ====================

pub async fn delete_unit(
    app_state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    if !claims.role.can_delete_inventory() {
        return Err(ApiError::Forbidden(
            "Only blood banks can remove inventory units".to_string(),
        ));
    }

    let unit_id = path.into_inner();

    let result = sqlx::query("DELETE FROM inventory_units WHERE id = ?")
        .bind(&unit_id)
        .execute(&app_state.db_pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(ApiError::unit_not_found(&unit_id));
    }

    audit::audit(
        &app_state.db_pool,
        &claims.sub,
        "delete",
        "inventory_unit",
        &unit_id,
        "Removed inventory unit",
        &http_request,
    )
    .await;

    Ok(HttpResponse::NoContent().finish())
}

// ==================== INVENTORY STATS ====================

pub async fn get_inventory_stats(
    app_state: web::Data<Arc<AppState>>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    if !claims.role.can_view_inventory() {
        return Err(ApiError::Forbidden(
            "Not allowed to view the inventory".to_string(),
        ));
    }

    let now = Utc::now();
    let soon = now + Duration::days(EXPIRING_SOON_DAYS);

    let total_available: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM inventory_units WHERE status = 'Available'")
            .fetch_one(&app_state.db_pool)
            .await?;

    let reserved: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM inventory_units WHERE status = 'Reserved'")
            .fetch_one(&app_state.db_pool)
            .await?;

    let expiring_soon: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM inventory_units
         WHERE status = 'Available' AND expiry_date >= ? AND expiry_date <= ?",
    )
    .bind(now)
    .bind(soon)
    .fetch_one(&app_state.db_pool)
    .await?;

    let available_by_group: Vec<GroupCount> = sqlx::query_as(
        "SELECT blood_group, COUNT(*) as count FROM inventory_units
         WHERE status = 'Available' GROUP BY blood_group ORDER BY blood_group",
    )
    .fetch_all(&app_state.db_pool)
    .await?;

    let stats = InventoryStats {
        total_available: total_available.0,
        reserved: reserved.0,
        expiring_soon: expiring_soon.0,
        available_by_group,
    };

    Ok(HttpResponse::Ok().json(stats))
}

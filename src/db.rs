// src/db.rs - Database migrations and setup

use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Enable foreign keys and WAL mode
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(pool)
        .await?;

    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            smart_id TEXT NOT NULL UNIQUE CHECK(length(smart_id) >= 3 AND length(smart_id) <= 255),
            full_name TEXT NOT NULL CHECK(length(full_name) > 0 AND length(full_name) <= 255),
            password_hash TEXT NOT NULL,
            role TEXT NOT NULL CHECK(
                role IN ('patient', 'donor', 'hospital', 'clinic', 'bloodbank')
            ),
            blood_group TEXT CHECK(
                blood_group IS NULL OR
                blood_group IN ('A+', 'A-', 'B+', 'B-', 'AB+', 'AB-', 'O+', 'O-')
            ),
            created_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS inventory_units (
            id TEXT PRIMARY KEY,
            isbt_id TEXT NOT NULL UNIQUE,
            blood_group TEXT NOT NULL CHECK(
                blood_group IN ('A+', 'A-', 'B+', 'B-', 'AB+', 'AB-', 'O+', 'O-')
            ),
            component_type TEXT NOT NULL CHECK(
                component_type IN ('Whole Blood', 'Packed Red Cells', 'Platelets', 'Plasma')
            ),
            collection_date DATETIME NOT NULL,
            expiry_date DATETIME NOT NULL,
            status TEXT NOT NULL DEFAULT 'Available' CHECK(
                status IN ('Available', 'Reserved', 'Dispatched')
            ),
            institution_id TEXT NOT NULL,
            created_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS blood_requests (
            id TEXT PRIMARY KEY,
            requester_id TEXT NOT NULL,
            requester_name TEXT NOT NULL,
            blood_group TEXT NOT NULL CHECK(
                blood_group IN ('A+', 'A-', 'B+', 'B-', 'AB+', 'AB-', 'O+', 'O-')
            ),
            units_needed INTEGER NOT NULL CHECK(units_needed >= 1),
            urgency TEXT NOT NULL DEFAULT 'Standard' CHECK(
                urgency IN ('Standard', 'Urgent', 'Critical')
            ),
            hospital_name TEXT CHECK(hospital_name IS NULL OR length(hospital_name) <= 255),
            status TEXT NOT NULL DEFAULT 'Pending' CHECK(
                status IN ('Pending', 'Approved', 'Dispatched', 'Fulfilled')
            ),
            fulfilled_by TEXT,
            created_at DATETIME NOT NULL,
            FOREIGN KEY (requester_id) REFERENCES users (id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Normalized form of the request's broadcasted_to donor list
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS request_broadcasts (
            request_id TEXT NOT NULL,
            donor_smart_id TEXT NOT NULL,
            created_at DATETIME NOT NULL,
            PRIMARY KEY (request_id, donor_smart_id),
            FOREIGN KEY (request_id) REFERENCES blood_requests (id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_logs (
            id TEXT PRIMARY KEY,
            user_id TEXT,
            action TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT,
            description TEXT,
            ip_address TEXT,
            user_agent TEXT,
            created_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Reservation and listing paths filter on these constantly
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_inventory_group_status
         ON inventory_units (blood_group, status, expiry_date)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_requests_group_status
         ON blood_requests (blood_group, status, created_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_requests_requester
         ON blood_requests (requester_id, created_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_broadcasts_donor
         ON request_broadcasts (donor_smart_id)",
    )
    .execute(pool)
    .await?;

    log::info!("Database migrations completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // In-memory SQLite gives every pooled connection its own database,
    // so tests pin the pool to a single connection.
    async fn memory_pool() -> SqlitePool {
        sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[actix_rt::test]
    async fn test_migrations_are_idempotent() {
        let pool = memory_pool().await;
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM inventory_units")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count.0, 0);
    }

    #[actix_rt::test]
    async fn test_schema_rejects_unknown_status() {
        let pool = memory_pool().await;
        run_migrations(&pool).await.unwrap();

        let result = sqlx::query(
            "INSERT INTO inventory_units
             (id, isbt_id, blood_group, component_type, collection_date, expiry_date, status, institution_id, created_at)
             VALUES ('u1', 'W0000 00000 00', 'A+', 'Whole Blood', datetime('now'), datetime('now'), 'Quarantined', 'x', datetime('now'))",
        )
        .execute(&pool)
        .await;

        assert!(result.is_err());
    }
}

//! Versioned schema for the execution ledger, lock audit and context items
//!
//! Each step runs in its own transaction together with its `_migrations` row,
//! so an interrupted upgrade resumes from the last completed version.

use sqlx::SqlitePool;

/// Latest schema version
pub const CURRENT_VERSION: i32 = 2;

struct Migration {
    version: i32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "execution ledger and lock audit",
        sql: r#"
            CREATE TABLE IF NOT EXISTS agent_executions (
                id TEXT PRIMARY KEY NOT NULL,
                parent_id TEXT REFERENCES agent_executions(id) ON DELETE CASCADE,
                role TEXT NOT NULL CHECK (role IN ('orchestrator', 'planner', 'coder', 'reviewer', 'tester')),
                status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN ('pending', 'running', 'succeeded', 'failed')),
                phase TEXT NOT NULL DEFAULT 'working' CHECK (phase IN ('working', 'awaiting_children')),
                child_index INTEGER,
                input_json TEXT NOT NULL,
                output_json TEXT,
                error_kind TEXT,
                error_message TEXT,
                failed_execution_id TEXT,
                failed_role TEXT,
                prompt_tokens INTEGER NOT NULL DEFAULT 0,
                completion_tokens INTEGER NOT NULL DEFAULT 0,
                context_tokens INTEGER NOT NULL DEFAULT 0,
                latency_ms INTEGER NOT NULL DEFAULT 0,
                cost_usd REAL,
                model_used TEXT,
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                started_at TIMESTAMP,
                completed_at TIMESTAMP
            );
            CREATE INDEX IF NOT EXISTS idx_agent_executions_parent ON agent_executions(parent_id, child_index);
            CREATE INDEX IF NOT EXISTS idx_agent_executions_status ON agent_executions(status);
            CREATE INDEX IF NOT EXISTS idx_agent_executions_created_at ON agent_executions(created_at);

            -- One row per lock request, rewritten as its state changes
            CREATE TABLE IF NOT EXISTS resource_locks (
                id TEXT PRIMARY KEY NOT NULL,
                project_id TEXT NOT NULL,
                resource_kind TEXT NOT NULL,
                resource_name TEXT NOT NULL,
                mode TEXT NOT NULL CHECK (mode IN ('exclusive', 'shared')),
                holder_id TEXT NOT NULL,
                holder_host TEXT NOT NULL,
                state TEXT NOT NULL CHECK (state IN ('waiting', 'held', 'released', 'reclaimed', 'timed_out')),
                requested_at TIMESTAMP NOT NULL,
                acquired_at TIMESTAMP,
                deadline TIMESTAMP,
                released_at TIMESTAMP,
                release_reason TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_resource_locks_key ON resource_locks(project_id, resource_kind, resource_name);
            CREATE INDEX IF NOT EXISTS idx_resource_locks_holder ON resource_locks(holder_id);
            CREATE INDEX IF NOT EXISTS idx_resource_locks_state ON resource_locks(state);
        "#,
    },
    Migration {
        version: 2,
        name: "context items",
        sql: r#"
            CREATE TABLE IF NOT EXISTS context_items (
                id TEXT PRIMARY KEY NOT NULL,
                seq INTEGER NOT NULL UNIQUE,
                project_id TEXT NOT NULL,
                source_type TEXT NOT NULL,
                source_id TEXT NOT NULL,
                raw_content TEXT NOT NULL,
                layers_json TEXT NOT NULL,
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            );
            CREATE INDEX IF NOT EXISTS idx_context_items_project ON context_items(project_id);
        "#,
    },
];

/// Schema version recorded in the database, 0 for a fresh one
async fn applied_version(pool: &SqlitePool) -> anyhow::Result<i32> {
    sqlx::raw_sql(
        r#"
        CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY NOT NULL,
            name TEXT NOT NULL DEFAULT '',
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        );
        "#,
    )
    .execute(pool)
    .await?;

    let (version,): (Option<i32>,) = sqlx::query_as("SELECT MAX(version) FROM _migrations")
        .fetch_one(pool)
        .await?;
    Ok(version.unwrap_or(0))
}

/// Apply every migration newer than the recorded version
pub async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    let from = applied_version(pool).await?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > from).collect();
    if pending.is_empty() {
        return Ok(());
    }

    for migration in pending {
        tracing::info!(version = migration.version, name = migration.name, "Applying migration");
        let mut tx = pool.begin().await?;
        sqlx::raw_sql(migration.sql).execute(&mut *tx).await?;
        sqlx::query("INSERT INTO _migrations (version, name) VALUES (?, ?)")
            .bind(migration.version)
            .bind(migration.name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
    }

    tracing::info!(from, to = CURRENT_VERSION, "Database schema upgraded");
    Ok(())
}

pub async fn migration_status(pool: &SqlitePool) -> anyhow::Result<MigrationStatus> {
    let current_version = applied_version(pool).await?;
    Ok(MigrationStatus {
        current_version,
        target_version: CURRENT_VERSION,
        needs_migration: current_version < CURRENT_VERSION,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationStatus {
    pub current_version: i32,
    pub target_version: i32,
    pub needs_migration: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn fresh_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[test]
    fn test_migration_list_ends_at_current_version() {
        let versions: Vec<i32> = MIGRATIONS.iter().map(|m| m.version).collect();
        assert_eq!(versions, (1..=CURRENT_VERSION).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_fresh_database_upgrades_to_current() {
        let pool = fresh_pool().await;
        assert_eq!(
            migration_status(&pool).await.unwrap(),
            MigrationStatus {
                current_version: 0,
                target_version: CURRENT_VERSION,
                needs_migration: true,
            }
        );

        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let status = migration_status(&pool).await.unwrap();
        assert_eq!(status.current_version, CURRENT_VERSION);
        assert!(!status.needs_migration);

        let (rows,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM _migrations")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(rows, i64::from(CURRENT_VERSION));
    }

    #[tokio::test]
    async fn test_resumes_after_partial_upgrade() {
        let pool = fresh_pool().await;
        applied_version(&pool).await.unwrap();
        sqlx::raw_sql(MIGRATIONS[0].sql).execute(&pool).await.unwrap();
        sqlx::query("INSERT INTO _migrations (version, name) VALUES (1, 'execution ledger and lock audit')")
            .execute(&pool)
            .await
            .unwrap();

        run_migrations(&pool).await.unwrap();

        for table in ["agent_executions", "resource_locks", "context_items"] {
            let (n,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", table))
                .fetch_one(&pool)
                .await
                .unwrap();
            assert_eq!(n, 0, "{} should exist and be empty", table);
        }
    }

    #[tokio::test]
    async fn test_role_check_constraint() {
        let pool = fresh_pool().await;
        run_migrations(&pool).await.unwrap();

        let bad = sqlx::query("INSERT INTO agent_executions (id, role, input_json) VALUES ('x', 'janitor', '{}')")
            .execute(&pool)
            .await;
        assert!(bad.is_err());
    }
}

//! Database migrations

use sqlx::{Row, SqlitePool};

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            executed_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )",
    )
    .execute(pool)
    .await?;

    run_migration(pool, "001_create_clusters_table", MIGRATION_001_CREATE_CLUSTERS).await?;
    run_migration(pool, "002_create_nodes_table", MIGRATION_002_CREATE_NODES).await?;
    run_migration(pool, "003_create_events_table", MIGRATION_003_CREATE_EVENTS).await?;
    run_migration(pool, "004_create_events_index", MIGRATION_004_CREATE_EVENTS_INDEX).await?;
    run_migration(pool, "005_create_jobs_table", MIGRATION_005_CREATE_JOBS).await?;

    Ok(())
}

async fn run_migration(pool: &SqlitePool, name: &str, sql: &str) -> Result<(), sqlx::Error> {
    let row = sqlx::query("SELECT COUNT(*) as count FROM migrations WHERE name = ?")
        .bind(name)
        .fetch_one(pool)
        .await?;

    let count: i64 = row.get("count");
    if count > 0 {
        tracing::debug!("migration {} already applied", name);
        return Ok(());
    }

    tracing::info!("running migration: {}", name);

    sqlx::query(sql).execute(pool).await?;

    sqlx::query("INSERT INTO migrations (name) VALUES (?)")
        .bind(name)
        .execute(pool)
        .await?;

    Ok(())
}

const MIGRATION_001_CREATE_CLUSTERS: &str = "
CREATE TABLE clusters (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    k8s_version TEXT NOT NULL,
    pod_network_cidr TEXT NOT NULL,
    service_cidr TEXT NOT NULL,
    cni TEXT NOT NULL,
    container_runtime TEXT NOT NULL,
    api_server_endpoint TEXT,
    provider TEXT NOT NULL,
    status TEXT NOT NULL,
    kubeconfig BLOB NOT NULL,
    join_command TEXT NOT NULL,
    certificate_key TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
";

const MIGRATION_002_CREATE_NODES: &str = "
CREATE TABLE nodes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cluster_id INTEGER NOT NULL,
    hostname TEXT NOT NULL,
    address TEXT NOT NULL,
    ssh_user TEXT NOT NULL,
    ssh_key_path TEXT,
    ssh_port INTEGER NOT NULL,
    role TEXT NOT NULL,
    status TEXT NOT NULL,
    k8s_version TEXT
);
";

const MIGRATION_003_CREATE_EVENTS: &str = "
CREATE TABLE events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cluster_id INTEGER NOT NULL,
    timestamp INTEGER NOT NULL,
    level TEXT NOT NULL,
    host TEXT NOT NULL,
    step TEXT NOT NULL,
    message TEXT NOT NULL,
    output TEXT
);
";

const MIGRATION_004_CREATE_EVENTS_INDEX: &str = "
CREATE INDEX idx_events_cluster_timestamp ON events (cluster_id, timestamp, id);
";

const MIGRATION_005_CREATE_JOBS: &str = "
CREATE TABLE jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cluster_id INTEGER NOT NULL,
    job_type TEXT NOT NULL,
    status TEXT NOT NULL,
    progress INTEGER NOT NULL DEFAULT 0,
    error TEXT,
    started_at INTEGER,
    finished_at INTEGER,
    created_at INTEGER NOT NULL
);
";

//! Database layer using SQLite
//!
//! Persistent storage for clusters, nodes, events and jobs. Writers
//! (orchestrator tasks) and readers (request handlers, history replay)
//! share the same pool.

pub mod migrations;

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

/// Database connection pool
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (and create if missing) the database behind `dsn`.
    pub async fn new(dsn: &str) -> Result<Self, sqlx::Error> {
        if let Some(path) = dsn.strip_prefix("sqlite://") {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(sqlx::Error::Io)?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(dsn)?.create_if_missing(true);

        // A pool of in-memory connections would open one database per
        // connection; keep a single connection in that case.
        let max_connections = if dsn.contains(":memory:") { 1 } else { 16 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        tracing::info!("database connection established");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        migrations::run_migrations(&self.pool).await?;
        tracing::info!("database migrations completed");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the database connection
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("database connection closed");
    }

    /// Health check - verify database connectivity
    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }
}

fn millis_to_datetime(millis: i64) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_timestamp_millis(millis).unwrap_or(chrono::DateTime::UNIX_EPOCH)
}

/// Cluster persistence
pub mod clusters {
    use super::*;
    use crate::types::{Cluster, ClusterStatus, CniPlugin, ContainerRuntime};
    use sqlx::Row;

    pub async fn create(pool: &SqlitePool, cluster: &Cluster) -> Result<i64, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO clusters (name, k8s_version, pod_network_cidr, service_cidr, cni,
             container_runtime, api_server_endpoint, provider, status, kubeconfig,
             join_command, certificate_key, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&cluster.name)
        .bind(&cluster.k8s_version)
        .bind(&cluster.pod_network_cidr)
        .bind(&cluster.service_cidr)
        .bind(cluster.cni.as_str())
        .bind(cluster.container_runtime.as_str())
        .bind(&cluster.api_server_endpoint)
        .bind(&cluster.provider)
        .bind(cluster.status.as_str())
        .bind(&cluster.kubeconfig)
        .bind(&cluster.join_command)
        .bind(&cluster.certificate_key)
        .bind(cluster.created_at.timestamp_millis())
        .bind(cluster.updated_at.timestamp_millis())
        .execute(pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get(pool: &SqlitePool, id: i64) -> Result<Cluster, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM clusters WHERE id = ?")
            .bind(id)
            .fetch_one(pool)
            .await?;

        Ok(row_to_cluster(&row))
    }

    pub async fn list(pool: &SqlitePool) -> Result<Vec<Cluster>, sqlx::Error> {
        let rows = sqlx::query("SELECT * FROM clusters ORDER BY name")
            .fetch_all(pool)
            .await?;

        Ok(rows.iter().map(row_to_cluster).collect())
    }

    pub async fn name_exists(pool: &SqlitePool, name: &str) -> Result<bool, sqlx::Error> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM clusters WHERE name = ?")
            .bind(name)
            .fetch_one(pool)
            .await?;

        let count: i64 = row.get("count");
        Ok(count > 0)
    }

    pub async fn update_status(
        pool: &SqlitePool,
        id: i64,
        status: ClusterStatus,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE clusters SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(chrono::Utc::now().timestamp_millis())
            .bind(id)
            .execute(pool)
            .await?;

        Ok(())
    }

    pub async fn update_secrets(
        pool: &SqlitePool,
        id: i64,
        kubeconfig: &[u8],
        join_command: &str,
        certificate_key: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE clusters SET kubeconfig = ?, join_command = ?, certificate_key = ?,
             updated_at = ? WHERE id = ?",
        )
        .bind(kubeconfig)
        .bind(join_command)
        .bind(certificate_key)
        .bind(chrono::Utc::now().timestamp_millis())
        .bind(id)
        .execute(pool)
        .await?;

        Ok(())
    }

    pub async fn delete(pool: &SqlitePool, id: i64) -> Result<(), sqlx::Error> {
        let result = sqlx::query("DELETE FROM clusters WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(sqlx::Error::RowNotFound);
        }

        Ok(())
    }

    fn row_to_cluster(row: &sqlx::sqlite::SqliteRow) -> Cluster {
        let cni: String = row.get("cni");
        let runtime: String = row.get("container_runtime");
        let status: String = row.get("status");

        Cluster {
            id: row.get("id"),
            name: row.get("name"),
            k8s_version: row.get("k8s_version"),
            pod_network_cidr: row.get("pod_network_cidr"),
            service_cidr: row.get("service_cidr"),
            cni: CniPlugin::parse(&cni),
            container_runtime: ContainerRuntime::parse(&runtime),
            api_server_endpoint: row.get("api_server_endpoint"),
            provider: row.get("provider"),
            status: ClusterStatus::parse(&status),
            kubeconfig: row.get("kubeconfig"),
            join_command: row.get("join_command"),
            certificate_key: row.get("certificate_key"),
            created_at: millis_to_datetime(row.get("created_at")),
            updated_at: millis_to_datetime(row.get("updated_at")),
        }
    }
}

/// Node persistence
pub mod nodes {
    use super::*;
    use crate::types::{Node, NodeRole, NodeStatus};
    use sqlx::Row;

    pub async fn create(pool: &SqlitePool, node: &Node) -> Result<i64, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO nodes (cluster_id, hostname, address, ssh_user, ssh_key_path,
             ssh_port, role, status, k8s_version)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(node.cluster_id)
        .bind(&node.hostname)
        .bind(&node.address)
        .bind(&node.ssh_user)
        .bind(&node.ssh_key_path)
        .bind(node.ssh_port as i64)
        .bind(node.role.as_str())
        .bind(node.status.as_str())
        .bind(&node.k8s_version)
        .execute(pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn list_by_cluster(
        pool: &SqlitePool,
        cluster_id: i64,
    ) -> Result<Vec<Node>, sqlx::Error> {
        let rows = sqlx::query("SELECT * FROM nodes WHERE cluster_id = ? ORDER BY id")
            .bind(cluster_id)
            .fetch_all(pool)
            .await?;

        Ok(rows.iter().map(row_to_node).collect())
    }

    /// Update the status of the node identified by its address within a cluster
    pub async fn update_status(
        pool: &SqlitePool,
        cluster_id: i64,
        address: &str,
        status: NodeStatus,
        k8s_version: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE nodes SET status = ?, k8s_version = COALESCE(?, k8s_version)
             WHERE cluster_id = ? AND address = ?",
        )
        .bind(status.as_str())
        .bind(k8s_version)
        .bind(cluster_id)
        .bind(address)
        .execute(pool)
        .await?;

        Ok(())
    }

    pub async fn delete_by_cluster(pool: &SqlitePool, cluster_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM nodes WHERE cluster_id = ?")
            .bind(cluster_id)
            .execute(pool)
            .await?;

        Ok(())
    }

    fn row_to_node(row: &sqlx::sqlite::SqliteRow) -> Node {
        let role: String = row.get("role");
        let status: String = row.get("status");

        Node {
            id: row.get("id"),
            cluster_id: row.get("cluster_id"),
            hostname: row.get("hostname"),
            address: row.get("address"),
            ssh_user: row.get("ssh_user"),
            ssh_key_path: row.get("ssh_key_path"),
            ssh_port: row.get::<i64, _>("ssh_port") as u16,
            role: NodeRole::parse(&role),
            status: NodeStatus::parse(&status),
            k8s_version: row.get("k8s_version"),
        }
    }
}

/// Event persistence; insert-only
pub mod events {
    use super::*;
    use crate::types::{Event, EventLevel};
    use sqlx::Row;

    /// Append a new event stamped with the current time.
    pub async fn append(
        pool: &SqlitePool,
        cluster_id: i64,
        level: EventLevel,
        host: &str,
        step: &str,
        message: &str,
        output: Option<String>,
    ) -> Result<Event, sqlx::Error> {
        let timestamp = chrono::Utc::now().timestamp_millis();

        let result = sqlx::query(
            "INSERT INTO events (cluster_id, timestamp, level, host, step, message, output)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(cluster_id)
        .bind(timestamp)
        .bind(level.as_str())
        .bind(host)
        .bind(step)
        .bind(message)
        .bind(&output)
        .execute(pool)
        .await?;

        Ok(Event {
            id: result.last_insert_rowid(),
            cluster_id,
            timestamp,
            level,
            host: host.to_string(),
            step: step.to_string(),
            message: message.to_string(),
            output,
        })
    }

    /// Most recent `limit` events in chronological order
    pub async fn recent(
        pool: &SqlitePool,
        cluster_id: i64,
        limit: i64,
    ) -> Result<Vec<Event>, sqlx::Error> {
        let mut events = recent_desc(pool, cluster_id, limit).await?;
        events.reverse();
        Ok(events)
    }

    /// Most recent `limit` events, newest first
    pub async fn recent_desc(
        pool: &SqlitePool,
        cluster_id: i64,
        limit: i64,
    ) -> Result<Vec<Event>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT * FROM events WHERE cluster_id = ?
             ORDER BY timestamp DESC, id DESC LIMIT ?",
        )
        .bind(cluster_id)
        .bind(limit)
        .fetch_all(pool)
        .await?;

        Ok(rows.iter().map(row_to_event).collect())
    }

    pub async fn delete_by_cluster(pool: &SqlitePool, cluster_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM events WHERE cluster_id = ?")
            .bind(cluster_id)
            .execute(pool)
            .await?;

        Ok(())
    }

    fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> Event {
        let level: String = row.get("level");

        Event {
            id: row.get("id"),
            cluster_id: row.get("cluster_id"),
            timestamp: row.get("timestamp"),
            level: EventLevel::parse(&level),
            host: row.get("host"),
            step: row.get("step"),
            message: row.get("message"),
            output: row.get("output"),
        }
    }
}

/// Job persistence
pub mod jobs {
    use super::*;
    use crate::types::{Job, JobStatus, JobType};
    use sqlx::Row;

    /// Create a new job unless the cluster already drives a non-terminal one.
    ///
    /// Returns `None` when another job is still pending or running.
    pub async fn create(
        pool: &SqlitePool,
        cluster_id: i64,
        job_type: JobType,
    ) -> Result<Option<Job>, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let row = sqlx::query(
            "SELECT COUNT(*) as count FROM jobs
             WHERE cluster_id = ? AND status IN ('pending', 'running')",
        )
        .bind(cluster_id)
        .fetch_one(&mut *tx)
        .await?;

        let count: i64 = row.get("count");
        if count > 0 {
            return Ok(None);
        }

        let result = sqlx::query(
            "INSERT INTO jobs (cluster_id, job_type, status, progress, created_at)
             VALUES (?, ?, 'pending', 0, ?)",
        )
        .bind(cluster_id)
        .bind(job_type.as_str())
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&mut *tx)
        .await?;

        let id = result.last_insert_rowid();
        tx.commit().await?;

        Ok(Some(Job {
            id,
            cluster_id,
            job_type,
            status: JobStatus::Pending,
            progress: 0,
            error: None,
            started_at: None,
            finished_at: None,
        }))
    }

    pub async fn get(pool: &SqlitePool, id: i64) -> Result<Job, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_one(pool)
            .await?;

        Ok(row_to_job(&row))
    }

    pub async fn list_by_cluster(
        pool: &SqlitePool,
        cluster_id: i64,
    ) -> Result<Vec<Job>, sqlx::Error> {
        let rows = sqlx::query("SELECT * FROM jobs WHERE cluster_id = ? ORDER BY id")
            .bind(cluster_id)
            .fetch_all(pool)
            .await?;

        Ok(rows.iter().map(row_to_job).collect())
    }

    pub async fn has_active(pool: &SqlitePool, cluster_id: i64) -> Result<bool, sqlx::Error> {
        let row = sqlx::query(
            "SELECT COUNT(*) as count FROM jobs
             WHERE cluster_id = ? AND status IN ('pending', 'running')",
        )
        .bind(cluster_id)
        .fetch_one(pool)
        .await?;

        let count: i64 = row.get("count");
        Ok(count > 0)
    }

    pub async fn mark_running(pool: &SqlitePool, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE jobs SET status = 'running', started_at = ? WHERE id = ?")
            .bind(chrono::Utc::now().timestamp_millis())
            .bind(id)
            .execute(pool)
            .await?;

        Ok(())
    }

    /// Progress only ever moves forward.
    pub async fn set_progress(pool: &SqlitePool, id: i64, progress: u8) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE jobs SET progress = MAX(progress, ?) WHERE id = ?")
            .bind(progress.min(100) as i64)
            .bind(id)
            .execute(pool)
            .await?;

        Ok(())
    }

    pub async fn finish(
        pool: &SqlitePool,
        id: i64,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        let progress_sql = if status == JobStatus::Completed {
            "UPDATE jobs SET status = ?, error = ?, finished_at = ?, progress = 100 WHERE id = ?"
        } else {
            "UPDATE jobs SET status = ?, error = ?, finished_at = ? WHERE id = ?"
        };

        sqlx::query(progress_sql)
            .bind(status.as_str())
            .bind(error)
            .bind(chrono::Utc::now().timestamp_millis())
            .bind(id)
            .execute(pool)
            .await?;

        Ok(())
    }

    pub async fn delete_by_cluster(pool: &SqlitePool, cluster_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM jobs WHERE cluster_id = ?")
            .bind(cluster_id)
            .execute(pool)
            .await?;

        Ok(())
    }

    fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Job {
        let job_type: String = row.get("job_type");
        let status: String = row.get("status");
        let started_at: Option<i64> = row.get("started_at");
        let finished_at: Option<i64> = row.get("finished_at");

        Job {
            id: row.get("id"),
            cluster_id: row.get("cluster_id"),
            job_type: JobType::parse(&job_type),
            status: JobStatus::parse(&status),
            progress: row.get::<i64, _>("progress") as u8,
            error: row.get("error"),
            started_at: started_at.map(millis_to_datetime),
            finished_at: finished_at.map(millis_to_datetime),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        Cluster, ClusterStatus, CniPlugin, ContainerRuntime, EventLevel, JobStatus, JobType, Node,
        NodeRole, NodeStatus,
    };

    async fn create_test_db() -> Database {
        let db = Database::new("sqlite::memory:")
            .await
            .expect("failed to create database");
        db.migrate().await.expect("failed to run migrations");
        db
    }

    fn test_cluster(name: &str) -> Cluster {
        let now = chrono::Utc::now();
        Cluster {
            id: 0,
            name: name.to_string(),
            k8s_version: "1.28.0".to_string(),
            pod_network_cidr: "10.244.0.0/16".to_string(),
            service_cidr: "10.96.0.0/12".to_string(),
            cni: CniPlugin::Calico,
            container_runtime: ContainerRuntime::Containerd,
            api_server_endpoint: None,
            provider: "kubeadm".to_string(),
            status: ClusterStatus::Pending,
            kubeconfig: Vec::new(),
            join_command: String::new(),
            certificate_key: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_cluster_crud() {
        let db = create_test_db().await;
        let pool = db.pool();

        let id = clusters::create(pool, &test_cluster("alpha")).await.unwrap();
        assert!(id > 0);

        let cluster = clusters::get(pool, id).await.unwrap();
        assert_eq!(cluster.name, "alpha");
        assert_eq!(cluster.status, ClusterStatus::Pending);
        assert!(cluster.kubeconfig.is_empty());

        assert!(clusters::name_exists(pool, "alpha").await.unwrap());
        assert!(!clusters::name_exists(pool, "beta").await.unwrap());

        clusters::update_status(pool, id, ClusterStatus::Ready).await.unwrap();
        clusters::update_secrets(pool, id, b"kubeconfig-bytes", "kubeadm join x", "key")
            .await
            .unwrap();

        let cluster = clusters::get(pool, id).await.unwrap();
        assert_eq!(cluster.status, ClusterStatus::Ready);
        assert_eq!(cluster.kubeconfig, b"kubeconfig-bytes");
        assert_eq!(cluster.join_command, "kubeadm join x");
        assert_eq!(cluster.certificate_key, "key");

        clusters::delete(pool, id).await.unwrap();
        assert!(matches!(
            clusters::get(pool, id).await,
            Err(sqlx::Error::RowNotFound)
        ));
    }

    #[tokio::test]
    async fn test_delete_missing_cluster() {
        let db = create_test_db().await;
        assert!(matches!(
            clusters::delete(db.pool(), 42).await,
            Err(sqlx::Error::RowNotFound)
        ));
    }

    #[tokio::test]
    async fn test_node_crud() {
        let db = create_test_db().await;
        let pool = db.pool();

        let cluster_id = clusters::create(pool, &test_cluster("alpha")).await.unwrap();

        let node = Node {
            id: 0,
            cluster_id,
            hostname: "cp1".to_string(),
            address: "10.0.0.1".to_string(),
            ssh_user: "root".to_string(),
            ssh_key_path: Some("/k".to_string()),
            ssh_port: 22,
            role: NodeRole::ControlPlane,
            status: NodeStatus::Provisioning,
            k8s_version: None,
        };
        nodes::create(pool, &node).await.unwrap();

        let listed = nodes::list_by_cluster(pool, cluster_id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].role, NodeRole::ControlPlane);
        assert_eq!(listed[0].ssh_port, 22);

        nodes::update_status(pool, cluster_id, "10.0.0.1", NodeStatus::Ready, Some("1.28.0"))
            .await
            .unwrap();
        let listed = nodes::list_by_cluster(pool, cluster_id).await.unwrap();
        assert_eq!(listed[0].status, NodeStatus::Ready);
        assert_eq!(listed[0].k8s_version.as_deref(), Some("1.28.0"));

        nodes::delete_by_cluster(pool, cluster_id).await.unwrap();
        assert!(nodes::list_by_cluster(pool, cluster_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_event_ordering_and_limits() {
        let db = create_test_db().await;
        let pool = db.pool();

        for i in 0..5 {
            events::append(
                pool,
                1,
                EventLevel::Info,
                "localhost",
                "prepare",
                &format!("message {}", i),
                None,
            )
            .await
            .unwrap();
        }

        let chronological = events::recent(pool, 1, 50).await.unwrap();
        assert_eq!(chronological.len(), 5);
        for pair in chronological.windows(2) {
            assert!((pair[0].timestamp, pair[0].id) < (pair[1].timestamp, pair[1].id));
        }
        assert_eq!(chronological[0].message, "message 0");

        let newest_first = events::recent_desc(pool, 1, 2).await.unwrap();
        assert_eq!(newest_first.len(), 2);
        assert_eq!(newest_first[0].message, "message 4");

        // events of other clusters are invisible
        assert!(events::recent(pool, 2, 50).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_job_admission_invariant() {
        let db = create_test_db().await;
        let pool = db.pool();

        let job = jobs::create(pool, 1, JobType::Provision).await.unwrap();
        let job = job.expect("first job should be admitted");
        assert_eq!(job.status, JobStatus::Pending);

        // a second job for the same cluster is refused while the first is live
        assert!(jobs::create(pool, 1, JobType::Destroy).await.unwrap().is_none());
        jobs::mark_running(pool, job.id).await.unwrap();
        assert!(jobs::create(pool, 1, JobType::Destroy).await.unwrap().is_none());
        assert!(jobs::has_active(pool, 1).await.unwrap());

        // other clusters are unaffected
        assert!(jobs::create(pool, 2, JobType::Provision).await.unwrap().is_some());

        jobs::finish(pool, job.id, JobStatus::Completed, None).await.unwrap();
        let finished = jobs::get(pool, job.id).await.unwrap();
        assert_eq!(finished.status, JobStatus::Completed);
        assert_eq!(finished.progress, 100);
        assert!(finished.finished_at.is_some());

        assert!(jobs::create(pool, 1, JobType::Destroy).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_job_progress_is_monotonic() {
        let db = create_test_db().await;
        let pool = db.pool();

        let job = jobs::create(pool, 1, JobType::Provision)
            .await
            .unwrap()
            .unwrap();

        jobs::set_progress(pool, job.id, 40).await.unwrap();
        jobs::set_progress(pool, job.id, 20).await.unwrap();

        let job = jobs::get(pool, job.id).await.unwrap();
        assert_eq!(job.progress, 40);
    }
}

//! PostgreSQL deployment store implementation.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder, Row};

use crate::error::{ControlError, ControlResult};
use crate::types::{
    DeployParameters, DeploymentData, DeploymentId, DeploymentRecord, DeploymentStatus, ProjectId,
    ResourceDescriptor, UserId,
};

use super::{active_conflict, check_transition, DeploymentFilter, DeploymentStore};

const COLUMNS: &str = "id, project_id, user_id, deploy_type, parameters, status, \
     resource_descriptor, partial_resources, error, teardown_message, created_at, updated_at";

/// PostgreSQL-backed deployment store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to PostgreSQL and create a new store.
    ///
    /// The required tables are created if they don't exist.
    pub async fn new(url: &str) -> ControlResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;

        Self::from_pool(pool).await
    }

    /// Create a store from an existing connection pool.
    pub async fn from_pool(pool: PgPool) -> ControlResult<Self> {
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Ensure the required tables exist.
    async fn ensure_schema(&self) -> ControlResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS deployments (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                deploy_type TEXT NOT NULL,
                parameters JSONB NOT NULL DEFAULT '{}'::jsonb,
                status TEXT NOT NULL,
                resource_descriptor JSONB,
                partial_resources JSONB,
                error TEXT,
                teardown_message TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("ALTER TABLE deployments ADD COLUMN IF NOT EXISTS teardown_message TEXT")
            .execute(&self.pool)
            .await?;

        // One active deployment per project.
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_deployments_one_active
            ON deployments (project_id)
            WHERE status IN ('deploying', 'deployed', 'destroying')
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_deployments_project_created
            ON deployments (project_id, created_at DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_deployments_status_updated
            ON deployments (status, updated_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Parse a row into a DeploymentRecord.
    fn row_to_record(row: &sqlx::postgres::PgRow) -> ControlResult<DeploymentRecord> {
        let id: String = row.get("id");
        let project_id: String = row.get("project_id");
        let user_id: String = row.get("user_id");
        let deploy_type_str: String = row.get("deploy_type");
        let parameters: serde_json::Value = row.get("parameters");
        let status_str: String = row.get("status");
        let resource_descriptor: Option<serde_json::Value> = row.get("resource_descriptor");
        let partial_resources: Option<serde_json::Value> = row.get("partial_resources");
        let error: Option<String> = row.get("error");
        let teardown_message: Option<String> = row.get("teardown_message");
        let created_at: chrono::DateTime<chrono::Utc> = row.get("created_at");
        let updated_at: chrono::DateTime<chrono::Utc> = row.get("updated_at");

        let deploy_type = deploy_type_str.parse().map_err(|e| {
            ControlError::Serialisation(format!(
                "failed to parse deploy type '{deploy_type_str}': {e}"
            ))
        })?;

        let status: DeploymentStatus = status_str.parse().map_err(|e| {
            ControlError::Serialisation(format!("failed to parse status '{status_str}': {e}"))
        })?;

        let parameters: DeployParameters = serde_json::from_value(parameters).map_err(|e| {
            ControlError::Serialisation(format!("failed to deserialise parameters: {e}"))
        })?;

        Ok(DeploymentRecord {
            data: DeploymentData {
                id: DeploymentId::new(id),
                project_id: ProjectId::new(project_id),
                user_id: UserId::new(user_id),
                deploy_type,
                parameters,
                resource_descriptor: decode_descriptor(resource_descriptor)?,
                partial_resources: decode_descriptor(partial_resources)?,
                error,
                teardown_message,
                created_at,
                updated_at,
            },
            status,
        })
    }

    async fn current_status(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentStatus>> {
        let row = sqlx::query("SELECT status FROM deployments WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| {
            let status: String = r.get("status");
            status.parse().map_err(ControlError::Serialisation)
        })
        .transpose()
    }
}

fn decode_descriptor(
    value: Option<serde_json::Value>,
) -> ControlResult<Option<ResourceDescriptor>> {
    value
        .map(|v| {
            serde_json::from_value(v).map_err(|e| {
                ControlError::Serialisation(format!(
                    "failed to deserialise resource descriptor: {e}"
                ))
            })
        })
        .transpose()
}

fn encode_descriptor(
    value: Option<&ResourceDescriptor>,
) -> ControlResult<Option<serde_json::Value>> {
    Ok(value.map(serde_json::to_value).transpose()?)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl DeploymentStore for PostgresStore {
    async fn insert(&self, record: &DeploymentRecord) -> ControlResult<()> {
        let parameters = serde_json::to_value(&record.data.parameters)?;

        let result = sqlx::query(
            r#"
            INSERT INTO deployments (
                id, project_id, user_id, deploy_type, parameters, status,
                resource_descriptor, partial_resources, error, teardown_message,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(record.data.id.as_str())
        .bind(record.data.project_id.as_str())
        .bind(record.data.user_id.as_str())
        .bind(record.data.deploy_type.as_str())
        .bind(&parameters)
        .bind(record.status.as_str())
        .bind(encode_descriptor(record.data.resource_descriptor.as_ref())?)
        .bind(encode_descriptor(record.data.partial_resources.as_ref())?)
        .bind(&record.data.error)
        .bind(&record.data.teardown_message)
        .bind(record.data.created_at)
        .bind(record.data.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(active_conflict(&record.data.project_id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM deployments WHERE id = $1"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn get_active(&self, project_id: &ProjectId) -> ControlResult<Option<DeploymentRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM deployments \
             WHERE project_id = $1 AND status IN ('deploying', 'deployed', 'destroying')"
        ))
        .bind(project_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn get_by_project(
        &self,
        project_id: &ProjectId,
    ) -> ControlResult<Option<DeploymentRecord>> {
        let filter = DeploymentFilter::new()
            .with_project(project_id.clone())
            .with_limit(1);
        Ok(self.list(&filter).await?.into_iter().next())
    }

    async fn update(
        &self,
        record: &DeploymentRecord,
        expected: DeploymentStatus,
    ) -> ControlResult<()> {
        check_transition(expected, record.status)?;

        let result = sqlx::query(
            r#"
            UPDATE deployments
            SET status = $1,
                resource_descriptor = $2,
                partial_resources = $3,
                error = $4,
                teardown_message = $5,
                updated_at = $6
            WHERE id = $7 AND status = $8
            "#,
        )
        .bind(record.status.as_str())
        .bind(encode_descriptor(record.data.resource_descriptor.as_ref())?)
        .bind(encode_descriptor(record.data.partial_resources.as_ref())?)
        .bind(&record.data.error)
        .bind(&record.data.teardown_message)
        .bind(record.data.updated_at)
        .bind(record.data.id.as_str())
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.current_status(&record.data.id).await? {
                Some(actual) => Err(ControlError::InvalidStateTransition {
                    from: actual.as_str(),
                    to: record.status.as_str(),
                }),
                None => Err(ControlError::not_found("deployment", record.data.id.as_str())),
            };
        }

        Ok(())
    }

    async fn list(&self, filter: &DeploymentFilter) -> ControlResult<Vec<DeploymentRecord>> {
        let mut query: QueryBuilder<'_, Postgres> =
            QueryBuilder::new(format!("SELECT {COLUMNS} FROM deployments WHERE 1=1"));

        if let Some(ref project_id) = filter.project_id {
            query.push(" AND project_id = ").push_bind(project_id.as_str().to_owned());
        }

        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.as_str());
        }

        if let Some(before) = filter.updated_before {
            query.push(" AND updated_at < ").push_bind(before);
        }

        query.push(" ORDER BY created_at DESC, id DESC");

        if let Some(limit) = filter.limit {
            query.push(" LIMIT ").push_bind(i64::from(limit));
        }

        if let Some(offset) = filter.offset {
            query.push(" OFFSET ").push_bind(i64::from(offset));
        }

        let rows = query.build().fetch_all(&self.pool).await?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn delete(&self, id: &DeploymentId) -> ControlResult<()> {
        let result = sqlx::query("DELETE FROM deployments WHERE id = $1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ControlError::not_found("deployment", id.as_str()));
        }

        Ok(())
    }
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::state::{Deploying, Deployment};
    use crate::types::{DeployType, UserId};

    fn get_database_url() -> Option<String> {
        std::env::var("DATABASE_URL").ok()
    }

    fn test_deployment() -> DeploymentRecord {
        let project = format!("pg-test-{}", ulid::Ulid::new().to_string().to_lowercase());
        DeploymentRecord::new(DeploymentData::new(
            ProjectId::new(project),
            UserId::new("user-1"),
            DeployType::Gcp2,
            DeployParameters::from([("region".to_owned(), "europe-west1".to_owned())]),
        ))
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL instance (set DATABASE_URL)"]
    async fn insert_and_get() {
        let url = get_database_url().expect("DATABASE_URL not set");
        let store = PostgresStore::new(&url).await.expect("failed to connect");

        let record = test_deployment();
        let id = record.data.id.clone();

        store.insert(&record).await.expect("insert failed");

        let retrieved = store
            .get(&id)
            .await
            .expect("get failed")
            .expect("deployment not found");

        assert_eq!(retrieved.data.id, id);
        assert_eq!(retrieved.data.deploy_type, DeployType::Gcp2);
        assert_eq!(retrieved.data.parameters["region"], "europe-west1");
        assert_eq!(retrieved.status, DeploymentStatus::Deploying);

        store.delete(&id).await.expect("delete failed");
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL instance (set DATABASE_URL)"]
    async fn one_active_per_project() {
        let url = get_database_url().expect("DATABASE_URL not set");
        let store = PostgresStore::new(&url).await.expect("failed to connect");

        let first = test_deployment();
        let mut second = test_deployment();
        second.data.project_id = first.data.project_id.clone();

        store.insert(&first).await.expect("insert failed");
        let err = store.insert(&second).await.expect_err("second insert must conflict");
        assert!(matches!(err, ControlError::Conflict(_)));

        store.delete(first.id()).await.expect("delete failed");
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL instance (set DATABASE_URL)"]
    async fn compare_and_set_update() {
        let url = get_database_url().expect("DATABASE_URL not set");
        let store = PostgresStore::new(&url).await.expect("failed to connect");

        let record = test_deployment();
        store.insert(&record).await.expect("insert failed");

        let resources = ResourceDescriptor::new().with("cloud_storage", [("bucket", "b1")]);
        let deployed = Deployment::<Deploying>::create(record.data.clone())
            .complete(resources.clone())
            .into_record();
        store
            .update(&deployed, DeploymentStatus::Deploying)
            .await
            .expect("update failed");

        let stale = Deployment::<Deploying>::create(record.data.clone())
            .fail("late".to_owned(), None)
            .into_record();
        let err = store
            .update(&stale, DeploymentStatus::Deploying)
            .await
            .expect_err("stale update must fail");
        assert!(matches!(err, ControlError::InvalidStateTransition { .. }));

        let stored = store
            .get(record.id())
            .await
            .expect("get failed")
            .expect("not found");
        assert_eq!(stored.status, DeploymentStatus::Deployed);
        assert_eq!(stored.data.resource_descriptor, Some(resources));

        store.delete(record.id()).await.expect("delete failed");
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL instance (set DATABASE_URL)"]
    async fn list_with_filters() {
        let url = get_database_url().expect("DATABASE_URL not set");
        let store = PostgresStore::new(&url).await.expect("failed to connect");

        let record = test_deployment();
        store.insert(&record).await.expect("insert failed");

        let found = store
            .list(
                &DeploymentFilter::new()
                    .with_project(record.data.project_id.clone())
                    .with_status(DeploymentStatus::Deploying),
            )
            .await
            .expect("list failed");
        assert_eq!(found.len(), 1);

        let stale = store
            .list(
                &DeploymentFilter::new()
                    .with_project(record.data.project_id.clone())
                    .updated_before(record.data.updated_at - chrono::Duration::seconds(1)),
            )
            .await
            .expect("list failed");
        assert!(stale.is_empty());

        store.delete(record.id()).await.expect("delete failed");
    }
}

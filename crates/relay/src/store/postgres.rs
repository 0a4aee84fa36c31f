use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{SessionRecord, StoreError};

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: Uuid,
    batch_id: Uuid,
    owner_id: Uuid,
    created_at: DateTime<Utc>,
}

impl From<SessionRow> for SessionRecord {
    fn from(row: SessionRow) -> Self {
        Self { id: row.id, batch_id: row.batch_id, owner_id: row.owner_id, created_at: row.created_at }
    }
}

pub(super) async fn create_session(
    pool: &PgPool,
    owner_id: Uuid,
    batch_id: Uuid,
) -> Result<SessionRecord, StoreError> {
    // The UNIQUE (batch_id) constraint surfaces as 23505 -> BatchInUse.
    let row = sqlx::query_as::<_, SessionRow>(
        r#"
        INSERT INTO collab_sessions (id, batch_id, owner_id)
        VALUES ($1, $2, $3)
        RETURNING id, batch_id, owner_id, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(batch_id)
    .bind(owner_id)
    .fetch_one(pool)
    .await?;

    Ok(row.into())
}

pub(super) async fn fetch_session(
    pool: &PgPool,
    session_id: Uuid,
) -> Result<SessionRecord, StoreError> {
    sqlx::query_as::<_, SessionRow>(
        r#"
        SELECT id, batch_id, owner_id, created_at
        FROM collab_sessions
        WHERE id = $1
        "#,
    )
    .bind(session_id)
    .fetch_optional(pool)
    .await?
    .map(Into::into)
    .ok_or(StoreError::NotFound)
}

pub(super) async fn session_for_batch(
    pool: &PgPool,
    batch_id: Uuid,
) -> Result<Option<SessionRecord>, StoreError> {
    let row = sqlx::query_as::<_, SessionRow>(
        r#"
        SELECT id, batch_id, owner_id, created_at
        FROM collab_sessions
        WHERE batch_id = $1
        "#,
    )
    .bind(batch_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(Into::into))
}

pub(super) async fn is_member(
    pool: &PgPool,
    session_id: Uuid,
    user_id: Uuid,
) -> Result<bool, StoreError> {
    let member = sqlx::query_scalar::<_, bool>(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM collab_sessions WHERE id = $1 AND owner_id = $2
            UNION ALL
            SELECT 1 FROM collab_session_members WHERE session_id = $1 AND user_id = $2
        )
        "#,
    )
    .bind(session_id)
    .bind(user_id)
    .fetch_one(pool)
    .await?;

    Ok(member)
}

pub(super) async fn add_member(
    pool: &PgPool,
    session_id: Uuid,
    user_id: Uuid,
) -> Result<(), StoreError> {
    let inserted = sqlx::query(
        r#"
        INSERT INTO collab_session_members (session_id, user_id)
        SELECT id, $2 FROM collab_sessions WHERE id = $1
        ON CONFLICT (session_id, user_id) DO NOTHING
        "#,
    )
    .bind(session_id)
    .bind(user_id)
    .execute(pool)
    .await?;

    if inserted.rows_affected() == 0 {
        // Either already a member or the session is gone.
        fetch_session(pool, session_id).await?;
    }
    Ok(())
}

pub(super) async fn delete_session(pool: &PgPool, session_id: Uuid) -> Result<(), StoreError> {
    let deleted = sqlx::query("DELETE FROM collab_sessions WHERE id = $1")
        .bind(session_id)
        .execute(pool)
        .await?;

    if deleted.rows_affected() == 0 {
        return Err(StoreError::NotFound);
    }
    Ok(())
}

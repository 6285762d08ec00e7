//! In-app notifications.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::db::models::{Notification, User};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ListParams {
    /// Only unread notifications when true.
    #[serde(default)]
    pub unread: bool,
    pub limit: Option<i64>,
}

pub async fn list_notifications(
    State(state): State<Arc<AppState>>,
    user: User,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Notification>>, ApiError> {
    let limit = params.limit.unwrap_or(50).clamp(1, 200);
    let notifications: Vec<Notification> = if params.unread {
        sqlx::query_as(
            "SELECT * FROM notifications WHERE user_id = ? AND read = 0
             ORDER BY created_at DESC LIMIT ?",
        )
        .bind(&user.id)
        .bind(limit)
        .fetch_all(&state.db)
        .await?
    } else {
        sqlx::query_as(
            "SELECT * FROM notifications WHERE user_id = ?
             ORDER BY created_at DESC LIMIT ?",
        )
        .bind(&user.id)
        .bind(limit)
        .fetch_all(&state.db)
        .await?
    };
    Ok(Json(notifications))
}

pub async fn mark_read(
    State(state): State<Arc<AppState>>,
    user: User,
    Path(id): Path<String>,
) -> Result<Json<Notification>, ApiError> {
    let updated = sqlx::query("UPDATE notifications SET read = 1 WHERE id = ? AND user_id = ?")
        .bind(&id)
        .bind(&user.id)
        .execute(&state.db)
        .await?;
    if updated.rows_affected() == 0 {
        return Err(ApiError::not_found("Notification not found"));
    }

    let notification: Notification = sqlx::query_as("SELECT * FROM notifications WHERE id = ?")
        .bind(&id)
        .fetch_one(&state.db)
        .await?;
    Ok(Json(notification))
}

pub async fn mark_all_read(
    State(state): State<Arc<AppState>>,
    user: User,
) -> Result<Json<Value>, ApiError> {
    let updated = sqlx::query("UPDATE notifications SET read = 1 WHERE user_id = ? AND read = 0")
        .bind(&user.id)
        .execute(&state.db)
        .await?;
    Ok(Json(json!({ "updated": updated.rows_affected() })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::response::IntoResponse;
    use uuid::Uuid;

    async fn test_state() -> Arc<AppState> {
        let db = crate::db::init_in_memory().await.unwrap();
        Arc::new(AppState::new(Config::default(), db))
    }

    async fn insert_user(state: &AppState, email: &str) -> User {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO users (id, email, password_hash, name, role)
             VALUES (?, ?, 'x', 'Test', 'user')",
        )
        .bind(&id)
        .bind(email)
        .execute(&state.db)
        .await
        .unwrap();
        sqlx::query_as("SELECT * FROM users WHERE id = ?")
            .bind(&id)
            .fetch_one(&state.db)
            .await
            .unwrap()
    }

    async fn insert_notification(state: &AppState, user_id: &str, read: i64) -> String {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO notifications (id, user_id, kind, message, read)
             VALUES (?, ?, 'team_invite', 'You were added to a team', ?)",
        )
        .bind(&id)
        .bind(user_id)
        .bind(read)
        .execute(&state.db)
        .await
        .unwrap();
        id
    }

    #[tokio::test]
    async fn test_mark_read_is_scoped_to_recipient() {
        let state = test_state().await;
        let recipient = insert_user(&state, "recipient@test").await;
        let other = insert_user(&state, "other@test").await;
        let id = insert_notification(&state, &recipient.id, 0).await;

        let err = mark_read(State(state.clone()), other, Path(id.clone()))
            .await
            .unwrap_err();
        assert_eq!(
            err.into_response().status(),
            axum::http::StatusCode::NOT_FOUND
        );

        let Json(marked) = mark_read(State(state), recipient, Path(id)).await.unwrap();
        assert_eq!(marked.read, 1);
    }

    #[tokio::test]
    async fn test_mark_all_read_counts_only_unread() {
        let state = test_state().await;
        let user = insert_user(&state, "user@test").await;
        insert_notification(&state, &user.id, 0).await;
        insert_notification(&state, &user.id, 0).await;
        insert_notification(&state, &user.id, 1).await;

        let Json(result) = mark_all_read(State(state.clone()), user.clone()).await.unwrap();
        assert_eq!(result["updated"], 2);

        let Json(unread) = list_notifications(
            State(state),
            user,
            Query(ListParams {
                unread: true,
                limit: None,
            }),
        )
        .await
        .unwrap();
        assert!(unread.is_empty());
    }
}

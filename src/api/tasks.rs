//! Research task CRUD, scoped to the owning user.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::api::validation;
use crate::db::models::{CreateTaskRequest, Task, TaskStatus, UpdateTaskRequest, User};
use crate::AppState;

async fn fetch_owned(state: &AppState, user: &User, id: &str) -> Result<Task, ApiError> {
    let task: Option<Task> = sqlx::query_as("SELECT * FROM tasks WHERE id = ? AND owner_id = ?")
        .bind(id)
        .bind(&user.id)
        .fetch_optional(&state.db)
        .await?;
    task.ok_or_else(|| ApiError::not_found("Task not found"))
}

pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    user: User,
) -> Result<Json<Vec<Task>>, ApiError> {
    let tasks: Vec<Task> = sqlx::query_as(
        "SELECT * FROM tasks WHERE owner_id = ? ORDER BY created_at DESC",
    )
    .bind(&user.id)
    .fetch_all(&state.db)
    .await?;
    Ok(Json(tasks))
}

pub async fn create_task(
    State(state): State<Arc<AppState>>,
    user: User,
    Json(request): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    validation::require_non_empty("title", &request.title)?;

    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO tasks (id, owner_id, title, description, due_date) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(&user.id)
    .bind(request.title.trim())
    .bind(&request.description)
    .bind(&request.due_date)
    .execute(&state.db)
    .await?;

    let task: Task = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
        .bind(&id)
        .fetch_one(&state.db)
        .await?;
    Ok((StatusCode::CREATED, Json(task)))
}

pub async fn get_task(
    State(state): State<Arc<AppState>>,
    user: User,
    Path(id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(fetch_owned(&state, &user, &id).await?))
}

pub async fn update_task(
    State(state): State<Arc<AppState>>,
    user: User,
    Path(id): Path<String>,
    Json(request): Json<UpdateTaskRequest>,
) -> Result<Json<Task>, ApiError> {
    let task = fetch_owned(&state, &user, &id).await?;

    let title = request.title.unwrap_or(task.title);
    validation::require_non_empty("title", &title)?;
    let status = match request.status {
        Some(s) => TaskStatus::parse(&s)
            .ok_or_else(|| {
                ApiError::validation_field("status", "Status must be pending, in_progress, or done")
            })?
            .as_str()
            .to_string(),
        None => task.status,
    };
    let description = request.description.unwrap_or(task.description);
    let due_date = request.due_date.or(task.due_date);

    sqlx::query(
        "UPDATE tasks SET title = ?, description = ?, status = ?, due_date = ?,
                updated_at = datetime('now')
         WHERE id = ?",
    )
    .bind(title.trim())
    .bind(&description)
    .bind(&status)
    .bind(&due_date)
    .bind(&id)
    .execute(&state.db)
    .await?;

    let task: Task = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
        .bind(&id)
        .fetch_one(&state.db)
        .await?;
    Ok(Json(task))
}

pub async fn delete_task(
    State(state): State<Arc<AppState>>,
    user: User,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    fetch_owned(&state, &user, &id).await?;
    sqlx::query("DELETE FROM tasks WHERE id = ?")
        .bind(&id)
        .execute(&state.db)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::response::IntoResponse;

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

    fn new_task(title: &str) -> CreateTaskRequest {
        CreateTaskRequest {
            title: title.to_string(),
            description: String::new(),
            due_date: None,
        }
    }

    #[tokio::test]
    async fn test_tasks_are_scoped_to_owner() {
        let state = test_state().await;
        let owner = insert_user(&state, "owner@test").await;
        let other = insert_user(&state, "other@test").await;

        let (status, Json(task)) =
            create_task(State(state.clone()), owner.clone(), Json(new_task("Read survey")))
                .await
                .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(task.status, "pending");

        let Json(mine) = list_tasks(State(state.clone()), owner).await.unwrap();
        assert_eq!(mine.len(), 1);

        let Json(theirs) = list_tasks(State(state.clone()), other.clone()).await.unwrap();
        assert!(theirs.is_empty());

        let err = get_task(State(state), other, Path(task.id)).await.unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_update_validates_status() {
        let state = test_state().await;
        let owner = insert_user(&state, "owner@test").await;
        let (_, Json(task)) =
            create_task(State(state.clone()), owner.clone(), Json(new_task("Draft intro")))
                .await
                .unwrap();

        let bad = UpdateTaskRequest {
            title: None,
            description: None,
            status: Some("archived".to_string()),
            due_date: None,
        };
        let err = update_task(
            State(state.clone()),
            owner.clone(),
            Path(task.id.clone()),
            Json(bad),
        )
        .await
        .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);

        let ok = UpdateTaskRequest {
            title: None,
            description: None,
            status: Some("done".to_string()),
            due_date: None,
        };
        let Json(updated) = update_task(State(state), owner, Path(task.id), Json(ok))
            .await
            .unwrap();
        assert_eq!(updated.status, "done");
        assert_eq!(updated.title, "Draft intro");
    }
}

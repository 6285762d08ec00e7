//! Document CRUD and AI summarization.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::api::validation;
use crate::db::models::{CreateDocumentRequest, Document, UpdateDocumentRequest, User};
use crate::AppState;

const SUMMARY_FEATURE: &str = "summarize";

/// Content cap fed to the provider; longer documents are truncated.
const MAX_SUMMARY_INPUT: usize = 24_000;

#[derive(Serialize)]
pub struct SummarizeResponse {
    pub summary: String,
    pub provider: String,
    pub model: String,
    pub tokens_charged: i64,
}

/// A document is visible to its owner and to members of its team.
async fn fetch_accessible(
    state: &AppState,
    user: &User,
    id: &str,
) -> Result<Document, ApiError> {
    let doc: Option<Document> = sqlx::query_as(
        "SELECT d.* FROM documents d
         LEFT JOIN team_members tm ON tm.team_id = d.team_id AND tm.user_id = ?
         WHERE d.id = ? AND (d.owner_id = ? OR tm.user_id IS NOT NULL)",
    )
    .bind(&user.id)
    .bind(id)
    .bind(&user.id)
    .fetch_optional(&state.db)
    .await?;
    doc.ok_or_else(|| ApiError::not_found("Document not found"))
}

pub async fn list_documents(
    State(state): State<Arc<AppState>>,
    user: User,
) -> Result<Json<Vec<Document>>, ApiError> {
    let docs: Vec<Document> = sqlx::query_as(
        "SELECT DISTINCT d.* FROM documents d
         LEFT JOIN team_members tm ON tm.team_id = d.team_id
         WHERE d.owner_id = ? OR tm.user_id = ?
         ORDER BY d.updated_at DESC",
    )
    .bind(&user.id)
    .bind(&user.id)
    .fetch_all(&state.db)
    .await?;
    Ok(Json(docs))
}

pub async fn create_document(
    State(state): State<Arc<AppState>>,
    user: User,
    Json(request): Json<CreateDocumentRequest>,
) -> Result<(StatusCode, Json<Document>), ApiError> {
    validation::require_non_empty("title", &request.title)?;

    if let Some(team_id) = &request.team_id {
        let member: Option<(String,)> =
            sqlx::query_as("SELECT id FROM team_members WHERE team_id = ? AND user_id = ?")
                .bind(team_id)
                .bind(&user.id)
                .fetch_optional(&state.db)
                .await?;
        if member.is_none() {
            return Err(ApiError::forbidden("Not a member of this team"));
        }
    }

    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO documents (id, owner_id, team_id, title, content) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(&user.id)
    .bind(&request.team_id)
    .bind(request.title.trim())
    .bind(&request.content)
    .execute(&state.db)
    .await?;

    let doc: Document = sqlx::query_as("SELECT * FROM documents WHERE id = ?")
        .bind(&id)
        .fetch_one(&state.db)
        .await?;
    Ok((StatusCode::CREATED, Json(doc)))
}

pub async fn get_document(
    State(state): State<Arc<AppState>>,
    user: User,
    Path(id): Path<String>,
) -> Result<Json<Document>, ApiError> {
    Ok(Json(fetch_accessible(&state, &user, &id).await?))
}

pub async fn update_document(
    State(state): State<Arc<AppState>>,
    user: User,
    Path(id): Path<String>,
    Json(request): Json<UpdateDocumentRequest>,
) -> Result<Json<Document>, ApiError> {
    let doc = fetch_accessible(&state, &user, &id).await?;

    let title = request.title.unwrap_or(doc.title);
    validation::require_non_empty("title", &title)?;
    let content = request.content.unwrap_or(doc.content);
    let team_id = request.team_id.or(doc.team_id);

    sqlx::query(
        "UPDATE documents SET title = ?, content = ?, team_id = ?, updated_at = datetime('now')
         WHERE id = ?",
    )
    .bind(title.trim())
    .bind(&content)
    .bind(&team_id)
    .bind(&id)
    .execute(&state.db)
    .await?;

    let doc: Document = sqlx::query_as("SELECT * FROM documents WHERE id = ?")
        .bind(&id)
        .fetch_one(&state.db)
        .await?;
    Ok(Json(doc))
}

pub async fn delete_document(
    State(state): State<Arc<AppState>>,
    user: User,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let doc = fetch_accessible(&state, &user, &id).await?;
    if doc.owner_id != user.id {
        return Err(ApiError::forbidden("Only the owner can delete a document"));
    }
    sqlx::query("DELETE FROM documents WHERE id = ?")
        .bind(&id)
        .execute(&state.db)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Summarize a document with the provider fallback chain. Tokens are charged
/// up front and refunded when every provider fails.
pub async fn summarize_document(
    State(state): State<Arc<AppState>>,
    user: User,
    Path(id): Path<String>,
) -> Result<Json<SummarizeResponse>, ApiError> {
    let doc = fetch_accessible(&state, &user, &id).await?;
    if doc.content.trim().is_empty() {
        return Err(ApiError::bad_request("Document has no content to summarize"));
    }

    let context = json!({ "document_id": id, "feature": SUMMARY_FEATURE });
    let deduction = state.ledger.deduct(&user.id, SUMMARY_FEATURE, &context).await?;

    let excerpt: String = doc.content.chars().take(MAX_SUMMARY_INPUT).collect();
    let mut req = state.providers.default_request(format!(
        "Summarize the following document in 3-6 concise paragraphs. Preserve key \
         findings, numbers, and terminology.\n\nTitle: {}\n\n{}",
        doc.title, excerpt,
    ));
    req.system_prompt =
        Some("You are a precise academic summarizer. Never invent content.".to_string());

    let cancel = tokio_util::sync::CancellationToken::new();
    let completion = match state
        .providers
        .generate_with_fallback(&req, None, &cancel)
        .await
    {
        Ok(c) => c,
        Err(e) => {
            let refund_ctx = json!({ "document_id": id, "refund_reason": "provider_failure" });
            if let Err(re) = state
                .ledger
                .refund(&user.id, SUMMARY_FEATURE, deduction.cost, &refund_ctx)
                .await
            {
                tracing::error!(error = %re, "Refund after failed summarize did not apply");
            }
            return Err(e.into());
        }
    };

    sqlx::query("UPDATE documents SET summary = ?, updated_at = datetime('now') WHERE id = ?")
        .bind(&completion.content)
        .bind(&id)
        .execute(&state.db)
        .await?;

    Ok(Json(SummarizeResponse {
        summary: completion.content,
        provider: completion.provider.as_str().to_string(),
        model: completion.model,
        tokens_charged: deduction.cost,
    }))
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

    #[tokio::test]
    async fn test_create_requires_team_membership() {
        let state = test_state().await;
        let owner = insert_user(&state, "owner@test").await;
        let outsider = insert_user(&state, "outsider@test").await;

        let team_id = Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO teams (id, name, slug, owner_id) VALUES (?, 'Lab', 'lab', ?)")
            .bind(&team_id)
            .bind(&owner.id)
            .execute(&state.db)
            .await
            .unwrap();

        let request = CreateDocumentRequest {
            title: "Field notes".to_string(),
            content: String::new(),
            team_id: Some(team_id),
        };
        let err = create_document(State(state), outsider, Json(request))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_documents_hidden_from_other_users() {
        let state = test_state().await;
        let owner = insert_user(&state, "owner@test").await;
        let other = insert_user(&state, "other@test").await;

        let request = CreateDocumentRequest {
            title: "Draft".to_string(),
            content: "Results pending".to_string(),
            team_id: None,
        };
        let (status, Json(doc)) = create_document(State(state.clone()), owner.clone(), Json(request))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::CREATED);

        let err = get_document(State(state.clone()), other, Path(doc.id.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);

        let Json(found) = get_document(State(state), owner, Path(doc.id)).await.unwrap();
        assert_eq!(found.title, "Draft");
    }

    #[tokio::test]
    async fn test_partial_update_keeps_other_fields() {
        let state = test_state().await;
        let owner = insert_user(&state, "owner@test").await;

        let request = CreateDocumentRequest {
            title: "Methods".to_string(),
            content: "v1".to_string(),
            team_id: None,
        };
        let (_, Json(doc)) = create_document(State(state.clone()), owner.clone(), Json(request))
            .await
            .unwrap();

        let update = UpdateDocumentRequest {
            title: None,
            content: Some("v2".to_string()),
            team_id: None,
        };
        let Json(updated) = update_document(State(state), owner, Path(doc.id), Json(update))
            .await
            .unwrap();
        assert_eq!(updated.title, "Methods");
        assert_eq!(updated.content, "v2");
    }
}

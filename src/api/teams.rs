//! Team management: CRUD plus role-based membership.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::api::validation;
use crate::db::models::{
    AddMemberRequest, CreateTeamRequest, Team, TeamMember, TeamMemberWithUser, TeamRole,
    UpdateMemberRoleRequest, UpdateTeamRequest, User,
};
use crate::AppState;

/// Generate a URL-friendly slug from a name
fn generate_slug(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

async fn fetch_team(state: &AppState, id: &str) -> Result<Team, ApiError> {
    let team: Option<Team> = sqlx::query_as("SELECT * FROM teams WHERE id = ?")
        .bind(id)
        .fetch_optional(&state.db)
        .await?;
    team.ok_or_else(|| ApiError::not_found("Team not found"))
}

async fn membership(
    state: &AppState,
    team_id: &str,
    user_id: &str,
) -> Result<Option<TeamMember>, ApiError> {
    let member: Option<TeamMember> =
        sqlx::query_as("SELECT * FROM team_members WHERE team_id = ? AND user_id = ?")
            .bind(team_id)
            .bind(user_id)
            .fetch_optional(&state.db)
            .await?;
    Ok(member)
}

/// The caller's role in the team, erroring when they are not a member.
async fn require_member(state: &AppState, team_id: &str, user: &User) -> Result<TeamRole, ApiError> {
    membership(state, team_id, &user.id)
        .await?
        .map(|m| m.role_enum())
        .ok_or_else(|| ApiError::forbidden("Not a member of this team"))
}

#[derive(serde::Serialize)]
pub struct TeamWithMembers {
    #[serde(flatten)]
    pub team: Team,
    pub members: Vec<TeamMemberWithUser>,
}

pub async fn list_teams(
    State(state): State<Arc<AppState>>,
    user: User,
) -> Result<Json<Vec<Team>>, ApiError> {
    let teams: Vec<Team> = sqlx::query_as(
        "SELECT t.* FROM teams t
         JOIN team_members tm ON tm.team_id = t.id
         WHERE tm.user_id = ?
         ORDER BY t.created_at DESC",
    )
    .bind(&user.id)
    .fetch_all(&state.db)
    .await?;
    Ok(Json(teams))
}

pub async fn create_team(
    State(state): State<Arc<AppState>>,
    user: User,
    Json(request): Json<CreateTeamRequest>,
) -> Result<(StatusCode, Json<Team>), ApiError> {
    validation::require_non_empty("name", &request.name)?;
    let slug = generate_slug(&request.name);
    if slug.len() < 2 {
        return Err(ApiError::validation_field(
            "name",
            "Team name must produce a slug of at least 2 characters",
        ));
    }

    let existing: Option<(String,)> = sqlx::query_as("SELECT id FROM teams WHERE slug = ?")
        .bind(&slug)
        .fetch_optional(&state.db)
        .await?;
    if existing.is_some() {
        return Err(ApiError::conflict("A team with this name already exists"));
    }

    let id = Uuid::new_v4().to_string();
    let mut tx = state.db.begin().await?;
    sqlx::query("INSERT INTO teams (id, name, slug, owner_id) VALUES (?, ?, ?, ?)")
        .bind(&id)
        .bind(request.name.trim())
        .bind(&slug)
        .bind(&user.id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("INSERT INTO team_members (id, team_id, user_id, role) VALUES (?, ?, ?, 'owner')")
        .bind(Uuid::new_v4().to_string())
        .bind(&id)
        .bind(&user.id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    let team = fetch_team(&state, &id).await?;
    Ok((StatusCode::CREATED, Json(team)))
}

pub async fn get_team(
    State(state): State<Arc<AppState>>,
    user: User,
    Path(id): Path<String>,
) -> Result<Json<TeamWithMembers>, ApiError> {
    require_member(&state, &id, &user).await?;
    let team = fetch_team(&state, &id).await?;
    let members: Vec<TeamMemberWithUser> = sqlx::query_as(
        "SELECT tm.id, tm.team_id, tm.user_id, tm.role, tm.created_at, u.email, u.name
         FROM team_members tm
         JOIN users u ON u.id = tm.user_id
         WHERE tm.team_id = ?
         ORDER BY tm.created_at ASC",
    )
    .bind(&id)
    .fetch_all(&state.db)
    .await?;
    Ok(Json(TeamWithMembers { team, members }))
}

pub async fn update_team(
    State(state): State<Arc<AppState>>,
    user: User,
    Path(id): Path<String>,
    Json(request): Json<UpdateTeamRequest>,
) -> Result<Json<Team>, ApiError> {
    let role = require_member(&state, &id, &user).await?;
    if !role.can_manage_members() {
        return Err(ApiError::forbidden("Only owners and admins can update a team"));
    }
    let team = fetch_team(&state, &id).await?;

    let name = request.name.unwrap_or(team.name);
    validation::require_non_empty("name", &name)?;

    sqlx::query("UPDATE teams SET name = ?, updated_at = datetime('now') WHERE id = ?")
        .bind(name.trim())
        .bind(&id)
        .execute(&state.db)
        .await?;
    Ok(Json(fetch_team(&state, &id).await?))
}

pub async fn delete_team(
    State(state): State<Arc<AppState>>,
    user: User,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let team = fetch_team(&state, &id).await?;
    if team.owner_id != user.id {
        return Err(ApiError::forbidden("Only the owner can delete a team"));
    }
    sqlx::query("DELETE FROM teams WHERE id = ?")
        .bind(&id)
        .execute(&state.db)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Add a user by email. The new member gets an in-app notification.
pub async fn add_member(
    State(state): State<Arc<AppState>>,
    user: User,
    Path(id): Path<String>,
    Json(request): Json<AddMemberRequest>,
) -> Result<(StatusCode, Json<TeamMember>), ApiError> {
    let role = require_member(&state, &id, &user).await?;
    if !role.can_manage_members() {
        return Err(ApiError::forbidden("Only owners and admins can add members"));
    }
    validation::validate_email(&request.email)?;
    let new_role = validation::validate_team_role(&request.role)?;
    if new_role == TeamRole::Owner {
        return Err(ApiError::validation_field("role", "Cannot add a second owner"));
    }

    let target: Option<User> = sqlx::query_as("SELECT * FROM users WHERE email = ?")
        .bind(&request.email)
        .fetch_optional(&state.db)
        .await?;
    let target = target.ok_or_else(|| ApiError::not_found("No user with this email"))?;

    if membership(&state, &id, &target.id).await?.is_some() {
        return Err(ApiError::conflict("User is already a member of this team"));
    }

    let team = fetch_team(&state, &id).await?;
    let member_id = Uuid::new_v4().to_string();
    sqlx::query("INSERT INTO team_members (id, team_id, user_id, role) VALUES (?, ?, ?, ?)")
        .bind(&member_id)
        .bind(&id)
        .bind(&target.id)
        .bind(new_role.as_str())
        .execute(&state.db)
        .await?;

    // Best-effort notification; membership already committed
    let notify = sqlx::query(
        "INSERT INTO notifications (id, user_id, kind, message) VALUES (?, ?, 'team_invite', ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&target.id)
    .bind(format!("{} added you to the team \"{}\"", user.name, team.name))
    .execute(&state.db)
    .await;
    if let Err(e) = notify {
        tracing::warn!(error = %e, "Failed to notify new team member");
    }

    let member: TeamMember = sqlx::query_as("SELECT * FROM team_members WHERE id = ?")
        .bind(&member_id)
        .fetch_one(&state.db)
        .await?;
    Ok((StatusCode::CREATED, Json(member)))
}

pub async fn update_member_role(
    State(state): State<Arc<AppState>>,
    user: User,
    Path((id, member_user_id)): Path<(String, String)>,
    Json(request): Json<UpdateMemberRoleRequest>,
) -> Result<Json<TeamMember>, ApiError> {
    let role = require_member(&state, &id, &user).await?;
    if !role.can_manage_members() {
        return Err(ApiError::forbidden("Only owners and admins can change roles"));
    }
    let new_role = validation::validate_team_role(&request.role)?;
    if new_role == TeamRole::Owner {
        return Err(ApiError::validation_field("role", "Ownership cannot be reassigned here"));
    }

    let team = fetch_team(&state, &id).await?;
    if member_user_id == team.owner_id {
        return Err(ApiError::forbidden("The team owner cannot be demoted"));
    }
    membership(&state, &id, &member_user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Member not found"))?;

    sqlx::query("UPDATE team_members SET role = ? WHERE team_id = ? AND user_id = ?")
        .bind(new_role.as_str())
        .bind(&id)
        .bind(&member_user_id)
        .execute(&state.db)
        .await?;

    let member: TeamMember =
        sqlx::query_as("SELECT * FROM team_members WHERE team_id = ? AND user_id = ?")
            .bind(&id)
            .bind(&member_user_id)
            .fetch_one(&state.db)
            .await?;
    Ok(Json(member))
}

pub async fn remove_member(
    State(state): State<Arc<AppState>>,
    user: User,
    Path((id, member_user_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let role = require_member(&state, &id, &user).await?;
    // Members can remove themselves; managers can remove anyone but the owner
    if member_user_id != user.id && !role.can_manage_members() {
        return Err(ApiError::forbidden("Only owners and admins can remove members"));
    }

    let team = fetch_team(&state, &id).await?;
    if member_user_id == team.owner_id {
        return Err(ApiError::forbidden("The team owner cannot be removed"));
    }
    membership(&state, &id, &member_user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Member not found"))?;

    sqlx::query("DELETE FROM team_members WHERE team_id = ? AND user_id = ?")
        .bind(&id)
        .bind(&member_user_id)
        .execute(&state.db)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_slug() {
        assert_eq!(generate_slug("Protein Folding Lab"), "protein-folding-lab");
        assert_eq!(generate_slug("  NLP -- Reading_Group  "), "nlp-reading-group");
        assert_eq!(generate_slug("!!!"), "");
    }
}

//! Team membership
//!
//! Every team keeps at least one active owner. The checks live on
//! [`Member`]; this service supplies the current owner count and persists.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use super::ServiceContext;
use crate::error::{Result, TeamcastError, ValidationError};
use crate::permissions::{transfer_ownership, Capability, Member, Role};

#[derive(Clone)]
pub struct MemberService {
    context: Arc<ServiceContext>,
}

impl MemberService {
    pub(crate) fn new(context: Arc<ServiceContext>) -> Self {
        Self { context }
    }

    /// Start a new team with `owner_id` as its only owner
    pub async fn create_team(&self, owner_id: Uuid) -> Result<Member> {
        let member = Member::active(Uuid::new_v4(), owner_id, Role::Owner, Utc::now());
        self.context.repos.members.upsert_member(&member).await?;
        info!(team_id = %member.team_id, %owner_id, "team created");
        Ok(member)
    }

    pub async fn get(&self, team_id: Uuid, user_id: Uuid) -> Result<Option<Member>> {
        self.context.repos.members.get_member(team_id, user_id).await
    }

    /// Add someone as an active member. Only owners may hand out the owner role.
    pub async fn add_member(
        &self,
        team_id: Uuid,
        actor_id: Uuid,
        user_id: Uuid,
        role: Role,
    ) -> Result<Member> {
        let actor = self
            .context
            .authorize(team_id, actor_id, Capability::ManageMembers, None)
            .await?;
        if role.is_owner() && !actor.role.is_owner() {
            return Err(owner_only("add an owner"));
        }
        if let Some(existing) = self.get(team_id, user_id).await? {
            if existing.is_active() {
                return Err(TeamcastError::Duplicate(format!("user {user_id} is already a member")));
            }
        }

        let member = Member::active(team_id, user_id, role, Utc::now());
        self.context.repos.members.upsert_member(&member).await?;
        info!(%team_id, %user_id, %role, "member added");
        Ok(member)
    }

    pub async fn change_role(
        &self,
        team_id: Uuid,
        actor_id: Uuid,
        user_id: Uuid,
        role: Role,
    ) -> Result<Member> {
        let actor = self
            .context
            .authorize(team_id, actor_id, Capability::ManageMembers, None)
            .await?;
        let mut member = self.require(team_id, user_id).await?;
        if (role.is_owner() || member.role.is_owner()) && !actor.role.is_owner() {
            return Err(owner_only("change an owner's role"));
        }

        let owners = self.context.repos.members.count_active_owners(team_id).await?;
        let from = member.role;
        member.change_role(role, owners)?;
        self.context.repos.members.upsert_member(&member).await?;
        info!(%team_id, %user_id, %from, to = %role, "member role changed");
        Ok(member)
    }

    pub async fn leave(&self, team_id: Uuid, user_id: Uuid) -> Result<()> {
        let mut member = self.require(team_id, user_id).await?;
        let owners = self.context.repos.members.count_active_owners(team_id).await?;
        member.leave(owners)?;
        self.context.repos.members.upsert_member(&member).await?;
        info!(%team_id, %user_id, "member left");
        Ok(())
    }

    pub async fn remove(&self, team_id: Uuid, actor_id: Uuid, user_id: Uuid) -> Result<()> {
        let actor = self
            .context
            .authorize(team_id, actor_id, Capability::ManageMembers, None)
            .await?;
        let mut member = self.require(team_id, user_id).await?;
        if member.role.is_owner() && !actor.role.is_owner() {
            return Err(owner_only("remove an owner"));
        }

        let owners = self.context.repos.members.count_active_owners(team_id).await?;
        member.deactivate(owners)?;
        self.context.repos.members.upsert_member(&member).await?;
        info!(%team_id, %user_id, removed_by = %actor_id, "member removed");
        Ok(())
    }

    /// The current owner becomes an admin and `to_user` the owner
    pub async fn transfer_ownership(
        &self,
        team_id: Uuid,
        from_user: Uuid,
        to_user: Uuid,
    ) -> Result<()> {
        if from_user == to_user {
            let reason = "cannot transfer ownership to yourself".to_string();
            return Err(ValidationError::Invalid(reason).into());
        }
        let mut from = self.require(team_id, from_user).await?;
        let mut to = self.require(team_id, to_user).await?;
        transfer_ownership(&mut from, &mut to)?;

        // new owner first, so the team never drops to zero owners in between
        self.context.repos.members.upsert_member(&to).await?;
        self.context.repos.members.upsert_member(&from).await?;
        info!(%team_id, from = %from_user, to = %to_user, "ownership transferred");
        Ok(())
    }

    async fn require(&self, team_id: Uuid, user_id: Uuid) -> Result<Member> {
        self.get(team_id, user_id)
            .await?
            .ok_or_else(|| TeamcastError::NotFound(format!("member {user_id} of team {team_id}")))
    }
}

fn owner_only(action: &str) -> TeamcastError {
    TeamcastError::Authorization(format!("only an owner can {action}"))
}

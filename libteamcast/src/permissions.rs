//! Team roles and the authorization gate
//!
//! Permissions are a pure function of a member's role and status. Only active
//! members hold any capability.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, TeamcastError, ValidationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Admin,
    Editor,
    Viewer,
}

impl Role {
    /// Check if this role can perform admin actions
    pub fn can_admin(&self) -> bool {
        matches!(self, Role::Owner | Role::Admin)
    }

    pub fn is_owner(&self) -> bool {
        matches!(self, Role::Owner)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Admin => "admin",
            Role::Editor => "editor",
            Role::Viewer => "viewer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ValidationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "owner" => Ok(Role::Owner),
            "admin" => Ok(Role::Admin),
            "editor" => Ok(Role::Editor),
            "viewer" => Ok(Role::Viewer),
            other => Err(ValidationError::Invalid(format!("unknown role: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    Pending,
    Active,
    Inactive,
    Left,
}

impl MemberStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberStatus::Pending => "pending",
            MemberStatus::Active => "active",
            MemberStatus::Inactive => "inactive",
            MemberStatus::Left => "left",
        }
    }
}

impl FromStr for MemberStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MemberStatus::Pending),
            "active" => Ok(MemberStatus::Active),
            "inactive" => Ok(MemberStatus::Inactive),
            "left" => Ok(MemberStatus::Left),
            other => Err(ValidationError::Invalid(format!("unknown member status: {other}"))),
        }
    }
}

/// What a caller is trying to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Connect or disconnect social accounts
    ManageAccounts,
    /// Create and edit posts
    EditPosts,
    /// Delete or cancel posts
    DeletePosts,
    /// Publish now or schedule
    PublishPosts,
    ViewPosts,
    ViewAnalytics,
    /// Add, remove or change the role of team members
    ManageMembers,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::ManageAccounts => "manage social accounts",
            Capability::EditPosts => "create or edit posts",
            Capability::DeletePosts => "delete or cancel posts",
            Capability::PublishPosts => "publish or schedule posts",
            Capability::ViewPosts => "view posts",
            Capability::ViewAnalytics => "view analytics",
            Capability::ManageMembers => "manage team members",
        };
        f.write_str(name)
    }
}

/// The role matrix. `is_creator` only matters for editors publishing.
pub fn permits(role: Role, status: MemberStatus, capability: Capability, is_creator: bool) -> bool {
    if status != MemberStatus::Active {
        return false;
    }

    match capability {
        Capability::ManageAccounts | Capability::DeletePosts | Capability::ManageMembers => {
            role.can_admin()
        }
        Capability::EditPosts => role != Role::Viewer,
        Capability::PublishPosts => match role {
            Role::Owner | Role::Admin => true,
            Role::Editor => is_creator,
            Role::Viewer => false,
        },
        Capability::ViewPosts | Capability::ViewAnalytics => true,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub team_id: Uuid,
    pub user_id: Uuid,
    pub role: Role,
    pub status: MemberStatus,
    pub joined_at: DateTime<Utc>,
}

impl Member {
    pub fn active(team_id: Uuid, user_id: Uuid, role: Role, now: DateTime<Utc>) -> Self {
        Self {
            team_id,
            user_id,
            role,
            status: MemberStatus::Active,
            joined_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == MemberStatus::Active
    }

    pub fn is_active_owner(&self) -> bool {
        self.is_active() && self.role.is_owner()
    }

    /// `active_owners` is the team's current count of active owners
    pub fn change_role(
        &mut self,
        role: Role,
        active_owners: usize,
    ) -> std::result::Result<(), ValidationError> {
        if self.is_active_owner() && !role.is_owner() && active_owners <= 1 {
            return Err(ValidationError::LastOwner);
        }
        self.role = role;
        Ok(())
    }

    pub fn leave(&mut self, active_owners: usize) -> std::result::Result<(), ValidationError> {
        self.step_down(MemberStatus::Left, active_owners)
    }

    /// Removal by an admin
    pub fn deactivate(&mut self, active_owners: usize) -> std::result::Result<(), ValidationError> {
        self.step_down(MemberStatus::Inactive, active_owners)
    }

    fn step_down(
        &mut self,
        status: MemberStatus,
        active_owners: usize,
    ) -> std::result::Result<(), ValidationError> {
        if self.is_active_owner() && active_owners <= 1 {
            return Err(ValidationError::LastOwner);
        }
        self.status = status;
        Ok(())
    }
}

/// Hand ownership from one active owner to another active member of the same team.
/// The previous owner becomes an admin.
pub fn transfer_ownership(
    from: &mut Member,
    to: &mut Member,
) -> std::result::Result<(), ValidationError> {
    if from.team_id != to.team_id {
        return Err(ValidationError::Invalid(
            "ownership can only move within one team".to_string(),
        ));
    }
    if !from.is_active_owner() {
        return Err(ValidationError::Invalid(
            "only an active owner can transfer ownership".to_string(),
        ));
    }
    if !to.is_active() {
        return Err(ValidationError::Invalid(
            "ownership can only be transferred to an active member".to_string(),
        ));
    }
    to.role = Role::Owner;
    from.role = Role::Admin;
    Ok(())
}

/// Check a caller against the role matrix
///
/// `member` is `None` when the caller does not belong to the team at all.
/// `creator` is the user that created the post being acted on, if any.
pub fn authorize(
    member: Option<&Member>,
    capability: Capability,
    creator: Option<Uuid>,
) -> Result<()> {
    let member = member.ok_or_else(|| {
        TeamcastError::Authorization(format!("caller is not a team member and cannot {capability}"))
    })?;

    let is_creator = creator.is_some_and(|c| c == member.user_id);
    if permits(member.role, member.status, capability, is_creator) {
        Ok(())
    } else {
        Err(TeamcastError::Authorization(format!(
            "{} {} cannot {}",
            member.status.as_str(),
            member.role,
            capability
        )))
    }
}

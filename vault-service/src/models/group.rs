//! Application-scoped groups and their memberships.
//!
//! Groups form a forest through `parent_group_id`. [`GroupTree`] holds the
//! parent links for one application and refuses any re-parenting that would
//! make a group its own ancestor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use sqlx::FromRow;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Group {
    pub group_id: Uuid,
    pub application_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub organization: Option<String>,
    pub parent_group_id: Option<Uuid>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Group {
    pub fn new(input: CreateGroup) -> Self {
        let now = Utc::now();
        Self {
            group_id: Uuid::new_v4(),
            application_id: input.application_id,
            name: input.name,
            description: input.description,
            organization: input.organization,
            parent_group_id: input.parent_group_id,
            created_utc: now,
            updated_utc: now,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateGroup {
    pub application_id: Uuid,
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(length(max = 2550))]
    pub description: Option<String>,
    #[validate(url)]
    pub organization: Option<String>,
    pub parent_group_id: Option<Uuid>,
}

/// Parent links for the groups of one application.
#[derive(Debug, Default, Clone)]
pub struct GroupTree {
    parents: HashMap<Uuid, Option<Uuid>>,
}

impl GroupTree {
    pub fn from_groups<'a>(groups: impl IntoIterator<Item = &'a Group>) -> Self {
        Self {
            parents: groups
                .into_iter()
                .map(|g| (g.group_id, g.parent_group_id))
                .collect(),
        }
    }

    pub fn contains(&self, group_id: Uuid) -> bool {
        self.parents.contains_key(&group_id)
    }

    /// Ancestors of `group_id`, nearest first.
    pub fn ancestors(&self, group_id: Uuid) -> Vec<Uuid> {
        let mut chain = Vec::new();
        let mut seen = HashSet::from([group_id]);
        let mut current = self.parents.get(&group_id).copied().flatten();

        while let Some(parent) = current {
            if !seen.insert(parent) {
                break;
            }
            chain.push(parent);
            current = self.parents.get(&parent).copied().flatten();
        }
        chain
    }

    pub fn descendants(&self, group_id: Uuid) -> Vec<Uuid> {
        let mut found = Vec::new();
        let mut stack = vec![group_id];
        let mut seen = HashSet::from([group_id]);

        while let Some(node) = stack.pop() {
            for (&child, &parent) in &self.parents {
                if parent == Some(node) && seen.insert(child) {
                    found.push(child);
                    stack.push(child);
                }
            }
        }
        found
    }

    /// Insert a group or move it under `parent`.
    pub fn set_parent(&mut self, group_id: Uuid, parent: Option<Uuid>) -> Result<(), AppError> {
        if let Some(parent_id) = parent {
            if !self.contains(parent_id) {
                return Err(AppError::NotFound(anyhow::anyhow!(
                    "Parent group {} does not exist",
                    parent_id
                )));
            }
            if parent_id == group_id || self.ancestors(parent_id).contains(&group_id) {
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Group {} cannot be placed under its own descendant {}",
                    group_id,
                    parent_id
                )));
            }
        }
        self.parents.insert(group_id, parent);
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Membership {
    pub membership_id: Uuid,
    pub group_id: Uuid,
    pub user_url: String,
    pub date_invited: Option<DateTime<Utc>>,
    pub date_accepted_user: Option<DateTime<Utc>>,
    pub date_accepted_group: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptingParty {
    User,
    Group,
}

impl Membership {
    pub fn invite(group_id: Uuid, user_url: String, now: DateTime<Utc>) -> Self {
        Self {
            membership_id: Uuid::new_v4(),
            group_id,
            user_url,
            date_invited: Some(now),
            date_accepted_user: None,
            date_accepted_group: None,
            created_utc: now,
        }
    }

    /// Records acceptance; an earlier acceptance by the same party is kept.
    pub fn accept(&mut self, party: AcceptingParty, now: DateTime<Utc>) {
        let slot = match party {
            AcceptingParty::User => &mut self.date_accepted_user,
            AcceptingParty::Group => &mut self.date_accepted_group,
        };
        slot.get_or_insert(now);
    }

    pub fn is_active(&self) -> bool {
        self.date_accepted_user.is_some() && self.date_accepted_group.is_some()
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateMembership {
    #[validate(url, length(max = 255))]
    pub user_url: String,
}

//! Voice groups: membership, isolation flag, lifecycle.
//!
//! A participant is in at most one group. Empty non-permanent groups are
//! destroyed. Every membership change yields events: the group's new state to
//! its members, plus a roster delta for everyone.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::info;

use crate::errors::{ControlError, ControlResult};
use crate::events::ControlEvent;
use crate::ids::{GroupId, ParticipantId};
use crate::model::{GroupCreate, GroupState, GroupSummary, GroupView};

pub const MAX_GROUP_NAME_BYTES: usize = 32;

struct Group {
    id: GroupId,
    name: String,
    creator: ParticipantId,
    permanent: bool,
    isolated: bool,
    max_members: u16,
    members: Vec<ParticipantId>,
}

impl Group {
    fn state(&self) -> GroupState {
        GroupState {
            id: self.id,
            name: self.name.clone(),
            creator: self.creator,
            permanent: self.permanent,
            isolated: self.isolated,
            max_members: self.max_members,
            members: self.members.clone(),
        }
    }

    fn summary(&self) -> GroupSummary {
        GroupSummary {
            id: self.id,
            name: self.name.clone(),
            permanent: self.permanent,
            isolated: self.isolated,
            member_count: self.members.len() as u16,
            max_members: self.max_members,
        }
    }
}

#[derive(Default)]
struct Inner {
    groups: HashMap<GroupId, Group>,
    member_of: HashMap<ParticipantId, GroupId>,
}

impl Inner {
    fn summaries(&self) -> Vec<GroupSummary> {
        let mut v: Vec<_> = self.groups.values().map(Group::summary).collect();
        v.sort_by(|a, b| a.name.cmp(&b.name));
        v
    }
}

#[derive(Default)]
pub struct GroupManager {
    inner: RwLock<Inner>,
}

impl GroupManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(
        &self,
        requester: ParticipantId,
        create: GroupCreate,
    ) -> ControlResult<(GroupId, Vec<ControlEvent>)> {
        let name = create.name.trim();
        if name.is_empty() {
            return Err(ControlError::InvalidArgument("group name empty"));
        }
        if name.len() > MAX_GROUP_NAME_BYTES {
            return Err(ControlError::InvalidArgument("group name too long"));
        }

        let mut g = self.inner.write().await;
        if g.member_of.contains_key(&requester) {
            return Err(ControlError::FailedPrecondition("already in a group"));
        }

        let id = GroupId::new();
        let group = Group {
            id,
            name: name.to_string(),
            creator: requester,
            permanent: create.permanent,
            isolated: create.isolated,
            max_members: create.max_members,
            members: vec![requester],
        };
        info!(group = %id, creator = %requester, name, "group created");

        let state = group.state();
        g.groups.insert(id, group);
        g.member_of.insert(requester, id);

        let events = vec![
            ControlEvent::GroupStateChanged { state, recipients: vec![requester] },
            ControlEvent::GroupListChanged { groups: g.summaries() },
        ];
        Ok((id, events))
    }

    pub async fn join(
        &self,
        requester: ParticipantId,
        group_id: GroupId,
    ) -> ControlResult<Vec<ControlEvent>> {
        let mut g = self.inner.write().await;
        if g.member_of.contains_key(&requester) {
            return Err(ControlError::FailedPrecondition("already in a group"));
        }
        let group = g.groups.get_mut(&group_id).ok_or(ControlError::NotFound("group"))?;
        if group.max_members != 0 && group.members.len() >= group.max_members as usize {
            return Err(ControlError::ResourceExhausted("group full"));
        }
        group.members.push(requester);
        let state = group.state();
        let recipients = group.members.clone();
        g.member_of.insert(requester, group_id);

        Ok(vec![
            ControlEvent::GroupStateChanged { state, recipients },
            ControlEvent::GroupListChanged { groups: g.summaries() },
        ])
    }

    pub async fn leave(&self, requester: ParticipantId) -> ControlResult<Vec<ControlEvent>> {
        let mut g = self.inner.write().await;
        let group_id = g
            .member_of
            .remove(&requester)
            .ok_or(ControlError::FailedPrecondition("not in a group"))?;
        let group = g.groups.get_mut(&group_id).ok_or(ControlError::NotFound("group"))?;
        group.members.retain(|m| *m != requester);

        let mut events = Vec::new();
        if group.members.is_empty() && !group.permanent {
            info!(group = %group_id, "group empty, destroying");
            g.groups.remove(&group_id);
        } else {
            let state = group.state();
            let mut recipients = group.members.clone();
            recipients.push(requester);
            events.push(ControlEvent::GroupStateChanged { state, recipients });
        }
        events.push(ControlEvent::GroupListChanged { groups: g.summaries() });
        Ok(events)
    }

    /// Creator-only isolation toggle.
    pub async fn update_settings(
        &self,
        requester: ParticipantId,
        group_id: GroupId,
        isolated: bool,
    ) -> ControlResult<Vec<ControlEvent>> {
        let mut g = self.inner.write().await;
        let group = g.groups.get_mut(&group_id).ok_or(ControlError::NotFound("group"))?;
        if group.creator != requester {
            return Err(ControlError::PermissionDenied("not group creator"));
        }
        group.isolated = isolated;
        let state = group.state();
        let recipients = group.members.clone();
        Ok(vec![
            ControlEvent::GroupStateChanged { state, recipients },
            ControlEvent::GroupListChanged { groups: g.summaries() },
        ])
    }

    /// Session teardown path: like `leave`, but quiet about non-membership.
    pub async fn handle_departure(&self, participant: ParticipantId) -> Vec<ControlEvent> {
        match self.leave(participant).await {
            Ok(events) => events,
            Err(_) => vec![],
        }
    }

    pub async fn group_of(&self, participant: ParticipantId) -> Option<GroupView> {
        let g = self.inner.read().await;
        let id = *g.member_of.get(&participant)?;
        let group = g.groups.get(&id)?;
        Some(GroupView { id, isolated: group.isolated, members: group.members.clone() })
    }

    pub async fn state_of(&self, group_id: GroupId) -> Option<GroupState> {
        self.inner.read().await.groups.get(&group_id).map(Group::state)
    }

    pub async fn list(&self) -> Vec<GroupSummary> {
        self.inner.read().await.summaries()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create(name: &str) -> GroupCreate {
        GroupCreate { name: name.into(), permanent: false, isolated: false, max_members: 0 }
    }

    #[tokio::test]
    async fn creator_is_sole_member() {
        let mgr = GroupManager::new();
        let a = ParticipantId::new();
        let (id, events) = mgr.create(a, create("raid")).await.unwrap();
        assert_eq!(events.len(), 2);

        let view = mgr.group_of(a).await.unwrap();
        assert_eq!(view.id, id);
        assert_eq!(view.members, vec![a]);
    }

    #[tokio::test]
    async fn at_most_one_group_per_participant() {
        let mgr = GroupManager::new();
        let a = ParticipantId::new();
        let b = ParticipantId::new();
        let (id, _) = mgr.create(a, create("one")).await.unwrap();
        mgr.create(b, create("two")).await.unwrap();

        assert_eq!(
            mgr.join(b, id).await.unwrap_err(),
            ControlError::FailedPrecondition("already in a group")
        );
        assert_eq!(
            mgr.create(a, create("three")).await.unwrap_err(),
            ControlError::FailedPrecondition("already in a group")
        );
    }

    #[tokio::test]
    async fn join_rejected_when_full() {
        let mgr = GroupManager::new();
        let a = ParticipantId::new();
        let b = ParticipantId::new();
        let c = ParticipantId::new();
        let (id, _) = mgr
            .create(a, GroupCreate { name: "duo".into(), permanent: false, isolated: false, max_members: 2 })
            .await
            .unwrap();
        mgr.join(b, id).await.unwrap();
        assert_eq!(mgr.join(c, id).await.unwrap_err(), ControlError::ResourceExhausted("group full"));
    }

    #[tokio::test]
    async fn empty_non_permanent_group_destroyed() {
        let mgr = GroupManager::new();
        let a = ParticipantId::new();
        let (id, _) = mgr.create(a, create("gone")).await.unwrap();
        mgr.leave(a).await.unwrap();
        assert!(mgr.state_of(id).await.is_none());
        assert!(mgr.list().await.is_empty());
    }

    #[tokio::test]
    async fn empty_permanent_group_survives() {
        let mgr = GroupManager::new();
        let a = ParticipantId::new();
        let (id, _) = mgr
            .create(a, GroupCreate { name: "lobby".into(), permanent: true, isolated: false, max_members: 0 })
            .await
            .unwrap();
        mgr.leave(a).await.unwrap();
        assert!(mgr.state_of(id).await.is_some());
    }

    #[tokio::test]
    async fn settings_are_creator_only() {
        let mgr = GroupManager::new();
        let a = ParticipantId::new();
        let b = ParticipantId::new();
        let (id, _) = mgr.create(a, create("g")).await.unwrap();
        mgr.join(b, id).await.unwrap();

        assert_eq!(
            mgr.update_settings(b, id, true).await.unwrap_err(),
            ControlError::PermissionDenied("not group creator")
        );
        mgr.update_settings(a, id, true).await.unwrap();
        assert!(mgr.group_of(b).await.unwrap().isolated);
    }

    #[tokio::test]
    async fn leaver_still_gets_final_group_state() {
        let mgr = GroupManager::new();
        let a = ParticipantId::new();
        let b = ParticipantId::new();
        let (id, _) = mgr.create(a, create("g")).await.unwrap();
        mgr.join(b, id).await.unwrap();

        let events = mgr.leave(b).await.unwrap();
        let recipients = events
            .iter()
            .find_map(|e| match e {
                ControlEvent::GroupStateChanged { recipients, .. } => Some(recipients.clone()),
                _ => None,
            })
            .unwrap();
        assert!(recipients.contains(&a));
        assert!(recipients.contains(&b));
    }

    #[tokio::test]
    async fn name_validation() {
        let mgr = GroupManager::new();
        let a = ParticipantId::new();
        assert!(mgr.create(a, create("  ")).await.is_err());
        assert!(mgr.create(a, create(&"x".repeat(33))).await.is_err());
        assert!(mgr.create(a, create(&"x".repeat(32))).await.is_ok());
    }

    #[tokio::test]
    async fn departure_is_quiet_for_ungrouped() {
        let mgr = GroupManager::new();
        assert!(mgr.handle_departure(ParticipantId::new()).await.is_empty());
    }
}

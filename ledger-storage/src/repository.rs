//! Entity repository: the only writer of primary records.
//!
//! Every operation reads what it needs, builds one [`WriteBatch`] with its
//! item conditions and index deltas, and hands it to the maintenance engine.
//! All writes return the full post-write entity.

use std::sync::Arc;

use ledger_core::{
    Decision, DecisionId, DecisionParticipant, DecisionStatus, EntityKind, LedgerError,
    LedgerResult, MemberRole, NewDecision, NewProject, ParticipantRole, Project, ProjectId,
    ProjectMember, ProjectSettingsUpdate, ProjectStatus, SourceKind, Tag, TagName, TagTarget,
    UserId, KEY_SEPARATOR,
};

use crate::keys::{
    decision_partition, project_partition, IndexKey, IndexName, ItemKey, SortCondition,
    MEMBER_PREFIX, PARTICIPANT_PREFIX, TAG_PREFIX,
};
use crate::ledger::LedgerContext;
use crate::maintenance::{
    decision_entries, index_delta, index_puts, membership_entry, plan_status_change,
};
use crate::record::LedgerRecord;
use crate::retry::with_retry;
use crate::store::{Expect, PageRequest, WriteBatch};

/// Whether `error` reports that a freshly allocated id (or an item under it) already exists.
fn is_id_collision(error: &LedgerError, kind: EntityKind, id: &str) -> bool {
    match error {
        LedgerError::Conflict {
            kind: conflict_kind,
            id: conflict_id,
            ..
        } => {
            (*conflict_kind == kind && conflict_id == id)
                || conflict_id.starts_with(&format!("{}/", id))
        }
        _ => false,
    }
}

fn not_found(key: &ItemKey) -> LedgerError {
    LedgerError::NotFound {
        kind: key.kind(),
        id: key.id_string(),
    }
}

fn archived(project: &Project) -> LedgerError {
    LedgerError::InvalidState {
        kind: EntityKind::Project,
        id: project.id.to_string(),
        reason: "project is archived".to_string(),
    }
}

fn sort_prefix(prefix: &str) -> SortCondition {
    SortCondition::BeginsWith(format!("{}{}", prefix, KEY_SEPARATOR))
}

/// Entity repository handle. Cheap to clone.
#[derive(Clone)]
pub struct Repository {
    ctx: Arc<LedgerContext>,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository").finish_non_exhaustive()
    }
}

impl Repository {
    pub(crate) fn new(ctx: Arc<LedgerContext>) -> Self {
        Self { ctx }
    }

    async fn load<R: LedgerRecord>(&self, key: &ItemKey) -> LedgerResult<Option<R>> {
        self.ctx.maintenance.load(key).await
    }

    async fn require<R: LedgerRecord>(&self, key: &ItemKey) -> LedgerResult<R> {
        self.load(key).await?.ok_or_else(|| not_found(key))
    }

    async fn commit(&self, operation: &str, batch: WriteBatch) -> LedgerResult<()> {
        self.ctx.maintenance.commit(operation, batch).await.map(|_| ())
    }

    /// Every record of type `R` in one partition whose sort key matches `condition`.
    async fn scan_partition<R: LedgerRecord>(
        &self,
        partition: &str,
        condition: &SortCondition,
    ) -> LedgerResult<Vec<R>> {
        let store = self.ctx.maintenance.store();
        let retry = self.ctx.maintenance.retry_policy();
        let mut records = Vec::new();
        let mut cursor = None;
        loop {
            let request = PageRequest::default()
                .with_limit(self.ctx.config.scan_page_size)
                .after(cursor);
            let page =
                with_retry(retry, "query", || store.query(partition, condition, &request)).await?;
            for item in &page.items {
                records.push(R::from_stored(item)?);
            }
            match page.last_key {
                Some(last) => cursor = Some(last),
                None => return Ok(records),
            }
        }
    }

    fn id_attempts(&self) -> u32 {
        self.ctx.config.id_collision_retries + 1
    }

    // ========================================================================
    // PROJECTS
    // ========================================================================

    /// Create a project and its owner's membership in one atomic batch.
    pub async fn create_project(&self, new: NewProject) -> LedgerResult<Project> {
        new.validate()?;
        let attempts = self.id_attempts();
        for attempt in 1..=attempts {
            let now = self.ctx.now();
            let project = Project {
                id: ProjectId::from_uuid(self.ctx.ids.next_uuid()),
                name: new.name.clone(),
                description: new.description.clone(),
                owner_id: new.owner_id.clone(),
                status: ProjectStatus::Active,
                slack_channels: new.slack_channels.clone(),
                notification_channel: new.notification_channel.clone(),
                auto_confirm_meeting_decisions: new.auto_confirm_meeting_decisions,
                created_at: now,
                updated_at: now,
                version: 1,
            };
            let owner = ProjectMember {
                project_id: project.id,
                user_id: new.owner_id.clone(),
                role: MemberRole::Owner,
                joined_at: now,
                version: 1,
            };

            let mut batch = WriteBatch::new();
            batch
                .put(project.to_stored()?, Expect::Absent)
                .put(owner.to_stored()?, Expect::Absent)
                .extend_index(index_puts(vec![membership_entry(&owner, &project)?]));

            match self.commit("create_project", batch).await {
                Ok(()) => {
                    tracing::info!(
                        project_id = %project.id,
                        owner_id = %project.owner_id,
                        "Project created"
                    );
                    return Ok(project);
                }
                Err(e) if is_id_collision(&e, EntityKind::Project, &project.id.to_string()) => {
                    tracing::warn!(project_id = %project.id, attempt, "Project id collision, allocating a new id");
                }
                Err(e) => return Err(e),
            }
        }
        Err(LedgerError::DuplicateId {
            kind: EntityKind::Project,
            attempts,
        })
    }

    pub async fn get_project(&self, project_id: ProjectId) -> LedgerResult<Project> {
        self.require(&ItemKey::Project { project_id }).await
    }

    /// Apply a settings update and refresh the project snapshot in every member's GSI1 entry.
    pub async fn update_project_settings(
        &self,
        project_id: ProjectId,
        update: ProjectSettingsUpdate,
    ) -> LedgerResult<Project> {
        update.validate()?;
        let project = self.get_project(project_id).await?;
        if project.is_archived() {
            return Err(archived(&project));
        }
        if update.is_empty() {
            return Ok(project);
        }
        let mut updated = update.apply_to(&project);
        updated.updated_at = self.ctx.now().max(project.updated_at);
        updated.version = project.version + 1;
        self.rewrite_project("update_project_settings", &project, updated)
            .await
    }

    /// Soft-delete a project. Archiving an archived project returns it unchanged.
    pub async fn archive_project(&self, project_id: ProjectId) -> LedgerResult<Project> {
        let project = self.get_project(project_id).await?;
        if project.is_archived() {
            return Ok(project);
        }
        let mut updated = project.clone();
        updated.status = ProjectStatus::Archived;
        updated.updated_at = self.ctx.now().max(project.updated_at);
        updated.version = project.version + 1;
        let updated = self.rewrite_project("archive_project", &project, updated).await?;
        tracing::info!(project_id = %project_id, "Project archived");
        Ok(updated)
    }

    async fn rewrite_project(
        &self,
        operation: &str,
        current: &Project,
        updated: Project,
    ) -> LedgerResult<Project> {
        let members: Vec<ProjectMember> = self
            .scan_partition(&project_partition(&current.id), &sort_prefix(MEMBER_PREFIX))
            .await?;

        let mut batch = WriteBatch::new();
        batch.put(updated.to_stored()?, Expect::Version(current.version));
        for member in &members {
            let before = membership_entry(member, current)?;
            let after = membership_entry(member, &updated)?;
            batch
                .check(member.primary_key(), Expect::Version(member.version))
                .extend_index(index_delta(&[before], &[after]));
        }
        self.commit(operation, batch).await?;
        Ok(updated)
    }

    // ========================================================================
    // MEMBERS
    // ========================================================================

    /// Add a member. Re-adding with the same role returns the existing membership.
    pub async fn add_member(
        &self,
        project_id: ProjectId,
        user_id: UserId,
        role: MemberRole,
    ) -> LedgerResult<ProjectMember> {
        let project = self.get_project(project_id).await?;
        let key = ItemKey::Member {
            project_id,
            user_id: user_id.clone(),
        };
        if let Some(existing) = self.load::<ProjectMember>(&key).await? {
            return same_role(existing, role, &key);
        }
        if role == MemberRole::Owner {
            return Err(LedgerError::InvalidState {
                kind: EntityKind::ProjectMember,
                id: key.id_string(),
                reason: "the owner role is assigned when the project is created".to_string(),
            });
        }
        if project.is_archived() {
            return Err(archived(&project));
        }

        let member = ProjectMember {
            project_id,
            user_id,
            role,
            joined_at: self.ctx.now(),
            version: 1,
        };
        let mut batch = WriteBatch::new();
        batch
            .check(project.primary_key(), Expect::Version(project.version))
            .put(member.to_stored()?, Expect::Absent)
            .extend_index(index_puts(vec![membership_entry(&member, &project)?]));

        match self.commit("add_member", batch).await {
            Ok(()) => {
                tracing::info!(project_id = %project_id, user_id = %member.user_id, role = %role, "Member added");
                Ok(member)
            }
            // A concurrent add of the same membership is still idempotent.
            Err(e @ LedgerError::Conflict { .. }) => match self.load::<ProjectMember>(&key).await? {
                Some(existing) => same_role(existing, role, &key),
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    /// Change a non-owner member's role.
    pub async fn change_member_role(
        &self,
        project_id: ProjectId,
        user_id: UserId,
        role: MemberRole,
    ) -> LedgerResult<ProjectMember> {
        let project = self.get_project(project_id).await?;
        let key = ItemKey::Member { project_id, user_id };
        let member: ProjectMember = self.require(&key).await?;
        if member.role == MemberRole::Owner || role == MemberRole::Owner {
            return Err(LedgerError::InvalidState {
                kind: EntityKind::ProjectMember,
                id: key.id_string(),
                reason: "ownership cannot be moved by a role change".to_string(),
            });
        }
        if member.role == role {
            return Ok(member);
        }

        let mut updated = member.clone();
        updated.role = role;
        updated.version = member.version + 1;
        let mut batch = WriteBatch::new();
        batch
            .check(project.primary_key(), Expect::Version(project.version))
            .put(updated.to_stored()?, Expect::Version(member.version))
            .extend_index(index_delta(
                &[membership_entry(&member, &project)?],
                &[membership_entry(&updated, &project)?],
            ));
        self.commit("change_member_role", batch).await?;
        tracing::info!(project_id = %project_id, user_id = %updated.user_id, from = %member.role, to = %role, "Member role changed");
        Ok(updated)
    }

    /// Remove a membership and its GSI1 entry. The owner cannot be removed.
    pub async fn remove_member(
        &self,
        project_id: ProjectId,
        user_id: UserId,
    ) -> LedgerResult<Option<ProjectMember>> {
        let project = self.get_project(project_id).await?;
        let key = ItemKey::Member { project_id, user_id };
        let Some(member) = self.load::<ProjectMember>(&key).await? else {
            return Ok(None);
        };
        if member.role == MemberRole::Owner || member.user_id == project.owner_id {
            return Err(LedgerError::InvalidState {
                kind: EntityKind::ProjectMember,
                id: key.id_string(),
                reason: "the project owner cannot be removed".to_string(),
            });
        }

        let mut batch = WriteBatch::new();
        batch
            .delete(member.primary_key(), member.version)
            .delete_index(membership_entry(&member, &project)?.key);
        self.commit("remove_member", batch).await?;
        tracing::info!(project_id = %project_id, user_id = %member.user_id, "Member removed");
        Ok(Some(member))
    }

    pub async fn get_member(
        &self,
        project_id: ProjectId,
        user_id: UserId,
    ) -> LedgerResult<Option<ProjectMember>> {
        self.load(&ItemKey::Member { project_id, user_id }).await
    }

    /// Members of a project in user id order.
    pub async fn list_members(&self, project_id: ProjectId) -> LedgerResult<Vec<ProjectMember>> {
        self.get_project(project_id).await?;
        self.scan_partition(&project_partition(&project_id), &sort_prefix(MEMBER_PREFIX))
            .await
    }

    // ========================================================================
    // DECISIONS
    // ========================================================================

    /// Record a decision with its participants.
    ///
    /// A superseding decision moves its target to `superseded` in the same
    /// batch, guarded by the target's version. Meeting-sourced decisions start
    /// `confirmed` when the project auto-confirms them.
    pub async fn create_decision(&self, new: NewDecision) -> LedgerResult<Decision> {
        new.validate()?;
        let project = self.get_project(new.project_id).await?;
        if project.is_archived() {
            return Err(archived(&project));
        }
        let target = match new.supersedes_id {
            Some(target_id) => Some(self.supersede_target(&project, target_id).await?),
            None => None,
        };

        let meeting = new
            .source
            .as_ref()
            .is_some_and(|source| source.kind == SourceKind::Meeting);
        let status = if meeting && project.auto_confirm_meeting_decisions {
            DecisionStatus::Confirmed
        } else {
            DecisionStatus::Open
        };

        let attempts = self.id_attempts();
        for attempt in 1..=attempts {
            let now = self.ctx.now();
            if let Some(target) = &target {
                if now <= target.created_at {
                    return Err(LedgerError::InvalidState {
                        kind: EntityKind::Decision,
                        id: target.id.to_string(),
                        reason: "a successor must be recorded after the decision it supersedes"
                            .to_string(),
                    });
                }
            }

            let decision = Decision {
                id: DecisionId::from_uuid(self.ctx.ids.next_uuid()),
                project_id: project.id,
                title: new.title.clone(),
                body: new.body.clone(),
                raw_content: new.raw_content.clone(),
                status,
                supersedes_id: new.supersedes_id,
                author_id: new.author_id.clone(),
                source: new.source.clone(),
                created_at: now,
                updated_at: now,
                version: 1,
            };

            let mut batch = WriteBatch::new();
            batch.put(decision.to_stored()?, Expect::Absent);
            for spec in &new.participants {
                let participant = DecisionParticipant {
                    decision_id: decision.id,
                    user_id: spec.user_id.clone(),
                    role: spec.role,
                    added_at: now,
                    responded_at: None,
                    version: 1,
                };
                batch.put(participant.to_stored()?, Expect::Absent);
            }
            batch.extend_index(index_puts(decision_entries(&decision)?));
            if let Some(target) = &target {
                plan_status_change(target, DecisionStatus::Superseded, now)?.append_to(&mut batch)?;
            }

            match self.commit("create_decision", batch).await {
                Ok(()) => {
                    tracing::info!(
                        decision_id = %decision.id,
                        project_id = %decision.project_id,
                        status = %decision.status,
                        supersedes = ?decision.supersedes_id.map(|id| id.to_string()),
                        participants = new.participants.len(),
                        "Decision created"
                    );
                    return Ok(decision);
                }
                Err(e) if is_id_collision(&e, EntityKind::Decision, &decision.id.to_string()) => {
                    tracing::warn!(decision_id = %decision.id, attempt, "Decision id collision, allocating a new id");
                }
                Err(e) => return Err(e),
            }
        }
        Err(LedgerError::DuplicateId {
            kind: EntityKind::Decision,
            attempts,
        })
    }

    async fn supersede_target(
        &self,
        project: &Project,
        target_id: DecisionId,
    ) -> LedgerResult<Decision> {
        let key = ItemKey::Decision {
            decision_id: target_id,
        };
        let target: Decision = self.require(&key).await?;
        if target.project_id != project.id {
            return Err(not_found(&key));
        }
        if target.status == DecisionStatus::Superseded {
            return Err(LedgerError::InvalidState {
                kind: EntityKind::Decision,
                id: target_id.to_string(),
                reason: "decision is already superseded".to_string(),
            });
        }

        let store = self.ctx.maintenance.store();
        let index_key = IndexKey::supersedes(&target_id);
        let request = PageRequest::default().with_limit(1);
        let successors = with_retry(self.ctx.maintenance.retry_policy(), "query_index", || {
            store.query_index(
                IndexName::Supersedes,
                &index_key.partition,
                &SortCondition::All,
                &request,
            )
        })
        .await?;
        if !successors.items.is_empty() {
            return Err(LedgerError::InvalidState {
                kind: EntityKind::Decision,
                id: target_id.to_string(),
                reason: "decision already has a successor".to_string(),
            });
        }
        Ok(target)
    }

    /// Direct primary-key read. Linearizable against committed writes.
    pub async fn get_decision(&self, decision_id: DecisionId) -> LedgerResult<Decision> {
        self.require(&ItemKey::Decision { decision_id }).await
    }

    /// Move a decision to `new_status` from whatever version is current.
    pub async fn update_decision_status(
        &self,
        decision_id: DecisionId,
        new_status: DecisionStatus,
    ) -> LedgerResult<Decision> {
        let current = self.get_decision(decision_id).await?;
        self.apply_status(current, new_status).await
    }

    /// Move a decision to `new_status` only if it is still at `expected_version`.
    pub async fn update_decision_status_at(
        &self,
        decision_id: DecisionId,
        expected_version: u64,
        new_status: DecisionStatus,
    ) -> LedgerResult<Decision> {
        let current = self.get_decision(decision_id).await?;
        if current.version != expected_version {
            return Err(LedgerError::Conflict {
                kind: EntityKind::Decision,
                id: decision_id.to_string(),
                reason: format!(
                    "expected version {}, found {}",
                    expected_version, current.version
                ),
            });
        }
        self.apply_status(current, new_status).await
    }

    async fn apply_status(
        &self,
        current: Decision,
        new_status: DecisionStatus,
    ) -> LedgerResult<Decision> {
        let plan = plan_status_change(&current, new_status, self.ctx.now())?;
        let mut batch = WriteBatch::new();
        plan.append_to(&mut batch)?;
        self.commit("update_decision_status", batch).await?;
        tracing::info!(
            decision_id = %current.id,
            from = %current.status,
            to = %new_status,
            version = plan.decision.version,
            "Decision status changed"
        );
        Ok(plan.decision)
    }

    // ========================================================================
    // PARTICIPANTS
    // ========================================================================

    /// Attach a participant. Re-adding with the same role returns the existing record.
    pub async fn add_participant(
        &self,
        decision_id: DecisionId,
        user_id: UserId,
        role: ParticipantRole,
    ) -> LedgerResult<DecisionParticipant> {
        self.get_decision(decision_id).await?;
        let key = ItemKey::Participant {
            decision_id,
            user_id: user_id.clone(),
        };
        if let Some(existing) = self.load::<DecisionParticipant>(&key).await? {
            return same_participant_role(existing, role, &key);
        }
        let participant = DecisionParticipant {
            decision_id,
            user_id,
            role,
            added_at: self.ctx.now(),
            responded_at: None,
            version: 1,
        };
        let mut batch = WriteBatch::new();
        batch.put(participant.to_stored()?, Expect::Absent);
        match self.commit("add_participant", batch).await {
            Ok(()) => Ok(participant),
            Err(e @ LedgerError::Conflict { .. }) => {
                match self.load::<DecisionParticipant>(&key).await? {
                    Some(existing) => same_participant_role(existing, role, &key),
                    None => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Stamp the time a participant responded. The first response wins.
    pub async fn record_participant_response(
        &self,
        decision_id: DecisionId,
        user_id: UserId,
    ) -> LedgerResult<DecisionParticipant> {
        let key = ItemKey::Participant {
            decision_id,
            user_id,
        };
        let participant: DecisionParticipant = self.require(&key).await?;
        if participant.responded_at.is_some() {
            return Ok(participant);
        }
        let mut updated = participant.clone();
        updated.responded_at = Some(self.ctx.now());
        updated.version = participant.version + 1;
        let mut batch = WriteBatch::new();
        batch.put(updated.to_stored()?, Expect::Version(participant.version));
        self.commit("record_participant_response", batch).await?;
        Ok(updated)
    }

    pub async fn list_participants(
        &self,
        decision_id: DecisionId,
    ) -> LedgerResult<Vec<DecisionParticipant>> {
        self.get_decision(decision_id).await?;
        self.scan_partition(
            &decision_partition(&decision_id),
            &sort_prefix(PARTICIPANT_PREFIX),
        )
        .await
    }

    // ========================================================================
    // TAGS
    // ========================================================================

    async fn require_target(&self, target: TagTarget) -> LedgerResult<()> {
        match target {
            TagTarget::Project(project_id) => self.get_project(project_id).await.map(|_| ()),
            TagTarget::Decision(decision_id) => self.get_decision(decision_id).await.map(|_| ()),
        }
    }

    /// Tag a project or decision. Idempotent.
    pub async fn add_tag(&self, target: TagTarget, name: TagName) -> LedgerResult<Tag> {
        self.require_target(target).await?;
        let key = ItemKey::Tag {
            target,
            name: name.clone(),
        };
        if let Some(existing) = self.load::<Tag>(&key).await? {
            return Ok(existing);
        }
        let tag = Tag {
            target,
            name,
            created_at: self.ctx.now(),
            version: 1,
        };
        let mut batch = WriteBatch::new();
        batch.put(tag.to_stored()?, Expect::Absent);
        match self.commit("add_tag", batch).await {
            Ok(()) => Ok(tag),
            Err(e @ LedgerError::Conflict { .. }) => self.load::<Tag>(&key).await?.ok_or(e),
            Err(e) => Err(e),
        }
    }

    /// Remove a tag, returning it if it existed. Idempotent.
    pub async fn remove_tag(&self, target: TagTarget, name: TagName) -> LedgerResult<Option<Tag>> {
        let key = ItemKey::Tag { target, name };
        let Some(tag) = self.load::<Tag>(&key).await? else {
            return Ok(None);
        };
        let mut batch = WriteBatch::new();
        batch.delete(tag.primary_key(), tag.version);
        match self.commit("remove_tag", batch).await {
            Ok(()) => Ok(Some(tag)),
            Err(LedgerError::Conflict { .. }) if self.load::<Tag>(&key).await?.is_none() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Tags of a project or decision in name order.
    pub async fn list_tags(&self, target: TagTarget) -> LedgerResult<Vec<Tag>> {
        let partition = match &target {
            TagTarget::Project(id) => project_partition(id),
            TagTarget::Decision(id) => decision_partition(id),
        };
        self.scan_partition(&partition, &sort_prefix(TAG_PREFIX)).await
    }
}

fn same_role(existing: ProjectMember, role: MemberRole, key: &ItemKey) -> LedgerResult<ProjectMember> {
    if existing.role == role {
        Ok(existing)
    } else {
        Err(LedgerError::Conflict {
            kind: EntityKind::ProjectMember,
            id: key.id_string(),
            reason: format!("already a member with role {}", existing.role),
        })
    }
}

fn same_participant_role(
    existing: DecisionParticipant,
    role: ParticipantRole,
    key: &ItemKey,
) -> LedgerResult<DecisionParticipant> {
    if existing.role == role {
        Ok(existing)
    } else {
        Err(LedgerError::Conflict {
            kind: EntityKind::DecisionParticipant,
            id: key.id_string(),
            reason: format!("already a participant with role {}", existing.role),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_collision_matches_items_under_the_new_id() {
        let id = ProjectId::new().to_string();
        let conflict = |kind, id: String| LedgerError::Conflict {
            kind,
            id,
            reason: "exists at version 1".to_string(),
        };
        assert!(is_id_collision(&conflict(EntityKind::Project, id.clone()), EntityKind::Project, &id));
        assert!(is_id_collision(
            &conflict(EntityKind::ProjectMember, format!("{id}/U001")),
            EntityKind::Project,
            &id
        ));
        assert!(!is_id_collision(
            &conflict(EntityKind::Project, ProjectId::new().to_string()),
            EntityKind::Project,
            &id
        ));
        assert!(!is_id_collision(
            &LedgerError::NotFound { kind: EntityKind::Project, id: id.clone() },
            EntityKind::Project,
            &id
        ));
    }
}

//! Owner-safe membership reconciliation.
//!
//! A reconciliation turns the current members/owners of one group or channel
//! plus a desired delta into up to five strictly ordered phases:
//!
//! 1. owner and member removals
//! 2. in-place role changes (promotions and demotions)
//! 3. owner and member additions
//! 4. a deferred owner removal
//! 5. a deferred owner addition
//!
//! Graph refuses to drop the last owner of an entity and caps the number of
//! owners. When a delta would remove every current owner, one removal is
//! held back until the new owners exist, and one addition is held back until
//! after that removal so the cap is not overshot.
//!
//! Planning is pure. Execution submits each phase through the
//! [`BatchExecutor`](crate::batch::BatchExecutor) and stops at the first
//! failing phase; completed phases stay committed.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::batch::{BatchExecutor, BatchOptions, BatchReport};
use crate::operation::{GraphRequest, Operation};
use crate::{GraphResult, GraphSyncError};

const DEFAULT_GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";
const CONVERSATION_MEMBER_TYPE: &str = "#microsoft.graph.aadUserConversationMember";

/// Role of a principal on a group or channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    /// Regular member.
    Member,
    /// Owner; at least one must remain and the count is capped.
    Owner,
}

impl MemberRole {
    /// Lower-case role name as used by Graph.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Member => "member",
            Self::Owner => "owner",
        }
    }
}

impl fmt::Display for MemberRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current membership of one entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipState {
    /// Ids holding the member role.
    pub members: BTreeSet<String>,
    /// Ids holding the owner role.
    pub owners: BTreeSet<String>,
}

impl MembershipState {
    /// Builds a state from member and owner ids; duplicates collapse.
    pub fn new<M, O>(members: M, owners: O) -> Self
    where
        M: IntoIterator,
        M::Item: Into<String>,
        O: IntoIterator,
        O::Item: Into<String>,
    {
        Self {
            members: members.into_iter().map(Into::into).collect(),
            owners: owners.into_iter().map(Into::into).collect(),
        }
    }

    /// Number of current owners.
    #[must_use]
    pub fn owner_count(&self) -> usize {
        self.owners.len()
    }

    /// Applies one operation as the directory would once it commits.
    pub fn apply(&mut self, operation: &MembershipOperation) {
        match operation {
            MembershipOperation::Add { user_id, role } => {
                self.role_set_mut(*role).insert(user_id.clone());
            }
            MembershipOperation::Remove { user_id, role } => {
                self.role_set_mut(*role).remove(user_id);
            }
            MembershipOperation::ChangeRole { user_id, to } => {
                let from = match to {
                    MemberRole::Owner => MemberRole::Member,
                    MemberRole::Member => MemberRole::Owner,
                };
                self.role_set_mut(from).remove(user_id);
                self.role_set_mut(*to).insert(user_id.clone());
            }
        }
    }

    fn role_set_mut(&mut self, role: MemberRole) -> &mut BTreeSet<String> {
        match role {
            MemberRole::Member => &mut self.members,
            MemberRole::Owner => &mut self.owners,
        }
    }
}

/// Desired change to one entity's membership.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipDelta {
    /// Ids to add as members.
    #[serde(default)]
    pub member_adds: Vec<String>,
    /// Ids to remove as members.
    #[serde(default)]
    pub member_deletes: Vec<String>,
    /// Ids to add as owners.
    #[serde(default)]
    pub owner_adds: Vec<String>,
    /// Ids to remove as owners.
    #[serde(default)]
    pub owner_deletes: Vec<String>,
}

impl MembershipDelta {
    /// Whether the delta asks for no change at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.member_adds.is_empty()
            && self.member_deletes.is_empty()
            && self.owner_adds.is_empty()
            && self.owner_deletes.is_empty()
    }
}

/// One planned membership change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipOperation {
    /// Grants `role` to an id that does not hold it.
    Add { user_id: String, role: MemberRole },
    /// Takes `role` away.
    Remove { user_id: String, role: MemberRole },
    /// Switches an existing channel member to `to` in place.
    ChangeRole { user_id: String, to: MemberRole },
}

impl MembershipOperation {
    /// Directory id of the principal.
    #[must_use]
    pub fn user_id(&self) -> &str {
        match self {
            Self::Add { user_id, .. }
            | Self::Remove { user_id, .. }
            | Self::ChangeRole { user_id, .. } => user_id,
        }
    }

    /// Batch correlation id, unique within a reconciliation.
    #[must_use]
    pub fn correlation_id(&self) -> String {
        match self {
            Self::Add { user_id, role } => format!("add-{role}-{user_id}"),
            Self::Remove { user_id, role } => format!("remove-{role}-{user_id}"),
            Self::ChangeRole {
                user_id,
                to: MemberRole::Owner,
            } => format!("promote-{user_id}"),
            Self::ChangeRole {
                user_id,
                to: MemberRole::Member,
            } => format!("demote-{user_id}"),
        }
    }

    /// `Some(true)` when the operation grants ownership, `Some(false)` when it
    /// revokes it.
    fn owner_effect(&self) -> Option<bool> {
        match self {
            Self::Add {
                role: MemberRole::Owner,
                ..
            }
            | Self::ChangeRole {
                to: MemberRole::Owner,
                ..
            } => Some(true),
            Self::Remove {
                role: MemberRole::Owner,
                ..
            }
            | Self::ChangeRole {
                to: MemberRole::Member,
                ..
            } => Some(false),
            _ => None,
        }
    }

    fn build_request(&self, target: &dyn MembershipRequests) -> GraphResult<GraphRequest> {
        match self {
            Self::Add { user_id, role } => target.add(user_id, *role),
            Self::Remove { user_id, role } => target.remove(user_id, *role),
            Self::ChangeRole { user_id, to } => target.change_role(user_id, *to),
        }
    }
}

/// Execution phases, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PlanPhase {
    /// Owner and member removals.
    Removals,
    /// In-place promotions and demotions.
    RoleChanges,
    /// Owner and member additions.
    Additions,
    /// The last original owner leaving.
    DeferredRemoval,
    /// The addition held back until that owner left.
    DeferredAddition,
}

impl PlanPhase {
    /// Snake-case phase name used in logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Removals => "removals",
            Self::RoleChanges => "role_changes",
            Self::Additions => "additions",
            Self::DeferredRemoval => "deferred_removal",
            Self::DeferredAddition => "deferred_addition",
        }
    }
}

impl fmt::Display for PlanPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A non-empty phase of a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedPhase {
    /// Position of the phase in the reconciliation order.
    pub phase: PlanPhase,
    /// Operations in submission order.
    pub operations: Vec<MembershipOperation>,
    /// Operations before this index go out in a batch that must settle
    /// before the rest are sent.
    pub split_at: Option<usize>,
    /// Worst-case (lowest, highest) owner count while the phase runs.
    pub owner_bounds: (usize, usize),
    /// Owner count once the phase has committed.
    pub owners_after: usize,
}

impl PlannedPhase {
    /// Operations grouped into the batches that are submitted one after
    /// another.
    #[must_use]
    pub fn sub_batches(&self) -> Vec<&[MembershipOperation]> {
        match self.split_at {
            Some(at) => vec![&self.operations[..at], &self.operations[at..]],
            None => vec![self.operations.as_slice()],
        }
    }

    /// Suppression options for the phase's batch: deletes tolerate 404,
    /// adds tolerate "already exists", role changes tolerate nothing.
    #[must_use]
    pub fn batch_options(&self) -> BatchOptions {
        let all = |pred: fn(&MembershipOperation) -> bool| self.operations.iter().all(pred);
        if all(|op| matches!(op, MembershipOperation::Remove { .. })) {
            BatchOptions::deletes()
        } else if all(|op| matches!(op, MembershipOperation::Add { .. })) {
            BatchOptions::adds()
        } else {
            BatchOptions::default()
        }
    }
}

/// Ordered, validated reconciliation plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationPlan {
    phases: Vec<PlannedPhase>,
    final_state: MembershipState,
}

impl ReconciliationPlan {
    /// Non-empty phases in execution order.
    #[must_use]
    pub fn phases(&self) -> &[PlannedPhase] {
        &self.phases
    }

    /// The planned phase of the given kind, if any.
    #[must_use]
    pub fn phase(&self, phase: PlanPhase) -> Option<&PlannedPhase> {
        self.phases.iter().find(|p| p.phase == phase)
    }

    /// Membership once every phase has committed.
    #[must_use]
    pub fn final_state(&self) -> &MembershipState {
        &self.final_state
    }

    /// Whether the plan sends nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    /// Total operations across all phases.
    #[must_use]
    pub fn operation_count(&self) -> usize {
        self.phases.iter().map(|p| p.operations.len()).sum()
    }
}

/// Builds the Graph requests that change one entity's membership.
pub trait MembershipRequests: Send + Sync {
    /// Id of the group or channel, for logs and reports.
    fn target_id(&self) -> &str;

    /// Whether a member can become an owner (and back) in place.
    fn supports_role_update(&self) -> bool;

    fn add(&self, user_id: &str, role: MemberRole) -> GraphResult<GraphRequest>;

    fn remove(&self, user_id: &str, role: MemberRole) -> GraphResult<GraphRequest>;

    fn change_role(&self, user_id: &str, to: MemberRole) -> GraphResult<GraphRequest>;
}

/// Security or Microsoft 365 group. Members and owners are independent
/// reference collections.
#[derive(Debug, Clone)]
pub struct GroupMembership {
    group_id: String,
    base_url: String,
}

impl GroupMembership {
    /// Targets the group with the given id.
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            base_url: DEFAULT_GRAPH_BASE_URL.to_string(),
        }
    }

    /// Sets the API root used in `@odata.id` references.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn collection(role: MemberRole) -> &'static str {
        match role {
            MemberRole::Member => "members",
            MemberRole::Owner => "owners",
        }
    }
}

impl MembershipRequests for GroupMembership {
    fn target_id(&self) -> &str {
        &self.group_id
    }

    fn supports_role_update(&self) -> bool {
        false
    }

    fn add(&self, user_id: &str, role: MemberRole) -> GraphResult<GraphRequest> {
        Ok(GraphRequest::post(
            format!("/groups/{}/{}/$ref", self.group_id, Self::collection(role)),
            json!({ "@odata.id": format!("{}/directoryObjects/{}", self.base_url, user_id) }),
        ))
    }

    fn remove(&self, user_id: &str, role: MemberRole) -> GraphResult<GraphRequest> {
        Ok(GraphRequest::delete(format!(
            "/groups/{}/{}/{}/$ref",
            self.group_id,
            Self::collection(role),
            user_id
        )))
    }

    fn change_role(&self, _user_id: &str, _to: MemberRole) -> GraphResult<GraphRequest> {
        Err(GraphSyncError::InvalidArgument(format!(
            "group {} does not support in-place role changes",
            self.group_id
        )))
    }
}

/// Teams channel. Owners are members carrying the `owner` role, and
/// existing memberships are addressed by their conversation-member id.
#[derive(Debug, Clone)]
pub struct ChannelMembership {
    team_id: String,
    channel_id: String,
    membership_ids: HashMap<String, String>,
    base_url: String,
}

impl ChannelMembership {
    /// `membership_ids` maps user id to conversation-member id for the
    /// channel's current members.
    pub fn new<I, K, V>(
        team_id: impl Into<String>,
        channel_id: impl Into<String>,
        membership_ids: I,
    ) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            team_id: team_id.into(),
            channel_id: channel_id.into(),
            membership_ids: membership_ids
                .into_iter()
                .map(|(user, membership)| (user.into(), membership.into()))
                .collect(),
            base_url: DEFAULT_GRAPH_BASE_URL.to_string(),
        }
    }

    /// Overrides the API root used in `user@odata.bind` values.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn members_url(&self) -> String {
        format!(
            "/teams/{}/channels/{}/members",
            self.team_id, self.channel_id
        )
    }

    fn membership_url(&self, user_id: &str) -> GraphResult<String> {
        let membership_id = self.membership_ids.get(user_id).ok_or_else(|| {
            GraphSyncError::InvalidArgument(format!(
                "no channel membership known for user {user_id} in channel {}",
                self.channel_id
            ))
        })?;
        Ok(format!("{}/{}", self.members_url(), membership_id))
    }

    fn roles(role: MemberRole) -> serde_json::Value {
        match role {
            MemberRole::Owner => json!(["owner"]),
            MemberRole::Member => json!([]),
        }
    }
}

impl MembershipRequests for ChannelMembership {
    fn target_id(&self) -> &str {
        &self.channel_id
    }

    fn supports_role_update(&self) -> bool {
        true
    }

    fn add(&self, user_id: &str, role: MemberRole) -> GraphResult<GraphRequest> {
        Ok(GraphRequest::post(
            self.members_url(),
            json!({
                "@odata.type": CONVERSATION_MEMBER_TYPE,
                "roles": Self::roles(role),
                "user@odata.bind": format!("{}/users('{}')", self.base_url, user_id),
            }),
        ))
    }

    fn remove(&self, user_id: &str, _role: MemberRole) -> GraphResult<GraphRequest> {
        Ok(GraphRequest::delete(self.membership_url(user_id)?))
    }

    fn change_role(&self, user_id: &str, to: MemberRole) -> GraphResult<GraphRequest> {
        Ok(GraphRequest::patch(
            self.membership_url(user_id)?,
            json!({
                "@odata.type": CONVERSATION_MEMBER_TYPE,
                "roles": Self::roles(to),
            }),
        ))
    }
}

/// Outcome of one executed phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseReport {
    /// Phase that ran.
    pub phase: PlanPhase,
    /// Batch outcome, merged across sub-batches.
    pub batch: BatchReport,
}

/// Outcome of an executed reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationReport {
    /// Id of the reconciled group or channel.
    pub target_id: String,
    /// Executed phases, in order.
    pub phases: Vec<PhaseReport>,
}

fn normalize(ids: &[String], list: &str) -> GraphResult<Vec<String>> {
    let mut seen = HashSet::with_capacity(ids.len());
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        if id.trim().is_empty() {
            return Err(GraphSyncError::InvalidDelta(format!("empty id in {list}")));
        }
        if seen.insert(id.as_str()) {
            out.push(id.clone());
        }
    }
    Ok(out)
}

fn reject_overlap(adds: &[String], deletes: &[String], role: MemberRole) -> GraphResult<()> {
    let deletes: HashSet<&str> = deletes.iter().map(String::as_str).collect();
    match adds.iter().find(|id| deletes.contains(id.as_str())) {
        Some(id) => Err(GraphSyncError::InvalidDelta(format!(
            "{id} is both added and removed as {role}"
        ))),
        None => Ok(()),
    }
}

/// Plans the order-safe phases that take `state` to the state described by
/// `delta`.
///
/// Without in-place role updates (groups), a member promoted to owner is
/// removed as member in the removals phase and added as owner in the
/// additions phase, so the id holds neither role between the two.
///
/// With role updates (channels), demotions go out in a first batch ahead of
/// the promotions whenever sending them together could pass `max_owners`.
///
/// # Errors
///
/// `InvalidDelta` for contradictory deltas; `InvariantViolation` when the
/// final owner set, or any phase's worst-case owner count, would leave
/// `[1, max_owners]` (the floor is 0 for an entity without owners).
pub fn plan_reconciliation(
    state: &MembershipState,
    delta: &MembershipDelta,
    supports_role_update: bool,
    max_owners: usize,
) -> GraphResult<ReconciliationPlan> {
    let mut member_adds = normalize(&delta.member_adds, "member_adds")?;
    let mut member_deletes = normalize(&delta.member_deletes, "member_deletes")?;
    let mut owner_adds = normalize(&delta.owner_adds, "owner_adds")?;
    let mut owner_deletes = normalize(&delta.owner_deletes, "owner_deletes")?;
    reject_overlap(&member_adds, &member_deletes, MemberRole::Member)?;
    reject_overlap(&owner_adds, &owner_deletes, MemberRole::Owner)?;

    let mut final_owners = state.owners.clone();
    for id in &owner_deletes {
        final_owners.remove(id);
    }
    final_owners.extend(owner_adds.iter().cloned());

    if !state.owners.is_empty() && final_owners.is_empty() {
        return Err(GraphSyncError::InvariantViolation(
            "reconciliation would leave the entity without owners".into(),
        ));
    }
    if final_owners.len() > max_owners {
        return Err(GraphSyncError::InvariantViolation(format!(
            "{} owners requested, maximum is {max_owners}",
            final_owners.len()
        )));
    }

    let mut promotions = Vec::new();
    let mut demotions = Vec::new();
    if supports_role_update {
        let removed_members: HashSet<String> = member_deletes.iter().cloned().collect();
        let added_members: HashSet<String> = member_adds.iter().cloned().collect();
        promotions = owner_adds
            .iter()
            .filter(|id| removed_members.contains(*id))
            .cloned()
            .collect();
        demotions = owner_deletes
            .iter()
            .filter(|id| added_members.contains(*id))
            .cloned()
            .collect();

        let promoted: HashSet<&String> = promotions.iter().collect();
        let demoted: HashSet<&String> = demotions.iter().collect();
        owner_adds.retain(|id| !promoted.contains(id));
        member_deletes.retain(|id| !promoted.contains(id));
        owner_deletes.retain(|id| !demoted.contains(id));
        member_adds.retain(|id| !demoted.contains(id));
    }

    let mut deferred_removal = None;
    let mut deferred_addition = None;
    let draining = !state.owners.is_empty()
        && state
            .owners
            .iter()
            .all(|id| owner_deletes.contains(id) || demotions.contains(id));

    if draining {
        let original = &state.owners;
        if let Some(pos) = owner_deletes.iter().position(|id| original.contains(id)) {
            deferred_removal = Some(MembershipOperation::Remove {
                user_id: owner_deletes.remove(pos),
                role: MemberRole::Owner,
            });
        } else if let Some(pos) = demotions.iter().position(|id| original.contains(id)) {
            deferred_removal = Some(MembershipOperation::ChangeRole {
                user_id: demotions.remove(pos),
                to: MemberRole::Member,
            });
        }

        // With a single final owner the add must land before the deferred
        // removal, otherwise the count would touch zero in between.
        if deferred_removal.is_some() && final_owners.len() >= 2 {
            if let Some(pos) = owner_adds.iter().position(|id| !original.contains(id)) {
                deferred_addition = Some(MembershipOperation::Add {
                    user_id: owner_adds.remove(pos),
                    role: MemberRole::Owner,
                });
            } else if let Some(pos) = promotions.iter().position(|id| !original.contains(id)) {
                deferred_addition = Some(MembershipOperation::ChangeRole {
                    user_id: promotions.remove(pos),
                    to: MemberRole::Owner,
                });
            }
        }
    }

    let removals: Vec<MembershipOperation> = owner_deletes
        .into_iter()
        .map(|user_id| MembershipOperation::Remove {
            user_id,
            role: MemberRole::Owner,
        })
        .chain(member_deletes.into_iter().map(|user_id| MembershipOperation::Remove {
            user_id,
            role: MemberRole::Member,
        }))
        .collect();
    let role_changes: Vec<MembershipOperation> = promotions
        .into_iter()
        .map(|user_id| MembershipOperation::ChangeRole {
            user_id,
            to: MemberRole::Owner,
        })
        .chain(demotions.into_iter().map(|user_id| MembershipOperation::ChangeRole {
            user_id,
            to: MemberRole::Member,
        }))
        .collect();
    let additions: Vec<MembershipOperation> = owner_adds
        .into_iter()
        .map(|user_id| MembershipOperation::Add {
            user_id,
            role: MemberRole::Owner,
        })
        .chain(member_adds.into_iter().map(|user_id| MembershipOperation::Add {
            user_id,
            role: MemberRole::Member,
        }))
        .collect();

    let candidates: [(PlanPhase, Vec<MembershipOperation>); 5] = [
        (PlanPhase::Removals, removals),
        (PlanPhase::RoleChanges, role_changes),
        (PlanPhase::Additions, additions),
        (PlanPhase::DeferredRemoval, deferred_removal.into_iter().collect()),
        (PlanPhase::DeferredAddition, deferred_addition.into_iter().collect()),
    ];

    let floor = usize::from(!state.owners.is_empty());
    let ceiling = max_owners.max(state.owners.len());
    let mut simulated = state.clone();
    let mut phases = Vec::new();

    for (phase, operations) in candidates {
        if operations.is_empty() {
            continue;
        }

        let mut operations = operations;
        let mut split_at = None;
        let mut bounds = owner_bounds(&simulated, &operations);
        if bounds.1 > ceiling && phase == PlanPhase::RoleChanges {
            // Demote in a first sub-batch so promotions land on a smaller owner set.
            let (revocations, grants): (Vec<_>, Vec<_>) = operations
                .into_iter()
                .partition(|op| op.owner_effect() == Some(false));
            let first = owner_bounds(&simulated, &revocations);
            let mut demoted = simulated.clone();
            for op in &revocations {
                demoted.apply(op);
            }
            let second = owner_bounds(&demoted, &grants);
            bounds = (first.0.min(second.0), first.1.max(second.1));
            if !revocations.is_empty() && !grants.is_empty() {
                split_at = Some(revocations.len());
            }
            operations = revocations.into_iter().chain(grants).collect();
        }
        if bounds.0 < floor || bounds.1 > ceiling {
            return Err(GraphSyncError::InvariantViolation(format!(
                "phase {phase} could reach {} to {} owners, allowed range is {floor} to {ceiling}",
                bounds.0, bounds.1
            )));
        }

        for op in &operations {
            simulated.apply(op);
        }
        phases.push(PlannedPhase {
            phase,
            operations,
            split_at,
            owner_bounds: bounds,
            owners_after: simulated.owner_count(),
        });
    }

    Ok(ReconciliationPlan {
        phases,
        final_state: simulated,
    })
}

/// Lowest and highest owner count reachable while one batch commits its
/// items in any order.
fn owner_bounds(state: &MembershipState, operations: &[MembershipOperation]) -> (usize, usize) {
    let mut lowest = state.owners.clone();
    let mut highest = state.owners.clone();
    for op in operations {
        match op.owner_effect() {
            Some(false) => {
                lowest.remove(op.user_id());
            }
            Some(true) => {
                highest.insert(op.user_id().to_string());
            }
            None => {}
        }
    }
    (lowest.len(), highest.len())
}

/// Plans and executes membership reconciliations.
#[derive(Debug, Clone)]
pub struct MembershipReconciler {
    batch: BatchExecutor,
    max_owners: usize,
}

impl MembershipReconciler {
    /// Creates a reconciler enforcing `max_owners` per entity.
    #[must_use]
    pub fn new(batch: BatchExecutor, max_owners: usize) -> Self {
        Self { batch, max_owners }
    }

    /// Owner cap applied when planning.
    #[must_use]
    pub fn max_owners(&self) -> usize {
        self.max_owners
    }

    /// Plans the reconciliation for `target` without touching the network.
    pub fn plan(
        &self,
        target: &dyn MembershipRequests,
        state: &MembershipState,
        delta: &MembershipDelta,
    ) -> GraphResult<ReconciliationPlan> {
        plan_reconciliation(state, delta, target.supports_role_update(), self.max_owners)
    }

    /// Runs `plan` phase by phase.
    ///
    /// Every request is built before the first phase is sent, so a request
    /// the target cannot express fails the reconciliation without side
    /// effects.
    #[instrument(skip(self, target, plan, cancel), fields(entity = target.target_id()))]
    pub async fn execute(
        &self,
        target: &dyn MembershipRequests,
        plan: &ReconciliationPlan,
        cancel: &CancellationToken,
    ) -> GraphResult<ReconciliationReport> {
        let mut batches = Vec::with_capacity(plan.phases().len());
        for phase in plan.phases() {
            let mut sub_batches = Vec::new();
            for ops in phase.sub_batches() {
                let operations = ops
                    .iter()
                    .map(|op| -> GraphResult<Operation> {
                        Ok(Operation::from_request(op.correlation_id(), op.build_request(target)?))
                    })
                    .collect::<GraphResult<Vec<_>>>()?;
                sub_batches.push(operations);
            }
            batches.push((phase.phase, phase.batch_options(), sub_batches));
        }

        let mut report = ReconciliationReport {
            target_id: target.target_id().to_string(),
            phases: Vec::with_capacity(batches.len()),
        };

        for (phase, options, sub_batches) in batches {
            info!(
                %phase,
                operations = sub_batches.iter().map(Vec::len).sum::<usize>(),
                sub_batches = sub_batches.len(),
                "Starting reconciliation phase"
            );
            let mut batch = BatchReport::default();
            for operations in sub_batches {
                batch.merge(self.batch.submit(operations, options, cancel).await?);
            }
            info!(
                %phase,
                completed = batch.completed(),
                passes = batch.passes,
                "Reconciliation phase complete"
            );
            report.phases.push(PhaseReport { phase, batch });
        }

        debug!(phases = report.phases.len(), "Reconciliation complete");
        Ok(report)
    }

    /// Plans and executes in one call.
    pub async fn reconcile(
        &self,
        target: &dyn MembershipRequests,
        state: &MembershipState,
        delta: &MembershipDelta,
        cancel: &CancellationToken,
    ) -> GraphResult<ReconciliationReport> {
        let plan = self.plan(target, state, delta)?;
        if plan.is_empty() {
            debug!(entity = target.target_id(), "Nothing to reconcile");
            return Ok(ReconciliationReport {
                target_id: target.target_id().to_string(),
                phases: Vec::new(),
            });
        }
        self.execute(target, &plan, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{prefix}{i}")).collect()
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| (*s).to_string()).collect()
    }

    fn phase_kinds(plan: &ReconciliationPlan) -> Vec<PlanPhase> {
        plan.phases().iter().map(|p| p.phase).collect()
    }

    #[test]
    fn test_simple_delta_single_phases() {
        let state = MembershipState::new(["m1", "m2"], ["o1"]);
        let delta = MembershipDelta {
            member_adds: strings(&["m3"]),
            member_deletes: strings(&["m1"]),
            ..Default::default()
        };

        let plan = plan_reconciliation(&state, &delta, false, 100).unwrap();
        assert_eq!(
            phase_kinds(&plan),
            vec![PlanPhase::Removals, PlanPhase::Additions]
        );
        assert_eq!(
            plan.final_state(),
            &MembershipState::new(["m2", "m3"], ["o1"])
        );
        assert_eq!(plan.phases()[0].batch_options(), BatchOptions::deletes());
        assert_eq!(plan.phases()[1].batch_options(), BatchOptions::adds());
    }

    #[test]
    fn test_role_swap_at_owner_cap_demotes_first() {
        let owners = ids("o", 100);
        let state = MembershipState::new(["m1"], owners.clone());
        let delta = MembershipDelta {
            member_deletes: strings(&["m1"]),
            owner_adds: strings(&["m1"]),
            owner_deletes: strings(&["o0"]),
            member_adds: strings(&["o0"]),
        };

        let plan = plan_reconciliation(&state, &delta, true, 100).unwrap();
        assert_eq!(phase_kinds(&plan), vec![PlanPhase::RoleChanges]);

        let phase = &plan.phases()[0];
        assert_eq!(phase.split_at, Some(1));
        assert_eq!(phase.owner_bounds, (99, 100));
        assert_eq!(
            phase.sub_batches(),
            vec![
                &[MembershipOperation::ChangeRole {
                    user_id: "o0".into(),
                    to: MemberRole::Member
                }][..],
                &[MembershipOperation::ChangeRole {
                    user_id: "m1".into(),
                    to: MemberRole::Owner
                }][..],
            ]
        );
        assert!(plan.final_state().owners.contains("m1"));
        assert!(plan.final_state().members.contains("o0"));
        assert_eq!(plan.final_state().owner_count(), 100);
    }

    #[test]
    fn test_empty_delta_yields_empty_plan() {
        let state = MembershipState::new(["m1"], ["o1"]);
        let plan = plan_reconciliation(&state, &MembershipDelta::default(), true, 100).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.operation_count(), 0);
    }

    #[test]
    fn test_role_transitions_become_single_updates() {
        let state = MembershipState::new(["m1", "m2"], ["o1", "o2"]);
        let delta = MembershipDelta {
            member_deletes: strings(&["m1"]),
            owner_adds: strings(&["m1"]),
            owner_deletes: strings(&["o2"]),
            member_adds: strings(&["o2"]),
        };

        let plan = plan_reconciliation(&state, &delta, true, 100).unwrap();
        assert_eq!(phase_kinds(&plan), vec![PlanPhase::RoleChanges]);
        assert_eq!(
            plan.phases()[0].operations,
            vec![
                MembershipOperation::ChangeRole {
                    user_id: "m1".into(),
                    to: MemberRole::Owner
                },
                MembershipOperation::ChangeRole {
                    user_id: "o2".into(),
                    to: MemberRole::Member
                },
            ]
        );
        assert_eq!(plan.phases()[0].split_at, None);
        assert_eq!(plan.phases()[0].batch_options(), BatchOptions::default());
        assert_eq!(
            plan.final_state(),
            &MembershipState::new(["m2", "o2"], ["o1", "m1"])
        );
    }

    #[test]
    fn test_groups_keep_independent_lists() {
        let state = MembershipState::new(["m1"], ["o1"]);
        let delta = MembershipDelta {
            member_deletes: strings(&["m1"]),
            owner_adds: strings(&["m1"]),
            ..Default::default()
        };

        let plan = plan_reconciliation(&state, &delta, false, 100).unwrap();
        assert_eq!(
            phase_kinds(&plan),
            vec![PlanPhase::Removals, PlanPhase::Additions]
        );
        assert!(plan.phase(PlanPhase::RoleChanges).is_none());
    }

    #[test]
    fn test_full_owner_swap_defers_pair() {
        let old = ids("old-", 100);
        let new = ids("new-", 100);
        let state = MembershipState::new(Vec::<String>::new(), old.clone());
        let delta = MembershipDelta {
            owner_adds: new.clone(),
            owner_deletes: old.clone(),
            ..Default::default()
        };

        let plan = plan_reconciliation(&state, &delta, false, 100).unwrap();
        assert_eq!(
            phase_kinds(&plan),
            vec![
                PlanPhase::Removals,
                PlanPhase::Additions,
                PlanPhase::DeferredRemoval,
                PlanPhase::DeferredAddition,
            ]
        );
        assert_eq!(
            plan.phase(PlanPhase::DeferredRemoval).unwrap().operations,
            vec![MembershipOperation::Remove {
                user_id: "old-0".into(),
                role: MemberRole::Owner
            }]
        );
        assert_eq!(
            plan.phase(PlanPhase::DeferredAddition).unwrap().operations,
            vec![MembershipOperation::Add {
                user_id: "new-0".into(),
                role: MemberRole::Owner
            }]
        );

        let counts: Vec<usize> = plan.phases().iter().map(|p| p.owners_after).collect();
        assert_eq!(counts, vec![1, 100, 99, 100]);
        for phase in plan.phases() {
            assert!(phase.owner_bounds.0 >= 1);
            assert!(phase.owner_bounds.1 <= 100);
        }
        assert_eq!(
            plan.final_state().owners,
            new.into_iter().collect::<BTreeSet<_>>()
        );
    }

    #[test]
    fn test_single_owner_swap_adds_before_deferred_removal() {
        let state = MembershipState::new(Vec::<String>::new(), ["a"]);
        let delta = MembershipDelta {
            owner_adds: strings(&["b"]),
            owner_deletes: strings(&["a"]),
            ..Default::default()
        };

        let plan = plan_reconciliation(&state, &delta, false, 100).unwrap();
        assert_eq!(
            phase_kinds(&plan),
            vec![PlanPhase::Additions, PlanPhase::DeferredRemoval]
        );
        let counts: Vec<usize> = plan.phases().iter().map(|p| p.owners_after).collect();
        assert_eq!(counts, vec![2, 1]);
    }

    #[test]
    fn test_single_owner_swap_refused_when_cap_is_one() {
        let state = MembershipState::new(Vec::<String>::new(), ["a"]);
        let delta = MembershipDelta {
            owner_adds: strings(&["b"]),
            owner_deletes: strings(&["a"]),
            ..Default::default()
        };

        assert!(matches!(
            plan_reconciliation(&state, &delta, false, 1),
            Err(GraphSyncError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_sole_owner_demotion_is_deferred() {
        let state = MembershipState::new(["m1"], ["o1"]);
        let delta = MembershipDelta {
            member_deletes: strings(&["m1"]),
            owner_adds: strings(&["m1"]),
            owner_deletes: strings(&["o1"]),
            member_adds: strings(&["o1"]),
        };

        let plan = plan_reconciliation(&state, &delta, true, 100).unwrap();
        assert_eq!(
            phase_kinds(&plan),
            vec![PlanPhase::RoleChanges, PlanPhase::DeferredRemoval]
        );
        let deferred = plan.phase(PlanPhase::DeferredRemoval).unwrap();
        assert_eq!(
            deferred.operations,
            vec![MembershipOperation::ChangeRole {
                user_id: "o1".into(),
                to: MemberRole::Member
            }]
        );
        assert_eq!(deferred.batch_options(), BatchOptions::default());
    }

    #[test]
    fn test_same_id_added_and_deleted_rejected() {
        let state = MembershipState::default();
        let delta = MembershipDelta {
            member_adds: strings(&["x"]),
            member_deletes: strings(&["x"]),
            ..Default::default()
        };
        assert!(matches!(
            plan_reconciliation(&state, &delta, true, 100),
            Err(GraphSyncError::InvalidDelta(_))
        ));

        let delta = MembershipDelta {
            owner_adds: strings(&[" "]),
            ..Default::default()
        };
        assert!(matches!(
            plan_reconciliation(&state, &delta, true, 100),
            Err(GraphSyncError::InvalidDelta(_))
        ));
    }

    #[test]
    fn test_removing_every_owner_rejected() {
        let state = MembershipState::new(Vec::<String>::new(), ["o1", "o2"]);
        let delta = MembershipDelta {
            owner_deletes: strings(&["o1", "o2"]),
            ..Default::default()
        };
        assert!(matches!(
            plan_reconciliation(&state, &delta, false, 100),
            Err(GraphSyncError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_exceeding_owner_cap_rejected() {
        let state = MembershipState::new(Vec::<String>::new(), ids("o", 99));
        let delta = MembershipDelta {
            owner_adds: ids("n", 2),
            ..Default::default()
        };
        assert!(matches!(
            plan_reconciliation(&state, &delta, false, 100),
            Err(GraphSyncError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_ownerless_entity_may_stay_ownerless() {
        let state = MembershipState::new(["m1"], Vec::<String>::new());
        let delta = MembershipDelta {
            member_deletes: strings(&["m1"]),
            ..Default::default()
        };
        let plan = plan_reconciliation(&state, &delta, false, 100).unwrap();
        assert_eq!(plan.final_state(), &MembershipState::default());
    }

    #[test]
    fn test_duplicate_ids_collapse() {
        let state = MembershipState::default();
        let delta = MembershipDelta {
            member_adds: strings(&["a", "b", "a"]),
            ..Default::default()
        };
        let plan = plan_reconciliation(&state, &delta, false, 100).unwrap();
        assert_eq!(plan.operation_count(), 2);
    }

    #[test]
    fn test_correlation_ids() {
        let add = MembershipOperation::Add {
            user_id: "u1".into(),
            role: MemberRole::Owner,
        };
        let remove = MembershipOperation::Remove {
            user_id: "u1".into(),
            role: MemberRole::Member,
        };
        let promote = MembershipOperation::ChangeRole {
            user_id: "u1".into(),
            to: MemberRole::Owner,
        };
        assert_eq!(add.correlation_id(), "add-owner-u1");
        assert_eq!(remove.correlation_id(), "remove-member-u1");
        assert_eq!(promote.correlation_id(), "promote-u1");
    }

    #[test]
    fn test_group_requests() {
        let group = GroupMembership::new("g1").with_base_url("https://graph.microsoft.us/v1.0/");
        let add = group.add("u1", MemberRole::Owner).unwrap();
        assert_eq!(add.url, "/groups/g1/owners/$ref");
        assert_eq!(
            add.body.unwrap(),
            json!({"@odata.id": "https://graph.microsoft.us/v1.0/directoryObjects/u1"})
        );

        let remove = group.remove("u1", MemberRole::Member).unwrap();
        assert_eq!(remove.url, "/groups/g1/members/u1/$ref");
        assert!(group.change_role("u1", MemberRole::Owner).is_err());
        assert!(!group.supports_role_update());
    }

    #[test]
    fn test_channel_requests() {
        let channel = ChannelMembership::new("t1", "c1", [("u1", "mem-1")]);
        assert!(channel.supports_role_update());

        let promote = channel.change_role("u1", MemberRole::Owner).unwrap();
        assert_eq!(promote.url, "/teams/t1/channels/c1/members/mem-1");
        assert_eq!(promote.body.unwrap()["roles"], json!(["owner"]));

        let add = channel.add("u2", MemberRole::Member).unwrap();
        assert_eq!(add.url, "/teams/t1/channels/c1/members");
        assert_eq!(
            add.body.unwrap()["user@odata.bind"],
            "https://graph.microsoft.com/v1.0/users('u2')"
        );

        assert!(matches!(
            channel.remove("unknown", MemberRole::Member),
            Err(GraphSyncError::InvalidArgument(_))
        ));
    }
}

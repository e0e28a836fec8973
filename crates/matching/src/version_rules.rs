// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 Shahzad A. Bhatti <bhatti@plexobject.com>
//
// This file is part of Kairos.
//
// Kairos is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// Kairos is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with Kairos. If not, see <https://www.gnu.org/licenses/>.

//! Pure version-rules engine.
//!
//! ## Purpose
//! Referentially transparent transformations over a versioning-data document:
//! ordered assignment rules gating new work behind ramps, and redirect rules
//! forming an acyclic compatibility graph for work already running on a
//! source build. No I/O happens here; callers supply the hybrid-logical
//! clock used for create/delete stamps and any facts that require lookups
//! (recent pollers).
//!
//! ## Tombstones
//! Deleted rules are stamped with a delete timestamp and retained until
//! [`cleanup_tombstones`] removes those older than the retention. Index
//! arguments always refer to positions among *active* rules.

use kairos_core::{BuildId, HybridClock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Ramp value meaning "all unrouted traffic".
pub const FULL_RAMP: f32 = 100.0;

/// Ordered rule mapping new work to a target build id, optionally gated by a
/// percentage ramp. Unramped rules are stored as ramp 100.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentRule {
    /// Build id receiving matched work.
    pub target_build_id: BuildId,
    /// Percentage of new work in `[0, 100]`.
    pub ramp_percentage: f32,
    /// Creation stamp.
    pub create_timestamp: HybridClock,
    /// Deletion stamp; `None` while active.
    pub delete_timestamp: Option<HybridClock>,
}

impl AssignmentRule {
    /// Whether the rule is active (not tombstoned).
    pub fn is_active(&self) -> bool {
        self.delete_timestamp.is_none()
    }

    /// Whether the rule routes all unrouted traffic.
    pub fn is_fully_ramped(&self) -> bool {
        self.ramp_percentage >= FULL_RAMP
    }
}

/// Mapping from a source build id to a compatible target for workflows
/// already running on source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedirectRule {
    /// Build id being redirected away from.
    pub source_build_id: BuildId,
    /// Compatible build id receiving the work.
    pub target_build_id: BuildId,
    /// Creation stamp.
    pub create_timestamp: HybridClock,
    /// Deletion stamp; `None` while active.
    pub delete_timestamp: Option<HybridClock>,
}

impl RedirectRule {
    /// Whether the rule is active (not tombstoned).
    pub fn is_active(&self) -> bool {
        self.delete_timestamp.is_none()
    }
}

/// The versioning-data document for one task queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersioningData {
    /// Ordered assignment rules (active and tombstoned interleaved).
    pub assignment_rules: Vec<AssignmentRule>,
    /// Redirect rules (active and tombstoned).
    pub redirect_rules: Vec<RedirectRule>,
    /// Legacy version sets; their member build ids are off limits to rules.
    pub version_sets: Vec<Vec<BuildId>>,
}

impl VersioningData {
    /// Active assignment rules in order.
    pub fn active_assignment_rules(&self) -> impl Iterator<Item = &AssignmentRule> {
        self.assignment_rules.iter().filter(|r| r.is_active())
    }

    /// Active redirect rules.
    pub fn active_redirect_rules(&self) -> impl Iterator<Item = &RedirectRule> {
        self.redirect_rules.iter().filter(|r| r.is_active())
    }

    fn is_in_version_set(&self, build_id: &str) -> bool {
        self.version_sets
            .iter()
            .any(|set| set.iter().any(|member| member == build_id))
    }
}

/// Rule-operation failures. Messages carry the offending counts for
/// precondition failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuleError {
    /// Too many active assignment rules.
    #[error("exceeds max assignment rules: have {have}, max {max}")]
    ExceedsMaxAssignmentRules {
        /// Active count the operation would produce.
        have: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Too many active redirect rules.
    #[error("exceeds max redirect rules: have {have}, max {max}")]
    ExceedsMaxRedirectRules {
        /// Active count the operation would produce.
        have: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Upstream chain behind a redirect target grew too long.
    #[error("exceeds max upstream build ids: have {have}, max {max}")]
    ExceedsMaxUpstreamBuildIds {
        /// Upstream build-id count behind the target.
        have: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The rule's target is a member of a legacy version set.
    #[error("target build id is a version set member")]
    TargetIsVersionSetMember,

    /// The rule's source is a member of a legacy version set.
    #[error("source build id is a version set member")]
    SourceIsVersionSetMember,

    /// A partially-ramped assignment rule's target may not also be a
    /// redirect-rule source.
    #[error("partially-ramped assignment rule target is the source of a redirect rule")]
    PartiallyRampedRuleIsRedirectSource,

    /// Negative rule index.
    #[error("rule index may not be negative")]
    InvalidNegativeIndex,

    /// Ramp outside `[0, 100]`.
    #[error("ramp percentage must be within [0, 100]")]
    InvalidRampPercentage,

    /// Index beyond the active-rule list.
    #[error("rule index {index} out of bounds for list of length {len}")]
    IndexOutOfBounds {
        /// Requested index.
        index: i32,
        /// Active-rule count.
        len: usize,
    },

    /// The operation would leave no fully-ramped assignment rule.
    #[error("update would leave no fully-ramped assignment rule")]
    RequireFullyRamped,

    /// The redirect source already has an active rule.
    #[error("source build id already redirects: {0}")]
    SourceAlreadyExists(String),

    /// No active redirect rule with the given source.
    #[error("no active redirect rule found with source build id {0}")]
    SourceNotFound(String),

    /// Redirect target is empty.
    #[error("target build id is empty")]
    TargetEmpty,

    /// The candidate redirect graph contains a cycle.
    #[error("update creates a cycle in the redirect rules")]
    CreatesCycle,

    /// Commit requires a recent poller on the target build.
    #[error("no recent poller seen for target build id {0}")]
    NoRecentPollerOnCommitTarget(String),
}

/// Result alias for rule operations.
pub type RuleResult = Result<VersioningData, RuleError>;

fn validate_ramp(ramp: f32) -> Result<f32, RuleError> {
    if !(0.0..=FULL_RAMP).contains(&ramp) {
        return Err(RuleError::InvalidRampPercentage);
    }
    Ok(ramp)
}

// Physical index of the idx-th active assignment rule.
fn physical_assignment_index(data: &VersioningData, index: i32) -> Result<usize, RuleError> {
    let active_count = data.active_assignment_rules().count();
    if index < 0 || index as usize >= active_count {
        return Err(RuleError::IndexOutOfBounds {
            index,
            len: active_count,
        });
    }
    let mut remaining = index;
    for (physical, rule) in data.assignment_rules.iter().enumerate() {
        if rule.is_active() {
            if remaining == 0 {
                return Ok(physical);
            }
            remaining -= 1;
        }
    }
    Err(RuleError::IndexOutOfBounds {
        index,
        len: active_count,
    })
}

fn check_assignment_target(
    data: &VersioningData,
    target: &str,
    ramp: f32,
) -> Result<(), RuleError> {
    if data.is_in_version_set(target) {
        return Err(RuleError::TargetIsVersionSetMember);
    }
    if ramp < FULL_RAMP
        && data
            .active_redirect_rules()
            .any(|r| r.source_build_id == target)
    {
        return Err(RuleError::PartiallyRampedRuleIsRedirectSource);
    }
    Ok(())
}

/// Whether the active rules contain at least one fully-ramped rule.
pub fn contains_fully_ramped<'a>(rules: impl IntoIterator<Item = &'a AssignmentRule>) -> bool {
    rules.into_iter().any(|r| r.is_fully_ramped())
}

/// Insert an assignment rule at `index` among the active rules. An index
/// past the end appends.
pub fn insert_assignment_rule(
    clock: HybridClock,
    data: &VersioningData,
    target: BuildId,
    ramp_percentage: Option<f32>,
    index: i32,
    max_rules: usize,
) -> RuleResult {
    if index < 0 {
        return Err(RuleError::InvalidNegativeIndex);
    }
    let ramp = validate_ramp(ramp_percentage.unwrap_or(FULL_RAMP))?;
    check_assignment_target(data, &target, ramp)?;

    let active_count = data.active_assignment_rules().count();
    if active_count + 1 > max_rules {
        return Err(RuleError::ExceedsMaxAssignmentRules {
            have: active_count + 1,
            max: max_rules,
        });
    }

    let rule = AssignmentRule {
        target_build_id: target,
        ramp_percentage: ramp,
        create_timestamp: clock,
        delete_timestamp: None,
    };

    let mut next = data.clone();
    let physical = if (index as usize) >= active_count {
        next.assignment_rules.len()
    } else {
        physical_assignment_index(&next, index)?
    };
    next.assignment_rules.insert(physical, rule);
    Ok(next)
}

/// Replace the active rule at `index`: tombstone the old rule and insert the
/// new one at the same position.
pub fn replace_assignment_rule(
    clock: HybridClock,
    data: &VersioningData,
    target: BuildId,
    ramp_percentage: Option<f32>,
    index: i32,
    force: bool,
) -> RuleResult {
    let ramp = validate_ramp(ramp_percentage.unwrap_or(FULL_RAMP))?;
    check_assignment_target(data, &target, ramp)?;
    let physical = physical_assignment_index(data, index)?;

    let mut next = data.clone();
    let had_fully_ramped = contains_fully_ramped(next.active_assignment_rules());
    next.assignment_rules[physical].delete_timestamp = Some(clock);
    next.assignment_rules.insert(
        physical,
        AssignmentRule {
            target_build_id: target,
            ramp_percentage: ramp,
            create_timestamp: clock,
            delete_timestamp: None,
        },
    );
    if !force && had_fully_ramped && !contains_fully_ramped(next.active_assignment_rules()) {
        return Err(RuleError::RequireFullyRamped);
    }
    Ok(next)
}

/// Tombstone the active rule at `index`.
pub fn delete_assignment_rule(
    clock: HybridClock,
    data: &VersioningData,
    index: i32,
    force: bool,
) -> RuleResult {
    let physical = physical_assignment_index(data, index)?;
    let mut next = data.clone();
    let had_fully_ramped = contains_fully_ramped(next.active_assignment_rules());
    next.assignment_rules[physical].delete_timestamp = Some(clock);
    if !force && had_fully_ramped && !contains_fully_ramped(next.active_assignment_rules()) {
        return Err(RuleError::RequireFullyRamped);
    }
    Ok(next)
}

/// Commit a build id: tombstone every active assignment rule and append one
/// fully-ramped rule for `target`.
pub fn commit_build_id(
    clock: HybridClock,
    data: &VersioningData,
    target: BuildId,
    force: bool,
    has_recent_poller: bool,
    max_rules: usize,
) -> RuleResult {
    if data.is_in_version_set(&target) {
        return Err(RuleError::TargetIsVersionSetMember);
    }
    if !force && !has_recent_poller {
        return Err(RuleError::NoRecentPollerOnCommitTarget(target));
    }
    if max_rules < 1 {
        return Err(RuleError::ExceedsMaxAssignmentRules {
            have: 1,
            max: max_rules,
        });
    }

    let mut next = data.clone();
    for rule in next.assignment_rules.iter_mut() {
        if rule.is_active() {
            rule.delete_timestamp = Some(clock);
        }
    }
    next.assignment_rules.push(AssignmentRule {
        target_build_id: target,
        ramp_percentage: FULL_RAMP,
        create_timestamp: clock,
        delete_timestamp: None,
    });
    Ok(next)
}

fn check_redirect_target(data: &VersioningData, rule_target: &str) -> Result<(), RuleError> {
    if rule_target.is_empty() {
        return Err(RuleError::TargetEmpty);
    }
    if data.is_in_version_set(rule_target) {
        return Err(RuleError::TargetIsVersionSetMember);
    }
    Ok(())
}

fn check_redirect_source(data: &VersioningData, source: &str) -> Result<(), RuleError> {
    if data.is_in_version_set(source) {
        return Err(RuleError::SourceIsVersionSetMember);
    }
    // The mirror of the assignment-side constraint: a build receiving a
    // partial ramp cannot simultaneously be redirected away from.
    if data
        .active_assignment_rules()
        .any(|r| !r.is_fully_ramped() && r.target_build_id == source)
    {
        return Err(RuleError::PartiallyRampedRuleIsRedirectSource);
    }
    Ok(())
}

fn check_candidate_graph(
    candidate_active: &[RedirectRule],
    new_target: &str,
    max_upstream: usize,
) -> Result<(), RuleError> {
    if is_cyclic(candidate_active) {
        return Err(RuleError::CreatesCycle);
    }
    let upstream = get_upstream_build_ids(new_target, candidate_active);
    if upstream.len() > max_upstream {
        return Err(RuleError::ExceedsMaxUpstreamBuildIds {
            have: upstream.len(),
            max: max_upstream,
        });
    }
    Ok(())
}

/// Add a redirect rule.
pub fn add_redirect_rule(
    clock: HybridClock,
    data: &VersioningData,
    source: BuildId,
    target: BuildId,
    max_rules: usize,
    max_upstream: usize,
) -> RuleResult {
    check_redirect_source(data, &source)?;
    check_redirect_target(data, &target)?;
    if data
        .active_redirect_rules()
        .any(|r| r.source_build_id == source)
    {
        return Err(RuleError::SourceAlreadyExists(source));
    }
    let active_count = data.active_redirect_rules().count();
    if active_count + 1 > max_rules {
        return Err(RuleError::ExceedsMaxRedirectRules {
            have: active_count + 1,
            max: max_rules,
        });
    }

    let rule = RedirectRule {
        source_build_id: source,
        target_build_id: target.clone(),
        create_timestamp: clock,
        delete_timestamp: None,
    };
    let mut candidate: Vec<RedirectRule> = data.active_redirect_rules().cloned().collect();
    candidate.push(rule.clone());
    check_candidate_graph(&candidate, &target, max_upstream)?;

    let mut next = data.clone();
    next.redirect_rules.push(rule);
    Ok(next)
}

/// Replace the active redirect rule with the given source.
pub fn replace_redirect_rule(
    clock: HybridClock,
    data: &VersioningData,
    source: BuildId,
    target: BuildId,
    max_upstream: usize,
) -> RuleResult {
    check_redirect_target(data, &target)?;
    if !data
        .active_redirect_rules()
        .any(|r| r.source_build_id == source)
    {
        return Err(RuleError::SourceNotFound(source));
    }

    let replacement = RedirectRule {
        source_build_id: source.clone(),
        target_build_id: target.clone(),
        create_timestamp: clock,
        delete_timestamp: None,
    };
    let candidate: Vec<RedirectRule> = data
        .active_redirect_rules()
        .map(|r| {
            if r.source_build_id == source {
                replacement.clone()
            } else {
                r.clone()
            }
        })
        .collect();
    check_candidate_graph(&candidate, &target, max_upstream)?;

    let mut next = data.clone();
    for rule in next.redirect_rules.iter_mut() {
        if rule.is_active() && rule.source_build_id == source {
            rule.delete_timestamp = Some(clock);
        }
    }
    next.redirect_rules.push(replacement);
    Ok(next)
}

/// Tombstone the active redirect rule with the given source.
pub fn delete_redirect_rule(
    clock: HybridClock,
    data: &VersioningData,
    source: &str,
) -> RuleResult {
    let mut next = data.clone();
    let mut found = false;
    for rule in next.redirect_rules.iter_mut() {
        if rule.is_active() && rule.source_build_id == source {
            rule.delete_timestamp = Some(clock);
            found = true;
        }
    }
    if !found {
        return Err(RuleError::SourceNotFound(source.to_string()));
    }
    Ok(next)
}

/// Remove tombstoned rules whose delete stamp is older than
/// `now_ms - retention_ms`. Purely time-driven and idempotent.
pub fn cleanup_tombstones(data: &VersioningData, now_ms: i64, retention_ms: i64) -> VersioningData {
    let cutoff = now_ms - retention_ms;
    let mut next = data.clone();
    next.assignment_rules.retain(|rule| match &rule.delete_timestamp {
        Some(ts) => ts.wall_clock_ms >= cutoff,
        None => true,
    });
    next.redirect_rules.retain(|rule| match &rule.delete_timestamp {
        Some(ts) => ts.wall_clock_ms >= cutoff,
        None => true,
    });
    next
}

/// Whether the active redirect edges contain a cycle. Classic DFS with a
/// three-color marking over the adjacency lists.
pub fn is_cyclic(rules: &[RedirectRule]) -> bool {
    let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
    for rule in rules {
        edges
            .entry(rule.source_build_id.as_str())
            .or_default()
            .push(rule.target_build_id.as_str());
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }
    let mut marks: HashMap<&str, Mark> = HashMap::new();

    fn visit<'a>(
        node: &'a str,
        edges: &HashMap<&'a str, Vec<&'a str>>,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> bool {
        match marks.get(node) {
            Some(Mark::Visiting) => return true,
            Some(Mark::Done) => return false,
            None => {}
        }
        marks.insert(node, Mark::Visiting);
        if let Some(targets) = edges.get(node) {
            for target in targets {
                if visit(target, edges, marks) {
                    return true;
                }
            }
        }
        marks.insert(node, Mark::Done);
        false
    }

    let sources: Vec<&str> = edges.keys().copied().collect();
    for source in sources {
        if visit(source, &edges, &mut marks) {
            return true;
        }
    }
    false
}

/// Walk active redirects from `source` until a build with no outgoing edge.
/// Returns the empty string if the walk enters a cycle.
pub fn find_terminal_build_id(source: &str, rules: &[RedirectRule]) -> String {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut current = source;
    loop {
        if !visited.insert(current) {
            return String::new();
        }
        match rules
            .iter()
            .filter(|r| r.is_active())
            .find(|r| r.source_build_id == current)
        {
            Some(rule) => current = rule.target_build_id.as_str(),
            None => return current.to_string(),
        }
    }
}

/// All build ids that can reach `target` through active redirects
/// (cycle-safe reverse reachability; `target` itself is excluded).
pub fn get_upstream_build_ids(target: &str, rules: &[RedirectRule]) -> Vec<BuildId> {
    let mut upstream = Vec::new();
    let mut visited: HashSet<String> = HashSet::new();
    visited.insert(target.to_string());
    let mut frontier = vec![target.to_string()];
    while let Some(node) = frontier.pop() {
        for rule in rules.iter().filter(|r| r.is_active()) {
            if rule.target_build_id == node && !visited.contains(&rule.source_build_id) {
                visited.insert(rule.source_build_id.clone());
                upstream.push(rule.source_build_id.clone());
                frontier.push(rule.source_build_id.clone());
            }
        }
    }
    upstream
}

/// Evaluate the ordered active assignment rules against a ramp draw in
/// `[0, 100)`. The first matching rule wins.
pub fn evaluate_assignment_rules(data: &VersioningData, ramp_draw: f32) -> Option<BuildId> {
    for rule in data.active_assignment_rules() {
        if rule.is_fully_ramped() || ramp_draw < rule.ramp_percentage {
            return Some(rule.target_build_id.clone());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const IGNORE_MAX: usize = 1000;

    fn clock() -> HybridClock {
        HybridClock::zero(1)
    }

    fn later_clock() -> HybridClock {
        HybridClock {
            wall_clock_ms: 1_000,
            logical: 0,
            cluster_id: 1,
        }
    }

    /// Document with `set_count` legacy version sets holding build ids
    /// "0", "1", ...
    fn initial_data(set_count: usize) -> VersioningData {
        VersioningData {
            assignment_rules: vec![],
            redirect_rules: vec![],
            version_sets: (0..set_count).map(|i| vec![i.to_string()]).collect(),
        }
    }

    fn insert(
        data: &VersioningData,
        target: &str,
        ramp: Option<f32>,
        index: i32,
        max: usize,
    ) -> RuleResult {
        insert_assignment_rule(clock(), data, target.to_string(), ramp, index, max)
    }

    fn add_redirect(data: &VersioningData, source: &str, target: &str) -> RuleResult {
        add_redirect_rule(
            clock(),
            data,
            source.to_string(),
            target.to_string(),
            IGNORE_MAX,
            IGNORE_MAX,
        )
    }

    fn redirect(source: &str, target: &str) -> RedirectRule {
        RedirectRule {
            source_build_id: source.to_string(),
            target_build_id: target.to_string(),
            create_timestamp: clock(),
            delete_timestamp: None,
        }
    }

    fn active_targets(data: &VersioningData) -> Vec<&str> {
        data.active_assignment_rules()
            .map(|r| r.target_build_id.as_str())
            .collect()
    }

    #[test]
    fn test_insert_assignment_rule_basic() {
        let initial = initial_data(0);
        assert!(!contains_fully_ramped(initial.active_assignment_rules()));

        let data = insert(&initial, "1", None, 0, 10).unwrap();
        let data = insert(&data, "2", None, 0, 10).unwrap();
        let data = insert(&data, "3", None, 0, 10).unwrap();
        assert_eq!(active_targets(&data), vec!["3", "2", "1"]);

        // Unramped rules are normalized to ramp 100.
        assert!(data.active_assignment_rules().all(|r| r.is_fully_ramped()));

        // Insert into the middle.
        let data = insert(&data, "4", None, 2, 10).unwrap();
        assert_eq!(active_targets(&data), vec!["3", "2", "4", "1"]);

        // A too-big index appends.
        let data = insert(&data, "5", None, 100, 10).unwrap();
        assert_eq!(active_targets(&data), vec!["3", "2", "4", "1", "5"]);

        // Input document is unmodified.
        assert_eq!(initial, initial_data(0));
    }

    #[test]
    fn test_insert_assignment_rule_max_rules() {
        let mut data = initial_data(0);
        for _ in 0..3 {
            data = insert(&data, "1", None, 0, 3).unwrap();
        }
        let err = insert(&data, "1", None, 0, 3).unwrap_err();
        assert_eq!(
            err,
            RuleError::ExceedsMaxAssignmentRules { have: 4, max: 3 }
        );
        assert_eq!(
            err.to_string(),
            "exceeds max assignment rules: have 4, max 3"
        );
    }

    #[test]
    fn test_insert_assignment_rule_in_version_set() {
        let data = initial_data(1);
        let err = insert(&data, "0", None, 0, IGNORE_MAX).unwrap_err();
        assert_eq!(err, RuleError::TargetIsVersionSetMember);
    }

    #[test]
    fn test_insert_partially_ramped_rule_is_redirect_source() {
        let data = add_redirect(&initial_data(0), "0", "1").unwrap();
        let err = insert(&data, "0", Some(10.0), 0, IGNORE_MAX).unwrap_err();
        assert_eq!(err, RuleError::PartiallyRampedRuleIsRedirectSource);

        // Fully ramped is fine even as a redirect source.
        insert(&data, "0", None, 0, IGNORE_MAX).unwrap();
    }

    #[test]
    fn test_insert_assignment_rule_invalid_inputs() {
        let data = initial_data(0);
        assert_eq!(
            insert(&data, "0", None, -1, IGNORE_MAX).unwrap_err(),
            RuleError::InvalidNegativeIndex
        );
        assert_eq!(
            insert(&data, "0", Some(-1.0), 0, IGNORE_MAX).unwrap_err(),
            RuleError::InvalidRampPercentage
        );
        assert_eq!(
            insert(&data, "0", Some(101.0), 0, IGNORE_MAX).unwrap_err(),
            RuleError::InvalidRampPercentage
        );
    }

    #[test]
    fn test_replace_assignment_rule_basic() {
        let data = insert(&initial_data(0), "1", None, 0, IGNORE_MAX).unwrap();
        let data = insert(&data, "2", None, 0, IGNORE_MAX).unwrap();

        let replaced =
            replace_assignment_rule(later_clock(), &data, "9".to_string(), None, 1, false)
                .unwrap();
        assert_eq!(active_targets(&replaced), vec!["2", "9"]);

        // The old rule is tombstoned, not removed.
        let tombstones: Vec<&AssignmentRule> = replaced
            .assignment_rules
            .iter()
            .filter(|r| !r.is_active())
            .collect();
        assert_eq!(tombstones.len(), 1);
        assert_eq!(tombstones[0].target_build_id, "1");
        assert_eq!(tombstones[0].delete_timestamp, Some(later_clock()));
    }

    #[test]
    fn test_replace_assignment_rule_require_fully_ramped() {
        let data = insert(&initial_data(0), "1", None, 0, IGNORE_MAX).unwrap();
        let err =
            replace_assignment_rule(clock(), &data, "2".to_string(), Some(50.0), 0, false)
                .unwrap_err();
        assert_eq!(err, RuleError::RequireFullyRamped);

        // force overrides the guarantee.
        let forced =
            replace_assignment_rule(clock(), &data, "2".to_string(), Some(50.0), 0, true)
                .unwrap();
        assert!(!contains_fully_ramped(forced.active_assignment_rules()));
    }

    #[test]
    fn test_replace_assignment_rule_index_out_of_bounds() {
        let data = insert(&initial_data(0), "1", None, 0, IGNORE_MAX).unwrap();
        let err = replace_assignment_rule(clock(), &data, "2".to_string(), None, 5, false)
            .unwrap_err();
        assert_eq!(err, RuleError::IndexOutOfBounds { index: 5, len: 1 });
    }

    #[test]
    fn test_delete_assignment_rule_basic() {
        let data = insert(&initial_data(0), "1", None, 0, IGNORE_MAX).unwrap();
        let data = insert(&data, "2", None, 0, IGNORE_MAX).unwrap();

        let deleted = delete_assignment_rule(later_clock(), &data, 0, false).unwrap();
        assert_eq!(active_targets(&deleted), vec!["1"]);
    }

    #[test]
    fn test_delete_assignment_rule_require_fully_ramped() {
        let data = insert(&initial_data(0), "1", None, 0, IGNORE_MAX).unwrap();
        let err = delete_assignment_rule(clock(), &data, 0, false).unwrap_err();
        assert_eq!(err, RuleError::RequireFullyRamped);

        delete_assignment_rule(clock(), &data, 0, true).unwrap();

        // Deleting a partial rule while a fully-ramped one remains is fine.
        let data = insert(&data, "2", Some(25.0), 0, IGNORE_MAX).unwrap();
        let deleted = delete_assignment_rule(clock(), &data, 0, false).unwrap();
        assert_eq!(active_targets(&deleted), vec!["1"]);
    }

    #[test]
    fn test_delete_assignment_rule_index_out_of_bounds() {
        let data = initial_data(0);
        let err = delete_assignment_rule(clock(), &data, 0, false).unwrap_err();
        assert_eq!(err, RuleError::IndexOutOfBounds { index: 0, len: 0 });
    }

    #[test]
    fn test_add_redirect_rule_basic() {
        let data = add_redirect(&initial_data(0), "1", "2").unwrap();
        let active: Vec<&RedirectRule> = data.active_redirect_rules().collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].source_build_id, "1");
        assert_eq!(active[0].target_build_id, "2");
    }

    #[test]
    fn test_add_redirect_rule_max_rules() {
        let mut data = initial_data(0);
        for i in 0..3 {
            data = add_redirect(&data, &i.to_string(), &(i + 1).to_string()).unwrap();
        }
        let err = add_redirect_rule(
            clock(),
            &data,
            "10".to_string(),
            "11".to_string(),
            3,
            IGNORE_MAX,
        )
        .unwrap_err();
        assert_eq!(err, RuleError::ExceedsMaxRedirectRules { have: 4, max: 3 });
    }

    #[test]
    fn test_add_redirect_rule_in_version_set() {
        let data = initial_data(1);
        assert_eq!(
            add_redirect(&data, "0", "1").unwrap_err(),
            RuleError::SourceIsVersionSetMember
        );
        assert_eq!(
            add_redirect(&data, "1", "0").unwrap_err(),
            RuleError::TargetIsVersionSetMember
        );
    }

    #[test]
    fn test_add_redirect_rule_source_is_partially_ramped_target() {
        let data = insert(&initial_data(0), "1", Some(10.0), 0, IGNORE_MAX).unwrap();
        let err = add_redirect(&data, "1", "2").unwrap_err();
        assert_eq!(err, RuleError::PartiallyRampedRuleIsRedirectSource);
    }

    #[test]
    fn test_add_redirect_rule_already_exists() {
        let data = add_redirect(&initial_data(0), "1", "2").unwrap();
        let err = add_redirect(&data, "1", "3").unwrap_err();
        assert_eq!(err, RuleError::SourceAlreadyExists("1".to_string()));
    }

    #[test]
    fn test_add_redirect_rule_create_cycle() {
        let data = add_redirect(&initial_data(0), "1", "2").unwrap();
        assert_eq!(
            add_redirect(&data, "2", "1").unwrap_err(),
            RuleError::CreatesCycle
        );

        let data = add_redirect(&data, "2", "3").unwrap();
        assert_eq!(
            add_redirect(&data, "3", "1").unwrap_err(),
            RuleError::CreatesCycle
        );
    }

    #[test]
    fn test_add_redirect_rule_max_upstream_build_ids() {
        let max_upstream = 2;
        let data = add_redirect_rule(
            clock(),
            &initial_data(0),
            "4".to_string(),
            "5".to_string(),
            IGNORE_MAX,
            max_upstream,
        )
        .unwrap();
        let data = add_redirect_rule(
            clock(),
            &data,
            "5".to_string(),
            "6".to_string(),
            IGNORE_MAX,
            max_upstream,
        )
        .unwrap();
        let err = add_redirect_rule(
            clock(),
            &data,
            "6".to_string(),
            "7".to_string(),
            IGNORE_MAX,
            max_upstream,
        )
        .unwrap_err();
        assert_eq!(err, RuleError::ExceedsMaxUpstreamBuildIds { have: 3, max: 2 });
    }

    #[test]
    fn test_add_redirect_rule_empty_target() {
        let err = add_redirect(&initial_data(0), "1", "").unwrap_err();
        assert_eq!(err, RuleError::TargetEmpty);
    }

    #[test]
    fn test_replace_redirect_rule_basic() {
        let data = add_redirect(&initial_data(0), "1", "2").unwrap();
        let replaced = replace_redirect_rule(
            later_clock(),
            &data,
            "1".to_string(),
            "3".to_string(),
            IGNORE_MAX,
        )
        .unwrap();

        let active: Vec<&RedirectRule> = replaced.active_redirect_rules().collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].target_build_id, "3");
        assert_eq!(
            replaced
                .redirect_rules
                .iter()
                .filter(|r| !r.is_active())
                .count(),
            1
        );
    }

    #[test]
    fn test_replace_redirect_rule_create_cycle() {
        let data = add_redirect(&initial_data(0), "1", "2").unwrap();
        let data = add_redirect(&data, "2", "3").unwrap();
        let err = replace_redirect_rule(
            clock(),
            &data,
            "2".to_string(),
            "1".to_string(),
            IGNORE_MAX,
        )
        .unwrap_err();
        assert_eq!(err, RuleError::CreatesCycle);
    }

    #[test]
    fn test_replace_redirect_rule_not_found() {
        let err = replace_redirect_rule(
            clock(),
            &initial_data(0),
            "1".to_string(),
            "2".to_string(),
            IGNORE_MAX,
        )
        .unwrap_err();
        assert_eq!(err, RuleError::SourceNotFound("1".to_string()));
    }

    #[test]
    fn test_delete_redirect_rule() {
        let data = add_redirect(&initial_data(0), "1", "2").unwrap();
        let deleted = delete_redirect_rule(later_clock(), &data, "1").unwrap();
        assert_eq!(deleted.active_redirect_rules().count(), 0);
        assert_eq!(deleted.redirect_rules.len(), 1);

        let err = delete_redirect_rule(clock(), &deleted, "1").unwrap_err();
        assert_eq!(err, RuleError::SourceNotFound("1".to_string()));
    }

    #[test]
    fn test_cleanup_tombstones() {
        let data = insert(&initial_data(0), "1", None, 0, IGNORE_MAX).unwrap();
        let data = insert(&data, "2", None, 0, IGNORE_MAX).unwrap();
        let data = delete_assignment_rule(clock(), &data, 0, false).unwrap();
        let data = add_redirect(&data, "5", "6").unwrap();
        let data = delete_redirect_rule(clock(), &data, "5").unwrap();
        assert_eq!(data.assignment_rules.len(), 2);
        assert_eq!(data.redirect_rules.len(), 1);

        // Within retention: nothing removed. Idempotent.
        let kept = cleanup_tombstones(&data, 1_000, 2_000);
        assert_eq!(kept, data);

        // Past retention: tombstones go, actives stay.
        let cleaned = cleanup_tombstones(&data, 10_000, 2_000);
        assert_eq!(cleaned.assignment_rules.len(), 1);
        assert!(cleaned.redirect_rules.is_empty());
        assert_eq!(cleanup_tombstones(&cleaned, 10_000, 2_000), cleaned);
    }

    #[test]
    fn test_commit_build_id_basic() {
        let data = insert(&initial_data(0), "1", None, 0, IGNORE_MAX).unwrap();
        let data = insert(&data, "2", Some(50.0), 0, IGNORE_MAX).unwrap();

        let committed =
            commit_build_id(later_clock(), &data, "9".to_string(), false, true, IGNORE_MAX)
                .unwrap();
        assert_eq!(active_targets(&committed), vec!["9"]);
        assert!(committed
            .assignment_rules
            .iter()
            .filter(|r| !r.is_active())
            .all(|r| r.delete_timestamp == Some(later_clock())));
    }

    #[test]
    fn test_commit_build_id_no_recent_poller() {
        let err = commit_build_id(
            clock(),
            &initial_data(0),
            "9".to_string(),
            false,
            false,
            IGNORE_MAX,
        )
        .unwrap_err();
        assert_eq!(err, RuleError::NoRecentPollerOnCommitTarget("9".to_string()));

        // force skips the poller requirement.
        commit_build_id(clock(), &initial_data(0), "9".to_string(), true, false, IGNORE_MAX)
            .unwrap();
    }

    #[test]
    fn test_commit_build_id_in_version_set() {
        let err = commit_build_id(
            clock(),
            &initial_data(1),
            "0".to_string(),
            false,
            true,
            IGNORE_MAX,
        )
        .unwrap_err();
        assert_eq!(err, RuleError::TargetIsVersionSetMember);
    }

    #[test]
    fn test_is_cyclic() {
        let mut rules = vec![
            redirect("1", "2"),
            redirect("5", "1"),
            redirect("3", "4"),
            redirect("3", "5"),
            redirect("2", "3"),
        ];
        assert!(is_cyclic(&rules));

        rules.remove(3);
        assert!(!is_cyclic(&rules));

        rules.push(redirect("4", "2"));
        assert!(is_cyclic(&rules));
    }

    #[test]
    fn test_find_terminal_build_id() {
        // 10 <- 1 <- {2, 5}; 5 <- 3 <- 4
        let rules = vec![
            redirect("1", "10"),
            redirect("2", "1"),
            redirect("3", "5"),
            redirect("4", "3"),
            redirect("5", "1"),
        ];
        for source in ["1", "2", "3", "4", "5", "10"] {
            assert_eq!(find_terminal_build_id(source, &rules), "10");
        }

        assert_eq!(find_terminal_build_id("11", &[]), "11");

        let single = vec![redirect("1", "2")];
        assert_eq!(find_terminal_build_id("1", &single), "2");
        assert_eq!(find_terminal_build_id("2", &single), "2");

        let cyclic = vec![redirect("1", "2"), redirect("2", "1")];
        assert_eq!(find_terminal_build_id("1", &cyclic), "");
        assert_eq!(find_terminal_build_id("2", &cyclic), "");
    }

    #[test]
    fn test_get_upstream_build_ids_no_cycle() {
        let rules = vec![
            redirect("1", "10"),
            redirect("2", "1"),
            redirect("3", "5"),
            redirect("4", "3"),
            redirect("5", "1"),
        ];
        let mut upstream = get_upstream_build_ids("1", &rules);
        upstream.sort();
        assert_eq!(upstream, vec!["2", "3", "4", "5"]);
    }

    #[test]
    fn test_get_upstream_build_ids_with_cycle() {
        // 1 -> 2 -> 3 -> {4, 5}; 5 -> 1
        let rules = vec![
            redirect("1", "2"),
            redirect("2", "3"),
            redirect("3", "4"),
            redirect("3", "5"),
            redirect("5", "1"),
        ];
        let mut upstream = get_upstream_build_ids("1", &rules);
        upstream.sort();
        assert_eq!(upstream, vec!["2", "3", "5"]);

        let rules = vec![
            redirect("2", "3"),
            redirect("3", "4"),
            redirect("3", "5"),
            redirect("4", "2"),
            redirect("5", "1"),
        ];
        let mut upstream = get_upstream_build_ids("1", &rules);
        upstream.sort();
        assert_eq!(upstream, vec!["2", "3", "4", "5"]);
    }

    #[test]
    fn test_insert_then_delete_restores_active_set() {
        let base = insert(&initial_data(0), "1", None, 0, IGNORE_MAX).unwrap();
        let base = insert(&base, "2", Some(30.0), 0, IGNORE_MAX).unwrap();

        // Applying an op and its compensating inverse leaves the document
        // unchanged modulo tombstones.
        let inserted = insert(&base, "3", None, 1, IGNORE_MAX).unwrap();
        let restored = delete_assignment_rule(later_clock(), &inserted, 1, false).unwrap();
        assert_eq!(active_targets(&restored), active_targets(&base));

        let tombstoned: Vec<&AssignmentRule> = restored
            .assignment_rules
            .iter()
            .filter(|r| !r.is_active())
            .collect();
        assert_eq!(tombstoned.len(), 1);
        assert_eq!(tombstoned[0].delete_timestamp, Some(later_clock()));

        let added = add_redirect(&base, "8", "9").unwrap();
        let removed = delete_redirect_rule(later_clock(), &added, "8").unwrap();
        assert_eq!(
            removed.active_redirect_rules().count(),
            base.active_redirect_rules().count()
        );
    }

    #[test]
    fn test_evaluate_assignment_rules_first_match_wins() {
        let data = insert(&initial_data(0), "stable", None, 0, IGNORE_MAX).unwrap();
        let data = insert(&data, "canary", Some(25.0), 0, IGNORE_MAX).unwrap();

        // Draws below the ramp land on the canary; others fall through.
        assert_eq!(
            evaluate_assignment_rules(&data, 10.0),
            Some("canary".to_string())
        );
        assert_eq!(
            evaluate_assignment_rules(&data, 80.0),
            Some("stable".to_string())
        );
        assert_eq!(evaluate_assignment_rules(&initial_data(0), 0.0), None);
    }
}

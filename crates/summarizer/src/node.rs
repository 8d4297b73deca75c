//! Summarizer node tree.
//!
//! # Overview
//!
//! Each [`SummarizerNode`] mirrors one node of the summarized hierarchy and
//! tracks whether anything under it changed since its latest acknowledged
//! summary. A summary pass goes through:
//!
//! 1. [`SummarizerNode::start_summary`] records the reference sequence number
//!    of the work-in-progress summary on every node.
//! 2. [`SummarizerNode::summarize`] either returns a handle to the node's
//!    latest summary (nothing changed) or asks the node's [`Summarizable`]
//!    source to serialize itself; sources summarize their children through
//!    [`ChildSummarizers`].
//! 3. [`SummarizerNode::complete_summary`] turns the work-in-progress paths
//!    into a pending summary keyed by the proposal handle.
//! 4. [`SummarizerNode::refresh_latest_summary`] promotes a pending summary
//!    once the ordering service acknowledges it.
//!
//! [`SummarizerNode::clear_summary`] discards work-in-progress state at any
//! point without touching pending summaries.

use std::collections::BTreeMap;

use serde::Deserialize;
use tracing::{debug, error, warn};

use crate::error::SummarizerError;
use crate::summary::{
    parse_summary_for_subtrees, EscapedPath, GcData, SnapshotTree, SummaryNode, SummaryObject,
    SummaryStats, SummaryTree, SummaryType,
};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SummarizerNodeConfig {
    /// Emit handles for unchanged nodes instead of re-serializing them.
    pub can_reuse_handle: bool,
}

impl Default for SummarizerNodeConfig {
    fn default() -> Self {
        Self {
            can_reuse_handle: true,
        }
    }
}

/// How a child node came into existence, which decides its initial summary
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateChildSource {
    /// Created locally. Like a child loaded from a summary it starts from
    /// the parent's latest summary, when there is one, and counts as
    /// unchanged until it records a change.
    Local,
    /// Loaded from the parent's latest summary.
    FromSummary,
    /// Attached by a sequenced op.
    FromAttach { sequence_number: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummarizeResult {
    pub summary: SummaryObject,
    pub stats: SummaryStats,
}

/// What a [`Summarizable`] source produces for its own node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummarizeInternalResult {
    pub id: String,
    /// Path parts between this node's tree and its children's trees.
    pub path_parts_for_children: Option<Vec<String>>,
    pub summary: SummaryTree,
    pub stats: SummaryStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSummaryResult {
    pub latest_summary_updated: bool,
    pub was_summary_tracked: bool,
}

/// Content behind a summarizer node.
pub trait Summarizable {
    fn summarize_internal(
        &mut self,
        full_tree: bool,
        track_state: bool,
        children: &mut ChildSummarizers<'_>,
    ) -> Result<SummarizeInternalResult, SummarizerError>;

    /// Outbound routes of this node; children are reached through `children`.
    fn get_gc_data(
        &mut self,
        full_gc: bool,
        children: &mut ChildSummarizers<'_>,
    ) -> Result<GcData, SummarizerError>;
}

/// Mutable view of a node's children handed to its [`Summarizable`] source.
pub struct ChildSummarizers<'a> {
    children: &'a mut BTreeMap<String, SummarizerNode>,
}

impl ChildSummarizers<'_> {
    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.children.keys()
    }

    pub fn summarize(
        &mut self,
        id: &str,
        full_tree: bool,
        track_state: bool,
        source: &mut dyn Summarizable,
    ) -> Result<SummarizeResult, SummarizerError> {
        let child = self
            .children
            .get_mut(id)
            .ok_or_else(|| SummarizerError::MissingChild(id.to_string()))?;
        child.summarize(full_tree, track_state, source)
    }

    pub fn get_gc_data(
        &mut self,
        id: &str,
        full_gc: bool,
        source: &mut dyn Summarizable,
    ) -> Result<GcData, SummarizerError> {
        let child = self
            .children
            .get_mut(id)
            .ok_or_else(|| SummarizerError::MissingChild(id.to_string()))?;
        child.get_gc_data(full_gc, source)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LocalPaths {
    local_path: EscapedPath,
    additional_path: Option<EscapedPath>,
}

#[derive(Debug, Clone)]
pub struct SummarizerNode {
    config: SummarizerNodeConfig,
    change_sequence_number: u64,
    latest_summary: Option<SummaryNode>,
    pending_summaries: BTreeMap<String, SummaryNode>,
    wip_reference_sequence_number: Option<u64>,
    wip_local_paths: Option<LocalPaths>,
    wip_skip_recursion: bool,
    children: BTreeMap<String, SummarizerNode>,
    gc_cache: Option<(u64, GcData)>,
}

impl SummarizerNode {
    fn new(
        config: SummarizerNodeConfig,
        change_sequence_number: u64,
        latest_summary: Option<SummaryNode>,
    ) -> Self {
        Self {
            config,
            change_sequence_number,
            latest_summary,
            pending_summaries: BTreeMap::new(),
            wip_reference_sequence_number: None,
            wip_local_paths: None,
            wip_skip_recursion: false,
            children: BTreeMap::new(),
            gc_cache: None,
        }
    }

    /// Root node of a document that has never been summarized.
    pub fn new_root(config: SummarizerNodeConfig, change_sequence_number: u64) -> Self {
        Self::new(config, change_sequence_number, None)
    }

    /// Root node of a document loaded from the snapshot of the summary at
    /// `reference_sequence_number`.
    pub fn from_snapshot(
        config: SummarizerNodeConfig,
        reference_sequence_number: u64,
        snapshot: &SnapshotTree,
    ) -> Self {
        let mut node = Self::new(config, reference_sequence_number, None);
        node.refresh_latest_summary_from_snapshot(
            reference_sequence_number,
            snapshot,
            None,
            EscapedPath::create(""),
        );
        node
    }

    // ──────────────────────────────────────── State

    pub fn change_sequence_number(&self) -> u64 {
        self.change_sequence_number
    }

    pub fn latest_summary(&self) -> Option<&SummaryNode> {
        self.latest_summary.as_ref()
    }

    /// Reference sequence number of the latest acknowledged summary.
    pub fn reference_sequence_number(&self) -> Option<u64> {
        self.latest_summary
            .as_ref()
            .map(|summary| summary.reference_sequence_number)
    }

    pub fn pending_summary(&self, proposal_handle: &str) -> Option<&SummaryNode> {
        self.pending_summaries.get(proposal_handle)
    }

    pub fn pending_summary_count(&self) -> usize {
        self.pending_summaries.len()
    }

    pub fn wip_reference_sequence_number(&self) -> Option<u64> {
        self.wip_reference_sequence_number
    }

    pub fn is_summary_in_progress(&self) -> bool {
        self.wip_reference_sequence_number.is_some()
    }

    pub fn has_changed(&self) -> bool {
        match self.reference_sequence_number() {
            Some(reference) => self.change_sequence_number > reference,
            None => true,
        }
    }

    pub fn invalidate(&mut self, sequence_number: u64) {
        if sequence_number > self.change_sequence_number {
            self.change_sequence_number = sequence_number;
        }
    }

    /// Marks the node changed by the op sequenced at `sequence_number`.
    pub fn record_change(&mut self, sequence_number: u64) {
        self.invalidate(sequence_number);
    }

    // ──────────────────────────────────────── Children

    pub fn child(&self, id: &str) -> Option<&SummarizerNode> {
        self.children.get(id)
    }

    pub fn child_mut(&mut self, id: &str) -> Option<&mut SummarizerNode> {
        self.children.get_mut(id)
    }

    pub fn child_ids(&self) -> impl Iterator<Item = &String> {
        self.children.keys()
    }

    pub fn create_child(
        &mut self,
        id: &str,
        source: CreateChildSource,
    ) -> Result<&mut SummarizerNode, SummarizerError> {
        if self.children.contains_key(id) {
            return Err(SummarizerError::ChildAlreadyExists(id.to_string()));
        }
        let (latest_summary, change_sequence_number) = match source {
            CreateChildSource::FromAttach { sequence_number } => {
                let latest = self
                    .latest_summary
                    .as_ref()
                    .filter(|parent| sequence_number <= parent.reference_sequence_number)
                    .map(|parent| parent.create_for_child(id));
                (latest, sequence_number)
            }
            CreateChildSource::FromSummary => {
                let parent = self
                    .latest_summary
                    .as_ref()
                    .ok_or(SummarizerError::ParentHasNoSummary)?;
                (
                    Some(parent.create_for_child(id)),
                    parent.reference_sequence_number,
                )
            }
            CreateChildSource::Local => match self.latest_summary.as_ref() {
                Some(parent) => (
                    Some(parent.create_for_child(id)),
                    parent.reference_sequence_number,
                ),
                None => (None, 0),
            },
        };
        let mut child = SummarizerNode::new(
            self.config.clone(),
            change_sequence_number,
            latest_summary,
        );
        self.update_late_child(&mut child);
        Ok(self.children.entry(id.to_string()).or_insert(child))
    }

    /// Brings a child created mid-summary (or between a summary op and its
    /// ack) up to the parent's tracking state.
    fn update_late_child(&self, child: &mut SummarizerNode) {
        if self.is_summary_in_progress() {
            child.wip_reference_sequence_number = self.wip_reference_sequence_number;
        }
        // Pending entries only make sense for a child that exists in some
        // summary; a brand new child has no path to promote.
        let Some(latest) = child.latest_summary.clone() else {
            return;
        };
        for (handle, pending) in &self.pending_summaries {
            child.pending_summaries.insert(
                handle.clone(),
                SummaryNode::new(
                    pending.reference_sequence_number,
                    latest.base_path.clone(),
                    latest.local_path.clone(),
                ),
            );
        }
    }

    // ──────────────────────────────────────── Summary pass

    pub fn start_summary(&mut self, reference_sequence_number: u64) -> Result<(), SummarizerError> {
        if self.is_summary_in_progress() {
            return Err(SummarizerError::AlreadyTracking);
        }
        self.wip_reference_sequence_number = Some(reference_sequence_number);
        for child in self.children.values_mut() {
            child.start_summary(reference_sequence_number)?;
        }
        Ok(())
    }

    pub fn summarize(
        &mut self,
        full_tree: bool,
        track_state: bool,
        source: &mut dyn Summarizable,
    ) -> Result<SummarizeResult, SummarizerError> {
        if !track_state {
            let result = source.summarize_internal(
                full_tree,
                false,
                &mut ChildSummarizers {
                    children: &mut self.children,
                },
            )?;
            return Ok(SummarizeResult {
                summary: SummaryObject::Tree(result.summary),
                stats: result.stats,
            });
        }
        if !self.is_summary_in_progress() {
            return Err(SummarizerError::NotTracking);
        }

        if self.config.can_reuse_handle && !full_tree && !self.has_changed() {
            if let Some(latest) = &self.latest_summary {
                self.wip_local_paths = Some(LocalPaths {
                    local_path: latest.local_path.clone(),
                    additional_path: latest.additional_path.clone(),
                });
                self.wip_skip_recursion = true;
                let stats = SummaryStats {
                    handle_node_count: 1,
                    ..SummaryStats::default()
                };
                return Ok(SummarizeResult {
                    summary: SummaryObject::Handle {
                        handle_type: SummaryType::Tree,
                        handle: latest.full_path().as_str().to_string(),
                    },
                    stats,
                });
            }
        }

        let (summary, stats) = self.summarize_tree(full_tree, source)?;
        Ok(SummarizeResult {
            summary: SummaryObject::Tree(summary),
            stats,
        })
    }

    /// Serializes this node through `source` without considering handle
    /// reuse. Used for the root of an upload.
    pub fn summarize_tree(
        &mut self,
        full_tree: bool,
        source: &mut dyn Summarizable,
    ) -> Result<(SummaryTree, SummaryStats), SummarizerError> {
        if !self.is_summary_in_progress() {
            return Err(SummarizerError::NotTracking);
        }
        let result = source.summarize_internal(
            full_tree,
            true,
            &mut ChildSummarizers {
                children: &mut self.children,
            },
        )?;
        self.wip_local_paths = Some(LocalPaths {
            local_path: EscapedPath::create(&result.id),
            additional_path: result
                .path_parts_for_children
                .as_deref()
                .map(EscapedPath::create_and_concat),
        });
        Ok((result.summary, result.stats))
    }

    pub fn complete_summary(&mut self, proposal_handle: &str) -> Result<(), SummarizerError> {
        self.complete_summary_core(proposal_handle, None, false)
    }

    fn complete_summary_core(
        &mut self,
        proposal_handle: &str,
        parent_path: Option<EscapedPath>,
        parent_skip_recursion: bool,
    ) -> Result<(), SummarizerError> {
        let reference_sequence_number = self
            .wip_reference_sequence_number
            .ok_or(SummarizerError::NotTracking)?;

        let local_paths = if parent_skip_recursion {
            match &self.latest_summary {
                Some(latest) => Some(LocalPaths {
                    local_path: latest.local_path.clone(),
                    additional_path: latest.additional_path.clone(),
                }),
                None => {
                    // Added after the latest summary: still has none.
                    self.clear_summary();
                    return Ok(());
                }
            }
        } else {
            self.wip_local_paths.clone()
        };
        let local_paths = local_paths.ok_or(SummarizerError::NodeNotSummarized)?;

        let mut summary = SummaryNode::new(
            reference_sequence_number,
            parent_path,
            local_paths.local_path,
        );
        summary.additional_path = local_paths.additional_path;
        let path_for_children = summary.full_path_for_children();
        let skip_recursion = self.wip_skip_recursion || parent_skip_recursion;
        for child in self.children.values_mut() {
            child.complete_summary_core(
                proposal_handle,
                Some(path_for_children.clone()),
                skip_recursion,
            )?;
        }
        self.pending_summaries
            .insert(proposal_handle.to_string(), summary);
        self.clear_summary();
        Ok(())
    }

    pub fn clear_summary(&mut self) {
        self.wip_reference_sequence_number = None;
        self.wip_local_paths = None;
        self.wip_skip_recursion = false;
        for child in self.children.values_mut() {
            child.clear_summary();
        }
    }

    // ──────────────────────────────────────── Acknowledgement

    /// Updates the latest summary after the summary proposed as
    /// `proposal_handle` at `summary_reference_sequence_number` was
    /// acknowledged. Falls back to `fetch_snapshot` when this node did not
    /// track that proposal.
    pub fn refresh_latest_summary<F>(
        &mut self,
        proposal_handle: Option<&str>,
        summary_reference_sequence_number: u64,
        fetch_snapshot: F,
    ) -> Result<RefreshSummaryResult, SummarizerError>
    where
        F: FnOnce() -> Result<SnapshotTree, SummarizerError>,
    {
        if self.is_summary_in_progress() {
            error!(
                proposal_handle,
                summary_reference_sequence_number, "refresh latest summary while summary is in progress"
            );
            return Err(SummarizerError::RefreshWhileSummaryInProgress);
        }

        if let Some(handle) = proposal_handle {
            if let Some(pending) = self.pending_summaries.get(handle) {
                let reference = pending.reference_sequence_number;
                self.refresh_latest_summary_from_pending(handle, reference)?;
                return Ok(RefreshSummaryResult {
                    latest_summary_updated: true,
                    was_summary_tracked: true,
                });
            }
            warn!(proposal_handle = handle, "pending summary not found");
        }

        if self
            .reference_sequence_number()
            .is_some_and(|reference| reference >= summary_reference_sequence_number)
        {
            return Ok(RefreshSummaryResult {
                latest_summary_updated: false,
                was_summary_tracked: false,
            });
        }

        let snapshot = fetch_snapshot()?;
        self.refresh_latest_summary_from_snapshot(
            summary_reference_sequence_number,
            &snapshot,
            None,
            EscapedPath::create(""),
        );
        Ok(RefreshSummaryResult {
            latest_summary_updated: true,
            was_summary_tracked: false,
        })
    }

    fn refresh_latest_summary_from_pending(
        &mut self,
        proposal_handle: &str,
        reference_sequence_number: u64,
    ) -> Result<(), SummarizerError> {
        let Some(summary) = self.pending_summaries.remove(proposal_handle) else {
            // Only nodes whose parent reused a handle before this node had
            // any summary end up here.
            if self.latest_summary.is_some() {
                warn!(
                    proposal_handle,
                    "pending summary missing on a node that has a previous summary"
                );
            }
            return Ok(());
        };
        if summary.reference_sequence_number != reference_sequence_number {
            return Err(SummarizerError::PendingSummaryMismatch {
                expected: reference_sequence_number,
                found: summary.reference_sequence_number,
            });
        }
        self.pending_summaries
            .retain(|_, pending| pending.reference_sequence_number >= reference_sequence_number);
        self.latest_summary = Some(summary);
        for child in self.children.values_mut() {
            child.refresh_latest_summary_from_pending(proposal_handle, reference_sequence_number)?;
        }
        Ok(())
    }

    fn refresh_latest_summary_from_snapshot(
        &mut self,
        reference_sequence_number: u64,
        snapshot: &SnapshotTree,
        base_path: Option<EscapedPath>,
        local_path: EscapedPath,
    ) {
        if self
            .reference_sequence_number()
            .is_some_and(|reference| reference >= reference_sequence_number)
        {
            return;
        }
        let mut latest = SummaryNode::new(reference_sequence_number, base_path, local_path);
        let (children_tree, children_part) = parse_summary_for_subtrees(snapshot);
        latest.additional_path = children_part.map(EscapedPath::create);
        let path_for_children = latest.full_path_for_children();
        self.latest_summary = Some(latest);
        debug!(reference_sequence_number, "latest summary refreshed from snapshot");

        for (id, child) in self.children.iter_mut() {
            // Children missing from the snapshot are newer than it.
            if let Some(subtree) = children_tree.trees.get(id) {
                child.refresh_latest_summary_from_snapshot(
                    reference_sequence_number,
                    subtree,
                    Some(path_for_children.clone()),
                    EscapedPath::create(id),
                );
            }
        }
    }

    // ──────────────────────────────────────── GC

    /// Outbound routes for this node and its children. Reuses the data from
    /// the previous call when nothing changed since.
    pub fn get_gc_data(
        &mut self,
        full_gc: bool,
        source: &mut dyn Summarizable,
    ) -> Result<GcData, SummarizerError> {
        if !full_gc {
            if let Some((computed_at, data)) = &self.gc_cache {
                if *computed_at >= self.change_sequence_number {
                    return Ok(data.clone());
                }
            }
        }
        let data = source.get_gc_data(
            full_gc,
            &mut ChildSummarizers {
                children: &mut self.children,
            },
        )?;
        self.gc_cache = Some((self.change_sequence_number, data.clone()));
        Ok(data)
    }
}

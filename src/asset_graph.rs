//! The module dependency graph.
//!
//! ```text
//! root ─> entry_specifier ─> entry_file ─> dependency ─> asset_group ─> asset ─> dependency ─> ...
//! ```
//!
//! Entry specifiers, entry files, dependencies and asset groups are
//! *incomplete* until they acquire children. The set of incomplete nodes is
//! what the coordinator turns into requests; the results come back through
//! the `resolve_*` methods, which patch the graph with
//! [`Graph::replace_nodes_connected_to`] and thereby discover new incomplete
//! nodes.

use std::collections::HashSet;
use std::io;

use camino::Utf8Path;
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use crate::core::{Blake3Hasher, Hash32, load_cbor, save_cbor};
use crate::graph::{Graph, Node, NodeId, TraversalActions};
use crate::types::{Asset, AssetGroup, Dependency, DependencyOptions, Entry, Target};

pub const ROOT_ID: &str = "@@root";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AssetGraphNode {
    Root,
    EntrySpecifier(String),
    EntryFile(Entry),
    Dependency(Dependency),
    AssetGroup { group: AssetGroup, deferred: bool },
    Asset(Asset),
}

impl AssetGraphNode {
    /// Whether the node needs children before the graph is complete.
    fn can_be_incomplete(&self) -> bool {
        matches!(
            self,
            AssetGraphNode::EntrySpecifier(_)
                | AssetGraphNode::EntryFile(_)
                | AssetGraphNode::Dependency(_)
                | AssetGraphNode::AssetGroup { .. }
        )
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, AssetGraphNode::AssetGroup { deferred: true, .. })
    }

    pub fn as_dependency(&self) -> Option<&Dependency> {
        match self {
            AssetGraphNode::Dependency(dependency) => Some(dependency),
            _ => None,
        }
    }

    pub fn as_asset(&self) -> Option<&Asset> {
        match self {
            AssetGraphNode::Asset(asset) => Some(asset),
            _ => None,
        }
    }
}

pub fn entry_specifier_node(specifier: &str) -> Node<AssetGraphNode> {
    Node::new(
        format!("entry_specifier:{specifier}"),
        AssetGraphNode::EntrySpecifier(specifier.to_string()),
    )
}

pub fn entry_file_node(entry: Entry) -> Node<AssetGraphNode> {
    let id = format!("entry_file:{}", Hash32::hash_json(&entry).to_hex());
    Node::new(id, AssetGraphNode::EntryFile(entry))
}

pub fn dependency_node(dependency: Dependency) -> Node<AssetGraphNode> {
    Node::new(dependency.id.clone(), AssetGraphNode::Dependency(dependency))
}

pub fn asset_group_node(group: AssetGroup, deferred: bool) -> Node<AssetGraphNode> {
    Node::new(group.id(), AssetGraphNode::AssetGroup { group, deferred })
}

pub fn asset_node(asset: Asset) -> Node<AssetGraphNode> {
    Node::new(asset.id.clone(), AssetGraphNode::Asset(asset))
}

/// Graph changes accumulated since the last [`AssetGraph::drain_changes`].
#[derive(Debug, Default)]
pub struct Changes {
    /// Nodes that became incomplete, in discovery order.
    pub incomplete: Vec<NodeId>,
    /// Nodes removed from the graph.
    pub removed: Vec<Node<AssetGraphNode>>,
}

impl Changes {
    pub fn is_empty(&self) -> bool {
        self.incomplete.is_empty() && self.removed.is_empty()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AssetGraph {
    graph: Graph<AssetGraphNode>,
    incomplete: IndexSet<NodeId>,
    hash: Option<String>,
    #[serde(skip)]
    changes: ChangeQueue,
}

#[derive(Clone, Debug, Default)]
struct ChangeQueue {
    incomplete: Vec<NodeId>,
    removed: Vec<Node<AssetGraphNode>>,
}

impl AssetGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn graph(&self) -> &Graph<AssetGraphNode> {
        &self.graph
    }

    pub fn get_node(&self, id: &str) -> Option<&Node<AssetGraphNode>> {
        self.graph.get_node(id)
    }

    pub fn has_node(&self, id: &str) -> bool {
        self.graph.has_node(id)
    }

    /// Sets the root and connects one entry specifier node per entry.
    pub fn initialize_entries<S: AsRef<str>>(&mut self, entries: &[S]) {
        self.graph.set_root_node(Node::new(ROOT_ID, AssetGraphNode::Root));

        let nodes = entries
            .iter()
            .map(|entry| entry_specifier_node(entry.as_ref()))
            .collect();

        self.replace(ROOT_ID, nodes, &HashSet::new());
    }

    /// Sets the root and connects the given asset groups directly.
    pub fn initialize_asset_groups(&mut self, groups: Vec<AssetGroup>) {
        self.graph.set_root_node(Node::new(ROOT_ID, AssetGraphNode::Root));

        let nodes = groups
            .into_iter()
            .map(|group| asset_group_node(group, false))
            .collect();

        self.replace(ROOT_ID, nodes, &HashSet::new());
    }

    pub fn is_incomplete(&self, id: &str) -> bool {
        self.incomplete.contains(id)
    }

    pub fn has_incomplete_nodes(&self) -> bool {
        !self.incomplete.is_empty()
    }

    /// Incomplete nodes in the order they were discovered.
    pub fn incomplete_nodes(&self) -> impl Iterator<Item = &Node<AssetGraphNode>> {
        self.incomplete.iter().filter_map(|id| self.graph.get_node(id))
    }

    pub fn drain_changes(&mut self) -> Changes {
        let queue = std::mem::take(&mut self.changes);
        Changes {
            incomplete: queue.incomplete,
            removed: queue.removed,
        }
    }

    fn mark_incomplete(&mut self, id: NodeId) {
        if self.incomplete.insert(id.clone()) {
            self.changes.incomplete.push(id);
        }
    }

    fn mark_complete(&mut self, id: &str) {
        self.incomplete.shift_remove(id);
    }

    /// Replaces the children of `from`, then applies the completeness rule to
    /// every upserted node: a node of an incomplete-able kind becomes
    /// incomplete when it is not listed in `complete`, is not deferred, and
    /// is either new or replaces a deferred node.
    fn replace(&mut self, from: &str, nodes: Vec<Node<AssetGraphNode>>, complete: &HashSet<NodeId>) {
        let delta = self.graph.replace_nodes_connected_to(from, nodes, ());
        self.hash = None;

        for (id, previous) in delta.added {
            let Some(node) = self.graph.get_node(&id) else {
                continue;
            };

            if node.value.can_be_incomplete()
                && !complete.contains(&id)
                && !node.value.is_deferred()
                && previous.as_ref().is_none_or(AssetGraphNode::is_deferred)
            {
                self.mark_incomplete(id);
            }
        }

        for node in delta.removed {
            self.incomplete.shift_remove(&node.id);
            self.changes.removed.push(node);
        }
    }

    pub fn resolve_entry(&mut self, specifier: &str, resolved: Vec<Entry>) {
        let id = entry_specifier_node(specifier).id;
        if !self.graph.has_node(&id) {
            return;
        }

        let nodes = resolved.into_iter().map(entry_file_node).collect();
        self.replace(&id, nodes, &HashSet::new());
        self.mark_complete(&id);
    }

    /// Connects one entry dependency per target below the entry file.
    pub fn resolve_targets(&mut self, entry: &Entry, targets: &[Target]) {
        let id = entry_file_node(entry.clone()).id;
        if !self.graph.has_node(&id) {
            return;
        }

        let nodes = targets
            .iter()
            .map(|target| {
                dependency_node(Dependency::new(DependencyOptions {
                    module_specifier: entry.file_path.to_string(),
                    pipeline: Some(target.name.clone()),
                    target: Some(target.clone()),
                    env: target.env.clone(),
                    is_entry: true,
                    ..Default::default()
                }))
            })
            .collect();

        self.replace(&id, nodes, &HashSet::new());
        self.mark_complete(&id);
    }

    pub fn resolve_dependency(&mut self, dependency: &Dependency, group: Option<AssetGroup>) {
        let id = dependency.id.clone();
        if !self.graph.has_node(&id) {
            return;
        }
        self.mark_complete(&id);

        let Some(group) = group else {
            return;
        };

        let defer = self.should_defer_dependency(dependency, group.side_effects);

        let mut dependency = dependency.clone();
        dependency.is_deferred = defer;
        self.graph.add_node(dependency_node(dependency));

        // an existing group is never downgraded to deferred
        let group_id: NodeId = group.id().into();
        let existing = self.graph.get_node(&group_id).map(|node| node.value.is_deferred());
        let deferred = existing.map_or(defer, |existing| existing && defer);

        self.replace(&id, vec![asset_group_node(group, deferred)], &HashSet::new());

        if existing.is_some() {
            self.undefer_descendants(&group_id);
        }
    }

    /// Re-checks deferred groups below `start`, whose ancestor dependencies
    /// may have changed, and brings back the ones that no longer qualify.
    fn undefer_descendants(&mut self, start: &NodeId) {
        let mut flips = Vec::new();

        self.graph.traverse(Some(&**start), |node, parent, actions| {
            if &node.id == start {
                return;
            }

            match &node.value {
                AssetGraphNode::Dependency(dependency) if !dependency.is_deferred => {
                    actions.skip_children();
                }
                AssetGraphNode::AssetGroup { group, deferred } => {
                    if *deferred
                        && let Some(parent) = parent
                        && let AssetGraphNode::Dependency(dependency) = &parent.value
                        && !self.should_defer_dependency(dependency, group.side_effects)
                    {
                        flips.push((parent.id.clone(), node.id.clone()));
                    }
                    actions.skip_children();
                }
                _ => {}
            }
        });

        for (dependency_id, group_id) in flips {
            if let Some(node) = self.graph.get_node_mut(&dependency_id)
                && let AssetGraphNode::Dependency(dependency) = &mut node.value
            {
                dependency.is_deferred = false;
            }

            if let Some(node) = self.graph.get_node_mut(&group_id)
                && let AssetGraphNode::AssetGroup { deferred, .. } = &mut node.value
            {
                *deferred = false;
            }

            tracing::debug!("undeferring asset group {group_id}");
            self.hash = None;
            self.mark_incomplete(group_id);
        }
    }

    /// Decides whether transforming the target of a dependency can be
    /// skipped.
    ///
    /// A dependency is deferred when it is weak, its target has no side
    /// effects, it does not import the namespace, and no dependency reaching
    /// the asset that declares it uses any of the symbols it re-exports
    /// through this dependency.
    pub fn should_defer_dependency(&self, dependency: &Dependency, side_effects: Option<bool>) -> bool {
        if !dependency.is_weak || side_effects != Some(false) || dependency.imports_namespace() {
            return false;
        }

        if !self.graph.has_node(&dependency.id) {
            return false;
        }

        let parents = self.graph.get_nodes_connected_to(&dependency.id);
        let [parent] = parents.as_slice() else {
            return false;
        };
        let AssetGraphNode::Asset(asset) = &parent.value else {
            return false;
        };

        let locals: HashSet<&str> = dependency.symbols.values().map(String::as_str).collect();

        self.get_incoming_dependencies(asset).iter().all(|incoming| {
            !(incoming.env.is_library && incoming.is_entry)
                && !incoming.imports_namespace()
                && !incoming.symbols.keys().any(|symbol| {
                    asset
                        .symbols
                        .get(symbol)
                        .is_some_and(|local| locals.contains(local.as_str()))
                })
        })
    }

    /// Connects the assets produced for a group. Assets that satisfy a
    /// dependency of a sibling asset (matched by unique key) hang off that
    /// dependency instead of the group.
    pub fn resolve_asset_group(&mut self, group: &AssetGroup, assets: Vec<Asset>) {
        let group_id = group.id();
        self.mark_complete(&group_id);
        if !self.graph.has_node(&group_id) {
            return;
        }

        let find = |specifier: &str| {
            assets
                .iter()
                .find(|asset| asset.unique_key.as_deref() == Some(specifier))
        };

        let mut dependent_keys = HashSet::new();
        let mut resolved = Vec::with_capacity(assets.len());

        for asset in &assets {
            let dependents: Vec<Asset> = asset
                .dependencies
                .values()
                .filter_map(|dependency| find(&dependency.module_specifier))
                .cloned()
                .collect();

            dependent_keys.extend(dependents.iter().filter_map(|a| a.unique_key.clone()));
            resolved.push((asset.clone(), dependents));
        }

        let direct = resolved
            .iter()
            .filter(|(asset, _)| {
                asset
                    .unique_key
                    .as_ref()
                    .is_none_or(|key| !dependent_keys.contains(key))
            })
            .map(|(asset, _)| asset_node(asset.clone()))
            .collect();

        self.replace(&group_id, direct, &HashSet::new());

        // dependents only exist once their parent asset was resolved
        let mut pending = resolved;
        loop {
            let before = pending.len();
            pending.retain(|(asset, dependents)| {
                if self.graph.has_node(&asset.id) {
                    self.resolve_asset(asset, dependents);
                    false
                } else {
                    true
                }
            });

            if pending.is_empty() || pending.len() == before {
                break;
            }
        }

        for (asset, _) in pending {
            tracing::debug!("asset {} of {} is unreachable", asset.id, group.file_path);
        }
    }

    pub fn resolve_asset(&mut self, asset: &Asset, dependent_assets: &[Asset]) {
        let mut nodes = Vec::with_capacity(asset.dependencies.len());
        let mut complete = HashSet::new();
        let mut wired = Vec::new();

        for dependency in asset.dependencies.values() {
            let node = match self.graph.get_node(&dependency.id) {
                Some(existing) => existing.clone(),
                None => dependency_node(dependency.clone()),
            };
            nodes.push(node);

            let dependent = dependent_assets
                .iter()
                .find(|a| a.unique_key.as_deref() == Some(dependency.module_specifier.as_str()));

            if let Some(dependent) = dependent {
                complete.insert(dependency.id.clone());
                wired.push((dependency.id.clone(), asset_node(dependent.clone())));
            }
        }

        self.replace(&asset.id, nodes, &complete);

        for (dependency_id, node) in wired {
            self.replace(&dependency_id, vec![node], &HashSet::new());
        }
    }

    /// The nearest dependencies above an asset.
    pub fn get_incoming_dependencies(&self, asset: &Asset) -> Vec<&Dependency> {
        if !self.graph.has_node(&asset.id) {
            return Vec::new();
        }

        self.graph
            .find_ancestors(&asset.id, |node| matches!(node.value, AssetGraphNode::Dependency(_)))
            .into_iter()
            .filter_map(|node| node.value.as_dependency())
            .collect()
    }

    /// Visits assets only, in graph traversal order.
    pub fn traverse_assets<F>(&self, start: Option<&str>, mut visit: F)
    where
        F: FnMut(&Asset, &mut TraversalActions),
    {
        self.graph.traverse(start, |node, _, actions| {
            if let AssetGraphNode::Asset(asset) = &node.value {
                visit(asset, actions);
            }
        });
    }

    /// Asset groups reachable from the root without passing through another
    /// group.
    pub fn get_entry_asset_group_nodes(&self) -> Vec<&Node<AssetGraphNode>> {
        let mut found = Vec::new();
        self.graph.traverse(None, |node, _, actions| {
            if let AssetGraphNode::AssetGroup { .. } = node.value {
                found.push(node);
                actions.skip_children();
            }
        });
        found
    }

    pub fn get_entry_assets(&self) -> Vec<&Asset> {
        let mut found = Vec::new();
        self.graph.traverse(None, |node, _, actions| {
            if let AssetGraphNode::Asset(asset) = &node.value {
                found.push(asset);
                actions.skip_children();
            }
        });
        found
    }

    /// Digest over every asset output and every target, memoized until the
    /// graph changes.
    pub fn get_hash(&mut self) -> String {
        if let Some(hash) = &self.hash {
            return hash.clone();
        }

        let mut hasher = Blake3Hasher::default();
        self.graph.traverse(None, |node, _, _| match &node.value {
            AssetGraphNode::Asset(asset) => {
                hasher.update(&asset.output_hash);
            }
            AssetGraphNode::Dependency(dependency) => {
                if let Some(target) = &dependency.target {
                    let _ = serde_json::to_writer(&mut hasher, target);
                }
            }
            _ => {}
        });

        let hash = Hash32::from(hasher).to_hex();
        self.hash = Some(hash.clone());
        hash
    }

    pub fn save(&self, path: &Utf8Path) -> io::Result<()> {
        save_cbor(path, self)
    }

    /// Restores a snapshot written by [`AssetGraph::save`]. The change queue
    /// of a restored graph starts empty.
    pub fn load(path: &Utf8Path) -> Option<Self> {
        load_cbor(path)
    }
}

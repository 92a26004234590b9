use std::collections::HashSet;
use std::io;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use crate::core::{load_cbor, normalize_path, save_cbor};
use crate::graph::{Graph, Node, NodeId};
use crate::request::{Invalidation, RequestDesc, RequestResult, RequestType, RunApi};
use crate::types::{FileEvent, FileEventKind};

const ROOT_ID: &str = "@@request_root";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestEdge {
    SubRequest,
    InvalidateOnUpdate,
    InvalidateOnDelete,
}

/// A request together with its last stored result.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request {
    pub desc: RequestDesc,
    pub result: Option<Arc<RequestResult>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RequestGraphNode {
    Root,
    Request(Request),
    File(Utf8PathBuf),
}

fn file_id(path: &Utf8Path) -> NodeId {
    format!("file:{}", normalize_path(path)).into()
}

/// Memoized requests, the files they depend on, and which of them need to
/// run again.
///
/// Requests added by the build hang off an internal root over `SubRequest`
/// edges, so dropping that edge prunes a request along with every
/// sub-request and file node only it kept alive.
#[derive(Debug, Serialize, Deserialize)]
pub struct RequestGraph {
    graph: Graph<RequestGraphNode, RequestEdge>,
    invalid: IndexSet<NodeId>,
}

impl Default for RequestGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestGraph {
    pub fn new() -> Self {
        let mut graph = Graph::new();
        graph.set_root_node(Node::new(ROOT_ID, RequestGraphNode::Root));

        Self {
            graph,
            invalid: IndexSet::new(),
        }
    }

    pub fn graph(&self) -> &Graph<RequestGraphNode, RequestEdge> {
        &self.graph
    }

    pub fn get_request(&self, id: &str) -> Option<&Request> {
        match &self.graph.get_node(id)?.value {
            RequestGraphNode::Request(request) => Some(request),
            _ => None,
        }
    }

    fn get_request_mut(&mut self, id: &str) -> Option<&mut Request> {
        match &mut self.graph.get_node_mut(id)?.value {
            RequestGraphNode::Request(request) => Some(request),
            _ => None,
        }
    }

    pub fn has_request(&self, id: &str) -> bool {
        self.get_request(id).is_some()
    }

    /// A request is valid when it has a stored result nothing invalidated.
    pub fn is_valid(&self, id: &str) -> bool {
        !self.invalid.contains(id) && self.get_request(id).is_some_and(|request| request.result.is_some())
    }

    pub fn get_result(&self, id: &str) -> Option<&Arc<RequestResult>> {
        if !self.is_valid(id) {
            return None;
        }

        self.get_request(id)?.result.as_ref()
    }

    /// Requests that have to run before their result can be used again.
    pub fn invalid_requests(&self) -> impl Iterator<Item = &NodeId> {
        self.invalid.iter()
    }

    /// Whether the request was added by the build rather than by another
    /// request.
    pub fn is_top_level(&self, id: &str) -> bool {
        self.graph.has_node(id) && self.graph.has_edge(ROOT_ID, id, &RequestEdge::SubRequest)
    }

    /// Adds a top level request. New requests start out invalid.
    pub fn add_request(&mut self, desc: RequestDesc) -> NodeId {
        let id = self.upsert(desc, None);
        self.graph.add_edge(ROOT_ID, &id, RequestEdge::SubRequest);
        id
    }

    /// Attaches a child request to `parent`. A child stored with a result is
    /// valid right away, otherwise it has to run.
    pub fn add_sub_request(
        &mut self,
        parent: &str,
        desc: RequestDesc,
        result: Option<Arc<RequestResult>>,
    ) -> NodeId {
        let id = self.upsert(desc, result);
        self.graph.add_edge(parent, &id, RequestEdge::SubRequest);
        id
    }

    fn upsert(&mut self, desc: RequestDesc, result: Option<Arc<RequestResult>>) -> NodeId {
        let id = desc.id();

        match self.get_request_mut(&id) {
            Some(request) => {
                // same id, but fields outside the identity may have changed
                request.desc = desc;
                if let Some(result) = result {
                    request.result = Some(result);
                    self.invalid.shift_remove(&id);
                }
            }
            None => {
                let valid = result.is_some();
                self.graph
                    .add_node(Node::new(id.clone(), RequestGraphNode::Request(Request { desc, result })));
                if !valid {
                    self.invalid.insert(id.clone());
                }
            }
        }

        id
    }

    /// Ids of the children of a request, in the order they were added.
    pub fn sub_requests(&self, id: &str) -> Vec<NodeId> {
        self.graph
            .get_nodes_connected_from_by(id, &RequestEdge::SubRequest)
            .into_iter()
            .map(|node| node.id.clone())
            .collect()
    }

    /// Makes `children` the exact sub-request set of `parent`, pruning
    /// children no other request refers to.
    pub fn replace_sub_requests(&mut self, parent: &str, children: &[NodeId]) {
        let nodes = children
            .iter()
            .filter_map(|id| self.graph.get_node(id).cloned())
            .collect();

        let delta = self
            .graph
            .replace_nodes_connected_to(parent, nodes, RequestEdge::SubRequest);
        self.forget(&delta.removed);
    }

    /// Drops every file invalidation of a request.
    pub fn clear_invalidations(&mut self, id: &str) {
        for kind in [RequestEdge::InvalidateOnUpdate, RequestEdge::InvalidateOnDelete] {
            let delta = self.graph.replace_nodes_connected_to(id, Vec::new(), kind);
            self.forget(&delta.removed);
        }
    }

    /// Connects a file with the edge kind that fits the request: dependency
    /// resolutions only care about deletion, everything else about changes.
    pub fn connect_file(&mut self, id: &str, path: &Utf8Path) {
        let kind = match self.get_request(id).map(|request| request.desc.request_type()) {
            Some(RequestType::DepPathRequest) => RequestEdge::InvalidateOnDelete,
            _ => RequestEdge::InvalidateOnUpdate,
        };

        self.add_file_edge(id, path, kind);
    }

    pub fn invalidate_on_file_update(&mut self, id: &str, path: &Utf8Path) {
        self.add_file_edge(id, path, RequestEdge::InvalidateOnUpdate);
    }

    pub fn invalidate_on_file_delete(&mut self, id: &str, path: &Utf8Path) {
        self.add_file_edge(id, path, RequestEdge::InvalidateOnDelete);
    }

    fn add_file_edge(&mut self, id: &str, path: &Utf8Path, kind: RequestEdge) {
        let file = file_id(path);
        if !self.graph.has_node(&file) {
            self.graph
                .add_node(Node::new(file.clone(), RequestGraphNode::File(normalize_path(path))));
        }
        self.graph.add_edge(id, &file, kind);
    }

    /// Marks a request invalid along with every request that depends on it
    /// through sub-request edges.
    pub fn invalidate_request(&mut self, id: &str) {
        let mut stack: Vec<NodeId> = vec![id.into()];
        let mut visited = HashSet::new();

        while let Some(id) = stack.pop() {
            if !self.has_request(&id) || !visited.insert(id.clone()) {
                continue;
            }

            self.invalid.insert(id.clone());

            for parent in self.graph.get_nodes_connected_to_by(&id, &RequestEdge::SubRequest) {
                if let RequestGraphNode::Request(_) = parent.value {
                    stack.push(parent.id.clone());
                }
            }
        }
    }

    /// Invalidates the requests affected by a batch of file events. Returns
    /// whether anything was invalidated.
    pub fn respond_to_fs_events(&mut self, events: &[FileEvent]) -> bool {
        let mut invalidated = false;

        for event in events {
            let file = file_id(&event.path);
            if !self.graph.has_node(&file) {
                if event.kind == FileEventKind::Create {
                    tracing::debug!("No request depends on created file {}", event.path);
                }
                continue;
            }

            let kind = match event.kind {
                FileEventKind::Create | FileEventKind::Update => RequestEdge::InvalidateOnUpdate,
                FileEventKind::Delete => RequestEdge::InvalidateOnDelete,
            };

            let requests: Vec<NodeId> = self
                .graph
                .get_nodes_connected_to_by(&file, &kind)
                .into_iter()
                .map(|node| node.id.clone())
                .collect();

            for id in requests {
                tracing::debug!("Invalidating request {id} after {:?} of {}", event.kind, event.path);
                self.invalidate_request(&id);
                invalidated = true;
            }
        }

        invalidated
    }

    /// Requests depending on `path` through either kind of file edge.
    pub fn file_dependents(&self, path: &Utf8Path) -> Vec<&Request> {
        let file = file_id(path);
        if !self.graph.has_node(&file) {
            return Vec::new();
        }

        self.graph
            .get_nodes_connected_to(&file)
            .into_iter()
            .filter_map(|node| match &node.value {
                RequestGraphNode::Request(request) => Some(request),
                _ => None,
            })
            .collect()
    }

    /// Stores a result and marks the request valid.
    pub fn set_result(&mut self, id: &str, result: Arc<RequestResult>) {
        if let Some(request) = self.get_request_mut(id) {
            request.result = Some(result);
            self.invalid.shift_remove(id);
        }
    }

    /// Detaches a top level request, pruning it along with the sub-requests
    /// and files nothing else refers to.
    pub fn remove_request(&mut self, id: &str) {
        if !self.is_top_level(id) {
            return;
        }

        let removed = self.graph.remove_edge(ROOT_ID, id, &RequestEdge::SubRequest);
        self.forget(&removed);
    }

    /// Records what a request declared during its run. Returns the
    /// sub-requests, at any depth, that still have to run before the request
    /// can resolve.
    pub(crate) fn apply(&mut self, id: &str, api: RunApi) -> Vec<NodeId> {
        self.clear_invalidations(id);

        for invalidation in api.invalidations {
            match invalidation {
                Invalidation::Connect(path) => self.connect_file(id, &path),
                Invalidation::Update(path) => self.invalidate_on_file_update(id, &path),
                Invalidation::Delete(path) => self.invalidate_on_file_delete(id, &path),
            }
        }

        let mut pending = Vec::new();
        let mut children = Vec::with_capacity(api.sub_requests.len());

        for sub in api.sub_requests {
            let child = self.add_sub_request(id, sub.desc, sub.result);
            if let Some(api) = sub.api {
                pending.extend(self.apply(&child, api));
            }
            if !self.is_valid(&child) {
                pending.push(child.clone());
            }
            children.push(child);
        }

        self.replace_sub_requests(id, &children);
        pending
    }

    fn forget(&mut self, removed: &[Node<RequestGraphNode>]) {
        for node in removed {
            self.invalid.shift_remove(&node.id);
        }
    }

    pub fn save(&self, path: &Utf8Path) -> io::Result<()> {
        save_cbor(path, self)
    }

    pub fn load(path: &Utf8Path) -> Option<Self> {
        load_cbor(path)
    }
}

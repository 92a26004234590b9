//! Requests are the memoized units of work behind the asset graph.
//!
//! Every request is described by a [`RequestDesc`], which also determines its
//! id. Runners receive the description and a [`RunApi`] through which they
//! declare what their result depends on: files whose change or deletion
//! invalidates it, and sub-requests.

mod asset;
mod config;
mod dep_path;
mod dep_version;
mod entry;
mod graph;
mod target;
mod tracker;

use std::collections::HashMap;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::cache::Cache;
use crate::config::ConfigSnapshot;
use crate::core::Hash32;
use crate::error::RequestError;
use crate::graph::NodeId;
use crate::options::BuildOptions;
use crate::types::{Asset, AssetGroup, Dependency, Entry, Target};

pub(crate) use entry::is_glob;
pub use graph::{Request, RequestEdge, RequestGraph, RequestGraphNode};
pub use tracker::{Diagnostics, RequestExecution, RequestFailure, RequestTracker};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    EntryRequest,
    TargetRequest,
    DepPathRequest,
    AssetRequest,
    ConfigRequest,
    DepVersionRequest,
}

impl RequestType {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestType::EntryRequest => "entry_request",
            RequestType::TargetRequest => "target_request",
            RequestType::DepPathRequest => "dep_path_request",
            RequestType::AssetRequest => "asset_request",
            RequestType::ConfigRequest => "config_request",
            RequestType::DepVersionRequest => "dep_version_request",
        }
    }
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Config of one transformer for one file.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfigRequestDesc {
    pub file_path: Utf8PathBuf,
    pub plugin: String,
}

/// Installed version of a package, looked up from a directory.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DepVersionRequestDesc {
    pub module_specifier: String,
    pub resolve_from: Utf8PathBuf,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RequestDesc {
    /// Expand an entry specifier into entry files.
    Entry(String),
    /// Find the targets an entry file builds into.
    Target(Entry),
    /// Resolve a dependency to an asset group.
    DepPath(Dependency),
    /// Load and transform an asset group.
    Asset(AssetGroup),
    Config(ConfigRequestDesc),
    DepVersion(DepVersionRequestDesc),
}

impl RequestDesc {
    pub fn request_type(&self) -> RequestType {
        match self {
            RequestDesc::Entry(_) => RequestType::EntryRequest,
            RequestDesc::Target(_) => RequestType::TargetRequest,
            RequestDesc::DepPath(_) => RequestType::DepPathRequest,
            RequestDesc::Asset(_) => RequestType::AssetRequest,
            RequestDesc::Config(_) => RequestType::ConfigRequest,
            RequestDesc::DepVersion(_) => RequestType::DepVersionRequest,
        }
    }

    /// Deterministic id of the request node.
    pub fn id(&self) -> NodeId {
        let hash = match self {
            RequestDesc::DepPath(dependency) => Hash32::hash(dependency.id.as_bytes()),
            RequestDesc::Config(desc) => Hash32::hash(format!("{}:{}", desc.file_path, desc.plugin)),
            desc => Hash32::hash_json(&(desc.request_type(), desc)),
        };

        hash.to_hex().into()
    }

    /// Short human readable label used in logs and diagnostics.
    pub fn name(&self) -> String {
        match self {
            RequestDesc::Entry(specifier) => specifier.clone(),
            RequestDesc::Target(entry) => entry.file_path.to_string(),
            RequestDesc::DepPath(dependency) => dependency.module_specifier.clone(),
            RequestDesc::Asset(group) => group.file_path.to_string(),
            RequestDesc::Config(desc) => format!("{} ({})", desc.file_path, desc.plugin),
            RequestDesc::DepVersion(desc) => desc.module_specifier.clone(),
        }
    }
}

/// What a transformer config request produced.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfigResult {
    pub value: serde_json::Value,
    pub files: Vec<Utf8PathBuf>,
    pub dev_deps: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RequestResult {
    Entry(Vec<Entry>),
    Target(Vec<Target>),
    /// `None` for an optional dependency that couldn't be found.
    DepPath(Option<AssetGroup>),
    Asset(Vec<Asset>),
    Config(Option<ConfigResult>),
    DepVersion(Option<String>),
}

/// Shared state every runner can read.
pub struct RunContext {
    pub options: Arc<BuildOptions>,
    pub cache: Arc<Cache>,
    pub config: Arc<ConfigSnapshot>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Invalidation {
    /// Edge kind picked from the request type.
    Connect(Utf8PathBuf),
    Update(Utf8PathBuf),
    Delete(Utf8PathBuf),
}

/// A sub-request declared by a runner.
#[derive(Debug)]
pub(crate) struct SubRequest {
    pub desc: RequestDesc,
    /// Results computed in place by the parent, stored without running.
    pub result: Option<Arc<RequestResult>>,
    /// Dependencies recorded while computing `result`.
    pub api: Option<RunApi>,
}

/// Dependencies declared by a runner while it runs.
#[derive(Debug, Default)]
pub struct RunApi {
    pub(crate) invalidations: Vec<Invalidation>,
    pub(crate) sub_requests: Vec<SubRequest>,
    /// Valid results of the sub-requests of the previous run.
    cached: HashMap<NodeId, Arc<RequestResult>>,
}

impl RunApi {
    pub(crate) fn with_cached(cached: HashMap<NodeId, Arc<RequestResult>>) -> Self {
        Self {
            cached,
            ..Default::default()
        }
    }

    /// Depend on a file with the default edge kind of this request.
    pub fn connect_file(&mut self, path: impl Into<Utf8PathBuf>) {
        self.invalidations.push(Invalidation::Connect(path.into()));
    }

    pub fn invalidate_on_file_update(&mut self, path: impl Into<Utf8PathBuf>) {
        self.invalidations.push(Invalidation::Update(path.into()));
    }

    pub fn invalidate_on_file_delete(&mut self, path: impl Into<Utf8PathBuf>) {
        self.invalidations.push(Invalidation::Delete(path.into()));
    }

    /// Declare a sub-request the tracker runs before this request resolves.
    pub fn add_sub_request(&mut self, desc: RequestDesc) {
        self.sub_requests.push(SubRequest {
            desc,
            result: None,
            api: None,
        });
    }

    /// Declare a sub-request whose result was computed by the caller, along
    /// with the dependencies recorded while computing it.
    pub fn store_sub_request(&mut self, desc: RequestDesc, result: Arc<RequestResult>, api: Option<RunApi>) {
        self.sub_requests.push(SubRequest {
            desc,
            result: Some(result),
            api,
        });
    }

    /// Still valid result of a sub-request from the previous run.
    pub fn cached_result(&self, desc: &RequestDesc) -> Option<Arc<RequestResult>> {
        self.cached.get(&desc.id()).cloned()
    }
}

/// Runs a request to completion on the current thread.
pub fn run_request(desc: &RequestDesc, ctx: &RunContext, api: &mut RunApi) -> Result<RequestResult, RequestError> {
    match desc {
        RequestDesc::Entry(specifier) => entry::run(specifier, ctx, api),
        RequestDesc::Target(entry) => target::run(entry, ctx, api),
        RequestDesc::DepPath(dependency) => dep_path::run(dependency, ctx, api),
        RequestDesc::Asset(group) => asset::run(group, ctx, api),
        RequestDesc::Config(desc) => config::run(desc, ctx, api),
        RequestDesc::DepVersion(desc) => dep_version::run(desc, ctx, api),
    }
}

/// Reads and parses a JSON manifest, `None` when the file doesn't exist.
fn read_manifest(path: &Utf8Path) -> Result<Option<serde_json::Value>, RequestError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    serde_json::from_str(&text)
        .map(Some)
        .map_err(|err| RequestError::Manifest(path.to_path_buf(), err))
}

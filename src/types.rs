use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::core::{ArcStr, Hash32, normalize_path};

/// Runtime the output is meant for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Context {
    #[default]
    Browser,
    WebWorker,
    ServiceWorker,
    Node,
    ElectronMain,
    ElectronRenderer,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Environment {
    pub context: Context,
    pub engines: BTreeMap<String, String>,
    pub include_node_modules: bool,
    pub is_library: bool,
}

impl Environment {
    /// Short stable digest, handy for logging and cache keys.
    pub fn id(&self) -> String {
        Hash32::hash_json(self).to_hex()[..16].to_string()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub name: String,
    pub dist_dir: Utf8PathBuf,
    #[serde(default)]
    pub env: Environment,
    #[serde(default = "default_public_url")]
    pub public_url: String,
}

fn default_public_url() -> String {
    "/".into()
}

/// An entry point located on disk, with the package that owns it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entry {
    pub file_path: Utf8PathBuf,
    pub package_path: Utf8PathBuf,
}

/// Everything needed to construct a [`Dependency`]. Fields not listed in
/// [`Dependency`] identity are free to change without changing its id.
#[derive(Clone, Debug, Default)]
pub struct DependencyOptions {
    pub source_path: Option<Utf8PathBuf>,
    pub module_specifier: String,
    pub symbols: BTreeMap<String, String>,
    pub is_async: bool,
    pub is_weak: bool,
    pub is_optional: bool,
    pub is_entry: bool,
    pub env: Environment,
    pub target: Option<Target>,
    pub pipeline: Option<String>,
}

/// An edge of intent: "module at `source_path` imports `module_specifier`".
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    pub id: ArcStr,
    pub source_path: Option<Utf8PathBuf>,
    pub module_specifier: String,
    /// Imported name to local name. `*` imports the whole namespace.
    pub symbols: BTreeMap<String, String>,
    pub is_async: bool,
    pub is_weak: bool,
    pub is_optional: bool,
    pub is_entry: bool,
    pub is_deferred: bool,
    pub env: Environment,
    pub target: Option<Target>,
    pub pipeline: Option<String>,
}

impl Dependency {
    pub fn new(options: DependencyOptions) -> Self {
        #[derive(Serialize)]
        struct Identity<'a> {
            source_path: &'a Option<Utf8PathBuf>,
            module_specifier: &'a str,
            env: &'a Environment,
            target: &'a Option<Target>,
            pipeline: &'a Option<String>,
        }

        let id = Hash32::hash_json(&Identity {
            source_path: &options.source_path,
            module_specifier: &options.module_specifier,
            env: &options.env,
            target: &options.target,
            pipeline: &options.pipeline,
        });

        Self {
            id: id.to_hex().into(),
            source_path: options.source_path,
            module_specifier: options.module_specifier,
            symbols: options.symbols,
            is_async: options.is_async,
            is_weak: options.is_weak,
            is_optional: options.is_optional,
            is_entry: options.is_entry,
            is_deferred: false,
            env: options.env,
            target: options.target,
            pipeline: options.pipeline,
        }
    }

    pub fn imports_namespace(&self) -> bool {
        self.symbols.contains_key("*")
    }

    /// Directory resolution of this dependency starts from.
    pub fn resolve_from(&self) -> Option<&Utf8Path> {
        self.source_path.as_deref().and_then(Utf8Path::parent)
    }
}

/// A file (or inline code) waiting to be transformed in an environment.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetGroup {
    pub file_path: Utf8PathBuf,
    pub env: Environment,
    pub side_effects: Option<bool>,
    pub code: Option<String>,
    pub pipeline: Option<String>,
}

impl AssetGroup {
    pub fn new(file_path: impl Into<Utf8PathBuf>, env: Environment) -> Self {
        Self {
            file_path: file_path.into(),
            env,
            side_effects: None,
            code: None,
            pipeline: None,
        }
    }

    pub fn id(&self) -> String {
        Hash32::hash_json(self).to_hex()
    }
}

/// Raw payload of a transformation output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum Blob {
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

impl Blob {
    pub fn as_bytes(&self) -> std::borrow::Cow<'_, [u8]> {
        match self {
            Blob::Text(text) => text.as_bytes().into(),
            Blob::Bytes(bytes) => bytes.as_slice().into(),
            Blob::Json(value) => serde_json::to_vec(value).unwrap_or_default().into(),
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Output blob either held in memory or stored in the cache.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum OutputBlob {
    Inline(Blob),
    Cached(Utf8PathBuf),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetStats {
    pub time_ms: u64,
    pub size: u64,
}

/// A transformed module.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: ArcStr,
    pub file_path: Utf8PathBuf,
    pub asset_type: String,
    /// Hash of the source content.
    pub hash: String,
    /// Hash of the produced outputs.
    pub output_hash: String,
    pub unique_key: Option<String>,
    /// Declared dependencies keyed by dependency id, in declaration order.
    pub dependencies: IndexMap<ArcStr, Dependency>,
    /// Exported name to local name.
    pub symbols: BTreeMap<String, String>,
    pub outputs: IndexMap<String, OutputBlob>,
    pub env: Environment,
    pub side_effects: bool,
    pub stats: AssetStats,
    pub included_files: Vec<Utf8PathBuf>,
}

impl Asset {
    pub fn new(
        file_path: impl Into<Utf8PathBuf>,
        asset_type: impl Into<String>,
        env: Environment,
        content: Blob,
    ) -> Self {
        let file_path = file_path.into();
        let asset_type = asset_type.into();
        let hash = Hash32::hash(content.as_bytes()).to_hex();

        let mut asset = Self {
            id: "".into(),
            file_path,
            asset_type,
            hash,
            output_hash: String::new(),
            unique_key: None,
            dependencies: IndexMap::new(),
            symbols: BTreeMap::new(),
            outputs: IndexMap::from([("content".to_string(), OutputBlob::Inline(content))]),
            env,
            side_effects: true,
            stats: AssetStats::default(),
            included_files: Vec::new(),
        };
        asset.refresh();
        asset
    }

    pub fn with_unique_key(mut self, unique_key: impl Into<String>) -> Self {
        self.unique_key = Some(unique_key.into());
        self.refresh();
        self
    }

    /// Declares a dependency of this asset. Source path and environment are
    /// taken from the asset.
    pub fn add_dependency(&mut self, options: DependencyOptions) -> ArcStr {
        let dependency = Dependency::new(DependencyOptions {
            source_path: Some(self.file_path.clone()),
            env: self.env.clone(),
            ..options
        });
        let id = dependency.id.clone();
        self.dependencies.insert(id.clone(), dependency);
        id
    }

    pub fn set_output(&mut self, key: impl Into<String>, blob: Blob) {
        self.outputs.insert(key.into(), OutputBlob::Inline(blob));
        self.refresh();
    }

    pub fn content(&self) -> Option<&OutputBlob> {
        self.outputs.get("content")
    }

    /// Recomputes the id and output hash from the current fields.
    pub fn refresh(&mut self) {
        #[derive(Serialize)]
        struct Identity<'a> {
            env: &'a Environment,
            file_path: &'a Utf8Path,
            asset_type: &'a str,
            unique_key: &'a Option<String>,
        }

        self.id = Hash32::hash_json(&Identity {
            env: &self.env,
            file_path: &self.file_path,
            asset_type: &self.asset_type,
            unique_key: &self.unique_key,
        })
        .to_hex()
        .into();

        let mut hasher = crate::core::Blake3Hasher::default();
        let mut size = 0;
        for (key, blob) in &self.outputs {
            hasher.update(key.as_bytes());
            match blob {
                OutputBlob::Inline(blob) => {
                    let bytes = blob.as_bytes();
                    size += bytes.len() as u64;
                    hasher.update(&bytes);
                }
                OutputBlob::Cached(path) => {
                    hasher.update(path.as_str().as_bytes());
                }
            }
        }
        self.output_hash = Hash32::from(hasher).to_hex();
        if size > 0 {
            self.stats.size = size;
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileEventKind {
    Create,
    Update,
    Delete,
}

/// A filesystem change reported by the watcher.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileEvent {
    pub path: Utf8PathBuf,
    pub kind: FileEventKind,
}

impl FileEvent {
    pub fn new(path: impl Into<Utf8PathBuf>, kind: FileEventKind) -> Self {
        Self {
            path: normalize_path(&path.into()),
            kind,
        }
    }
}

//! Collaborator traits and the registry that turns a [`Config`] into a table
//! of plugin instances.
//!
//! Plugins are plain Rust trait objects registered by name. Loading a config
//! looks every named plugin up in the [`PluginRegistry`] once and produces an
//! immutable [`Plugins`] table; unknown names fail the load.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};

use crate::asset_graph::AssetGraph;
use crate::config::{Config, GlobMap};
use crate::error::{ConfigError, PluginError};
use crate::options::BuildOptions;
use crate::types::{Asset, Blob, Dependency, Target};

/// Where a resolver located a dependency.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Resolution {
    pub file_path: Utf8PathBuf,
    pub side_effects: Option<bool>,
    pub code: Option<String>,
    pub pipeline: Option<String>,
}

pub trait Resolver: Send + Sync {
    /// Returns `None` when the dependency is not handled by this resolver,
    /// letting the next one in the pipeline try.
    fn resolve(&self, dependency: &Dependency, options: &BuildOptions) -> Result<Option<Resolution>, PluginError>;
}

/// Config a transformer loaded for a specific file.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransformerConfig {
    pub value: serde_json::Value,
    /// Files the config was read from.
    pub files: Vec<Utf8PathBuf>,
    /// Packages whose installed version affects the output.
    pub dev_deps: Vec<String>,
}

pub trait Transformer: Send + Sync {
    fn load_config(&self, _file_path: &Utf8Path, _options: &BuildOptions) -> Result<Option<TransformerConfig>, PluginError> {
        Ok(None)
    }

    fn transform(
        &self,
        asset: Asset,
        config: Option<&serde_json::Value>,
        options: &BuildOptions,
    ) -> Result<Vec<Asset>, PluginError>;
}

/// A unit of output produced by the bundler.
#[derive(Clone, Debug, PartialEq)]
pub struct Bundle {
    pub id: String,
    pub name: Option<String>,
    pub bundle_type: String,
    pub target: Target,
    pub entry_asset_ids: Vec<String>,
    pub asset_ids: Vec<String>,
}

pub trait Bundler: Send + Sync {
    fn bundle(&self, graph: &AssetGraph, options: &BuildOptions) -> Result<Vec<Bundle>, PluginError>;
}

pub trait Namer: Send + Sync {
    /// Returns `None` to defer to the next namer.
    fn name(&self, bundle: &Bundle) -> Result<Option<String>, PluginError>;
}

pub trait Runtime: Send + Sync {
    /// Extra assets to package together with the bundle.
    fn apply(&self, bundle: &Bundle, graph: &AssetGraph) -> Result<Vec<Asset>, PluginError>;
}

pub trait Packager: Send + Sync {
    fn package(&self, bundle: &Bundle, assets: &[Asset]) -> Result<Blob, PluginError>;
}

pub trait Optimizer: Send + Sync {
    fn optimize(&self, bundle: &Bundle, contents: Blob) -> Result<Blob, PluginError>;
}

/// Build lifecycle events passed to reporters.
#[derive(Debug)]
pub enum ReportEvent<'a> {
    BuildStart,
    BuildSuccess {
        bundles: &'a [Bundle],
        duration: Duration,
    },
    BuildFailure {
        message: String,
    },
}

pub trait Reporter: Send + Sync {
    fn report(&self, event: &ReportEvent) -> Result<(), PluginError>;
}

/// A plugin instance together with the name it was configured under.
pub struct Named<P: ?Sized> {
    pub name: String,
    pub plugin: Arc<P>,
}

impl<P: ?Sized> Clone for Named<P> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            plugin: self.plugin.clone(),
        }
    }
}

impl<P: ?Sized> std::fmt::Debug for Named<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Named").field(&self.name).finish()
    }
}

/// Plugins resolved from a config.
#[derive(Default)]
pub struct Plugins {
    pub resolvers: Vec<Named<dyn Resolver>>,
    pub transformers: GlobMap<Vec<Named<dyn Transformer>>>,
    pub bundler: Option<Named<dyn Bundler>>,
    pub namers: Vec<Named<dyn Namer>>,
    pub runtimes: GlobMap<Vec<Named<dyn Runtime>>>,
    pub packagers: GlobMap<Named<dyn Packager>>,
    pub optimizers: GlobMap<Vec<Named<dyn Optimizer>>>,
    pub reporters: Vec<Named<dyn Reporter>>,
}

impl Plugins {
    pub fn transformers_for(&self, file_path: &Utf8Path, pipeline: Option<&str>) -> &[Named<dyn Transformer>] {
        self.transformers
            .matching(file_path, pipeline)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Looks a configured transformer up by name.
    pub fn transformer(&self, name: &str) -> Option<&Named<dyn Transformer>> {
        self.transformers.values().flatten().find(|t| t.name == name)
    }

    pub fn report(&self, event: &ReportEvent) {
        for reporter in &self.reporters {
            if let Err(err) = reporter.plugin.report(event) {
                tracing::error!("Reporter '{}' failed: {err}", reporter.name);
            }
        }
    }
}

/// Name to plugin instance lookup, filled in by the embedding application.
#[derive(Default, Clone)]
pub struct PluginRegistry {
    resolvers: HashMap<String, Arc<dyn Resolver>>,
    transformers: HashMap<String, Arc<dyn Transformer>>,
    bundlers: HashMap<String, Arc<dyn Bundler>>,
    namers: HashMap<String, Arc<dyn Namer>>,
    runtimes: HashMap<String, Arc<dyn Runtime>>,
    packagers: HashMap<String, Arc<dyn Packager>>,
    optimizers: HashMap<String, Arc<dyn Optimizer>>,
    reporters: HashMap<String, Arc<dyn Reporter>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolver(mut self, name: impl Into<String>, plugin: impl Resolver + 'static) -> Self {
        self.resolvers.insert(name.into(), Arc::new(plugin));
        self
    }

    pub fn transformer(mut self, name: impl Into<String>, plugin: impl Transformer + 'static) -> Self {
        self.transformers.insert(name.into(), Arc::new(plugin));
        self
    }

    pub fn bundler(mut self, name: impl Into<String>, plugin: impl Bundler + 'static) -> Self {
        self.bundlers.insert(name.into(), Arc::new(plugin));
        self
    }

    pub fn namer(mut self, name: impl Into<String>, plugin: impl Namer + 'static) -> Self {
        self.namers.insert(name.into(), Arc::new(plugin));
        self
    }

    pub fn runtime(mut self, name: impl Into<String>, plugin: impl Runtime + 'static) -> Self {
        self.runtimes.insert(name.into(), Arc::new(plugin));
        self
    }

    pub fn packager(mut self, name: impl Into<String>, plugin: impl Packager + 'static) -> Self {
        self.packagers.insert(name.into(), Arc::new(plugin));
        self
    }

    pub fn optimizer(mut self, name: impl Into<String>, plugin: impl Optimizer + 'static) -> Self {
        self.optimizers.insert(name.into(), Arc::new(plugin));
        self
    }

    pub fn reporter(mut self, name: impl Into<String>, plugin: impl Reporter + 'static) -> Self {
        self.reporters.insert(name.into(), Arc::new(plugin));
        self
    }

    pub fn resolve(&self, config: &Config) -> Result<Plugins, ConfigError> {
        if !config.validators.is_empty() {
            tracing::debug!("validators are accepted in config but never run");
        }

        Ok(Plugins {
            resolvers: lookup_all(&self.resolvers, &config.resolvers, "resolver")?,
            transformers: GlobMap::compile(&config.transformers, |names| {
                lookup_all(&self.transformers, names, "transformer")
            })?,
            bundler: config
                .bundler
                .as_deref()
                .map(|name| lookup(&self.bundlers, name, "bundler"))
                .transpose()?,
            namers: lookup_all(&self.namers, &config.namers, "namer")?,
            runtimes: GlobMap::compile(&config.runtimes, |names| lookup_all(&self.runtimes, names, "runtime"))?,
            packagers: GlobMap::compile(&config.packagers, |name| lookup(&self.packagers, name, "packager"))?,
            optimizers: GlobMap::compile(&config.optimizers, |names| {
                lookup_all(&self.optimizers, names, "optimizer")
            })?,
            reporters: lookup_all(&self.reporters, &config.reporters, "reporter")?,
        })
    }
}

fn lookup<P: ?Sized>(
    map: &HashMap<String, Arc<P>>,
    name: &str,
    kind: &'static str,
) -> Result<Named<P>, ConfigError> {
    match map.get(name) {
        Some(plugin) => Ok(Named {
            name: name.to_string(),
            plugin: plugin.clone(),
        }),
        None => Err(ConfigError::UnknownPlugin {
            kind,
            name: name.to_string(),
        }),
    }
}

fn lookup_all<P: ?Sized>(
    map: &HashMap<String, Arc<P>>,
    names: &[String],
    kind: &'static str,
) -> Result<Vec<Named<P>>, ConfigError> {
    names.iter().map(|name| lookup(map, name, kind)).collect()
}

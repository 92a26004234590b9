//! The build coordinator.
//!
//! An [`Engine`] owns one build session: the asset graph, the request
//! tracker, the cache and the loaded config. [`Engine::build`] turns every
//! incomplete asset graph node into a request, feeds the results back through
//! the `resolve_*` methods until the graph is complete, then hands the graph
//! to the bundling plugins and writes the packaged bundles.
//!
//! Between builds, [`Engine::respond_to_events`] marks the requests affected
//! by file changes invalid so the next build only redoes that work.

use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use camino::{Utf8Path, Utf8PathBuf};
use glob::Pattern;
use rayon::ThreadPool;
use rayon::prelude::*;

use crate::asset_graph::{AssetGraph, AssetGraphNode};
use crate::cache::Cache;
use crate::config::{Config, ConfigLoader, ConfigSnapshot};
use crate::core::{Hash32, normalize_path};
use crate::error::{BuildError, ConfigError};
use crate::options::BuildOptions;
use crate::plugin::{Bundle, PluginRegistry, Plugins, ReportEvent};
use crate::request::{Diagnostics, RequestDesc, RequestGraph, RequestResult, RequestTracker, RunContext, is_glob};
use crate::signal::AbortSignal;
use crate::types::{Asset, FileEvent, FileEventKind};

/// A bundle as written to disk.
#[derive(Clone, Debug)]
pub struct PackagedBundle {
    pub bundle: Bundle,
    pub file_path: Utf8PathBuf,
    pub size: u64,
    pub hash: String,
}

#[derive(Debug)]
pub struct BuildResult {
    pub bundles: Vec<PackagedBundle>,
    /// Digest of the asset graph the bundles were produced from.
    pub hash: String,
    pub duration: Duration,
}

pub struct Engine {
    options: Arc<BuildOptions>,
    registry: PluginRegistry,
    loader: ConfigLoader,
    config: Arc<ConfigSnapshot>,
    cache: Arc<Cache>,
    pool: Arc<ThreadPool>,
    signal: AbortSignal,
    asset_graph: AssetGraph,
    tracker: RequestTracker,
}

impl Engine {
    /// Starts a session. Relative paths in `options` are taken relative to
    /// the project root, which must exist. Unless the cache is disabled, the
    /// graphs of the previous session with the same options are restored.
    pub fn new(
        mut options: BuildOptions,
        registry: PluginRegistry,
        loader: ConfigLoader,
        pool: Arc<ThreadPool>,
    ) -> Result<Self, BuildError> {
        options.project_root = options.project_root.canonicalize_utf8()?;
        if options.cache_dir.is_relative() {
            options.cache_dir = options.project_root.join(&options.cache_dir);
        }
        if options.dist_dir.is_relative() {
            options.dist_dir = options.project_root.join(&options.dist_dir);
        }

        let config = load_config(&options, &loader, &registry, 0)?;
        let cache = Arc::new(Cache::new(options.cache_dir.clone(), options.options_hash()));
        let signal = AbortSignal::new();

        let restored = if options.disable_cache { None } else { restore(&options) };
        let (asset_graph, request_graph) = match restored {
            Some(graphs) => {
                tracing::info!("Restored build state from {}", options.cache_dir);
                graphs
            }
            None => {
                let mut asset_graph = AssetGraph::new();
                asset_graph.initialize_entries(&options.entries);
                (asset_graph, RequestGraph::new())
            }
        };

        let tracker = RequestTracker::new(request_graph, pool.clone(), options.concurrency, signal.clone());

        Ok(Self {
            options: Arc::new(options),
            registry,
            loader,
            config,
            cache,
            pool,
            signal,
            asset_graph,
            tracker,
        })
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    pub fn config(&self) -> &Arc<ConfigSnapshot> {
        &self.config
    }

    /// Raising the returned signal makes the build in flight stop with
    /// [`BuildError::Aborted`].
    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    pub fn asset_graph(&self) -> &AssetGraph {
        &self.asset_graph
    }

    pub fn request_graph(&self) -> &RequestGraph {
        self.tracker.graph()
    }

    /// Timings of the requests that ran during the last build.
    pub fn diagnostics(&self) -> &Diagnostics {
        self.tracker.diagnostics()
    }

    /// Paths written by the engine itself, changes in them are not inputs.
    pub fn is_ignored(&self, path: &Utf8Path) -> bool {
        path.starts_with(&self.options.cache_dir) || path.starts_with(&self.options.dist_dir)
    }

    /// Applies a batch of file changes. Returns whether the next build has
    /// anything to redo.
    pub fn respond_to_events(&mut self, events: &[FileEvent]) -> Result<bool, BuildError> {
        let events: Vec<FileEvent> = events
            .iter()
            .map(|event| FileEvent::new(event.path.clone(), event.kind))
            .filter(|event| !self.is_ignored(&event.path))
            .collect();

        if events.is_empty() {
            return Ok(false);
        }

        let config_changed = events
            .iter()
            .any(|event| self.config.files().any(|file| file == event.path.as_path()));
        if config_changed {
            self.reload_config()?;
            return Ok(true);
        }

        for event in &events {
            self.cache.invalidate(event.path.as_str());
            // a changed included file doesn't change the source hash
            for request in self.tracker.graph().file_dependents(&event.path) {
                if let RequestDesc::Asset(group) = &request.desc {
                    self.cache.invalidate(group.file_path.as_str());
                }
            }
        }

        let entries_changed = self.match_entry_globs(&events);
        Ok(self.tracker.respond_to_fs_events(&events) || entries_changed)
    }

    /// Invalidates the glob entries that match a created file.
    fn match_entry_globs(&mut self, events: &[FileEvent]) -> bool {
        let created: Vec<&Utf8Path> = events
            .iter()
            .filter(|event| event.kind == FileEventKind::Create)
            .map(|event| event.path.as_path())
            .collect();
        if created.is_empty() {
            return false;
        }

        let mut matched = false;
        for specifier in self.options.entries.iter().filter(|entry| is_glob(entry)) {
            let Ok(pattern) = Pattern::new(normalize_path(&self.options.project_root.join(specifier)).as_str()) else {
                continue;
            };
            if created.iter().any(|path| pattern.matches_path(path.as_std_path())) {
                tracing::debug!("New file matches entry '{specifier}'");
                self.tracker.invalidate_request(&RequestDesc::Entry(specifier.clone()).id());
                matched = true;
            }
        }
        matched
    }

    /// Loads the config again and starts over from the entries. Cache entries
    /// stay usable, their keys include the transformer configs.
    fn reload_config(&mut self) -> Result<(), BuildError> {
        let version = self.config.version + 1;
        self.config = load_config(&self.options, &self.loader, &self.registry, version)?;
        tracing::info!("Reloaded config {} (version {version})", self.config.config.file_path);

        self.asset_graph = AssetGraph::new();
        self.asset_graph.initialize_entries(&self.options.entries);
        self.tracker = RequestTracker::new(
            RequestGraph::new(),
            self.pool.clone(),
            self.options.concurrency,
            self.signal.clone(),
        );
        Ok(())
    }

    /// Runs one build pass. Reporters see the start of the pass and either
    /// its success or its failure; an aborted pass is reported as neither.
    pub fn build(&mut self) -> Result<BuildResult, BuildError> {
        let start = Instant::now();
        self.signal.reset();
        self.config.plugins.report(&ReportEvent::BuildStart);
        tracing::info!("Building {} entries", self.options.entries.len());

        match self.build_inner(start) {
            Ok(result) => {
                let bundles: Vec<Bundle> = result.bundles.iter().map(|b| b.bundle.clone()).collect();
                self.config.plugins.report(&ReportEvent::BuildSuccess {
                    bundles: &bundles,
                    duration: result.duration,
                });
                tracing::info!(
                    "Built {} bundles in {:.2?} ({} requests ran, {} reused)",
                    result.bundles.len(),
                    result.duration,
                    self.diagnostics().execution_times.len(),
                    self.diagnostics().cached,
                );
                Ok(result)
            }
            Err(err) if err.is_abort() => {
                tracing::info!("Build aborted");
                Err(err)
            }
            Err(err) => {
                tracing::error!("Build failed: {err}");
                self.config.plugins.report(&ReportEvent::BuildFailure {
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    fn build_inner(&mut self, start: Instant) -> Result<BuildResult, BuildError> {
        self.build_asset_graph()?;
        if self.invalidate_missing_outputs() {
            self.build_asset_graph()?;
        }
        self.persist();

        if self.signal.is_aborted() {
            return Err(BuildError::Aborted);
        }

        let bundles = self.bundle()?;
        Ok(BuildResult {
            bundles,
            hash: self.asset_graph.get_hash(),
            duration: start.elapsed(),
        })
    }

    /// Runs requests until no node of the asset graph is incomplete.
    fn build_asset_graph(&mut self) -> Result<(), BuildError> {
        let ctx = Arc::new(RunContext {
            options: self.options.clone(),
            cache: self.cache.clone(),
            config: self.config.clone(),
        });

        let mut removed = self.asset_graph.drain_changes().removed;
        let initial: Vec<RequestDesc> = self
            .asset_graph
            .incomplete_nodes()
            .filter_map(|node| request_for(&node.value))
            .collect();

        let asset_graph = &mut self.asset_graph;
        let drained = self.tracker.complete_requests(&ctx, initial, |desc, result| {
            apply_result(asset_graph, desc, result);

            let changes = asset_graph.drain_changes();
            removed.extend(changes.removed);
            changes
                .incomplete
                .iter()
                .filter_map(|id| asset_graph.get_node(id))
                .filter_map(|node| request_for(&node.value))
                .collect()
        });

        // a node removed and added again within one pass keeps its request
        for node in removed {
            if !self.asset_graph.has_node(&node.id)
                && let Some(desc) = request_for(&node.value)
            {
                self.tracker.remove_request(&desc.id());
            }
        }

        // a failure of a request pruned above no longer matters
        let failure = drained?
            .into_iter()
            .find(|failure| self.tracker.graph().has_request(&failure.id));
        match failure {
            Some(failure) => Err(failure.into()),
            None => Ok(()),
        }
    }

    /// Queues the asset groups whose cached outputs can no longer be read to
    /// be transformed again. Returns whether there were any.
    fn invalidate_missing_outputs(&mut self) -> bool {
        let mut groups = Vec::new();
        self.asset_graph.traverse_assets(None, |asset, _| {
            if self.cache.has_blobs(asset) {
                return;
            }
            let parents = self
                .asset_graph
                .graph()
                .find_ancestors(&asset.id, |node| matches!(node.value, AssetGraphNode::AssetGroup { .. }));
            for node in parents {
                if let AssetGraphNode::AssetGroup { group, .. } = &node.value {
                    groups.push(group.clone());
                }
            }
        });

        for group in &groups {
            tracing::warn!("Cached output of {} is missing, transforming again", group.file_path);
            self.cache.invalidate(group.file_path.as_str());
            self.tracker.invalidate_request(&RequestDesc::Asset(group.clone()).id());
        }
        !groups.is_empty()
    }

    fn persist(&self) {
        if self.options.disable_cache {
            return;
        }

        let (asset_path, request_path) = snapshot_paths(&self.options);
        if let Err(err) = self.asset_graph.save(&asset_path) {
            tracing::error!("Failed to save the asset graph: {err}");
        }
        if let Err(err) = self.tracker.graph().save(&request_path) {
            tracing::error!("Failed to save the request graph: {err}");
        }
    }

    /// Bundles the complete asset graph and writes every bundle.
    fn bundle(&self) -> Result<Vec<PackagedBundle>, BuildError> {
        let plugins = &self.config.plugins;
        let Some(bundler) = &plugins.bundler else {
            tracing::debug!("No bundler configured, skipping packaging");
            return Ok(Vec::new());
        };

        let mut bundles = bundler
            .plugin
            .bundle(&self.asset_graph, &self.options)
            .map_err(BuildError::Bundle)?;

        for bundle in &mut bundles {
            for namer in &plugins.namers {
                if let Some(name) = namer.plugin.name(bundle).map_err(BuildError::Bundle)? {
                    bundle.name = Some(name);
                    break;
                }
            }
        }

        self.pool.install(|| {
            bundles
                .par_iter()
                .map(|bundle| self.package(plugins, bundle))
                .collect()
        })
    }

    fn package(&self, plugins: &Plugins, bundle: &Bundle) -> Result<PackagedBundle, BuildError> {
        let name = bundle
            .name
            .clone()
            .unwrap_or_else(|| format!("{}.{}", bundle.id, bundle.bundle_type));
        let fail = |err: anyhow::Error| BuildError::Package(name.clone(), err);

        let mut assets = Vec::with_capacity(bundle.asset_ids.len());
        for id in &bundle.asset_ids {
            let asset = self
                .asset_graph
                .get_node(id)
                .and_then(|node| node.value.as_asset())
                .ok_or_else(|| fail(anyhow!("Unknown asset {id}")))?;
            assets.push(self.load_outputs(asset).ok_or_else(|| fail(anyhow!("Missing output of {}", asset.file_path)))?);
        }

        let file_path = bundle.target.dist_dir.join(&name);
        if let Some(runtimes) = plugins.runtimes.matching(&file_path, None) {
            for runtime in runtimes {
                assets.extend(runtime.plugin.apply(bundle, &self.asset_graph).map_err(fail)?);
            }
        }

        let packager = plugins
            .packagers
            .matching(&file_path, None)
            .ok_or_else(|| fail(anyhow!("No packager matches {name}")))?;
        let mut contents = packager.plugin.package(bundle, &assets).map_err(fail)?;

        if let Some(optimizers) = plugins.optimizers.matching(&file_path, None) {
            for optimizer in optimizers {
                contents = optimizer.plugin.optimize(bundle, contents).map_err(fail)?;
            }
        }

        let bytes = contents.as_bytes();
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&file_path, &bytes)?;
        tracing::debug!("Wrote {file_path} ({} bytes)", bytes.len());

        Ok(PackagedBundle {
            bundle: bundle.clone(),
            size: bytes.len() as u64,
            hash: Hash32::hash(&bytes).to_hex(),
            file_path,
        })
    }

    /// Copy of an asset with its cached outputs read back in.
    fn load_outputs(&self, asset: &Asset) -> Option<Asset> {
        let mut asset = asset.clone();
        self.cache.read_blobs(&mut asset)?;
        Some(asset)
    }
}

/// The request that completes an incomplete asset graph node.
fn request_for(node: &AssetGraphNode) -> Option<RequestDesc> {
    match node {
        AssetGraphNode::EntrySpecifier(specifier) => Some(RequestDesc::Entry(specifier.clone())),
        AssetGraphNode::EntryFile(entry) => Some(RequestDesc::Target(entry.clone())),
        AssetGraphNode::Dependency(dependency) => Some(RequestDesc::DepPath(dependency.clone())),
        AssetGraphNode::AssetGroup { group, .. } => Some(RequestDesc::Asset(group.clone())),
        AssetGraphNode::Root | AssetGraphNode::Asset(_) => None,
    }
}

fn apply_result(graph: &mut AssetGraph, desc: &RequestDesc, result: &RequestResult) {
    match (desc, result) {
        (RequestDesc::Entry(specifier), RequestResult::Entry(entries)) => {
            graph.resolve_entry(specifier, entries.clone());
        }
        (RequestDesc::Target(entry), RequestResult::Target(targets)) => {
            graph.resolve_targets(entry, targets);
        }
        (RequestDesc::DepPath(dependency), RequestResult::DepPath(group)) => {
            graph.resolve_dependency(dependency, group.clone());
        }
        (RequestDesc::Asset(group), RequestResult::Asset(assets)) => {
            graph.resolve_asset_group(group, assets.clone());
        }
        (desc, _) => {
            tracing::debug!("Ignoring result of {} request {}", desc.request_type(), desc.name());
        }
    }
}

fn load_config(
    options: &BuildOptions,
    loader: &ConfigLoader,
    registry: &PluginRegistry,
    version: u64,
) -> Result<Arc<ConfigSnapshot>, ConfigError> {
    let path = options.config_path();

    let (config, extended) = if path.is_file() {
        loader.load(&path)?
    } else if loader.has_preset("default") {
        tracing::debug!("No config at {path}, using the default preset");
        loader.load_preset("default")?
    } else {
        tracing::warn!("No config at {path}, building without plugins");
        let config = Config {
            file_path: path,
            ..Default::default()
        };
        (config, Vec::new())
    };

    ConfigSnapshot::new(version, config, extended, registry)
}

/// Snapshot files are keyed by everything that shapes the graphs, so a
/// session with different options or entries starts fresh.
fn snapshot_paths(options: &BuildOptions) -> (Utf8PathBuf, Utf8PathBuf) {
    let key = Hash32::hash_json(&(options.options_hash().to_hex(), &options.entries, &options.project_root));
    let key = &key.to_hex()[..16];
    (
        options.cache_dir.join(format!("{key}-assets.cbor")),
        options.cache_dir.join(format!("{key}-requests.cbor")),
    )
}

fn restore(options: &BuildOptions) -> Option<(AssetGraph, RequestGraph)> {
    let (asset_path, request_path) = snapshot_paths(options);
    let asset_graph = AssetGraph::load(&asset_path)?;
    let request_graph = RequestGraph::load(&request_path)?;
    Some((asset_graph, request_graph))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Mutex, OnceLock};

    use super::*;
    use crate::error::{PluginError, RequestError};
    use crate::plugin::{Bundler, Packager, Reporter, Resolution, Resolver, Transformer};
    use crate::types::{Blob, Dependency, DependencyOptions, OutputBlob};

    const CONFIG: &str = r#"{
        "resolvers": ["relative"],
        "transformers": {"*.js": ["imports"]},
        "bundler": "single",
        "packagers": {"*.js": "join"},
        "reporters": ["record"]
    }"#;

    /// Shared state the mock plugins report into.
    #[derive(Clone, Default)]
    struct Probe {
        transforms: Arc<AtomicUsize>,
        reports: Arc<Mutex<Vec<&'static str>>>,
        signal: Arc<OnceLock<AbortSignal>>,
        aborted: Arc<AtomicBool>,
    }

    struct Relative;

    impl Resolver for Relative {
        fn resolve(&self, dependency: &Dependency, _: &BuildOptions) -> Result<Option<Resolution>, PluginError> {
            let specifier = Utf8Path::new(&dependency.module_specifier);
            let file_path = match dependency.resolve_from() {
                _ if specifier.is_absolute() => specifier.to_path_buf(),
                Some(dir) => dir.join(specifier),
                None => return Ok(None),
            };

            if !file_path.is_file() {
                return Ok(None);
            }
            Ok(Some(Resolution {
                file_path,
                ..Default::default()
            }))
        }
    }

    /// Declares a dependency for every `import <path>` line.
    struct Imports(Probe);

    impl Transformer for Imports {
        fn transform(
            &self,
            mut asset: Asset,
            _: Option<&serde_json::Value>,
            _: &BuildOptions,
        ) -> Result<Vec<Asset>, PluginError> {
            self.0.transforms.fetch_add(1, Ordering::SeqCst);

            if asset.file_path.file_name() == Some("abort.js")
                && !self.0.aborted.swap(true, Ordering::SeqCst)
                && let Some(signal) = self.0.signal.get()
            {
                signal.abort();
            }

            let Some(OutputBlob::Inline(Blob::Text(text))) = asset.content().cloned() else {
                return Ok(vec![asset]);
            };
            for line in text.lines() {
                if let Some(specifier) = line.strip_prefix("import ") {
                    asset.add_dependency(DependencyOptions {
                        module_specifier: specifier.trim().into(),
                        ..Default::default()
                    });
                }
            }
            Ok(vec![asset])
        }
    }

    /// Puts every asset into one bundle.
    struct Single;

    impl Bundler for Single {
        fn bundle(&self, graph: &AssetGraph, options: &BuildOptions) -> Result<Vec<Bundle>, PluginError> {
            let mut asset_ids = Vec::new();
            graph.traverse_assets(None, |asset, _| asset_ids.push(asset.id.to_string()));

            Ok(vec![Bundle {
                id: "main".into(),
                name: None,
                bundle_type: "js".into(),
                target: options.fallback_targets().remove(0),
                entry_asset_ids: graph.get_entry_assets().iter().map(|a| a.id.to_string()).collect(),
                asset_ids,
            }])
        }
    }

    struct Join;

    impl Packager for Join {
        fn package(&self, _: &Bundle, assets: &[Asset]) -> Result<Blob, PluginError> {
            let mut out = String::new();
            for asset in assets {
                if let Some(OutputBlob::Inline(Blob::Text(text))) = asset.content() {
                    out.push_str(text);
                }
            }
            Ok(Blob::Text(out))
        }
    }

    struct Record(Probe);

    impl Reporter for Record {
        fn report(&self, event: &ReportEvent) -> Result<(), PluginError> {
            let name = match event {
                ReportEvent::BuildStart => "start",
                ReportEvent::BuildSuccess { .. } => "success",
                ReportEvent::BuildFailure { .. } => "failure",
            };
            self.0.reports.lock().unwrap().push(name);
            Ok(())
        }
    }

    fn project(files: &[(&str, &str)]) -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().canonicalize().unwrap()).unwrap();
        fs::write(root.join(".kumitaterc"), CONFIG).unwrap();

        for (name, text) in files {
            let path = root.join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, text).unwrap();
        }
        (dir, root)
    }

    fn engine(root: &Utf8Path, probe: &Probe) -> Engine {
        engine_with(root, probe, "src/index.js")
    }

    fn engine_with(root: &Utf8Path, probe: &Probe, entry: &str) -> Engine {
        let registry = PluginRegistry::new()
            .resolver("relative", Relative)
            .transformer("imports", Imports(probe.clone()))
            .bundler("single", Single)
            .packager("join", Join)
            .reporter("record", Record(probe.clone()));

        let options = BuildOptions {
            entries: vec![entry.into()],
            project_root: root.to_path_buf(),
            ..Default::default()
        };

        let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();
        let engine = Engine::new(options, registry, ConfigLoader::new(), Arc::new(pool)).unwrap();
        let _ = probe.signal.set(engine.signal());
        engine
    }

    fn two_modules() -> (tempfile::TempDir, Utf8PathBuf) {
        project(&[("src/index.js", "import ./b.js\n"), ("src/b.js", "export b\n")])
    }

    #[test]
    fn test_builds_and_writes_bundle() {
        let (_dir, root) = two_modules();
        let probe = Probe::default();
        let mut engine = engine(&root, &probe);

        let result = engine.build().unwrap();

        assert!(!engine.asset_graph().has_incomplete_nodes());
        assert_eq!(result.bundles.len(), 1);
        assert_eq!(result.bundles[0].file_path, root.join("dist/main.js"));
        assert_eq!(fs::read_to_string(root.join("dist/main.js")).unwrap(), "import ./b.js\nexport b\n");
        assert_eq!(probe.transforms.load(Ordering::SeqCst), 2);
        assert_eq!(*probe.reports.lock().unwrap(), ["start", "success"]);
    }

    #[test]
    fn test_rebuild_without_changes_runs_nothing() {
        let (_dir, root) = two_modules();
        let probe = Probe::default();
        let mut engine = engine(&root, &probe);

        let first = engine.build().unwrap();
        let second = engine.build().unwrap();

        assert!(engine.diagnostics().execution_times.is_empty());
        assert_eq!(probe.transforms.load(Ordering::SeqCst), 2);
        assert_eq!(first.hash, second.hash);
        assert_eq!(first.bundles[0].hash, second.bundles[0].hash);
    }

    #[test]
    fn test_update_reruns_only_the_changed_asset() {
        let (_dir, root) = two_modules();
        let probe = Probe::default();
        let mut engine = engine(&root, &probe);
        engine.build().unwrap();

        let b = root.join("src/b.js");
        fs::write(&b, "export c\n").unwrap();
        assert!(engine.respond_to_events(&[FileEvent::new(&b, FileEventKind::Update)]).unwrap());

        let result = engine.build().unwrap();

        let ran: Vec<_> = engine.diagnostics().execution_times.values().map(|e| e.name.clone()).collect();
        assert_eq!(ran, [b.to_string()]);
        assert_eq!(probe.transforms.load(Ordering::SeqCst), 3);
        assert_eq!(fs::read_to_string(&result.bundles[0].file_path).unwrap(), "import ./b.js\nexport c\n");
    }

    #[test]
    fn test_new_import_extends_the_graph() {
        let (_dir, root) = two_modules();
        let probe = Probe::default();
        let mut engine = engine(&root, &probe);
        engine.build().unwrap();

        let b = root.join("src/b.js");
        fs::write(root.join("src/c.js"), "export c\n").unwrap();
        fs::write(&b, "import ./c.js\n").unwrap();
        engine.respond_to_events(&[FileEvent::new(&b, FileEventKind::Update)]).unwrap();

        let result = engine.build().unwrap();
        assert_eq!(
            fs::read_to_string(&result.bundles[0].file_path).unwrap(),
            "import ./b.js\nimport ./c.js\nexport c\n"
        );
    }

    #[test]
    fn test_created_file_matching_entry_glob() {
        let (_dir, root) = project(&[("src/a.entry.js", "export a\n")]);
        let probe = Probe::default();
        let mut engine = engine_with(&root, &probe, "src/*.entry.js");
        engine.build().unwrap();

        let b = root.join("src/b.entry.js");
        fs::write(&b, "export b\n").unwrap();
        assert!(engine.respond_to_events(&[FileEvent::new(&b, FileEventKind::Create)]).unwrap());

        let result = engine.build().unwrap();
        assert_eq!(fs::read_to_string(&result.bundles[0].file_path).unwrap(), "export a\nexport b\n");
    }

    #[test]
    fn test_deleted_dependency_fails_the_build() {
        let (_dir, root) = two_modules();
        let probe = Probe::default();
        let mut engine = engine(&root, &probe);
        engine.build().unwrap();

        let b = root.join("src/b.js");
        fs::remove_file(&b).unwrap();
        assert!(engine.respond_to_events(&[FileEvent::new(&b, FileEventKind::Delete)]).unwrap());

        let err = engine.build().unwrap_err();
        assert!(matches!(err, BuildError::Request(_, RequestError::Resolve(_))));
        assert_eq!(probe.reports.lock().unwrap().last(), Some(&"failure"));
    }

    #[test]
    fn test_dropping_a_broken_import_recovers() {
        let (_dir, root) = two_modules();
        let probe = Probe::default();
        let mut engine = engine(&root, &probe);
        engine.build().unwrap();

        let b = root.join("src/b.js");
        fs::remove_file(&b).unwrap();
        engine.respond_to_events(&[FileEvent::new(&b, FileEventKind::Delete)]).unwrap();
        assert!(engine.build().is_err());

        let index = root.join("src/index.js");
        fs::write(&index, "export a\n").unwrap();
        assert!(engine.respond_to_events(&[FileEvent::new(&index, FileEventKind::Update)]).unwrap());

        let result = engine.build().unwrap();
        assert_eq!(fs::read_to_string(&result.bundles[0].file_path).unwrap(), "export a\n");
        assert!(engine.request_graph().invalid_requests().next().is_none());

        engine.build().unwrap();
    }

    #[test]
    fn test_missing_cached_output_is_recomputed() {
        let (_dir, root) = two_modules();
        let probe = Probe::default();
        let mut engine = engine(&root, &probe);
        engine.build().unwrap();

        for entry in fs::read_dir(&engine.options().cache_dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                fs::remove_dir_all(path).unwrap();
            }
        }

        for _ in 0..2 {
            let result = engine.build().unwrap();
            assert_eq!(fs::read_to_string(&result.bundles[0].file_path).unwrap(), "import ./b.js\nexport b\n");
        }
        assert_eq!(probe.transforms.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_abort_is_not_reported_as_failure() {
        let (_dir, root) = project(&[("src/index.js", "import ./abort.js\n"), ("src/abort.js", "")]);
        let probe = Probe::default();
        let mut engine = engine(&root, &probe);

        let err = engine.build().unwrap_err();
        assert!(err.is_abort());
        assert_eq!(*probe.reports.lock().unwrap(), ["start"]);

        engine.build().unwrap();
        assert_eq!(*probe.reports.lock().unwrap(), ["start", "start", "success"]);
        assert!(!engine.asset_graph().has_incomplete_nodes());
    }

    #[test]
    fn test_restores_previous_session() {
        let (_dir, root) = two_modules();
        let probe = Probe::default();
        engine(&root, &probe).build().unwrap();

        let mut restored = engine(&root, &probe);
        let result = restored.build().unwrap();

        assert!(restored.diagnostics().execution_times.is_empty());
        assert_eq!(probe.transforms.load(Ordering::SeqCst), 2);
        assert_eq!(fs::read_to_string(&result.bundles[0].file_path).unwrap(), "import ./b.js\nexport b\n");
    }

    #[test]
    fn test_output_and_config_events() {
        let (_dir, root) = two_modules();
        let probe = Probe::default();
        let mut engine = engine(&root, &probe);
        engine.build().unwrap();

        let output = FileEvent::new(root.join("dist/main.js"), FileEventKind::Update);
        assert!(!engine.respond_to_events(&[output]).unwrap());

        let config = FileEvent::new(root.join(".kumitaterc"), FileEventKind::Update);
        assert!(engine.respond_to_events(&[config]).unwrap());
        assert_eq!(engine.config().version, 1);
        assert!(engine.asset_graph().has_incomplete_nodes());

        engine.build().unwrap();
        assert!(!engine.asset_graph().has_incomplete_nodes());
    }
}

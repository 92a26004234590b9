//! Loading of `.kumitaterc` config files.
//!
//! A config is a JSON document naming the plugins of every pipeline. Configs
//! may `extend` other configs, either files (paths starting with `.`) or
//! presets registered by name on the [`ConfigLoader`]. A pipeline of an
//! extending config can splice in the pipeline it overrides with a single
//! `"..."` element.

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use glob::{MatchOptions, Pattern};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::core::normalize_path;
use crate::error::ConfigError;
use crate::plugin::{PluginRegistry, Plugins};

const SPREAD: &str = "...";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Extends {
    One(String),
    Many(Vec<String>),
}

impl Extends {
    fn names(&self) -> &[String] {
        match self {
            Extends::One(name) => std::slice::from_ref(name),
            Extends::Many(names) => names,
        }
    }
}

/// Config file as written on disk.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawConfig {
    pub extends: Option<Extends>,
    pub resolvers: Option<Vec<String>>,
    pub transformers: Option<IndexMap<String, Vec<String>>>,
    pub bundler: Option<String>,
    pub namers: Option<Vec<String>>,
    pub runtimes: Option<IndexMap<String, Vec<String>>>,
    pub packagers: Option<IndexMap<String, String>>,
    pub optimizers: Option<IndexMap<String, Vec<String>>>,
    pub reporters: Option<Vec<String>>,
    pub validators: Option<IndexMap<String, Vec<String>>>,
}

/// Config with its `extends` chain merged in.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub file_path: Utf8PathBuf,
    pub resolvers: Vec<String>,
    pub transformers: IndexMap<String, Vec<String>>,
    pub bundler: Option<String>,
    pub namers: Vec<String>,
    pub runtimes: IndexMap<String, Vec<String>>,
    pub packagers: IndexMap<String, String>,
    pub optimizers: IndexMap<String, Vec<String>>,
    pub reporters: Vec<String>,
    pub validators: IndexMap<String, Vec<String>>,
}

impl Config {
    fn from_raw(raw: RawConfig, file_path: &Utf8Path) -> Self {
        Self {
            file_path: file_path.to_path_buf(),
            resolvers: raw.resolvers.unwrap_or_default(),
            transformers: raw.transformers.unwrap_or_default(),
            bundler: raw.bundler,
            namers: raw.namers.unwrap_or_default(),
            runtimes: raw.runtimes.unwrap_or_default(),
            packagers: raw.packagers.unwrap_or_default(),
            optimizers: raw.optimizers.unwrap_or_default(),
            reporters: raw.reporters.unwrap_or_default(),
            validators: raw.validators.unwrap_or_default(),
        }
    }

    /// Merges an extending config over its base. Keys of `ext` take
    /// precedence and come first in glob maps.
    fn merge(base: Config, ext: Config) -> Result<Config, ConfigError> {
        let path = &ext.file_path;

        Ok(Config {
            resolvers: merge_pipelines(base.resolvers, ext.resolvers, path, "resolvers")?,
            transformers: merge_pipeline_maps(base.transformers, ext.transformers, path, "transformers")?,
            bundler: ext.bundler.or(base.bundler),
            namers: merge_pipelines(base.namers, ext.namers, path, "namers")?,
            runtimes: merge_maps(base.runtimes, ext.runtimes),
            packagers: merge_maps(base.packagers, ext.packagers),
            optimizers: merge_pipeline_maps(base.optimizers, ext.optimizers, path, "optimizers")?,
            reporters: merge_pipelines(base.reporters, ext.reporters, path, "reporters")?,
            validators: merge_pipeline_maps(base.validators, ext.validators, path, "validators")?,
            file_path: ext.file_path,
        })
    }

    /// Drops spread elements left over where there was nothing to splice in.
    fn finalize(mut self) -> Self {
        let strip = |pipeline: &mut Vec<String>| pipeline.retain(|name| name != SPREAD);

        strip(&mut self.resolvers);
        strip(&mut self.namers);
        strip(&mut self.reporters);
        self.transformers.values_mut().for_each(strip);
        self.runtimes.values_mut().for_each(strip);
        self.optimizers.values_mut().for_each(strip);
        self.validators.values_mut().for_each(strip);
        self
    }
}

fn merge_pipelines(
    base: Vec<String>,
    ext: Vec<String>,
    path: &Utf8Path,
    key: &str,
) -> Result<Vec<String>, ConfigError> {
    if ext.is_empty() {
        return Ok(base);
    }

    let spreads = ext.iter().filter(|name| *name == SPREAD).count();
    if spreads > 1 {
        return Err(ConfigError::MultipleSpread {
            path: path.to_path_buf(),
            key: key.to_string(),
        });
    }

    match ext.iter().position(|name| name == SPREAD) {
        Some(index) if !base.is_empty() => {
            let mut merged = Vec::with_capacity(ext.len() + base.len() - 1);
            merged.extend_from_slice(&ext[..index]);
            merged.extend(base);
            merged.extend_from_slice(&ext[index + 1..]);
            Ok(merged)
        }
        _ => Ok(ext),
    }
}

fn merge_maps<V>(base: IndexMap<String, V>, ext: IndexMap<String, V>) -> IndexMap<String, V> {
    if ext.is_empty() {
        return base;
    }

    let mut merged = ext;
    for (key, value) in base {
        merged.entry(key).or_insert(value);
    }
    merged
}

fn merge_pipeline_maps(
    mut base: IndexMap<String, Vec<String>>,
    ext: IndexMap<String, Vec<String>>,
    path: &Utf8Path,
    key: &str,
) -> Result<IndexMap<String, Vec<String>>, ConfigError> {
    let mut merged = IndexMap::with_capacity(base.len() + ext.len());

    for (glob, pipeline) in ext {
        let pipeline = match base.shift_remove(&glob) {
            Some(inherited) => merge_pipelines(inherited, pipeline, path, &format!("{key}[{glob}]"))?,
            None => pipeline,
        };
        merged.insert(glob, pipeline);
    }

    merged.extend(base);
    Ok(merged)
}

/// Resolves config files and their `extends` chains.
#[derive(Default)]
pub struct ConfigLoader {
    presets: HashMap<String, RawConfig>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a config that other configs can extend by name.
    pub fn preset(mut self, name: impl Into<String>, config: RawConfig) -> Self {
        self.presets.insert(name.into(), config);
        self
    }

    pub fn has_preset(&self, name: &str) -> bool {
        self.presets.contains_key(name)
    }

    /// Loads the config file at `path`. Returns the merged config and every
    /// file of its `extends` chain.
    pub fn load(&self, path: &Utf8Path) -> Result<(Config, Vec<Utf8PathBuf>), ConfigError> {
        let raw = read_raw(path)?;
        self.process(raw, path)
    }

    /// Loads a named preset as if it were the project config.
    pub fn load_preset(&self, name: &str) -> Result<(Config, Vec<Utf8PathBuf>), ConfigError> {
        let raw = self.presets.get(name).cloned().ok_or_else(|| ConfigError::Extends {
            path: Utf8PathBuf::new(),
            name: name.to_string(),
        })?;
        self.process(raw, Utf8Path::new(name))
    }

    /// Processes an already parsed config located at `path`.
    pub fn process(&self, raw: RawConfig, path: &Utf8Path) -> Result<(Config, Vec<Utf8PathBuf>), ConfigError> {
        let mut stack = Vec::new();
        let (config, extended) = self.process_chain(raw, path, &mut stack)?;
        Ok((config.finalize(), extended))
    }

    fn process_chain(
        &self,
        raw: RawConfig,
        path: &Utf8Path,
        stack: &mut Vec<Utf8PathBuf>,
    ) -> Result<(Config, Vec<Utf8PathBuf>), ConfigError> {
        if stack.iter().any(|seen| seen == path) {
            return Err(ConfigError::CircularExtends(path.to_path_buf()));
        }
        stack.push(path.to_path_buf());

        let names = raw
            .extends
            .as_ref()
            .map(|extends| extends.names().to_vec())
            .unwrap_or_default();

        let config = Config::from_raw(raw, path);
        let mut base: Option<Config> = None;
        let mut extended = Vec::new();

        for name in names {
            let (raw, base_path, is_file) = self.resolve_extends(&name, path)?;
            if is_file {
                extended.push(base_path.clone());
            }

            let (next, more) = self.process_chain(raw, &base_path, stack)?;
            extended.extend(more);

            base = Some(match base {
                Some(previous) => Config::merge(previous, next)?,
                None => next,
            });
        }

        stack.pop();

        let config = match base {
            Some(base) => Config::merge(base, config)?,
            None => config,
        };

        Ok((config, extended))
    }

    fn resolve_extends(
        &self,
        name: &str,
        from: &Utf8Path,
    ) -> Result<(RawConfig, Utf8PathBuf, bool), ConfigError> {
        if name.starts_with('.') {
            let dir = from.parent().unwrap_or(Utf8Path::new("."));
            let path = normalize_path(&dir.join(name));
            let raw = read_raw(&path)?;
            return Ok((raw, path, true));
        }

        match self.presets.get(name) {
            Some(raw) => Ok((raw.clone(), Utf8PathBuf::from(name), false)),
            None => Err(ConfigError::Extends {
                path: from.to_path_buf(),
                name: name.to_string(),
            }),
        }
    }
}

fn read_raw(path: &Utf8Path) -> Result<RawConfig, ConfigError> {
    let text = fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
    parse_raw(&text, path)
}

/// Parses config text, rejecting empty documents.
pub fn parse_raw(text: &str, path: &Utf8Path) -> Result<RawConfig, ConfigError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;

    if value.as_object().is_some_and(|object| object.is_empty()) {
        return Err(ConfigError::Empty(path.to_path_buf()));
    }

    serde_json::from_value(value).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
}

/// Ordered map from glob keys to values. Keys may carry a named pipeline
/// prefix, as in `"modern:*.js"`, which only matches dependencies asking for
/// that pipeline.
#[derive(Clone, Debug)]
pub struct GlobMap<V> {
    entries: Vec<GlobEntry<V>>,
}

#[derive(Clone, Debug)]
struct GlobEntry<V> {
    pipeline: Option<String>,
    pattern: Pattern,
    value: V,
}

impl<V> Default for GlobMap<V> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<V> GlobMap<V> {
    pub fn compile<T, F, E>(map: &IndexMap<String, T>, mut f: F) -> Result<Self, E>
    where
        F: FnMut(&T) -> Result<V, E>,
        E: From<ConfigError>,
    {
        let mut entries = Vec::with_capacity(map.len());
        for (key, value) in map {
            let (pipeline, glob) = match key.split_once(':') {
                Some((pipeline, glob)) => (Some(pipeline.to_string()), glob),
                None => (None, key.as_str()),
            };

            let pattern = Pattern::new(glob).map_err(|e| ConfigError::Glob(key.clone(), e))?;
            entries.push(GlobEntry {
                pipeline,
                pattern,
                value: f(value)?,
            });
        }
        Ok(Self { entries })
    }

    /// First value whose key matches. Keys of a named pipeline are preferred
    /// when one is given, falling back to unnamed keys. Patterns without a
    /// `/` match the file name, other patterns the whole path.
    pub fn matching(&self, path: &Utf8Path, pipeline: Option<&str>) -> Option<&V> {
        if let Some(pipeline) = pipeline
            && let Some(value) = self.find(path, Some(pipeline))
        {
            return Some(value);
        }

        self.find(path, None)
    }

    fn find(&self, path: &Utf8Path, pipeline: Option<&str>) -> Option<&V> {
        let options = MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };

        self.entries
            .iter()
            .filter(|entry| entry.pipeline.as_deref() == pipeline)
            .find(|entry| {
                if entry.pattern.as_str().contains('/') {
                    entry.pattern.matches_with(path.as_str(), options)
                        || path_suffix_matches(&entry.pattern, path, options)
                } else {
                    path.file_name()
                        .is_some_and(|name| entry.pattern.matches_with(name, options))
                }
            })
            .map(|entry| &entry.value)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.iter().map(|entry| &entry.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn path_suffix_matches(pattern: &Pattern, path: &Utf8Path, options: MatchOptions) -> bool {
    let path = path.as_str();
    path.match_indices('/')
        .any(|(index, _)| pattern.matches_with(&path[index + 1..], options))
}

/// Immutable snapshot of a loaded config and the plugins it resolved to.
/// Reloading the config produces a new snapshot with a higher version.
pub struct ConfigSnapshot {
    pub version: u64,
    pub config: Config,
    pub plugins: Plugins,
    pub extended_files: Vec<Utf8PathBuf>,
}

impl ConfigSnapshot {
    pub fn new(
        version: u64,
        config: Config,
        extended_files: Vec<Utf8PathBuf>,
        registry: &PluginRegistry,
    ) -> Result<Arc<Self>, ConfigError> {
        let plugins = registry.resolve(&config)?;

        Ok(Arc::new(Self {
            version,
            config,
            plugins,
            extended_files,
        }))
    }

    /// Every file whose change requires a reload.
    pub fn files(&self) -> impl Iterator<Item = &Utf8Path> {
        std::iter::once(self.config.file_path.as_path())
            .chain(self.extended_files.iter().map(Utf8PathBuf::as_path))
    }
}

impl std::fmt::Debug for ConfigSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigSnapshot")
            .field("version", &self.version)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Utf8Path, name: &str, text: &str) -> Utf8PathBuf {
        let path = dir.join(name);
        fs::write(&path, text).unwrap();
        path
    }

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let temp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        (temp, dir)
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_empty_config_is_rejected_with_path() {
        let err = parse_raw("{}", Utf8Path::new("project/.kumitaterc")).unwrap_err();
        assert_eq!(err.to_string(), "project/.kumitaterc can't be empty");
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let err = parse_raw(r#"{"resolverz": []}"#, Utf8Path::new(".kumitaterc")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(..)));
    }

    #[test]
    fn test_spread_splices_base_pipeline() {
        let merged = merge_pipelines(
            strings(&["base-a", "base-b"]),
            strings(&["first", "...", "last"]),
            Utf8Path::new(".kumitaterc"),
            "resolvers",
        )
        .unwrap();

        assert_eq!(merged, ["first", "base-a", "base-b", "last"]);
    }

    #[test]
    fn test_multiple_spreads_fail() {
        let err = merge_pipelines(
            strings(&["base"]),
            strings(&["...", "x", "..."]),
            Utf8Path::new(".kumitaterc"),
            "resolvers",
        )
        .unwrap_err();

        assert!(matches!(err, ConfigError::MultipleSpread { .. }));
    }

    #[test]
    fn test_pipeline_without_spread_replaces_base() {
        let merged = merge_pipelines(
            strings(&["base"]),
            strings(&["own"]),
            Utf8Path::new(".kumitaterc"),
            "namers",
        )
        .unwrap();

        assert_eq!(merged, ["own"]);
    }

    #[test]
    fn test_merge_maps_puts_extension_keys_first() {
        let base = IndexMap::from([("*.js".to_string(), "base-js".to_string()), ("*.css".into(), "base-css".into())]);
        let ext = IndexMap::from([("*.css".to_string(), "ext-css".to_string()), ("*.ts".into(), "ext-ts".into())]);

        let merged = merge_maps(base, ext);
        let keys: Vec<_> = merged.keys().map(String::as_str).collect();

        assert_eq!(keys, ["*.css", "*.ts", "*.js"]);
        assert_eq!(merged["*.css"], "ext-css");
    }

    #[test]
    fn test_extends_file_chain() {
        let (_temp, dir) = tempdir();
        write(&dir, "base.json", r#"{"resolvers": ["default-resolver"], "transformers": {"*.js": ["babel"]}}"#);
        let path = write(
            &dir,
            ".kumitaterc",
            r#"{"extends": "./base.json", "resolvers": ["custom", "..."], "transformers": {"*.js": ["...", "minify"], "*.css": ["css"]}}"#,
        );

        let (config, extended) = ConfigLoader::new().load(&path).unwrap();

        assert_eq!(config.resolvers, ["custom", "default-resolver"]);
        assert_eq!(config.transformers["*.js"], ["babel", "minify"]);
        assert_eq!(config.transformers["*.css"], ["css"]);
        assert_eq!(extended, [dir.join("base.json")]);
        assert_eq!(config.file_path, path);
    }

    #[test]
    fn test_extends_preset_and_leftover_spread() {
        let loader = ConfigLoader::new().preset(
            "@kumitate/config-default",
            RawConfig {
                bundler: Some("default-bundler".into()),
                ..Default::default()
            },
        );

        let raw = parse_raw(
            r#"{"extends": "@kumitate/config-default", "namers": ["...", "own-namer"]}"#,
            Utf8Path::new(".kumitaterc"),
        )
        .unwrap();
        let (config, extended) = loader.process(raw, Utf8Path::new(".kumitaterc")).unwrap();

        assert_eq!(config.bundler.as_deref(), Some("default-bundler"));
        assert_eq!(config.namers, ["own-namer"]);
        assert!(extended.is_empty());
    }

    #[test]
    fn test_unknown_extends_fails() {
        let raw = RawConfig {
            extends: Some(Extends::One("nope".into())),
            ..Default::default()
        };

        let err = ConfigLoader::new().process(raw, Utf8Path::new(".kumitaterc")).unwrap_err();
        assert!(matches!(err, ConfigError::Extends { .. }));
    }

    #[test]
    fn test_circular_extends_fails() {
        let (_temp, dir) = tempdir();
        write(&dir, "a.json", r#"{"extends": "./b.json"}"#);
        write(&dir, "b.json", r#"{"extends": "./a.json"}"#);

        let err = ConfigLoader::new().load(&dir.join("a.json")).unwrap_err();
        assert!(matches!(err, ConfigError::CircularExtends(_)));
    }

    #[test]
    fn test_glob_map_matching() {
        let map = IndexMap::from([
            ("modern:*.js".to_string(), 1),
            ("*.mjs".to_string(), 2),
            ("*.js".to_string(), 3),
            ("vendor/*.css".to_string(), 4),
        ]);
        let globs = GlobMap::compile(&map, |v| Ok::<_, ConfigError>(*v)).unwrap();

        assert_eq!(globs.matching(Utf8Path::new("/src/a.js"), Some("modern")), Some(&1));
        assert_eq!(globs.matching(Utf8Path::new("/src/a.js"), None), Some(&3));
        assert_eq!(globs.matching(Utf8Path::new("/src/a.js"), Some("legacy")), Some(&3));
        assert_eq!(globs.matching(Utf8Path::new("/src/a.mjs"), Some("modern")), Some(&2));
        assert_eq!(globs.matching(Utf8Path::new("/p/vendor/x.css"), None), Some(&4));
        assert_eq!(globs.matching(Utf8Path::new("/p/x.css"), None), None);
    }
}

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::core::Hash32;
use crate::types::Target;

/// Options of a build session.
///
/// Only a subset of these fields affects the produced output; those are the
/// ones folded into [`BuildOptions::options_hash`], which in turn salts every
/// cache id. Changing any of them invalidates the whole cache.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BuildOptions {
    /// Entry specifiers, plain paths or globs relative to the project root.
    pub entries: Vec<String>,
    pub project_root: Utf8PathBuf,
    pub cache_dir: Utf8PathBuf,
    pub dist_dir: Utf8PathBuf,
    /// Explicit config file, otherwise `.kumitaterc` in the project root.
    pub config: Option<Utf8PathBuf>,
    pub public_url: String,
    pub minify: bool,
    pub hmr: bool,
    pub target: Option<String>,
    pub scope_hoist: bool,
    /// Upper bound of requests in flight, `0` picks the pool size.
    pub concurrency: usize,
    /// Lock file whose changes invalidate resolved package versions.
    pub lock_file: Option<Utf8PathBuf>,
    /// Targets used when an entry's manifest declares none.
    pub default_targets: Vec<Target>,
    pub disable_cache: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            project_root: Utf8PathBuf::from("."),
            cache_dir: Utf8PathBuf::from(".kumitate-cache"),
            dist_dir: Utf8PathBuf::from("dist"),
            config: None,
            public_url: "/".into(),
            minify: false,
            hmr: false,
            target: None,
            scope_hoist: false,
            concurrency: 0,
            lock_file: None,
            default_targets: Vec::new(),
            disable_cache: false,
        }
    }
}

impl BuildOptions {
    pub fn options_hash(&self) -> Hash32 {
        #[derive(Serialize)]
        struct Keys<'a> {
            public_url: &'a str,
            minify: bool,
            hmr: bool,
            target: &'a Option<String>,
            scope_hoist: bool,
            version: &'static str,
        }

        Hash32::hash_json(&Keys {
            public_url: &self.public_url,
            minify: self.minify,
            hmr: self.hmr,
            target: &self.target,
            scope_hoist: self.scope_hoist,
            version: env!("CARGO_PKG_VERSION"),
        })
    }

    /// Targets for entries without their own, falling back to a single
    /// browser target writing into `dist_dir`.
    pub fn fallback_targets(&self) -> Vec<Target> {
        if !self.default_targets.is_empty() {
            return self.default_targets.clone();
        }

        vec![Target {
            name: "default".into(),
            dist_dir: self.dist_dir.clone(),
            env: Default::default(),
            public_url: self.public_url.clone(),
        }]
    }

    pub fn config_path(&self) -> Utf8PathBuf {
        match &self.config {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => self.project_root.join(path),
            None => self.project_root.join(".kumitaterc"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_hash_ignores_paths() {
        let a = BuildOptions::default();
        let b = BuildOptions {
            project_root: "/elsewhere".into(),
            concurrency: 4,
            ..Default::default()
        };

        assert_eq!(a.options_hash(), b.options_hash());
    }

    #[test]
    fn test_options_hash_tracks_output_options() {
        let a = BuildOptions::default();
        let b = BuildOptions {
            minify: true,
            ..Default::default()
        };

        assert_ne!(a.options_hash(), b.options_hash());
    }

    #[test]
    fn test_deserialize_partial() {
        let options: BuildOptions =
            serde_json::from_str(r#"{"entries": ["src/*.js"], "scopeHoist": true}"#).unwrap();

        assert_eq!(options.entries, ["src/*.js"]);
        assert!(options.scope_hoist);
        assert_eq!(options.public_url, "/");
    }
}

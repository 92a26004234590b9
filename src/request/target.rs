use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use indexmap::IndexMap;
use serde::Deserialize;

use crate::error::RequestError;
use crate::request::{RequestResult, RunApi, RunContext, read_manifest};
use crate::types::{Context, Entry, Environment, Target};

/// Target as declared under `targets` in a `package.json`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct PackageTarget {
    dist_dir: Option<Utf8PathBuf>,
    context: Option<Context>,
    engines: Option<BTreeMap<String, String>>,
    include_node_modules: Option<bool>,
    is_library: Option<bool>,
    public_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Manifest {
    engines: BTreeMap<String, String>,
    targets: IndexMap<String, PackageTarget>,
}

/// Reads the targets of the package owning an entry, falling back to the
/// configured defaults.
pub(super) fn run(entry: &Entry, ctx: &RunContext, api: &mut RunApi) -> Result<RequestResult, RequestError> {
    let options = &ctx.options;
    let path = &entry.package_path;
    api.invalidate_on_file_update(path);

    let manifest: Manifest = match read_manifest(path)? {
        Some(value) => serde_json::from_value(value).map_err(|err| RequestError::Manifest(path.clone(), err))?,
        None => Manifest::default(),
    };

    let package_dir = path.parent().map(|dir| dir.to_path_buf()).unwrap_or_default();

    let mut targets: Vec<Target> = manifest
        .targets
        .into_iter()
        .map(|(name, target)| {
            let dist_dir = match target.dist_dir {
                Some(dir) => package_dir.join(dir),
                None => options.dist_dir.join(&name),
            };

            Target {
                dist_dir,
                env: Environment {
                    context: target.context.unwrap_or_default(),
                    engines: target.engines.unwrap_or_else(|| manifest.engines.clone()),
                    include_node_modules: target.include_node_modules.unwrap_or(false),
                    is_library: target.is_library.unwrap_or(false),
                },
                public_url: target.public_url.unwrap_or_else(|| options.public_url.clone()),
                name,
            }
        })
        .collect();

    if targets.is_empty() {
        targets = options.fallback_targets();
    }

    if let Some(name) = &options.target {
        targets.retain(|target| &target.name == name);
    }

    Ok(RequestResult::Target(targets))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::request::Invalidation;
    use crate::request::tests::context;

    fn entry(ctx: &RunContext) -> Entry {
        let root = &ctx.options.project_root;
        Entry {
            file_path: root.join("src/index.js"),
            package_path: root.join("package.json"),
        }
    }

    #[test]
    fn test_targets_from_manifest() {
        let (_dir, ctx) = context();
        let root = ctx.options.project_root.clone();
        fs::write(
            root.join("package.json"),
            r#"{
                "engines": {"browsers": "> 1%"},
                "targets": {
                    "modern": {"distDir": "out/modern"},
                    "server": {"context": "node", "engines": {"node": ">= 18"}}
                }
            }"#,
        )
        .unwrap();

        let mut api = RunApi::default();
        let RequestResult::Target(targets) = run(&entry(&ctx), &ctx, &mut api).unwrap() else {
            panic!("expected targets");
        };

        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].name, "modern");
        assert_eq!(targets[0].dist_dir, root.join("out/modern"));
        assert_eq!(targets[0].env.engines["browsers"], "> 1%");
        assert_eq!(targets[1].env.context, Context::Node);
        assert_eq!(targets[1].dist_dir, ctx.options.dist_dir.join("server"));
        assert_eq!(api.invalidations, [Invalidation::Update(root.join("package.json"))]);
    }

    #[test]
    fn test_missing_manifest_uses_fallback() {
        let (_dir, ctx) = context();

        let mut api = RunApi::default();
        let RequestResult::Target(targets) = run(&entry(&ctx), &ctx, &mut api).unwrap() else {
            panic!("expected targets");
        };

        assert_eq!(targets, ctx.options.fallback_targets());
        assert_eq!(api.invalidations.len(), 1);
    }

    #[test]
    fn test_broken_manifest() {
        let (_dir, ctx) = context();
        fs::write(ctx.options.project_root.join("package.json"), "{").unwrap();

        let mut api = RunApi::default();
        let err = run(&entry(&ctx), &ctx, &mut api).unwrap_err();
        assert!(matches!(err, RequestError::Manifest(..)));
    }
}

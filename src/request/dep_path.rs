use crate::core::normalize_path;
use crate::error::{RequestError, ResolveError};
use crate::request::{RequestResult, RunApi, RunContext};
use crate::types::{AssetGroup, Dependency};

/// Runs the resolver pipeline, the first resolver returning a resolution
/// wins.
pub(super) fn run(dependency: &Dependency, ctx: &RunContext, api: &mut RunApi) -> Result<RequestResult, RequestError> {
    match resolve(dependency, ctx) {
        Ok(group) => {
            api.connect_file(&group.file_path);
            Ok(RequestResult::DepPath(Some(group)))
        }
        Err(err) if err.is_not_found() && dependency.is_optional => {
            tracing::debug!("Optional dependency '{}' not found", dependency.module_specifier);
            Ok(RequestResult::DepPath(None))
        }
        Err(err) => Err(err.into()),
    }
}

fn resolve(dependency: &Dependency, ctx: &RunContext) -> Result<AssetGroup, ResolveError> {
    for resolver in &ctx.config.plugins.resolvers {
        let resolution = resolver
            .plugin
            .resolve(dependency, &ctx.options)
            .map_err(|err| ResolveError::Plugin(resolver.name.clone(), err))?;

        if let Some(resolution) = resolution {
            return Ok(AssetGroup {
                file_path: normalize_path(&resolution.file_path),
                env: dependency.env.clone(),
                side_effects: resolution.side_effects,
                code: resolution.code,
                pipeline: resolution.pipeline.or_else(|| dependency.pipeline.clone()),
            });
        }
    }

    Err(ResolveError::NotFound {
        specifier: dependency.module_specifier.clone(),
        from: dependency
            .resolve_from()
            .map(|dir| dir.to_string())
            .unwrap_or_else(|| ".".into()),
    })
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;
    use crate::error::PluginError;
    use crate::options::BuildOptions;
    use crate::plugin::{PluginRegistry, Resolution, Resolver};
    use crate::request::Invalidation;
    use crate::request::tests::context_with;
    use crate::types::DependencyOptions;

    /// Resolves relative specifiers next to the importing file.
    struct Relative;

    impl Resolver for Relative {
        fn resolve(&self, dependency: &Dependency, _: &BuildOptions) -> Result<Option<Resolution>, PluginError> {
            let Some(rest) = dependency.module_specifier.strip_prefix("./") else {
                return Ok(None);
            };
            let Some(dir) = dependency.resolve_from() else {
                return Ok(None);
            };

            Ok(Some(Resolution {
                file_path: dir.join(format!("{rest}.js")),
                side_effects: Some(false),
                ..Default::default()
            }))
        }
    }

    struct Failing;

    impl Resolver for Failing {
        fn resolve(&self, _: &Dependency, _: &BuildOptions) -> Result<Option<Resolution>, PluginError> {
            Err(anyhow::anyhow!("resolver crashed"))
        }
    }

    fn dependency(specifier: &str, is_optional: bool) -> Dependency {
        Dependency::new(DependencyOptions {
            source_path: Some("/src/index.js".into()),
            module_specifier: specifier.into(),
            is_optional,
            ..Default::default()
        })
    }

    #[test]
    fn test_resolves_and_connects_file() {
        let (_dir, ctx) = context_with(PluginRegistry::new().resolver("relative", Relative), |config| {
            config.resolvers = vec!["relative".into()];
        });

        let mut api = RunApi::default();
        let result = run(&dependency("./b", false), &ctx, &mut api).unwrap();

        let RequestResult::DepPath(Some(group)) = result else {
            panic!("expected a resolution");
        };
        assert_eq!(group.file_path, "/src/b.js");
        assert_eq!(group.side_effects, Some(false));
        assert_eq!(api.invalidations, [Invalidation::Connect(Utf8PathBuf::from("/src/b.js"))]);
    }

    #[test]
    fn test_resolved_path_is_normalized() {
        let (_dir, ctx) = context_with(PluginRegistry::new().resolver("relative", Relative), |config| {
            config.resolvers = vec!["relative".into()];
        });

        let mut api = RunApi::default();
        let result = run(&dependency("./../lib/./c", false), &ctx, &mut api).unwrap();

        let RequestResult::DepPath(Some(group)) = result else {
            panic!("expected a resolution");
        };
        assert_eq!(group.file_path, "/lib/c.js");
        assert_eq!(api.invalidations, [Invalidation::Connect(Utf8PathBuf::from("/lib/c.js"))]);
    }

    #[test]
    fn test_optional_not_found_resolves_to_none() {
        let (_dir, ctx) = context_with(PluginRegistry::new().resolver("relative", Relative), |config| {
            config.resolvers = vec!["relative".into()];
        });

        let mut api = RunApi::default();
        let result = run(&dependency("lodash", true), &ctx, &mut api).unwrap();
        assert_eq!(result, RequestResult::DepPath(None));

        let err = run(&dependency("lodash", false), &ctx, &mut api).unwrap_err();
        assert_eq!(err.to_string(), "Cannot find module 'lodash' from '/src'");
    }

    #[test]
    fn test_plugin_failure_is_not_swallowed() {
        let (_dir, ctx) = context_with(PluginRegistry::new().resolver("failing", Failing), |config| {
            config.resolvers = vec!["failing".into()];
        });

        let mut api = RunApi::default();
        let err = run(&dependency("lodash", true), &ctx, &mut api).unwrap_err();
        assert!(matches!(err, RequestError::Resolve(ResolveError::Plugin(..))));
    }
}

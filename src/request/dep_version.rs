use crate::error::RequestError;
use crate::request::{DepVersionRequestDesc, RequestResult, RunApi, RunContext, read_manifest};

/// Installed version of a package, from the first
/// `node_modules/<name>/package.json` found walking up from `resolve_from`.
pub(super) fn run(desc: &DepVersionRequestDesc, ctx: &RunContext, api: &mut RunApi) -> Result<RequestResult, RequestError> {
    if let Some(lock_file) = &ctx.options.lock_file {
        api.invalidate_on_file_update(ctx.options.project_root.join(lock_file));
    }

    for dir in desc.resolve_from.ancestors() {
        let manifest = dir
            .join("node_modules")
            .join(&desc.module_specifier)
            .join("package.json");

        if let Some(value) = read_manifest(&manifest)? {
            api.invalidate_on_file_update(&manifest);
            let version = value
                .get("version")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string);
            return Ok(RequestResult::DepVersion(version));
        }
    }

    Ok(RequestResult::DepVersion(None))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::request::Invalidation;
    use crate::request::tests::context;

    #[test]
    fn test_finds_version_above() {
        let (_dir, ctx) = context();
        let root = ctx.options.project_root.clone();
        let package = root.join("node_modules/@babel/core");
        fs::create_dir_all(&package).unwrap();
        fs::create_dir_all(root.join("src/nested")).unwrap();
        fs::write(package.join("package.json"), r#"{"version": "7.1.0"}"#).unwrap();

        let desc = DepVersionRequestDesc {
            module_specifier: "@babel/core".into(),
            resolve_from: root.join("src/nested"),
        };
        let mut api = RunApi::default();
        let result = run(&desc, &ctx, &mut api).unwrap();

        assert_eq!(result, RequestResult::DepVersion(Some("7.1.0".into())));
        assert_eq!(api.invalidations, [Invalidation::Update(package.join("package.json"))]);
    }

    #[test]
    fn test_missing_package() {
        let (_dir, ctx) = context();
        let desc = DepVersionRequestDesc {
            module_specifier: "left-pad".into(),
            resolve_from: ctx.options.project_root.clone(),
        };
        let mut api = RunApi::default();

        assert_eq!(run(&desc, &ctx, &mut api).unwrap(), RequestResult::DepVersion(None));
    }
}

use crate::error::RequestError;
use crate::request::{ConfigRequestDesc, ConfigResult, DepVersionRequestDesc, RequestDesc, RequestResult, RunApi, RunContext};

/// Loads the config a transformer wants for one file.
pub(super) fn run(desc: &ConfigRequestDesc, ctx: &RunContext, api: &mut RunApi) -> Result<RequestResult, RequestError> {
    let Some(transformer) = ctx.config.plugins.transformer(&desc.plugin) else {
        return Ok(RequestResult::Config(None));
    };

    let config = transformer
        .plugin
        .load_config(&desc.file_path, &ctx.options)
        .map_err(|error| RequestError::Config {
            path: desc.file_path.clone(),
            plugin: desc.plugin.clone(),
            error,
        })?;

    let Some(config) = config else {
        return Ok(RequestResult::Config(None));
    };

    for file in &config.files {
        api.invalidate_on_file_update(file);
    }

    let resolve_from = desc.file_path.parent().unwrap_or(&desc.file_path);
    for name in &config.dev_deps {
        api.add_sub_request(RequestDesc::DepVersion(DepVersionRequestDesc {
            module_specifier: name.clone(),
            resolve_from: resolve_from.to_path_buf(),
        }));
    }

    Ok(RequestResult::Config(Some(ConfigResult {
        value: config.value,
        files: config.files,
        dev_deps: config.dev_deps,
    })))
}

use std::sync::Arc;
use std::time::Instant;

use camino::Utf8Path;

use crate::cache::CacheEntry;
use crate::core::{Blake3Hasher, Hash32};
use crate::error::RequestError;
use crate::request::{ConfigRequestDesc, RequestDesc, RequestResult, RunApi, RunContext};
use crate::types::{Asset, AssetGroup, Blob};

/// Loads an asset group and runs it through its transformer pipeline.
///
/// Results are cached per file and environment. A cached entry is reused when
/// it was produced from the same source and the same transformer configs.
pub(super) fn run(group: &AssetGroup, ctx: &RunContext, api: &mut RunApi) -> Result<RequestResult, RequestError> {
    let start = Instant::now();
    let path = &group.file_path;
    api.connect_file(path);

    let transformers = ctx.config.plugins.transformers_for(path, group.pipeline.as_deref());

    let mut configs = Vec::with_capacity(transformers.len());
    for transformer in transformers {
        let config_desc = ConfigRequestDesc {
            file_path: path.clone(),
            plugin: transformer.name.clone(),
        };
        let desc = RequestDesc::Config(config_desc.clone());

        let result = match api.cached_result(&desc) {
            Some(result) => {
                api.store_sub_request(desc, result.clone(), None);
                result
            }
            None => {
                let mut sub_api = RunApi::default();
                let result = Arc::new(super::config::run(&config_desc, ctx, &mut sub_api)?);
                api.store_sub_request(desc, result.clone(), Some(sub_api));
                result
            }
        };

        configs.push(match &*result {
            RequestResult::Config(Some(config)) => Some(config.value.clone()),
            _ => None,
        });
    }

    let content = match &group.code {
        Some(code) => Blob::Text(code.clone()),
        None => read_source(path)?,
    };

    let mut hasher = Blake3Hasher::default();
    hasher.update(content.as_bytes());
    for (transformer, config) in transformers.iter().zip(&configs) {
        hasher.update(&transformer.name);
        hasher.update(config.as_ref().map(|value| value.to_string()).unwrap_or_default());
    }
    let hash = Hash32::from(hasher).to_hex();

    if !ctx.options.disable_cache
        && let Some(entry) = ctx.cache.read_entry(path, &group.env)
        && entry.hash == hash
        && entry.assets.iter().all(|asset| ctx.cache.has_blobs(asset))
    {
        tracing::debug!("Reusing cached transformation of {path}");
        for asset in &entry.assets {
            connect_included_files(asset, api);
        }
        return Ok(RequestResult::Asset(entry.assets));
    }

    let asset_type = path.extension().unwrap_or("js");
    let mut initial = Asset::new(path.clone(), asset_type, group.env.clone(), content);
    initial.side_effects = group.side_effects.unwrap_or(true);

    let mut assets = vec![initial];
    for (transformer, config) in transformers.iter().zip(&configs) {
        let mut next = Vec::with_capacity(assets.len());
        for asset in assets {
            let output = transformer
                .plugin
                .transform(asset, config.as_ref(), &ctx.options)
                .map_err(|err| RequestError::Transform(path.clone(), err))?;
            next.extend(output);
        }
        assets = next;
    }

    let time_ms = start.elapsed().as_millis() as u64;
    for asset in &mut assets {
        asset.refresh();
        asset.stats.time_ms = time_ms;
        connect_included_files(asset, api);
    }

    tracing::debug!("Transformed {path} into {} assets in {time_ms}ms", assets.len());

    if ctx.options.disable_cache {
        return Ok(RequestResult::Asset(assets));
    }

    let entry = CacheEntry {
        file_path: path.clone(),
        env: group.env.clone(),
        hash,
        assets,
    };

    let entry = ctx.cache.write_entry(entry.clone()).unwrap_or(entry);
    Ok(RequestResult::Asset(entry.assets))
}

fn connect_included_files(asset: &Asset, api: &mut RunApi) {
    for file in &asset.included_files {
        api.invalidate_on_file_update(file);
        api.invalidate_on_file_delete(file);
    }
}

/// Reads a source file as text, or as raw bytes when it isn't UTF-8.
fn read_source(path: &Utf8Path) -> Result<Blob, RequestError> {
    let bytes = std::fs::read(path)?;
    Ok(match String::from_utf8(bytes) {
        Ok(text) => Blob::Text(text),
        Err(err) => Blob::Bytes(err.into_bytes()),
    })
}

use camino::{Utf8Path, Utf8PathBuf};

use crate::core::normalize_path;
use crate::error::RequestError;
use crate::request::{RequestResult, RunApi, RunContext};
use crate::types::Entry;

pub(crate) fn is_glob(specifier: &str) -> bool {
    specifier.contains(['*', '?', '[', '{'])
}

/// Expands an entry specifier into entry files, each paired with the
/// closest `package.json` above it.
pub(super) fn run(specifier: &str, ctx: &RunContext, api: &mut RunApi) -> Result<RequestResult, RequestError> {
    let root = &ctx.options.project_root;
    let pattern = normalize_path(&root.join(specifier));

    let files = if is_glob(specifier) {
        let mut files = Vec::new();
        for path in glob::glob(pattern.as_str())? {
            let path = Utf8PathBuf::try_from(path?)?;
            if path.is_file() {
                files.push(path);
            }
        }
        // files created later are matched by the engine
        tracing::debug!("Entry glob '{specifier}' matched {} files", files.len());
        files
    } else if pattern.is_file() {
        vec![pattern]
    } else {
        return Err(RequestError::EntryNotFound(specifier.to_string()));
    };

    let mut entries = Vec::with_capacity(files.len());
    for file_path in files {
        let package_path = find_package(&file_path, root);
        api.invalidate_on_file_update(&package_path);
        entries.push(Entry {
            file_path,
            package_path,
        });
    }

    Ok(RequestResult::Entry(entries))
}

/// Closest `package.json` between the file and the project root, or the one
/// at the root when there is none.
fn find_package(file_path: &Utf8Path, root: &Utf8Path) -> Utf8PathBuf {
    for dir in file_path.ancestors().skip(1) {
        let candidate = dir.join("package.json");
        if candidate.is_file() {
            return candidate;
        }
        if dir == root {
            break;
        }
    }

    root.join("package.json")
}

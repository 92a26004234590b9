//! Rebuild loop driven by filesystem events.
//!
//! The project root is watched recursively through a debounced `notify`
//! watcher. Every batch of relevant events raises the engine's abort signal,
//! so a build still running stops early, and is then applied through
//! [`Engine::respond_to_events`] before the next build starts.

use std::ops::ControlFlow;
use std::sync::mpsc::{Receiver, channel};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecursiveMode};
use notify_debouncer_full::{DebounceEventResult, new_debouncer};

use crate::engine::{BuildResult, Engine};
use crate::error::{BuildError, WatchError};
use crate::types::{FileEvent, FileEventKind};

type Batch = Result<Vec<FileEvent>, Vec<notify::Error>>;

/// Builds, then rebuilds after every relevant change until `on_build`
/// breaks. Aborted builds are restarted without being passed to `on_build`.
pub fn watch<F>(engine: &mut Engine, mut on_build: F) -> Result<(), WatchError>
where
    F: FnMut(&Result<BuildResult, BuildError>) -> ControlFlow<()>,
{
    let (tx, rx) = channel();
    let signal = engine.signal();
    let ignored = vec![engine.options().cache_dir.clone(), engine.options().dist_dir.clone()];

    let mut debouncer = new_debouncer(Duration::from_millis(250), None, move |result: DebounceEventResult| {
        let batch = result.map(|events| translate(events.iter().map(|e| &e.event), &ignored));
        if let Ok(events) = &batch
            && events.is_empty()
        {
            return;
        }

        signal.abort();
        let _ = tx.send(batch);
    })?;

    let root = engine.options().project_root.clone();
    tracing::info!("Watching {root}");
    debouncer.watch(root.as_std_path(), RecursiveMode::Recursive)?;

    let mut result = engine.build();
    loop {
        let aborted = matches!(&result, Err(err) if err.is_abort());
        if !aborted && on_build(&result).is_break() {
            return Ok(());
        }

        loop {
            let events = next_events(&rx)?;
            match engine.respond_to_events(&events) {
                Ok(changed) if changed || aborted => break,
                Ok(_) => tracing::debug!("{} changes without effect", events.len()),
                Err(err) => tracing::error!("Failed to apply changes: {err}"),
            }
        }

        tracing::info!("Change detected, rebuilding");
        result = engine.build();
    }
}

/// Blocks for the next batch, then takes whatever else is already queued.
fn next_events(rx: &Receiver<Batch>) -> Result<Vec<FileEvent>, WatchError> {
    let mut events = Vec::new();
    let mut collect = |batch: Batch| match batch {
        Ok(batch) => events.extend(batch),
        Err(errors) => {
            for err in errors {
                tracing::error!("Watch error: {err}");
            }
        }
    };

    collect(rx.recv()?);
    while let Ok(batch) = rx.try_recv() {
        collect(batch);
    }
    Ok(events)
}

/// Maps notify events to file events, one per path with the last kind
/// winning. Paths under `ignored` and paths that aren't UTF-8 are dropped.
fn translate<'a>(events: impl IntoIterator<Item = &'a Event>, ignored: &[Utf8PathBuf]) -> Vec<FileEvent> {
    let mut changes: IndexMap<Utf8PathBuf, FileEventKind> = IndexMap::new();

    for event in events {
        let kinds: &[FileEventKind] = match event.kind {
            EventKind::Create(_) => &[FileEventKind::Create],
            EventKind::Remove(_) => &[FileEventKind::Delete],
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => &[FileEventKind::Delete],
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => &[FileEventKind::Create],
            // paths are [from, to]
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => &[FileEventKind::Delete, FileEventKind::Create],
            EventKind::Modify(ModifyKind::Metadata(_)) => &[],
            EventKind::Modify(_) => &[FileEventKind::Update],
            _ => &[],
        };

        for (index, path) in event.paths.iter().enumerate() {
            let Some(path) = Utf8Path::from_path(path) else {
                continue;
            };
            let Some(&kind) = kinds.get(index).or(kinds.last()) else {
                continue;
            };
            if ignored.iter().any(|dir| path.starts_with(dir)) {
                continue;
            }

            changes.shift_remove(path);
            changes.insert(path.to_path_buf(), kind);
        }
    }

    changes
        .into_iter()
        .map(|(path, kind)| FileEvent::new(path, kind))
        .collect()
}

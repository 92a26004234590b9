//! Content-addressed persistent blob store.
//!
//! Blobs are sharded over 256 subdirectories named after the first byte of
//! their hash, `<root>/<hash[0:2]>/<hash[2:]><ext>`. The extension records how
//! the blob was serialized: `.json` for structured values, `.bin` for raw
//! bytes and `.txt` for text. Asset outputs carry the output key as their
//! type extension instead of `.txt`.
//!
//! The cache never fails a build. Write errors are logged and dropped, read
//! errors are reported as misses.

use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::Hash32;
use crate::types::{Asset, Blob, Environment, OutputBlob};

/// Extensions of blobs stored under an opaque id, one per blob shape.
const EXTENSIONS: [&str; 3] = [".json", ".bin", ".txt"];

/// Cached result of transforming one file in one environment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub file_path: Utf8PathBuf,
    pub env: Environment,
    /// Hash of the source and transformer configs the entry was produced from.
    pub hash: String,
    pub assets: Vec<Asset>,
}

#[derive(Debug)]
pub struct Cache {
    dir: Utf8PathBuf,
    options_hash: Hash32,
    dir_exists: AtomicBool,
    invalidated: Mutex<HashSet<String>>,
    counter: AtomicU64,
}

impl Cache {
    pub fn new(dir: impl Into<Utf8PathBuf>, options_hash: Hash32) -> Self {
        Self {
            dir: dir.into(),
            options_hash,
            dir_exists: AtomicBool::new(false),
            invalidated: Mutex::new(HashSet::new()),
            counter: AtomicU64::new(0),
        }
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    /// Location of the blob stored under an opaque id, without extension.
    pub fn resolve_cache_path(&self, id: &str) -> Utf8PathBuf {
        self.cache_path(&Hash32::hash(id).to_hex(), "")
    }

    /// Cache id salted with the options hash, so that any change in output
    /// affecting options misses every previous entry.
    pub fn cache_id(&self, identity: &str, env: &Environment) -> String {
        let mut hasher = crate::core::Blake3Hasher::default();
        hasher.update(self.options_hash.to_hex());
        hasher.update(identity);
        if serde_json::to_writer(&mut hasher, env).is_err() {
            tracing::error!("couldn't serialize environment for cache id");
        }
        Hash32::from(hasher).to_hex()
    }

    fn cache_path(&self, cache_id: &str, extension: &str) -> Utf8PathBuf {
        let (shard, rest) = cache_id.split_at(2.min(cache_id.len()));
        self.dir.join(shard).join(format!("{rest}{extension}"))
    }

    fn ensure_dir_exists(&self) -> io::Result<()> {
        if self.dir_exists.load(Ordering::Acquire) {
            return Ok(());
        }

        fs::create_dir_all(&self.dir)?;
        for byte in 0..=255u8 {
            fs::create_dir_all(self.dir.join(format!("{byte:02x}")))?;
        }

        self.dir_exists.store(true, Ordering::Release);
        Ok(())
    }

    /// Writes through a sibling temporary file so readers never observe a
    /// partially written blob.
    fn write_file(&self, path: &Utf8Path, data: &[u8]) -> io::Result<()> {
        self.ensure_dir_exists()?;
        // shards deleted behind our back
        if let Some(parent) = path.parent()
            && !parent.is_dir()
        {
            fs::create_dir_all(parent)?;
        }

        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let temp = Utf8PathBuf::from(format!("{path}.{}.{n}.tmp", std::process::id()));

        let result = fs::File::create(&temp)
            .and_then(|mut file| file.write_all(data))
            .and_then(|_| fs::rename(&temp, path));

        if result.is_err() {
            let _ = fs::remove_file(&temp);
        }

        result
    }

    fn relative(&self, path: &Utf8Path) -> Utf8PathBuf {
        path.strip_prefix(&self.dir)
            .map(Utf8Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf())
    }

    fn clear_invalidated(&self, key: &str) {
        if let Ok(mut invalidated) = self.invalidated.lock() {
            invalidated.remove(key);
        }
    }

    fn is_invalidated(&self, key: &str) -> bool {
        self.invalidated
            .lock()
            .map(|invalidated| invalidated.contains(key))
            .unwrap_or(false)
    }

    /// Stores a blob under an opaque id. Returns the blob path relative to the
    /// cache root, or `None` when the write failed.
    /// A key holds a single blob, so writing one shape removes any blob of
    /// another shape stored under the same key.
    pub fn write(&self, id: &str, blob: &Blob) -> Option<Utf8PathBuf> {
        let base = self.resolve_cache_path(id);
        let (extension, data) = match blob {
            Blob::Bytes(bytes) => (".bin", bytes.clone()),
            Blob::Json(value) => (".json", serde_json::to_vec(value).unwrap_or_default()),
            Blob::Text(text) => (".txt", text.as_bytes().to_vec()),
        };

        let path = Utf8PathBuf::from(format!("{base}{extension}"));
        match self.write_file(&path, &data) {
            Ok(()) => {
                for other in EXTENSIONS.into_iter().filter(|&other| other != extension) {
                    let _ = fs::remove_file(format!("{base}{other}"));
                }
                self.clear_invalidated(id);
                Some(self.relative(&path))
            }
            Err(err) => {
                tracing::error!("Error writing to cache: {err}");
                None
            }
        }
    }

    pub fn read(&self, id: &str) -> Option<Blob> {
        if self.is_invalidated(id) {
            return None;
        }

        let base = self.resolve_cache_path(id);
        EXTENSIONS
            .into_iter()
            .map(|extension| Utf8PathBuf::from(format!("{base}{extension}")))
            .find(|path| path.is_file())
            .and_then(|path| read_path(&path))
    }

    pub fn write_json<T: Serialize + ?Sized>(&self, id: &str, value: &T) -> Option<Utf8PathBuf> {
        match serde_json::to_value(value) {
            Ok(value) => self.write(id, &Blob::Json(value)),
            Err(err) => {
                tracing::error!("Error writing to cache: {err}");
                None
            }
        }
    }

    pub fn read_json<T: DeserializeOwned>(&self, id: &str) -> Option<T> {
        match self.read(id)? {
            Blob::Json(value) => serde_json::from_value(value).ok(),
            _ => None,
        }
    }

    /// Stores one output of an asset next to its entry, named by the output
    /// key. Returns the relative path to put into the entry.
    pub fn write_blob(&self, kind: &str, cache_id: &str, blob: &Blob) -> Option<Utf8PathBuf> {
        let mut path = self.cache_path(cache_id, &format!(".{kind}")).into_string();
        let data = match blob {
            Blob::Bytes(bytes) => {
                path.push_str(".bin");
                bytes.clone()
            }
            Blob::Json(value) => {
                if kind != "json" {
                    path.push_str(".json");
                }
                serde_json::to_vec(value).unwrap_or_default()
            }
            Blob::Text(text) => text.as_bytes().to_vec(),
        };

        let path = Utf8PathBuf::from(path);
        match self.write_file(&path, &data) {
            Ok(()) => Some(self.relative(&path)),
            Err(err) => {
                tracing::error!("Error writing to cache: {err}");
                None
            }
        }
    }

    /// Reads a blob by its path relative to the cache root.
    pub fn read_blob(&self, path: &Utf8Path) -> Option<Blob> {
        read_path(&self.dir.join(path))
    }

    /// Whether every cached output of an asset is still on disk.
    pub fn has_blobs(&self, asset: &Asset) -> bool {
        asset.outputs.values().all(|blob| match blob {
            OutputBlob::Cached(path) => self.dir.join(path).is_file(),
            OutputBlob::Inline(_) => true,
        })
    }

    /// Loads every cached output of an asset back into memory.
    pub fn read_blobs(&self, asset: &mut Asset) -> Option<()> {
        for blob in asset.outputs.values_mut() {
            if let OutputBlob::Cached(path) = blob {
                *blob = OutputBlob::Inline(self.read_blob(path)?);
            }
        }
        Some(())
    }

    /// Persists a transformation entry, moving every inline output of its
    /// assets into a blob of its own. Returns the entry as stored.
    pub fn write_entry(&self, mut entry: CacheEntry) -> Option<CacheEntry> {
        for asset in &mut entry.assets {
            let asset_cache_id = self.cache_id(&asset.output_hash, &asset.env);
            for (key, blob) in asset.outputs.iter_mut() {
                if let OutputBlob::Inline(inline) = blob {
                    let path = self.write_blob(key, &asset_cache_id, inline)?;
                    *blob = OutputBlob::Cached(path);
                }
            }
        }

        let cache_id = self.cache_id(entry.file_path.as_str(), &entry.env);
        let path = self.cache_path(&cache_id, ".json");
        let data = match serde_json::to_vec(&entry) {
            Ok(data) => data,
            Err(err) => {
                tracing::error!("Error writing to cache: {err}");
                return None;
            }
        };

        match self.write_file(&path, &data) {
            Ok(()) => {
                self.clear_invalidated(entry.file_path.as_str());
                Some(entry)
            }
            Err(err) => {
                tracing::error!("Error writing to cache: {err}");
                None
            }
        }
    }

    pub fn read_entry(&self, file_path: &Utf8Path, env: &Environment) -> Option<CacheEntry> {
        if self.is_invalidated(file_path.as_str()) {
            return None;
        }

        let cache_id = self.cache_id(file_path.as_str(), env);
        let data = fs::read(self.cache_path(&cache_id, ".json")).ok()?;
        serde_json::from_slice(&data).ok()
    }

    /// Makes reads of `key` miss until it is written again. Applies both to
    /// opaque ids and to the file paths entries are keyed by.
    pub fn invalidate(&self, key: &str) {
        if let Ok(mut invalidated) = self.invalidated.lock() {
            invalidated.insert(key.to_string());
        }
    }

    pub fn delete(&self, file_path: &Utf8Path, env: &Environment) {
        let cache_id = self.cache_id(file_path.as_str(), env);
        if fs::remove_file(self.cache_path(&cache_id, ".json")).is_ok() {
            self.clear_invalidated(file_path.as_str());
        }
    }
}

fn read_path(path: &Utf8Path) -> Option<Blob> {
    let data = fs::read(path).ok()?;
    match path.extension() {
        Some("bin") => Some(Blob::Bytes(data)),
        Some("json") => serde_json::from_slice(&data).ok().map(Blob::Json),
        _ => String::from_utf8(data).ok().map(Blob::Text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache() -> (tempfile::TempDir, Cache) {
        let temp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(temp.path().join("cache")).unwrap();
        let cache = Cache::new(dir, Hash32::hash("options"));
        (temp, cache)
    }

    #[test]
    fn test_json_round_trip() {
        let (_temp, cache) = cache();
        let value = json!({"a": [1, 2, {"b": null}], "c": "d"});

        let path = cache.write("key", &Blob::Json(value.clone())).unwrap();

        assert_eq!(path.extension(), Some("json"));
        assert_eq!(cache.read("key"), Some(Blob::Json(value)));
    }

    #[test]
    fn test_bytes_round_trip() {
        let (_temp, cache) = cache();
        let bytes: Vec<u8> = (0..=255).collect();

        let path = cache.write("bytes", &Blob::Bytes(bytes.clone())).unwrap();

        assert_eq!(path.extension(), Some("bin"));
        assert_eq!(cache.read("bytes"), Some(Blob::Bytes(bytes)));
    }

    #[test]
    fn test_typed_json_helpers() {
        let (_temp, cache) = cache();
        let value = vec!["x".to_string(), "y".to_string()];

        cache.write_json("list", &value);

        assert_eq!(cache.read_json::<Vec<String>>("list"), Some(value));
    }

    #[test]
    fn test_miss_when_never_written() {
        let (_temp, cache) = cache();
        assert_eq!(cache.read("nothing"), None);
        assert!(cache.read_entry(Utf8Path::new("/src/a.js"), &Environment::default()).is_none());
    }

    #[test]
    fn test_miss_after_invalidate_until_rewritten() {
        let (_temp, cache) = cache();
        let blob = Blob::Json(json!(1));
        cache.write("key", &blob);

        cache.invalidate("key");
        assert_eq!(cache.read("key"), None);

        cache.write("key", &Blob::Json(json!(2)));
        assert_eq!(cache.read("key"), Some(Blob::Json(json!(2))));
    }

    #[test]
    fn test_rewrite_with_another_shape_replaces_the_blob() {
        let (_temp, cache) = cache();

        cache.write("key", &Blob::Json(json!({"old": 1})));
        cache.write("key", &Blob::Bytes(vec![1, 2, 3]));
        assert_eq!(cache.read("key"), Some(Blob::Bytes(vec![1, 2, 3])));

        cache.write("text", &Blob::Text("a".into()));
        cache.write("text", &Blob::Json(json!(2)));
        cache.write("text", &Blob::Text("b".into()));
        assert_eq!(cache.read("text"), Some(Blob::Text("b".into())));

        let base = cache.resolve_cache_path("text");
        assert!(!Utf8PathBuf::from(format!("{base}.json")).exists());
    }

    #[test]
    fn test_layout_is_sharded() {
        let (_temp, cache) = cache();
        let path = cache.write("key", &Blob::Text("hello".into())).unwrap();

        let hex = Hash32::hash("key").to_hex();
        assert_eq!(path, Utf8PathBuf::from(&hex[..2]).join(format!("{}.txt", &hex[2..])));
        assert!(cache.dir().join("00").is_dir());
        assert!(cache.dir().join("ff").is_dir());
    }

    #[test]
    fn test_write_blob_extension_policy() {
        let (_temp, cache) = cache();
        let id = cache.cache_id("hash", &Environment::default());

        let text = cache.write_blob("js", &id, &Blob::Text("x".into())).unwrap();
        let bytes = cache.write_blob("png", &id, &Blob::Bytes(vec![1])).unwrap();
        let map = cache.write_blob("map", &id, &Blob::Json(json!({}))).unwrap();
        let json = cache.write_blob("json", &id, &Blob::Json(json!({}))).unwrap();

        assert!(text.as_str().ends_with(".js"));
        assert!(bytes.as_str().ends_with(".png.bin"));
        assert!(map.as_str().ends_with(".map.json"));
        assert!(json.as_str().ends_with(".json") && !json.as_str().ends_with(".json.json"));

        assert_eq!(cache.read_blob(&text), Some(Blob::Text("x".into())));
        assert_eq!(cache.read_blob(&bytes), Some(Blob::Bytes(vec![1])));
    }

    #[test]
    fn test_cache_id_depends_on_options() {
        let temp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let a = Cache::new(dir.clone(), Hash32::hash("a"));
        let b = Cache::new(dir, Hash32::hash("b"));
        let env = Environment::default();

        assert_eq!(a.cache_id("x", &env), a.cache_id("x", &env));
        assert_ne!(a.cache_id("x", &env), b.cache_id("x", &env));
    }

    #[test]
    fn test_entry_round_trip_moves_outputs_to_blobs() {
        let (_temp, cache) = cache();
        let env = Environment::default();
        let asset = Asset::new("/src/a.js", "js", env.clone(), Blob::Text("let a".into()));
        let entry = CacheEntry {
            file_path: "/src/a.js".into(),
            env: env.clone(),
            hash: asset.hash.clone(),
            assets: vec![asset.clone()],
        };

        let stored = cache.write_entry(entry).unwrap();
        assert!(matches!(stored.assets[0].content(), Some(OutputBlob::Cached(_))));

        let mut read = cache.read_entry(Utf8Path::new("/src/a.js"), &env).unwrap();
        assert_eq!(read, stored);

        assert!(cache.has_blobs(&read.assets[0]));
        let mut loaded = read.assets[0].clone();
        cache.read_blobs(&mut loaded).unwrap();
        assert_eq!(loaded.outputs, asset.outputs);

        let Some(OutputBlob::Cached(path)) = read.assets[0].content() else {
            unreachable!()
        };
        fs::remove_file(cache.dir().join(path)).unwrap();
        assert!(!cache.has_blobs(&read.assets[0]));
        assert!(cache.read_blobs(&mut read.assets[0]).is_none());
    }

    #[test]
    fn test_entry_invalidate_and_delete() {
        let (_temp, cache) = cache();
        let env = Environment::default();
        let entry = CacheEntry {
            file_path: "/src/a.js".into(),
            env: env.clone(),
            hash: "h".into(),
            assets: vec![],
        };

        cache.write_entry(entry.clone());
        cache.invalidate("/src/a.js");
        assert!(cache.read_entry(Utf8Path::new("/src/a.js"), &env).is_none());

        cache.write_entry(entry);
        assert!(cache.read_entry(Utf8Path::new("/src/a.js"), &env).is_some());

        cache.delete(Utf8Path::new("/src/a.js"), &env);
        assert!(cache.read_entry(Utf8Path::new("/src/a.js"), &env).is_none());
    }

    #[test]
    fn test_write_failure_is_swallowed() {
        let temp = tempfile::tempdir().unwrap();
        let file = temp.path().join("occupied");
        fs::write(&file, b"").unwrap();
        let dir = Utf8PathBuf::from_path_buf(file).unwrap();
        let cache = Cache::new(dir, Hash32::hash("options"));

        assert_eq!(cache.write("key", &Blob::Text("x".into())), None);
        assert_eq!(cache.read("key"), None);
    }
}

#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod asset_graph;
mod cache;
pub mod config;
mod core;
mod engine;
mod error;
pub mod graph;
#[cfg(feature = "logging")]
mod logging;
mod options;
pub mod plugin;
pub mod request;
mod signal;
mod types;
#[cfg(feature = "live")]
mod watch;

pub use crate::asset_graph::{AssetGraph, AssetGraphNode};
pub use crate::cache::{Cache, CacheEntry};
pub use crate::config::{Config, ConfigLoader, ConfigSnapshot, RawConfig};
pub use crate::core::{ArcStr, Blake3Hasher, Hash32};
pub use crate::engine::{BuildResult, Engine, PackagedBundle};
pub use crate::error::*;
pub use crate::graph::{Graph, Node, NodeId};
#[cfg(feature = "logging")]
pub use crate::logging::init_logging;
pub use crate::options::BuildOptions;
pub use crate::plugin::PluginRegistry;
pub use crate::request::{RequestGraph, RequestTracker};
pub use crate::signal::AbortSignal;
pub use crate::types::*;
#[cfg(feature = "live")]
pub use crate::watch::watch;

//! An incremental, parallel build engine driven by programmatic build
//! descriptions.
//!
//! A description declares nodes (files on disk, or purely virtual markers)
//! and builders producing target nodes from source nodes. For any requested
//! set of nodes the [`work::Engine`] determines the minimum set of builders
//! to run — comparing content hashes of static and dynamically discovered
//! sources, and the builders' own fingerprints, against the records of the
//! previous run — and runs them as concurrent cooperative tasks over the
//! dependency DAG.

pub mod builders;
pub mod cli;
pub mod densemap;
pub mod depfile;
pub mod error;
pub mod graph;
pub mod hasher;
pub mod path;
pub mod rules;
pub mod sched;
pub mod work;

pub use error::{Error, Result};
pub use graph::{BuilderId, Graph, NodeId, NodeKind};
pub use path::Path;
pub use rules::{Rule, TestSuite};
pub use work::{BuildAction, DepContext, Engine, ExecContext};

//! Persisted dependency fingerprints for one builder slot.
//!
//! To decide whether a builder must re-execute, the engine compares the
//! current hash of each source with the hash recorded when the builder last
//! ran. A builder may own several of these files when its dependencies come
//! from different places (one for static sources, one per dynamic
//! category).
//!
//! On-disk format, one record per line:
//! `<sha1-hex> <absolute-node-name> <type-tag>\n`. Node names may contain
//! spaces; the hash is the first space-separated field, the type tag the
//! last, and the name is everything between.

use std::collections::BTreeMap;
use std::io::Write;

use log::debug;

use crate::error::Result;
use crate::graph::{Graph, NodeId};
use crate::path::Path;

pub struct DepFile {
    /// Nodes registered for the next write: absolute name -> node.
    files: BTreeMap<String, NodeId>,
    /// Records read from disk: absolute name -> (hash, type tag).
    stored: BTreeMap<String, (String, String)>,
}

impl DepFile {
    pub fn new() -> DepFile {
        DepFile {
            files: BTreeMap::new(),
            stored: BTreeMap::new(),
        }
    }

    /// Add a node to the fingerprinted set.
    pub fn register(&mut self, name: &str, node: NodeId) {
        self.files.insert(name.to_owned(), node);
    }

    pub fn files(&self) -> impl Iterator<Item = (&String, NodeId)> {
        self.files.iter().map(|(name, &id)| (name, id))
    }

    pub fn stored(&self) -> &BTreeMap<String, (String, String)> {
        &self.stored
    }

    /// Read the records from `path`, creating the file if absent. A record
    /// that does not parse is treated as not being there at all, which
    /// downgrades to a rebuild rather than a wrong skip.
    pub fn read(&mut self, path: &Path) -> Result<()> {
        path.touch()?;
        let text = std::fs::read_to_string(path.to_string())?;
        for line in text.lines() {
            let chunks: Vec<&str> = line.split(' ').collect();
            if chunks.len() < 3 {
                debug!("{}: unparseable record {:?}", path, line);
                continue;
            }
            let hash = chunks[0];
            let tag = chunks[chunks.len() - 1];
            let name = chunks[1..chunks.len() - 1].join(" ");
            self.stored
                .insert(name, (hash.to_owned(), tag.to_owned()));
        }
        Ok(())
    }

    /// Whether every stored record matches the current hash of its node.
    /// Records naming paths the registry no longer knows are dropped.
    pub fn up_to_date(&mut self, graph: &mut Graph) -> bool {
        let names: Vec<String> = self.stored.keys().cloned().collect();
        for name in names {
            let Some(id) = graph.lookup(name.as_str()) else {
                self.stored.remove(&name);
                continue;
            };
            let current = match graph.node_mut(id).hash() {
                Ok(hash) => hash,
                Err(err) => {
                    debug!("{}: hashing failed ({}), forcing rebuild", name, err);
                    return false;
                }
            };
            if self.stored[&name].0 != current {
                debug!("{}: hash is outdated", name);
                return false;
            }
        }
        true
    }

    /// Rehash all registered files and rewrite `path` wholesale. The write
    /// goes through a temporary file and a rename.
    pub fn write(&self, path: &Path, graph: &mut Graph) -> Result<()> {
        let tmp = format!("{}.tmp", path);
        {
            let mut out = std::fs::File::create(&tmp)?;
            for (name, &id) in &self.files {
                let hash = graph.node_mut(id).hash()?;
                let tag = graph.node(id).type_tag();
                writeln!(out, "{} {} {}", hash, name, tag)?;
            }
        }
        std::fs::rename(&tmp, path.to_string())?;
        Ok(())
    }
}

impl Default for DepFile {
    fn default() -> Self {
        DepFile::new()
    }
}

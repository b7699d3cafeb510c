//! The build graph: typed nodes, the builders that produce them, and the
//! registry binding absolute names to node instances.
//!
//! The graph owns all nodes and builders in dense arenas; cross-references
//! are ids. A node has at most one producing builder and a list of consumer
//! builders (the latter used only for root-set computation and graph
//! output, never for build traversal).

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use log::debug;

use crate::densemap::{self, DenseMap};
use crate::depfile::DepFile;
use crate::error::{Error, Result};
use crate::hasher::{self, StableHasher};
use crate::path::Path;
use crate::sched::Signal;
use crate::work::BuildAction;

/// Id for nodes in the graph.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct NodeId(u32);
impl densemap::Index for NodeId {
    fn index(&self) -> usize {
        self.0 as usize
    }
}
impl From<usize> for NodeId {
    fn from(u: usize) -> NodeId {
        NodeId(u as u32)
    }
}

/// Id for builders in the graph.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct BuilderId(u32);
impl densemap::Index for BuilderId {
    fn index(&self) -> usize {
        self.0 as usize
    }
}
impl From<usize> for BuilderId {
    fn from(u: usize) -> BuilderId {
        BuilderId(u as u32)
    }
}

pub const FILE_TAG: &str = "drover.File";
pub const DICTIONARY_TAG: &str = "drover.Dictionary";
pub const RULE_TAG: &str = "drover.Rule";

/// What a node is; the tag decides how it hashes and whether it has a
/// filesystem presence.
pub enum NodeKind {
    /// A physical file; hash is the digest of its bytes.
    File,
    /// Virtual key/value content; hash covers the sorted pairs.
    Dictionary(BTreeMap<String, String>),
    /// Virtual aggregate with a constant hash.
    Rule,
}

impl NodeKind {
    pub fn type_tag(&self) -> &'static str {
        match self {
            NodeKind::File => FILE_TAG,
            NodeKind::Dictionary(_) => DICTIONARY_TAG,
            NodeKind::Rule => RULE_TAG,
        }
    }

    pub fn is_virtual(&self) -> bool {
        !matches!(self, NodeKind::File)
    }
}

/// Constructs a node kind for a type tag, used when rehydrating dependency
/// records.
pub type NodeCtor = fn(&Path) -> NodeKind;

/// Materializes a dynamic-dependency node for a path the registry does not
/// know; pure apart from node construction.
pub type DepsHandler = Rc<dyn Fn(&mut Graph, &Path, &str) -> Result<NodeId>>;

/// Hook run after a node has been built.
pub type PolishHook = Rc<dyn Fn(&Graph, NodeId)>;

/// A single named artifact.
pub struct Node {
    name: Path,
    pub kind: NodeKind,
    /// The builder that generates this node, if any.
    pub builder: Option<BuilderId>,
    /// The builders that take this node as an input.
    pub consumers: Vec<BuilderId>,
    hash: Option<String>,
    pub polish: Option<PolishHook>,
}

impl Node {
    /// Absolute name, unique process-wide.
    pub fn name(&self) -> &Path {
        &self.name
    }

    pub fn type_tag(&self) -> &'static str {
        self.kind.type_tag()
    }

    /// Whether this node must be built even if nothing else is stale.
    /// For files this is "absent on disk"; virtual nodes are never missing.
    pub fn missing(&self) -> bool {
        match self.kind {
            NodeKind::File => !self.name.exists(),
            _ => false,
        }
    }

    /// Content hash, memoized until the producing builder re-executes.
    pub fn hash(&mut self) -> Result<String> {
        if let Some(h) = &self.hash {
            return Ok(h.clone());
        }
        let h = match &self.kind {
            NodeKind::File => hasher::hash_file(&self.name.to_string())?,
            NodeKind::Dictionary(content) => {
                let mut hasher = StableHasher::new();
                for (key, value) in content {
                    hasher.field(key).field(value);
                }
                hasher.finish()
            }
            NodeKind::Rule => String::new(),
        };
        self.hash = Some(h.clone());
        Ok(h)
    }

    pub fn invalidate_hash(&mut self) {
        self.hash = None;
    }
}

/// A single build action, generating target nodes from source nodes.
pub struct Builder {
    pub action: Rc<dyn BuildAction>,
    /// Static sources, ordered by absolute name.
    pub sources: BTreeMap<String, NodeId>,
    /// Built alongside sources but never fingerprinted.
    pub vsources: BTreeMap<String, NodeId>,
    /// Non-empty, sorted by absolute name; targets[0] keys the cachedir.
    pub targets: Vec<NodeId>,
    /// Dynamic sources accumulated during discovery; cleared on re-execution.
    pub dynsrc: BTreeMap<String, NodeId>,
    /// One in-memory DepFile per dynamic-dependency category.
    pub depfiles: BTreeMap<String, DepFile>,
    /// Set exactly once per engine run.
    pub executed: bool,
    pub result: Option<Result<()>>,
    pub signal: Option<Signal>,
}

impl Builder {
    pub fn pretty(&self) -> String {
        self.action.pretty()
    }

    /// The in-memory depfile for a dynamic category, created on demand.
    pub fn depfile(&mut self, category: &str) -> &mut DepFile {
        self.depfiles
            .entry(category.to_owned())
            .or_insert_with(DepFile::new)
    }
}

pub struct Graph {
    nodes: DenseMap<NodeId, Node>,
    pub builders: DenseMap<BuilderId, Builder>,
    by_name: HashMap<String, NodeId>,
    types: HashMap<String, NodeCtor>,
    extensions: HashMap<String, String>,
    deps_handlers: HashMap<String, DepsHandler>,
    root: Path,
}

impl Graph {
    pub fn new() -> Graph {
        Graph::with_root(Path::new("."))
    }

    /// A graph whose relative node names resolve under `root`.
    pub fn with_root(root: Path) -> Graph {
        let mut graph = Graph {
            nodes: DenseMap::new(),
            builders: DenseMap::new(),
            by_name: HashMap::new(),
            types: HashMap::new(),
            extensions: HashMap::new(),
            deps_handlers: HashMap::new(),
            root,
        };
        graph.types.insert(FILE_TAG.to_owned(), |_| NodeKind::File);
        graph.types.insert(DICTIONARY_TAG.to_owned(), |_| {
            NodeKind::Dictionary(BTreeMap::new())
        });
        graph.types.insert(RULE_TAG.to_owned(), |_| NodeKind::Rule);
        graph
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Register a node type for DepFile rehydration. Tags may not contain
    /// spaces: the record format is space-delimited.
    pub fn register_node_type(&mut self, tag: &str, ctor: NodeCtor) -> Result<()> {
        if tag.contains(' ') {
            return Err(Error::Invalid(format!(
                "node type tag may not contain spaces: {:?}",
                tag
            )));
        }
        self.types.insert(tag.to_owned(), ctor);
        Ok(())
    }

    /// Map a file extension to a registered node type, so `node_id` can
    /// pick the kind automatically.
    pub fn register_extension(&mut self, extension: &str, tag: &str) {
        self.extensions.insert(extension.to_owned(), tag.to_owned());
    }

    pub fn register_deps_handler(
        &mut self,
        category: &str,
        handler: impl Fn(&mut Graph, &Path, &str) -> Result<NodeId> + 'static,
    ) {
        self.deps_handlers
            .insert(category.to_owned(), Rc::new(handler));
    }

    pub fn deps_handler(&self, category: &str) -> Option<DepsHandler> {
        self.deps_handlers.get(category).cloned()
    }

    pub fn has_type(&self, tag: &str) -> bool {
        self.types.contains_key(tag)
    }

    fn resolve(&self, path: impl Into<Path>) -> Result<Path> {
        let path = path.into();
        if path.virtual_ || path.absolute() {
            Ok(path)
        } else {
            self.root.join(path)
        }
    }

    /// Look up a node by name without creating it.
    pub fn lookup(&self, path: impl Into<Path>) -> Option<NodeId> {
        let path = self.resolve(path).ok()?;
        self.by_name.get(&path.to_string()).copied()
    }

    /// Create or get a node. An existing node is returned as long as its
    /// type matches the request (an untyped request matches anything);
    /// otherwise the name is being redefined, which is fatal.
    pub fn node_id(&mut self, path: impl Into<Path>, tag: Option<&str>) -> Result<NodeId> {
        let path = self.resolve(path)?;
        let key = path.to_string();
        if let Some(&id) = self.by_name.get(&key) {
            let existing = self.nodes.get(id).type_tag();
            return match tag {
                Some(tag) if tag != existing => Err(Error::NodeRedefinition(key)),
                _ => Ok(id),
            };
        }
        let tag = match tag {
            Some(tag) => tag.to_owned(),
            None => self
                .extensions
                .get(&path.extension())
                .cloned()
                .unwrap_or_else(|| FILE_TAG.to_owned()),
        };
        let ctor = self
            .types
            .get(&tag)
            .ok_or_else(|| Error::UnknownType(tag.clone()))?;
        let kind = ctor(&path);
        Ok(self.insert(path, kind))
    }

    /// Create or get a plain file node.
    pub fn file(&mut self, path: impl Into<Path>) -> Result<NodeId> {
        self.node_id(path, Some(FILE_TAG))
    }

    /// Create a dictionary node with the given content. Names are virtual.
    pub fn dictionary(&mut self, name: &str, content: BTreeMap<String, String>) -> Result<NodeId> {
        let mut path = Path::new(name);
        path.virtual_ = true;
        let key = path.to_string();
        if let Some(&id) = self.by_name.get(&key) {
            if self.nodes.get(id).type_tag() != DICTIONARY_TAG {
                return Err(Error::NodeRedefinition(key));
            }
            return Ok(id);
        }
        Ok(self.insert(path, NodeKind::Dictionary(content)))
    }

    /// Create a virtual rule node (no builder yet).
    pub fn rule_node(&mut self, name: &str) -> Result<NodeId> {
        let mut path = Path::new(name);
        path.virtual_ = true;
        let key = path.to_string();
        if let Some(&id) = self.by_name.get(&key) {
            if self.nodes.get(id).type_tag() != RULE_TAG {
                return Err(Error::NodeRedefinition(key));
            }
            return Ok(id);
        }
        Ok(self.insert(path, NodeKind::Rule))
    }

    /// Materialize a node from a DepFile record; unknown tags are fatal.
    pub fn node_for_tag(&mut self, tag: &str, path: &Path) -> Result<NodeId> {
        if !self.types.contains_key(tag) {
            return Err(Error::UnknownType(tag.to_owned()));
        }
        self.node_id(path.clone(), Some(tag))
    }

    fn insert(&mut self, name: Path, kind: NodeKind) -> NodeId {
        let key = name.to_string();
        let id = self.nodes.push(Node {
            name,
            kind,
            builder: None,
            consumers: Vec::new(),
            hash: None,
            polish: None,
        });
        self.by_name.insert(key, id);
        id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes.get_mut(id)
    }

    pub fn builder(&self, id: BuilderId) -> &Builder {
        self.builders.get(id)
    }

    pub fn builder_mut(&mut self, id: BuilderId) -> &mut Builder {
        self.builders.get_mut(id)
    }

    /// Update one dictionary entry, dropping the memoized hash.
    pub fn dictionary_set(&mut self, id: NodeId, key: &str, value: &str) -> Result<()> {
        let node = self.nodes.get_mut(id);
        match &mut node.kind {
            NodeKind::Dictionary(content) => {
                content.insert(key.to_owned(), value.to_owned());
                node.invalidate_hash();
                Ok(())
            }
            _ => Err(Error::Invalid(format!("{} is not a dictionary", node.name))),
        }
    }

    pub fn set_polish(&mut self, id: NodeId, hook: impl Fn(&Graph, NodeId) + 'static) {
        self.nodes.get_mut(id).polish = Some(Rc::new(hook));
    }

    /// Register a builder producing `targets` from `sources`. Each target
    /// must not already have a builder.
    pub fn add_builder(
        &mut self,
        action: Rc<dyn BuildAction>,
        sources: Vec<NodeId>,
        mut targets: Vec<NodeId>,
    ) -> Result<BuilderId> {
        if targets.is_empty() {
            return Err(Error::Invalid(format!(
                "builder {} declares no targets",
                action.pretty()
            )));
        }
        targets.sort_by(|&a, &b| self.nodes.get(a).name.cmp(&self.nodes.get(b).name));
        let id = self.builders.next_id();
        for &target in &targets {
            let node = self.nodes.get_mut(target);
            if node.builder.is_some() {
                return Err(Error::BuilderRedefinition(node.name.to_string()));
            }
            node.builder = Some(id);
        }
        let mut builder = Builder {
            action,
            sources: BTreeMap::new(),
            vsources: BTreeMap::new(),
            targets,
            dynsrc: BTreeMap::new(),
            depfiles: BTreeMap::new(),
            executed: false,
            result: None,
            signal: None,
        };
        for source in sources {
            let name = self.nodes.get(source).name.to_string();
            builder.sources.insert(name, source);
            self.nodes.get_mut(source).consumers.push(id);
        }
        self.builders.push(builder);
        Ok(id)
    }

    /// Add a static source after construction; only legal before the
    /// builder first executes.
    pub fn add_source(&mut self, builder: BuilderId, source: NodeId) -> Result<()> {
        if self.builders.get(builder).executed {
            return Err(Error::Invalid(format!(
                "cannot add a source to {} after it has executed",
                self.builders.get(builder).pretty()
            )));
        }
        let name = self.nodes.get(source).name.to_string();
        self.builders.get_mut(builder).sources.insert(name, source);
        self.nodes.get_mut(source).consumers.push(builder);
        Ok(())
    }

    /// Add a virtual source: built when the builder runs, never
    /// fingerprinted.
    pub fn add_virtual_source(&mut self, builder: BuilderId, source: NodeId) {
        let name = self.nodes.get(source).name.to_string();
        self.builders.get_mut(builder).vsources.insert(name, source);
    }

    /// Record a dynamic source under a named category.
    pub fn add_dynsrc(&mut self, builder: BuilderId, category: &str, source: NodeId) {
        let name = self.nodes.get(source).name.to_string();
        debug!(
            "{}: dynamic source {} ({})",
            self.builders.get(builder).pretty(),
            name,
            category
        );
        let b = self.builders.get_mut(builder);
        b.depfile(category).register(&name, source);
        b.dynsrc.insert(name, source);
    }

    /// The directory holding this builder's dependency files:
    /// `<target0-dirname>/.drake/<target0-basename>`.
    pub fn cachedir(&self, builder: BuilderId) -> Result<Path> {
        let target = self.builders.get(builder).targets[0];
        let name = &self.nodes.get(target).name;
        let mut dir = name.dirname()?.join(".drake")?.join(name.basename()?)?;
        dir.virtual_ = false;
        if !dir.absolute() {
            dir = self.root.join(dir)?;
        }
        Ok(dir)
    }

    /// Whether the node's builder has run, and how it went. `None` when
    /// there is nothing to report (no builder, or not run yet).
    pub fn build_status(&self, id: NodeId) -> Option<bool> {
        let builder = self.nodes.get(id).builder?;
        let b = self.builders.get(builder);
        if !b.executed {
            return None;
        }
        Some(matches!(b.result, Some(Ok(()))))
    }

    /// Nodes no builder consumes: the roots of the dependency DAG.
    pub fn roots(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.consumers.is_empty())
            .map(|(id, _)| id)
            .collect()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.ids().collect()
    }
}

impl Default for Graph {
    fn default() -> Self {
        Graph::new()
    }
}

//! The build engine: staleness decision, builder run protocol, and the
//! driver that seeds tasks for requested nodes.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::{BTreeMap, HashSet};
use std::rc::Rc;

use log::debug;

use crate::depfile::DepFile;
use crate::error::{Error, Result};
use crate::graph::{BuilderId, Graph, NodeId};
use crate::path::Path;
use crate::sched::{self, DynFuture, Scheduler, Scope, Semaphore, Signal};

/// The primary DepFile, fingerprinting static sources.
pub const DEPFILE_PRIMARY: &str = "drake";
/// The builder's own fingerprint.
pub const DEPFILE_BUILDER: &str = "drake.Builder";
/// Names of the dynamic categories written by the last execution.
pub const DEPFILE_CATEGORIES: &str = "drake.categories";
/// Captured command output.
pub const STDOUT_FILE: &str = "stdout";

/// Cachedir entries that are never dynamic-dependency categories.
const RESERVED: [&str; 4] = [
    DEPFILE_PRIMARY,
    DEPFILE_BUILDER,
    DEPFILE_CATEGORIES,
    STDOUT_FILE,
];

/// The behavior of a builder: how it executes and how it discovers its
/// dynamic dependencies. Implemented by concrete builders; the engine owns
/// everything else (staleness, scheduling, persistence).
pub trait BuildAction: 'static {
    /// Produce the targets; `Ok(false)` reports failure. Runs as
    /// cooperative task code: blocking side effects should go through
    /// [`ExecContext::background`] or [`ExecContext::cmd`].
    fn execute<'a>(&'a self, cx: &'a ExecContext) -> DynFuture<'a, Result<bool>>;

    /// Recompute the dynamic dependency list before execution. The default
    /// has none.
    fn dependencies(&self, _cx: &mut DepContext) -> Result<()> {
        Ok(())
    }

    /// Stable fingerprint of the builder's own parameters (flags, command).
    /// A change invalidates the outputs even when no source changed.
    fn hash(&self) -> Option<String> {
        None
    }

    /// Shell-equivalent command line, for Makefile export.
    fn command(&self) -> Option<Vec<String>> {
        None
    }

    /// Called once the static sources have finished building, whether they
    /// succeeded or not. Runs under a shared graph borrow; read-only.
    fn report_dependencies(&self, _graph: &Graph, _deps: &[NodeId]) {}

    /// Display name used in diagnostics.
    fn pretty(&self) -> String;
}

/// Handed to [`BuildAction::dependencies`] so it can register dynamic
/// sources.
pub struct DepContext<'a> {
    graph: &'a mut Graph,
    builder: BuilderId,
}

impl<'a> DepContext<'a> {
    pub fn graph(&mut self) -> &mut Graph {
        self.graph
    }

    pub fn add_dynamic(&mut self, category: &str, node: NodeId) {
        self.graph.add_dynsrc(self.builder, category, node);
    }
}

/// Handed to [`BuildAction::execute`]: graph access plus the gateways to
/// blocking work.
pub struct ExecContext {
    engine: Engine,
    builder: BuilderId,
}

impl ExecContext {
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn graph(&self) -> Ref<'_, Graph> {
        self.engine.graph()
    }

    pub fn builder(&self) -> BuilderId {
        self.builder
    }

    /// Paths of the builder's targets, in name order.
    pub fn target_paths(&self) -> Vec<Path> {
        let graph = self.graph();
        graph
            .builder(self.builder)
            .targets
            .iter()
            .map(|&t| graph.node(t).name().clone())
            .collect()
    }

    pub fn output(&self, message: &str) {
        self.engine.output(message);
    }

    /// Register a dynamic source discovered while executing; it is
    /// fingerprinted with this run and rebuilt from the record next run.
    pub fn add_dynamic(&self, category: &str, node: NodeId) {
        self.engine.graph_mut().add_dynsrc(self.builder, category, node);
    }

    /// Run a blocking closure on the blocking pool, holding one jobs
    /// permit for its duration.
    pub async fn background<T, F>(&self, f: F) -> T
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let sem = self.engine.job_sem();
        match sem {
            Some(sem) => {
                let _permit = sem.acquire().await;
                sched::background(f).await
            }
            None => sched::background(f).await,
        }
    }

    /// Run a command, printing its pretty form and capturing stdout to the
    /// builder's cachedir. Returns whether the command succeeded.
    pub async fn cmd(&self, pretty: Option<&str>, argv: &[String]) -> Result<bool> {
        if argv.is_empty() {
            return Err(Error::Invalid("empty command".to_owned()));
        }
        let raw = argv.join(" ");
        self.output(pretty.unwrap_or(&raw));
        let stdout_path = {
            let graph = self.graph();
            graph.cachedir(self.builder)?.join(STDOUT_FILE)?
        };
        let argv = argv.to_vec();
        self.background(move || -> Result<bool> {
            let out = std::fs::File::create(stdout_path.to_string())?;
            let status = std::process::Command::new(&argv[0])
                .args(&argv[1..])
                .stdout(out)
                .status()?;
            Ok(status.success())
        })
        .await
    }
}

struct EngineInner {
    graph: RefCell<Graph>,
    jobs: Cell<usize>,
    silent: Cell<bool>,
    defaults: RefCell<Vec<NodeId>>,
    /// Present while a run is in flight; caps blocking work.
    job_sem: RefCell<Option<Semaphore>>,
}

/// The engine value threading through the whole API: owns the graph and
/// drives builds. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Engine(Rc<EngineInner>);

impl Engine {
    pub fn new() -> Engine {
        Engine::with_root(Path::new("."))
    }

    /// An engine whose relative node names resolve under `root`.
    pub fn with_root(root: Path) -> Engine {
        Engine(Rc::new(EngineInner {
            graph: RefCell::new(Graph::with_root(root)),
            jobs: Cell::new(1),
            silent: Cell::new(false),
            defaults: RefCell::new(Vec::new()),
            job_sem: RefCell::new(None),
        }))
    }

    pub fn graph(&self) -> Ref<'_, Graph> {
        self.0.graph.borrow()
    }

    pub fn graph_mut(&self) -> RefMut<'_, Graph> {
        self.0.graph.borrow_mut()
    }

    pub fn set_jobs(&self, jobs: usize) {
        self.0.jobs.set(jobs.max(1));
    }

    pub fn jobs(&self) -> usize {
        self.0.jobs.get()
    }

    pub fn set_silent(&self, silent: bool) {
        self.0.silent.set(silent);
    }

    pub fn is_silent(&self) -> bool {
        self.0.silent.get()
    }

    pub fn output(&self, message: &str) {
        if !self.0.silent.get() {
            println!("{}", message);
        }
    }

    /// Register a node to build when no nodes are requested explicitly.
    pub fn add_default(&self, node: NodeId) {
        self.0.defaults.borrow_mut().push(node);
    }

    fn job_sem(&self) -> Option<Semaphore> {
        self.0.job_sem.borrow().clone()
    }

    // Description-building conveniences.

    pub fn node(&self, path: impl Into<Path>) -> Result<NodeId> {
        self.graph_mut().node_id(path, None)
    }

    pub fn file(&self, path: impl Into<Path>) -> Result<NodeId> {
        self.graph_mut().file(path)
    }

    pub fn dictionary(
        &self,
        name: &str,
        content: BTreeMap<String, String>,
    ) -> Result<NodeId> {
        self.graph_mut().dictionary(name, content)
    }

    pub fn add_builder(
        &self,
        action: Rc<dyn BuildAction>,
        sources: Vec<NodeId>,
        targets: Vec<NodeId>,
    ) -> Result<BuilderId> {
        self.graph_mut().add_builder(action, sources, targets)
    }

    /// Build the requested nodes, creating a fresh scheduler for the run.
    /// An empty request builds every root of the DAG plus the defaults.
    pub fn build(&self, requested: &[NodeId]) -> Result<()> {
        let scheduler = Scheduler::new(self.jobs())?;
        let engine = self.clone();
        let requested = requested.to_vec();
        scheduler.run(async move { engine.build_requested(requested).await })
    }

    /// The driver proper, for callers already running on a scheduler.
    pub async fn build_requested(&self, mut requested: Vec<NodeId>) -> Result<()> {
        if requested.is_empty() {
            requested = self.graph().roots();
            for &node in self.0.defaults.borrow().iter() {
                if !requested.contains(&node) {
                    requested.push(node);
                }
            }
        }
        self.reset_run_state();
        self.check_cycles(&requested)?;
        *self.0.job_sem.borrow_mut() = Some(Semaphore::new(self.jobs()));
        let mut scope = Scope::new();
        for node in requested {
            let engine = self.clone();
            scope.run(async move { engine.build_node(node).await });
        }
        let result = scope.wait().await;
        *self.0.job_sem.borrow_mut() = None;
        result
    }

    /// A new run starts from scratch: executed flags, stored results,
    /// dynamic discovery and memoized content hashes are per-run state.
    fn reset_run_state(&self) {
        let mut graph = self.graph_mut();
        for id in graph.builders.ids().collect::<Vec<_>>() {
            let builder = graph.builder_mut(id);
            builder.executed = false;
            builder.result = None;
            builder.signal = None;
            builder.dynsrc.clear();
            builder.depfiles.clear();
        }
        for id in graph.node_ids() {
            graph.node_mut(id).invalidate_hash();
        }
    }

    /// Refuse to schedule a graph whose static edges form a cycle; two
    /// builders waiting on each other's signals would deadlock instead.
    fn check_cycles(&self, requested: &[NodeId]) -> Result<()> {
        fn visit(
            graph: &Graph,
            id: NodeId,
            stack: &mut Vec<NodeId>,
            done: &mut HashSet<NodeId>,
        ) -> Result<()> {
            if done.contains(&id) {
                return Ok(());
            }
            if let Some(pos) = stack.iter().position(|&s| s == id) {
                let mut msg = String::new();
                for &s in &stack[pos..] {
                    msg.push_str(&format!("{} -> ", graph.node(s).name()));
                }
                msg.push_str(&graph.node(id).name().to_string());
                return Err(Error::DependencyCycle(msg));
            }
            stack.push(id);
            if let Some(b) = graph.node(id).builder {
                let builder = graph.builder(b);
                let sources: Vec<NodeId> = builder
                    .sources
                    .values()
                    .chain(builder.vsources.values())
                    .copied()
                    .collect();
                for src in sources {
                    visit(graph, src, stack, done)?;
                }
            }
            stack.pop();
            done.insert(id);
            Ok(())
        }

        let graph = self.graph();
        let mut done = HashSet::new();
        for &node in requested {
            let mut stack = Vec::new();
            visit(&graph, node, &mut stack, &mut done)?;
        }
        Ok(())
    }

    /// Build one node: run its builder if it has one, then polish. A
    /// builderless file node that is missing is an error.
    pub async fn build_node(&self, id: NodeId) -> Result<()> {
        let builder = {
            let graph = self.graph();
            let node = graph.node(id);
            debug!("building {}", node.name());
            match node.builder {
                None => {
                    if node.missing() {
                        return Err(Error::NoBuilder(node.name().to_string()));
                    }
                    None
                }
                Some(b) => Some(b),
            }
        };
        if let Some(b) = builder {
            self.run_builder(b).await?;
        }
        let hook = self.graph().node(id).polish.clone();
        if let Some(hook) = hook {
            hook(&self.graph(), id);
        }
        Ok(())
    }

    /// Run a builder at most once per run: the first requester does the
    /// work, everyone else waits on its completion signal and receives the
    /// stored outcome.
    pub async fn run_builder(&self, id: BuilderId) -> Result<()> {
        let wait_on = {
            let mut graph = self.graph_mut();
            let builder = graph.builder_mut(id);
            if builder.executed {
                return builder.result.clone().unwrap_or(Ok(()));
            }
            match &builder.signal {
                Some(signal) => Some(signal.clone()),
                None => {
                    builder.signal = Some(Signal::new());
                    None
                }
            }
        };
        if let Some(signal) = wait_on {
            debug!("already being built, waiting");
            signal.wait().await;
            let graph = self.graph();
            return graph.builder(id).result.clone().unwrap_or(Ok(()));
        }

        let result = self.run_builder_steps(id).await;
        {
            let mut graph = self.graph_mut();
            let builder = graph.builder_mut(id);
            builder.executed = true;
            builder.result = Some(result.clone());
            if let Some(signal) = &builder.signal {
                signal.fire();
            }
        }
        result
    }

    async fn run_builder_steps(&self, id: BuilderId) -> Result<()> {
        let pretty = self.graph().builder(id).pretty();
        debug!("running {}", pretty);

        let cachedir = self.graph().cachedir(id)?;
        cachedir.mkpath()?;

        // The list of static dependencies is now fixed.
        let mut primary = DepFile::new();
        {
            let graph = self.graph();
            for (name, &src) in &graph.builder(id).sources {
                primary.register(name, src);
            }
        }

        // Reload dynamic dependencies recorded by previous runs.
        self.load_dynamic_deps(id, &cachedir)?;

        // Build static dependencies; the report hook runs whether or not
        // they succeeded.
        let static_ids: Vec<NodeId> = {
            let graph = self.graph();
            let builder = graph.builder(id);
            builder
                .sources
                .values()
                .chain(builder.vsources.values())
                .copied()
                .collect()
        };
        let static_result = self.build_sources(&static_ids).await;
        {
            let graph = self.graph();
            let builder = graph.builder(id);
            let action = Rc::clone(&builder.action);
            let deps: Vec<NodeId> = builder.sources.values().copied().collect();
            action.report_dependencies(&graph, &deps);
        }
        static_result?;

        // Build dynamic dependencies; one that cannot be built forces
        // re-execution so the dependency set gets recomputed.
        let mut execute = false;
        let dyn_ids: Vec<NodeId> = self.graph().builder(id).dynsrc.values().copied().collect();
        if let Err(err) = self.build_sources(&dyn_ids).await {
            debug!(
                "{}: execution needed, dynamic dependency couldn't be built: {}",
                pretty, err
            );
            execute = true;
        }

        // The staleness disjunction.
        if !execute {
            let graph = self.graph();
            for &target in &graph.builder(id).targets {
                let node = graph.node(target);
                if node.missing() {
                    debug!(
                        "{}: execution needed, missing target {}",
                        pretty,
                        node.name()
                    );
                    execute = true;
                    break;
                }
            }
        }

        let builder_hash = self.graph().builder(id).action.hash();
        let hash_path = cachedir.join(DEPFILE_BUILDER)?;

        if !execute {
            primary.read(&cachedir.join(DEPFILE_PRIMARY)?)?;
            let graph = self.graph();
            for name in graph.builder(id).sources.keys() {
                if !primary.stored().contains_key(name) {
                    debug!(
                        "{}: execution needed, new dependency appeared: {}",
                        pretty, name
                    );
                    execute = true;
                    break;
                }
            }
        }

        if !execute {
            match &builder_hash {
                Some(hash) => {
                    if hash_path.exists() {
                        let prev = std::fs::read_to_string(hash_path.to_string())?;
                        if *hash != prev {
                            debug!("{}: execution needed, builder fingerprint is outdated", pretty);
                            execute = true;
                        }
                    } else {
                        debug!("{}: execution needed, builder fingerprint is unknown", pretty);
                        execute = true;
                    }
                }
                None => {
                    if hash_path.exists() {
                        debug!(
                            "{}: execution needed, stale builder fingerprint present",
                            pretty
                        );
                        execute = true;
                    }
                }
            }
        }

        if !execute {
            let manifest = cachedir.join(DEPFILE_CATEGORIES)?;
            if manifest.exists() {
                for category in std::fs::read_to_string(manifest.to_string())?.lines() {
                    if !category.is_empty() && !cachedir.join(category)?.exists() {
                        debug!(
                            "{}: execution needed, dependency category {} is gone",
                            pretty, category
                        );
                        execute = true;
                        break;
                    }
                }
            }
        }

        if !execute {
            let mut graph = self.graph_mut();
            if !primary.up_to_date(&mut graph) {
                execute = true;
            } else {
                let mut depfiles = std::mem::take(&mut graph.builder_mut(id).depfiles);
                for depfile in depfiles.values_mut() {
                    if !depfile.up_to_date(&mut graph) {
                        execute = true;
                        break;
                    }
                }
                graph.builder_mut(id).depfiles = depfiles;
            }
        }

        if !execute {
            debug!("{}: everything is up to date", pretty);
            return Ok(());
        }

        // Execute: recompute dynamic dependencies from scratch, build them,
        // run the action, then persist the new fingerprints.
        debug!("executing {}", pretty);
        {
            let mut graph = self.graph_mut();
            let builder = graph.builder_mut(id);
            builder.dynsrc.clear();
            builder.depfiles.clear();
            let action = Rc::clone(&builder.action);
            let mut cx = DepContext {
                graph: &mut *graph,
                builder: id,
            };
            action.dependencies(&mut cx)?;
        }
        let fresh: Vec<NodeId> = self.graph().builder(id).dynsrc.values().copied().collect();
        for node in fresh {
            let engine = self.clone();
            let name = self.graph().node(node).name().to_string();
            sched::spawn(name, async move { engine.build_node(node).await })
                .result()
                .await?;
        }

        // Create the parent directories of the outputs.
        {
            let graph = self.graph();
            for &target in &graph.builder(id).targets {
                let node = graph.node(target);
                if !node.kind.is_virtual() {
                    let dir = node.name().dirname()?;
                    if !dir.empty() {
                        dir.mkpath()?;
                    }
                }
            }
        }

        let action = Rc::clone(&self.graph().builder(id).action);
        let cx = ExecContext {
            engine: self.clone(),
            builder: id,
        };
        if !action.execute(&cx).await? {
            return Err(Error::BuilderFailed(pretty));
        }

        // Every non-virtual target must now exist; their hashes are
        // recomputed on demand.
        {
            let mut graph = self.graph_mut();
            let targets = graph.builder(id).targets.clone();
            for target in targets {
                let node = graph.node_mut(target);
                if !node.kind.is_virtual() && node.missing() {
                    return Err(Error::MissingOutput {
                        target: node.name().to_string(),
                        builder: pretty,
                    });
                }
                node.invalidate_hash();
            }
        }

        self.persist(id, &cachedir, &primary, builder_hash)?;
        Ok(())
    }

    /// List the cachedir for category files written by previous runs and
    /// re-register their nodes as dynamic sources, materializing unknown
    /// paths through the category's deps handler.
    fn load_dynamic_deps(&self, id: BuilderId, cachedir: &Path) -> Result<()> {
        let mut categories = Vec::new();
        for entry in std::fs::read_dir(cachedir.to_string())? {
            let name = match entry?.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            if RESERVED.contains(&name.as_str()) {
                continue;
            }
            categories.push(name);
        }
        categories.sort();
        for category in categories {
            debug!("considering dependencies file {}", category);
            let mut depfile = DepFile::new();
            depfile.read(&cachedir.join(category.as_str())?)?;
            let records: Vec<(String, String)> = depfile
                .stored()
                .iter()
                .map(|(name, (_, tag))| (name.clone(), tag.clone()))
                .collect();
            self.graph_mut()
                .builder_mut(id)
                .depfiles
                .insert(category.clone(), depfile);
            for (name, tag) in records {
                let known = {
                    let graph = self.graph();
                    let builder = graph.builder(id);
                    if builder.sources.contains_key(&name) || builder.dynsrc.contains_key(&name)
                    {
                        continue;
                    }
                    graph.lookup(name.as_str())
                };
                let node = match known {
                    Some(node) => node,
                    None => {
                        debug!("{} is unknown, calling handler", name);
                        let handler = self
                            .graph()
                            .deps_handler(&category)
                            .ok_or_else(|| Error::NoDepsHandler(category.clone()))?;
                        if !self.graph().has_type(&tag) {
                            return Err(Error::UnknownType(tag));
                        }
                        let path = Path::new(&name);
                        handler(&mut *self.graph_mut(), &path, &tag)?
                    }
                };
                self.graph_mut().add_dynsrc(id, &category, node);
            }
        }
        Ok(())
    }

    /// Spawn a build task per source that is not trivially up to date and
    /// wait for all of them; the first error is returned after the whole
    /// batch settles.
    async fn build_sources(&self, ids: &[NodeId]) -> Result<()> {
        let mut tasks = Vec::new();
        {
            let graph = self.graph();
            for &src in ids {
                if can_skip(&graph, src) {
                    continue;
                }
                let engine = self.clone();
                let name = graph.node(src).name().to_string();
                tasks.push(sched::spawn(name, async move {
                    engine.build_node(src).await
                }));
            }
        }
        let mut first = None;
        for task in tasks {
            if let Err(err) = task.result().await {
                if first.is_none() {
                    first = Some(err);
                }
            }
        }
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Overwrite the dependency fingerprints after a successful execution.
    fn persist(
        &self,
        id: BuilderId,
        cachedir: &Path,
        primary: &DepFile,
        builder_hash: Option<String>,
    ) -> Result<()> {
        let mut graph = self.graph_mut();
        primary.write(&cachedir.join(DEPFILE_PRIMARY)?, &mut graph)?;

        let hash_path = cachedir.join(DEPFILE_BUILDER)?;
        match builder_hash {
            Some(hash) => std::fs::write(hash_path.to_string(), hash)?,
            None => hash_path.remove(false)?,
        }

        let depfiles = std::mem::take(&mut graph.builder_mut(id).depfiles);
        for (category, depfile) in &depfiles {
            depfile.write(&cachedir.join(category.as_str())?, &mut graph)?;
        }

        // Prune categories the last run produced but this one did not, and
        // record the active set.
        let manifest_path = cachedir.join(DEPFILE_CATEGORIES)?;
        if manifest_path.exists() {
            for category in std::fs::read_to_string(manifest_path.to_string())?.lines() {
                if !category.is_empty() && !depfiles.contains_key(category) {
                    cachedir.join(category)?.remove(false)?;
                }
            }
        }
        if depfiles.is_empty() {
            manifest_path.remove(false)?;
        } else {
            let mut manifest = String::new();
            for category in depfiles.keys() {
                manifest.push_str(category);
                manifest.push('\n');
            }
            std::fs::write(manifest_path.to_string(), manifest)?;
        }
        graph.builder_mut(id).depfiles = depfiles;
        Ok(())
    }

    /// Recursively delete generated files reachable from the given nodes.
    pub fn clean(&self, requested: &[NodeId]) -> Result<()> {
        let mut visited = HashSet::new();
        for &node in requested {
            self.clean_node(node, &mut visited)?;
        }
        Ok(())
    }

    fn clean_node(&self, id: NodeId, visited: &mut HashSet<NodeId>) -> Result<()> {
        if !visited.insert(id) {
            return Ok(());
        }
        let (builder, generated, name) = {
            let graph = self.graph();
            let node = graph.node(id);
            (
                node.builder,
                node.builder.is_some() && !node.kind.is_virtual(),
                node.name().clone(),
            )
        };
        if let Some(b) = builder {
            let sources: Vec<NodeId> = {
                let graph = self.graph();
                let builder = graph.builder(b);
                builder
                    .sources
                    .values()
                    .chain(builder.vsources.values())
                    .copied()
                    .collect()
            };
            for src in sources {
                self.clean_node(src, visited)?;
            }
        }
        if generated && name.exists() {
            self.output(&format!("Deleting {}", name));
            name.remove(false)?;
        }
        Ok(())
    }
}

impl Default for Engine {
    fn default() -> Self {
        Engine::new()
    }
}

fn can_skip(graph: &Graph, id: NodeId) -> bool {
    let node = graph.node(id);
    match node.builder {
        // A leaf is up to date as long as it is present; a missing leaf
        // must go through build_node so it reports NoBuilder.
        None => !node.missing(),
        Some(b) => {
            let builder = graph.builder(b);
            builder.executed && matches!(builder.result, Some(Ok(())))
        }
    }
}

//! Command-line front end: option parsing, configure overrides, and mode
//! dispatch for build descriptions.
//!
//! A build description is a program: its `main` hands a configure closure
//! to [`run`], which parses the command line, constructs the engine,
//! configures the description and performs the requested action. Exit code
//! is 0 on success and 1 on any error or interrupt.

use std::collections::{BTreeMap, HashSet};

use anyhow::Context;
use getopts::Options;

use crate::densemap::Index;
use crate::error::Error;
use crate::graph::{BuilderId, Graph, NodeId};
use crate::path::Path;
use crate::sched::Scheduler;
use crate::work::Engine;

/// Option names that are never configure parameters.
const KNOWN_OPTIONS: [&str; 6] = ["jobs", "build", "clean", "dot", "makefile", "help"];

/// Parse `std::env::args`, build and configure an engine rooted at `root`,
/// and run the requested mode. Does not return.
pub fn run<F>(root: impl Into<Path>, configure: F) -> !
where
    F: FnOnce(&Engine, &BTreeMap<String, String>) -> anyhow::Result<()>,
{
    let args: Vec<String> = std::env::args().collect();
    let prog = args
        .first()
        .cloned()
        .unwrap_or_else(|| "drover".to_owned());
    let rest = args.get(1..).unwrap_or(&[]);
    match run_args(&prog, rest, root.into(), configure) {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            eprintln!("{}: *** {:#}", prog, err);
            std::process::exit(1);
        }
    }
}

/// The testable body of [`run`].
pub fn run_args<F>(
    prog: &str,
    args: &[String],
    root: Path,
    configure: F,
) -> anyhow::Result<()>
where
    F: FnOnce(&Engine, &BTreeMap<String, String>) -> anyhow::Result<()>,
{
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .try_init()
        .ok();

    let (params, args) = split_params(args);

    let mut opts = Options::new();
    opts.optopt("j", "jobs", "number of concurrent jobs", "N");
    opts.optflag("", "build", "build NODES, or every root if none given");
    opts.optflag(
        "",
        "clean",
        "recursively delete generated ancestors of NODES",
    );
    opts.optflag("", "dot", "emit a dot dependency graph on stdout");
    opts.optflag("", "makefile", "emit a Makefile equivalent on stdout");
    opts.optflag("h", "help", "print this usage and exit");
    let matches = opts.parse(&args)?;

    if matches.opt_present("help") {
        let brief = format!(
            "Usage: {} [OPTIONS] [--NAME=VALUE ...] [ACTION] [NODES...]",
            prog
        );
        print!("{}", opts.usage(&brief));
        return Ok(());
    }

    let engine = Engine::with_root(root);
    if let Some(jobs) = matches.opt_str("jobs") {
        let jobs: usize = jobs
            .parse()
            .with_context(|| format!("invalid jobs count: {}", jobs))?;
        engine.set_jobs(jobs);
    }

    configure(&engine, &params)?;

    let mut nodes = Vec::new();
    for name in &matches.free {
        let id = engine
            .graph()
            .lookup(name.as_str())
            .ok_or_else(|| Error::UnknownNode(name.clone()))?;
        nodes.push(id);
    }

    if matches.opt_present("clean") {
        let nodes = all_if_none(&engine, nodes);
        engine.clean(&nodes)?;
    } else if matches.opt_present("dot") {
        let nodes = all_if_none(&engine, nodes);
        dot(&engine, &nodes);
    } else if matches.opt_present("makefile") {
        makefile(&engine, &nodes);
    } else {
        // The default mode; interrupt exits through the error path.
        let scheduler = Scheduler::new(engine.jobs())?;
        let build = engine.clone();
        scheduler.run(async move {
            tokio::select! {
                result = build.build_requested(nodes) => result,
                _ = tokio::signal::ctrl_c() => Err(Error::Interrupted),
            }
        })?;
    }
    Ok(())
}

/// Split `--name=value` configure overrides off the argument list.
fn split_params(args: &[String]) -> (BTreeMap<String, String>, Vec<String>) {
    let mut params = BTreeMap::new();
    let mut rest = Vec::new();
    for arg in args {
        if let Some(body) = arg.strip_prefix("--") {
            if let Some((name, value)) = body.split_once('=') {
                if !KNOWN_OPTIONS.contains(&name) {
                    params.insert(name.to_owned(), value.to_owned());
                    continue;
                }
            }
        }
        rest.push(arg.clone());
    }
    (params, rest)
}

fn all_if_none(engine: &Engine, nodes: Vec<NodeId>) -> Vec<NodeId> {
    if nodes.is_empty() {
        engine.graph().node_ids()
    } else {
        nodes
    }
}

/// Emit a dot digraph of the build graph reachable from `nodes`.
fn dot(engine: &Engine, nodes: &[NodeId]) {
    let graph = engine.graph();
    println!("digraph");
    println!("{{");
    let mut node_marks = HashSet::new();
    let mut builder_marks = HashSet::new();
    for &node in nodes {
        dot_node(&graph, node, &mut node_marks, &mut builder_marks);
    }
    println!("}}");
}

fn dot_node(
    graph: &Graph,
    id: NodeId,
    node_marks: &mut HashSet<NodeId>,
    builder_marks: &mut HashSet<BuilderId>,
) {
    if !node_marks.insert(id) {
        return;
    }
    println!("  node_{} [label=\"{}\"]", id.index(), graph.node(id).name());
    if let Some(builder) = graph.node(id).builder {
        dot_builder(graph, builder, node_marks, builder_marks);
        println!("  builder_{} -> node_{}", builder.index(), id.index());
    }
}

fn dot_builder(
    graph: &Graph,
    id: BuilderId,
    node_marks: &mut HashSet<NodeId>,
    builder_marks: &mut HashSet<BuilderId>,
) {
    if !builder_marks.insert(id) {
        return;
    }
    let builder = graph.builder(id);
    println!(
        "  builder_{} [label=\"{}\", shape=rect]",
        id.index(),
        builder.pretty()
    );
    let sources: Vec<NodeId> = builder
        .sources
        .values()
        .chain(builder.dynsrc.values())
        .copied()
        .collect();
    for source in sources {
        dot_node(graph, source, node_marks, builder_marks);
        println!("  node_{} -> builder_{}", source.index(), id.index());
    }
}

/// Emit a Makefile equivalent of the build graph on stdout.
fn makefile(engine: &Engine, nodes: &[NodeId]) {
    let graph = engine.graph();
    let roots = graph.roots();
    let all: Vec<String> = roots.iter().map(|&id| makefile_name(&graph, id)).collect();
    println!("all: {}\n", all.join(" "));
    let mut marks = HashSet::new();
    let list = if nodes.is_empty() {
        roots
    } else {
        nodes.to_vec()
    };
    for node in list {
        makefile_node(&graph, node, &mut marks);
    }
}

fn makefile_name(graph: &Graph, id: NodeId) -> String {
    let node = graph.node(id);
    if node.kind.is_virtual() {
        let mut name = node.name().clone();
        name.virtual_ = false;
        name.to_string()
    } else {
        node.name().to_string()
    }
}

fn makefile_node(graph: &Graph, id: NodeId, marks: &mut HashSet<NodeId>) {
    let Some(builder) = graph.node(id).builder else {
        return;
    };
    if !marks.insert(id) {
        return;
    }
    let b = graph.builder(builder);
    let deps: Vec<NodeId> = b
        .sources
        .values()
        .chain(b.dynsrc.values())
        .copied()
        .collect();
    let dep_names: Vec<String> = deps.iter().map(|&d| makefile_name(graph, d)).collect();
    println!("{}: {}", makefile_name(graph, id), dep_names.join(" "));
    if let Some(command) = b.action.command() {
        if !graph.node(id).kind.is_virtual() {
            if let Ok(dir) = graph.node(id).name().dirname() {
                if !dir.empty() {
                    println!("\t@mkdir -p {}", dir);
                }
            }
        }
        let quoted: Vec<String> = command.iter().map(|arg| quote(arg)).collect();
        println!("\t{}", quoted.join(" "));
    }
    println!();
    for dep in deps {
        makefile_node(graph, dep, marks);
    }
}

fn quote(arg: &str) -> String {
    let escaped = arg.replace('$', "$$");
    if escaped.chars().any(|c| c.is_whitespace()) {
        format!("'{}'", escaped)
    } else {
        escaped
    }
}

//! Concrete builders: touch, copy, shell commands, and dictionary
//! expansion.

use std::collections::BTreeMap;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::graph::{BuilderId, NodeId, NodeKind};
use crate::hasher::StableHasher;
use crate::path::Path;
use crate::sched::DynFuture;
use crate::work::{BuildAction, Engine, ExecContext};

/// Creates its targets as empty files.
pub struct TouchBuilder;

impl TouchBuilder {
    pub fn new(engine: &Engine, targets: Vec<NodeId>) -> Result<BuilderId> {
        engine.add_builder(Rc::new(TouchBuilder), vec![], targets)
    }
}

impl BuildAction for TouchBuilder {
    fn execute<'a>(&'a self, cx: &'a ExecContext) -> DynFuture<'a, Result<bool>> {
        Box::pin(async move {
            let paths = cx.target_paths();
            let names: Vec<String> = paths.iter().map(|p| p.to_string()).collect();
            cx.output(&format!("Touch {}", names.join(", ")));
            for path in paths {
                path.touch()?;
            }
            Ok(true)
        })
    }

    fn pretty(&self) -> String {
        "TouchBuilder".to_owned()
    }
}

/// Does nothing; useful to create an ordering edge between nodes.
pub struct EmptyBuilder;

impl EmptyBuilder {
    pub fn new(engine: &Engine, sources: Vec<NodeId>, targets: Vec<NodeId>) -> Result<BuilderId> {
        engine.add_builder(Rc::new(EmptyBuilder), sources, targets)
    }
}

impl BuildAction for EmptyBuilder {
    fn execute<'a>(&'a self, _cx: &'a ExecContext) -> DynFuture<'a, Result<bool>> {
        Box::pin(async { Ok(true) })
    }

    fn pretty(&self) -> String {
        "EmptyBuilder".to_owned()
    }
}

/// Copies one file to a destination path.
pub struct Copy {
    source: Path,
    target: Path,
}

impl Copy {
    /// Register a copy of `source` at `to` and return the target node.
    pub fn new(engine: &Engine, source: NodeId, to: impl Into<Path>) -> Result<NodeId> {
        let target = engine.file(to)?;
        let action = {
            let graph = engine.graph();
            Copy {
                source: graph.node(source).name().clone(),
                target: graph.node(target).name().clone(),
            }
        };
        engine.add_builder(Rc::new(action), vec![source], vec![target])?;
        Ok(target)
    }
}

impl BuildAction for Copy {
    fn execute<'a>(&'a self, cx: &'a ExecContext) -> DynFuture<'a, Result<bool>> {
        Box::pin(async move {
            cx.output(&format!("Copy {}", self.target));
            let source = self.source.to_string();
            let target = self.target.to_string();
            cx.background(move || -> Result<bool> {
                std::fs::copy(&source, &target)?;
                Ok(true)
            })
            .await
        })
    }

    fn command(&self) -> Option<Vec<String>> {
        Some(vec![
            "cp".to_owned(),
            self.source.to_string(),
            self.target.to_string(),
        ])
    }

    fn pretty(&self) -> String {
        format!("Copy({})", self.target)
    }
}

/// Copy a list of nodes under `to`, optionally stripping a leading prefix
/// from each source name first. Returns the target nodes.
pub fn copy(
    engine: &Engine,
    sources: &[NodeId],
    to: impl Into<Path>,
    strip_prefix: Option<&Path>,
) -> Result<Vec<NodeId>> {
    let to = to.into();
    let mut targets = Vec::new();
    for &source in sources {
        let mut name = engine.graph().node(source).name().clone();
        if let Some(prefix) = strip_prefix {
            name.strip_prefix(prefix);
        }
        let dest = to.join(name)?;
        targets.push(Copy::new(engine, source, dest)?);
    }
    Ok(targets)
}

/// Runs an argv; changing the command invalidates the outputs.
pub struct ShellCommand {
    command: Vec<String>,
    pretty: Option<String>,
}

impl ShellCommand {
    pub fn new(
        engine: &Engine,
        sources: Vec<NodeId>,
        targets: Vec<NodeId>,
        command: Vec<String>,
        pretty: Option<String>,
    ) -> Result<BuilderId> {
        if command.is_empty() {
            return Err(Error::Invalid("empty command".to_owned()));
        }
        let action = ShellCommand { command, pretty };
        engine.add_builder(Rc::new(action), sources, targets)
    }
}

impl BuildAction for ShellCommand {
    fn execute<'a>(&'a self, cx: &'a ExecContext) -> DynFuture<'a, Result<bool>> {
        Box::pin(async move { cx.cmd(self.pretty.as_deref(), &self.command).await })
    }

    fn hash(&self) -> Option<String> {
        let mut hasher = StableHasher::new();
        for arg in &self.command {
            hasher.field(arg);
        }
        Some(hasher.finish())
    }

    fn command(&self) -> Option<Vec<String>> {
        Some(self.command.clone())
    }

    fn pretty(&self) -> String {
        format!("ShellCommand({})", self.command[0])
    }
}

/// Expand `@key@` references from a set of dictionaries into a target
/// file. The expansion always ends with a newline. An unknown key is fatal
/// unless `missing_fatal` is turned off, in which case the reference is
/// left verbatim.
struct ExpanderCore {
    dicts: Vec<NodeId>,
    target: Path,
    missing_fatal: bool,
}

impl ExpanderCore {
    async fn expand(&self, cx: &ExecContext, content: &str) -> Result<bool> {
        cx.output(&format!("Expand {}", self.target));
        let mut vars: BTreeMap<String, String> = BTreeMap::new();
        {
            let graph = cx.graph();
            for &dict in &self.dicts {
                match &graph.node(dict).kind {
                    NodeKind::Dictionary(content) => {
                        vars.extend(content.iter().map(|(k, v)| (k.clone(), v.clone())))
                    }
                    _ => {
                        return Err(Error::Invalid(format!(
                            "{} is not a dictionary",
                            graph.node(dict).name()
                        )))
                    }
                }
            }
        }
        match expand_tokens(content, &vars, self.missing_fatal) {
            Ok(expanded) => {
                std::fs::write(self.target.to_string(), format!("{}\n", expanded))?;
                Ok(true)
            }
            Err(key) => {
                cx.output(&format!("Missing expansion: {}", key));
                Ok(false)
            }
        }
    }
}

fn expand_tokens(
    content: &str,
    vars: &BTreeMap<String, String>,
    missing_fatal: bool,
) -> std::result::Result<String, String> {
    fn is_key_char(c: char) -> bool {
        c.is_ascii_alphanumeric() || c == '_' || c == '-'
    }

    let mut out = String::new();
    let mut rest = content;
    while let Some(at) = rest.find('@') {
        out.push_str(&rest[..at]);
        let after = &rest[at + 1..];
        let key_len = after.find(|c| !is_key_char(c)).unwrap_or(after.len());
        if key_len > 0 && after[key_len..].starts_with('@') {
            let key = &after[..key_len];
            match vars.get(key) {
                Some(value) => out.push_str(value),
                None if missing_fatal => return Err(key.to_owned()),
                None => {
                    out.push('@');
                    out.push_str(key);
                    out.push('@');
                }
            }
            rest = &after[key_len + 1..];
        } else {
            out.push('@');
            rest = after;
        }
    }
    out.push_str(rest);
    Ok(out)
}

/// An expander with static content.
pub struct TextExpander {
    text: String,
    core: ExpanderCore,
}

impl TextExpander {
    pub fn new(
        engine: &Engine,
        text: &str,
        dicts: Vec<NodeId>,
        target: NodeId,
        missing_fatal: bool,
    ) -> Result<BuilderId> {
        let action = TextExpander {
            text: text.to_owned(),
            core: ExpanderCore {
                dicts: dicts.clone(),
                target: engine.graph().node(target).name().clone(),
                missing_fatal,
            },
        };
        engine.add_builder(Rc::new(action), dicts, vec![target])
    }
}

impl BuildAction for TextExpander {
    fn execute<'a>(&'a self, cx: &'a ExecContext) -> DynFuture<'a, Result<bool>> {
        Box::pin(async move { self.core.expand(cx, &self.text).await })
    }

    fn pretty(&self) -> String {
        format!("TextExpander({})", self.core.target)
    }
}

/// An expander that takes its content from a source file.
pub struct FileExpander {
    source: Path,
    core: ExpanderCore,
}

impl FileExpander {
    pub fn new(
        engine: &Engine,
        source: NodeId,
        dicts: Vec<NodeId>,
        target: NodeId,
        missing_fatal: bool,
    ) -> Result<BuilderId> {
        let action = {
            let graph = engine.graph();
            FileExpander {
                source: graph.node(source).name().clone(),
                core: ExpanderCore {
                    dicts: dicts.clone(),
                    target: graph.node(target).name().clone(),
                    missing_fatal,
                },
            }
        };
        let mut sources = dicts;
        sources.push(source);
        engine.add_builder(Rc::new(action), sources, vec![target])
    }
}

impl BuildAction for FileExpander {
    fn execute<'a>(&'a self, cx: &'a ExecContext) -> DynFuture<'a, Result<bool>> {
        Box::pin(async move {
            let content = std::fs::read_to_string(self.source.to_string())?;
            self.core.expand(cx, &content).await
        })
    }

    fn pretty(&self) -> String {
        format!("FileExpander({})", self.core.target)
    }
}

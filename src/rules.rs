//! Virtual aggregate nodes: rules that bounce to a list of other nodes,
//! and test suites that tally how their members fared.

use std::cell::Cell;
use std::rc::Rc;

use crate::error::Result;
use crate::graph::{BuilderId, Graph, NodeId};
use crate::sched::DynFuture;
use crate::work::{BuildAction, Engine, ExecContext};

/// A virtual node whose builder takes the aggregate list as static sources
/// and does nothing when executed; building the rule builds its members.
pub struct Rule {
    node: NodeId,
    builder: BuilderId,
}

impl Rule {
    pub fn new(engine: &Engine, name: &str, nodes: Vec<NodeId>) -> Result<Rule> {
        let node = engine.graph_mut().rule_node(name)?;
        let action = RuleAction {
            name: name.to_owned(),
        };
        let builder = engine
            .graph_mut()
            .add_builder(Rc::new(action), nodes, vec![node])?;
        Ok(Rule { node, builder })
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn builder(&self) -> BuilderId {
        self.builder
    }

    /// Add a node to build when the rule is built.
    pub fn add(&self, engine: &Engine, node: NodeId) -> Result<()> {
        engine.graph_mut().add_source(self.builder, node)
    }
}

struct RuleAction {
    name: String,
}

impl BuildAction for RuleAction {
    fn execute<'a>(&'a self, _cx: &'a ExecContext) -> DynFuture<'a, Result<bool>> {
        Box::pin(async { Ok(true) })
    }

    fn pretty(&self) -> String {
        format!("RuleBuilder({})", self.name)
    }
}

/// A rule that counts its members' outcomes once they have been built and
/// prints a summary line.
pub struct TestSuite {
    node: NodeId,
    builder: BuilderId,
    counters: Rc<SuiteCounters>,
}

struct SuiteCounters {
    name: String,
    silent: bool,
    success: Cell<usize>,
    failures: Cell<usize>,
}

impl TestSuite {
    pub fn new(engine: &Engine, name: &str, nodes: Vec<NodeId>) -> Result<TestSuite> {
        let node = engine.graph_mut().rule_node(name)?;
        let counters = Rc::new(SuiteCounters {
            name: name.to_owned(),
            silent: engine.is_silent(),
            success: Cell::new(0),
            failures: Cell::new(0),
        });
        let action = TestSuiteAction {
            counters: Rc::clone(&counters),
        };
        let builder = engine
            .graph_mut()
            .add_builder(Rc::new(action), nodes, vec![node])?;
        Ok(TestSuite {
            node,
            builder,
            counters,
        })
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn add(&self, engine: &Engine, node: NodeId) -> Result<()> {
        engine.graph_mut().add_source(self.builder, node)
    }

    pub fn success(&self) -> usize {
        self.counters.success.get()
    }

    pub fn failures(&self) -> usize {
        self.counters.failures.get()
    }

    pub fn total(&self) -> usize {
        self.success() + self.failures()
    }
}

struct TestSuiteAction {
    counters: Rc<SuiteCounters>,
}

impl BuildAction for TestSuiteAction {
    fn execute<'a>(&'a self, _cx: &'a ExecContext) -> DynFuture<'a, Result<bool>> {
        Box::pin(async { Ok(true) })
    }

    fn report_dependencies(&self, graph: &Graph, deps: &[NodeId]) {
        for &dep in deps {
            match graph.build_status(dep) {
                // A leaf with no builder counts as passing if it is there.
                Some(true) | None => self.counters.success.set(self.counters.success.get() + 1),
                Some(false) => self.counters.failures.set(self.counters.failures.get() + 1),
            }
        }
        let success = self.counters.success.get();
        let total = success + self.counters.failures.get();
        if !self.counters.silent {
            println!(
                "Test suite {}: {} / {} tests passed.",
                self.counters.name, success, total
            );
        }
    }

    fn pretty(&self) -> String {
        format!("TestSuite({})", self.counters.name)
    }
}

//! Turns "applied set + targets" into an ordered list of steps.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use tracing::debug;

use crate::error::Result;
use crate::graph::MigrationGraph;
use crate::key::MigrationKey;
use crate::ledger::AppliedMap;

/// What the caller wants the ledger to look like for one component.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// Unapply every migration of the component.
    Zero(String),
    /// Bring the component exactly to this migration.
    Node(MigrationKey),
}

impl Target {
    pub fn component(&self) -> &str {
        match self {
            Target::Zero(component) => component,
            Target::Node(key) => &key.component,
        }
    }
}

impl From<MigrationKey> for Target {
    fn from(key: MigrationKey) -> Self {
        Target::Node(key)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Zero(component) => write!(f, "{}.zero", component),
            Target::Node(key) => key.fmt(f),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Apply,
    Unapply,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlanStep {
    pub key: MigrationKey,
    pub direction: Direction,
}

impl PlanStep {
    pub fn apply(key: MigrationKey) -> Self {
        Self {
            key,
            direction: Direction::Apply,
        }
    }

    pub fn unapply(key: MigrationKey) -> Self {
        Self {
            key,
            direction: Direction::Unapply,
        }
    }

    pub fn is_backwards(&self) -> bool {
        self.direction == Direction::Unapply
    }
}

impl fmt::Display for PlanStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.direction {
            Direction::Apply => write!(f, "apply {}", self.key),
            Direction::Unapply => write!(f, "unapply {}", self.key),
        }
    }
}

pub type Plan = Vec<PlanStep>;

/// Accumulates steps, keeping only the first occurrence of each key and
/// tracking which migrations the plan has already (un)applied.
struct PlanBuilder {
    steps: Plan,
    planned: HashSet<MigrationKey>,
    applied: BTreeSet<MigrationKey>,
}

impl PlanBuilder {
    fn unapply_if_applied(&mut self, key: MigrationKey) {
        if self.applied.remove(&key) && self.planned.insert(key.clone()) {
            self.steps.push(PlanStep::unapply(key));
        }
    }

    fn apply_if_unapplied(&mut self, key: MigrationKey) {
        if !self.applied.contains(&key) && self.planned.insert(key.clone()) {
            self.applied.insert(key.clone());
            self.steps.push(PlanStep::apply(key));
        }
    }
}

/// Compute the steps that move `applied` to `targets`.
///
/// * `Zero(c)`: every applied migration of `c` and its applied dependents,
///   walked backwards from each of `c`'s roots.
/// * An applied `Node`: its same-component children and their dependents
///   are unapplied; the target itself stays.
/// * An unapplied `Node`: its unapplied ancestors and itself, forwards.
pub fn plan<S>(graph: &MigrationGraph<S>, applied: &AppliedMap, targets: &[Target]) -> Result<Plan> {
    let mut builder = PlanBuilder {
        steps: Vec::new(),
        planned: HashSet::new(),
        applied: applied.keys().cloned().collect(),
    };

    for target in targets {
        match target {
            Target::Zero(component) => {
                for root in graph.root_nodes(Some(component)) {
                    for key in graph.backwards_plan(&root)? {
                        builder.unapply_if_applied(key);
                    }
                }
            }
            Target::Node(key) if builder.applied.contains(key) => {
                let next_in_component: Vec<MigrationKey> = graph
                    .children(key)
                    .into_iter()
                    .filter(|child| child.component == key.component)
                    .collect();
                for child in next_in_component {
                    for descendant in graph.backwards_plan(&child)? {
                        builder.unapply_if_applied(descendant);
                    }
                }
            }
            Target::Node(key) => {
                for ancestor in graph.forwards_plan(key)? {
                    builder.apply_if_unapplied(ancestor);
                }
            }
        }
    }

    debug!(targets = targets.len(), steps = builder.steps.len(), "computed migration plan");
    Ok(builder.steps)
}

/// One target per component leaf: "migrate everything".
pub fn leaf_targets<S>(graph: &MigrationGraph<S>, component: Option<&str>) -> Vec<Target> {
    graph
        .leaf_nodes(component)
        .into_iter()
        .map(Target::Node)
        .collect()
}

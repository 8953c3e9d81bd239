//! Pushdown planner.
//!
//! Decides, per group, which person-property conditions can be evaluated
//! inline with the behavioral scans instead of through a separate join over
//! the full person set. A person condition is pushed down when every group
//! on its path from the root is an AND group: such a condition is required
//! of every matching person, so filtering each scan by it cannot change the
//! result. Anything beneath an OR loses eligibility.
//!
//! The pass does not touch the tree. It produces [`PushdownAnnotations`], a
//! side table keyed by [`NodePath`].

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::ast::{FilterNode, GroupOperator, NodePath, PersonPropertyCondition};

/// A person condition evaluated inline with every scan.
#[derive(Debug, Clone, PartialEq)]
pub struct PushedCondition {
    pub path: NodePath,
    pub condition: PersonPropertyCondition,
}

/// Pushdown metadata for one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupAnnotation {
    pub operator: GroupOperator,
    /// The group and all its ancestors are AND groups.
    pub eligible: bool,
    /// Direct person-condition children evaluated inline.
    pub pushed: Vec<NodePath>,
    /// Direct person-condition children evaluated against the full person set.
    pub joined: Vec<NodePath>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushdownAnnotations {
    groups: BTreeMap<NodePath, GroupAnnotation>,
    pushed: BTreeSet<NodePath>,
}

impl PushdownAnnotations {
    pub fn group(&self, path: &NodePath) -> Option<&GroupAnnotation> {
        self.groups.get(path)
    }

    pub fn is_pushed(&self, path: &NodePath) -> bool {
        self.pushed.contains(path)
    }

    pub fn pushed_count(&self) -> usize {
        self.pushed.len()
    }

    /// Pushed conditions in tree order.
    pub fn pushed_conditions(&self, tree: &FilterNode) -> Vec<PushedCondition> {
        let mut out = Vec::new();
        tree.for_each_leaf(&NodePath::root(), &mut |path, leaf| {
            if let FilterNode::Person(condition) = leaf {
                if self.is_pushed(path) {
                    out.push(PushedCondition {
                        path: path.clone(),
                        condition: condition.clone(),
                    });
                }
            }
        });
        out
    }
}

pub struct PushdownPlanner {
    enabled: bool,
}

impl Default for PushdownPlanner {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl PushdownPlanner {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn annotate(&self, tree: &FilterNode) -> PushdownAnnotations {
        let mut annotations = PushdownAnnotations::default();
        // Without a behavioral scan there is nothing to push into.
        let inherited = self.enabled && tree.has_behavioral();
        visit(tree, &NodePath::root(), inherited, &mut annotations);
        debug!(pushed = annotations.pushed.len(), "pushdown planned");
        annotations
    }
}

fn visit(node: &FilterNode, path: &NodePath, inherited: bool, out: &mut PushdownAnnotations) {
    let FilterNode::Group { operator, children } = node else {
        return;
    };

    let eligible = inherited && *operator == GroupOperator::And;
    let mut annotation = GroupAnnotation {
        operator: *operator,
        eligible,
        pushed: Vec::new(),
        joined: Vec::new(),
    };

    for (index, child) in children.iter().enumerate() {
        let child_path = path.child(index);
        match child {
            FilterNode::Person(condition) => {
                if eligible {
                    debug!(path = %child_path, key = %condition.key, "person condition pushed down");
                    out.pushed.insert(child_path.clone());
                    annotation.pushed.push(child_path);
                } else {
                    annotation.joined.push(child_path);
                }
            }
            FilterNode::Group { .. } => visit(child, &child_path, eligible, out),
            FilterNode::Behavioral(_) => {}
        }
    }

    out.groups.insert(path.clone(), annotation);
}

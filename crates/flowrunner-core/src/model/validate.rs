//! Graph invariant checks run before a workflow is compiled or executed.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use super::{EdgeTag, SerializedWorkflow, kinds};
use crate::error::ErrorKind;

/// One validation finding, addressed by a JSON-pointer-ish path into the
/// serialized workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub path: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl ValidationIssue {
    fn invalid(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: ErrorKind::InvalidWorkflow,
            message: message.into(),
        }
    }
}

/// Check every structural invariant of the graph. Returns all findings rather
/// than stopping at the first.
pub fn check_graph(wf: &SerializedWorkflow) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if wf.version != super::FORMAT_VERSION {
        issues.push(ValidationIssue::invalid(
            "version",
            format!(
                "unsupported format version {:?}, expected {:?}",
                wf.version,
                super::FORMAT_VERSION
            ),
        ));
    }

    let mut ids: HashSet<&str> = HashSet::new();
    for (i, block) in wf.blocks.iter().enumerate() {
        if !ids.insert(block.id.as_str()) {
            issues.push(ValidationIssue::invalid(
                format!("blocks[{i}].id"),
                format!("duplicate block id {:?}", block.id),
            ));
        }
    }

    check_starter(wf, &mut issues);
    check_connections(wf, &ids, &mut issues);
    check_loops(wf, &ids, &mut issues);
    check_forward_dag(wf, &mut issues);

    issues
}

fn check_starter(wf: &SerializedWorkflow, issues: &mut Vec<ValidationIssue>) {
    let starters: Vec<&str> = wf
        .blocks
        .iter()
        .filter(|b| b.kind == kinds::STARTER)
        .map(|b| b.id.as_str())
        .collect();
    match starters.as_slice() {
        [only] => {
            if wf.connections.iter().any(|c| c.target == *only) {
                issues.push(ValidationIssue::invalid(
                    "connections",
                    format!("starter block {only:?} must have no inbound edges"),
                ));
            }
        }
        [] => issues.push(ValidationIssue::invalid(
            "blocks",
            "workflow has no starter block",
        )),
        many => issues.push(ValidationIssue::invalid(
            "blocks",
            format!("workflow has {} starter blocks, expected exactly one", many.len()),
        )),
    }
}

fn check_connections(
    wf: &SerializedWorkflow,
    ids: &HashSet<&str>,
    issues: &mut Vec<ValidationIssue>,
) {
    for (i, conn) in wf.connections.iter().enumerate() {
        for (role, id) in [("source", &conn.source), ("target", &conn.target)] {
            if !ids.contains(id.as_str()) {
                issues.push(ValidationIssue::invalid(
                    format!("connections[{i}].{role}"),
                    format!("{role} references unknown block {id:?}"),
                ));
            }
        }
    }
}

fn check_loops(wf: &SerializedWorkflow, ids: &HashSet<&str>, issues: &mut Vec<ValidationIssue>) {
    let kind_of: HashMap<&str, &str> = wf
        .blocks
        .iter()
        .map(|b| (b.id.as_str(), b.kind.as_str()))
        .collect();

    for (loop_id, descriptor) in &wf.loops {
        let path = format!("loops.{loop_id}");
        match kind_of.get(loop_id.as_str()) {
            Some(&kinds::LOOP) => {}
            Some(other) => issues.push(ValidationIssue::invalid(
                &path,
                format!("loop id {loop_id:?} names a {other:?} block, expected a loop block"),
            )),
            None => issues.push(ValidationIssue::invalid(
                &path,
                format!("loop id {loop_id:?} does not name a block"),
            )),
        }
        for node in &descriptor.nodes {
            if !ids.contains(node.as_str()) {
                issues.push(ValidationIssue::invalid(
                    format!("{path}.nodes"),
                    format!("loop body references unknown block {node:?}"),
                ));
            }
        }
    }

    // Pairwise: node sets are disjoint, or one strictly nests the other and
    // contains the inner loop block's id.
    let loop_ids: Vec<&String> = wf.loops.keys().collect();
    for (i, a) in loop_ids.iter().enumerate() {
        for b in &loop_ids[i + 1..] {
            let a_nodes: HashSet<&str> =
                wf.loops[*a].nodes.iter().map(String::as_str).collect();
            let b_nodes: HashSet<&str> =
                wf.loops[*b].nodes.iter().map(String::as_str).collect();
            if a_nodes.is_disjoint(&b_nodes) {
                continue;
            }
            let a_nests_b = a_nodes.contains(b.as_str())
                && b_nodes.is_subset(&a_nodes)
                && b_nodes.len() < a_nodes.len();
            let b_nests_a = b_nodes.contains(a.as_str())
                && a_nodes.is_subset(&b_nodes)
                && a_nodes.len() < b_nodes.len();
            if !a_nests_b && !b_nests_a {
                issues.push(ValidationIssue::invalid(
                    format!("loops.{a}"),
                    format!("loop bodies of {a:?} and {b:?} overlap without nesting"),
                ));
            }
        }
    }

    for (i, conn) in wf.connections.iter().enumerate() {
        let tag = &conn.source_handle;
        if !matches!(tag, EdgeTag::LoopStart | EdgeTag::LoopEnd) {
            continue;
        }
        let Some(descriptor) = wf.loops.get(&conn.source) else {
            issues.push(ValidationIssue::invalid(
                format!("connections[{i}]"),
                format!("{tag} edge originates at {:?}, which is not a loop block", conn.source),
            ));
            continue;
        };
        let in_body = descriptor.nodes.iter().any(|n| *n == conn.target);
        match tag {
            EdgeTag::LoopStart if !in_body => issues.push(ValidationIssue::invalid(
                format!("connections[{i}]"),
                format!("loop-start-source edge targets {:?} outside the loop body", conn.target),
            )),
            EdgeTag::LoopEnd if in_body => issues.push(ValidationIssue::invalid(
                format!("connections[{i}]"),
                format!("loop-end-source edge targets {:?} inside the loop body", conn.target),
            )),
            _ => {}
        }
    }
}

/// Ignoring back-edges (body block -> its loop block), the graph must be a DAG
/// in which every block is reachable from the starter.
fn check_forward_dag(wf: &SerializedWorkflow, issues: &mut Vec<ValidationIssue>) {
    let forward: Vec<(&str, &str)> = wf
        .connections
        .iter()
        .filter(|c| {
            !wf.loops
                .get(&c.target)
                .is_some_and(|l| l.nodes.iter().any(|n| *n == c.source))
        })
        .map(|c| (c.source.as_str(), c.target.as_str()))
        .collect();

    let mut in_degree: HashMap<&str, usize> =
        wf.blocks.iter().map(|b| (b.id.as_str(), 0)).collect();
    for (_, to) in &forward {
        if let Some(d) = in_degree.get_mut(to) {
            *d += 1;
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0usize;
    while let Some(u) = queue.pop_front() {
        visited += 1;
        for (from, to) in &forward {
            if *from == u
                && let Some(d) = in_degree.get_mut(to)
            {
                *d = d.saturating_sub(1);
                if *d == 0 {
                    queue.push_back(to);
                }
            }
        }
    }
    if visited != wf.blocks.len() {
        issues.push(ValidationIssue::invalid(
            "connections",
            "graph contains a cycle outside loop regions",
        ));
        return;
    }

    let Some(starter) = wf.blocks.iter().find(|b| b.kind == kinds::STARTER) else {
        return;
    };
    let mut reachable: HashSet<&str> = HashSet::from([starter.id.as_str()]);
    let mut queue = VecDeque::from([starter.id.as_str()]);
    while let Some(u) = queue.pop_front() {
        for (from, to) in &forward {
            if *from == u && reachable.insert(to) {
                queue.push_back(to);
            }
        }
    }
    for block in &wf.blocks {
        if !reachable.contains(block.id.as_str()) {
            issues.push(ValidationIssue::invalid(
                "blocks",
                format!("block {:?} is not reachable from the starter", block.id),
            ));
        }
    }
}

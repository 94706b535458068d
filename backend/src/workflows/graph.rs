// Workflow Graph - Builder graph parsing and compilation into a versioned program

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use uuid::Uuid;

use compass_shared::{ActionStep, Branch, TriggerCondition};

use super::{ActionKind, Condition, ConditionOperator, ConditionSet};

/// Trigger type used when the trigger node does not name one.
pub const DEFAULT_TRIGGER_EVENT: &str = "default.trigger";

const YES_OUTPUT: &str = "output_1";
const NO_OUTPUT: &str = "output_2";

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Workflow graph has no trigger node")]
    MissingTrigger,

    #[error("Workflow graph has more than one trigger node")]
    MultipleTriggers,

    #[error("Edge references unknown node '{0}'")]
    UnknownNode(String),

    #[error("Cycle detected at node '{0}'")]
    Cycle(String),

    #[error("Node '{0}' is reachable through crossing paths")]
    SharedNode(String),

    #[error("Node '{node}' is invalid: {reason}")]
    InvalidNode { node: String, reason: String },

    #[error("Malformed builder data: {0}")]
    Malformed(String),
}

pub type GraphResult<T> = Result<T, GraphError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    /// `trigger`, `condition`, or an action type
    pub name: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    /// `output_1` (yes) or `output_2` (no) on condition nodes
    #[serde(default = "default_output")]
    pub output: String,
}

fn default_output() -> String {
    YES_OUTPUT.to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowGraph {
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub edges: Vec<GraphEdge>,
}

/// Compiled step tree; mirrors the persisted ActionStep/Branch rows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepItem {
    Action {
        label: String,
        action: ActionKind,
    },
    Branch {
        label: String,
        condition: ConditionSet,
        on_true: Vec<StepItem>,
        on_false: Vec<StepItem>,
    },
}

/// One program instruction. `Branch` falls through on true and jumps to
/// `else_target` on false; the true path ends with a `Jump` past the false path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Instruction {
    Action {
        label: String,
        order_index: i32,
        action: ActionKind,
    },
    Branch {
        label: String,
        condition: ConditionSet,
        else_target: usize,
    },
    Jump {
        target: usize,
    },
}

/// Immutable result of compiling one saved graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompiledWorkflow {
    pub trigger_event_type: String,
    pub conditions: ConditionSet,
    pub outline: Vec<StepItem>,
    pub program: Vec<Instruction>,
}

impl WorkflowGraph {
    /// Accepts either `{nodes, edges}` or a Drawflow export.
    pub fn from_builder_data(data: &serde_json::Value) -> GraphResult<Self> {
        if data.get("drawflow").is_some() {
            return Self::from_drawflow(data);
        }
        serde_json::from_value(data.clone()).map_err(|e| GraphError::Malformed(e.to_string()))
    }

    /// Read `drawflow.Home.data`, turning each `outputs.*.connections` entry into an edge.
    pub fn from_drawflow(data: &serde_json::Value) -> GraphResult<Self> {
        let nodes = data
            .pointer("/drawflow/Home/data")
            .and_then(|v| v.as_object())
            .ok_or_else(|| GraphError::Malformed("missing drawflow.Home.data".to_string()))?;

        let mut ids: Vec<&String> = nodes.keys().collect();
        ids.sort_by(|a, b| match (a.parse::<u64>(), b.parse::<u64>()) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            _ => a.cmp(b),
        });

        let mut graph = WorkflowGraph::default();
        for id in ids {
            let raw = &nodes[id];
            let name = raw
                .get("name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| GraphError::InvalidNode {
                    node: id.clone(),
                    reason: "missing name".to_string(),
                })?;

            graph.nodes.push(GraphNode {
                id: id.clone(),
                name: name.to_string(),
                data: raw.get("data").cloned().unwrap_or(serde_json::Value::Null),
            });

            let Some(outputs) = raw.get("outputs").and_then(|v| v.as_object()) else {
                continue;
            };
            let mut output_names: Vec<&String> = outputs.keys().collect();
            output_names.sort();
            for output in output_names {
                let connections = outputs[output]
                    .get("connections")
                    .and_then(|v| v.as_array())
                    .cloned()
                    .unwrap_or_default();
                for connection in connections {
                    let target = match connection.get("node") {
                        Some(serde_json::Value::String(s)) => s.clone(),
                        Some(serde_json::Value::Number(n)) => n.to_string(),
                        _ => continue,
                    };
                    graph.edges.push(GraphEdge {
                        from: id.clone(),
                        to: target,
                        output: output.clone(),
                    });
                }
            }
        }

        Ok(graph)
    }

    pub fn compile(&self) -> GraphResult<CompiledWorkflow> {
        let compiler = Compiler::new(self)?;
        compiler.compile()
    }
}

struct Compiler<'a> {
    nodes: HashMap<&'a str, &'a GraphNode>,
    /// node -> [(output, target)] in edge order
    adjacency: HashMap<&'a str, Vec<(&'a str, &'a str)>>,
}

impl<'a> Compiler<'a> {
    fn new(graph: &'a WorkflowGraph) -> GraphResult<Self> {
        let mut nodes: HashMap<&str, &GraphNode> = HashMap::with_capacity(graph.nodes.len());
        for node in &graph.nodes {
            if nodes.insert(node.id.as_str(), node).is_some() {
                return Err(GraphError::InvalidNode {
                    node: node.id.clone(),
                    reason: "duplicate node id".to_string(),
                });
            }
        }

        let mut adjacency: HashMap<&str, Vec<(&str, &str)>> = HashMap::new();
        for edge in &graph.edges {
            for end in [&edge.from, &edge.to] {
                if !nodes.contains_key(end.as_str()) {
                    return Err(GraphError::UnknownNode(end.clone()));
                }
            }
            adjacency
                .entry(edge.from.as_str())
                .or_default()
                .push((edge.output.as_str(), edge.to.as_str()));
        }

        Ok(Self { nodes, adjacency })
    }

    fn compile(&self) -> GraphResult<CompiledWorkflow> {
        let mut triggers = self.nodes.values().filter(|n| n.name == "trigger");
        let trigger = triggers.next().ok_or(GraphError::MissingTrigger)?;
        if triggers.next().is_some() {
            return Err(GraphError::MultipleTriggers);
        }

        let trigger_event_type = trigger
            .data
            .get("event_type")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_TRIGGER_EVENT)
            .to_string();
        let conditions = trigger_conditions(trigger)?;

        let first = self.single_successor(trigger)?;
        let mut ancestors = Vec::new();
        let mut placed = HashSet::new();
        let outline = self.compile_chain(first, None, &mut ancestors, &mut placed)?;

        let mut program = Vec::new();
        emit(&outline, &mut program);

        Ok(CompiledWorkflow {
            trigger_event_type,
            conditions,
            outline,
            program,
        })
    }

    fn compile_chain(
        &self,
        start: Option<&'a str>,
        stop: Option<&'a str>,
        ancestors: &mut Vec<&'a str>,
        placed: &mut HashSet<&'a str>,
    ) -> GraphResult<Vec<StepItem>> {
        let mut items = Vec::new();
        let mut current = start;
        let depth = ancestors.len();

        while let Some(id) = current {
            if Some(id) == stop {
                break;
            }
            if ancestors.contains(&id) {
                return Err(GraphError::Cycle(id.to_string()));
            }
            if !placed.insert(id) {
                return Err(GraphError::SharedNode(id.to_string()));
            }
            ancestors.push(id);

            let node = self.nodes[id];
            match node.name.as_str() {
                "trigger" => {
                    return Err(GraphError::InvalidNode {
                        node: id.to_string(),
                        reason: "trigger nodes cannot have inputs".to_string(),
                    });
                }
                "condition" => {
                    let yes = self.output_target(id, YES_OUTPUT);
                    let no = self.output_target(id, NO_OUTPUT);
                    // a one-armed branch rejoins wherever the enclosing chain stops
                    let join = self.join_point(yes, no).or(stop);

                    let on_true = self.compile_chain(yes, join, ancestors, placed)?;
                    let on_false = self.compile_chain(no, join, ancestors, placed)?;

                    items.push(StepItem::Branch {
                        label: id.to_string(),
                        condition: branch_condition(node)?,
                        on_true,
                        on_false,
                    });
                    current = join;
                }
                _ => {
                    items.push(StepItem::Action {
                        label: id.to_string(),
                        action: node_action(node)?,
                    });
                    current = self.single_successor(node)?;
                }
            }
        }

        ancestors.truncate(depth);
        Ok(items)
    }

    fn single_successor(&self, node: &GraphNode) -> GraphResult<Option<&'a str>> {
        let targets = self.adjacency.get(node.id.as_str()).map(|v| v.as_slice()).unwrap_or(&[]);
        match targets {
            [] => Ok(None),
            [(_, target)] => Ok(Some(*target)),
            _ => Err(GraphError::InvalidNode {
                node: node.id.clone(),
                reason: "only condition nodes may have more than one outgoing edge".to_string(),
            }),
        }
    }

    fn output_target(&self, id: &str, output: &str) -> Option<&'a str> {
        self.adjacency
            .get(id)
            .and_then(|targets| targets.iter().find(|(o, _)| *o == output))
            .map(|(_, target)| *target)
    }

    /// First node on the yes side (breadth-first) that the no side also reaches.
    fn join_point(&self, yes: Option<&'a str>, no: Option<&'a str>) -> Option<&'a str> {
        let (yes, no) = (yes?, no?);
        let reachable_from_no = self.reachable(no);

        let mut queue = VecDeque::from([yes]);
        let mut seen = HashSet::from([yes]);
        while let Some(id) = queue.pop_front() {
            if reachable_from_no.contains(id) {
                return Some(id);
            }
            for (_, next) in self.adjacency.get(id).map(|v| v.as_slice()).unwrap_or(&[]) {
                if seen.insert(*next) {
                    queue.push_back(*next);
                }
            }
        }
        None
    }

    fn reachable(&self, start: &'a str) -> HashSet<&'a str> {
        let mut seen = HashSet::from([start]);
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            for (_, next) in self.adjacency.get(id).map(|v| v.as_slice()).unwrap_or(&[]) {
                if seen.insert(*next) {
                    stack.push(*next);
                }
            }
        }
        seen
    }
}

fn trigger_conditions(node: &GraphNode) -> GraphResult<ConditionSet> {
    match node.data.get("conditions") {
        None | Some(serde_json::Value::Null) => Ok(ConditionSet::default()),
        Some(serde_json::Value::Object(map)) => Ok(ConditionSet::from_map(map)),
        Some(list @ serde_json::Value::Array(_)) => {
            serde_json::from_value(list.clone()).map_err(|e| GraphError::InvalidNode {
                node: node.id.clone(),
                reason: format!("bad conditions: {}", e),
            })
        }
        Some(_) => Err(GraphError::InvalidNode {
            node: node.id.clone(),
            reason: "conditions must be an object or a list".to_string(),
        }),
    }
}

fn branch_condition(node: &GraphNode) -> GraphResult<ConditionSet> {
    if let Some(map) = node.data.get("conditions").and_then(|v| v.as_object()) {
        return Ok(ConditionSet::from_map(map));
    }

    let field = node
        .data
        .get("field_path")
        .or_else(|| node.data.get("field"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GraphError::InvalidNode {
            node: node.id.clone(),
            reason: "condition node needs a field".to_string(),
        })?;
    let operator = node
        .data
        .get("operator")
        .and_then(|v| v.as_str())
        .map(ConditionOperator::parse)
        .unwrap_or(ConditionOperator::Eq);
    let value = node.data.get("value").cloned().unwrap_or(serde_json::Value::Null);

    Ok(ConditionSet::new(vec![Condition::new(field, operator, value)]))
}

fn node_action(node: &GraphNode) -> GraphResult<ActionKind> {
    let action_type = if node.name == "action" {
        node.data.get("action_type").and_then(|v| v.as_str()).unwrap_or_default()
    } else {
        node.name.as_str()
    };
    let parameters = match node.data.get("parameters") {
        Some(params @ serde_json::Value::Object(_)) => params.clone(),
        _ => node.data.clone(),
    };

    ActionKind::from_parts(action_type, parameters).map_err(|e| GraphError::InvalidNode {
        node: node.id.clone(),
        reason: format!("{} action: {}", action_type, e),
    })
}

fn emit(items: &[StepItem], program: &mut Vec<Instruction>) {
    for (order, item) in items.iter().enumerate() {
        match item {
            StepItem::Action { label, action } => program.push(Instruction::Action {
                label: label.clone(),
                order_index: order as i32,
                action: action.clone(),
            }),
            StepItem::Branch {
                label,
                condition,
                on_true,
                on_false,
            } => {
                let branch_at = program.len();
                program.push(Instruction::Branch {
                    label: label.clone(),
                    condition: condition.clone(),
                    else_target: 0,
                });
                emit(on_true, program);

                let jump_at = if on_false.is_empty() {
                    None
                } else {
                    program.push(Instruction::Jump { target: 0 });
                    Some(program.len() - 1)
                };
                let else_start = program.len();
                emit(on_false, program);
                let end = program.len();

                if let Instruction::Branch { else_target, .. } = &mut program[branch_at] {
                    *else_target = else_start;
                }
                if let Some(Instruction::Jump { target }) = jump_at.map(|at| &mut program[at]) {
                    *target = end;
                }
            }
        }
    }
}

/// Run-time fork selection for compiled programs.
pub struct BranchEvaluator;

impl BranchEvaluator {
    /// Where execution continues after the branch at `pointer`, and which path was taken.
    pub fn next_pointer(
        pointer: usize,
        condition: &ConditionSet,
        else_target: usize,
        document: &serde_json::Value,
    ) -> (usize, bool) {
        if condition.matches(document) {
            (pointer + 1, true)
        } else {
            (else_target, false)
        }
    }
}

impl CompiledWorkflow {
    pub fn trigger_rows(&self, workflow_id: Uuid, version: i32) -> Vec<TriggerCondition> {
        self.conditions
            .conditions
            .iter()
            .enumerate()
            .map(|(position, condition)| TriggerCondition {
                id: Uuid::new_v4(),
                workflow_id,
                version,
                position: position as i32,
                field_path: condition.field_path.clone(),
                operator: condition.operator.as_str().to_string(),
                value: condition.value.clone(),
            })
            .collect()
    }

    /// Flatten the outline into ActionStep and Branch rows.
    pub fn step_rows(&self, workflow_id: Uuid, version: i32) -> (Vec<ActionStep>, Vec<Branch>) {
        let mut steps = Vec::new();
        let mut branches = Vec::new();
        collect_rows(&self.outline, None, workflow_id, version, &mut steps, &mut branches);
        (steps, branches)
    }

    pub fn action_count(&self) -> usize {
        self.program
            .iter()
            .filter(|i| matches!(i, Instruction::Action { .. }))
            .count()
    }
}

fn collect_rows(
    items: &[StepItem],
    parent: Option<(Uuid, bool)>,
    workflow_id: Uuid,
    version: i32,
    steps: &mut Vec<ActionStep>,
    branches: &mut Vec<Branch>,
) {
    for (order, item) in items.iter().enumerate() {
        match item {
            StepItem::Action { label, action } => steps.push(ActionStep {
                id: Uuid::new_v4(),
                workflow_id,
                version,
                branch_id: parent.map(|(id, _)| id),
                branch_path: parent.map(|(_, path)| path),
                order_index: order as i32,
                label: label.clone(),
                action_type: action.action_type().to_string(),
                parameters: action.parameters(),
            }),
            StepItem::Branch {
                label,
                condition,
                on_true,
                on_false,
            } => {
                let id = Uuid::new_v4();
                branches.push(Branch {
                    id,
                    workflow_id,
                    version,
                    parent_branch_id: parent.map(|(id, _)| id),
                    parent_path: parent.map(|(_, path)| path),
                    order_index: order as i32,
                    label: label.clone(),
                    condition: serde_json::to_value(condition).unwrap_or(serde_json::Value::Null),
                });
                collect_rows(on_true, Some((id, true)), workflow_id, version, steps, branches);
                collect_rows(on_false, Some((id, false)), workflow_id, version, steps, branches);
            }
        }
    }
}

//! Operator graph registry.
//!
//! Each forward dispatch registers a node linking the producing operator to
//! the tensor ids it consumed. [`GraphContext`] is plain data owned by the
//! caller, so independent graphs never see each other's nodes and tests can
//! build and inspect one in isolation.

/// A registered operator invocation.
#[derive(Debug, Clone)]
pub struct GraphNode {
    /// Position in the registration log.
    pub index: usize,
    /// Operator kind, e.g. `"add"` or `"gemm"`.
    pub kind: &'static str,
    /// Ids of the tensors the operator read.
    pub input_ids: Vec<u64>,
    /// Id of the tensor the operator produced.
    pub output_id: u64,
    /// True when registered inside a composite module.
    pub sub_graph: bool,
}

/// Append-only log of operator invocations plus producer-edge queries.
#[derive(Debug, Default)]
pub struct GraphContext {
    nodes: Vec<GraphNode>,
    sub_depth: usize,
}

impl GraphContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operator invocation and return its node index.
    pub fn register(&mut self, kind: &'static str, input_ids: Vec<u64>, output_id: u64) -> usize {
        let index = self.nodes.len();
        self.nodes.push(GraphNode {
            index,
            kind,
            input_ids,
            output_id,
            sub_graph: self.sub_depth > 0,
        });
        index
    }

    /// Nodes registered until the matching [`end_sub_graph`](Self::end_sub_graph)
    /// are children of a composite and excluded from the top-level order.
    pub fn begin_sub_graph(&mut self) {
        self.sub_depth += 1;
    }

    pub fn end_sub_graph(&mut self) {
        self.sub_depth = self.sub_depth.saturating_sub(1);
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> Option<&GraphNode> {
        self.nodes.get(index)
    }

    /// Index of the node that produced the given tensor, if any.
    /// When a tensor id was produced more than once the latest node wins.
    pub fn producer_of(&self, tensor_id: u64) -> Option<usize> {
        self.nodes
            .iter()
            .rev()
            .find(|n| n.output_id == tensor_id)
            .map(|n| n.index)
    }

    /// Deterministic post-order walk of the top-level graph: dependencies
    /// first, every node exactly once.
    pub fn execution_order(&self) -> Vec<usize> {
        let top: Vec<&GraphNode> = self.nodes.iter().filter(|n| !n.sub_graph).collect();
        let consumed: Vec<u64> = top.iter().flat_map(|n| n.input_ids.clone()).collect();

        let mut order = Vec::new();
        let mut visited = vec![false; self.nodes.len()];

        // Sinks are nodes whose output no top-level node consumes.
        for node in &top {
            if !consumed.contains(&node.output_id) {
                self.visit(node.index, &mut visited, &mut order);
            }
        }
        // Disconnected remainders keep log order.
        for node in &top {
            if !visited[node.index] {
                self.visit(node.index, &mut visited, &mut order);
            }
        }
        order
    }

    fn visit(&self, index: usize, visited: &mut Vec<bool>, order: &mut Vec<usize>) {
        if visited[index] {
            return;
        }
        visited[index] = true;
        for &input in &self.nodes[index].input_ids {
            if let Some(parent) = self.producer_of(input) {
                if !self.nodes[parent].sub_graph {
                    self.visit(parent, visited, order);
                }
            }
        }
        order.push(index);
    }
}

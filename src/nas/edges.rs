//! Canonical edge enumeration of a cell
//!
//! Intermediate node `i` receives one edge from every earlier state: the two
//! cell inputs plus the `i` nodes before it. Edges are listed node by node,
//! sources in increasing order. Row `k` of an architecture weight matrix
//! belongs to edge `k` of this enumeration.

use std::ops::Range;

/// One edge of a cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    /// Row of the architecture weight matrix
    pub index: usize,
    /// Source state; 0 and 1 are the cell inputs
    pub source: usize,
    /// Destination intermediate node, counted from 0
    pub node: usize,
}

impl Edge {
    /// Whether the edge starts at one of the two cell inputs
    pub fn from_input(&self) -> bool {
        self.source < 2
    }
}

/// Number of edges in a cell with `steps` intermediate nodes
pub fn num_edges(steps: usize) -> usize {
    (0..steps).map(|i| i + 2).sum()
}

/// Weight-matrix rows feeding intermediate node `node`
pub fn node_rows(node: usize) -> Range<usize> {
    let start = num_edges(node);
    start..start + node + 2
}

/// Every edge of a cell in canonical order
pub fn edges(steps: usize) -> impl Iterator<Item = Edge> {
    (0..steps).flat_map(|node| {
        node_rows(node)
            .enumerate()
            .map(move |(source, index)| Edge { index, source, node })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edge_count() {
        assert_eq!(num_edges(4), 14);
        assert_eq!(num_edges(1), 2);
        assert_eq!(num_edges(0), 0);
    }

    #[test]
    fn test_rows_are_contiguous() {
        assert_eq!(node_rows(0), 0..2);
        assert_eq!(node_rows(1), 2..5);
        assert_eq!(node_rows(2), 5..9);
        assert_eq!(node_rows(3), 9..14);
    }

    #[test]
    fn test_enumeration_order() {
        let all: Vec<Edge> = edges(4).collect();
        assert_eq!(all.len(), 14);
        for (k, e) in all.iter().enumerate() {
            assert_eq!(e.index, k);
        }
        let sources: Vec<usize> = all.iter().map(|e| e.source).collect();
        assert_eq!(sources, vec![0, 1, 0, 1, 2, 0, 1, 2, 3, 0, 1, 2, 3, 4]);
        assert_eq!(all[13].node, 3);
        assert!(all[1].from_input() && !all[4].from_input());
    }
}

//! Deterministic topological ordering over index-addressed graphs.

use std::collections::{BTreeSet, HashMap};

/// Orders nodes so every node follows its predecessors.
///
/// `predecessors[i]` holds the indices node `i` depends on. Among nodes that
/// are ready at the same time, the lowest index comes first, so ties break
/// by declaration order.
///
/// On a cycle, returns the cycle path with its first node repeated at the
/// end, following dependency edges.
pub(crate) fn topological_order(predecessors: &[BTreeSet<usize>]) -> Result<Vec<usize>, Vec<usize>> {
    let n = predecessors.len();
    let mut remaining: Vec<usize> = predecessors.iter().map(BTreeSet::len).collect();
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (node, preds) in predecessors.iter().enumerate() {
        for &pred in preds {
            successors[pred].push(node);
        }
    }

    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| remaining[i] == 0).collect();
    let mut order = Vec::with_capacity(n);

    while let Some(node) = ready.pop_first() {
        order.push(node);
        for &succ in &successors[node] {
            remaining[succ] -= 1;
            if remaining[succ] == 0 {
                ready.insert(succ);
            }
        }
    }

    if order.len() == n {
        return Ok(order);
    }

    let mut placed = vec![false; n];
    for &node in &order {
        placed[node] = true;
    }
    Err(find_cycle(predecessors, &placed))
}

/// Walks unplaced nodes along unplaced predecessors until one repeats.
///
/// Every unplaced node has at least one unplaced predecessor, so the walk
/// always closes a cycle.
fn find_cycle(predecessors: &[BTreeSet<usize>], placed: &[bool]) -> Vec<usize> {
    let Some(mut node) = (0..placed.len()).find(|&i| !placed[i]) else {
        return Vec::new();
    };

    let mut path = Vec::new();
    let mut position: HashMap<usize, usize> = HashMap::new();

    loop {
        if let Some(&at) = position.get(&node) {
            let mut cycle = path[at..].to_vec();
            cycle.push(node);
            return cycle;
        }
        position.insert(node, path.len());
        path.push(node);

        match predecessors[node].iter().find(|&&p| !placed[p]) {
            Some(&next) => node = next,
            None => return path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn graph(edges: &[&[usize]]) -> Vec<BTreeSet<usize>> {
        edges.iter().map(|e| e.iter().copied().collect()).collect()
    }

    #[test]
    fn test_ties_break_by_index() {
        // 0 and 2 are roots; 1 depends on 2; 3 depends on 0.
        let order = topological_order(&graph(&[&[], &[2], &[], &[0]])).unwrap();
        assert_eq!(order, vec![0, 2, 1, 3]);
    }

    #[test]
    fn test_forward_reference_orders_later_declaration_first() {
        let order = topological_order(&graph(&[&[1], &[]])).unwrap();
        assert_eq!(order, vec![1, 0]);
    }

    #[test]
    fn test_cycle_path_is_reported() {
        // 0 -> 1 -> 2 -> 1
        let cycle = topological_order(&graph(&[&[1], &[2], &[1]])).unwrap_err();
        assert_eq!(cycle, vec![1, 2, 1]);
    }

    #[test]
    fn test_self_loop_is_a_cycle() {
        let cycle = topological_order(&graph(&[&[], &[1]])).unwrap_err();
        assert_eq!(cycle, vec![1, 1]);
    }

    #[test]
    fn test_empty_graph() {
        assert_eq!(topological_order(&[]).unwrap(), Vec::<usize>::new());
    }
}

//! Maximum bipartite matching (Hopcroft-Karp), used by the agent to assign
//! imported parts to place parts. A direct generalization of
//! `original_source/not_my_board/_util/_matching.py::find_matching` to
//! generic, hashable vertex types.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;

/// Finds a maximum cardinality matching in the bipartite graph `graph`,
/// whose keys are vertices of `U` and whose values list the `V` vertices
/// each `U` vertex has an edge to.
///
/// Returns a mapping from every matched `U` vertex to its matched `V`
/// vertex. Unmatched `U` vertices are absent from the result.
pub fn find_matching<U, V>(graph: &HashMap<U, Vec<V>>) -> HashMap<U, V>
where
    U: Eq + Hash + Clone,
    V: Eq + Hash + Clone,
{
    let mut m: HashMap<U, V> = HashMap::new();
    let mut m_reverse: HashMap<V, U> = HashMap::new();

    loop {
        let layer = breadth_first_search(graph, &m, &m_reverse);
        if layer.is_none() {
            break;
        }
        let layer = layer.unwrap();

        for u in graph.keys() {
            if !m.contains_key(u) {
                depth_first_search(u, graph, &mut m, &mut m_reverse, &layer);
            }
        }
    }

    m
}

/// Layer of a `U` vertex found by the BFS, or `None` if unvisited/pruned.
/// `free_v_reached` mirrors the Python implementation's `layer[None]`
/// sentinel: `Some(k)` for a reachable free U-vertex candidate depth, plus
/// a flag for whether a free V vertex was reached at all.
struct Layers<U> {
    depth: HashMap<U, usize>,
    free_v_reached: bool,
}

fn breadth_first_search<U, V>(
    graph: &HashMap<U, Vec<V>>,
    m: &HashMap<U, V>,
    m_reverse: &HashMap<V, U>,
) -> Option<Layers<U>>
where
    U: Eq + Hash + Clone,
    V: Eq + Hash + Clone,
{
    let mut depth: HashMap<U, usize> = HashMap::new();
    let mut queue: VecDeque<U> = VecDeque::new();

    for u in graph.keys() {
        if !m.contains_key(u) {
            depth.insert(u.clone(), 0);
            queue.push_back(u.clone());
        }
    }

    let mut free_v_reached = false;

    while let Some(u) = queue.pop_front() {
        let u_depth = *depth.get(&u).unwrap();
        for v in graph.get(&u).into_iter().flatten() {
            match m_reverse.get(v) {
                None => {
                    // v is free: an augmenting path reaches the sink.
                    free_v_reached = true;
                }
                Some(next_u) => {
                    if !depth.contains_key(next_u) {
                        depth.insert(next_u.clone(), u_depth + 1);
                        queue.push_back(next_u.clone());
                    }
                }
            }
        }
    }

    if free_v_reached {
        Some(Layers { depth, free_v_reached })
    } else {
        None
    }
}

fn depth_first_search<U, V>(
    u: &U,
    graph: &HashMap<U, Vec<V>>,
    m: &mut HashMap<U, V>,
    m_reverse: &mut HashMap<V, U>,
    layers: &Layers<U>,
) -> bool
where
    U: Eq + Hash + Clone,
    V: Eq + Hash + Clone,
{
    let u_depth = match layers.depth.get(u) {
        Some(d) => *d,
        None => return false,
    };

    let edges = graph.get(u).cloned().unwrap_or_default();
    for v in edges {
        let advances = match m_reverse.get(&v) {
            None => true,
            Some(next_u) => layers.depth.get(next_u) == Some(&(u_depth + 1)),
        };
        if !advances {
            continue;
        }

        let next_u = m_reverse.get(&v).cloned();
        let ok = match &next_u {
            None => true,
            Some(nu) => depth_first_search(nu, graph, m, m_reverse, layers),
        };
        if ok {
            m.insert(u.clone(), v.clone());
            m_reverse.insert(v, u.clone());
            return true;
        }
    }

    false
}

/// Computes, for each imported part name, the set of place-part identifiers
/// whose feature set is a superset of the imported part's feature set.
pub fn candidate_edges<K, F>(
    imported: &HashMap<K, HashSet<String>>,
    place_parts: &[(F, HashSet<String>)],
) -> HashMap<K, Vec<F>>
where
    K: Eq + Hash + Clone,
    F: Clone,
{
    imported
        .iter()
        .map(|(name, features)| {
            let candidates = place_parts
                .iter()
                .filter(|(_, pf)| features.is_subset(pf))
                .map(|(id, _)| id.clone())
                .collect();
            (name.clone(), candidates)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_maximum_matching() {
        let mut g: HashMap<&str, Vec<&str>> = HashMap::new();
        g.insert("U0", vec!["V0", "V1"]);
        g.insert("U1", vec!["V0", "V4"]);
        g.insert("U2", vec!["V2", "V3"]);
        g.insert("U3", vec!["V0", "V4"]);
        g.insert("U4", vec!["V1", "V3"]);

        let m = find_matching(&g);
        assert_eq!(m.len(), 5);

        let values: HashSet<_> = m.values().collect();
        assert_eq!(values.len(), 5, "matching must be injective");
    }

    #[test]
    fn unmatchable_vertex_is_absent() {
        let mut g: HashMap<&str, Vec<&str>> = HashMap::new();
        g.insert("U0", vec!["V0"]);
        g.insert("U1", vec!["V0"]);

        let m = find_matching(&g);
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn empty_graph_matches_nothing() {
        let g: HashMap<&str, Vec<&str>> = HashMap::new();
        assert!(find_matching(&g).is_empty());
    }
}

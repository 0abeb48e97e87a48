//! Bidirectional graph traversal (§4.3 `find_path`).
//!
//! Expands a forward frontier from the source and a backward frontier from
//! the target simultaneously, always advancing whichever side currently
//! holds the higher-confidence candidate, until the two meet. A path's
//! confidence is the harmonic mean of its edge confidences, discounted by
//! `0.99^depth` to favor shorter explanations over longer equally-confident
//! ones. Every edge the winning path crosses has its `last_used` timestamp
//! refreshed, same as an explicit traversal would.
use crate::index::GraphIndex;
use crate::types::{now_unix_secs, AssociationType, ConceptId, GraphPath};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

#[derive(Clone)]
struct Candidate {
    node: ConceptId,
    path: Vec<ConceptId>,
    edges: Vec<(ConceptId, ConceptId, AssociationType)>,
    edge_confidences: Vec<f32>,
    confidence: f32,
}

impl Candidate {
    fn start(node: ConceptId) -> Self {
        Self {
            node,
            path: vec![node],
            edges: Vec::new(),
            edge_confidences: Vec::new(),
            confidence: 1.0,
        }
    }

    fn depth(&self) -> usize {
        self.edges.len()
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.confidence == other.confidence
    }
}
impl Eq for Candidate {}
impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.confidence.partial_cmp(&other.confidence).unwrap_or(Ordering::Equal)
    }
}

fn harmonic_mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 1.0;
    }
    let sum_inv: f32 = values.iter().map(|v| 1.0 / v.max(1e-6)).sum();
    values.len() as f32 / sum_inv
}

fn path_confidence(edge_confidences: &[f32]) -> f32 {
    harmonic_mean(edge_confidences) * 0.99f32.powi(edge_confidences.len() as i32)
}

pub fn find_path(index: &GraphIndex, source: ConceptId, target: ConceptId, max_depth: u32) -> Option<GraphPath> {
    if source == target {
        return Some(GraphPath {
            concepts: vec![source],
            edges: Vec::new(),
            confidence: 1.0,
        });
    }
    let max_depth = max_depth as usize;

    let mut forward_best: HashMap<ConceptId, Candidate> = HashMap::new();
    let mut backward_best: HashMap<ConceptId, Candidate> = HashMap::new();
    let mut forward_heap: BinaryHeap<Candidate> = BinaryHeap::new();
    let mut backward_heap: BinaryHeap<Candidate> = BinaryHeap::new();

    let fwd_start = Candidate::start(source);
    let bwd_start = Candidate::start(target);
    forward_best.insert(source, fwd_start.clone());
    backward_best.insert(target, bwd_start.clone());
    forward_heap.push(fwd_start);
    backward_heap.push(bwd_start);

    let mut best_path: Option<GraphPath> = None;

    while !forward_heap.is_empty() || !backward_heap.is_empty() {
        let expand_forward = match (forward_heap.peek(), backward_heap.peek()) {
            (Some(f), Some(b)) => f.confidence >= b.confidence,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };

        let (current, own_best, other_best, own_heap) = if expand_forward {
            match forward_heap.pop() {
                Some(c) => (c, &mut forward_best, &backward_best, &mut forward_heap),
                None => continue,
            }
        } else {
            match backward_heap.pop() {
                Some(c) => (c, &mut backward_best, &forward_best, &mut backward_heap),
                None => continue,
            }
        };

        if current.depth() >= max_depth {
            continue;
        }

        for neighbor in index.get_neighbors(current.node) {
            let assoc = match index.get_association_either(current.node, neighbor.neighbor, neighbor.assoc_type) {
                Some(a) => a,
                None => continue,
            };

            let mut edge_confidences = current.edge_confidences.clone();
            edge_confidences.push(assoc.confidence);
            let confidence = path_confidence(&edge_confidences);

            let improved = own_best
                .get(&neighbor.neighbor)
                .map(|existing| confidence > existing.confidence)
                .unwrap_or(true);
            if !improved {
                continue;
            }

            let mut path = current.path.clone();
            path.push(neighbor.neighbor);
            let mut edges = current.edges.clone();
            edges.push((current.node, neighbor.neighbor, neighbor.assoc_type));
            let next = Candidate {
                node: neighbor.neighbor,
                path,
                edges,
                edge_confidences,
                confidence,
            };
            own_best.insert(neighbor.neighbor, next.clone());

            if let Some(meeting_other) = other_best.get(&neighbor.neighbor) {
                let combined = if expand_forward {
                    combine(&next, meeting_other)
                } else {
                    combine(meeting_other, &next)
                };
                if combined.edges.len() <= max_depth {
                    best_path = pick_better(best_path, Some(combined), index);
                }
            }

            own_heap.push(next);
        }
    }

    if let Some(path) = &best_path {
        let now = now_unix_secs();
        for (source, target, assoc_type) in &path.edges {
            index.touch_association_either(*source, *target, *assoc_type, now);
        }
    }
    best_path
}

fn combine(fwd: &Candidate, bwd: &Candidate) -> GraphPath {
    let mut concepts = fwd.path.clone();
    let mut reversed_tail = bwd.path.clone();
    reversed_tail.reverse();
    concepts.extend(reversed_tail.into_iter().skip(1));

    let mut edges = fwd.edges.clone();
    let mut reversed_edges = bwd.edges.clone();
    reversed_edges.reverse();
    edges.extend(reversed_edges.into_iter().map(|(s, t, ty)| (t, s, ty)));

    let mut edge_confidences = fwd.edge_confidences.clone();
    let mut reversed_conf = bwd.edge_confidences.clone();
    reversed_conf.reverse();
    edge_confidences.extend(reversed_conf);

    GraphPath {
        concepts,
        edges,
        confidence: path_confidence(&edge_confidences),
    }
}

/// §4.3 tie-break: prefer higher confidence; on a tie, prefer the path whose
/// concepts have the greater total access count; on a further tie, prefer
/// the lexicographically smaller sequence of concept ids (deterministic).
fn pick_better(current: Option<GraphPath>, candidate: Option<GraphPath>, index: &GraphIndex) -> Option<GraphPath> {
    let (current, candidate) = match (current, candidate) {
        (None, c) => return c,
        (c, None) => return c,
        (Some(c), Some(n)) => (c, n),
    };

    let current_score = (current.confidence, total_access_count(&current, index));
    let candidate_score = (candidate.confidence, total_access_count(&candidate, index));

    match current_score.0.partial_cmp(&candidate_score.0).unwrap_or(Ordering::Equal) {
        Ordering::Less => Some(candidate),
        Ordering::Greater => Some(current),
        Ordering::Equal => match current_score.1.cmp(&candidate_score.1) {
            Ordering::Less => Some(candidate),
            Ordering::Greater => Some(current),
            Ordering::Equal => {
                if candidate.concepts < current.concepts {
                    Some(candidate)
                } else {
                    Some(current)
                }
            }
        },
    }
}

fn total_access_count(path: &GraphPath, index: &GraphIndex) -> u64 {
    path.concepts
        .iter()
        .filter_map(|id| index.get_concept(*id))
        .map(|c| c.access_count)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Concept, Metadata};

    fn id(seed: u8) -> ConceptId {
        ConceptId([seed; 16])
    }

    fn seeded_concept(index: &GraphIndex, seed: u8) {
        index.upsert_concept(
            Concept::new(id(seed), format!("c{seed}"), vec![1.0], None, Metadata::new(), 0),
            0,
        );
    }

    #[test]
    fn finds_direct_edge() {
        let index = GraphIndex::new();
        seeded_concept(&index, 1);
        seeded_concept(&index, 2);
        index.upsert_association(id(1), id(2), AssociationType::Semantic, 0.9, None, 0);

        let path = find_path(&index, id(1), id(2), 5).unwrap();
        assert_eq!(path.concepts, vec![id(1), id(2)]);
        assert_eq!(path.edges.len(), 1);
    }

    #[test]
    fn finds_multi_hop_path() {
        let index = GraphIndex::new();
        for seed in 1..=4 {
            seeded_concept(&index, seed);
        }
        index.upsert_association(id(1), id(2), AssociationType::Semantic, 0.9, None, 0);
        index.upsert_association(id(2), id(3), AssociationType::Semantic, 0.9, None, 0);
        index.upsert_association(id(3), id(4), AssociationType::Semantic, 0.9, None, 0);

        let path = find_path(&index, id(1), id(4), 10).unwrap();
        assert_eq!(path.concepts.first(), Some(&id(1)));
        assert_eq!(path.concepts.last(), Some(&id(4)));
        assert_eq!(path.edges.len(), 3);
    }

    #[test]
    fn returns_none_when_unreachable() {
        let index = GraphIndex::new();
        seeded_concept(&index, 1);
        seeded_concept(&index, 2);

        assert!(find_path(&index, id(1), id(2), 5).is_none());
    }

    #[test]
    fn depth_limit_prevents_overlong_paths() {
        let index = GraphIndex::new();
        for seed in 1..=5 {
            seeded_concept(&index, seed);
        }
        index.upsert_association(id(1), id(2), AssociationType::Semantic, 0.9, None, 0);
        index.upsert_association(id(2), id(3), AssociationType::Semantic, 0.9, None, 0);
        index.upsert_association(id(3), id(4), AssociationType::Semantic, 0.9, None, 0);
        index.upsert_association(id(4), id(5), AssociationType::Semantic, 0.9, None, 0);

        assert!(find_path(&index, id(1), id(5), 2).is_none());
    }
}

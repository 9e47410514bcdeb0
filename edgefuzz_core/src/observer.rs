use crate::feature::{EDGE_MASK, EdgeCounts, EdgeId};
use std::collections::BTreeSet;

/// Shift applied to the previous block index when forming a block-to-block edge.
const PREV_BLOCK_SHIFT: u32 = 28;

/// Collects edge hit counts for a single execution of an in-process harness.
///
/// A fresh tracer is handed to the harness for every run, so no state leaks
/// from one execution into the next. Harnesses either report basic blocks with
/// [`EdgeTracer::block`], in which case edges are formed from consecutive
/// blocks, or report edge identifiers directly with [`EdgeTracer::edge`].
#[derive(Debug, Default, Clone)]
pub struct EdgeTracer {
    prev_block: u64,
    edges: EdgeCounts,
}

impl EdgeTracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records entry into block `index`, counting the edge from the previously
    /// entered block.
    pub fn block(&mut self, index: u64) {
        let edge = ((self.prev_block << PREV_BLOCK_SHIFT) | index) & EDGE_MASK;
        self.edge(edge);
        self.prev_block = index;
    }

    /// Records one traversal of `edge`. Bits above the edge width are discarded.
    pub fn edge(&mut self, edge: EdgeId) {
        *self.edges.entry(edge & EDGE_MASK).or_insert(0) += 1;
    }

    pub fn edges(&self) -> &EdgeCounts {
        &self.edges
    }

    pub fn into_edges(self) -> EdgeCounts {
        self.edges
    }
}

/// Edge id of the transition from location `from` to location `to`.
fn location_edge(from: &str, to: &str) -> EdgeId {
    let digest = md5::compute(format!("{from}\n{to}"));
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&digest.0[..8]);
    u64::from_le_bytes(raw) & EDGE_MASK
}

/// Turns a sequence of visited locations into edge counts.
///
/// Each pair of consecutive locations is one edge; the edge id is the low 56
/// bits of the MD5 digest of `"<from>\n<to>"`. The first location pairs with an
/// implicit empty entry location so single-location traces still yield an edge.
pub fn edges_from_locations<'a, I>(locations: I) -> EdgeCounts
where
    I: IntoIterator<Item = &'a str>,
{
    let mut tracer = EdgeTracer::new();
    let mut prev = "";
    for location in locations {
        tracer.edge(location_edge(prev, location));
        prev = location;
    }
    tracer.into_edges()
}

/// Parses a list of instrumentable edges, one `<from>\t<to>` pair per line.
///
/// A line without a tab is an entry edge into that location. Blank lines are
/// ignored.
pub fn parse_instrumented_edges(text: &str) -> BTreeSet<EdgeId> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| match line.split_once('\t') {
            Some((from, to)) => location_edge(from.trim(), to.trim()),
            None => location_edge("", line.trim()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_form_edges_from_previous_block() {
        let mut tracer = EdgeTracer::new();
        tracer.block(1);
        tracer.block(2);
        tracer.block(2);
        let edges = tracer.edges();
        assert_eq!(edges.get(&1), Some(&1));
        assert_eq!(edges.get(&((1 << 28) | 2)), Some(&1));
        assert_eq!(edges.get(&((2 << 28) | 2)), Some(&1));
        assert_eq!(edges.len(), 3);
    }

    #[test]
    fn repeated_edges_accumulate() {
        let mut tracer = EdgeTracer::new();
        for _ in 0..5 {
            tracer.edge(42);
        }
        tracer.edge(u64::MAX);
        let edges = tracer.into_edges();
        assert_eq!(edges[&42], 5);
        assert_eq!(edges[&EDGE_MASK], 1);
    }

    #[test]
    fn location_pairs_are_stable_edges() {
        let a = edges_from_locations(["main.c:1", "main.c:7", "main.c:1", "main.c:7"]);
        let b = edges_from_locations(["main.c:1", "main.c:7", "main.c:1", "main.c:7"]);
        assert_eq!(a, b);
        // entry->1, 1->7 (twice), 7->1
        assert_eq!(a.len(), 3);
        assert_eq!(a.values().sum::<u64>(), 4);
        assert!(a.keys().all(|edge| *edge <= EDGE_MASK));
        assert!(edges_from_locations(std::iter::empty()).is_empty());
    }

    #[test]
    fn instrumented_edges_match_traced_edges() {
        let listed = parse_instrumented_edges("main.c:1\nmain.c:1\tmain.c:7\n\nmain.c:7\tmain.c:1\nmain.c:7\tmain.c:9\n");
        assert_eq!(listed.len(), 4);
        let traced = edges_from_locations(["main.c:1", "main.c:7", "main.c:1"]);
        assert!(traced.keys().all(|edge| listed.contains(edge)));
    }
}

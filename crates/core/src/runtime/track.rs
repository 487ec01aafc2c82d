use crate::preset::Track;
use crate::types::Millis;

/// Cursor over a global track. Global tracks cycle forever and ignore steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalTrack {
    pub id: String,
    len: usize,
    cursor: usize,
    pub next_at: Millis,
}

impl GlobalTrack {
    pub fn new(track: &Track, at: Millis) -> Self {
        Self { id: track.id.clone(), len: track.nodes.len(), cursor: 0, next_at: at }
    }

    pub fn current(&self) -> Option<usize> {
        (self.len > 0).then_some(self.cursor)
    }

    pub fn advance(&mut self, next_at: Millis) {
        if self.len > 0 {
            self.cursor = (self.cursor + 1) % self.len;
        }
        self.next_at = next_at;
    }

    pub fn jump(&mut self, node: usize, at: Millis) -> bool {
        if node >= self.len {
            return false;
        }
        self.cursor = node;
        self.next_at = at;
        true
    }
}

/// Cursor over a mode track. Nodes run in ascending step order (declaration
/// order breaks ties) and the track is done after its last node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeTrack {
    pub id: String,
    order: Vec<usize>,
    steps: Vec<i32>,
    pos: usize,
    pub next_at: Millis,
}

impl ModeTrack {
    pub fn new(track: &Track, at: Millis) -> Self {
        let mut order: Vec<usize> = (0..track.nodes.len()).collect();
        order.sort_by_key(|&i| track.nodes[i].step());
        let steps = order.iter().map(|&i| track.nodes[i].step()).collect();
        Self { id: track.id.clone(), order, steps, pos: 0, next_at: at }
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn is_done(&self) -> bool {
        self.pos >= self.order.len()
    }

    /// Node index (into the track's declaration order) under the cursor.
    pub fn current(&self) -> Option<usize> {
        self.order.get(self.pos).copied()
    }

    pub fn current_step(&self) -> Option<i32> {
        self.steps.get(self.pos).copied()
    }

    pub fn advance(&mut self, next_at: Millis) {
        if !self.is_done() {
            self.pos += 1;
        }
        self.next_at = next_at;
    }

    pub fn reset(&mut self, at: Millis) {
        self.pos = 0;
        self.next_at = at;
    }

    pub fn jump(&mut self, node: usize, at: Millis) -> bool {
        match self.order.iter().position(|&i| i == node) {
            Some(p) => {
                self.pos = p;
                self.next_at = at;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expr;
    use crate::preset::{GatewayAction, GatewayNode, Node};

    fn track(steps: &[i32]) -> Track {
        Track {
            id: "t".into(),
            nodes: steps
                .iter()
                .enumerate()
                .map(|(i, &step)| {
                    Node::Gateway(GatewayNode {
                        id: format!("n{}", i),
                        step,
                        gap_ms: None,
                        condition: Expr::Const(false),
                        action: GatewayAction::End,
                        reset_metrics: false,
                    })
                })
                .collect(),
        }
    }

    #[test]
    fn global_cycles() {
        let mut g = GlobalTrack::new(&track(&[0, 0, 0]), 0);
        assert_eq!(g.current(), Some(0));
        g.advance(10);
        g.advance(20);
        g.advance(30);
        assert_eq!(g.current(), Some(0));
        assert_eq!(g.next_at, 30);
        assert!(!g.jump(3, 0));
        assert_eq!(GlobalTrack::new(&track(&[]), 0).current(), None);
    }

    #[test]
    fn mode_track_orders_by_step_stably() {
        let mut m = ModeTrack::new(&track(&[2, 1, 2, 1]), 0);
        let mut seen = Vec::new();
        while let Some(n) = m.current() {
            seen.push((n, m.current_step().unwrap()));
            m.advance(0);
        }
        assert_eq!(seen, vec![(1, 1), (3, 1), (0, 2), (2, 2)]);
        assert!(m.is_done());
        m.reset(5);
        assert_eq!(m.current(), Some(1));
        assert!(m.jump(2, 7));
        assert_eq!(m.current_step(), Some(2));
        assert_eq!(m.next_at, 7);
    }
}

//! In-memory ordering service connecting several [`SharedTree`]s.

use std::collections::VecDeque;

use shared_tree::{OutboundOp, SequencedOp, SessionId, SharedTree, SharedTreeOptions};

pub struct TestTreeProvider {
    pub trees: Vec<SharedTree>,
    /// Last sequence number processed by each tree.
    cursors: Vec<u64>,
    /// Every sequenced op; the op with sequence number `n` is at `n - 1`.
    log: Vec<SequencedOp>,
    queue: VecDeque<OutboundOp>,
}

impl TestTreeProvider {
    pub fn new(count: usize) -> Self {
        Self::with_options(count, SharedTreeOptions::default())
    }

    pub fn with_options(count: usize, options: SharedTreeOptions) -> Self {
        let trees = (0..count)
            .map(|i| SharedTree::new(SessionId::from_raw(i as u64 + 1), options.clone()))
            .collect();
        Self {
            trees,
            cursors: vec![0; count],
            log: Vec::new(),
            queue: VecDeque::new(),
        }
    }

    pub fn last_sequence_number(&self) -> u64 {
        self.log.len() as u64
    }

    /// Adds a tree that has seen everything up to `reference_sequence_number`.
    pub fn join(&mut self, tree: SharedTree, reference_sequence_number: u64) -> usize {
        self.trees.push(tree);
        self.cursors.push(reference_sequence_number);
        self.trees.len() - 1
    }

    /// Moves every tree's submitted ops into the service queue.
    pub fn collect(&mut self) {
        for tree in &mut self.trees {
            self.queue.extend(tree.take_outbound());
        }
    }

    /// No session may reference anything older than its last processed op or
    /// the reference of an op of it still in flight.
    fn minimum_sequence_number(&self) -> u64 {
        let processed = self.cursors.iter().copied().min().unwrap_or(0);
        let in_flight = self
            .queue
            .iter()
            .map(|op| op.reference_sequence_number)
            .min()
            .unwrap_or(u64::MAX);
        processed.min(in_flight)
    }

    /// Sequences up to `count` queued ops.
    pub fn sequence(&mut self, count: usize) {
        self.collect();
        for _ in 0..count {
            let msn = self.minimum_sequence_number();
            let Some(op) = self.queue.pop_front() else {
                return;
            };
            let sequence_number = self.last_sequence_number() + 1;
            self.log.push(op.sequenced(sequence_number, msn));
        }
    }

    pub fn sequence_all(&mut self) {
        self.collect();
        self.sequence(self.queue.len());
    }

    /// Delivers up to `count` ops to tree `index`.
    pub fn process(&mut self, index: usize, count: usize) {
        // Ops submitted before processing reference the older state.
        self.collect();
        for _ in 0..count {
            let next = self.cursors[index] as usize;
            let Some(op) = self.log.get(next).cloned() else {
                return;
            };
            self.trees[index]
                .process_sequenced(op)
                .expect("sequenced op should process");
            self.cursors[index] += 1;
        }
    }

    pub fn process_all(&mut self, index: usize) {
        let pending = self.log.len() - self.cursors[index] as usize;
        self.process(index, pending);
    }

    pub fn pending(&self, index: usize) -> usize {
        self.log.len() - self.cursors[index] as usize
    }

    /// Submits, sequences and delivers everything.
    pub fn ensure_synchronized(&mut self) {
        loop {
            self.collect();
            if self.queue.is_empty() && (0..self.trees.len()).all(|i| self.pending(i) == 0) {
                return;
            }
            self.sequence_all();
            for index in 0..self.trees.len() {
                self.process_all(index);
            }
        }
    }

    /// Broadcasts the current minimum sequence number without an op.
    pub fn advance_minimum_sequence_number(&mut self) {
        let msn = self.minimum_sequence_number();
        for tree in &mut self.trees {
            tree.advance_minimum_sequence_number(msn);
        }
    }
}

use std::{
    cmp::Reverse,
    collections::{BTreeMap, BinaryHeap},
};

use hashbrown::HashMap;
use tokio::time::Instant;

use crate::wire::BlockInfo;

/// Outstanding block requests of one peer, with their deadlines.
///
/// Deadlines live in a min-heap. Removing a request does not touch the heap,
/// stale heap entries are skipped when they are popped.
#[derive(Debug, Default)]
pub(crate) struct RequestManager {
    timeouts: BinaryHeap<(Reverse<Instant>, BlockInfo)>,
    /// Requests grouped by piece.
    requests: BTreeMap<usize, Vec<BlockInfo>>,
    deadlines: HashMap<BlockInfo, Instant>,
}

impl RequestManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    /// Returns false if the block was already requested.
    pub fn add_request(&mut self, block: BlockInfo, deadline: Instant) -> bool {
        if self.deadlines.contains_key(&block) {
            return false;
        }

        self.requests.entry(block.piece()).or_default().push(block.clone());
        self.deadlines.insert(block.clone(), deadline);
        self.timeouts.push((Reverse(deadline), block));

        true
    }

    /// Return true if the request existed.
    pub fn remove_request(&mut self, block: &BlockInfo) -> bool {
        if self.deadlines.remove(block).is_none() {
            return false;
        }

        let piece = block.piece();
        if let Some(blocks) = self.requests.get_mut(&piece) {
            blocks.retain(|b| b != block);
            if blocks.is_empty() {
                self.requests.remove(&piece);
            }
        }

        true
    }

    /// Remove and return the requests whose deadline is `now` or earlier,
    /// oldest first.
    pub fn take_timed_out(&mut self, now: Instant) -> Vec<BlockInfo> {
        let mut timed_out = Vec::new();

        while let Some((Reverse(deadline), _)) = self.timeouts.peek() {
            if *deadline > now {
                break;
            }
            let Some((Reverse(deadline), block)) = self.timeouts.pop() else {
                break;
            };

            // the request was removed, or requested again later
            if self.deadlines.get(&block) != Some(&deadline) {
                continue;
            }

            self.remove_request(&block);
            timed_out.push(block);
        }

        timed_out
    }

    /// Take every request, in piece order.
    pub fn drain(&mut self) -> Vec<BlockInfo> {
        self.timeouts.clear();
        self.deadlines.clear();
        std::mem::take(&mut self.requests).into_values().flatten().collect()
    }
}

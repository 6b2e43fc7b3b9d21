//! Sliding window over a channel's in-memory timeline plus the storage
//! fetch state for each edge.
//!
//! Each `(channel, direction)` pair is either `HasMore` or `Exhausted`, and
//! has at most one fetch in flight. A fetch that returns zero rows exhausts
//! the edge until the channel is reset; a failed fetch leaves the state as
//! it was.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use shared::domain::ChannelId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Older,
    Newer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeStatus {
    HasMore,
    Exhausted,
}

/// Half-open range `[start, end)` of chronological timeline positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Window {
    pub start: usize,
    pub end: usize,
}

impl Window {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPlan {
    pub channel_id: ChannelId,
    pub direction: Direction,
    /// Newest-first row offset; only meaningful for `Direction::Older`.
    pub offset: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, Copy)]
struct Edge {
    status: EdgeStatus,
    in_flight: bool,
    offset: usize,
}

impl Default for Edge {
    fn default() -> Self {
        Self {
            status: EdgeStatus::HasMore,
            in_flight: false,
            offset: 0,
        }
    }
}

#[derive(Debug, Default)]
struct ChannelPager {
    /// End of the window; `None` follows the newest message.
    anchor: Option<usize>,
    /// Set once the newest page has been fetched, whatever it returned.
    first_page_loaded: bool,
    older: Edge,
    newer: Edge,
}

impl ChannelPager {
    fn edge(&self, direction: Direction) -> &Edge {
        match direction {
            Direction::Older => &self.older,
            Direction::Newer => &self.newer,
        }
    }

    fn edge_mut(&mut self, direction: Direction) -> &mut Edge {
        match direction {
            Direction::Older => &mut self.older,
            Direction::Newer => &mut self.newer,
        }
    }
}

#[derive(Debug)]
pub struct Pagination {
    page_size: usize,
    window_size: usize,
    channels: HashMap<ChannelId, ChannelPager>,
}

impl Pagination {
    pub fn new(page_size: usize, window_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            window_size: window_size.max(1),
            channels: HashMap::new(),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Back to the tail with both edges `HasMore`. Offsets and in-flight
    /// flags survive: the timeline itself is kept across channel switches,
    /// and a fetch started before the reset is still allowed to land.
    pub fn reset(&mut self, channel_id: &ChannelId) {
        let pager = self.channels.entry(channel_id.clone()).or_default();
        pager.anchor = None;
        pager.older.status = EdgeStatus::HasMore;
        pager.newer.status = EdgeStatus::HasMore;
    }

    pub fn window(&self, channel_id: &ChannelId, loaded: usize) -> Window {
        let anchor = self.channels.get(channel_id).and_then(|pager| pager.anchor);
        let end = anchor.map_or(loaded, |end| end.min(loaded));
        Window {
            start: end.saturating_sub(self.window_size),
            end,
        }
    }

    /// Moves the window by `rows` and returns the new window. Reaching the
    /// newest message switches back to following the tail.
    pub fn scroll(
        &mut self,
        channel_id: &ChannelId,
        direction: Direction,
        rows: usize,
        loaded: usize,
    ) -> Window {
        let current = self.window(channel_id, loaded);
        let floor = self.window_size.min(loaded);
        let next_end = match direction {
            Direction::Older => current.end.saturating_sub(rows).max(floor),
            Direction::Newer => current.end.saturating_add(rows),
        };
        let pager = self.channels.entry(channel_id.clone()).or_default();
        pager.anchor = (next_end < loaded).then_some(next_end);
        self.window(channel_id, loaded)
    }

    /// True when the window is within one window length of the loaded edge.
    pub fn near_edge(&self, channel_id: &ChannelId, direction: Direction, loaded: usize) -> bool {
        let window = self.window(channel_id, loaded);
        match direction {
            Direction::Older => window.start < self.window_size,
            Direction::Newer => loaded - window.end < self.window_size,
        }
    }

    /// Reserves the edge for one fetch. `None` when a fetch is already in
    /// flight or the edge is exhausted.
    pub fn begin_fetch(&mut self, channel_id: &ChannelId, direction: Direction) -> Option<FetchPlan> {
        let page_size = self.page_size;
        let edge = self
            .channels
            .entry(channel_id.clone())
            .or_default()
            .edge_mut(direction);
        if edge.in_flight || edge.status == EdgeStatus::Exhausted {
            return None;
        }
        edge.in_flight = true;
        Some(FetchPlan {
            channel_id: channel_id.clone(),
            direction,
            offset: edge.offset,
            limit: page_size,
        })
    }

    /// Settles a successful fetch that returned `rows` rows.
    pub fn finish_fetch(&mut self, plan: &FetchPlan, rows: usize) -> EdgeStatus {
        let page_size = self.page_size;
        let edge = self
            .channels
            .entry(plan.channel_id.clone())
            .or_default()
            .edge_mut(plan.direction);
        edge.in_flight = false;
        let first_page = plan.direction == Direction::Older && plan.offset == 0;
        if rows == 0 {
            edge.status = EdgeStatus::Exhausted;
        } else if plan.direction == Direction::Older {
            edge.offset = plan.offset + page_size;
        }
        let status = edge.status;
        if first_page {
            if let Some(pager) = self.channels.get_mut(&plan.channel_id) {
                pager.first_page_loaded = true;
            }
        }
        status
    }

    /// Whether the channel's newest page was fetched. Live rows landing in
    /// the timeline beforehand do not count.
    pub fn first_page_loaded(&self, channel_id: &ChannelId) -> bool {
        self.channels
            .get(channel_id)
            .is_some_and(|pager| pager.first_page_loaded)
    }

    /// Releases the edge after a failed fetch without touching its status.
    pub fn abort_fetch(&mut self, plan: &FetchPlan) {
        if let Some(pager) = self.channels.get_mut(&plan.channel_id) {
            pager.edge_mut(plan.direction).in_flight = false;
        }
    }

    /// Keeps an anchored window on the same messages after `inserted` rows
    /// landed before it.
    pub fn shift_anchor(&mut self, channel_id: &ChannelId, inserted: usize) {
        if let Some(anchor) = self
            .channels
            .get_mut(channel_id)
            .and_then(|pager| pager.anchor.as_mut())
        {
            *anchor += inserted;
        }
    }

    pub fn status(&self, channel_id: &ChannelId, direction: Direction) -> EdgeStatus {
        self.channels
            .get(channel_id)
            .map_or(EdgeStatus::HasMore, |pager| pager.edge(direction).status)
    }

    pub fn in_flight(&self, channel_id: &ChannelId, direction: Direction) -> bool {
        self.channels
            .get(channel_id)
            .is_some_and(|pager| pager.edge(direction).in_flight)
    }

    pub fn forget(&mut self, channel_id: &ChannelId) {
        self.channels.remove(channel_id);
    }

    pub fn clear(&mut self) {
        self.channels.clear();
    }
}

#[cfg(test)]
#[path = "tests/pagination_tests.rs"]
mod tests;

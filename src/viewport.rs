//! Viewport windowing over large uniform-height row lists.
//!
//! The visible range is a closed-form function of the window state - O(1)
//! regardless of item count, so redraw cost is bounded by the visible window
//! size, never by the data size.

use std::collections::HashMap;

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ViewportError {
    #[error("index {index} out of range for {len} items")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("invalid viewport parameter: {0}")]
    InvalidParameter(&'static str),
}

/// Vertical alignment target for [`ViewportWindow::scroll_to_index`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Align {
    Start,
    Center,
    End,
}

/// Inclusive range of row indices to render.
///
/// Invariant: `start <= end < item_count` for the window that produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VisibleRange {
    pub start: usize,
    pub end: usize,
}

impl VisibleRange {
    pub fn len(&self) -> usize {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, index: usize) -> bool {
        index >= self.start && index <= self.end
    }
}

/// Immutable snapshot of viewport state. Recomputed per scroll event; the
/// visible range is a pure function of these five fields.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ViewportWindow {
    item_count: usize,
    item_height: f64,
    viewport_height: f64,
    scroll_offset: f64,
    overscan: usize,
}

impl ViewportWindow {
    pub fn new(
        item_count: usize,
        item_height: f64,
        viewport_height: f64,
        scroll_offset: f64,
        overscan: usize,
    ) -> Result<Self, ViewportError> {
        if !item_height.is_finite() || item_height <= 0.0 {
            return Err(ViewportError::InvalidParameter(
                "item_height must be finite and > 0",
            ));
        }
        if !viewport_height.is_finite() || viewport_height < 0.0 {
            return Err(ViewportError::InvalidParameter(
                "viewport_height must be finite and >= 0",
            ));
        }
        if !scroll_offset.is_finite() || scroll_offset < 0.0 {
            return Err(ViewportError::InvalidParameter(
                "scroll_offset must be finite and >= 0",
            ));
        }
        Ok(Self {
            item_count,
            item_height,
            viewport_height,
            scroll_offset,
            overscan,
        })
    }

    pub fn item_count(&self) -> usize {
        self.item_count
    }

    pub fn item_height(&self) -> f64 {
        self.item_height
    }

    pub fn viewport_height(&self) -> f64 {
        self.viewport_height
    }

    pub fn scroll_offset(&self) -> f64 {
        self.scroll_offset
    }

    pub fn total_content_height(&self) -> f64 {
        self.item_count as f64 * self.item_height
    }

    /// Same window at a different scroll offset. Offsets are clamped at zero;
    /// offsets past the end of the content are tolerated (the range saturates).
    pub fn with_scroll_offset(mut self, scroll_offset: f64) -> Self {
        self.scroll_offset = if scroll_offset.is_finite() {
            scroll_offset.max(0.0)
        } else {
            0.0
        };
        self
    }

    pub fn with_item_count(mut self, item_count: usize) -> Self {
        self.item_count = item_count;
        self
    }

    /// Compute the rows to render: every row intersecting the viewport plus
    /// `overscan` rows on each side, clamped into `[0, item_count)`.
    ///
    /// Returns `None` iff `item_count == 0`.
    pub fn visible_range(&self) -> Option<VisibleRange> {
        if self.item_count == 0 {
            return None;
        }
        let raw_start = (self.scroll_offset / self.item_height).floor() as usize;
        let visible_count = (self.viewport_height / self.item_height).ceil() as usize;

        let last = self.item_count - 1;
        let start = raw_start.saturating_sub(self.overscan).min(last);
        let end = raw_start
            .saturating_add(visible_count)
            .saturating_add(self.overscan)
            .min(last);
        Some(VisibleRange {
            start: start.min(end),
            end,
        })
    }

    /// Scroll offset that places `target` at the requested viewport alignment,
    /// clamped into `[0, max(0, total - viewport_height)]`. Idempotent.
    pub fn scroll_to_index(&self, target: usize, align: Align) -> Result<f64, ViewportError> {
        if target >= self.item_count {
            return Err(ViewportError::IndexOutOfRange {
                index: target,
                len: self.item_count,
            });
        }
        let top = target as f64 * self.item_height;
        let raw = match align {
            Align::Start => top,
            Align::Center => top - self.viewport_height / 2.0 + self.item_height / 2.0,
            Align::End => top - self.viewport_height + self.item_height,
        };
        let max_offset = (self.total_content_height() - self.viewport_height).max(0.0);
        Ok(raw.clamp(0.0, max_offset))
    }
}

/// Row descriptor handed to the rendering layer: absolute position plus the
/// source datum.
#[derive(Clone, Debug, PartialEq)]
pub struct RowDescriptor<T> {
    pub index: usize,
    pub top: f64,
    pub height: f64,
    pub data: T,
}

/// What the rendering layer consumes: the descriptors for the current
/// visible+overscan range plus the total scrollable height.
#[derive(Clone, Debug, PartialEq)]
pub struct VisibleItems<T> {
    pub rows: Vec<RowDescriptor<T>>,
    pub total_height: f64,
}

/// Bounded cache of row descriptors, keyed by row index.
///
/// Never the source of truth: every entry is rebuildable from the item slice,
/// and dropping the whole cache is always safe. Eviction is a separate
/// periodic sweep, not a side effect of lookups.
#[derive(Debug)]
pub struct RenderCache<T> {
    rows: HashMap<usize, RowDescriptor<T>>,
}

impl<T> Default for RenderCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RenderCache<T> {
    pub fn new() -> Self {
        Self {
            rows: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }

    pub fn contains(&self, index: usize) -> bool {
        self.rows.contains_key(&index)
    }

    /// Drop every entry outside `[start - buffer, end + buffer]`.
    pub fn evict_outside_range(&mut self, start: usize, end: usize, buffer: usize) {
        let low = start.saturating_sub(buffer);
        let high = end.saturating_add(buffer);
        self.rows.retain(|&index, _| index >= low && index <= high);
    }
}

impl<T: Clone + PartialEq> RenderCache<T> {
    /// Return the cached descriptor for `index` if its source datum is
    /// unchanged, otherwise build one from `items` and store it.
    ///
    /// The caller must re-clamp the visible range after an item-count shrink
    /// before requesting indices; a manifestly out-of-range index is a
    /// programmer error and reported as such.
    pub fn get_or_build(
        &mut self,
        window: &ViewportWindow,
        index: usize,
        items: &[T],
    ) -> Result<&RowDescriptor<T>, ViewportError> {
        if index >= items.len() || index >= window.item_count() {
            return Err(ViewportError::IndexOutOfRange {
                index,
                len: items.len().min(window.item_count()),
            });
        }
        let stale = match self.rows.get(&index) {
            Some(row) => row.data != items[index],
            None => true,
        };
        if stale {
            self.rows.insert(
                index,
                RowDescriptor {
                    index,
                    top: index as f64 * window.item_height(),
                    height: window.item_height(),
                    data: items[index].clone(),
                },
            );
        }
        Ok(&self.rows[&index])
    }

    /// Descriptors for the window's whole visible range, built or reused
    /// per row. An empty list yields no rows and zero height.
    pub fn visible_items(
        &mut self,
        window: &ViewportWindow,
        items: &[T],
    ) -> Result<VisibleItems<T>, ViewportError> {
        let mut rows = Vec::new();
        if let Some(range) = window.visible_range() {
            rows.reserve(range.len());
            for index in range.start..=range.end {
                rows.push(self.get_or_build(window, index, items)?.clone());
            }
        }
        Ok(VisibleItems {
            rows,
            total_height: window.total_content_height(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn window(
        item_count: usize,
        item_height: f64,
        viewport_height: f64,
        scroll_offset: f64,
        overscan: usize,
    ) -> ViewportWindow {
        ViewportWindow::new(item_count, item_height, viewport_height, scroll_offset, overscan)
            .unwrap()
    }

    #[test]
    fn rejects_invalid_parameters() {
        assert!(ViewportWindow::new(10, 0.0, 100.0, 0.0, 0).is_err());
        assert!(ViewportWindow::new(10, -1.0, 100.0, 0.0, 0).is_err());
        assert!(ViewportWindow::new(10, f64::NAN, 100.0, 0.0, 0).is_err());
        assert!(ViewportWindow::new(10, 40.0, -1.0, 0.0, 0).is_err());
        assert!(ViewportWindow::new(10, 40.0, 100.0, -1.0, 0).is_err());
        assert!(ViewportWindow::new(10, 40.0, 100.0, 0.0, 0).is_ok());
    }

    #[test]
    fn empty_list_has_no_range() {
        assert_eq!(window(0, 40.0, 800.0, 0.0, 5).visible_range(), None);
    }

    #[test]
    fn star_chart_scenario() {
        // 10000 rows of 40px, 800px viewport, offset 4000, overscan 5.
        let range = window(10_000, 40.0, 800.0, 4_000.0, 5)
            .visible_range()
            .unwrap();
        assert_eq!(range.start, 95);
        assert_eq!(range.end, 125);
        assert_eq!(range.len(), 31);
    }

    #[test]
    fn range_clamps_at_top() {
        let range = window(100, 40.0, 800.0, 0.0, 5).visible_range().unwrap();
        assert_eq!(range.start, 0);
        assert_eq!(range.end, 25);
    }

    #[test]
    fn range_saturates_at_bottom() {
        let range = window(30, 40.0, 800.0, 1_000.0, 5).visible_range().unwrap();
        assert_eq!(range.end, 29);
        assert!(range.start <= range.end);
    }

    #[test]
    fn overscroll_far_past_content_still_yields_valid_range() {
        let range = window(10, 40.0, 800.0, 1.0e9, 5).visible_range().unwrap();
        assert_eq!(range.start, 9);
        assert_eq!(range.end, 9);
    }

    #[test]
    fn zero_height_viewport_renders_overscan_only() {
        let range = window(100, 40.0, 0.0, 400.0, 2).visible_range().unwrap();
        assert_eq!(range.start, 8);
        assert_eq!(range.end, 12);
    }

    #[test]
    fn scroll_to_index_alignments() {
        let w = window(100, 40.0, 800.0, 0.0, 0);
        assert_eq!(w.scroll_to_index(50, Align::Start).unwrap(), 2_000.0);
        assert_eq!(w.scroll_to_index(50, Align::Center).unwrap(), 1_620.0);
        assert_eq!(w.scroll_to_index(50, Align::End).unwrap(), 1_240.0);
    }

    #[test]
    fn scroll_to_index_clamps_to_content() {
        let w = window(100, 40.0, 800.0, 0.0, 0);
        assert_eq!(w.scroll_to_index(0, Align::End).unwrap(), 0.0);
        assert_eq!(w.scroll_to_index(99, Align::Start).unwrap(), 3_200.0);
    }

    #[test]
    fn scroll_to_index_short_content_pins_to_zero() {
        let w = window(5, 40.0, 800.0, 0.0, 0);
        assert_eq!(w.scroll_to_index(4, Align::End).unwrap(), 0.0);
    }

    #[test]
    fn scroll_to_index_rejects_out_of_range() {
        let w = window(100, 40.0, 800.0, 0.0, 0);
        assert_eq!(
            w.scroll_to_index(100, Align::Start),
            Err(ViewportError::IndexOutOfRange {
                index: 100,
                len: 100
            })
        );
    }

    #[test]
    fn scroll_to_index_is_idempotent() {
        let w = window(1_000, 40.0, 800.0, 0.0, 3);
        let first = w.scroll_to_index(321, Align::Center).unwrap();
        let moved = w.with_scroll_offset(first);
        let second = moved.scroll_to_index(321, Align::Center).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn cache_reuses_until_datum_changes() {
        let w = window(10, 40.0, 800.0, 0.0, 0);
        let mut cache = RenderCache::new();
        let mut items: Vec<String> = (0..10).map(|i| format!("row-{i}")).collect();

        let row = cache.get_or_build(&w, 3, &items).unwrap().clone();
        assert_eq!(row.top, 120.0);
        assert_eq!(row.data, "row-3");

        // Same datum: identical descriptor back.
        let again = cache.get_or_build(&w, 3, &items).unwrap().clone();
        assert_eq!(again, row);

        // Datum changed: descriptor rebuilt.
        items[3] = "edited".to_string();
        let rebuilt = cache.get_or_build(&w, 3, &items).unwrap();
        assert_eq!(rebuilt.data, "edited");
    }

    #[test]
    fn cache_rejects_out_of_range_index() {
        let w = window(10, 40.0, 800.0, 0.0, 0);
        let mut cache = RenderCache::new();
        let items: Vec<u32> = (0..10).collect();
        assert!(matches!(
            cache.get_or_build(&w, 10, &items),
            Err(ViewportError::IndexOutOfRange { .. })
        ));
    }

    #[test]
    fn visible_items_covers_the_range_with_total_height() {
        let w = window(10_000, 40.0, 800.0, 4_000.0, 5);
        let mut cache = RenderCache::new();
        let items: Vec<u32> = (0..10_000).collect();

        let visible = cache.visible_items(&w, &items).unwrap();
        assert_eq!(visible.rows.len(), 31);
        assert_eq!(visible.rows[0].index, 95);
        assert_eq!(visible.rows[0].top, 3_800.0);
        assert_eq!(visible.rows[30].index, 125);
        assert_eq!(visible.total_height, 400_000.0);
        assert_eq!(cache.len(), 31);
    }

    #[test]
    fn visible_items_on_empty_list() {
        let w = window(0, 40.0, 800.0, 0.0, 5);
        let mut cache: RenderCache<u32> = RenderCache::new();
        let visible = cache.visible_items(&w, &[]).unwrap();
        assert!(visible.rows.is_empty());
        assert_eq!(visible.total_height, 0.0);
    }

    #[test]
    fn eviction_keeps_only_buffered_range() {
        let w = window(100, 40.0, 800.0, 0.0, 0);
        let mut cache = RenderCache::new();
        let items: Vec<u32> = (0..100).collect();
        for i in 0..60 {
            cache.get_or_build(&w, i, &items).unwrap();
        }

        cache.evict_outside_range(20, 30, 5);

        assert_eq!(cache.len(), 21);
        for i in 0..100 {
            assert_eq!(cache.contains(i), (15..=35).contains(&i));
        }

        // Evicted entries rebuild to an equal descriptor.
        let rebuilt = cache.get_or_build(&w, 40, &items).unwrap();
        assert_eq!(rebuilt.top, 1_600.0);
        assert_eq!(rebuilt.data, 40);
    }

    proptest! {
        #[test]
        fn range_invariants_hold(
            item_count in 0usize..5_000,
            item_height in 1.0f64..200.0,
            viewport_height in 0.0f64..4_000.0,
            scroll_offset in 0.0f64..1.0e7,
            overscan in 0usize..20,
        ) {
            let w = window(item_count, item_height, viewport_height, scroll_offset, overscan);
            match w.visible_range() {
                None => prop_assert_eq!(item_count, 0),
                Some(range) => {
                    prop_assert!(item_count > 0);
                    prop_assert!(range.start <= range.end);
                    prop_assert!(range.end < item_count);
                    prop_assert!(range.len() <= item_count);

                    // Every row intersecting the viewport is in the range.
                    let lo = scroll_offset;
                    let hi = scroll_offset + viewport_height;
                    for index in 0..item_count {
                        let top = index as f64 * item_height;
                        let bottom = top + item_height;
                        if bottom > lo && top < hi {
                            prop_assert!(range.contains(index));
                        }
                    }
                }
            }
        }

        #[test]
        fn scroll_to_index_stays_in_bounds(
            item_count in 1usize..5_000,
            item_height in 1.0f64..200.0,
            viewport_height in 0.0f64..4_000.0,
            target in 0usize..5_000,
        ) {
            let target = target % item_count;
            let w = window(item_count, item_height, viewport_height, 0.0, 0);
            for align in [Align::Start, Align::Center, Align::End] {
                let offset = w.scroll_to_index(target, align).unwrap();
                prop_assert!(offset >= 0.0);
                let max = (w.total_content_height() - viewport_height).max(0.0);
                prop_assert!(offset <= max);
            }
        }
    }
}

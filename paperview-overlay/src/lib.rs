use paperview_core::{
    compose, BoundingRect, Highlight, RenderOutput, Selection, TextRun, Viewport,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_HIGHLIGHT_COLOR: &str = "#ffeb3b";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodeRect {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

impl NodeRect {
    pub fn contains(&self, x: f32, y: f32) -> bool {
        x >= self.left && x <= self.left + self.width && y >= self.top && y <= self.top + self.height
    }
}

/// Visual marker applied to a node by a matched highlight. Carries the
/// highlight's id so a click on the decorated run can be reported back as an
/// annotation anchor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decoration {
    pub annotation_id: String,
    pub color: String,
}

/// One invisible, selectable span aligned to the rendered bitmap. Rendered at
/// zero opacity by the host; geometry is still hit-testable for pointer and
/// selection events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlayNode {
    pub text: String,
    pub rect: NodeRect,
    pub font_size: f32,
    pub source_index: usize,
    pub decoration: Option<Decoration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextLayer {
    pub page_index: usize,
    pub generation: u64,
    pub width: u32,
    pub height: u32,
    pub nodes: Vec<OverlayNode>,
}

impl TextLayer {
    /// Builds the full descriptor list for one committed render. The layer and
    /// the bitmap come from the same `RenderOutput`, so they share one
    /// viewport snapshot and the container always matches the bitmap's pixel
    /// dimensions.
    pub fn build(output: &RenderOutput) -> Self {
        let nodes = output
            .runs
            .iter()
            .map(|run| node_for_run(run, &output.viewport))
            .collect();
        Self {
            page_index: output.page_index,
            generation: output.generation,
            width: output.bitmap.width,
            height: output.bitmap.height,
            nodes,
        }
    }

    pub fn page_number(&self) -> usize {
        self.page_index + 1
    }
}

fn node_for_run(run: &TextRun, viewport: &Viewport) -> OverlayNode {
    let composed = compose(&viewport.transform, &run.transform);
    let font_size = (composed[2] * composed[2] + composed[3] * composed[3]).sqrt();
    OverlayNode {
        text: run.text.clone(),
        rect: NodeRect {
            left: composed[4],
            top: composed[5],
            width: run.width * viewport.scale,
            height: run.height * viewport.scale,
        },
        font_size,
        source_index: run.source_index,
        decoration: None,
    }
}

/// Resolves a pointer position over the overlay to the annotation whose
/// decorated run was clicked, if any.
pub fn annotation_at(layer: &TextLayer, x: f32, y: f32) -> Option<&str> {
    layer
        .nodes
        .iter()
        .find(|node| node.decoration.is_some() && node.rect.contains(x, y))
        .and_then(|node| node.decoration.as_ref())
        .map(|decoration| decoration.annotation_id.as_str())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OverlayPatch {
    Unchanged,
    /// Geometry is identical; only these nodes' decoration changed.
    Decorations(Vec<(usize, Option<Decoration>)>),
    Rebuild,
}

/// Diffs two built layers so the host can re-render decorations without
/// tearing down the whole overlay tree.
pub fn diff(prev: &TextLayer, next: &TextLayer) -> OverlayPatch {
    if prev.generation != next.generation
        || prev.page_index != next.page_index
        || prev.width != next.width
        || prev.height != next.height
        || prev.nodes.len() != next.nodes.len()
    {
        return OverlayPatch::Rebuild;
    }
    let geometry_changed = prev.nodes.iter().zip(&next.nodes).any(|(a, b)| {
        a.text != b.text || a.rect != b.rect || a.source_index != b.source_index
    });
    if geometry_changed {
        return OverlayPatch::Rebuild;
    }
    let changes: Vec<(usize, Option<Decoration>)> = prev
        .nodes
        .iter()
        .zip(&next.nodes)
        .enumerate()
        .filter(|(_, (a, b))| a.decoration != b.decoration)
        .map(|(index, (_, b))| (index, b.decoration.clone()))
        .collect();
    if changes.is_empty() {
        OverlayPatch::Unchanged
    } else {
        OverlayPatch::Decorations(changes)
    }
}

/// Decorates every node whose text contains a highlight's `match_text` as a
/// substring (case-sensitive, exact whitespace). A highlight whose text spans
/// a run boundary matches neither fragment; downstream annotation anchoring
/// depends on that exact behavior. When several highlights hit the same node,
/// the last-applied color wins. Returns the number of decorated nodes.
pub fn apply_highlights(nodes: &mut [OverlayNode], highlights: &[Highlight]) -> usize {
    let mut decorated = 0;
    for node in nodes.iter_mut() {
        node.decoration = None;
        for highlight in highlights {
            if highlight.match_text.is_empty() {
                continue;
            }
            if node.text.contains(&highlight.match_text) {
                node.decoration = Some(Decoration {
                    annotation_id: highlight.id.clone(),
                    color: highlight
                        .color
                        .clone()
                        .unwrap_or_else(|| DEFAULT_HIGHLIGHT_COLOR.to_string()),
                });
            }
        }
        if node.decoration.is_some() {
            decorated += 1;
        }
    }
    decorated
}

/// A live selection range over the overlay, in (node index, char offset)
/// coordinates on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunRange {
    pub start_run: usize,
    pub start_offset: usize,
    pub end_run: usize,
    pub end_offset: usize,
}

impl RunRange {
    pub fn is_collapsed(&self) -> bool {
        self.start_run == self.end_run && self.start_offset == self.end_offset
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectionChange {
    Selected(Selection),
    Cleared,
}

/// Two-state machine: Idle (no active selection) and Selected. A committed
/// pointer-up with non-whitespace text emits one `Selected`; a collapse or an
/// explicit clear emits one `Cleared`. Whitespace-only selections never emit.
#[derive(Debug, Default)]
pub struct SelectionController {
    selected: bool,
}

impl SelectionController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_selected(&self) -> bool {
        self.selected
    }

    /// Commit point: the pointer went up with the platform selection in the
    /// given state. `None` or a collapsed range counts as a collapse.
    pub fn pointer_up(
        &mut self,
        layer: &TextLayer,
        range: Option<&RunRange>,
    ) -> Option<SelectionChange> {
        let Some(range) = range.filter(|range| !range.is_collapsed()) else {
            return self.collapse();
        };
        let Some(selection) = resolve_selection(layer, range) else {
            debug!(page = layer.page_number(), "ignoring whitespace-only selection");
            return None;
        };
        self.selected = true;
        Some(SelectionChange::Selected(selection))
    }

    /// The platform selection collapsed outside of a pointer-up.
    pub fn selection_collapsed(&mut self) -> Option<SelectionChange> {
        self.collapse()
    }

    /// The host explicitly cleared the selection context.
    pub fn clear(&mut self) -> Option<SelectionChange> {
        self.collapse()
    }

    fn collapse(&mut self) -> Option<SelectionChange> {
        if self.selected {
            self.selected = false;
            Some(SelectionChange::Cleared)
        } else {
            None
        }
    }
}

fn resolve_selection(layer: &TextLayer, range: &RunRange) -> Option<Selection> {
    if layer.nodes.is_empty() {
        return None;
    }
    let last = layer.nodes.len() - 1;
    let (mut start, mut end) = (
        (range.start_run.min(last), range.start_offset),
        (range.end_run.min(last), range.end_offset),
    );
    if start > end {
        std::mem::swap(&mut start, &mut end);
    }
    let ((start_run, start_offset), (end_run, end_offset)) = (start, end);

    let mut text = String::new();
    let mut rect: Option<BoundingRect> = None;
    for (run, node) in layer.nodes[start_run..=end_run].iter().enumerate() {
        let run = start_run + run;
        let from = if run == start_run { start_offset } else { 0 };
        let to = if run == end_run {
            Some(end_offset)
        } else {
            None
        };
        text.push_str(slice_chars(&node.text, from, to));

        let node_rect = BoundingRect::from_corners(
            node.rect.left,
            node.rect.top,
            node.rect.left + node.rect.width,
            node.rect.top + node.rect.height,
            layer.page_number(),
        );
        rect = Some(match rect {
            Some(existing) => existing.union(&node_rect),
            None => node_rect,
        });
    }

    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(Selection {
        text: trimmed.to_string(),
        page_number: layer.page_number(),
        bounding_rect: rect?,
    })
}

/// Char-offset slicing that never lands inside a UTF-8 boundary; offsets past
/// the end clamp to the end.
fn slice_chars(text: &str, from: usize, to: Option<usize>) -> &str {
    let start = byte_at_char(text, from);
    let end = to.map_or(text.len(), |to| byte_at_char(text, to));
    if start >= end {
        ""
    } else {
        &text[start..end]
    }
}

fn byte_at_char(text: &str, index: usize) -> usize {
    text.char_indices()
        .nth(index)
        .map_or(text.len(), |(byte, _)| byte)
}

#[cfg(test)]
mod tests {
    use super::*;
    use paperview_core::{Bitmap, PageSize, RenderOutput, TextRun, Viewport};

    fn run(text: &str, x: f32, y: f32, width: f32) -> TextRun {
        TextRun {
            text: text.to_string(),
            transform: [12.0, 0.0, 0.0, 12.0, x, y],
            width,
            height: 12.0,
            source_index: 0,
        }
    }

    fn output_with_runs(runs: Vec<TextRun>) -> RenderOutput {
        let viewport = Viewport::for_page(
            PageSize {
                width: 612.0,
                height: 792.0,
            },
            1.5,
        );
        let runs = runs
            .into_iter()
            .enumerate()
            .map(|(index, run)| TextRun {
                source_index: index,
                ..run
            })
            .collect();
        RenderOutput {
            generation: 1,
            page_index: 4,
            viewport,
            bitmap: Bitmap {
                width: viewport.width.round() as u32,
                height: viewport.height.round() as u32,
                pixels: Vec::new(),
            },
            runs,
        }
    }

    fn highlight(text: &str) -> Highlight {
        Highlight {
            id: format!("h-{text}"),
            match_text: text.to_string(),
            color: None,
        }
    }

    #[test]
    fn layer_container_matches_bitmap_dimensions() {
        let output = output_with_runs(vec![run("abc", 10.0, 10.0, 30.0)]);
        let layer = TextLayer::build(&output);
        assert_eq!(layer.width, output.bitmap.width);
        assert_eq!(layer.height, output.bitmap.height);
        assert_eq!(layer.width, 918);
        assert_eq!(layer.height, 1188);
    }

    #[test]
    fn node_position_composes_intrinsic_and_viewport_transforms() {
        let output = output_with_runs(vec![run("loss aversion", 72.0, 700.0, 96.0)]);
        let layer = TextLayer::build(&output);
        let node = &layer.nodes[0];
        assert_eq!(node.rect.left, 108.0);
        assert_eq!(node.rect.top, 1050.0);
        assert_eq!(node.rect.width, 144.0);
        assert_eq!(node.rect.height, 18.0);
        assert_eq!(node.font_size, 18.0);
    }

    #[test]
    fn highlight_matches_substring_within_a_single_run() {
        let output = output_with_runs(vec![
            run("neural basis of loss aversion has been", 0.0, 0.0, 200.0),
            run("unrelated text", 0.0, 20.0, 80.0),
        ]);
        let mut layer = TextLayer::build(&output);
        let decorated = apply_highlights(&mut layer.nodes, &[highlight("loss aversion")]);
        assert_eq!(decorated, 1);
        let decoration = layer.nodes[0].decoration.as_ref().unwrap();
        assert_eq!(decoration.color, DEFAULT_HIGHLIGHT_COLOR);
        assert_eq!(decoration.annotation_id, "h-loss aversion");
        assert!(layer.nodes[1].decoration.is_none());
    }

    #[test]
    fn highlight_split_across_two_runs_matches_neither() {
        let output = output_with_runs(vec![
            run("neural basis of loss ", 0.0, 0.0, 120.0),
            run("aversion has been", 0.0, 20.0, 100.0),
        ]);
        let mut layer = TextLayer::build(&output);
        let decorated = apply_highlights(&mut layer.nodes, &[highlight("loss aversion")]);
        assert_eq!(decorated, 0);
        assert!(layer.nodes.iter().all(|node| node.decoration.is_none()));
    }

    #[test]
    fn highlight_matching_is_case_and_whitespace_sensitive() {
        let output = output_with_runs(vec![run("Loss  aversion", 0.0, 0.0, 100.0)]);
        let mut layer = TextLayer::build(&output);
        assert_eq!(apply_highlights(&mut layer.nodes, &[highlight("loss aversion")]), 0);
        assert_eq!(apply_highlights(&mut layer.nodes, &[highlight("Loss  aversion")]), 1);
    }

    #[test]
    fn last_applied_highlight_color_wins() {
        let output = output_with_runs(vec![run("loss aversion framing", 0.0, 0.0, 150.0)]);
        let mut layer = TextLayer::build(&output);
        let highlights = vec![
            Highlight {
                id: "a".into(),
                match_text: "loss".into(),
                color: Some("#ff0000".into()),
            },
            Highlight {
                id: "b".into(),
                match_text: "aversion".into(),
                color: Some("#00ff00".into()),
            },
        ];
        apply_highlights(&mut layer.nodes, &highlights);
        let decoration = layer.nodes[0].decoration.as_ref().unwrap();
        assert_eq!(decoration.color, "#00ff00");
        assert_eq!(decoration.annotation_id, "b");
    }

    #[test]
    fn reapplying_highlights_clears_stale_decoration() {
        let output = output_with_runs(vec![run("loss aversion", 0.0, 0.0, 100.0)]);
        let mut layer = TextLayer::build(&output);
        assert_eq!(apply_highlights(&mut layer.nodes, &[highlight("loss")]), 1);
        assert_eq!(apply_highlights(&mut layer.nodes, &[]), 0);
        assert!(layer.nodes[0].decoration.is_none());
    }

    #[test]
    fn empty_match_text_decorates_nothing() {
        let output = output_with_runs(vec![run("anything", 0.0, 0.0, 60.0)]);
        let mut layer = TextLayer::build(&output);
        assert_eq!(apply_highlights(&mut layer.nodes, &[highlight("")]), 0);
    }

    #[test]
    fn decoration_only_changes_produce_a_decoration_patch() {
        let output = output_with_runs(vec![
            run("loss aversion", 0.0, 0.0, 100.0),
            run("framing", 0.0, 20.0, 50.0),
        ]);
        let before = TextLayer::build(&output);
        let mut after = before.clone();
        apply_highlights(&mut after.nodes, &[highlight("loss")]);

        match diff(&before, &after) {
            OverlayPatch::Decorations(changes) => {
                assert_eq!(changes.len(), 1);
                assert_eq!(changes[0].0, 0);
                let decoration = changes[0].1.as_ref().unwrap();
                assert_eq!(decoration.color, DEFAULT_HIGHLIGHT_COLOR);
            }
            other => panic!("expected decoration patch, got {other:?}"),
        }
        assert_eq!(diff(&before, &before), OverlayPatch::Unchanged);
    }

    #[test]
    fn click_on_decorated_run_resolves_annotation_id() {
        let output = output_with_runs(vec![
            run("neural basis of loss aversion", 72.0, 700.0, 200.0),
            run("undecorated", 72.0, 714.0, 80.0),
        ]);
        let mut layer = TextLayer::build(&output);
        apply_highlights(&mut layer.nodes, &[highlight("loss aversion")]);

        // Node 0 occupies (108, 1050) to (408, 1068) in device space.
        assert_eq!(annotation_at(&layer, 120.0, 1060.0), Some("h-loss aversion"));
        // Inside the undecorated node.
        assert_eq!(annotation_at(&layer, 120.0, 1080.0), None);
        // Outside every node.
        assert_eq!(annotation_at(&layer, 0.0, 0.0), None);
    }

    #[test]
    fn new_generation_forces_rebuild() {
        let output = output_with_runs(vec![run("abc", 0.0, 0.0, 30.0)]);
        let before = TextLayer::build(&output);
        let mut next_output = output_with_runs(vec![run("abc", 0.0, 0.0, 30.0)]);
        next_output.generation = 2;
        let after = TextLayer::build(&next_output);
        assert_eq!(diff(&before, &after), OverlayPatch::Rebuild);
    }

    #[test]
    fn pointer_up_emits_selection_with_union_rect() {
        let output = output_with_runs(vec![
            run("neural basis of ", 72.0, 700.0, 100.0),
            run("loss aversion", 72.0, 714.0, 90.0),
        ]);
        let layer = TextLayer::build(&output);
        let mut controller = SelectionController::new();

        let change = controller.pointer_up(
            &layer,
            Some(&RunRange {
                start_run: 0,
                start_offset: 7,
                end_run: 1,
                end_offset: 13,
            }),
        );
        let Some(SelectionChange::Selected(selection)) = change else {
            panic!("expected a committed selection");
        };
        assert_eq!(selection.text, "basis of loss aversion");
        assert_eq!(selection.page_number, 5);
        assert!(controller.is_selected());

        let rect = selection.bounding_rect;
        assert_eq!(rect.x1, 108.0);
        assert_eq!(rect.y1, 1050.0);
        assert_eq!(rect.x2, 258.0);
        assert_eq!(rect.y2, 1089.0);
        assert_eq!(rect.page_number, 5);
    }

    #[test]
    fn whitespace_only_selection_never_emits() {
        let output = output_with_runs(vec![run("   ", 0.0, 0.0, 20.0)]);
        let layer = TextLayer::build(&output);
        let mut controller = SelectionController::new();
        let change = controller.pointer_up(
            &layer,
            Some(&RunRange {
                start_run: 0,
                start_offset: 0,
                end_run: 0,
                end_offset: 3,
            }),
        );
        assert!(change.is_none());
        assert!(!controller.is_selected());
    }

    #[test]
    fn collapse_after_selection_emits_cleared_exactly_once() {
        let output = output_with_runs(vec![run("loss aversion", 0.0, 0.0, 100.0)]);
        let layer = TextLayer::build(&output);
        let mut controller = SelectionController::new();

        let range = RunRange {
            start_run: 0,
            start_offset: 0,
            end_run: 0,
            end_offset: 4,
        };
        assert!(matches!(
            controller.pointer_up(&layer, Some(&range)),
            Some(SelectionChange::Selected(_))
        ));
        assert_eq!(controller.selection_collapsed(), Some(SelectionChange::Cleared));
        assert_eq!(controller.selection_collapsed(), None);
        assert_eq!(controller.clear(), None);
    }

    #[test]
    fn collapsed_pointer_up_counts_as_collapse() {
        let output = output_with_runs(vec![run("loss aversion", 0.0, 0.0, 100.0)]);
        let layer = TextLayer::build(&output);
        let mut controller = SelectionController::new();

        assert!(controller.pointer_up(&layer, None).is_none());

        let range = RunRange {
            start_run: 0,
            start_offset: 0,
            end_run: 0,
            end_offset: 4,
        };
        controller.pointer_up(&layer, Some(&range));
        let collapsed = RunRange {
            start_run: 0,
            start_offset: 2,
            end_run: 0,
            end_offset: 2,
        };
        assert_eq!(
            controller.pointer_up(&layer, Some(&collapsed)),
            Some(SelectionChange::Cleared)
        );
    }

    #[test]
    fn selection_trims_but_preserves_interior_whitespace() {
        let output = output_with_runs(vec![run("  loss aversion  ", 0.0, 0.0, 100.0)]);
        let layer = TextLayer::build(&output);
        let mut controller = SelectionController::new();
        let change = controller.pointer_up(
            &layer,
            Some(&RunRange {
                start_run: 0,
                start_offset: 0,
                end_run: 0,
                end_offset: 17,
            }),
        );
        let Some(SelectionChange::Selected(selection)) = change else {
            panic!("expected a committed selection");
        };
        assert_eq!(selection.text, "loss aversion");
    }

    #[test]
    fn reversed_range_is_normalized() {
        let output = output_with_runs(vec![
            run("first ", 0.0, 0.0, 40.0),
            run("second", 0.0, 20.0, 40.0),
        ]);
        let layer = TextLayer::build(&output);
        let mut controller = SelectionController::new();
        let change = controller.pointer_up(
            &layer,
            Some(&RunRange {
                start_run: 1,
                start_offset: 6,
                end_run: 0,
                end_offset: 0,
            }),
        );
        let Some(SelectionChange::Selected(selection)) = change else {
            panic!("expected a committed selection");
        };
        assert_eq!(selection.text, "first second");
    }

    #[test]
    fn multibyte_offsets_slice_on_char_boundaries() {
        assert_eq!(slice_chars("héllo", 1, Some(3)), "él");
        assert_eq!(slice_chars("héllo", 0, None), "héllo");
        assert_eq!(slice_chars("héllo", 4, Some(2)), "");
        assert_eq!(slice_chars("héllo", 10, None), "");
    }
}

//! SVG-to-commands trait boundary (SPEC_FULL.md §2 supplemented feature).
//!
//! Out of scope for full fidelity. This module exists to give the job
//! queue's `svg` job kind something real to exercise end-to-end: a
//! minimal converter that understands only straight-segment elements
//! (`<line>`, `<polyline>`), expressed behind a trait so a fuller
//! converter can be swapped in without touching the queue.

use ebb_protocol::{ControlError, Units};

use crate::facade::{MiniCommand, PathPoint};

#[derive(Debug, Clone)]
pub struct SvgOptions {
    pub scale: f64,
    pub units: Units,
    pub draw_speed_ips: Option<f64>,
}

impl Default for SvgOptions {
    fn default() -> Self {
        Self { scale: 1.0, units: Units::Mm, draw_speed_ips: None }
    }
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct Bounds2 {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

#[derive(Debug, Clone)]
pub struct ConvertedArtwork {
    pub commands: Vec<MiniCommand>,
    pub bounds: Bounds2,
}

pub trait SvgConverter: Send + Sync {
    fn convert(&self, svg: &str, opts: &SvgOptions) -> Result<ConvertedArtwork, ControlError>;
}

/// Accepts only `<line x1 y1 x2 y2>` and `<polyline points="...">`
/// elements; anything else in the document is ignored.
pub struct LineSegmentConverter;

impl SvgConverter for LineSegmentConverter {
    fn convert(&self, svg: &str, opts: &SvgOptions) -> Result<ConvertedArtwork, ControlError> {
        let mut commands = Vec::new();
        let mut bounds = Bounds2 { min_x: f64::MAX, min_y: f64::MAX, max_x: f64::MIN, max_y: f64::MIN };
        let mut cursor = (0.0_f64, 0.0_f64);
        let mut touched = false;

        for segment in extract_segments(svg) {
            for point in &segment {
                bounds.min_x = bounds.min_x.min(point.0 * opts.scale);
                bounds.min_y = bounds.min_y.min(point.1 * opts.scale);
                bounds.max_x = bounds.max_x.max(point.0 * opts.scale);
                bounds.max_y = bounds.max_y.max(point.1 * opts.scale);
                touched = true;
            }
            if segment.len() < 2 {
                continue;
            }
            let start = (segment[0].0 * opts.scale, segment[0].1 * opts.scale);
            commands.push(MiniCommand::PenUp);
            commands.push(MiniCommand::MoveTo { x: start.0, y: start.1, units: opts.units });
            for point in &segment[1..] {
                let p = (point.0 * opts.scale, point.1 * opts.scale);
                commands.push(MiniCommand::LineTo {
                    dx: p.0 - cursor.0,
                    dy: p.1 - cursor.1,
                    units: opts.units,
                    speed_ips: opts.draw_speed_ips,
                    duration_ms: None,
                });
                cursor = p;
            }
            cursor = start;
        }

        if !touched {
            return Err(ControlError::validation("SVG contained no supported <line>/<polyline> elements"));
        }

        Ok(ConvertedArtwork { commands, bounds })
    }
}

/// Extremely small tag scanner — not a general XML parser. Finds
/// `<line .../>` and `<polyline .../>` tags and pulls their numeric
/// attributes out with simple substring search.
fn extract_segments(svg: &str) -> Vec<Vec<(f64, f64)>> {
    let mut out = Vec::new();
    for tag in find_tags(svg, "line") {
        if let (Some(x1), Some(y1), Some(x2), Some(y2)) =
            (attr(&tag, "x1"), attr(&tag, "y1"), attr(&tag, "x2"), attr(&tag, "y2"))
        {
            out.push(vec![(x1, y1), (x2, y2)]);
        }
    }
    for tag in find_tags(svg, "polyline") {
        if let Some(points) = attr_str(&tag, "points") {
            let parsed: Vec<(f64, f64)> = points
                .split_whitespace()
                .filter_map(|pair| {
                    let mut parts = pair.split(',');
                    let x: f64 = parts.next()?.parse().ok()?;
                    let y: f64 = parts.next()?.parse().ok()?;
                    Some((x, y))
                })
                .collect();
            if parsed.len() >= 2 {
                out.push(parsed);
            }
        }
    }
    out
}

fn find_tags(svg: &str, name: &str) -> Vec<String> {
    let open = format!("<{name}");
    let mut out = Vec::new();
    let mut rest = svg;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start..];
        let Some(end) = after.find('>') else { break };
        out.push(after[..=end].to_string());
        rest = &after[end + 1..];
    }
    out
}

fn attr_str(tag: &str, name: &str) -> Option<String> {
    let needle = format!("{name}=\"");
    let start = tag.find(&needle)? + needle.len();
    let end = tag[start..].find('"')? + start;
    Some(tag[start..end].to_string())
}

fn attr(tag: &str, name: &str) -> Option<f64> {
    attr_str(tag, name)?.parse().ok()
}

/// Rebuilds the mini-command list that replaying a path history would
/// issue: a `PenUp`/`PenDown` step on every pen-state transition, then
/// `MoveTo` for the first point of a run and `LineTo`/`Move` deltas
/// after it, the reverse of what [`LineSegmentConverter`] builds going in.
pub fn path_to_commands(points: &[PathPoint]) -> Vec<MiniCommand> {
    let mut commands = Vec::new();
    let Some(first) = points.first() else { return commands };

    let mut pen_down = first.pen_down;
    let mut cursor = (first.x as f64, first.y as f64);
    commands.push(if pen_down { MiniCommand::PenDown } else { MiniCommand::PenUp });
    commands.push(MiniCommand::MoveTo { x: cursor.0, y: cursor.1, units: Units::Steps });

    for point in &points[1..] {
        if point.pen_down != pen_down {
            pen_down = point.pen_down;
            commands.push(if pen_down { MiniCommand::PenDown } else { MiniCommand::PenUp });
        }
        let next = (point.x as f64, point.y as f64);
        let (dx, dy) = (next.0 - cursor.0, next.1 - cursor.1);
        commands.push(if pen_down {
            MiniCommand::LineTo { dx, dy, units: Units::Steps, speed_ips: None, duration_ms: None }
        } else {
            MiniCommand::Move { dx, dy, units: Units::Steps, speed_ips: None, duration_ms: None }
        });
        cursor = next;
    }

    commands
}

/// Renders a path history back into an SVG document: one `<polyline>`
/// per pen-down run, the export-direction counterpart of
/// [`LineSegmentConverter::convert`]'s `<polyline>` import.
pub fn path_to_svg(points: &[PathPoint]) -> String {
    let mut bounds = Bounds2 { min_x: f64::MAX, min_y: f64::MAX, max_x: f64::MIN, max_y: f64::MIN };
    let mut polylines = Vec::new();
    let mut run: Vec<(i64, i64)> = Vec::new();

    for point in points {
        bounds.min_x = bounds.min_x.min(point.x as f64);
        bounds.min_y = bounds.min_y.min(point.y as f64);
        bounds.max_x = bounds.max_x.max(point.x as f64);
        bounds.max_y = bounds.max_y.max(point.y as f64);

        if point.pen_down {
            run.push((point.x, point.y));
        } else if run.len() >= 2 {
            polylines.push(render_polyline(&run));
            run.clear();
        } else {
            run.clear();
        }
    }
    if run.len() >= 2 {
        polylines.push(render_polyline(&run));
    }

    if !bounds.min_x.is_finite() {
        bounds = Bounds2::default();
    }
    let width = (bounds.max_x - bounds.min_x).max(0.0);
    let height = (bounds.max_y - bounds.min_y).max(0.0);

    format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" viewBox="{} {} {} {}">{}</svg>"#,
        bounds.min_x,
        bounds.min_y,
        width,
        height,
        polylines.join("")
    )
}

fn render_polyline(points: &[(i64, i64)]) -> String {
    let pts = points.iter().map(|(x, y)| format!("{x},{y}")).collect::<Vec<_>>().join(" ");
    format!(r#"<polyline points="{pts}" fill="none" stroke="black" />"#)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_a_single_line_element() {
        let svg = r#"<svg><line x1="0" y1="0" x2="10" y2="20" /></svg>"#;
        let converted = LineSegmentConverter.convert(svg, &SvgOptions::default()).unwrap();
        assert_eq!(converted.bounds.max_x, 10.0);
        assert_eq!(converted.bounds.max_y, 20.0);
        assert!(converted.commands.iter().any(|c| matches!(c, MiniCommand::LineTo { .. })));
    }

    #[test]
    fn converts_a_polyline_element() {
        let svg = r#"<svg><polyline points="0,0 5,5 10,0" /></svg>"#;
        let converted = LineSegmentConverter.convert(svg, &SvgOptions::default()).unwrap();
        let line_tos = converted.commands.iter().filter(|c| matches!(c, MiniCommand::LineTo { .. })).count();
        assert_eq!(line_tos, 2);
    }

    #[test]
    fn rejects_documents_with_no_supported_elements() {
        let svg = r#"<svg><circle cx="5" cy="5" r="2" /></svg>"#;
        assert!(LineSegmentConverter.convert(svg, &SvgOptions::default()).is_err());
    }

    fn point(x: i64, y: i64, pen_down: bool) -> PathPoint {
        PathPoint { x, y, pen_down, timestamp_ms: 0 }
    }

    #[test]
    fn path_to_commands_emits_a_pen_state_on_every_transition() {
        let points = vec![point(0, 0, false), point(10, 0, true), point(10, 10, true), point(10, 10, false)];
        let commands = path_to_commands(&points);
        let pen_states =
            commands.iter().filter(|c| matches!(c, MiniCommand::PenUp | MiniCommand::PenDown)).count();
        assert_eq!(pen_states, 3);
        let last_pen_state = commands
            .iter()
            .rev()
            .find(|c| matches!(c, MiniCommand::PenUp | MiniCommand::PenDown))
            .unwrap();
        assert!(matches!(last_pen_state, MiniCommand::PenUp));
    }

    #[test]
    fn path_to_commands_on_empty_history_is_empty() {
        assert!(path_to_commands(&[]).is_empty());
    }

    #[test]
    fn path_to_svg_draws_a_polyline_for_a_pen_down_run() {
        let points = vec![point(0, 0, true), point(10, 0, true), point(10, 10, true)];
        let svg = path_to_svg(&points);
        assert!(svg.contains("<polyline"));
        assert!(svg.contains("viewBox=\"0 0 10 10\""));
    }

    #[test]
    fn path_to_svg_skips_pen_up_travel_moves() {
        let points = vec![point(0, 0, false), point(10, 10, false)];
        let svg = path_to_svg(&points);
        assert!(!svg.contains("<polyline"));
    }
}

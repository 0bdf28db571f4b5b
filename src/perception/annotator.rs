/// Set-of-Mark annotation: choose which elements get numbered marks and draw
/// the numbered outlines onto the screenshot.
use crate::config::AnnotatorConfig;
use crate::errors::PilotResult;
use crate::perception::marks::MarkSet;
use crate::perception::screenshot::Screenshot;
use crate::perception::types::{BoundingRect, SoMElement};

/// Outline colours, cycled by mark id.
const MARK_COLOURS: [[u8; 4]; 10] = [
    [230, 25, 75, 255],
    [60, 180, 75, 255],
    [0, 130, 200, 255],
    [245, 130, 48, 255],
    [145, 30, 180, 255],
    [70, 200, 200, 255],
    [240, 50, 230, 255],
    [150, 150, 20, 255],
    [0, 128, 128, 255],
    [128, 0, 0, 255],
];

pub fn mark_colour(id: u32) -> [u8; 4] {
    MARK_COLOURS[(id.saturating_sub(1) as usize) % MARK_COLOURS.len()]
}

#[derive(Debug, Clone, Default)]
pub struct Annotator {
    config: AnnotatorConfig,
}

impl Annotator {
    pub fn new(config: AnnotatorConfig) -> Self {
        Self { config }
    }

    fn keep(&self, el: &SoMElement, width: i32, height: i32) -> bool {
        el.is_enabled
            && el.is_visible
            && el.rect.width() >= self.config.min_size
            && el.rect.height() >= self.config.min_size
            && !el.rect.is_offscreen(width, height)
    }

    /// Filters, orders top-to-bottom then left-to-right, caps, and numbers
    /// the elements from 1.
    pub fn annotate(&self, screen: (u32, u32), elements: Vec<SoMElement>) -> MarkSet {
        let (w, h) = (screen.0 as i32, screen.1 as i32);
        let total = elements.len();
        let mut kept: Vec<SoMElement> = elements.into_iter().filter(|e| self.keep(e, w, h)).collect();
        kept.sort_by_key(|e| (e.rect.top, e.rect.left));
        kept.truncate(self.config.max_marks);
        for (i, el) in kept.iter_mut().enumerate() {
            el.id = i as u32 + 1;
        }
        tracing::debug!(total, marked = kept.len(), "elements annotated");
        MarkSet {
            marks: kept,
            screen_width: screen.0,
            screen_height: screen.1,
        }
    }

    /// Draws an outline and a numbered badge for every mark.
    pub fn render(&self, screenshot: &Screenshot, marks: &MarkSet) -> PilotResult<Screenshot> {
        let mut canvas = screenshot.decode()?;
        let scale = if canvas.width() > 1600 { 2 } else { 1 };
        for mark in &marks.marks {
            let colour = mark_colour(mark.id);
            draw_outline(&mut canvas, &mark.rect, colour, self.config.outline_width as i32);
            draw_badge(&mut canvas, mark.rect.left, mark.rect.top, mark.id, colour, scale);
        }
        Screenshot::from_rgba(&canvas)
    }
}

fn blend(canvas: &mut image::RgbaImage, x: i32, y: i32, col: [u8; 4]) {
    if x < 0 || y < 0 || x >= canvas.width() as i32 || y >= canvas.height() as i32 {
        return;
    }
    let p = canvas.get_pixel_mut(x as u32, y as u32);
    let a = f32::from(col[3]) / 255.0;
    for c in 0..3 {
        p[c] = (f32::from(p[c]) * (1.0 - a) + f32::from(col[c]) * a).round() as u8;
    }
    p[3] = 255;
}

fn draw_outline(canvas: &mut image::RgbaImage, rect: &BoundingRect, col: [u8; 4], width: i32) {
    for t in 0..width.max(1) {
        for x in rect.left..=rect.right {
            blend(canvas, x, rect.top + t, col);
            blend(canvas, x, rect.bottom - t, col);
        }
        for y in rect.top..=rect.bottom {
            blend(canvas, rect.left + t, y, col);
            blend(canvas, rect.right - t, y, col);
        }
    }
}

/// Filled badge with the mark number in white, anchored at the top-left corner.
fn draw_badge(canvas: &mut image::RgbaImage, x: i32, y: i32, id: u32, col: [u8; 4], scale: i32) {
    let digits = id.to_string();
    let advance = 4 * scale;
    let pad = 2 * scale;
    let badge_w = digits.len() as i32 * advance + pad * 2 - scale;
    let badge_h = 5 * scale + pad * 2;
    for dy in 0..badge_h {
        for dx in 0..badge_w {
            blend(canvas, x + dx, y + dy, col);
        }
    }
    for (i, ch) in digits.chars().enumerate() {
        let Some(glyph) = ch.to_digit(10).map(|d| DIGITS[d as usize]) else {
            continue;
        };
        let gx = x + pad + i as i32 * advance;
        for (row, bits) in glyph.iter().enumerate() {
            for bit in 0..3 {
                if bits >> (2 - bit) & 1 == 0 {
                    continue;
                }
                for sy in 0..scale {
                    for sx in 0..scale {
                        blend(
                            canvas,
                            gx + bit * scale + sx,
                            y + pad + row as i32 * scale + sy,
                            [255, 255, 255, 255],
                        );
                    }
                }
            }
        }
    }
}

/// 3x5 digit glyphs.
const DIGITS: [[u8; 5]; 10] = [
    [0b111, 0b101, 0b101, 0b101, 0b111],
    [0b010, 0b110, 0b010, 0b010, 0b111],
    [0b111, 0b001, 0b111, 0b100, 0b111],
    [0b111, 0b001, 0b111, 0b001, 0b111],
    [0b101, 0b101, 0b111, 0b001, 0b001],
    [0b111, 0b100, 0b111, 0b001, 0b111],
    [0b111, 0b100, 0b111, 0b101, 0b111],
    [0b111, 0b001, 0b010, 0b010, 0b010],
    [0b111, 0b101, 0b111, 0b101, 0b111],
    [0b111, 0b101, 0b111, 0b001, 0b111],
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perception::types::ElementSource;

    fn el(name: &str, l: i32, t: i32, r: i32, b: i32) -> SoMElement {
        SoMElement::new(name, "Button", BoundingRect::new(l, t, r, b), ElementSource::Accessibility)
    }

    #[test]
    fn filters_tiny_offscreen_and_disabled() {
        let mut disabled = el("disabled", 10, 10, 60, 40);
        disabled.is_enabled = false;
        let mut hidden = el("hidden", 10, 50, 60, 80);
        hidden.is_visible = false;
        let marks = Annotator::default().annotate(
            (800, 600),
            vec![
                el("tiny", 0, 0, 5, 20),
                el("offscreen", 900, 10, 950, 40),
                disabled,
                hidden,
                el("kept", 100, 100, 160, 130),
            ],
        );
        assert_eq!(marks.len(), 1);
        assert_eq!(marks.marks[0].name, "kept");
        assert_eq!(marks.marks[0].id, 1);
    }

    #[test]
    fn orders_by_top_then_left_and_caps() {
        let annotator = Annotator::new(AnnotatorConfig {
            max_marks: 2,
            ..AnnotatorConfig::default()
        });
        let marks = annotator.annotate(
            (800, 600),
            vec![
                el("lower", 10, 200, 60, 230),
                el("right", 300, 10, 360, 40),
                el("left", 10, 10, 60, 40),
            ],
        );
        let names: Vec<&str> = marks.marks.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["left", "right"]);
        assert_eq!(marks.marks[1].id, 2);
    }

    #[test]
    fn render_paints_outline_colour() {
        let shot = Screenshot::blank(200, 100).unwrap();
        let annotator = Annotator::default();
        let marks = annotator.annotate((200, 100), vec![el("a", 50, 40, 120, 80)]);
        let rendered = annotator.render(&shot, &marks).unwrap().decode().unwrap();
        // bottom-right corner is outline, not badge
        assert_eq!(rendered.get_pixel(120, 80).0, mark_colour(1));
        assert_eq!(rendered.get_pixel(5, 5).0, [40, 40, 40, 255]);
    }
}

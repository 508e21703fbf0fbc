use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, Rgba, RgbaImage};
use once_cell::sync::Lazy;
use rusttype::{Font, Point, PositionedGlyph, Scale};

use crate::error::StampError;

const STAMP_FONT_DATA: &[u8] = include_bytes!("../assets/fonts/DejaVuSans-Bold.ttf");

static STAMP_FONT: Lazy<Option<Font<'static>>> = Lazy::new(|| Font::try_from_bytes(STAMP_FONT_DATA));

/// Lossy output encoding quality.
const JPEG_QUALITY: u8 = 90;

const FILL_COLOR: Rgba<u8> = Rgba([255, 140, 0, 255]); // #FF8C00
const STROKE_COLOR: Rgba<u8> = Rgba([0, 0, 0, 255]);

/// Final raster output plus the exact text burned into it.
#[derive(Debug, Clone)]
pub struct StampedImage {
    pub bytes: Vec<u8>,
    pub text: String,
}

/// EXIF orientation codes as an exhaustive lookup rather than inline
/// branching. Codes 5-8 store the image rotated a quarter turn, so the
/// display canvas swaps width and height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExifOrientation {
    /// 1: stored upright.
    Normal,
    /// 2: mirrored across the vertical axis.
    MirrorHorizontal,
    /// 3: rotated 180 degrees.
    Rotate180,
    /// 4: mirrored across the horizontal axis.
    MirrorVertical,
    /// 5: transposed (mirror + 270 degree rotation).
    Transpose,
    /// 6: rotated 90 degrees clockwise.
    Rotate90,
    /// 7: transversed (mirror + 90 degree rotation).
    Transverse,
    /// 8: rotated 270 degrees clockwise.
    Rotate270,
}

impl ExifOrientation {
    /// Out-of-range codes fall back to the identity transform.
    pub fn from_code(code: u16) -> Self {
        match code {
            2 => Self::MirrorHorizontal,
            3 => Self::Rotate180,
            4 => Self::MirrorVertical,
            5 => Self::Transpose,
            6 => Self::Rotate90,
            7 => Self::Transverse,
            8 => Self::Rotate270,
            _ => Self::Normal,
        }
    }

    pub fn code(self) -> u16 {
        match self {
            Self::Normal => 1,
            Self::MirrorHorizontal => 2,
            Self::Rotate180 => 3,
            Self::MirrorVertical => 4,
            Self::Transpose => 5,
            Self::Rotate90 => 6,
            Self::Transverse => 7,
            Self::Rotate270 => 8,
        }
    }

    /// Whether the display canvas swaps width/height relative to storage.
    pub fn swaps_dimensions(self) -> bool {
        matches!(
            self,
            Self::Transpose | Self::Rotate90 | Self::Transverse | Self::Rotate270
        )
    }

    /// Affine coefficients `[a, b, c, d, e, f]` mapping stored pixel
    /// coordinates onto the display canvas, in terms of the stored
    /// dimensions `w`/`h`. This is the standard EXIF orientation table.
    pub fn coefficients(self, w: u32, h: u32) -> [f64; 6] {
        let (w, h) = (w as f64, h as f64);
        match self {
            Self::Normal => [1.0, 0.0, 0.0, 1.0, 0.0, 0.0],
            Self::MirrorHorizontal => [-1.0, 0.0, 0.0, 1.0, w, 0.0],
            Self::Rotate180 => [-1.0, 0.0, 0.0, -1.0, w, h],
            Self::MirrorVertical => [1.0, 0.0, 0.0, -1.0, 0.0, h],
            Self::Transpose => [0.0, 1.0, 1.0, 0.0, 0.0, 0.0],
            Self::Rotate90 => [0.0, 1.0, -1.0, 0.0, h, 0.0],
            Self::Transverse => [0.0, -1.0, -1.0, 0.0, h, w],
            Self::Rotate270 => [0.0, -1.0, 1.0, 0.0, 0.0, w],
        }
    }

    /// Produce the upright image by pushing every stored pixel through the
    /// coefficient table. Each transform is a bijection onto the output
    /// rect, so every output pixel is written exactly once.
    fn apply(self, img: DynamicImage) -> DynamicImage {
        if self == Self::Normal {
            return img;
        }
        let src = img.to_rgba8();
        let (w, h) = src.dimensions();
        let (out_w, out_h) = if self.swaps_dimensions() { (h, w) } else { (w, h) };
        let [a, b, c, d, e, f] = self.coefficients(w, h);

        let mut out = RgbaImage::new(out_w, out_h);
        for y in 0..h {
            for x in 0..w {
                // Map the pixel center, then floor back to an index.
                let sx = x as f64 + 0.5;
                let sy = y as f64 + 0.5;
                let tx = (a * sx + c * sy + e).floor() as u32;
                let ty = (b * sx + d * sy + f).floor() as u32;
                out.put_pixel(tx, ty, *src.get_pixel(x, y));
            }
        }
        DynamicImage::ImageRgba8(out)
    }
}

/// Auto-fit result for a stamp string on a given canvas.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StampLayout {
    pub font_size: f32,
    pub padding: f32,
}

/// Base size is 1/28th of the governing canvas dimension with a 12 px
/// floor; the string then shrinks in unit steps until it fits inside the
/// padded width, never below 10 px. The padding is fixed at 0.8x the
/// initial size so the text anchor does not drift while shrinking.
pub fn fit_stamp_text(font: &Font, text: &str, canvas_w: u32, canvas_h: u32) -> StampLayout {
    let base = canvas_w.min(canvas_h) as f32 / 28.0;
    let mut font_size = base.max(12.0);
    let padding = font_size * 0.8;
    let max_width = canvas_w as f32 - padding * 2.0;

    while measure_text_width(font, text, font_size) > max_width && font_size > 10.0 {
        font_size -= 1.0;
    }

    StampLayout { font_size, padding }
}

fn layout_glyphs<'a>(font: &'a Font, text: &str, font_size: f32) -> Vec<PositionedGlyph<'a>> {
    font.layout(text, Scale::uniform(font_size), Point { x: 0.0, y: 0.0 })
        .collect()
}

fn measure_text_width(font: &Font, text: &str, font_size: f32) -> f32 {
    layout_glyphs(font, text, font_size)
        .iter()
        .rev()
        .map(|g| g.position().x + g.unpositioned().h_metrics().advance_width)
        .next()
        .unwrap_or(0.0)
}

fn blend_pixel(pixel: &mut Rgba<u8>, color: Rgba<u8>, coverage: f32) {
    let alpha = (coverage * 255.0) as u16;
    if alpha == 0 {
        return;
    }
    let inv_alpha = 255 - alpha;
    for channel in 0..3 {
        pixel[channel] =
            ((color[channel] as u16 * alpha + pixel[channel] as u16 * inv_alpha) / 255) as u8;
    }
}

fn draw_glyphs(
    canvas: &mut RgbaImage,
    glyphs: &[PositionedGlyph],
    origin_x: i32,
    baseline_y: i32,
    offset: (i32, i32),
    color: Rgba<u8>,
) {
    let (w, h) = canvas.dimensions();
    for glyph in glyphs {
        if let Some(bbox) = glyph.pixel_bounding_box() {
            glyph.draw(|gx, gy, coverage| {
                let px = origin_x + gx as i32 + bbox.min.x + offset.0;
                let py = baseline_y + gy as i32 + bbox.min.y + offset.1;
                if px >= 0 && py >= 0 && (px as u32) < w && (py as u32) < h {
                    blend_pixel(canvas.get_pixel_mut(px as u32, py as u32), color, coverage);
                }
            });
        }
    }
}

/// Burn `text` into the bottom-right corner: black outline stroke beneath
/// a solid orange fill, right- and bottom-aligned at the padding offset.
fn draw_stamp(canvas: &mut RgbaImage, font: &Font, text: &str, layout: StampLayout) {
    let (w, h) = canvas.dimensions();
    let glyphs = layout_glyphs(font, text, layout.font_size);
    if glyphs.is_empty() {
        return;
    }

    let text_width = measure_text_width(font, text, layout.font_size);
    let v_metrics = font.v_metrics(Scale::uniform(layout.font_size));
    let origin_x = (w as f32 - layout.padding - text_width).round() as i32;
    // Bottom-aligned: the descender sits at the padding offset.
    let baseline_y = (h as f32 - layout.padding + v_metrics.descent).round() as i32;

    let stroke_width = ((layout.font_size / 12.0).round() as i32).max(1);
    for dy in -stroke_width..=stroke_width {
        for dx in -stroke_width..=stroke_width {
            if dx == 0 && dy == 0 {
                continue;
            }
            if dx * dx + dy * dy > stroke_width * stroke_width {
                continue;
            }
            draw_glyphs(canvas, &glyphs, origin_x, baseline_y, (dx, dy), STROKE_COLOR);
        }
    }
    draw_glyphs(canvas, &glyphs, origin_x, baseline_y, (0, 0), FILL_COLOR);
}

/// Decode, orient, stamp and re-encode one photo.
pub fn render(
    image_bytes: &[u8],
    orientation: ExifOrientation,
    stamp_text: &str,
) -> Result<StampedImage, StampError> {
    let decoded =
        image::load_from_memory(image_bytes).map_err(|_| StampError::ImageDecodeFailed)?;
    let font = STAMP_FONT.as_ref().ok_or(StampError::CanvasUnavailable)?;

    let mut canvas = orientation.apply(decoded).to_rgba8();
    let (w, h) = canvas.dimensions();

    let layout = fit_stamp_text(font, stamp_text, w, h);
    draw_stamp(&mut canvas, font, stamp_text, layout);

    let rgb = DynamicImage::ImageRgba8(canvas).to_rgb8();
    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut Cursor::new(&mut bytes), JPEG_QUALITY)
        .encode_image(&rgb)
        .map_err(|_| StampError::CanvasUnavailable)?;

    Ok(StampedImage {
        bytes,
        text: stamp_text.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GenericImageView;

    fn png_bytes(w: u32, h: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            w,
            h,
            Rgba([40, 80, 120, 255]),
        ));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .expect("encode png");
        bytes
    }

    fn font() -> &'static Font<'static> {
        STAMP_FONT.as_ref().expect("embedded font")
    }

    #[test]
    fn orientation_codes_round_trip() {
        for code in 1..=8u16 {
            assert_eq!(ExifOrientation::from_code(code).code(), code);
        }
        assert_eq!(ExifOrientation::from_code(0), ExifOrientation::Normal);
        assert_eq!(ExifOrientation::from_code(9), ExifOrientation::Normal);
    }

    #[test]
    fn rotated_codes_swap_canvas_dimensions() {
        for code in 1..=8u16 {
            let orientation = ExifOrientation::from_code(code);
            assert_eq!(orientation.swaps_dimensions(), (5..=8).contains(&code));
        }
    }

    #[test]
    fn orientation_six_matches_documented_transform() {
        let orientation = ExifOrientation::from_code(6);
        assert_eq!(
            orientation.coefficients(800, 600),
            [0.0, 1.0, -1.0, 0.0, 600.0, 0.0]
        );

        let landscape = DynamicImage::ImageRgba8(RgbaImage::new(800, 600));
        let rotated = orientation.apply(landscape);
        assert_eq!(rotated.dimensions(), (600, 800));
    }

    #[test]
    fn orientation_six_pixel_geometry() {
        // Two-pixel strip: left red, right green. A 90 degree clockwise
        // rotation puts left on top.
        let mut src = RgbaImage::new(2, 1);
        src.put_pixel(0, 0, Rgba([255, 0, 0, 255]));
        src.put_pixel(1, 0, Rgba([0, 255, 0, 255]));
        let rotated = ExifOrientation::Rotate90
            .apply(DynamicImage::ImageRgba8(src))
            .to_rgba8();
        assert_eq!(rotated.dimensions(), (1, 2));
        assert_eq!(rotated.get_pixel(0, 0), &Rgba([255, 0, 0, 255]));
        assert_eq!(rotated.get_pixel(0, 1), &Rgba([0, 255, 0, 255]));
    }

    #[test]
    fn identity_coefficients_for_normal_orientation() {
        assert_eq!(
            ExifOrientation::Normal.coefficients(800, 600),
            [1.0, 0.0, 0.0, 1.0, 0.0, 0.0]
        );
    }

    #[test]
    fn font_fit_uses_governing_dimension() {
        let layout = fit_stamp_text(font(), "短い", 2800, 1400);
        // 1400 / 28 = 50 px base, no shrinking needed for a short string.
        assert!((layout.font_size - 50.0).abs() < f32::EPSILON);
        assert!((layout.padding - 40.0).abs() < 1e-3);
    }

    #[test]
    fn font_fit_never_goes_below_floor() {
        let long_text = "とても長い場所の名前が続く写真スタンプのテキスト 2024/01/15";
        let layout = fit_stamp_text(font(), long_text, 60, 60);
        assert!(layout.font_size >= 10.0);
        assert!(layout.font_size <= 12.0);
    }

    #[test]
    fn font_fit_shrinks_until_text_fits() {
        let layout = fit_stamp_text(font(), "Tokyo Tower Minato 2024/01/15", 400, 400);
        let width = measure_text_width(font(), "Tokyo Tower Minato 2024/01/15", layout.font_size);
        assert!(width <= 400.0 - layout.padding * 2.0 || layout.font_size == 10.0);
    }

    #[test]
    fn render_produces_jpeg_with_stamp_text() {
        let stamped = render(
            &png_bytes(320, 240),
            ExifOrientation::Normal,
            "東京都 港区 2024/01/15",
        )
        .expect("render");
        assert_eq!(&stamped.bytes[..2], &[0xFF, 0xD8]);
        assert_eq!(stamped.text, "東京都 港区 2024/01/15");

        // The stamp must actually alter pixels near the bottom-right corner.
        let out = image::load_from_memory(&stamped.bytes).expect("decode output");
        let (w, h) = out.dimensions();
        assert_eq!((w, h), (320, 240));
        let region = out.crop_imm(w / 2, h * 3 / 4, w / 2, h / 4).to_rgb8();
        let touched = region
            .pixels()
            .any(|p| (p[0] as i32 - 40).abs() > 16 || (p[1] as i32 - 80).abs() > 16);
        assert!(touched, "expected stamped pixels in the bottom-right region");
    }

    #[test]
    fn render_swaps_output_dimensions_for_rotated_storage() {
        let stamped = render(&png_bytes(80, 60), ExifOrientation::Rotate90, "テスト")
            .expect("render");
        let out = image::load_from_memory(&stamped.bytes).expect("decode output");
        assert_eq!(out.dimensions(), (60, 80));
    }

    #[test]
    fn render_rejects_undecodable_bytes() {
        let err = render(b"not an image", ExifOrientation::Normal, "x").unwrap_err();
        assert!(matches!(err, StampError::ImageDecodeFailed));
    }
}

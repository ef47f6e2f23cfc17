// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use ab_glyph::{Font, FontArc, PxScale, ScaleFont};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use log::warn;

/// The display is a square TFT panel.
pub const SCREEN_SIZE: u32 = 240;

pub const COLOR_BLACK: Rgb<u8> = Rgb([0, 0, 0]);
pub const COLOR_WHITE: Rgb<u8> = Rgb([255, 255, 255]);
pub const COLOR_CAPTION: Rgb<u8> = Rgb([100, 255, 100]);
pub const BUTTON_COLOR: Rgb<u8> = Rgb([60, 60, 60]);
pub const BUTTON_SELECTED_COLOR: Rgb<u8> = Rgb([140, 35, 35]);

const FONT_CANDIDATES: [&str; 4] = [
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
];

/// Finds a usable system font. The device image ships DejaVu; on a dev box
/// without one of the known fonts, rendering degrades to unlabeled output.
pub fn load_font() -> Option<FontArc> {
    for path in FONT_CANDIDATES {
        if let Ok(bytes) = std::fs::read(path) {
            if let Ok(font) = FontArc::try_from_vec(bytes) {
                return Some(font);
            }
        }
    }
    warn!("no system font found; screen text disabled");
    None
}

/// Shared raster helpers for the menu and status screens.
pub struct ScreenPainter {
    font: Option<FontArc>,
}

impl ScreenPainter {
    pub fn new(font: Option<FontArc>) -> Self {
        ScreenPainter { font }
    }

    pub fn blank(&self) -> RgbImage {
        RgbImage::from_pixel(SCREEN_SIZE, SCREEN_SIZE, COLOR_BLACK)
    }

    pub fn text(
        &self,
        image: &mut RgbImage,
        x: i32,
        y: i32,
        size: f32,
        color: Rgb<u8>,
        text: &str,
    ) {
        if let Some(font) = &self.font {
            draw_text_mut(image, color, x, y, PxScale::from(size), font, text);
        }
    }

    pub fn text_width(&self, size: f32, text: &str) -> f32 {
        match &self.font {
            Some(font) => {
                let scaled = font.as_scaled(PxScale::from(size));
                text.chars()
                    .map(|c| scaled.h_advance(scaled.glyph_id(c)))
                    .sum()
            }
            None => text.len() as f32 * size * 0.5,
        }
    }

    pub fn text_centered(
        &self,
        image: &mut RgbImage,
        y: i32,
        size: f32,
        color: Rgb<u8>,
        text: &str,
    ) {
        let x = (SCREEN_SIZE as f32 - self.text_width(size, text)) / 2.0;
        self.text(image, x.max(0.0) as i32, y, size, color, text);
    }

    /// Title plus a column of buttons, the selected one highlighted. Long
    /// lists are paged around the selection.
    pub fn render_menu(
        &self,
        title: &str,
        options: &[String],
        selected: usize,
    ) -> RgbImage {
        const BUTTON_HEIGHT: u32 = 36;
        const BUTTON_MARGIN: u32 = 8;
        const HEADER_HEIGHT: u32 = 50;

        let mut image = self.blank();
        self.text(&mut image, 10, 10, 24.0, COLOR_WHITE, title);

        let per_page =
            ((SCREEN_SIZE - HEADER_HEIGHT) / (BUTTON_HEIGHT + BUTTON_MARGIN))
                as usize;
        let page = if options.len() > per_page { selected / per_page } else { 0 };
        let start = page * per_page;

        let mut y = HEADER_HEIGHT;
        for (offset, label) in
            options.iter().skip(start).take(per_page).enumerate()
        {
            let index = start + offset;
            let color = if index == selected {
                BUTTON_SELECTED_COLOR
            } else {
                BUTTON_COLOR
            };
            draw_filled_rect_mut(
                &mut image,
                Rect::at(20, y as i32)
                    .of_size(SCREEN_SIZE - 40, BUTTON_HEIGHT),
                color,
            );
            self.text_centered(
                &mut image,
                y as i32 + 10,
                16.0,
                COLOR_WHITE,
                label,
            );
            y += BUTTON_HEIGHT + BUTTON_MARGIN;
        }

        if options.len() > per_page {
            let total_pages = options.len().div_ceil(per_page);
            let page_text = format!("{}/{}", page + 1, total_pages);
            self.text(
                &mut image,
                SCREEN_SIZE as i32 - 40,
                2,
                12.0,
                COLOR_WHITE,
                &page_text,
            );
        }
        image
    }

    /// Centered lines of text on a black background.
    pub fn render_many_text(&self, lines: &[String]) -> RgbImage {
        let mut image = self.blank();
        let mut y = 10;
        for line in lines {
            self.text_centered(&mut image, y, 16.0, COLOR_WHITE, line);
            y += 21;
        }
        image
    }

    /// A full-screen image with caption text along the top and bottom edges.
    pub fn render_image_with_caption(
        &self,
        base: &RgbImage,
        top: &str,
        bottom: &str,
    ) -> RgbImage {
        let mut image = self.blank();
        for (x, y, pixel) in base.enumerate_pixels() {
            if x < SCREEN_SIZE && y < SCREEN_SIZE {
                image.put_pixel(x, y, *pixel);
            }
        }
        self.text(&mut image, 1, 0, 16.0, COLOR_CAPTION, top);
        self.text(
            &mut image,
            1,
            SCREEN_SIZE as i32 - 20,
            16.0,
            COLOR_CAPTION,
            bottom,
        );
        image
    }
}

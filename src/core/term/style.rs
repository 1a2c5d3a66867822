//! Styled text primitives
//!
//! This module defines the color model and run attributes produced by the
//! ANSI decoder. Indexed colors are resolved to concrete RGB values at the
//! time an SGR parameter is applied, so consumers only ever see `Default`
//! or `Rgb`.

use bitflags::bitflags;

/// Color definition
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Color {
    /// The consumer's default foreground (or background) color
    #[default]
    Default,
    Rgb(u8, u8, u8),
}

/// Standard xterm 16-color palette (normal + bright).
const PALETTE_16: [(u8, u8, u8); 16] = [
    (0, 0, 0),       // black
    (205, 0, 0),     // red
    (0, 205, 0),     // green
    (205, 205, 0),   // yellow
    (0, 0, 238),     // blue
    (205, 0, 205),   // magenta
    (0, 205, 205),   // cyan
    (229, 229, 229), // white
    (127, 127, 127), // bright black
    (255, 0, 0),     // bright red
    (0, 255, 0),     // bright green
    (255, 255, 0),   // bright yellow
    (92, 92, 255),   // bright blue
    (255, 0, 255),   // bright magenta
    (0, 255, 255),   // bright cyan
    (255, 255, 255), // bright white
];

impl Color {
    /// Resolve an xterm 256-color index to RGB.
    ///
    /// 0-15 is the standard palette, 16-231 the 6x6x6 cube, 232-255 the
    /// grayscale ramp.
    pub fn from_index(n: u8) -> Self {
        match n {
            0..=15 => {
                let (r, g, b) = PALETTE_16[n as usize];
                Color::Rgb(r, g, b)
            }
            16..=231 => {
                let n = n - 16;
                let cube = |c: u8| if c == 0 { 0 } else { 55 + 40 * c };
                Color::Rgb(cube(n / 36), cube((n / 6) % 6), cube(n % 6))
            }
            232..=255 => {
                let gray = 8 + 10 * (n - 232);
                Color::Rgb(gray, gray, gray)
            }
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct StyleFlags: u8 {
        const BOLD      = 0b0001;
        const ITALIC    = 0b0010;
        const UNDERLINE = 0b0100;
        const INVERSE   = 0b1000;
    }
}

/// Current SGR attributes carried between decoded chunks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TextStyle {
    pub fg: Color,
    /// `None` means no background highlight at all (distinct from the
    /// consumer's default background color)
    pub bg: Option<Color>,
    pub flags: StyleFlags,
}

impl TextStyle {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Resolve inverse video into concrete foreground/background colors.
    ///
    /// With no explicit background set, inverse renders the default
    /// foreground as text over the current foreground as highlight. With
    /// an explicit background already set, inverse performs no swap and
    /// the explicit colors stand.
    pub fn effective(&self) -> (Color, Option<Color>) {
        if self.flags.contains(StyleFlags::INVERSE) && self.bg.is_none() {
            (Color::Default, Some(self.fg))
        } else {
            (self.fg, self.bg)
        }
    }
}

/// One stretch of output text rendered with a single style.
///
/// Concatenating `text` over a decoded sequence of runs yields exactly the
/// decoded plain text; no escape bytes ever appear here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StyledRun {
    pub text: String,
    pub foreground: Color,
    pub background: Option<Color>,
    pub bold: bool,
    pub italic: bool,
    pub underlined: bool,
}

impl StyledRun {
    pub(crate) fn new(text: String, style: &TextStyle) -> Self {
        let (foreground, background) = style.effective();
        Self {
            text,
            foreground,
            background,
            bold: style.flags.contains(StyleFlags::BOLD),
            italic: style.flags.contains(StyleFlags::ITALIC),
            underlined: style.flags.contains(StyleFlags::UNDERLINE),
        }
    }

    /// A run in the default style, used for synthesized diagnostics.
    pub(crate) fn plain(text: String) -> Self {
        Self::new(text, &TextStyle::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cube_and_grayscale_indices() {
        assert_eq!(Color::from_index(196), Color::Rgb(255, 0, 0));
        assert_eq!(Color::from_index(16), Color::Rgb(0, 0, 0));
        assert_eq!(Color::from_index(231), Color::Rgb(255, 255, 255));
        assert_eq!(Color::from_index(232), Color::Rgb(8, 8, 8));
        assert_eq!(Color::from_index(255), Color::Rgb(238, 238, 238));
    }

    #[test]
    fn inverse_swaps_only_without_explicit_background() {
        let mut style = TextStyle {
            fg: Color::from_index(1),
            bg: None,
            flags: StyleFlags::INVERSE,
        };
        assert_eq!(
            style.effective(),
            (Color::Default, Some(Color::Rgb(205, 0, 0)))
        );

        style.bg = Some(Color::Rgb(0, 0, 0));
        assert_eq!(
            style.effective(),
            (Color::Rgb(205, 0, 0), Some(Color::Rgb(0, 0, 0)))
        );
    }
}

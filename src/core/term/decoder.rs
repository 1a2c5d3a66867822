//! ANSI escape sequence decoder
//!
//! Decodes a raw terminal byte stream into styled runs. Only SGR sequences
//! affect the output; every other recognized control form (cursor movement,
//! erase, mode set/reset, OSC title updates, charset selection) is consumed
//! and discarded so no escape bytes ever reach the text.
//!
//! The decoder is incremental: all parser state, the current SGR style, any
//! partial escape sequence, and any partial UTF-8 character are carried
//! between calls, so the byte stream may be fed in arbitrary chunks and the
//! result is identical to decoding it in one piece.
//!
//! Completed runs are released only when a line terminates with `\n`. The
//! current unterminated line stays inside the decoder (see [`AnsiDecoder::pending`])
//! because a carriage return may still discard it: `\r` not followed by
//! `\n` marks the start of the line, and only the last write before the
//! next `\n` survives. That is enough to collapse progress-bar style
//! redraws without a cursor grid.

use tracing::debug;

use super::style::{Color, StyleFlags, StyledRun, TextStyle};

#[derive(Clone, Copy, Default, PartialEq)]
enum DecodeState {
    #[default]
    Ground,
    Escape,
    EscapeIntermediate,
    Csi,
    OscString,
    /// ESC received within OSC, waiting for the ST backslash
    EscapeInOsc,
}

/// Incremental ANSI/SGR decoder producing styled runs.
pub struct AnsiDecoder {
    state: DecodeState,
    style: TextStyle,
    params: Vec<u16>,
    current_param: Option<u16>,
    csi_private: bool,
    csi_intermediate: bool,
    /// Partial UTF-8 sequence carried across chunks
    utf8: Vec<u8>,
    /// Segments of the current, not yet newline-terminated line
    line: Vec<(TextStyle, String)>,
    /// A `\r` was seen and the next printable byte restarts the line
    cr_pending: bool,
}

impl Default for AnsiDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl AnsiDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Ground,
            style: TextStyle::default(),
            params: Vec::with_capacity(16),
            current_param: None,
            csi_private: false,
            csi_intermediate: false,
            utf8: Vec::with_capacity(4),
            line: Vec::new(),
            cr_pending: false,
        }
    }

    /// Decode a chunk of raw bytes.
    ///
    /// Returns the runs completed by this chunk (lines terminated by `\n`).
    /// Text on the current unterminated line stays pending until the line
    /// completes or [`flush`](Self::flush) is called.
    pub fn decode(&mut self, bytes: &[u8]) -> Vec<StyledRun> {
        let mut out = Vec::new();
        for &byte in bytes {
            self.feed(byte, &mut out);
        }
        out
    }

    /// Styled runs for the current unterminated line.
    pub fn pending(&self) -> Vec<StyledRun> {
        self.line
            .iter()
            .map(|(style, text)| StyledRun::new(text.clone(), style))
            .collect()
    }

    /// Drain the current unterminated line into runs (stream end).
    pub fn flush(&mut self) -> Vec<StyledRun> {
        self.cr_pending = false;
        self.utf8.clear();
        self.line
            .drain(..)
            .map(|(style, text)| StyledRun::new(text, &style))
            .collect()
    }

    /// Drop pending line text while keeping the style and any partial
    /// escape sequence, so a buffer clear does not reset color context.
    pub fn clear_pending(&mut self) {
        self.line.clear();
        self.cr_pending = false;
    }

    fn feed(&mut self, byte: u8, out: &mut Vec<StyledRun>) {
        // C0 controls take effect in any state except inside an OSC string
        if byte < 0x20
            && self.state != DecodeState::OscString
            && self.state != DecodeState::EscapeInOsc
        {
            // A control byte interrupting a multi-byte character voids it
            self.utf8.clear();
            match byte {
                0x1B => self.enter_escape(),
                b'\n' => self.newline(out),
                b'\r' => self.cr_pending = true,
                b'\t' => self.push_char('\t'),
                // BEL, backspace and the rest have no effect on linear text
                _ => {}
            }
            return;
        }

        match self.state {
            DecodeState::Ground => self.text_byte(byte),
            DecodeState::Escape => self.escape(byte),
            DecodeState::EscapeIntermediate => self.escape_intermediate(byte),
            DecodeState::Csi => self.csi(byte),
            DecodeState::OscString => self.osc_string(byte),
            DecodeState::EscapeInOsc => self.escape_in_osc(byte),
        }
    }

    fn enter_escape(&mut self) {
        self.state = DecodeState::Escape;
        self.params.clear();
        self.current_param = None;
        self.csi_private = false;
        self.csi_intermediate = false;
    }

    fn escape(&mut self, byte: u8) {
        match byte {
            b'[' => self.state = DecodeState::Csi,
            b']' => self.state = DecodeState::OscString,
            0x20..=0x2F => self.state = DecodeState::EscapeIntermediate,
            // Any other single-character sequence (charset select, index,
            // reset, ...) is consumed without effect
            _ => self.state = DecodeState::Ground,
        }
    }

    fn escape_intermediate(&mut self, byte: u8) {
        match byte {
            0x20..=0x2F => {}
            _ => self.state = DecodeState::Ground,
        }
    }

    fn csi(&mut self, byte: u8) {
        match byte {
            b'0'..=b'9' => {
                let digit = (byte - b'0') as u16;
                self.current_param = Some(
                    self.current_param
                        .unwrap_or(0)
                        .saturating_mul(10)
                        .saturating_add(digit),
                );
            }
            // Subparameter colons are treated as regular separators, so
            // 38:5:N and 38;5;N parse identically
            b';' | b':' => {
                self.params.push(self.current_param.take().unwrap_or(0));
            }
            b'<'..=b'?' => self.csi_private = true,
            0x20..=0x2F => self.csi_intermediate = true,
            0x40..=0x7E => {
                if let Some(p) = self.current_param.take() {
                    self.params.push(p);
                }
                if byte == b'm' && !self.csi_private && !self.csi_intermediate {
                    self.apply_sgr();
                } else {
                    debug!(
                        "discarding CSI: params={:?}, final={:?}",
                        self.params, byte as char
                    );
                }
                self.state = DecodeState::Ground;
            }
            _ => self.state = DecodeState::Ground,
        }
    }

    fn osc_string(&mut self, byte: u8) {
        match byte {
            // BEL or ST terminates; the payload (window title etc.) is
            // irrelevant to a text pane and dropped outright
            0x07 | 0x9C => self.state = DecodeState::Ground,
            0x1B => self.state = DecodeState::EscapeInOsc,
            _ => {}
        }
    }

    fn escape_in_osc(&mut self, byte: u8) {
        if byte == b'\\' {
            // ST (ESC \)
            self.state = DecodeState::Ground;
        } else {
            // Not ST; abandon the OSC and treat this as a fresh sequence
            self.enter_escape();
            self.escape(byte);
        }
    }

    fn text_byte(&mut self, byte: u8) {
        if self.utf8.is_empty() && byte < 0x80 {
            self.push_char(byte as char);
            return;
        }

        self.utf8.push(byte);
        loop {
            match std::str::from_utf8(&self.utf8) {
                Ok(s) => {
                    let chars: Vec<char> = s.chars().collect();
                    for ch in chars {
                        self.push_char(ch);
                    }
                    self.utf8.clear();
                    return;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    if valid > 0 {
                        if let Ok(s) = std::str::from_utf8(&self.utf8[..valid]) {
                            let chars: Vec<char> = s.chars().collect();
                            for ch in chars {
                                self.push_char(ch);
                            }
                        }
                        self.utf8.drain(..valid);
                        continue;
                    }
                    match e.error_len() {
                        // Incomplete tail; wait for the next chunk
                        None => return,
                        // Invalid bytes are skipped, like any undecodable input
                        Some(n) => {
                            self.utf8.drain(..n);
                            if self.utf8.is_empty() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    fn push_char(&mut self, ch: char) {
        if self.cr_pending {
            // Overwrite from the start of the line; earlier writes on this
            // logical line are gone
            self.line.clear();
            self.cr_pending = false;
        }
        match self.line.last_mut() {
            Some((style, text)) if *style == self.style => text.push(ch),
            _ => self.line.push((self.style, String::from(ch))),
        }
    }

    fn newline(&mut self, out: &mut Vec<StyledRun>) {
        // \r\n is a plain newline; the pending overwrite is cancelled
        self.cr_pending = false;
        match self.line.last_mut() {
            Some((style, text)) if *style == self.style => text.push('\n'),
            _ => self.line.push((self.style, String::from('\n'))),
        }
        for (style, text) in self.line.drain(..) {
            out.push(StyledRun::new(text, &style));
        }
    }

    fn apply_sgr(&mut self) {
        let params = std::mem::take(&mut self.params);
        if params.is_empty() {
            self.style.reset();
            return;
        }

        let mut iter = params.iter().copied();
        while let Some(param) = iter.next() {
            match param {
                0 => self.style.reset(),
                1 => self.style.flags |= StyleFlags::BOLD,
                3 => self.style.flags |= StyleFlags::ITALIC,
                4 => self.style.flags |= StyleFlags::UNDERLINE,
                7 => self.style.flags |= StyleFlags::INVERSE,

                22 => self.style.flags &= !StyleFlags::BOLD,
                23 => self.style.flags &= !StyleFlags::ITALIC,
                24 => self.style.flags &= !StyleFlags::UNDERLINE,
                27 => self.style.flags &= !StyleFlags::INVERSE,

                30..=37 => self.style.fg = Color::from_index((param - 30) as u8),
                38 => {
                    if let Some(color) = extended_color(&mut iter) {
                        self.style.fg = color;
                    }
                }
                39 => self.style.fg = Color::Default,

                40..=47 => self.style.bg = Some(Color::from_index((param - 40) as u8)),
                48 => {
                    if let Some(color) = extended_color(&mut iter) {
                        self.style.bg = Some(color);
                    }
                }
                49 => self.style.bg = None,

                90..=97 => self.style.fg = Color::from_index((param - 90 + 8) as u8),
                100..=107 => self.style.bg = Some(Color::from_index((param - 100 + 8) as u8)),

                _ => {}
            }
        }
    }
}

/// Extended color payload after SGR 38/48: `5;N` indexed or `2;R;G;B`.
fn extended_color(iter: &mut impl Iterator<Item = u16>) -> Option<Color> {
    match iter.next()? {
        5 => Some(Color::from_index(iter.next()?.min(255) as u8)),
        2 => {
            let r = iter.next()?.min(255) as u8;
            let g = iter.next()?.min(255) as u8;
            let b = iter.next()?.min(255) as u8;
            Some(Color::Rgb(r, g, b))
        }
        _ => None,
    }
}

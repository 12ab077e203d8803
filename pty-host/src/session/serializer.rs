// Buffer serializer - headless mirror of a session's terminal buffer
//
// Every chunk the client sees is also written here, so a replay can be
// produced without asking the process for anything. The emulator behind the
// mirror is pluggable; the default is a vt100 parser.

use super::command_detection::{CommandDetection, MarkerPosition, OscScanner};
use super::protocol::{ReplayEntry, ReplayEvent, UnicodeVersion};
use once_cell::sync::Lazy;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerializeOptions {
    /// Maximum number of history lines above the viewport
    pub scrollback: usize,
    pub exclude_alt_buffer: bool,
    pub exclude_modes: bool,
}

/// Serialized buffer contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorSnapshot {
    pub data: String,
    /// Absolute line shown on the first row of `data`
    pub first_line: u64,
}

/// A write-only terminal buffer that can render itself back to escape sequences
pub trait TerminalMirror: Send {
    fn write(&mut self, data: &str);
    fn resize(&mut self, cols: u16, rows: u16);
    fn clear(&mut self);
    /// (cols, rows)
    fn dimensions(&self) -> (u16, u16);
    /// Cursor position. Lines are absolute and never reused, even after the
    /// lines above them are trimmed from scrollback.
    fn cursor(&mut self) -> MarkerPosition;
    /// Absolute line of the oldest line still retained
    fn oldest_line(&self) -> u64;
    fn serialize(&mut self, options: &SerializeOptions) -> MirrorSnapshot;
    fn set_unicode_version(&mut self, _version: UnicodeVersion) {}
}

/// Creates mirrors; one engine is shared by every session in a host
pub trait MirrorEngine: Send + Sync {
    fn create(&self, cols: u16, rows: u16, scrollback: usize) -> Box<dyn TerminalMirror>;
}

static DEFAULT_ENGINE: Lazy<Arc<dyn MirrorEngine>> = Lazy::new(|| Arc::new(Vt100Engine));

/// The process-wide default engine, created on first use
pub fn default_engine() -> Arc<dyn MirrorEngine> {
    Arc::clone(&DEFAULT_ENGINE)
}

pub struct Vt100Engine;

impl MirrorEngine for Vt100Engine {
    fn create(&self, cols: u16, rows: u16, scrollback: usize) -> Box<dyn TerminalMirror> {
        Box::new(Vt100Mirror::new(cols, rows, scrollback))
    }
}

/// Output is fed to the parser in pieces of at most this many bytes. The
/// parser keeps this many extra history lines so the lines pushed by one
/// piece can be counted exactly.
const WRITE_PIECE: usize = 64;

pub struct Vt100Mirror {
    parser: vt100::Parser,
    scrollback: usize,
    /// Lines pushed into the normal screen's history
    scrolled: u64,
    /// History length of the normal screen as of the last count
    history: usize,
    /// The normal screen's scrollback offset is parked at 1. vt100 bumps the
    /// offset once for every line pushed into history, which is the only way
    /// it exposes that count once history is full.
    armed: bool,
}

impl Vt100Mirror {
    pub fn new(cols: u16, rows: u16, scrollback: usize) -> Self {
        Self {
            parser: vt100::Parser::new(rows.max(1), cols.max(1), scrollback + WRITE_PIECE + 1),
            scrollback,
            scrolled: 0,
            history: 0,
            armed: false,
        }
    }

    /// History length of the active screen. The alternate screen never has any.
    fn history_len(&mut self) -> usize {
        self.parser.set_scrollback(usize::MAX);
        let len = self.parser.screen().scrollback();
        self.parser.set_scrollback(0);
        len
    }

    fn arm(&mut self) {
        if self.armed || self.parser.screen().alternate_screen() {
            return;
        }
        self.history = self.history_len();
        self.parser.set_scrollback(1);
        self.armed = true;
    }

    /// Collect the count once the normal screen is active again
    fn settle(&mut self) {
        if !self.armed || self.parser.screen().alternate_screen() {
            return;
        }
        let offset = self.parser.screen().scrollback();
        let len = self.history_len();
        // Offset 0 means history was empty when armed, or was reset since
        let pushed = if offset == 0 { len } else { offset - 1 };
        self.scrolled += pushed as u64;
        self.history = len;
        self.armed = false;
    }
}

impl TerminalMirror for Vt100Mirror {
    fn write(&mut self, data: &str) {
        for piece in data.as_bytes().chunks(WRITE_PIECE) {
            self.arm();
            self.parser.process(piece);
            self.settle();
        }
    }

    fn resize(&mut self, cols: u16, rows: u16) {
        self.parser.set_size(rows.max(1), cols.max(1));
    }

    fn clear(&mut self) {
        let (rows, cols) = self.parser.screen().size();
        *self = Self::new(cols, rows, self.scrollback);
    }

    fn dimensions(&self) -> (u16, u16) {
        let (rows, cols) = self.parser.screen().size();
        (cols, rows)
    }

    fn cursor(&mut self) -> MarkerPosition {
        let (row, col) = self.parser.screen().cursor_position();
        MarkerPosition {
            line: self.scrolled + u64::from(row),
            x: col,
        }
    }

    fn oldest_line(&self) -> u64 {
        self.scrolled
            .saturating_sub(self.history.min(self.scrollback) as u64)
    }

    fn serialize(&mut self, options: &SerializeOptions) -> MirrorSnapshot {
        let (rows, cols) = self.parser.screen().size();
        let mut out: Vec<u8> = Vec::new();

        let history = self
            .history_len()
            .min(options.scrollback)
            .min(usize::from(u16::MAX - rows));
        if history > 0 {
            // vt100 scrolls back at most one screen, so grow the grid until
            // the whole history fits on it, then shrink it back. Growing
            // appends blank rows below the screen; shrinking drops them.
            self.parser.set_size(rows + history as u16, cols);
            self.parser.set_scrollback(history);
            // Any width other than the grid's keeps rows from being joined
            // as soft wraps, so each row renders on its own line
            let screen = self.parser.screen();
            for row in screen.rows_formatted(0, cols.saturating_add(1)).take(history) {
                out.extend_from_slice(&row);
                out.extend_from_slice(b"\x1b[m\r\n");
            }
            self.parser.set_scrollback(0);
            self.parser.set_size(rows, cols);

            // Push the history above the viewport before the screen is redrawn
            for _ in 1..rows {
                out.extend_from_slice(b"\r\n");
            }
        }

        let screen = self.parser.screen();
        let alternate = screen.alternate_screen();
        // The normal grid is not addressable while the alternate screen is up
        if !(options.exclude_alt_buffer && alternate) {
            if alternate {
                out.extend_from_slice(b"\x1b[?1049h");
            }
            out.extend_from_slice(&screen.contents_formatted());
            if !options.exclude_modes {
                out.extend_from_slice(&screen.input_mode_formatted());
            }
        }

        MirrorSnapshot {
            data: String::from_utf8_lossy(&out).into_owned(),
            first_line: self.scrolled.saturating_sub(history as u64),
        }
    }
}

pub struct BufferSerializer {
    mirror: Box<dyn TerminalMirror>,
    scanner: OscScanner,
    commands: CommandDetection,
    raw_revive_buffer: Option<String>,
    scrollback: usize,
    unicode_version: UnicodeVersion,
}

impl BufferSerializer {
    /// `revive_text` is written into the mirror before any live output;
    /// `raw_revive_buffer` is the verbatim snapshot replayed while nothing changed.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: &dyn MirrorEngine,
        cols: u16,
        rows: u16,
        scrollback: usize,
        unicode_version: UnicodeVersion,
        revive_text: Option<&str>,
        raw_revive_buffer: Option<String>,
        nonce: Option<String>,
    ) -> Self {
        let mut mirror = engine.create(cols, rows, scrollback);
        mirror.set_unicode_version(unicode_version);
        if let Some(text) = revive_text {
            mirror.write(text);
            mirror.write("\r\n");
        }
        Self {
            mirror,
            scanner: OscScanner::default(),
            commands: CommandDetection::new(nonce),
            raw_revive_buffer,
            scrollback,
            unicode_version,
        }
    }

    /// Record a chunk of live output
    pub fn handle_data(&mut self, chunk: &str) {
        let mut written = 0;
        for (end, payload) in self.scanner.feed(chunk) {
            self.mirror.write(&chunk[written..end]);
            written = end;
            let pos = self.mirror.cursor();
            self.commands.handle_sequence(&payload, pos);
        }
        if written < chunk.len() {
            self.mirror.write(&chunk[written..]);
        }
        self.commands.trim(self.mirror.oldest_line());
    }

    pub fn handle_resize(&mut self, cols: u16, rows: u16) {
        self.mirror.resize(cols, rows);
    }

    pub fn clear(&mut self) {
        self.mirror.clear();
        self.commands.clear();
    }

    pub fn free_raw_revive_buffer(&mut self) {
        self.raw_revive_buffer = None;
    }

    pub fn has_raw_revive_buffer(&self) -> bool {
        self.raw_revive_buffer.is_some()
    }

    pub fn set_unicode_version(&mut self, version: UnicodeVersion) {
        self.unicode_version = version;
        self.mirror.set_unicode_version(version);
    }

    pub fn unicode_version(&self) -> UnicodeVersion {
        self.unicode_version
    }

    pub fn set_next_command_id(&mut self, command_line: String, id: String) {
        self.commands.set_next_command_id(command_line, id);
    }

    pub fn shell_integration_cwd(&self) -> Option<&str> {
        self.commands.cwd()
    }

    pub fn generate_replay_event(
        &mut self,
        normal_buffer_only: bool,
        restore_to_last_revive_buffer: bool,
    ) -> ReplayEvent {
        let (cols, rows) = self.mirror.dimensions();
        let (data, first_line) = match (&self.raw_revive_buffer, restore_to_last_revive_buffer) {
            (Some(raw), true) => (raw.clone(), self.mirror.oldest_line()),
            _ => {
                let snapshot = self.mirror.serialize(&SerializeOptions {
                    scrollback: self.scrollback,
                    exclude_alt_buffer: normal_buffer_only,
                    exclude_modes: normal_buffer_only,
                });
                (snapshot.data, snapshot.first_line)
            }
        };
        ReplayEvent {
            events: vec![ReplayEntry { cols, rows, data }],
            commands: self.commands.serialize(first_line),
        }
    }
}

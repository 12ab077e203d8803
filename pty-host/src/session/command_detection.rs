// Shell integration command detection
//
// Watches the output stream for OSC 633 (and the older OSC 133 / OSC 7)
// sequences emitted by the integration scripts and records prompt/command
// boundaries as absolute buffer lines.

use super::paths::sanitize_cwd;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

/// Upper bound on a single OSC payload; longer sequences are discarded
const MAX_OSC_PAYLOAD: usize = 64 * 1024;

static OSC_ESCAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\\(\\|x([0-9a-f]{2}))").expect("valid regex"));

/// Undo the escaping integration scripts apply to OSC 633 arguments:
/// `\\` becomes `\` and `\xAB` becomes the byte 0xAB.
pub fn deserialize_osc_message(message: &str) -> String {
    OSC_ESCAPE
        .replace_all(message, |caps: &Captures| match caps.get(2) {
            Some(hex) => u8::from_str_radix(hex.as_str(), 16)
                .map(|b| char::from(b).to_string())
                .unwrap_or_default(),
            None => caps[1].to_string(),
        })
        .into_owned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Ground,
    Escape,
    Osc,
    OscEscape,
}

/// Incremental OSC extractor; sequences may span chunk boundaries
#[derive(Debug)]
pub struct OscScanner {
    state: ScanState,
    payload: String,
    overflowed: bool,
}

impl Default for OscScanner {
    fn default() -> Self {
        Self {
            state: ScanState::Ground,
            payload: String::new(),
            overflowed: false,
        }
    }
}

impl OscScanner {
    /// Feed a chunk. Returns, for each OSC terminated inside it, the byte
    /// offset just past the terminator together with the payload.
    pub fn feed(&mut self, chunk: &str) -> Vec<(usize, String)> {
        let mut completed = Vec::new();
        for (i, c) in chunk.char_indices() {
            match self.state {
                ScanState::Ground => {
                    if c == '\x1b' {
                        self.state = ScanState::Escape;
                    }
                }
                ScanState::Escape => {
                    self.state = match c {
                        ']' => {
                            self.payload.clear();
                            self.overflowed = false;
                            ScanState::Osc
                        }
                        '\x1b' => ScanState::Escape,
                        _ => ScanState::Ground,
                    };
                }
                ScanState::Osc => match c {
                    '\x07' => {
                        self.finish(i + c.len_utf8(), &mut completed);
                    }
                    '\x1b' => self.state = ScanState::OscEscape,
                    _ => {
                        if self.payload.len() >= MAX_OSC_PAYLOAD {
                            self.overflowed = true;
                        } else {
                            self.payload.push(c);
                        }
                    }
                },
                ScanState::OscEscape => {
                    if c == '\\' {
                        self.finish(i + 1, &mut completed);
                    } else if c == ']' {
                        self.payload.clear();
                        self.overflowed = false;
                        self.state = ScanState::Osc;
                    } else if c == '\x1b' {
                        self.state = ScanState::Escape;
                    } else {
                        self.state = ScanState::Ground;
                    }
                }
            }
        }
        completed
    }

    fn finish(&mut self, end: usize, completed: &mut Vec<(usize, String)>) {
        self.state = ScanState::Ground;
        let payload = std::mem::take(&mut self.payload);
        if !self.overflowed {
            completed.push((end, payload));
        }
        self.overflowed = false;
    }
}

/// A finished (or in-progress) command as carried in replay events
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedCommand {
    pub prompt_start_line: Option<u64>,
    pub start_line: Option<u64>,
    pub start_x: Option<u16>,
    pub end_line: Option<u64>,
    pub executed_line: Option<u64>,
    pub executed_x: Option<u16>,
    pub command: String,
    pub is_trusted: bool,
    pub cwd: Option<String>,
    pub exit_code: Option<i32>,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl SerializedCommand {
    /// Earliest line any marker of this command sits on
    fn first_line(&self) -> Option<u64> {
        self.prompt_start_line
            .or(self.start_line)
            .or(self.executed_line)
            .or(self.end_line)
    }

    /// Shift every marker so `origin` becomes line 0
    fn rebased(&self, origin: u64) -> Self {
        let shift = |line: Option<u64>| line.map(|l| l.saturating_sub(origin));
        Self {
            prompt_start_line: shift(self.prompt_start_line),
            start_line: shift(self.start_line),
            end_line: shift(self.end_line),
            executed_line: shift(self.executed_line),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedCommandDetection {
    pub is_windows_pty: bool,
    pub has_rich_command_detection: bool,
    pub commands: Vec<SerializedCommand>,
}

/// Cursor location at the point a sequence was seen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkerPosition {
    /// Absolute line, counted from the first line ever written. It keeps
    /// growing after old lines are trimmed from scrollback.
    pub line: u64,
    pub x: u16,
}

#[derive(Debug, Default)]
pub struct CommandDetection {
    nonce: Option<String>,
    current: SerializedCommand,
    commands: Vec<SerializedCommand>,
    cwd: Option<String>,
    is_windows_pty: bool,
    has_rich_command_detection: bool,
    next_command_id: Option<(String, String)>,
}

impl CommandDetection {
    pub fn new(nonce: Option<String>) -> Self {
        Self {
            nonce,
            ..Default::default()
        }
    }

    pub fn cwd(&self) -> Option<&str> {
        self.cwd.as_deref()
    }

    /// Tag the next finished command whose command line matches with `id`
    pub fn set_next_command_id(&mut self, command_line: String, id: String) {
        self.next_command_id = Some((command_line, id));
    }

    /// Handle one OSC payload (without the introducer/terminator)
    pub fn handle_sequence(&mut self, payload: &str, pos: MarkerPosition) {
        let (ident, data) = payload.split_once(';').unwrap_or((payload, ""));
        match ident {
            "633" => self.handle_vscode_sequence(data, pos),
            "133" => self.handle_final_term_sequence(data, pos),
            "7" => {
                if let Some(cwd) = cwd_from_file_uri(data) {
                    self.cwd = Some(cwd);
                }
            }
            _ => {}
        }
    }

    fn handle_final_term_sequence(&mut self, data: &str, pos: MarkerPosition) {
        let mut parts = data.split(';');
        match parts.next().unwrap_or("") {
            "A" => self.prompt_start(pos),
            "B" => self.command_start(pos),
            "C" => self.command_executed(pos),
            "D" => self.command_finished(parts.next(), pos),
            _ => {}
        }
    }

    fn handle_vscode_sequence(&mut self, data: &str, pos: MarkerPosition) {
        let mut parts = data.split(';');
        match parts.next().unwrap_or("") {
            "A" => self.prompt_start(pos),
            "B" => self.command_start(pos),
            "C" => self.command_executed(pos),
            "D" => self.command_finished(parts.next(), pos),
            "E" => {
                let command_line = parts.next().map(deserialize_osc_message).unwrap_or_default();
                let nonce = parts.next();
                self.current.is_trusted =
                    matches!((nonce, self.nonce.as_deref()), (Some(got), Some(want)) if got == want);
                self.current.command = command_line;
            }
            "P" => {
                let Some(property) = parts.next().map(deserialize_osc_message) else {
                    return;
                };
                let Some((key, value)) = property.split_once('=') else {
                    return;
                };
                match key {
                    "Cwd" => self.cwd = Some(sanitize_cwd(value)),
                    "IsWindows" => self.is_windows_pty = value.eq_ignore_ascii_case("true"),
                    "HasRichCommandDetection" => {
                        self.has_rich_command_detection = value.eq_ignore_ascii_case("true")
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    fn prompt_start(&mut self, pos: MarkerPosition) {
        self.current = SerializedCommand {
            prompt_start_line: Some(pos.line),
            ..Default::default()
        };
    }

    fn command_start(&mut self, pos: MarkerPosition) {
        self.current.start_line = Some(pos.line);
        self.current.start_x = Some(pos.x);
    }

    fn command_executed(&mut self, pos: MarkerPosition) {
        self.current.executed_line = Some(pos.line);
        self.current.executed_x = Some(pos.x);
    }

    fn command_finished(&mut self, exit_code: Option<&str>, pos: MarkerPosition) {
        let mut finished = std::mem::take(&mut self.current);
        // An empty prompt submission never executes anything
        if finished.executed_line.is_none() {
            return;
        }
        finished.end_line = Some(pos.line);
        finished.exit_code = exit_code.and_then(|c| c.trim().parse().ok());
        finished.cwd = self.cwd.clone();
        finished.timestamp = chrono::Utc::now().timestamp_millis();
        if let Some((command_line, id)) = self.next_command_id.take() {
            if command_line == finished.command {
                finished.id = Some(id);
            } else {
                self.next_command_id = Some((command_line, id));
            }
        }
        self.commands.push(finished);
    }

    pub fn commands(&self) -> &[SerializedCommand] {
        &self.commands
    }

    /// Drop all markers; they referred to buffer lines that no longer exist
    pub fn clear(&mut self) {
        self.commands.clear();
        self.current = SerializedCommand::default();
    }

    /// Forget commands that start above `oldest_line`, the oldest line
    /// still held in scrollback
    pub fn trim(&mut self, oldest_line: u64) {
        let retained = |command: &SerializedCommand| {
            command.first_line().map_or(true, |line| line >= oldest_line)
        };
        self.commands.retain(|command| retained(command));
        if !retained(&self.current) {
            self.current = SerializedCommand::default();
        }
    }

    /// Commands with lines relative to `first_line`, the absolute line that
    /// the first row of the replayed buffer holds
    pub fn serialize(&self, first_line: u64) -> SerializedCommandDetection {
        let in_buffer = |command: &&SerializedCommand| {
            command.first_line().map_or(false, |line| line >= first_line)
        };
        let mut commands: Vec<SerializedCommand> = self
            .commands
            .iter()
            .filter(in_buffer)
            .map(|command| command.rebased(first_line))
            .collect();
        if self.current.start_line.is_some() && in_buffer(&&self.current) {
            commands.push(self.current.rebased(first_line));
        }
        SerializedCommandDetection {
            is_windows_pty: self.is_windows_pty,
            has_rich_command_detection: self.has_rich_command_detection,
            commands,
        }
    }
}

/// `file://host/some%20dir` -> `/some dir`
fn cwd_from_file_uri(uri: &str) -> Option<String> {
    let rest = uri.strip_prefix("file://")?;
    let path = &rest[rest.find('/')?..];
    let bytes = path.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let Some(Ok(b)) = path.get(i + 1..i + 3).map(|hex| u8::from_str_radix(hex, 16)) {
                decoded.push(b);
                i += 3;
                continue;
            }
        }
        decoded.push(bytes[i]);
        i += 1;
    }
    Some(sanitize_cwd(&String::from_utf8_lossy(&decoded)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(line: u64, x: u16) -> MarkerPosition {
        MarkerPosition { line, x }
    }

    #[test]
    fn test_deserialize_osc_message() {
        assert_eq!(deserialize_osc_message(r"echo\x20hi\x3bthere"), "echo hi;there");
        assert_eq!(deserialize_osc_message(r"a\\b"), r"a\b");
        assert_eq!(deserialize_osc_message(r"\X41"), "A");
        assert_eq!(deserialize_osc_message("plain"), "plain");
    }

    #[test]
    fn test_scanner_handles_both_terminators() {
        let mut scanner = OscScanner::default();
        let chunk = "a\x1b]633;A\x07b\x1b]0;title\x1b\\c";
        let found = scanner.feed(chunk);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].1, "633;A");
        assert_eq!(&chunk[..found[0].0], "a\x1b]633;A\x07");
        assert_eq!(found[1].1, "0;title");
        assert_eq!(&chunk[found[1].0..], "c");
    }

    #[test]
    fn test_scanner_spans_chunks() {
        let mut scanner = OscScanner::default();
        assert!(scanner.feed("out\x1b]633;E;ls\\x20").is_empty());
        let found = scanner.feed("-la\x07rest");
        assert_eq!(found, vec![(4, r"633;E;ls\x20-la".to_string())]);
    }

    #[test]
    fn test_records_full_command_lifecycle() {
        let mut detection = CommandDetection::new(Some("n0nce".into()));
        detection.handle_sequence("633;P;Cwd=/home/me", at(0, 0));
        detection.handle_sequence("633;A", at(0, 0));
        detection.handle_sequence("633;B", at(0, 2));
        detection.handle_sequence(r"633;E;git\x20status;n0nce", at(0, 12));
        detection.handle_sequence("633;C", at(1, 0));
        detection.handle_sequence("633;D;0", at(4, 0));

        let serialized = detection.serialize(0);
        assert_eq!(serialized.commands.len(), 1);
        let command = &serialized.commands[0];
        assert_eq!(command.command, "git status");
        assert!(command.is_trusted);
        assert_eq!(command.prompt_start_line, Some(0));
        assert_eq!(command.start_x, Some(2));
        assert_eq!(command.executed_line, Some(1));
        assert_eq!(command.end_line, Some(4));
        assert_eq!(command.exit_code, Some(0));
        assert_eq!(command.cwd.as_deref(), Some("/home/me"));
    }

    #[test]
    fn test_wrong_nonce_is_untrusted_and_empty_prompt_dropped() {
        let mut detection = CommandDetection::new(Some("right".into()));
        detection.handle_sequence("633;A", at(0, 0));
        detection.handle_sequence("633;B", at(0, 2));
        detection.handle_sequence("633;D", at(1, 0));
        assert!(detection.commands().is_empty());

        detection.handle_sequence("633;A", at(1, 0));
        detection.handle_sequence("633;B", at(1, 2));
        detection.handle_sequence("633;E;rm\\x20-rf;wrong", at(1, 2));
        detection.handle_sequence("633;C", at(2, 0));
        detection.handle_sequence("633;D;1", at(3, 0));
        assert_eq!(detection.commands().len(), 1);
        assert!(!detection.commands()[0].is_trusted);
        assert_eq!(detection.commands()[0].exit_code, Some(1));
    }

    #[test]
    fn test_in_progress_command_is_serialized() {
        let mut detection = CommandDetection::new(None);
        detection.handle_sequence("133;A", at(5, 0));
        detection.handle_sequence("133;B", at(5, 2));
        let serialized = detection.serialize(0);
        assert_eq!(serialized.commands.len(), 1);
        assert_eq!(serialized.commands[0].end_line, None);
    }

    #[test]
    fn test_next_command_id_applies_to_matching_command() {
        let mut detection = CommandDetection::new(None);
        detection.set_next_command_id("make".into(), "cmd-1".into());
        for (line, name) in [(0, "ls"), (3, "make")] {
            detection.handle_sequence("633;A", at(line, 0));
            detection.handle_sequence("633;B", at(line, 2));
            detection.handle_sequence(&format!("633;E;{}", name), at(line, 2));
            detection.handle_sequence("633;C", at(line + 1, 0));
            detection.handle_sequence("633;D;0", at(line + 2, 0));
        }
        assert_eq!(detection.commands()[0].id, None);
        assert_eq!(detection.commands()[1].id.as_deref(), Some("cmd-1"));
    }

    #[test]
    fn test_properties_and_osc7() {
        let mut detection = CommandDetection::new(None);
        detection.handle_sequence("633;P;IsWindows=True", at(0, 0));
        detection.handle_sequence("633;P;HasRichCommandDetection=True", at(0, 0));
        detection.handle_sequence("7;file://host/tmp/some%20dir", at(0, 0));
        let serialized = detection.serialize(0);
        assert!(serialized.is_windows_pty);
        assert!(serialized.has_rich_command_detection);
        assert_eq!(detection.cwd(), Some("/tmp/some dir"));
    }

    #[test]
    fn test_clear_drops_markers() {
        let mut detection = CommandDetection::new(None);
        detection.handle_sequence("633;A", at(0, 0));
        detection.handle_sequence("633;B", at(0, 2));
        detection.handle_sequence("633;C", at(1, 0));
        detection.handle_sequence("633;D;0", at(2, 0));
        detection.clear();
        assert!(detection.serialize(0).commands.is_empty());
    }

    #[test]
    fn test_trim_drops_commands_that_scrolled_away() {
        let mut detection = CommandDetection::new(None);
        for line in [0, 10, 20] {
            detection.handle_sequence("633;A", at(line, 0));
            detection.handle_sequence("633;B", at(line, 2));
            detection.handle_sequence("633;C", at(line + 1, 0));
            detection.handle_sequence("633;D;0", at(line + 5, 0));
        }
        detection.handle_sequence("633;A", at(30, 0));
        detection.handle_sequence("633;B", at(30, 2));

        detection.trim(10);
        assert_eq!(detection.commands().len(), 2);

        let serialized = detection.serialize(12);
        let prompts: Vec<_> = serialized
            .commands
            .iter()
            .map(|c| c.prompt_start_line)
            .collect();
        assert_eq!(prompts, vec![Some(8), Some(18)]);
        assert_eq!(serialized.commands[0].end_line, Some(13));

        detection.trim(31);
        assert!(detection.commands().is_empty());
        assert!(detection.serialize(31).commands.is_empty());
    }
}

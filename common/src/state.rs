//! The engine: one live transfer and everything it owns.
//!
//! Ownership follows the data: the transfer state owns the staging buffer
//! and the byte rings, the calculator owns the history ring, the display
//! owns the compiled format and paint buffers. Nothing here is shared
//! across threads; signal handlers talk to the engine only through the
//! atomic flag block in [`crate::signal`].

use std::collections::VecDeque;
use std::os::unix::io::RawFd;

use crate::calc::CalcState;
use crate::config::ControlConfig;
use crate::display::DisplayState;

/// Exit-status bits, combined bitwise into the process exit code.
pub mod exitcode {
    /// An input could not be accessed.
    pub const ACCESS: i32 = 2;
    /// An input was the same file as the output.
    pub const SAME_FILE: i32 = 4;
    /// A file could not be closed or advanced.
    pub const CLOSE: i32 = 8;
    /// A transfer (read/write) error was fatal.
    pub const TRANSFER: i32 = 16;
    /// A terminating signal ended the run.
    pub const SIGNAL: i32 = 32;
    /// Memory allocation failed.
    pub const ALLOC: i32 = 64;
}

/// Upper bound for the `%A` last-written window.
pub const MAX_LASTWRITTEN: usize = 256;
/// Upper bound for the `%L` previous-line window.
pub const MAX_PREVLINE: usize = 1024;
/// Capacity of the ring recording output offsets of line terminators.
pub const MAX_LINE_POSITIONS: usize = 100_000;

/// Bounded ring of cumulative output byte positions, one per written line
/// terminator. Used to convert pipe back-pressure from bytes to lines.
#[derive(Debug, Default)]
pub struct LinePositionRing {
    positions: VecDeque<u64>,
}

impl LinePositionRing {
    pub fn record(&mut self, position: u64) {
        if self.positions.len() == MAX_LINE_POSITIONS {
            self.positions.pop_front();
        }
        self.positions.push_back(position);
    }

    /// Number of recorded terminators past the given output position,
    /// i.e. lines the consumer has not yet read. Walks backward so the
    /// cost is proportional to the in-pipe amount, not the history.
    pub fn count_after(&self, position: u64) -> u64 {
        self.positions
            .iter()
            .rev()
            .take_while(|recorded| **recorded > position)
            .count() as u64
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

/// State of the byte mover itself.
#[derive(Debug)]
pub struct TransferState {
    /// Staging buffer for the buffered path. `write_position ≤
    /// read_position ≤ buffer.len()` at all times.
    pub buffer: Vec<u8>,
    pub read_position: usize,
    pub write_position: usize,
    /// Total written since the start: bytes, or lines in line mode.
    pub total_written: u64,
    /// Total bytes written, regardless of line mode.
    pub out_bytes_total: u64,
    /// `total_written` minus whatever still sits unread in the output
    /// pipe. Never exceeds `total_written`.
    pub transferred: u64,
    pub written_but_not_consumed: u64,
    pub elapsed_seconds: f64,
    pub eof_in: bool,
    pub eof_out: bool,
    /// Byte offset within the current input, for error-skip alignment.
    pub input_offset: u64,
    pub read_errors_in_a_row: u64,
    pub last_read_skip_fd: RawFd,
    pub read_error_warning_shown: bool,
    /// Input descriptor splice() last refused; never retried on it.
    pub splice_failed_fd: RawFd,
    /// Whether the previous step moved data without the buffer.
    pub splice_used: bool,
    pub line_positions: LinePositionRing,
    /// Tail of recent output for `%A`; capacity settles at the largest
    /// requested window.
    pub last_written: VecDeque<u8>,
    pub lastwritten_capacity: usize,
    /// Completed previous line and the line currently being written, for
    /// `%L`.
    pub previous_line: Vec<u8>,
    pub in_flight_line: Vec<u8>,
    pub track_previous_line: bool,
}

impl Default for TransferState {
    fn default() -> Self {
        TransferState {
            buffer: Vec::new(),
            read_position: 0,
            write_position: 0,
            total_written: 0,
            out_bytes_total: 0,
            transferred: 0,
            written_but_not_consumed: 0,
            elapsed_seconds: 0.0,
            eof_in: false,
            eof_out: false,
            input_offset: 0,
            read_errors_in_a_row: 0,
            last_read_skip_fd: -1,
            read_error_warning_shown: false,
            splice_failed_fd: -1,
            splice_used: false,
            line_positions: LinePositionRing::default(),
            last_written: VecDeque::new(),
            lastwritten_capacity: 0,
            previous_line: Vec::new(),
            in_flight_line: Vec::new(),
            track_previous_line: false,
        }
    }
}

impl TransferState {
    /// Record `buffer[start..start + len]` as written output: count line
    /// terminators into the position ring and feed the last-written and
    /// previous-line windows. Works on indices into the staging buffer so
    /// no copy of the written range is needed.
    pub fn note_written_range(&mut self, start: usize, len: usize, delimiter: u8) -> u64 {
        let mut lines = 0;
        for index in 0..len {
            let byte = self.buffer[start + index];
            if byte == delimiter {
                lines += 1;
                self.line_positions
                    .record(self.out_bytes_total + index as u64 + 1);
            }
            if self.track_previous_line {
                if byte == delimiter {
                    self.previous_line = std::mem::take(&mut self.in_flight_line);
                } else if self.in_flight_line.len() < MAX_PREVLINE {
                    self.in_flight_line.push(byte);
                }
            }
            if self.lastwritten_capacity > 0 {
                if self.last_written.len() == self.lastwritten_capacity {
                    self.last_written.pop_front();
                }
                self.last_written.push_back(byte);
            }
        }
        self.out_bytes_total += len as u64;
        lines
    }
}

/// Program-level status: name for error reporting and the accumulated exit
/// bits.
#[derive(Debug)]
pub struct ProgramStatus {
    pub program_name: String,
    pub exit_status: i32,
    pub current_file: String,
}

impl Default for ProgramStatus {
    fn default() -> Self {
        ProgramStatus {
            program_name: "pmeter".to_string(),
            exit_status: 0,
            current_file: "(stdin)".to_string(),
        }
    }
}

/// One running transfer. There is at most one of these per process.
#[derive(Debug)]
pub struct Engine {
    pub control: ControlConfig,
    pub transfer: TransferState,
    pub calc: CalcState,
    pub display: DisplayState,
    pub status: ProgramStatus,
    /// Ordered inputs; `-` means standard input.
    pub input_files: Vec<String>,
    pub out_fd: RawFd,
    pub out_is_pipe: bool,
    pub cursor_row: Option<u16>,
    pub cursor_probed: bool,
}

impl Engine {
    pub fn new(control: ControlConfig) -> Engine {
        let calc = CalcState::new(control.average_rate_window);
        Engine {
            control,
            transfer: TransferState::default(),
            calc,
            display: DisplayState::default(),
            status: ProgramStatus::default(),
            input_files: Vec::new(),
            out_fd: libc::STDOUT_FILENO,
            out_is_pipe: false,
            cursor_row: None,
            cursor_probed: false,
        }
    }
}

//! The transfer core: advance the data movement by one bounded step.
//!
//! Each step reads as much as the caller's allowance permits and writes as
//! much as the output will accept, returning promptly; the per-call poll
//! timeouts keep a stalled peer from freezing the display. Two code paths
//! exist: a zero-copy path that splices directly between pipes, and a
//! buffered path through the staging buffer that every feature needing to
//! see the data (line counting, last-written, error skipping, discard)
//! falls back to.

use std::io;
use std::os::unix::io::RawFd;

use tracing::{event, Level};

use crate::fdio;
use crate::state::{exitcode, Engine};

/// Default staging buffer size when the input block size is unknown.
pub const BUFFER_SIZE: u64 = 409_600;
/// Largest automatically chosen staging buffer.
pub const BUFFER_SIZE_MAX: u64 = 524_288;
/// Upper bound on a single read().
pub const MAX_READ_AT_ONCE: usize = 524_288;
/// Upper bound on a single write().
pub const MAX_WRITE_AT_ONCE: usize = 524_288;
/// How long one step may wait for the input to become readable.
pub const READ_TIMEOUT_MS: i32 = 90;
/// How long one step may wait for the output to accept data.
pub const WRITE_TIMEOUT_MS: i32 = 900;
/// Adaptive error skipping doubles up to this many bytes at a time.
const MAX_ERROR_SKIP: u64 = 512;

/// What one transfer step accomplished.
#[derive(Debug, Default, Clone, Copy)]
pub struct StepResult {
    /// Bytes accepted by the output (or counted as such under discard).
    pub bytes: u64,
    /// Line terminators among those bytes.
    pub lines: u64,
}

/// A read or write failure the engine cannot continue past. The
/// exit-status bit has already been recorded when this is returned.
#[derive(Debug)]
pub struct FatalTransferError;

/// Length of the prefix of `data` containing at most `max_lines` line
/// terminators, cut just after the last permitted terminator. With fewer
/// terminators than allowed, the whole slice qualifies.
fn span_for_lines(data: &[u8], max_lines: u64, delimiter: u8) -> usize {
    if max_lines == 0 {
        return 0;
    }
    let mut seen = 0;
    for (index, byte) in data.iter().enumerate() {
        if *byte == delimiter {
            seen += 1;
            if seen == max_lines {
                return index + 1;
            }
        }
    }
    data.len()
}

fn is_retryable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    )
}

fn is_broken_pipe(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::BrokenPipe
}

impl Engine {
    fn delimiter(&self) -> u8 {
        if self.control.null_terminated_lines {
            0
        } else {
            b'\n'
        }
    }

    /// Bring the staging buffer to the configured target size. Only
    /// reallocates when the target actually changed; positions are clamped
    /// into the new bounds.
    fn resize_buffer(&mut self) {
        let target = self.control.target_buffer_size.max(1) as usize;
        if self.transfer.buffer.len() == target {
            return;
        }
        self.transfer.buffer.resize(target, 0);
        if self.transfer.read_position > target {
            self.transfer.read_position = target;
        }
        if self.transfer.write_position > self.transfer.read_position {
            self.transfer.write_position = self.transfer.read_position;
        }
    }

    /// Whether this step may move data with splice() instead of the
    /// buffer. Anything that has to observe the bytes forces the buffered
    /// path, as does a descriptor splice() has refused before.
    fn may_splice(&self, fd: RawFd, input_is_pipe: bool) -> bool {
        if cfg!(not(target_os = "linux")) || self.control.no_splice {
            return false;
        }
        if !input_is_pipe && !self.out_is_pipe {
            return false;
        }
        if self.control.linemode
            || self.control.discard_input
            || self.control.skip_errors > 0
            || self.transfer.lastwritten_capacity > 0
            || self.transfer.track_previous_line
        {
            return false;
        }
        if fd == self.transfer.splice_failed_fd {
            return false;
        }
        // Buffered leftovers must drain first so ordering is preserved.
        self.transfer.read_position == self.transfer.write_position
    }

    /// Apply the skip-errors policy to a failed read. Fills the skipped
    /// range with null bytes and seeks past it where the input allows.
    /// Without the policy, a read error ends the whole transfer.
    fn handle_read_error(&mut self, fd: RawFd, err: io::Error) -> Result<(), FatalTransferError> {
        let current_file = self.status.current_file.clone();

        if self.control.skip_errors == 0 {
            self.report_error(format!("{}: read failed: {}", current_file, err));
            self.status.exit_status |= exitcode::TRANSFER;
            return Err(FatalTransferError);
        }

        self.transfer.read_errors_in_a_row += 1;

        // Warn at the start of each run of errors; given -E twice, only
        // the first run per input file is reported.
        if self.transfer.read_errors_in_a_row == 1
            && (self.control.skip_errors < 2 || !self.transfer.read_error_warning_shown)
        {
            self.report_error(format!("{}: read errors ignored: {}", current_file, err));
            self.transfer.read_error_warning_shown = true;
        }

        let skip = if self.control.error_skip_block > 0 {
            let block = self.control.error_skip_block;
            block - (self.transfer.input_offset % block)
        } else {
            let doublings = self.transfer.read_errors_in_a_row.saturating_sub(1).min(9);
            (1u64 << doublings).min(MAX_ERROR_SKIP)
        };

        let sought = fdio::seek_forward(fd, skip as i64).is_ok();
        if sought {
            self.transfer.input_offset += skip;
        }

        // Represent the unreadable range as null bytes so the output
        // stays the same length as the input.
        let space = self.transfer.buffer.len() - self.transfer.read_position;
        let zeros = (skip as usize).min(space);
        let start = self.transfer.read_position;
        self.transfer.buffer[start..start + zeros].fill(0);
        self.transfer.read_position += zeros;

        event!(
            Level::DEBUG,
            skip,
            sought,
            errors_in_a_row = self.transfer.read_errors_in_a_row,
            "skipped past read error"
        );
        Ok(())
    }

    /// Zero-copy step: one splice() call, bounded by the allowance.
    fn splice_step(
        &mut self,
        fd: RawFd,
        allowed: Option<u64>,
    ) -> Result<StepResult, FatalTransferError> {
        let limit = allowed
            .unwrap_or(self.control.target_buffer_size)
            .min(MAX_READ_AT_ONCE as u64) as usize;
        if limit == 0 {
            return Ok(StepResult::default());
        }

        if !fdio::poll_readable(fd, READ_TIMEOUT_MS).unwrap_or(false) {
            return Ok(StepResult::default());
        }
        if !fdio::poll_writable(self.out_fd, WRITE_TIMEOUT_MS).unwrap_or(false) {
            return Ok(StepResult::default());
        }

        match fdio::splice_fds(fd, self.out_fd, limit) {
            Ok(0) => {
                self.transfer.eof_in = true;
                self.transfer.eof_out = true;
                Ok(StepResult::default())
            }
            Ok(moved) => {
                self.transfer.splice_used = true;
                self.transfer.out_bytes_total += moved as u64;
                if self.control.sync_after_write {
                    let _ = fdio::fdatasync_fd(self.out_fd);
                }
                Ok(StepResult {
                    bytes: moved as u64,
                    lines: 0,
                })
            }
            Err(err) if is_retryable(&err) => Ok(StepResult::default()),
            Err(err) if is_broken_pipe(&err) => {
                crate::signal::flags()
                    .pipe_closed
                    .store(true, std::sync::atomic::Ordering::SeqCst);
                self.transfer.eof_in = true;
                self.transfer.eof_out = true;
                Ok(StepResult::default())
            }
            Err(err)
                if err.raw_os_error() == Some(libc::EINVAL)
                    || err.raw_os_error() == Some(libc::ENOSYS) =>
            {
                // This descriptor cannot splice; remember and never retry.
                event!(Level::DEBUG, fd, "splice refused, using buffered path");
                self.transfer.splice_failed_fd = fd;
                Ok(StepResult::default())
            }
            Err(err) => {
                self.report_error(format!("write failed: {}", err));
                self.status.exit_status |= exitcode::TRANSFER;
                Err(FatalTransferError)
            }
        }
    }

    /// Buffered step: top the buffer up from the input, then drain as much
    /// as allowed to the output.
    fn buffered_step(
        &mut self,
        fd: RawFd,
        allowed: Option<u64>,
    ) -> Result<StepResult, FatalTransferError> {
        self.transfer.splice_used = false;

        // Read side.
        if !self.transfer.eof_in && self.transfer.read_position < self.transfer.buffer.len() {
            if fdio::poll_readable(fd, READ_TIMEOUT_MS).unwrap_or(false) {
                let start = self.transfer.read_position;
                let space = (self.transfer.buffer.len() - start).min(MAX_READ_AT_ONCE);
                match fdio::read_fd(fd, &mut self.transfer.buffer[start..start + space]) {
                    Ok(0) => self.transfer.eof_in = true,
                    Ok(got) => {
                        self.transfer.read_position += got;
                        self.transfer.input_offset += got as u64;
                        self.transfer.read_errors_in_a_row = 0;
                    }
                    Err(err) if is_retryable(&err) => {}
                    Err(err) => self.handle_read_error(fd, err)?,
                }
            }
        }

        // Write side.
        let delimiter = self.delimiter();
        let available = self.transfer.read_position - self.transfer.write_position;
        let mut result = StepResult::default();

        if available > 0 {
            let start = self.transfer.write_position;
            let mut to_write = available.min(MAX_WRITE_AT_ONCE);
            if let Some(allowance) = allowed {
                if self.control.linemode {
                    to_write = span_for_lines(
                        &self.transfer.buffer[start..start + to_write],
                        allowance,
                        delimiter,
                    );
                } else {
                    to_write = to_write.min(allowance as usize);
                }
            }

            if to_write > 0 {
                let accepted = if self.control.discard_input {
                    // The write is skipped entirely; counters advance as
                    // though it happened.
                    to_write
                } else if fdio::poll_writable(self.out_fd, WRITE_TIMEOUT_MS).unwrap_or(false) {
                    match fdio::write_fd(self.out_fd, &self.transfer.buffer[start..start + to_write])
                    {
                        Ok(sent) => {
                            if self.control.sync_after_write {
                                let _ = fdio::fdatasync_fd(self.out_fd);
                            }
                            sent
                        }
                        Err(err) if is_retryable(&err) => 0,
                        Err(err) if is_broken_pipe(&err) => {
                            crate::signal::flags()
                                .pipe_closed
                                .store(true, std::sync::atomic::Ordering::SeqCst);
                            self.transfer.eof_in = true;
                            self.transfer.eof_out = true;
                            0
                        }
                        Err(err) => {
                            self.report_error(format!("write failed: {}", err));
                            self.status.exit_status |= exitcode::TRANSFER;
                            return Err(FatalTransferError);
                        }
                    }
                } else {
                    0
                };

                if accepted > 0 {
                    let lines = self.transfer.note_written_range(start, accepted, delimiter);
                    self.transfer.write_position += accepted;
                    result.bytes = accepted as u64;
                    result.lines = lines;
                }
            }
        }

        if self.transfer.eof_in && self.transfer.write_position == self.transfer.read_position {
            self.transfer.eof_out = true;
        }

        // Reclaim buffer space: reset when drained, otherwise slide the
        // unwritten tail to the front so reads can keep filling.
        if self.transfer.write_position == self.transfer.read_position {
            self.transfer.write_position = 0;
            self.transfer.read_position = 0;
        } else if self.transfer.write_position > 0 {
            let (write_position, read_position) =
                (self.transfer.write_position, self.transfer.read_position);
            self.transfer.buffer.copy_within(write_position..read_position, 0);
            self.transfer.read_position -= write_position;
            self.transfer.write_position = 0;
        }

        Ok(result)
    }

    /// Advance the transfer by one step.
    ///
    /// `allowed` is the caller's allowance for this step - bytes, or lines
    /// in line mode; `None` means unlimited. Returns what was written, and
    /// flags end-of-input/output in the transfer state.
    pub fn transfer_step(
        &mut self,
        fd: RawFd,
        input_is_pipe: bool,
        allowed: Option<u64>,
    ) -> Result<StepResult, FatalTransferError> {
        self.resize_buffer();

        if fd != self.transfer.last_read_skip_fd {
            self.transfer.last_read_skip_fd = fd;
            self.transfer.read_errors_in_a_row = 0;
            self.transfer.read_error_warning_shown = false;
        }

        if self.control.direct_io_changed {
            let _ = fdio::set_direct_io(fd, self.control.direct_io);
            let _ = fdio::set_direct_io(self.out_fd, self.control.direct_io);
            self.control.direct_io_changed = false;
        }

        if self.may_splice(fd, input_is_pipe) {
            let result = self.splice_step(fd, allowed)?;
            // A refused splice falls through to the buffered path on the
            // next step rather than stalling this one.
            if result.bytes > 0 || self.transfer.eof_out {
                return Ok(result);
            }
            if fd != self.transfer.splice_failed_fd {
                return Ok(result);
            }
        }

        self.buffered_step(fd, allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControlConfig;
    use crate::fdio::{close_fd, read_fd, write_retry};

    fn pipe_pair() -> (RawFd, RawFd) {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    fn engine_with_output(out_fd: RawFd) -> Engine {
        let mut control = ControlConfig {
            target_buffer_size: 4096,
            no_splice: true,
            ..ControlConfig::default()
        };
        control.rebuild_default_format();
        let mut engine = Engine::new(control);
        engine.out_fd = out_fd;
        engine
    }

    fn drain(fd: RawFd) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match read_fd(fd, &mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(_) => break,
            }
        }
        out
    }

    #[test]
    fn moves_bytes_through_the_buffer() {
        let (in_rd, in_wr) = pipe_pair();
        let (out_rd, out_wr) = pipe_pair();
        let mut engine = engine_with_output(out_wr);

        write_retry(in_wr, b"hello, pipeline");
        close_fd(in_wr).unwrap();

        let mut moved = 0;
        while !engine.transfer.eof_out {
            let step = engine.transfer_step(in_rd, true, None).unwrap();
            moved += step.bytes;
        }
        assert_eq!(moved, 15);
        assert_eq!(engine.transfer.out_bytes_total, 15);

        close_fd(out_wr).unwrap();
        assert_eq!(drain(out_rd), b"hello, pipeline");
        close_fd(in_rd).unwrap();
        close_fd(out_rd).unwrap();
    }

    #[test]
    fn line_mode_counts_delimiters_in_output() {
        let (in_rd, in_wr) = pipe_pair();
        let (out_rd, out_wr) = pipe_pair();
        let mut engine = engine_with_output(out_wr);
        engine.control.linemode = true;

        write_retry(in_wr, b"a\nb\nc\n");
        close_fd(in_wr).unwrap();

        let mut lines = 0;
        while !engine.transfer.eof_out {
            let step = engine.transfer_step(in_rd, true, None).unwrap();
            lines += step.lines;
        }
        assert_eq!(lines, 3);
        assert_eq!(engine.transfer.line_positions.len(), 3);

        close_fd(out_wr).unwrap();
        assert_eq!(drain(out_rd), b"a\nb\nc\n");
        close_fd(in_rd).unwrap();
        close_fd(out_rd).unwrap();
    }

    #[test]
    fn line_allowance_bounds_written_lines() {
        let (in_rd, in_wr) = pipe_pair();
        let (out_rd, out_wr) = pipe_pair();
        let mut engine = engine_with_output(out_wr);
        engine.control.linemode = true;

        write_retry(in_wr, b"a\nb\nc\n");
        close_fd(in_wr).unwrap();

        let step = engine.transfer_step(in_rd, true, Some(2)).unwrap();
        assert_eq!(step.lines, 2);

        close_fd(out_wr).unwrap();
        assert_eq!(drain(out_rd), b"a\nb\n");
        close_fd(in_rd).unwrap();
        close_fd(out_rd).unwrap();
    }

    #[test]
    fn discard_advances_counters_without_writing() {
        let (in_rd, in_wr) = pipe_pair();
        let (out_rd, out_wr) = pipe_pair();
        let mut engine = engine_with_output(out_wr);
        engine.control.discard_input = true;

        write_retry(in_wr, b"vanishes");
        close_fd(in_wr).unwrap();

        let mut moved = 0;
        while !engine.transfer.eof_out {
            let step = engine.transfer_step(in_rd, true, None).unwrap();
            moved += step.bytes;
        }
        assert_eq!(moved, 8);

        close_fd(out_wr).unwrap();
        assert_eq!(drain(out_rd), b"");
        close_fd(in_rd).unwrap();
        close_fd(out_rd).unwrap();
    }

    #[test]
    fn byte_allowance_caps_each_step() {
        let (in_rd, in_wr) = pipe_pair();
        let (out_rd, out_wr) = pipe_pair();
        let mut engine = engine_with_output(out_wr);

        write_retry(in_wr, b"0123456789");
        close_fd(in_wr).unwrap();

        let step = engine.transfer_step(in_rd, true, Some(4)).unwrap();
        assert_eq!(step.bytes, 4);
        let step = engine.transfer_step(in_rd, true, Some(0)).unwrap();
        assert_eq!(step.bytes, 0);

        close_fd(out_wr).unwrap();
        assert_eq!(drain(out_rd), b"0123");
        close_fd(in_rd).unwrap();
        close_fd(out_rd).unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn splices_between_pipes_when_nothing_needs_the_bytes() {
        let (in_rd, in_wr) = pipe_pair();
        let (out_rd, out_wr) = pipe_pair();
        let mut engine = engine_with_output(out_wr);
        engine.control.no_splice = false;
        engine.out_is_pipe = true;

        write_retry(in_wr, b"zero copy");
        close_fd(in_wr).unwrap();

        let mut moved = 0;
        while !engine.transfer.eof_out {
            let step = engine.transfer_step(in_rd, true, None).unwrap();
            moved += step.bytes;
        }
        assert_eq!(moved, 9);
        assert!(engine.transfer.splice_used);

        close_fd(out_wr).unwrap();
        assert_eq!(drain(out_rd), b"zero copy");
        close_fd(in_rd).unwrap();
        close_fd(out_rd).unwrap();
    }

    #[test]
    fn span_for_lines_cuts_after_requested_terminator() {
        assert_eq!(span_for_lines(b"a\nb\nc\n", 2, b'\n'), 4);
        assert_eq!(span_for_lines(b"a\nb\nc\n", 9, b'\n'), 6);
        assert_eq!(span_for_lines(b"abc", 1, b'\n'), 3);
        assert_eq!(span_for_lines(b"abc", 0, b'\n'), 0);
    }
}

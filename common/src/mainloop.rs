//! The main transfer loop: pump data until end-of-input and end-of-output
//! and one final display pass have all happened, doing the periodic
//! housekeeping (remote messages, rate-limit top-up, back-pressure
//! sampling, resize, display ticks) on cadences shorter than the
//! user-visible update interval.

use std::os::unix::io::RawFd;
use std::sync::atomic::Ordering;

use tracing::{event, Level};

use crate::clock::{self, Timestamp};
use crate::state::{exitcode, Engine};
use crate::transfer::{BUFFER_SIZE, BUFFER_SIZE_MAX};
use crate::units::describe_amount;
use crate::{fdio, signal, terminal, units};

/// Nanoseconds between token-bucket top-ups.
const RATE_GRANULARITY_NS: i64 = 100_000_000;
/// Burst cap: this many seconds' worth of rate limit may accumulate.
const RATE_BURST_WINDOW: f64 = 5.0;
/// Nanoseconds between checks for remote-control messages.
const REMOTE_INTERVAL_NS: i64 = 100_000_000;
/// Sleep while waiting for the consumer to drain the output pipe.
const DRAIN_SLEEP_MS: u64 = 50;

impl Engine {
    /// Once a second: if standard error was parked on the null device by
    /// a SIGTTOU, try to reclaim the terminal, and re-assert TOSTOP when
    /// a stop/continue round-trip may have cleared it.
    fn background_check(&mut self, now: Timestamp, next_check: &mut Timestamp) {
        if now < *next_check {
            return;
        }
        *next_check = now.add_nanos(clock::NSEC_PER_SEC);

        let flags = signal::flags();
        if flags.restore_stderr() {
            terminal::ensure_tostop();
            flags.cursor_reinit.store(true, Ordering::SeqCst);
        }
        if flags.recheck_tostop.swap(false, Ordering::SeqCst) {
            terminal::ensure_tostop();
        }
    }

    /// Sample how much of what we wrote the consumer has not yet read,
    /// and derive the user-visible `transferred` counter from it.
    fn sample_backpressure(&mut self) {
        let flags = signal::flags();
        let mut pending_bytes = 0;
        if self.out_is_pipe && !flags.pipe_closed.load(Ordering::SeqCst) {
            pending_bytes = fdio::bytes_pending_in_pipe(self.out_fd).unwrap_or(0);
        }

        let pending = if self.control.linemode {
            let consumed_up_to = self.transfer.out_bytes_total.saturating_sub(pending_bytes);
            self.transfer.line_positions.count_after(consumed_up_to)
        } else {
            pending_bytes
        };

        self.transfer.written_but_not_consumed = pending.min(self.transfer.total_written);
        self.transfer.transferred = self
            .transfer
            .total_written
            .saturating_sub(self.transfer.written_but_not_consumed);
    }

    /// Apply a latched terminal resize to the configured geometry,
    /// leaving manually-set dimensions alone.
    fn apply_resize(&mut self) {
        let mut width = self.control.width;
        let mut height = self.control.height;
        terminal::screen_size(&mut width, &mut height);
        if !self.control.width_set_manually {
            self.control.width = width;
        }
        if !self.control.height_set_manually {
            self.control.height = height;
        }
        event!(
            Level::DEBUG,
            width = self.control.width,
            height = self.control.height,
            "terminal resized"
        );
    }

    fn emit_statistics(&mut self) {
        if !self.control.show_stats || self.calc.measurements_taken == 0 {
            return;
        }
        let count_type = self.control.count_type();
        let suffix = if self.control.bits && !self.control.linemode {
            "b/s"
        } else {
            units::rate_suffix(count_type)
        };
        let line = format!(
            "{}: rate min/avg/max/mdev = {}/{}/{}/{}\n",
            self.status.program_name,
            describe_amount(self.calc.rate_min, suffix, count_type).trim_start(),
            describe_amount(self.calc.rate_mean(), suffix, count_type).trim_start(),
            describe_amount(self.calc.rate_max, suffix, count_type).trim_start(),
            describe_amount(self.calc.rate_deviation(), suffix, count_type).trim_start(),
        );
        fdio::write_retry(libc::STDERR_FILENO, line.as_bytes());
    }

    /// Run the transfer to completion. Returns the exit-status bitmask.
    pub fn run(&mut self) -> i32 {
        self.reparse_format();
        if let Some(path) = self.control.store_and_forward.clone() {
            return self.run_store_and_forward(&path);
        }
        self.run_transfer()
    }

    /// Store-and-forward: swallow the whole input into a file first, then
    /// replay that file to the real output. Both phases reuse the same
    /// engine; only the endpoints change.
    fn run_store_and_forward(&mut self, path: &std::path::Path) -> i32 {
        use std::os::unix::io::IntoRawFd;

        let store = match std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)
        {
            Ok(file) => file,
            Err(err) => {
                self.report_error(format!("{}: {}", path.display(), err));
                self.status.exit_status |= exitcode::ACCESS;
                return self.status.exit_status;
            }
        };

        let real_out = self.out_fd;
        let store_fd = store.into_raw_fd();

        // Phase one: input -> store, without any size-derived stopping.
        // Statistics describe the forwarding phase, not the store.
        let show_stats = self.control.show_stats;
        self.control.show_stats = false;
        self.out_fd = store_fd;
        self.out_is_pipe = false;
        let first_status = self.run_transfer();
        self.control.show_stats = show_stats;
        if first_status & exitcode::TRANSFER != 0 {
            let _ = fdio::close_fd(store_fd);
            return first_status;
        }

        // Phase two: store -> real output, now with a known size.
        let _ = fdio::seek_to(store_fd, 0);
        let _ = fdio::close_fd(store_fd);
        self.out_fd = real_out;
        self.input_files = vec![path.to_string_lossy().into_owned()];
        self.transfer = crate::state::TransferState::default();
        self.calc = crate::calc::CalcState::new(self.control.average_rate_window);
        self.control.size = self.calculate_total_size();
        event!(
            Level::DEBUG,
            size = self.control.size,
            "store complete, forwarding"
        );
        self.run_transfer()
    }

    fn run_transfer(&mut self) -> i32 {
        let flags = signal::flags();

        terminal::ensure_tostop();

        // Open the first readable input.
        let mut file_index = 0;
        let mut fd: Option<RawFd> = None;
        while fd.is_none() && file_index < self.input_files.len() {
            fd = self.next_file(file_index, None);
            if fd.is_none() {
                file_index += 1;
            }
        }
        if fd.is_none() {
            return self.status.exit_status;
        }
        let mut current_fd = fd;
        let mut input_is_pipe = current_fd.map(fdio::is_pipe).unwrap_or(false);

        self.out_is_pipe = fdio::is_pipe(self.out_fd);

        // Buffer sizing: a multiple of the input block size, within
        // bounds, unless the user chose a size explicitly.
        if self.control.target_buffer_size == 0 {
            if let Ok(st) = fdio::stat_fd(current_fd.unwrap_or(libc::STDIN_FILENO)) {
                let suggested = st.block_size.saturating_mul(32).min(BUFFER_SIZE_MAX);
                if suggested > 0 {
                    self.control.target_buffer_size = suggested;
                }
            }
        }
        if self.control.target_buffer_size == 0 {
            self.control.target_buffer_size = BUFFER_SIZE;
        }

        let _ = fdio::set_direct_io(self.out_fd, self.control.direct_io);
        self.control.direct_io_changed = false;

        let mut start_time = clock::now();
        let mut next_update = start_time.add_nanos(
            (1e9 * self.control.interval.max(self.control.delay_start)) as i64,
        );
        let mut next_ratecheck = start_time;
        let mut next_remotecheck = start_time;
        let mut next_background_check = start_time;
        let mut bucket: f64 = 0.0;
        let mut final_update = false;
        let mut now = start_time;

        self.transfer.eof_in = false;
        self.transfer.eof_out = false;

        while !(self.transfer.eof_in && self.transfer.eof_out) || !final_update {
            now = clock::now();

            // Remote reconfiguration, on its own short cadence.
            if now >= next_remotecheck {
                self.remote_check();
                next_remotecheck = next_remotecheck.add_nanos(REMOTE_INTERVAL_NS);
            }

            if flags.trigger_exit.load(Ordering::SeqCst) {
                break;
            }

            // Token bucket top-up.
            let mut allowed: Option<u64> = None;
            if self.control.rate_limit > 0 {
                while now >= next_ratecheck {
                    bucket += self.control.rate_limit as f64
                        * (RATE_GRANULARITY_NS as f64 / 1e9);
                    let burst_max = self.control.rate_limit as f64 * RATE_BURST_WINDOW;
                    if bucket > burst_max {
                        bucket = burst_max;
                    }
                    next_ratecheck = next_ratecheck.add_nanos(RATE_GRANULARITY_NS);
                }
                allowed = Some(bucket.max(0.0) as u64);
            }

            // Size cap.
            let mut size_reached = false;
            if self.control.stop_at_size && self.control.size > 0 {
                let remaining = self
                    .control
                    .size
                    .saturating_sub(self.transfer.total_written);
                allowed = Some(allowed.unwrap_or(remaining).min(remaining));
                if remaining == 0 {
                    self.transfer.eof_in = true;
                    self.transfer.eof_out = true;
                    size_reached = true;
                }
            }

            // One bounded transfer step.
            let step = match (size_reached, current_fd) {
                (true, _) | (false, None) => crate::transfer::StepResult::default(),
                (false, Some(fd)) => match self.transfer_step(fd, input_is_pipe, allowed) {
                    Ok(step) => step,
                    Err(_) => {
                        self.cursor_fini();
                        let _ = fdio::close_fd(fd);
                        return self.status.exit_status;
                    }
                },
            };

            // With the bucket empty and nothing written, there is nothing
            // to do until the next top-up; sleeping out the gap keeps the
            // loop from spinning.
            if allowed == Some(0) && !size_reached && step.bytes == 0 {
                let gap_ns = next_ratecheck.subtract(clock::now()).as_nanos();
                if gap_ns > 0 {
                    let gap_ms = (gap_ns / 1_000_000).clamp(1, 100) as u64;
                    std::thread::sleep(std::time::Duration::from_millis(gap_ms));
                }
            }

            let counted = if self.control.linemode {
                step.lines
            } else {
                step.bytes
            };
            self.transfer.total_written += counted;
            if self.control.rate_limit > 0 {
                bucket = (bucket - counted as f64).max(0.0);
            }

            self.sample_backpressure();

            // Advance through the input list on end of file. A file that
            // fails to open is skipped (its error and exit bit are already
            // recorded); the old descriptor is only closed once.
            while self.transfer.eof_in
                && self.transfer.eof_out
                && !size_reached
                && file_index + 1 < self.input_files.len()
            {
                file_index += 1;
                match self.next_file(file_index, current_fd.take()) {
                    Some(next) => {
                        current_fd = Some(next);
                        input_is_pipe = fdio::is_pipe(next);
                        self.transfer.eof_in = false;
                        self.transfer.eof_out = false;
                    }
                    None => continue,
                }
            }

            now = clock::now();

            if self.transfer.eof_in && self.transfer.eof_out {
                if self.transfer.written_but_not_consumed == 0 {
                    final_update = true;
                    if self.display.display_visible || self.control.delay_start <= 0.0 {
                        next_update = now;
                    }
                } else {
                    // Everything is written but the consumer has not read
                    // it yet; drain politely instead of spinning.
                    std::thread::sleep(std::time::Duration::from_millis(DRAIN_SLEEP_MS));
                    continue;
                }
            }

            if self.control.no_display {
                continue;
            }

            // With --wait, the display (and the clock) start at the first
            // transferred byte or line.
            if self.control.wait {
                if counted < 1 {
                    continue;
                }
                self.control.wait = false;
                flags.reset_time_offsets();
                start_time = clock::now();
                next_update = start_time.add_nanos((1e9 * self.control.interval) as i64);
            }

            if now < next_update {
                continue;
            }
            next_update = next_update.add_nanos((1e9 * self.control.interval) as i64);
            if next_update < now {
                next_update = now;
            }

            let elapsed = now
                .subtract(start_time)
                .subtract(flags.stopped_offset())
                .as_seconds()
                .max(0.0);
            self.transfer.elapsed_seconds = elapsed;

            if flags.terminal_resized.swap(false, Ordering::SeqCst) {
                self.apply_resize();
            }
            if flags.cursor_reinit.swap(false, Ordering::SeqCst) && self.control.cursor {
                self.cursor_probed = false;
                self.cursor_row = None;
            }
            self.background_check(now, &mut next_background_check);

            self.calc.update(
                self.transfer.total_written,
                elapsed,
                self.display.initial_offset,
                self.control.size,
                self.control.bits,
                final_update,
            );
            self.display_tick(final_update);
        }

        if self.control.cursor {
            self.cursor_fini();
        } else if self.display.display_visible
            && !self.control.numeric
            && !self.control.no_display
        {
            fdio::write_retry(libc::STDERR_FILENO, b"\n");
            self.display.display_visible = false;
        }

        if flags.trigger_exit.load(Ordering::SeqCst) {
            self.status.exit_status |= exitcode::SIGNAL;
        }

        self.emit_statistics();

        if let Some(fd) = current_fd.take() {
            if fd != libc::STDIN_FILENO {
                let _ = fdio::close_fd(fd);
            }
        }

        terminal::clear_tostop_if_added();

        self.status.exit_status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControlConfig;
    use crate::fdio::{close_fd, read_fd, write_retry};
    use crate::state::Engine;

    fn pipe_pair() -> (RawFd, RawFd) {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    fn quiet_engine() -> Engine {
        let mut control = ControlConfig {
            no_display: true,
            no_splice: true,
            interval: 0.1,
            ..ControlConfig::default()
        };
        control.rebuild_default_format();
        Engine::new(control)
    }

    fn drain_in_thread(fd: RawFd) -> std::thread::JoinHandle<Vec<u8>> {
        std::thread::spawn(move || {
            let mut collected = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                match read_fd(fd, &mut buf) {
                    Ok(0) => break,
                    Ok(n) => collected.extend_from_slice(&buf[..n]),
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            let _ = close_fd(fd);
            collected
        })
    }

    #[test]
    fn copies_a_file_to_a_pipe_byte_for_byte() {
        let _channel = crate::remote::test_support::channel_guard();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input");
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &payload).unwrap();

        let (out_rd, out_wr) = pipe_pair();
        let reader = drain_in_thread(out_rd);

        let mut engine = quiet_engine();
        engine.out_fd = out_wr;
        engine.input_files = vec![path.to_string_lossy().into_owned()];
        engine.control.size = engine.calculate_total_size();

        let status = engine.run();
        assert_eq!(status, 0);
        assert_eq!(engine.transfer.total_written, 10_000);
        assert!(engine.transfer.transferred <= engine.transfer.total_written);

        close_fd(out_wr).unwrap();
        assert_eq!(reader.join().unwrap(), payload);
    }

    #[test]
    fn stop_at_size_truncates_the_stream() {
        let _channel = crate::remote::test_support::channel_guard();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input");
        std::fs::write(&path, vec![7u8; 5_000]).unwrap();

        let (out_rd, out_wr) = pipe_pair();
        let reader = drain_in_thread(out_rd);

        let mut engine = quiet_engine();
        engine.out_fd = out_wr;
        engine.input_files = vec![path.to_string_lossy().into_owned()];
        engine.control.size = 1_234;
        engine.control.stop_at_size = true;

        let status = engine.run();
        assert_eq!(status, 0);
        assert_eq!(engine.transfer.total_written, 1_234);

        close_fd(out_wr).unwrap();
        assert_eq!(reader.join().unwrap().len(), 1_234);
    }

    #[test]
    fn concatenates_multiple_inputs_in_order() {
        let _channel = crate::remote::test_support::channel_guard();
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first");
        let second = dir.path().join("second");
        std::fs::write(&first, b"one,").unwrap();
        std::fs::write(&second, b"two").unwrap();

        let (out_rd, out_wr) = pipe_pair();
        let reader = drain_in_thread(out_rd);

        let mut engine = quiet_engine();
        engine.out_fd = out_wr;
        engine.input_files = vec![
            first.to_string_lossy().into_owned(),
            second.to_string_lossy().into_owned(),
        ];

        let status = engine.run();
        assert_eq!(status, 0);
        assert_eq!(engine.transfer.total_written, 7);

        close_fd(out_wr).unwrap();
        assert_eq!(reader.join().unwrap(), b"one,two");
    }

    #[test]
    fn store_and_forward_replays_through_the_file() {
        let _channel = crate::remote::test_support::channel_guard();
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input");
        let store = dir.path().join("store");
        std::fs::write(&input, b"parcel of bytes").unwrap();

        let (out_rd, out_wr) = pipe_pair();
        let reader = drain_in_thread(out_rd);

        let mut engine = quiet_engine();
        engine.out_fd = out_wr;
        engine.input_files = vec![input.to_string_lossy().into_owned()];
        engine.control.store_and_forward = Some(store.clone());

        let status = engine.run();
        assert_eq!(status, 0);
        // Phase two saw the stored copy with a known size.
        assert_eq!(engine.control.size, 15);
        assert_eq!(engine.transfer.total_written, 15);
        assert_eq!(std::fs::read(&store).unwrap(), b"parcel of bytes");

        close_fd(out_wr).unwrap();
        assert_eq!(reader.join().unwrap(), b"parcel of bytes");
    }

    #[test]
    fn line_mode_total_counts_lines() {
        let _channel = crate::remote::test_support::channel_guard();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lines");
        std::fs::write(&path, b"a\nb\nc\n").unwrap();

        let (out_rd, out_wr) = pipe_pair();
        let reader = drain_in_thread(out_rd);

        let mut engine = quiet_engine();
        engine.control.linemode = true;
        engine.out_fd = out_wr;
        engine.input_files = vec![path.to_string_lossy().into_owned()];
        engine.control.size = engine.calculate_total_size();
        assert_eq!(engine.control.size, 3);

        let status = engine.run();
        assert_eq!(status, 0);
        assert_eq!(engine.transfer.total_written, 3);

        close_fd(out_wr).unwrap();
        assert_eq!(reader.join().unwrap(), b"a\nb\nc\n");
    }

    #[test]
    fn rate_limit_holds_a_small_transfer_back() {
        let _channel = crate::remote::test_support::channel_guard();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input");
        std::fs::write(&path, vec![1u8; 3_000]).unwrap();

        let (out_rd, out_wr) = pipe_pair();
        let reader = drain_in_thread(out_rd);

        let mut engine = quiet_engine();
        engine.out_fd = out_wr;
        engine.input_files = vec![path.to_string_lossy().into_owned()];
        // 3000 bytes at 10000 B/s should take no observable time thanks
        // to the burst allowance; at 2000 B/s it must take over a second.
        engine.control.rate_limit = 2_000;

        let started = std::time::Instant::now();
        let status = engine.run();
        let elapsed = started.elapsed();
        assert_eq!(status, 0);
        assert_eq!(engine.transfer.total_written, 3_000);
        assert!(
            elapsed >= std::time::Duration::from_millis(400),
            "took {:?}",
            elapsed
        );

        close_fd(out_wr).unwrap();
        assert_eq!(reader.join().unwrap().len(), 3_000);
    }
}

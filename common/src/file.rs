//! Input file handling: working out the total transfer size up front and
//! advancing through the input list as each source is exhausted.

use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::os::unix::io::{AsRawFd, RawFd};

use tracing::{event, Level};

use crate::fdio;
use crate::state::{exitcode, Engine};

fn is_stdin(name: &str) -> bool {
    name == "-"
}

fn readable(name: &str) -> bool {
    let Ok(cname) = std::ffi::CString::new(name) else {
        return false;
    };
    unsafe { libc::access(cname.as_ptr(), libc::R_OK) == 0 }
}

/// Count delimiters in a regular file by scanning it start to finish.
fn count_lines(name: &str, delimiter: u8) -> std::io::Result<u64> {
    use std::io::Read;
    let mut file = std::fs::File::open(name)?;
    let mut buffer = [0u8; 4096];
    let mut total = 0;
    loop {
        let got = file.read(&mut buffer)?;
        if got == 0 {
            break;
        }
        total += buffer[..got].iter().filter(|b| **b == delimiter).count() as u64;
    }
    Ok(total)
}

impl Engine {
    fn delimiter_byte(&self) -> u8 {
        if self.control.null_terminated_lines {
            0
        } else {
            b'\n'
        }
    }

    /// Total size in bytes of every input, by adding regular-file sizes
    /// and seek-to-end sizes of block devices. Unknown (0) as soon as any
    /// input cannot be sized. Unreadable inputs are reported, dropped
    /// from the list, and recorded in the exit status.
    fn total_bytes(&mut self) -> u64 {
        if self.input_files.is_empty() {
            let st = match fdio::stat_fd(libc::STDIN_FILENO) {
                Ok(st) => st,
                Err(_) => return 0,
            };
            return if st.is_regular { st.size } else { 0 };
        }

        let mut total: u64 = 0;
        let mut unknown = false;
        let mut dropped: Vec<String> = Vec::new();

        self.input_files.retain(|name| {
            if is_stdin(name) {
                match fdio::stat_fd(libc::STDIN_FILENO) {
                    Ok(st) if st.is_regular => total += st.size,
                    _ => unknown = true,
                }
                return true;
            }
            let metadata = match std::fs::metadata(name) {
                Ok(metadata) => metadata,
                Err(_) => {
                    dropped.push(name.clone());
                    return false;
                }
            };
            if !readable(name) {
                dropped.push(name.clone());
                return false;
            }
            if metadata.file_type().is_block_device() {
                match std::fs::File::open(name)
                    .and_then(|file| fdio::seekable_size(file.as_raw_fd()))
                {
                    Ok(size) => total += size,
                    Err(_) => {
                        dropped.push(name.clone());
                        return false;
                    }
                }
            } else if metadata.is_file() {
                total += metadata.size();
            } else {
                unknown = true;
            }
            true
        });

        for name in dropped {
            self.report_error(format!("{}: cannot read input", name));
            self.status.exit_status |= exitcode::ACCESS;
        }

        if unknown {
            0
        } else {
            total
        }
    }

    /// Total line count, by scanning every input. Only regular files can
    /// be scanned without consuming them; anything else makes the total
    /// unknown.
    fn total_lines(&mut self) -> u64 {
        let delimiter = self.delimiter_byte();
        let mut total: u64 = 0;
        let mut dropped: Vec<String> = Vec::new();
        let mut unknown = self.input_files.is_empty();

        self.input_files.retain(|name| {
            if is_stdin(name) {
                unknown = true;
                return true;
            }
            match std::fs::metadata(name) {
                Ok(metadata) if metadata.is_file() => match count_lines(name, delimiter) {
                    Ok(lines) => {
                        total += lines;
                        true
                    }
                    Err(_) => {
                        dropped.push(name.clone());
                        false
                    }
                },
                Ok(_) => {
                    unknown = true;
                    true
                }
                Err(_) => {
                    dropped.push(name.clone());
                    false
                }
            }
        });

        for name in dropped {
            self.report_error(format!("{}: cannot read input", name));
            self.status.exit_status |= exitcode::ACCESS;
        }

        if unknown {
            0
        } else {
            total
        }
    }

    /// Work out the total transfer size for the ETA and percentage.
    ///
    /// When the inputs are unsizeable but standard output is a seekable
    /// block device, its size is used instead and the transfer stops when
    /// the device is full.
    pub fn calculate_total_size(&mut self) -> u64 {
        let mut total = if self.control.linemode {
            self.total_lines()
        } else {
            self.total_bytes()
        };

        if total == 0 && !self.control.linemode {
            if let Ok(st) = fdio::stat_fd(self.out_fd) {
                if st.is_block {
                    if let Ok(size) = fdio::seekable_size(self.out_fd) {
                        if size > 0 {
                            event!(Level::DEBUG, size, "using output block device size");
                            total = size;
                            self.control.stop_at_size = true;
                        }
                    }
                }
            }
        }

        total
    }

    /// Close the previous input and open input number `file_index`.
    ///
    /// Returns the new descriptor, or records the failure in the exit
    /// status and returns None. An input that turns out to be the same
    /// file the output points at is refused.
    pub fn next_file(&mut self, file_index: usize, old_fd: Option<RawFd>) -> Option<RawFd> {
        if let Some(old) = old_fd {
            if fdio::close_fd(old).is_err() {
                self.report_error("failed to close file");
                self.status.exit_status |= exitcode::CLOSE;
                return None;
            }
        }

        let name = match self.input_files.get(file_index) {
            Some(name) => name.clone(),
            None => {
                self.status.exit_status |= exitcode::CLOSE;
                return None;
            }
        };

        let fd = if is_stdin(&name) {
            libc::STDIN_FILENO
        } else {
            let Ok(cname) = std::ffi::CString::new(name.as_str()) else {
                self.report_error(format!("{}: bad file name", name));
                self.status.exit_status |= exitcode::ACCESS;
                return None;
            };
            let fd = unsafe { libc::open(cname.as_ptr(), libc::O_RDONLY) };
            if fd < 0 {
                let err = std::io::Error::last_os_error();
                self.report_error(format!("{}: failed to open: {}", name, err));
                self.status.exit_status |= exitcode::ACCESS;
                return None;
            }
            fd
        };

        let input = match fdio::stat_fd(fd) {
            Ok(st) => st,
            Err(err) => {
                self.report_error(format!("{}: failed to stat: {}", name, err));
                if !is_stdin(&name) {
                    let _ = fdio::close_fd(fd);
                }
                self.status.exit_status |= exitcode::ACCESS;
                return None;
            }
        };

        // Feeding the output back into itself would loop forever; refuse
        // regular files and block devices that alias the output.
        if let Ok(output) = fdio::stat_fd(self.out_fd) {
            let aliases = input.dev == output.dev
                && input.ino == output.ino
                && (input.is_regular || input.is_block)
                && unsafe { libc::isatty(fd) } == 0;
            if aliases {
                self.report_error(format!("{}: input file is output file", name));
                if !is_stdin(&name) {
                    let _ = fdio::close_fd(fd);
                }
                self.status.exit_status |= exitcode::SAME_FILE;
                return None;
            }
        }

        self.status.current_file = if is_stdin(&name) {
            "(stdin)".to_string()
        } else {
            name.clone()
        };

        fdio::advise_sequential(fd);
        if self.control.direct_io {
            let _ = fdio::set_direct_io(fd, true);
        }

        event!(Level::DEBUG, file = %self.status.current_file, fd, "opened input");
        self.transfer.input_offset = 0;
        Some(fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControlConfig;
    use std::io::Write;

    fn engine() -> Engine {
        let mut control = ControlConfig::default();
        control.rebuild_default_format();
        Engine::new(control)
    }

    #[test]
    fn total_size_sums_regular_files() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::write(&a, b"12345").unwrap();
        std::fs::write(&b, b"1234567890").unwrap();

        let mut engine = engine();
        engine.input_files = vec![
            a.to_string_lossy().into_owned(),
            b.to_string_lossy().into_owned(),
        ];
        assert_eq!(engine.calculate_total_size(), 15);
        assert_eq!(engine.status.exit_status, 0);
    }

    #[test]
    fn missing_inputs_are_dropped_with_access_bit() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("present");
        std::fs::write(&present, b"abc").unwrap();

        let mut engine = engine();
        engine.input_files = vec![
            present.to_string_lossy().into_owned(),
            dir.path().join("absent").to_string_lossy().into_owned(),
        ];
        assert_eq!(engine.calculate_total_size(), 3);
        assert_eq!(engine.input_files.len(), 1);
        assert_eq!(engine.status.exit_status & exitcode::ACCESS, exitcode::ACCESS);
    }

    #[test]
    fn line_mode_counts_lines_in_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lines");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"a\nb\nc\n").unwrap();

        let mut engine = engine();
        engine.control.linemode = true;
        engine.input_files = vec![path.to_string_lossy().into_owned()];
        assert_eq!(engine.calculate_total_size(), 3);
    }

    #[test]
    fn next_file_opens_and_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, b"xyz").unwrap();

        let mut engine = engine();
        engine.input_files = vec![
            path.to_string_lossy().into_owned(),
            dir.path().join("gone").to_string_lossy().into_owned(),
        ];

        let fd = engine.next_file(0, None).unwrap();
        assert!(fd >= 0);
        assert_eq!(engine.status.current_file, path.to_string_lossy());

        assert!(engine.next_file(1, Some(fd)).is_none());
        assert_eq!(engine.status.exit_status & exitcode::ACCESS, exitcode::ACCESS);
    }

    #[test]
    fn input_aliasing_the_output_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("both");
        std::fs::write(&path, b"loop").unwrap();

        let out = std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap();

        let mut engine = engine();
        engine.out_fd = out.as_raw_fd();
        engine.input_files = vec![path.to_string_lossy().into_owned()];
        assert!(engine.next_file(0, None).is_none());
        assert_eq!(
            engine.status.exit_status & exitcode::SAME_FILE,
            exitcode::SAME_FILE
        );
    }
}

use std::os::unix::io::IntoRawFd;
use std::path::PathBuf;

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use structopt::StructOpt;
use tracing::{event, Level};

use common::units::{parse_seconds, parse_size};
use common::{ControlConfig, Engine, ExtraDisplays, FormatSwitches, RemoteMessage};

lazy_static! {
    static ref VERSION: String = common::version::version_string();
}

#[derive(StructOpt, Debug, Clone)]
#[structopt(
    name = "pmeter",
    version = VERSION.as_str(),
    about = "`pmeter` sits in a shell pipeline, copies its input to its output, and shows \
    how much data has passed through, how fast it is moving, and how long it is likely to take."
)]
struct Args {
    /// Show a progress bar (with percentage when the size is known)
    #[structopt(short = "p", long)]
    progress: bool,

    /// Show the elapsed transfer time
    #[structopt(short = "t", long)]
    timer: bool,

    /// Show the estimated time until completion
    #[structopt(short = "e", long)]
    eta: bool,

    /// Show the estimated local completion time
    #[structopt(short = "I", long)]
    fineta: bool,

    /// Show the current transfer rate
    #[structopt(short = "r", long)]
    rate: bool,

    /// Show the average transfer rate over the recent window
    #[structopt(short = "a", long = "average-rate")]
    average_rate: bool,

    /// Show the byte count (or line count with --line-mode)
    #[structopt(short = "b", long)]
    bytes: bool,

    /// Show how full the transfer buffer is
    #[structopt(short = "T", long = "buffer-percent")]
    buffer_percent: bool,

    /// Show the last N bytes written
    #[structopt(short = "A", long = "last-written")]
    last_written: Option<u32>,

    /// Use this output format string instead of the selected switches.
    ///
    /// Components: %p progress, %t timer, %e ETA, %I completion time,
    /// %r rate, %a average rate, %b count, %T buffer use, %NA last
    /// written, %NL previous line, %N name, %% literal percent, and
    /// brace forms such as %{progress} or %{sgr:bold,red}.
    #[structopt(short = "F", long = "format")]
    format: Option<String>,

    /// Numeric output: write status as numbers, one line per update
    #[structopt(short = "n", long)]
    numeric: bool,

    /// No display; just copy the data
    #[structopt(short = "q", long)]
    quiet: bool,

    /// Count and show bits instead of bytes
    #[structopt(short = "8", long)]
    bits: bool,

    /// Use SI (powers of 1000) units instead of IEC (powers of 1024)
    #[structopt(short = "k", long)]
    si: bool,

    /// Hold the display (and the timer) until the first byte arrives
    #[structopt(short = "W", long)]
    wait: bool,

    /// Wait this many seconds before showing the display
    #[structopt(short = "D", long = "delay-start", parse(try_from_str = parse_seconds))]
    delay_start: Option<f64>,

    /// Assume this much data in total (with K, M, G, or T suffixes)
    #[structopt(short = "s", long = "size", parse(try_from_str = parse_size))]
    size: Option<u64>,

    /// When the size is unknown, show the rate against the maximum seen
    #[structopt(short = "g", long = "rate-gauge")]
    rate_gauge: bool,

    /// Count lines instead of bytes
    #[structopt(short = "l", long = "line-mode")]
    line_mode: bool,

    /// With --line-mode, lines end with a null byte instead of a newline
    #[structopt(short = "0", long = "null")]
    null: bool,

    /// Seconds between display updates
    #[structopt(short = "i", long = "interval", parse(try_from_str = parse_seconds))]
    interval: Option<f64>,

    /// Window in seconds for the average rate
    #[structopt(short = "m", long = "average-rate-window")]
    average_rate_window: Option<u32>,

    /// Assume the terminal is this many columns wide
    #[structopt(short = "w", long = "width")]
    width: Option<u32>,

    /// Assume the terminal is this many rows tall
    #[structopt(short = "H", long = "height")]
    height: Option<u32>,

    /// Prefix the display with this name
    #[structopt(short = "N", long = "name")]
    name: Option<String>,

    /// Progress bar style: plain, block, granular, or shaded
    #[structopt(short = "u", long = "bar-style", default_value = "plain")]
    bar_style: String,

    /// Also show the display elsewhere: comma-separated list of
    /// "windowtitle" and "processtitle"
    #[structopt(short = "x", long = "extra-display")]
    extra_display: Option<String>,

    /// Print rate statistics (min/avg/max/mdev) when the transfer ends
    #[structopt(short = "v", long = "stats")]
    stats: bool,

    /// Output the display even if standard error is not a terminal
    #[structopt(short = "f", long)]
    force: bool,

    /// Paint the display at a fixed terminal row
    #[structopt(short = "c", long)]
    cursor: bool,

    /// Write the data to this file instead of standard output
    #[structopt(short = "o", long = "output")]
    output: Option<PathBuf>,

    /// Limit the transfer to this many bytes (lines) per second
    #[structopt(short = "L", long = "rate-limit", parse(try_from_str = parse_size))]
    rate_limit: Option<u64>,

    /// Use a transfer buffer of this many bytes
    #[structopt(short = "B", long = "buffer-size", parse(try_from_str = parse_size))]
    buffer_size: Option<u64>,

    /// Never use the zero-copy path, even between pipes
    #[structopt(short = "C", long = "no-splice")]
    no_splice: bool,

    /// Skip unreadable input instead of aborting; repeat to silence the
    /// per-file warnings as well
    #[structopt(short = "E", long = "skip-errors", parse(from_occurrences))]
    skip_errors: u32,

    /// After a read error, skip to the next multiple of this many bytes
    /// instead of adapting the skip size
    #[structopt(short = "Z", long = "error-skip-block", parse(try_from_str = parse_size))]
    error_skip_block: Option<u64>,

    /// Stop once --size bytes (or lines) have been transferred
    #[structopt(short = "S", long = "stop-at-size")]
    stop_at_size: bool,

    /// Flush data to storage after every write
    #[structopt(short = "Y", long = "sync")]
    sync: bool,

    /// Use direct I/O (O_DIRECT) on the input and output
    #[structopt(short = "K", long = "direct-io")]
    direct_io: bool,

    /// Read the input but write nothing
    #[structopt(short = "X", long = "discard")]
    discard: bool,

    /// Store all input in FILE, then forward it once the input ends
    #[structopt(short = "U", long = "store-and-forward")]
    store_and_forward: Option<PathBuf>,

    /// Update the options of the running instance with this process id
    #[structopt(short = "R", long = "remote")]
    remote: Option<u32>,

    /// Write our process id to this file
    #[structopt(short = "P", long = "pidfile")]
    pidfile: Option<PathBuf>,

    /// Log verbosity: -v is taken by --stats, so this is long-form only
    /// (--verbose INFO, --verbose --verbose DEBUG, three for TRACE)
    #[structopt(long = "verbose", parse(from_occurrences))]
    verbose: u8,

    /// Input files; "-" or nothing means standard input
    #[structopt()]
    files: Vec<String>,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    // Standard output carries the transferred data, so logs go to
    // standard error alongside the display.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_extra_displays(spec: &str) -> Result<ExtraDisplays> {
    let mut extra = ExtraDisplays::default();
    for word in spec.split(',') {
        match word.trim() {
            "" => {}
            "windowtitle" => extra.window_title = true,
            "processtitle" => extra.process_title = true,
            other => anyhow::bail!("unknown extra display: {:?}", other),
        }
    }
    Ok(extra)
}

fn control_from_args(args: &Args) -> Result<ControlConfig> {
    let mut control = ControlConfig {
        force: args.force,
        cursor: args.cursor,
        numeric: args.numeric,
        wait: args.wait,
        linemode: args.line_mode,
        bits: args.bits,
        si: args.si,
        null_terminated_lines: args.null,
        no_display: args.quiet,
        skip_errors: args.skip_errors,
        error_skip_block: args.error_skip_block.unwrap_or(0),
        stop_at_size: args.stop_at_size,
        sync_after_write: args.sync,
        direct_io: args.direct_io,
        no_splice: args.no_splice,
        discard_input: args.discard,
        rate_gauge: args.rate_gauge,
        show_stats: args.stats,
        rate_limit: args.rate_limit.unwrap_or(0),
        target_buffer_size: args.buffer_size.unwrap_or(0),
        size: args.size.unwrap_or(0),
        interval: args.interval.unwrap_or(1.0),
        delay_start: args.delay_start.unwrap_or(0.0),
        average_rate_window: args.average_rate_window.unwrap_or(30),
        name: args.name.clone(),
        format_string: args.format.clone(),
        bar_style: args.bar_style.clone(),
        store_and_forward: args.store_and_forward.clone(),
        ..ControlConfig::default()
    };

    control.format_option = FormatSwitches {
        progress: args.progress,
        timer: args.timer,
        eta: args.eta,
        fineta: args.fineta,
        rate: args.rate,
        average_rate: args.average_rate,
        bytes: args.bytes,
        bufpercent: args.buffer_percent,
        lastwritten: args.last_written.unwrap_or(0),
    };

    if let Some(spec) = &args.extra_display {
        control.extra_displays = parse_extra_displays(spec)?;
    }

    // Terminal geometry: detect what was not given explicitly.
    control.width_set_manually = args.width.is_some();
    control.height_set_manually = args.height.is_some();
    let mut width = 0;
    let mut height = 0;
    common::terminal::screen_size(&mut width, &mut height);
    control.width = args.width.unwrap_or(if width > 0 { width } else { 80 });
    control.height = args.height.unwrap_or(if height > 0 { height } else { 25 });

    control.can_display_utf8 = common::terminal::locale_allows_utf8();
    control.can_display_colour = common::terminal::colour_permitted();

    control.clamp_ranges();
    control.rebuild_default_format();
    Ok(control)
}

/// Pid file written at startup and removed on exit.
struct PidFile {
    path: PathBuf,
}

impl PidFile {
    fn create(path: PathBuf) -> Result<PidFile> {
        std::fs::write(&path, format!("{}\n", std::process::id()))
            .with_context(|| format!("cannot write pid file {:?}", path))?;
        Ok(PidFile { path })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            eprintln!("pmeter: {}: {}", self.path.display(), err);
        }
    }
}

fn run_transfer(args: &Args) -> Result<i32> {
    let control = control_from_args(args)?;

    let _pidfile = match &args.pidfile {
        Some(path) => Some(PidFile::create(path.clone())?),
        None => None,
    };

    let mut engine = Engine::new(control);
    engine.input_files = if args.files.is_empty() {
        vec!["-".to_string()]
    } else {
        args.files.clone()
    };

    if let Some(path) = &args.output {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(path)
            .with_context(|| format!("cannot open output file {:?}", path))?;
        engine.out_fd = file.into_raw_fd();
    }

    // Work out the total size for the percentage and ETA, unless one was
    // given. Line mode totals would mean scanning every input up front,
    // so they stay unknown unless --size says otherwise.
    if engine.control.size == 0 && !engine.control.linemode {
        engine.control.size = engine.calculate_total_size();
        event!(Level::DEBUG, size = engine.control.size, "calculated total size");
    }

    // No size means no ETA in the default display.
    if engine.control.size == 0 && engine.control.format_option.eta {
        engine.control.format_option.eta = false;
        engine.control.rebuild_default_format();
    }

    // Without a terminal there is nothing to see: disable the display
    // unless it is forced or numeric.
    if unsafe { libc::isatty(libc::STDERR_FILENO) } == 0
        && !engine.control.force
        && !engine.control.numeric
    {
        engine.control.no_display = true;
    }

    let _signals = common::signal::install()?;

    Ok(engine.run())
}

fn main() {
    let args = Args::from_args();
    init_logging(args.verbose);

    // -R: update a running instance and exit.
    if let Some(pid) = args.remote {
        match control_from_args(&args)
            .and_then(|control| common::remote::send(pid, RemoteMessage::from_control(&control)))
        {
            Ok(()) => std::process::exit(0),
            Err(err) => {
                eprintln!("pmeter: {:#}", err);
                std::process::exit(1);
            }
        }
    }

    match run_transfer(&args) {
        Ok(status) => std::process::exit(status),
        Err(err) => {
            eprintln!("pmeter: {:#}", err);
            std::process::exit(1);
        }
    }
}

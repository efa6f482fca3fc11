//! PCM Bridge - 命令行工具
//!
//! 把扫频信号或音频文件按背压节奏喂给输出引擎，
//! 结束后打印渲染统计

use std::io::{self, Read as IoRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};

use pcm_bridge::audio::ConvertKernel;
use pcm_bridge::engine::{Engine, EngineConfig, PausePolicy, Samples, SpatialScene};
use pcm_bridge::logging;
use pcm_bridge::render::{
    default_renderer, ClockConfig, ClockRenderer, RawPcmSink, Renderer,
};
use pcm_bridge::source::{AudioDecoder, FrequencyRange, PcmSource, SweepConfig, SweepGenerator};

/// 背压轮询间隔
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// 统计报告假定的每次回调帧数
const REPORT_FRAMES_PER_CALL: usize = 512;

/// 终端原始模式 RAII 守卫
struct RawModeGuard {
    original: libc::termios,
}

impl RawModeGuard {
    /// 进入原始模式（非阻塞、无回显），离开作用域自动恢复
    fn enter() -> Option<Self> {
        unsafe {
            let mut original: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(libc::STDIN_FILENO, &mut original) != 0 {
                return None;
            }

            let mut raw = original;
            raw.c_lflag &= !(libc::ICANON | libc::ECHO);
            raw.c_cc[libc::VMIN] = 0;
            raw.c_cc[libc::VTIME] = 0;

            if libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &raw) != 0 {
                return None;
            }

            Some(Self { original })
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        unsafe {
            libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &self.original);
        }
    }
}

fn read_char_nonblocking() -> Option<u8> {
    let mut buf = [0u8; 1];
    match io::stdin().lock().read(&mut buf) {
        Ok(1) => Some(buf[0]),
        _ => None,
    }
}

/// PCM Bridge - real-time PCM output bridge
#[derive(Parser)]
#[command(name = "pcm-bridge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show output device and conversion kernel information
    Info {
        #[command(flatten)]
        output: OutputArgs,
    },

    /// Stream a generated stereo sweep
    Sweep {
        #[command(flatten)]
        sweep: SweepArgs,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Decode and stream an audio file
    Play {
        /// Audio file to play
        file: PathBuf,

        /// Start position in seconds
        #[arg(long, default_value = "0")]
        start: f64,

        #[command(flatten)]
        output: OutputArgs,
    },
}

#[derive(Args, Clone)]
struct OutputArgs {
    /// Queue depth in buffers
    #[arg(short = 'q', long, default_value = "3")]
    queue_size: u32,

    /// Output volume (0.0-1.0)
    #[arg(long, default_value = "1.0")]
    volume: f32,

    /// Enable spatial audio
    #[arg(long)]
    spatial: bool,

    /// Spatial source position
    #[arg(long, value_name = "X,Y,Z", value_delimiter = ',', num_args = 3)]
    source_position: Option<Vec<f32>>,

    /// Use the software clock renderer instead of the audio device
    #[arg(long)]
    null: bool,

    /// Capture rendered audio to a raw f32 file (implies --null)
    #[arg(long, value_name = "PATH")]
    dump: Option<PathBuf>,

    /// Drop queued audio when pausing
    #[arg(long)]
    pause_flush: bool,

    /// Force a conversion kernel (scalar, sse2, avx, neon)
    #[arg(long)]
    kernel: Option<ConvertKernel>,

    /// Buffer duration per feed in milliseconds
    #[arg(long, default_value = "100")]
    chunk_ms: u32,
}

#[derive(Args, Clone)]
struct SweepArgs {
    /// Duration in seconds
    #[arg(short, long, default_value = "10")]
    duration: f64,

    /// Left channel start frequency (Hz)
    #[arg(short = 'l', long, default_value = "20")]
    left_start: f64,

    /// Left channel end frequency (Hz)
    #[arg(short = 'L', long, default_value = "20000")]
    left_end: f64,

    /// Right channel start frequency (Hz), defaults to left
    #[arg(short = 'r', long)]
    right_start: Option<f64>,

    /// Right channel end frequency (Hz), defaults to left
    #[arg(short = 'R', long)]
    right_end: Option<f64>,

    /// Logarithmic sweep (default linear)
    #[arg(short = 'g', long)]
    log: bool,

    /// Right channel delay in seconds
    #[arg(short = 'D', long, default_value = "0")]
    delay: f64,

    /// Sample rate (Hz)
    #[arg(short = 's', long, default_value = "44100")]
    sample_rate: u32,

    /// Sweep level (0.0-1.0)
    #[arg(long, default_value = "0.8")]
    level: f64,
}

impl SweepArgs {
    fn to_config(&self) -> SweepConfig {
        SweepConfig {
            duration_secs: self.duration,
            sample_rate: self.sample_rate as f64,
            left: FrequencyRange::new(self.left_start, self.left_end),
            right: FrequencyRange::new(
                self.right_start.unwrap_or(self.left_start),
                self.right_end.unwrap_or(self.left_end),
            ),
            right_delay_secs: self.delay,
            logarithmic: self.log,
            volume: self.level,
            ..SweepConfig::default()
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match cli.command {
        Commands::Info { ref output } => show_info(output),
        Commands::Sweep {
            ref sweep,
            ref output,
        } => play_sweep(sweep, output),
        Commands::Play {
            ref file,
            start,
            ref output,
        } => play_file(file, start, output),
    }
}

fn create_renderer(output: &OutputArgs) -> anyhow::Result<Box<dyn Renderer>> {
    if let Some(path) = &output.dump {
        let sink = RawPcmSink::create(path)
            .with_context(|| format!("cannot create capture file {}", path.display()))?;
        return Ok(Box::new(
            ClockRenderer::new(ClockConfig::default()).with_sink(Box::new(sink)),
        ));
    }
    if output.null {
        return Ok(Box::new(ClockRenderer::new(ClockConfig::default())));
    }
    Ok(default_renderer())
}

fn create_engine(output: &OutputArgs) -> anyhow::Result<Engine> {
    let mut config = EngineConfig::default()
        .with_queue_capacity(output.queue_size.max(1) as usize)
        .with_volume(output.volume);
    if output.pause_flush {
        config = config.with_pause_policy(PausePolicy::Flush);
    }
    if let Some(kernel) = output.kernel {
        config = config.with_kernel(kernel);
    }

    let mut engine = Engine::with_config(create_renderer(output)?, config);
    if output.spatial {
        engine.set_spatial_enabled(true);
    }
    if let Some(pos) = &output.source_position {
        if let [x, y, z] = pos.as_slice() {
            engine.set_source_position(*x, *y, *z);
        }
    }
    Ok(engine)
}

fn show_info(output: &OutputArgs) -> anyhow::Result<()> {
    let mut renderer = create_renderer(output)?;

    println!("=== Output Device ===\n");
    println!("Name:    {}", renderer.device_name());
    match renderer.device_class() {
        Ok(class) if class.is_wireless_headset() => println!("Class:   wireless headset"),
        Ok(class) => println!("Class:   {:?}", class),
        Err(e) => println!("Class:   unknown ({})", e),
    }
    // 用默认（未启用）场景试探渲染器是否支持空间音频
    match renderer.apply_spatial(&SpatialScene::default()) {
        Ok(()) => println!("Spatial: supported"),
        Err(e) => println!("Spatial: unsupported ({})", e),
    }

    println!("\n=== Conversion Kernels ===\n");
    let detected = ConvertKernel::detect();
    for kernel in ConvertKernel::available() {
        let mark = if kernel == detected { " *" } else { "" };
        println!("  {}{}", kernel.name(), mark);
    }
    println!("\n* = selected by default");
    Ok(())
}

fn install_interrupt() -> anyhow::Result<Arc<AtomicBool>> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;
    Ok(running)
}

fn play_sweep(args: &SweepArgs, output: &OutputArgs) -> anyhow::Result<()> {
    let config = args.to_config();
    let mut sweep = SweepGenerator::new(config.clone())?;

    println!("PCM Bridge - Sweep");
    println!(
        "{} sweep, {} s @ {} Hz",
        if config.logarithmic { "Logarithmic" } else { "Linear" },
        config.duration_secs,
        config.sample_rate
    );
    for (name, range) in [("Left", config.left), ("Right", config.right)] {
        println!(
            "{}: {} Hz -> {} Hz ({})",
            name,
            range.start,
            range.end,
            if range.is_rising() { "up" } else { "down" }
        );
    }
    if config.right_delay_secs > 0.0 {
        println!("Right delay: {} s", config.right_delay_secs);
    }

    let total = Some(sweep.total_frames());
    let mut engine = create_engine(output)?;
    stream(&mut sweep, &mut engine, output, total)
}

fn play_file(file: &PathBuf, start: f64, output: &OutputArgs) -> anyhow::Result<()> {
    let mut decoder = AudioDecoder::open(file)?;
    let info = decoder.info().clone();

    println!("PCM Bridge - Loading: {}", file.display());
    println!(
        "{} / {} | {} Hz | {} ch{}",
        info.format,
        info.codec,
        info.sample_rate,
        info.channels,
        info.bit_depth
            .map(|b| format!(" | {} bit", b))
            .unwrap_or_default()
    );

    if start > 0.0 {
        decoder.seek(start)?;
    }

    let total = info.total_frames.map(|f| f as usize);
    let mut engine = create_engine(output)?;
    stream(&mut decoder, &mut engine, output, total)
}

/// 按背压节奏把音源喂给引擎，直到结束或 Ctrl+C
fn stream<S: PcmSource>(
    source: &mut S,
    engine: &mut Engine,
    output: &OutputArgs,
    total_frames: Option<usize>,
) -> anyhow::Result<()> {
    let format = source.format();
    if !engine.setup_audio_format(format.sample_rate, format.channels) {
        bail!("output rejected format {}", format);
    }
    if !engine.enable() {
        bail!("failed to enable output on {}", engine.device_label());
    }

    let running = install_interrupt()?;
    let _raw_guard = RawModeGuard::enter();

    println!(
        "Output: {} | {} | {} kernel",
        engine.device_label(),
        format,
        engine.converter_kernel().name()
    );
    if engine.is_spatial_enabled() && !engine.is_spatial_rendering() {
        println!("Spatial: requested, not rendered by this output");
    }
    println!("Controls: [Space] pause/resume | [f] flush | [q] quit\n");

    let chunk_frames = ((format.sample_rate * output.chunk_ms.max(1) as f64 / 1000.0) as usize).max(1);
    let mut chunk = Vec::with_capacity(chunk_frames * format.samples_per_frame());
    let mut fed_frames = 0usize;
    let mut last_status = Instant::now();

    'feed: loop {
        let frames = source
            .next_chunk(chunk_frames, &mut chunk)
            .context("source failed")?;
        if frames == 0 {
            break;
        }

        // 队列满时保留当前块，轮询直到被接受
        loop {
            if !running.load(Ordering::SeqCst) {
                break 'feed;
            }
            if !handle_key(engine) {
                break 'feed;
            }
            if !engine.is_enabled() {
                bail!("output stopped unexpectedly");
            }

            let accepted = engine.feed(
                Samples::Interleaved(&chunk),
                format.sample_rate,
                format.channels,
                frames,
            );
            if accepted == frames {
                fed_frames += frames;
                break;
            }

            if last_status.elapsed() >= Duration::from_millis(100) {
                print_status(engine, fed_frames, total_frames, format.sample_rate)?;
                last_status = Instant::now();
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    // 等待队列排空
    while running.load(Ordering::SeqCst) && engine.is_enabled() && engine.pending_buffer_count() > 0
    {
        if !handle_key(engine) {
            break;
        }
        print_status(engine, fed_frames, total_frames, format.sample_rate)?;
        std::thread::sleep(Duration::from_millis(50));
    }

    println!();
    engine.disable();
    println!("\n{}", engine.stats_report(REPORT_FRAMES_PER_CALL));
    Ok(())
}

/// 处理键盘输入，返回 false 表示退出
fn handle_key(engine: &mut Engine) -> bool {
    match read_char_nonblocking() {
        Some(b' ') => {
            let paused = engine.is_paused();
            engine.pause(!paused);
            true
        }
        Some(b'f') => {
            engine.flush();
            true
        }
        Some(b'q') => false,
        _ => true,
    }
}

fn print_status(
    engine: &Engine,
    fed_frames: usize,
    total_frames: Option<usize>,
    sample_rate: f64,
) -> anyhow::Result<()> {
    let stats = engine.stats();
    let fed_secs = fed_frames as f64 / sample_rate;
    let total_secs = total_frames.map(|f| f as f64 / sample_rate).unwrap_or(0.0);

    print!(
        "\r  {:>7.2}s / {:>7.2}s  |  Queue: {}/{}  |  Latency: {:6.1} ms  |  Underruns: {}  {}",
        fed_secs,
        total_secs,
        stats.pending_buffers,
        stats.queue_capacity,
        stats.latency_secs * 1000.0,
        stats.underrun_count,
        if engine.is_paused() { "[paused]" } else { "        " }
    );
    io::stdout().flush()?;
    Ok(())
}

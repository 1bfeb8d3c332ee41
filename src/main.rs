use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use emu_harness_lib::app::config::{
    check_device_port, config_path, load_config_from_path, PipelineConfig,
};
use emu_harness_lib::app::logging::init_logging;
use emu_harness_lib::app::pipeline::Pipeline;
use emu_harness_lib::app::report::{render_text, Report};
use tracing::{error, warn};

const USAGE: &str = "Usage: emu_harness <run|watch|stop|config> [--config PATH] [--avd NAME] [--port N] [--reuse-device] [--out DIR] [--skip-build] [--skip-install] [--skip-launch] [--skip-checks] [--json] [--interval-secs N] [--max-runs N]\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Run,
    Watch,
    Stop,
    Config,
}

#[derive(Debug, Clone)]
struct Args {
    command: Command,
    config_path: Option<PathBuf>,
    avd: Option<String>,
    port: Option<u16>,
    reuse_device: bool,
    out_dir: Option<PathBuf>,
    skip_build: bool,
    skip_install: bool,
    skip_launch: bool,
    skip_checks: bool,
    json: bool,
    interval_secs: u64,
    max_runs: Option<usize>,
}

fn next_value<I: Iterator<Item = String>>(it: &mut I, flag: &str) -> Result<String, String> {
    it.next()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| format!("{flag} requires a value"))
}

fn parse_args<I: IntoIterator<Item = String>>(raw: I) -> Result<Args, String> {
    let mut it = raw.into_iter();
    let command = match it.next().as_deref() {
        Some("run") => Command::Run,
        Some("watch") => Command::Watch,
        Some("stop") => Command::Stop,
        Some("config") => Command::Config,
        Some("-h") | Some("--help") | None => return Err(USAGE.to_string()),
        Some(other) => return Err(format!("Unknown command: {other}\n{USAGE}")),
    };

    let mut args = Args {
        command,
        config_path: None,
        avd: None,
        port: None,
        reuse_device: false,
        out_dir: None,
        skip_build: false,
        skip_install: false,
        skip_launch: false,
        skip_checks: false,
        json: false,
        interval_secs: 300,
        max_runs: None,
    };

    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => args.config_path = Some(PathBuf::from(next_value(&mut it, "--config")?)),
            "--avd" => args.avd = Some(next_value(&mut it, "--avd")?),
            "--port" => {
                let value = next_value(&mut it, "--port")?;
                args.port = Some(
                    value
                        .parse::<u16>()
                        .map_err(|_| "--port must be a number".to_string())?,
                );
            }
            "--reuse-device" => args.reuse_device = true,
            "--out" => args.out_dir = Some(PathBuf::from(next_value(&mut it, "--out")?)),
            "--skip-build" => args.skip_build = true,
            "--skip-install" => args.skip_install = true,
            "--skip-launch" => args.skip_launch = true,
            "--skip-checks" => args.skip_checks = true,
            "--json" => args.json = true,
            "--interval-secs" => {
                let value = next_value(&mut it, "--interval-secs")?;
                args.interval_secs = value
                    .parse::<u64>()
                    .map_err(|_| "--interval-secs must be a number".to_string())?;
            }
            "--max-runs" => {
                let value = next_value(&mut it, "--max-runs")?;
                args.max_runs = Some(
                    value
                        .parse::<usize>()
                        .map_err(|_| "--max-runs must be a number".to_string())?,
                );
            }
            "-h" | "--help" => return Err(USAGE.to_string()),
            other => return Err(format!("Unknown arg: {other}")),
        }
    }

    args.interval_secs = args.interval_secs.max(1);
    Ok(args)
}

fn apply_overrides(config: &mut PipelineConfig, args: &Args) {
    if let Some(avd) = &args.avd {
        config.device.avd_name = avd.clone();
    }
    if let Some(port) = args.port {
        config.device.port = port;
    }
    config.device.reuse_running |= args.reuse_device;
    if let Some(out_dir) = &args.out_dir {
        config.report.output_dir = out_dir.to_string_lossy().to_string();
    }
    config.stages.skip_build |= args.skip_build;
    config.stages.skip_install |= args.skip_install;
    config.stages.skip_launch |= args.skip_launch;
    config.stages.skip_checks |= args.skip_checks;
}

fn print_report(report: &Report, json: bool) {
    if json {
        println!("{}", serde_json::to_string_pretty(report).unwrap_or_default());
        return;
    }
    println!("{}", render_text(report));
    if let Some(path) = &report.report_path {
        println!("report: {}", path.display());
    }
}

/// First Ctrl-C stops the device owned by this process and lets the run
/// finish its report; a second one exits immediately.
fn install_interrupt_handler(pipeline: Arc<Pipeline>, stop: Arc<AtomicBool>) {
    let result = ctrlc::set_handler(move || {
        if stop.swap(true, Ordering::SeqCst) {
            process::exit(130);
        }
        warn!("interrupt received, stopping device");
        if let Err(err) = pipeline.stop_active_device() {
            error!(error = %err, "device stop failed");
        }
    });
    if let Err(err) = result {
        warn!(error = %err, "failed to install Ctrl-C handler");
    }
}

fn run(config: PipelineConfig, json: bool) -> i32 {
    let pipeline = Arc::new(Pipeline::from_config(config));
    install_interrupt_handler(Arc::clone(&pipeline), Arc::new(AtomicBool::new(false)));
    let report = pipeline.run_once();
    print_report(&report, json);
    if report.is_success() {
        0
    } else {
        1
    }
}

fn watch(config: PipelineConfig, args: &Args) -> i32 {
    let pipeline = Arc::new(Pipeline::from_config(config));
    let stop = Arc::new(AtomicBool::new(false));
    install_interrupt_handler(Arc::clone(&pipeline), Arc::clone(&stop));

    let mut failed = 0usize;
    let runs = pipeline.run_continuously(
        Duration::from_secs(args.interval_secs),
        &stop,
        args.max_runs,
        |report| {
            if !report.is_success() {
                failed += 1;
            }
            print_report(report, args.json);
        },
    );
    if !args.json {
        println!("runs: {runs}\nfailed: {failed}");
    }
    if failed > 0 {
        1
    } else {
        0
    }
}

fn stop(config: PipelineConfig) -> i32 {
    let serial = config.device.serial();
    let pipeline = Pipeline::from_config(config);
    match pipeline.stop_device_if_running() {
        Ok(true) => {
            println!("stopped {serial}");
            0
        }
        Ok(false) => {
            println!("{serial} is not running");
            0
        }
        Err(err) => {
            eprintln!("Failed to stop {serial}: {err}");
            1
        }
    }
}

fn print_config(config: &PipelineConfig, path: &std::path::Path) -> i32 {
    match serde_json::to_string_pretty(config) {
        Ok(payload) => {
            eprintln!("config: {}", path.display());
            println!("{payload}");
            0
        }
        Err(err) => {
            eprintln!("Failed to serialize config: {err}");
            1
        }
    }
}

fn main() {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{msg}");
            process::exit(2);
        }
    };

    let path = args.config_path.clone().unwrap_or_else(config_path);
    let mut config = match load_config_from_path(&path) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("Failed to load config: {err}");
            process::exit(1);
        }
    };
    apply_overrides(&mut config, &args);
    if let Err(err) = check_device_port(&config.device, "") {
        eprintln!("{err}");
        process::exit(2);
    }
    init_logging(&config.logging);

    let code = match args.command {
        Command::Run => run(config, args.json),
        Command::Watch => watch(config, &args),
        Command::Stop => stop(config),
        Command::Config => print_config(&config, &path),
    };
    process::exit(code);
}

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{error, info, warn};
use moto_trends::config::load_config;
use moto_trends::enrichment::{run_job, EnrichError, RunSummary};

/// Copies every log line to stderr and to the run log file.
struct TeeWriter {
    file: File,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        std::io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stderr().flush()?;
        self.file.flush()
    }
}

/// Installs the logger. Returns the error when the log file could not be
/// opened, so it can be reported once logging works.
fn init_logging(
    level: log::LevelFilter,
    log_file: Option<&Path>,
) -> Option<(PathBuf, std::io::Error)> {
    let opened = log_file.map(|path| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|open_error| (path.to_path_buf(), open_error))
    });

    let open_failure = match opened {
        Some(Ok(file)) => {
            env_logger::Builder::new()
                .filter(None, level)
                .format(|buf, record| {
                    writeln!(
                        buf,
                        "{} - {} - {}",
                        buf.timestamp(),
                        record.level(),
                        record.args()
                    )
                })
                .target(env_logger::Target::Pipe(Box::new(TeeWriter { file })))
                .init();
            None
        }
        other => {
            let mut clog = colog::default_builder();
            clog.filter(None, level);
            clog.init();
            other.and_then(Result::err)
        }
    };

    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        log::error!("panic in thread '{}': {}", thread_name, panic_info);
    }));
    open_failure
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_arg = std::env::args_os().nth(1).map(PathBuf::from);
    let loaded = load_config(config_arg.as_deref());

    // Fatal errors and the termination marker are logged at any configured level.
    let (level, log_file) = match &loaded {
        Ok(loaded) => (
            loaded.config.run.level_filter().max(log::LevelFilter::Info),
            loaded.config.run.log_file.clone(),
        ),
        Err(_) => (log::LevelFilter::Info, None),
    };
    if let Some((path, open_error)) = init_logging(level, log_file.as_deref()) {
        warn!(
            "Cannot open log file {}: {open_error}; logging to stderr only",
            path.display()
        );
    }

    let outcome: Result<RunSummary, EnrichError> =
        loaded.map_err(EnrichError::from).and_then(|loaded| {
            if loaded.created_default {
                info!(
                    "Config file not found. Created default config. path={}",
                    loaded.path.display()
                );
            }
            log::set_max_level(loaded.config.run.level_filter());
            run_job(&loaded.config)
        });
    log::set_max_level(log::max_level().max(log::LevelFilter::Info));
    if let Err(fatal) = &outcome {
        error!("Fatal error: {fatal}");
    }
    info!("Run finished.");

    outcome?;
    Ok(())
}

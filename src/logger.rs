use chrono::Local;
use log::{Metadata, Record};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// Logs to stderr through `env_logger` and, when a run log is open, appends
/// the same records to that file.
pub struct DualLogger {
    env_logger: env_logger::Logger,
    run_log: Option<Mutex<File>>,
}

impl DualLogger {
    pub fn new(env_logger: env_logger::Logger, run_log: Option<File>) -> Self {
        Self {
            env_logger,
            run_log: run_log.map(Mutex::new),
        }
    }

    pub fn init(run_log_path: Option<&Path>) -> anyhow::Result<()> {
        let env_logger = env_logger::Builder::from_default_env()
            .format_timestamp(Some(env_logger::fmt::TimestampPrecision::Seconds))
            .build();
        let max_level = env_logger.filter();

        let run_log = match run_log_path {
            Some(path) => Some(
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?,
            ),
            None => None,
        };

        let logger = Box::new(DualLogger::new(env_logger, run_log));
        log::set_boxed_logger(logger)?;
        log::set_max_level(max_level);
        Ok(())
    }

    fn format_line(record: &Record) -> String {
        let timestamp = Local::now().format("%H:%M:%S");
        format!(
            "[{}] {:5} {} - {}",
            timestamp,
            record.level(),
            record.target(),
            record.args()
        )
    }
}

impl log::Log for DualLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.env_logger.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            self.env_logger.log(record);

            if let Some(ref file) = self.run_log {
                if let Ok(mut file) = file.lock() {
                    let _ = writeln!(file, "{}", Self::format_line(record));
                }
            }
        }
    }

    fn flush(&self) {
        self.env_logger.flush();
        if let Some(ref file) = self.run_log {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
    }
}

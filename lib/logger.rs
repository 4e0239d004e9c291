use chrono::Local;
use log::{Log, Metadata, Record};
use once_cell::sync::Lazy;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Mutex;

enum Sink {
    Console,
    File(File),
}

pub struct Logger {
    sinks: Mutex<Vec<Sink>>,
}

static G_LOGGER: Lazy<Logger> = Lazy::new(|| Logger {
    sinks: Mutex::new(Vec::new()),
});

impl Logger {
    /// install the global logger, calling it more than once returns the same instance
    pub fn init() -> &'static Logger {
        let logger: &'static Logger = &G_LOGGER;
        if log::set_logger(logger).is_ok() {
            log::set_max_level(log::LevelFilter::Warn);
        }
        logger
    }

    pub fn add_console(&self) -> &Self {
        self.sinks.lock().unwrap().push(Sink::Console);
        self
    }

    /// append records to `path`, when the file can't be opened we fall back to stderr
    pub fn add_file(&self, path: &str, truncate: bool) -> &Self {
        let mut opt = OpenOptions::new();
        opt.create(true);
        if truncate {
            opt.write(true).truncate(true);
        } else {
            opt.append(true);
        }
        let sink = match opt.open(path) {
            Ok(f) => Sink::File(f),
            Err(e) => {
                eprintln!("can't open log file {path}, error {e}");
                Sink::Console
            }
        };
        self.sinks.lock().unwrap().push(sink);
        self
    }

    fn format(record: &Record) -> String {
        format!(
            "[{} {:<5} {}:{}] {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S%.6f"),
            record.level(),
            record.file().unwrap_or("?"),
            record.line().unwrap_or(0),
            record.args()
        )
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = Self::format(record);
        let mut sinks = self.sinks.lock().unwrap();
        for s in sinks.iter_mut() {
            let _ = match s {
                Sink::Console => std::io::stderr().write_all(line.as_bytes()),
                Sink::File(f) => f.write_all(line.as_bytes()),
            };
        }
    }

    fn flush(&self) {
        let mut sinks = self.sinks.lock().unwrap();
        for s in sinks.iter_mut() {
            if let Sink::File(f) = s {
                let _ = f.flush();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::Logger;
    use log::{Level, Record};

    #[test]
    fn test_format() {
        let record = Record::builder()
            .args(format_args!("load /tmp/x done"))
            .level(Level::Info)
            .file(Some("lib/backend/dram.rs"))
            .line(Some(42))
            .build();
        let line = Logger::format(&record);
        assert!(line.ends_with("] load /tmp/x done\n"));
        assert!(line.contains("INFO  lib/backend/dram.rs:42"));
    }
}

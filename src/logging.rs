use std::path::Path;

use anyhow::Error;
use log::LevelFilter;
use log4rs::{
    append::{
        console::{ConsoleAppender, Target},
        file::FileAppender,
    },
    config::{Appender, Config, Root},
    encode::pattern::PatternEncoder,
    filter::threshold::ThresholdFilter,
};

const CONSOLE_PATTERN: &str = "{l} {t} - {m}{n}";
const ERROR_LOG_PATTERN: &str = "{d(%H:%M:%S%.3f)} {l} [{f}:{L}] {t} - {m}{n}";

/// Maps the `-v`/`-q` flags of the command line to a console level.
pub fn console_level(verbose: u8, quiet: bool) -> LevelFilter {
    match (quiet, verbose) {
        (true, _) => LevelFilter::Warn,
        (false, 0) => LevelFilter::Info,
        (false, 1) => LevelFilter::Debug,
        (false, _) => LevelFilter::Trace,
    }
}

/// Builds the logger configuration.
///
/// The console appender writes to stderr at `level`. If `error_log` is given,
/// every warning and error is also written to that file, tagged with the source
/// location that logged it.
pub fn config(level: LevelFilter, error_log: Option<&Path>) -> Result<Config, Error> {
    let console = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(CONSOLE_PATTERN)))
        .build();

    let mut builder = Config::builder().appender(
        Appender::builder()
            .filter(Box::new(ThresholdFilter::new(level)))
            .build("console", Box::new(console)),
    );
    let mut root = Root::builder().appender("console");
    let mut root_level = level;

    if let Some(path) = error_log {
        let file = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(ERROR_LOG_PATTERN)))
            .append(false)
            .build(path)?;

        builder = builder.appender(
            Appender::builder()
                .filter(Box::new(ThresholdFilter::new(LevelFilter::Warn)))
                .build("error_log", Box::new(file)),
        );
        root = root.appender("error_log");
        root_level = root_level.max(LevelFilter::Warn);
    }

    Ok(builder.build(root.build(root_level))?)
}

/// Installs the logger for the rest of the process.
pub fn init(level: LevelFilter, error_log: Option<&Path>) -> Result<(), Error> {
    log4rs::init_config(config(level, error_log)?)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use anyhow::Error;
    use log::LevelFilter;

    use super::{config, console_level};

    #[test]
    fn verbosity_flags() {
        assert_eq!(console_level(0, false), LevelFilter::Info);
        assert_eq!(console_level(1, false), LevelFilter::Debug);
        assert_eq!(console_level(3, false), LevelFilter::Trace);
        assert_eq!(console_level(2, true), LevelFilter::Warn);
    }

    #[test]
    fn error_log_is_an_extra_appender() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("errors.log");

        let without = config(LevelFilter::Info, None)?;
        assert_eq!(without.appenders().len(), 1);

        let with = config(LevelFilter::Warn, Some(&path))?;
        assert_eq!(with.appenders().len(), 2);
        assert_eq!(with.root().appenders().len(), 2);
        assert!(path.exists());

        Ok(())
    }
}

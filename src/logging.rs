use simplelog::*;
use std::fs::{self, OpenOptions};
use std::io::{Error, ErrorKind};
use std::path::PathBuf;
use std::str::FromStr;

/// Directory the log file is written to: `~/.local/share/umpbridge/logs`
pub fn log_dir() -> Result<PathBuf, Error> {
    let home = std::env::var("HOME")
        .map_err(|_| Error::new(ErrorKind::NotFound, "HOME environment variable not set"))?;

    Ok(PathBuf::from(home)
        .join(".local")
        .join("share")
        .join("umpbridge")
        .join("logs"))
}

/// Parses a level name, falling back to `Info` for anything unknown.
pub fn parse_level(level: &str) -> LevelFilter {
    LevelFilter::from_str(level).unwrap_or(LevelFilter::Info)
}

/// Level of the stderr logger.
///
/// The status spinner redraws on stderr, so while it runs only warnings and errors go to the
/// terminal. The log file always gets the full detail.
pub fn terminal_level(level: &str, status_display: bool) -> LevelFilter {
    let level = parse_level(level);
    if status_display {
        level.min(LevelFilter::Warn)
    } else {
        level
    }
}

/// Logs to stderr and appends everything down to Debug to `bridge.log`.
///
/// See [`terminal_level`] for what reaches stderr.
pub fn init_logger(level: &str, status_display: bool) -> Result<(), Error> {
    let log_dir = log_dir()?;
    fs::create_dir_all(&log_dir)?;

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("bridge.log"))?;

    let config = ConfigBuilder::new()
        .set_thread_level(LevelFilter::Error)
        .build();

    CombinedLogger::init(vec![
        TermLogger::new(
            terminal_level(level, status_display),
            config.clone(),
            TerminalMode::Stderr,
            ColorChoice::Auto,
        ),
        WriteLogger::new(LevelFilter::Debug, config, log_file),
    ])
    .map_err(|e| Error::new(ErrorKind::Other, format!("Logger initialization failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), LevelFilter::Debug);
        assert_eq!(parse_level("WARN"), LevelFilter::Warn);
        assert_eq!(parse_level("chatty"), LevelFilter::Info);
    }

    #[test]
    fn test_terminal_level_quiet_under_status_display() {
        assert_eq!(terminal_level("debug", true), LevelFilter::Warn);
        assert_eq!(terminal_level("info", true), LevelFilter::Warn);
        assert_eq!(terminal_level("error", true), LevelFilter::Error);
        assert_eq!(terminal_level("off", true), LevelFilter::Off);
        assert_eq!(terminal_level("debug", false), LevelFilter::Debug);
        assert_eq!(terminal_level("chatty", false), LevelFilter::Info);
    }

    #[test]
    fn test_log_dir_under_home() {
        if std::env::var("HOME").is_ok() {
            let dir = log_dir().unwrap();
            assert!(dir.ends_with(".local/share/umpbridge/logs"));
        }
    }
}

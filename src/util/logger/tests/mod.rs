//! Log level parsing and subscriber installation

use super::{try_init, LogLevel};

#[test]
fn test_parse_levels() {
    assert_eq!("debug".parse::<LogLevel>(), Ok(LogLevel::Debug));
    assert_eq!(" WARN ".parse::<LogLevel>(), Ok(LogLevel::Warn));
    assert_eq!("warning".parse::<LogLevel>(), Ok(LogLevel::Warn));
    assert!("verbose".parse::<LogLevel>().is_err());
}

#[test]
fn test_display_round_trips() {
    for level in [
        LogLevel::Trace,
        LogLevel::Debug,
        LogLevel::Info,
        LogLevel::Warn,
        LogLevel::Error,
    ] {
        assert_eq!(level.to_string().parse::<LogLevel>(), Ok(level));
    }
}

#[test]
fn test_level_maps_to_tracing() {
    assert_eq!(tracing::Level::from(LogLevel::Error), tracing::Level::ERROR);
    assert_eq!(tracing::Level::from(LogLevel::Trace), tracing::Level::TRACE);
}

#[test]
fn test_try_init_tolerates_existing_subscriber() {
    let _ = try_init(LogLevel::Debug);
    assert!(!try_init(LogLevel::Info));
    tracing::debug!("logger installed");
}

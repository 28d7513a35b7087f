use log::SetLoggerError;
use simplelog::*;

pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    CombinedLogger::init(vec![TermLogger::new(
        level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_once() {
        assert!(init(LevelFilter::Off).is_ok());
        assert!(init(LevelFilter::Off).is_err());
    }
}

use clap::{builder::ValueParser, Arg, Command};

pub const ARG_VERBOSITY: &str = "verbosity";

const LEVEL_NAMES: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

// "2" and "info" are the same level
fn parse_level(level: &str) -> Result<u8, String> {
    let level = level.trim();
    if let Ok(parsed) = level.parse::<u8>() {
        if parsed <= 5 {
            return Ok(parsed);
        }
    }
    LEVEL_NAMES
        .iter()
        .position(|name| name.eq_ignore_ascii_case(level))
        .and_then(|index| u8::try_from(index).ok())
        .ok_or_else(|| format!("invalid log level: {level}"))
}

#[must_use]
pub fn validator_log_level() -> ValueParser {
    ValueParser::from(parse_level)
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command.arg(
        Arg::new(ARG_VERBOSITY)
            .short('v')
            .long("verbose")
            .help("Verbosity level: ERROR, WARN, INFO, DEBUG, TRACE (default: ERROR)")
            .env("PORTERO_LOG_LEVEL")
            .global(true)
            .action(clap::ArgAction::Count)
            .value_parser(validator_log_level()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_and_numbers() {
        for (index, name) in LEVEL_NAMES.iter().enumerate() {
            assert_eq!(parse_level(name), u8::try_from(index).map_err(|e| e.to_string()));
        }
        assert_eq!(parse_level("DEBUG"), Ok(3));
        assert_eq!(parse_level("5"), Ok(5));
        assert!(parse_level("6").is_err());
        assert!(parse_level("loud").is_err());
    }
}

use clap::{Arg, ArgAction, ArgMatches, Command};

pub const ARG_RATE_LIMIT_CAPACITY: &str = "rate-limit-capacity";
pub const ARG_RATE_LIMIT_REFILL_PER_SECOND: &str = "rate-limit-refill-per-second";
pub const ARG_RATE_LIMIT_IDLE_SECONDS: &str = "rate-limit-idle-seconds";
pub const ARG_RATE_LIMIT_SWEEP_SECONDS: &str = "rate-limit-sweep-seconds";
pub const ARG_TRUST_FORWARDED_FOR: &str = "trust-forwarded-for";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Options {
    pub capacity: u32,
    pub refill_per_second: f64,
    pub idle_seconds: i64,
    pub sweep_seconds: u64,
    pub trust_forwarded_for: bool,
}

impl Options {
    #[must_use]
    pub fn parse(matches: &ArgMatches) -> Self {
        Self {
            capacity: matches
                .get_one::<u32>(ARG_RATE_LIMIT_CAPACITY)
                .copied()
                .unwrap_or(20),
            refill_per_second: matches
                .get_one::<f64>(ARG_RATE_LIMIT_REFILL_PER_SECOND)
                .copied()
                .unwrap_or(10.0),
            idle_seconds: matches
                .get_one::<i64>(ARG_RATE_LIMIT_IDLE_SECONDS)
                .copied()
                .unwrap_or(180),
            sweep_seconds: matches
                .get_one::<u64>(ARG_RATE_LIMIT_SWEEP_SECONDS)
                .copied()
                .unwrap_or(60),
            trust_forwarded_for: matches.get_flag(ARG_TRUST_FORWARDED_FOR),
        }
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_RATE_LIMIT_CAPACITY)
                .long(ARG_RATE_LIMIT_CAPACITY)
                .help("Requests a client may burst before being limited")
                .env("PORTERO_RATE_LIMIT_CAPACITY")
                .default_value("20")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new(ARG_RATE_LIMIT_REFILL_PER_SECOND)
                .long(ARG_RATE_LIMIT_REFILL_PER_SECOND)
                .help("Tokens returned to each bucket per second")
                .env("PORTERO_RATE_LIMIT_REFILL_PER_SECOND")
                .default_value("10")
                .value_parser(clap::value_parser!(f64)),
        )
        .arg(
            Arg::new(ARG_RATE_LIMIT_IDLE_SECONDS)
                .long(ARG_RATE_LIMIT_IDLE_SECONDS)
                .help("Buckets unused for this long are dropped, in seconds")
                .env("PORTERO_RATE_LIMIT_IDLE_SECONDS")
                .default_value("180")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_RATE_LIMIT_SWEEP_SECONDS)
                .long(ARG_RATE_LIMIT_SWEEP_SECONDS)
                .help("How often idle buckets are dropped, in seconds")
                .env("PORTERO_RATE_LIMIT_SWEEP_SECONDS")
                .default_value("60")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_TRUST_FORWARDED_FOR)
                .long(ARG_TRUST_FORWARDED_FOR)
                .help("Key rate limits on X-Forwarded-For / X-Real-IP (only behind a trusted proxy)")
                .env("PORTERO_TRUST_FORWARDED_FOR")
                .action(ArgAction::SetTrue),
        )
}

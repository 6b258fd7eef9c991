pub mod identity;
pub mod logging;
pub mod rate_limit;
pub mod session;
pub mod upstream;

use clap::{
    builder::styling::{AnsiColor, Effects, Styles},
    Arg, ColorChoice, Command,
};

pub const ARG_PORT: &str = "port";
pub const ARG_CORS_ORIGIN: &str = "cors-origin";

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let long_version: &'static str = Box::leak(
        format!("{} - {}", env!("CARGO_PKG_VERSION"), crate::GIT_COMMIT_HASH).into_boxed_str(),
    );

    let command = Command::new("portero")
        .about("Authenticating reverse-proxy gateway")
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(long_version)
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new(ARG_PORT)
                .short('p')
                .long(ARG_PORT)
                .help("Port to listen on")
                .default_value("8080")
                .env("PORTERO_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new(ARG_CORS_ORIGIN)
                .long(ARG_CORS_ORIGIN)
                .help("Browser origin allowed to call the gateway with credentials (repeatable)")
                .env("PORTERO_CORS_ORIGINS")
                .value_delimiter(',')
                .action(clap::ArgAction::Append),
        );

    let command = identity::with_args(command);
    let command = upstream::with_args(command);
    let command = session::with_args(command);
    let command = rate_limit::with_args(command);
    logging::with_args(command)
}

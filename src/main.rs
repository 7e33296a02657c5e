//! Thin CLI layer: parse args, styled output, and call into
//! gopayloader-core.

mod display;
mod server;

use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Arg, ArgAction, ArgMatches, Command};
use colored::Colorize;
use gopayloader_core::{CancellationToken, ClientKind, Payloader, RunConfig};
use tracing_subscriber::EnvFilter;

// ---- UI helpers (no-op when stdout isn't a TTY) ----

fn use_color() -> bool {
    std::io::stdout().is_terminal()
        && std::env::var("NO_COLOR").unwrap_or_default().is_empty()
}

fn success(msg: &str) {
    if use_color() {
        println!("{}", msg.green());
    } else {
        println!("{}", msg);
    }
}

fn error(msg: &str) {
    if use_color() {
        eprintln!("{}", msg.red());
    } else {
        eprintln!("{}", msg);
    }
}

fn cli() -> Command {
    Command::new("gopayloader")
        .version(clap::crate_version!())
        .about("HTTP load testing tool with optional jwt generation - supports HTTP/1.1, HTTP/2, HTTP/3")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(run_command())
        .subcommand(Command::new("clear-cache").about("Delete all generated jwts"))
        .subcommand(
            Command::new("http-server")
                .about("Start a local HTTP server")
                .arg(
                    Arg::new("port")
                        .short('p')
                        .long("port")
                        .default_value("8080")
                        .value_parser(clap::value_parser!(u16))
                        .help("Port"),
                )
                .arg(
                    Arg::new("response-size")
                        .short('s')
                        .long("response-size")
                        .default_value("10")
                        .value_parser(clap::value_parser!(usize))
                        .help("Response size"),
                ),
        )
}

fn run_command() -> Command {
    Command::new("run")
        .about("Load test HTTP/S server")
        .arg(
            Arg::new("url")
                .required(true)
                .value_name("URL")
                .help("Request URI to run load against, scheme://host:port/path"),
        )
        .arg(
            Arg::new("requests")
                .short('r')
                .long("requests")
                .default_value("0")
                .value_parser(clap::value_parser!(u64))
                .help("Number of requests"),
        )
        .arg(
            Arg::new("connections")
                .short('c')
                .long("connections")
                .default_value("1")
                .value_parser(clap::value_parser!(u32))
                .help("Number of simultaneous connections"),
        )
        .arg(
            Arg::new("time")
                .short('t')
                .long("time")
                .help("Execution time window, if used with -r will uniformly distribute reqs within time window, without -r reqs are unlimited"),
        )
        .arg(
            Arg::new("disable-keep-alive")
                .short('k')
                .long("disable-keep-alive")
                .action(ArgAction::SetTrue)
                .help("Disable keep-alive connections"),
        )
        .arg(
            Arg::new("skip-verify")
                .long("skip-verify")
                .action(ArgAction::SetTrue)
                .help("Don't verify the SSL cert chain"),
        )
        .arg(
            Arg::new("read-timeout")
                .long("read-timeout")
                .default_value("5s")
                .help("Read timeout"),
        )
        .arg(
            Arg::new("write-timeout")
                .long("write-timeout")
                .default_value("5s")
                .help("Write timeout"),
        )
        .arg(
            Arg::new("method")
                .short('m')
                .long("method")
                .default_value("GET")
                .help("Request method"),
        )
        .arg(
            Arg::new("body")
                .short('b')
                .long("body")
                .help("Request body"),
        )
        .arg(
            Arg::new("body-file")
                .long("body-file")
                .value_parser(clap::value_parser!(PathBuf))
                .conflicts_with("body")
                .help("Read request body from file"),
        )
        .arg(
            Arg::new("headers")
                .short('H')
                .long("headers")
                .action(ArgAction::Append)
                .value_name("name:value")
                .help("Request header, repeatable"),
        )
        .arg(
            Arg::new("mtls-cert")
                .long("mtls-cert")
                .value_parser(clap::value_parser!(PathBuf))
                .requires("mtls-key")
                .help("mTLS cert path"),
        )
        .arg(
            Arg::new("mtls-key")
                .long("mtls-key")
                .value_parser(clap::value_parser!(PathBuf))
                .requires("mtls-cert")
                .help("mTLS cert private key path"),
        )
        .arg(
            Arg::new("client")
                .long("client")
                .default_value("fasthttp")
                .value_parser(["fasthttp", "nethttp1", "nethttp2", "nethttp3"])
                .help("Which HTTP client drives the connections"),
        )
        .arg(
            Arg::new("jwt-key")
                .long("jwt-key")
                .value_parser(clap::value_parser!(PathBuf))
                .requires("jwt-header")
                .help("JWT signing private key path; enables jwt generation"),
        )
        .arg(
            Arg::new("jwt-header")
                .long("jwt-header")
                .help("Header name the JWT is sent under"),
        )
        .arg(Arg::new("jwt-kid").long("jwt-kid").help("JWT kid header"))
        .arg(Arg::new("jwt-sub").long("jwt-sub").help("JWT sub claim"))
        .arg(Arg::new("jwt-iss").long("jwt-iss").help("JWT iss claim"))
        .arg(Arg::new("jwt-aud").long("jwt-aud").help("JWT aud claim"))
        .arg(
            Arg::new("jwt-claims")
                .long("jwt-claims")
                .value_name("JSON")
                .help("Extra JWT claims as a json object"),
        )
        .arg(
            Arg::new("jwts-filename")
                .short('f')
                .long("jwts-filename")
                .help("Read jwts from this file under the cache dir instead of generating"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Live results display - slows down RPS slightly for long running tests"),
        )
        .arg(
            Arg::new("ticker")
                .long("ticker")
                .default_value("1s")
                .help("How often to update the live display in verbose mode"),
        )
}

fn parse_duration(matches: &ArgMatches, name: &str) -> Result<Duration, String> {
    match matches.get_one::<String>(name) {
        Some(raw) => humantime::parse_duration(raw)
            .map_err(|e| format!("invalid {} duration {}; {}", name, raw, e)),
        None => Ok(Duration::ZERO),
    }
}

fn string_flag(matches: &ArgMatches, name: &str) -> String {
    matches
        .get_one::<String>(name)
        .cloned()
        .unwrap_or_default()
}

fn build_config(matches: &ArgMatches) -> Result<RunConfig, String> {
    let client =
        ClientKind::parse(&string_flag(matches, "client")).map_err(|e| e.to_string())?;
    Ok(RunConfig {
        req_uri: string_flag(matches, "url"),
        method: string_flag(matches, "method"),
        headers: matches
            .get_many::<String>("headers")
            .map(|vals| vals.cloned().collect())
            .unwrap_or_default(),
        body: string_flag(matches, "body"),
        body_file: matches.get_one::<PathBuf>("body-file").cloned(),
        disable_keep_alive: matches.get_flag("disable-keep-alive"),
        skip_verify: matches.get_flag("skip-verify"),
        mtls_cert: matches.get_one::<PathBuf>("mtls-cert").cloned(),
        mtls_key: matches.get_one::<PathBuf>("mtls-key").cloned(),
        reqs: matches.get_one::<u64>("requests").copied().unwrap_or(0),
        conns: matches.get_one::<u32>("connections").copied().unwrap_or(1),
        duration: parse_duration(matches, "time")?,
        read_timeout: parse_duration(matches, "read-timeout")?,
        write_timeout: parse_duration(matches, "write-timeout")?,
        client,
        jwt_header: string_flag(matches, "jwt-header"),
        jwt_key: matches.get_one::<PathBuf>("jwt-key").cloned(),
        jwt_kid: string_flag(matches, "jwt-kid"),
        jwt_sub: string_flag(matches, "jwt-sub"),
        jwt_iss: string_flag(matches, "jwt-iss"),
        jwt_aud: string_flag(matches, "jwt-aud"),
        jwt_claims: string_flag(matches, "jwt-claims"),
        jwts_filename: string_flag(matches, "jwts-filename"),
        verbose: matches.get_flag("verbose"),
        ticker: parse_duration(matches, "ticker")?,
    })
}

async fn run(matches: &ArgMatches) -> i32 {
    let cfg = match build_config(matches) {
        Ok(cfg) => cfg,
        Err(e) => {
            error(&e);
            return 1;
        }
    };

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        signal_cancel.cancel();
    });

    match Payloader::new(cfg).run(cancel).await {
        Ok(result) => {
            display::render(&result);
            0
        }
        Err(e) => {
            error(&e.to_string());
            1
        }
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn clear_cache() -> i32 {
    match gopayloader_core::clear_cache() {
        Ok(()) => {
            success("Cache cleared");
            0
        }
        Err(e) => {
            error(&e.to_string());
            1
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let matches = cli().get_matches();
    let code = match matches.subcommand() {
        Some(("run", sub)) => run(sub).await,
        Some(("clear-cache", _)) => clear_cache(),
        Some(("http-server", sub)) => {
            let port = sub.get_one::<u16>("port").copied().unwrap_or(8080);
            let size = sub.get_one::<usize>("response-size").copied().unwrap_or(10);
            server::serve(port, size).await
        }
        _ => 2,
    };
    std::process::exit(code);
}

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # simlink
//!
//! Command-line driver for a cellular modem on a serial port.
//!
//! Every subcommand opens the port, probes it with `AT`, runs one operation
//! and prints the raw reply (or a JSON object for parsed results). Each AT
//! command blocks for its configured window; Ctrl-C cancels the command in
//! flight.
//!
//! ## Subcommands
//!
//! | Command                        | AT traffic                                   |
//! |--------------------------------|----------------------------------------------|
//! | `at <cmd> [--timeout-ms N]`    | `<cmd>`                                      |
//! | `monitor`                      | `AT+CLIP=1`, `AT+CMGF=1`, then service loop  |
//! | `call <number>`                | `ATD<number>;`                               |
//! | `answer` / `hangup`            | `ATA` / `ATH`                                |
//! | `sms <number> <message>`       | `AT+CMGF=1`, `AT+CMGS`, body + Ctrl-Z        |
//! | `signal` / `operator`          | `AT+CSQ` / `AT+COPS?`                        |
//! | `ip`                           | `AT+IPADDR`                                  |
//! | `ussd <code>`                  | `AT+CUSD=1,"<code>",15` (validated first)    |
//! | `http-get <url>`               | `AT+HTTPINIT` … `AT+HTTPACTION=0` … `AT+HTTPREAD` |
//! | `http-post <url> <data>`       | … `AT+HTTPDATA` … `AT+HTTPACTION=1` …        |
//!
//! `monitor` prints one JSON object per line for each incoming call or SMS and
//! runs until Ctrl-C.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{error, info};

use simlink::{CancelSignal, Config, Echo, ModemEvents, SerialTransport, SimModem};

/// AT command driver for cellular modems.
#[derive(Parser)]
#[command(name = "simlink", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long, global = true)]
    config: Option<String>,
    /// Mirror every byte received from the modem to stderr.
    #[arg(long, global = true)]
    echo: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a raw AT command and print everything received in its window.
    At {
        command: String,
        /// Reply window in milliseconds (default: `timeouts.command_ms`).
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Print incoming calls and SMS as JSON lines until Ctrl-C.
    Monitor,
    /// Dial a voice call.
    Call { number: String },
    /// Answer a ringing call.
    Answer,
    /// Hang up the current call.
    Hangup,
    /// Send a text-mode SMS.
    Sms { number: String, message: String },
    /// Signal strength in dBm.
    Signal,
    /// Registered network operator.
    Operator,
    /// Data session IP address.
    Ip,
    /// Send a USSD / MMI code (e.g. `*100#`).
    Ussd { code: String },
    /// HTTP GET through the modem's HTTP stack.
    HttpGet { url: String },
    /// HTTP POST through the modem's HTTP stack.
    HttpPost {
        url: String,
        data: String,
        /// Request content type (default `application/x-www-form-urlencoded`).
        #[arg(long)]
        content_type: Option<String>,
    },
}

/// Prints call/SMS events as JSON lines on stdout.
struct JsonEvents;

impl ModemEvents for JsonEvents {
    fn on_call(&mut self, caller_id: &str) {
        println!("{}", json!({ "type": "call", "caller": caller_id }));
    }

    fn on_sms(&mut self, sender: &str, body: &str) {
        println!("{}", json!({ "type": "sms", "sender": sender, "body": body }));
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received SIGINT, cancelling");
            flag.store(true, Ordering::Relaxed);
        }
    });

    // The modem loop busy-polls the port; keep it off the async workers.
    let Cli { command, echo, .. } = cli;
    let result = tokio::task::spawn_blocking(move || run(&config, command, echo, &cancel)).await;

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!("{e}");
            std::process::exit(1);
        }
        Err(e) => {
            error!("modem thread failed: {e}");
            std::process::exit(1);
        }
    }
}

fn run(
    config: &Config,
    command: Commands,
    echo: bool,
    cancel: &Arc<AtomicBool>,
) -> Result<(), String> {
    let mut modem = SimModem::open(config, Arc::clone(cancel) as Arc<dyn CancelSignal>)?;
    if echo {
        modem = modem.with_echo(Echo::stderr());
    }
    info!("Modem on {}", config.serial.device);
    modem.begin();

    let timeouts = *modem.timeouts();
    let output = match command {
        Commands::At {
            command,
            timeout_ms,
        } => modem.execute(
            &command,
            timeout_ms.map_or(timeouts.command, Duration::from_millis),
        ),
        Commands::Monitor => return monitor(&mut modem, config, cancel),
        Commands::Call { number } => modem.make_call(&number),
        Commands::Answer => modem.answer_call(),
        Commands::Hangup => modem.hang_up(),
        Commands::Sms { number, message } => modem.send_sms(&number, &message),
        Commands::Signal => {
            let raw = modem.signal_strength();
            let (rssi_dbm, error) = match simlink::parse::parse_csq(&raw) {
                Ok(dbm) => (Some(dbm), None),
                Err(e) => (None, Some(e)),
            };
            json!({ "rssi_dbm": rssi_dbm, "error": error, "raw": raw }).to_string()
        }
        Commands::Operator => {
            let raw = modem.operator();
            json!({ "operator": simlink::parse::parse_cops(&raw), "raw": raw }).to_string()
        }
        Commands::Ip => modem.ip_address(),
        Commands::Ussd { code } => modem.send_ussd_checked(&code),
        Commands::HttpGet { url } => {
            let body = modem.http_get(&url);
            json!({ "status": modem.http_status(), "body": body }).to_string()
        }
        Commands::HttpPost {
            url,
            data,
            content_type,
        } => {
            let body = modem.http_post(&url, &data, content_type.as_deref());
            json!({ "status": modem.http_status(), "body": body }).to_string()
        }
    };

    modem.health()?;
    println!("{}", output.trim_end());
    Ok(())
}

fn monitor(
    modem: &mut SimModem<SerialTransport>,
    config: &Config,
    cancel: &AtomicBool,
) -> Result<(), String> {
    let timeouts = *modem.timeouts();
    modem.enable_caller_id();
    modem.send("AT+CMGF=1", timeouts.command);
    modem.set_handler(JsonEvents);

    info!("Monitoring for calls and SMS (Ctrl-C to stop)");
    let interval = config.service.poll_interval();
    while !cancel.is_cancelled() {
        modem.service();
        modem.health()?;
        std::thread::sleep(interval);
    }
    info!("Monitor stopped");
    Ok(())
}

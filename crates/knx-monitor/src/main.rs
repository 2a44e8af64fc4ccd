//! Standalone KNX bus monitor.
//!
//! Taps a KNX/IP tunnel, a multicast router, or a USB interface through the
//! shared transport layer (read-only: it never writes to the bus) and prints
//! one line per telegram, decoded against an optional ETS group-address
//! export.  Addresses can be filtered with `a/b/c` patterns where any
//! component may be `*`.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use snapdog_core::catalogue::Catalogue;
use snapdog_core::config::{KnxConfig, KnxConnectionType};
use snapdog_core::knx::cemi::GroupEvent;
use snapdog_core::knx::dpt;
use snapdog_core::knx::KnxLink;
use snapdog_core::resilience::ServicePolicies;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Connection {
    Tunnel,
    Router,
    Usb,
}

#[derive(Debug, Parser)]
#[command(name = "knx-monitor", about = "Live KNX group telegram monitor")]
struct Args {
    /// Connection mode.
    #[arg(long, value_enum, default_value_t = Connection::Tunnel)]
    connection: Connection,

    /// Gateway host or address (tunnel mode).
    #[arg(long)]
    gateway: Option<String>,

    /// KNX/IP port.
    #[arg(long, default_value_t = 3671)]
    port: u16,

    /// Multicast group (router mode).
    #[arg(long, default_value = "224.0.23.12")]
    multicast: String,

    /// Address filter, e.g. `1/2/3` or `1/*/*`.
    #[arg(long)]
    filter: Option<String>,

    /// ETS group-address CSV export.
    #[arg(long)]
    csv: Option<PathBuf>,

    /// Verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

/// `a/b/c` with `*` wildcards → anchored regex over the address rendering.
fn wildcard_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let escaped: Vec<String> = pattern
        .split('/')
        .map(|part| {
            if part == "*" {
                ".*".to_string()
            } else {
                regex::escape(part)
            }
        })
        .collect();
    Regex::new(&format!("^{}$", escaped.join("/")))
}

/// One rendered telegram line:
/// `[ts] Write 1.1.23 → 2/0/7 = on (Raw: 01) 1.001 Living room light`.
fn render_telegram(event: &GroupEvent, catalogue: &Catalogue, now: chrono::DateTime<chrono::Local>) -> String {
    let mut line = format!(
        "[{}] {:<8} {} → {}",
        now.format("%H:%M:%S%.3f"),
        event.apci.label(),
        event.src,
        event.dst
    );

    if !event.raw.is_empty() {
        let formatted = match &event.value {
            Some(value) => dpt::format_value(value, event.dpt),
            None => event.raw.iter().map(|b| format!("{b:02X}")).collect(),
        };
        let hex: String = event
            .raw
            .iter()
            .map(|b| format!("{b:02X} "))
            .collect::<String>()
            .trim_end()
            .to_string();
        line.push_str(&format!(" = {formatted} (Raw: {hex})"));
        if let Some(dpt) = event.dpt {
            line.push_str(&format!(" {dpt}"));
        }
    }

    if let Some(description) = catalogue.description_for(event.dst) {
        line.push_str(&format!(" {description}"));
    }
    line
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(if args.verbose { "debug" } else { "warn" })
            }),
        )
        .init();

    let filter = match &args.filter {
        Some(pattern) => match wildcard_to_regex(pattern) {
            Ok(regex) => Some(regex),
            Err(e) => {
                eprintln!("invalid filter '{pattern}': {e}");
                return ExitCode::from(2);
            }
        },
        None => None,
    };

    if args.connection == Connection::Tunnel && args.gateway.is_none() {
        eprintln!("tunnel mode needs --gateway");
        return ExitCode::from(2);
    }

    let catalogue = match &args.csv {
        Some(path) => match Catalogue::load(path).await {
            Ok(catalogue) => {
                eprintln!("loaded {} group addresses from {}", catalogue.len(), path.display());
                catalogue
            }
            Err(e) => {
                eprintln!("cannot load {}: {e}", path.display());
                return ExitCode::from(2);
            }
        },
        None => Catalogue::default(),
    };

    let config = KnxConfig {
        enabled: true,
        connection_type: match args.connection {
            Connection::Tunnel => KnxConnectionType::Tunnel,
            Connection::Router => KnxConnectionType::Router,
            Connection::Usb => KnxConnectionType::Usb,
        },
        gateway: args.gateway.clone(),
        multicast_address: args.multicast.clone(),
        usb_device: None,
        port: args.port,
        timeout_seconds: 10,
        auto_reconnect: true,
        csv_path: None,
        resilience: ServicePolicies::default(),
    };

    let cancel = CancellationToken::new();
    let link = match KnxLink::open(config, cancel.clone()).await {
        Ok(link) => link,
        Err(e) => {
            eprintln!("connect failed: {e}");
            return ExitCode::from(1);
        }
    };
    eprintln!("connected, monitoring (ctrl-c to stop)");

    let mut events = link.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
                eprintln!("stopped");
                return ExitCode::SUCCESS;
            }
            frame = events.recv() => {
                match frame {
                    Ok(frame) => {
                        let event = GroupEvent::from_frame(&frame, catalogue.dpt_for(frame.dst));
                        if let Some(filter) = &filter {
                            if !filter.is_match(&event.dst.to_string()) {
                                continue;
                            }
                        }
                        println!("{}", render_telegram(&event, &catalogue, chrono::Local::now()));
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("monitor lagged, missed {n} telegrams");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        eprintln!("link closed");
                        cancel.cancel();
                        return ExitCode::from(1);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapdog_core::catalogue::{parse_ets_csv, GroupAddressEntry};
    use snapdog_core::knx::cemi::{Apci, CemiFrame, Payload};
    use snapdog_core::knx::dpt::DptId;
    use snapdog_core::knx::GroupAddress;

    fn ga(s: &str) -> GroupAddress {
        s.parse().unwrap()
    }

    fn ts() -> chrono::DateTime<chrono::Local> {
        use chrono::TimeZone;
        chrono::Local.with_ymd_and_hms(2024, 5, 1, 12, 30, 15).unwrap()
    }

    #[test]
    fn wildcard_patterns() {
        let exact = wildcard_to_regex("1/2/3").unwrap();
        assert!(exact.is_match("1/2/3"));
        assert!(!exact.is_match("1/2/30"));
        assert!(!exact.is_match("11/2/3"));

        let wild = wildcard_to_regex("1/2/*").unwrap();
        assert!(wild.is_match("1/2/3"));
        assert!(wild.is_match("1/2/255"));
        assert!(!wild.is_match("1/3/3"));

        let all = wildcard_to_regex("*/*/*").unwrap();
        assert!(all.is_match("31/7/255"));
    }

    #[test]
    fn renders_decoded_write() {
        let catalogue = Catalogue::new(vec![GroupAddressEntry {
            address: ga("2/0/4"),
            description: Some("Kitchen temperature".into()),
            dpt: Some(DptId::new(9, 1)),
        }]);
        let frame = CemiFrame::group_write(ga("2/0/4"), Payload::Bytes(vec![0x07, 0xD0]));
        let event = GroupEvent::from_frame(&frame, catalogue.dpt_for(ga("2/0/4")));
        let line = render_telegram(&event, &catalogue, ts());
        assert!(line.contains("Write"), "{line}");
        assert!(line.contains("0.0.0 → 2/0/4"), "{line}");
        assert!(line.contains("= 20.0°C"), "{line}");
        assert!(line.contains("(Raw: 07 D0)"), "{line}");
        assert!(line.contains("9.001"), "{line}");
        assert!(line.contains("Kitchen temperature"), "{line}");
    }

    #[test]
    fn renders_read_without_value() {
        let catalogue = Catalogue::default();
        let frame = CemiFrame::group_read(ga("1/1/1"));
        let event = GroupEvent::from_frame(&frame, None);
        let line = render_telegram(&event, &catalogue, ts());
        assert_eq!(event.apci, Apci::GroupValueRead);
        assert!(line.contains("Read"), "{line}");
        assert!(!line.contains('='), "{line}");
    }

    #[test]
    fn renders_undecodable_payload_as_hex() {
        let catalogue = Catalogue::default();
        let frame = CemiFrame::group_write(ga("1/1/1"), Payload::Bytes(vec![1, 2, 3]));
        let event = GroupEvent::from_frame(&frame, None);
        let line = render_telegram(&event, &catalogue, ts());
        assert!(line.contains("= 010203 (Raw: 01 02 03)"), "{line}");
    }

    #[test]
    fn catalogue_csv_drives_rendering() {
        let entries = parse_ets_csv("Address;Description;DPT\n3/1/9;Blinds;1.008\n");
        let catalogue = Catalogue::new(entries);
        let frame = CemiFrame::group_write(ga("3/1/9"), Payload::Small(1));
        let event = GroupEvent::from_frame(&frame, catalogue.dpt_for(ga("3/1/9")));
        let line = render_telegram(&event, &catalogue, ts());
        assert!(line.contains("= down"), "{line}");
        assert!(line.contains("Blinds"), "{line}");
    }
}

//! vhub — VideoHub command-line client.
//!
//! ```text
//! vhub <host> --status                     Print the mirrored state as JSON
//! vhub <host> --route 0:3 --lock 0         Route output 0 to input 3, lock it
//! vhub <host> --label-input 2:Replay       Rename input 2
//! vhub <host> --watch                      Print device updates until Ctrl-C
//! vhub --gen-config                        Write default config to stdout
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use futures::future::join_all;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use vhub_cli::batch::{BatchPlan, parse_label, parse_route};
use vhub_cli::config::CliConfig;
use vhub_core::{ConnectionInfo, EventKind, HubEvent, VideoHub};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "vhub", about = "Control a VideoHub-class video router")]
struct Cli {
    /// Device host name or address.
    #[arg(required_unless_present = "gen_config")]
    host: Option<String>,

    /// Control port (defaults to the configured port, 9990).
    #[arg(short, long)]
    port: Option<u16>,

    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "vhub.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Route an output to an input.
    #[arg(long = "route", value_name = "DEST:SRC", value_parser = parse_route)]
    routes: Vec<(u32, u32)>,

    /// Lock an output.
    #[arg(long = "lock", value_name = "PORT")]
    locks: Vec<u32>,

    /// Unlock an output.
    #[arg(long = "unlock", value_name = "PORT")]
    unlocks: Vec<u32>,

    /// Rename an input.
    #[arg(long = "label-input", value_name = "PORT:LABEL", value_parser = parse_label)]
    input_labels: Vec<(u32, String)>,

    /// Rename an output.
    #[arg(long = "label-output", value_name = "PORT:LABEL", value_parser = parse_label)]
    output_labels: Vec<(u32, String)>,

    /// Print the device state as JSON.
    #[arg(long)]
    status: bool,

    /// Keep printing device updates until Ctrl-C.
    #[arg(long)]
    watch: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&CliConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    // Load config.
    let config = CliConfig::load(&cli.config);

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let host = cli.host.clone().ok_or("a device host is required")?;
    let info = ConnectionInfo::new(host, cli.port.unwrap_or(config.network.port));
    info!("vhub v{}", env!("CARGO_PKG_VERSION"));
    info!("device: {info}");

    let hub = Arc::new(VideoHub::new(info, config.network.connect_options()));
    if let Err(e) = hub.connect().await {
        error!("could not connect: {e}");
        std::process::exit(1);
    }

    let receiver = tokio::spawn({
        let hub = Arc::clone(&hub);
        async move { hub.run().await }
    });

    if let Err(e) = hub.wait_for_prelude(config.network.prelude_timeout()).await {
        warn!("initial state incomplete: {e}");
    }

    // Batch: locks and labels, then routes.
    let plan = BatchPlan::new(
        &cli.routes,
        &cli.locks,
        &cli.unlocks,
        &cli.input_labels,
        &cli.output_labels,
    );
    let mut failed = 0usize;
    if !plan.is_empty() {
        let timeout = config.network.command_timeout();
        let waits = plan.issue(&hub).into_iter().map(|ticket| async move {
            let title = ticket.title().to_string();
            (title, ticket.wait_timeout(timeout).await)
        });
        for (title, result) in join_all(waits).await {
            match result {
                Ok(()) => info!("{title}: acknowledged"),
                Err(e) => {
                    error!("{title}: {e}");
                    failed += 1;
                }
            }
        }
    }

    if cli.status {
        println!("{}", serde_json::to_string_pretty(&hub.status())?);
    }

    if cli.watch {
        let (_, mut updates) = hub
            .events()
            .channel(&[EventKind::NewBlock, EventKind::AfterDisconnect]);
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        loop {
            tokio::select! {
                _ = &mut ctrl_c => {
                    info!("Ctrl-C received, shutting down");
                    break;
                }
                event = updates.recv() => match event {
                    Some(HubEvent::NewBlock(block)) => println!("{block}"),
                    Some(HubEvent::AfterDisconnect) | None => {
                        warn!("connection lost");
                        break;
                    }
                    Some(_) => {}
                },
            }
        }
    }

    hub.disconnect();
    match receiver.await {
        Ok(Ok(exit)) => debug!(?exit, "receive loop ended"),
        Ok(Err(e)) => warn!("receive loop failed: {e}"),
        Err(e) => warn!("receive loop panicked: {e}"),
    }

    if failed > 0 {
        error!("{failed} command(s) failed");
        std::process::exit(1);
    }
    Ok(())
}

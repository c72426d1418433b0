mod collectors;
mod config;
mod pass;
mod publisher;
mod snapshot;

use clap::Parser;
use collectors::site::BenchSites;
use collectors::system::{probe_report, SysinfoProbe};
use config::Config;
use pass::PassOptions;
use publisher::{prune, RestStore, StdoutStore};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "resmon")]
#[command(version)]
#[command(about = "Record host and per-site resource snapshots for the bench dashboard")]
struct Cli {
    #[arg(long, default_value = "./resmon.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    /// Publish a snapshot for every resolvable site, not just the first.
    #[arg(long)]
    all_sites: bool,
    /// Print documents instead of sending them.
    #[arg(long)]
    dry_run: bool,
    /// Delete snapshots older than publisher.retention_days and exit.
    #[arg(long, conflicts_with = "probe")]
    prune: bool,
    /// Print every host metric provider as JSON and exit. The config file must
    /// still load and carry a valid publisher section.
    #[arg(long, conflicts_with = "prune")]
    probe: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let mut cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };
    if cli.all_sites {
        cfg.process_all_sites = true;
    }

    let mut probe = SysinfoProbe::new(
        cfg.disk_mount.clone(),
        cfg.container.clone(),
        cfg.command_timeout(),
    );

    if cli.probe {
        let report = probe_report(&mut probe, &cfg.services).await;
        match serde_json::to_string_pretty(&report) {
            Ok(text) => println!("{text}"),
            Err(err) => {
                error!(error = %err, "failed to encode probe report");
                std::process::exit(1);
            }
        }
        return;
    }

    let code = if cli.dry_run {
        execute(&cfg, &cli, &mut probe, &StdoutStore).await
    } else {
        let store = match cfg
            .publisher
            .resolve_authorization()
            .map_err(|err| err.to_string())
            .and_then(|auth| RestStore::new(&cfg.publisher, auth).map_err(|err| err.to_string()))
        {
            Ok(store) => store,
            Err(err) => {
                error!(error = %err, "failed to prepare publisher");
                std::process::exit(1);
            }
        };
        execute(&cfg, &cli, &mut probe, &store).await
    };
    std::process::exit(code);
}

async fn execute<S: publisher::DocumentStore>(
    cfg: &Config,
    cli: &Cli,
    probe: &mut SysinfoProbe,
    store: &S,
) -> i32 {
    if cli.prune {
        let now = chrono::Local::now().naive_local();
        return match prune(store, &cfg.publisher.doctype, cfg.publisher.retention_days, now).await
        {
            Ok(_) => 0,
            Err(err) => {
                error!(error = %err, "retention cleanup failed");
                1
            }
        };
    }

    info!(
        all_sites = cfg.process_all_sites,
        doctype = %cfg.publisher.doctype,
        "starting collection pass"
    );
    let sites = BenchSites::from_config(cfg);
    let opts = PassOptions {
        doctype: cfg.publisher.doctype.clone(),
        all_sites: cfg.process_all_sites,
    };
    match pass::run(&sites, probe, store, &opts).await {
        Ok(report) => {
            info!(
                discovered = report.discovered,
                published = report.published.len(),
                unresolved = report.unresolved.len(),
                skipped = report.skipped.len(),
                failed = report.failed.len(),
                "collection pass finished"
            );
            0
        }
        Err(err) => {
            error!(error = %err, "collection pass aborted");
            1
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use meshdev_api::{MeshManager, SharedManagerRegistry};
use meshdev_core::{MeshDevApp, MeshDevInfo, MeshResult};
use serde::Serialize;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "meshdevctl", version, about = "Mesh dev-space CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Base namespace the dev space is cloned from
    #[arg(long = "ns", global = true, env = "MESHDEV_BASE_NAMESPACE")]
    base_namespace: Option<String>,

    /// Kubeconfig file (default: ~/.kube/config)
    #[arg(long = "kubeconfig", global = true, env = "MESHDEV_KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Clone the base namespace into a shadow namespace and inject selected workloads
    Init {
        /// Request file (JSON or YAML)
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        /// Leave partial header changes in place on failure
        #[arg(long = "no-rollback", action = ArgAction::SetTrue)]
        no_rollback: bool,
    },
    /// Apply a changed selection (and optionally a new header value) to a shadow namespace
    Update {
        /// Request file (JSON or YAML)
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        /// Leave partial header changes in place on failure
        #[arg(long = "no-rollback", action = ArgAction::SetTrue)]
        no_rollback: bool,
    },
    /// Remove a shadow namespace's header route from every base routing document
    DeleteHeader {
        /// Shadow namespace
        #[arg(long = "dev")]
        dev: String,
    },
    /// List base namespace applications and their workloads
    Apps,
    /// Show which of the requested workloads run in the shadow namespace
    AppInfo {
        /// Request file (JSON or YAML)
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
    /// List mesh-enabled base namespaces
    Namespaces,
}

fn init_tracing() {
    let env = std::env::var("MESHDEV_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("MESHDEV_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid MESHDEV_METRICS_ADDR; expected host:port");
        }
    }
}

fn read_kubeconfig(path: Option<&Path>) -> Result<String> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let home = std::env::var("HOME").context("HOME is not set; pass --kubeconfig")?;
            PathBuf::from(home).join(".kube").join("config")
        }
    };
    std::fs::read_to_string(&path).with_context(|| format!("reading kubeconfig {}", path.display()))
}

fn base_namespace(cli: &Cli) -> Result<String> {
    match cli.base_namespace.as_deref() {
        Some(ns) if !ns.is_empty() => Ok(ns.to_string()),
        _ => bail!("base namespace is required (--ns or MESHDEV_BASE_NAMESPACE)"),
    }
}

/// Request body in the wire shape; YAML is a superset so JSON parses too.
fn parse_request(text: &str, base: &str) -> Result<MeshDevInfo> {
    let mut info: MeshDevInfo = serde_yaml::from_str(text).context("parsing request")?;
    info.base_namespace = base.to_string();
    Ok(info)
}

fn load_request(path: &Path, base: &str) -> Result<MeshDevInfo> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_request(&text, base)
}

fn render_apps(apps: &[MeshDevApp]) -> String {
    let mut out = String::new();
    for app in apps {
        out.push_str(&app.name);
        out.push('\n');
        for w in &app.workloads {
            out.push_str(&format!("  {}/{}\t{}\n", w.kind, w.name, u8::from(w.selection)));
        }
    }
    out
}

fn print<T: Serialize>(output: Output, value: &T, human: impl FnOnce() -> String) -> Result<()> {
    match output {
        Output::Human => print!("{}", human()),
        Output::Json => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

/// Report a mutating operation; on failure reverse its header changes first.
async fn finish(mgr: &MeshManager, op: &str, info: &MeshDevInfo, res: MeshResult<()>, rollback: bool, output: Output) -> Result<()> {
    match res {
        Ok(()) => print(output, info, || format!("{} {}: ok\n", op, info.mesh_dev_namespace)),
        Err(e) => {
            error!(op, error = %e, "operation failed");
            if rollback && !info.rollback.is_empty() {
                let report = mgr.rollback(info).await;
                if !report.is_complete() {
                    warn!(adds = ?report.unreversed_adds, updates = ?report.unreversed_updates, "rollback left header changes in place");
                    eprintln!("rollback incomplete: {}", serde_json::to_string(&report)?);
                }
            }
            Err(e).with_context(|| format!("{} {}", op, info.mesh_dev_namespace))
        }
    }
}

async fn run(cli: &Cli, mgr: &MeshManager) -> Result<()> {
    match &cli.command {
        Commands::Init { file, no_rollback } => {
            let mut info = load_request(file, &base_namespace(cli)?)?;
            info!(base = %info.base_namespace, dev = %info.mesh_dev_namespace, "init invoked");
            let res = mgr.init_mesh_dev_space(&mut info).await;
            finish(mgr, "init", &info, res, !no_rollback, cli.output).await
        }
        Commands::Update { file, no_rollback } => {
            let mut info = load_request(file, &base_namespace(cli)?)?;
            info!(base = %info.base_namespace, dev = %info.mesh_dev_namespace, "update invoked");
            let res = mgr.update_mesh_dev_space(&mut info).await;
            finish(mgr, "update", &info, res, !no_rollback, cli.output).await
        }
        Commands::DeleteHeader { dev } => {
            let info = MeshDevInfo {
                base_namespace: base_namespace(cli)?,
                mesh_dev_namespace: dev.clone(),
                ..Default::default()
            };
            info!(base = %info.base_namespace, dev = %dev, "delete-header invoked");
            mgr.delete_tracing_header(&info).await?;
            print(cli.output, &info.mesh_dev_namespace, || format!("delete-header {}: ok\n", dev))
        }
        Commands::Apps => {
            let info = MeshDevInfo { base_namespace: base_namespace(cli)?, ..Default::default() };
            let apps = mgr.get_base_dev_space_app_info(&info).await?;
            print(cli.output, &apps, || render_apps(&apps))
        }
        Commands::AppInfo { file } => {
            let info = load_request(file, &base_namespace(cli)?)?;
            let apps = mgr.get_app_info(&info).await?;
            print(cli.output, &apps, || render_apps(&apps))
        }
        Commands::Namespaces => {
            let names = mgr.get_mesh_namespace_names().await?;
            print(cli.output, &names, || names.iter().map(|n| format!("{}\n", n)).collect())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let credential = read_kubeconfig(cli.kubeconfig.as_deref())?;
    let registry = SharedManagerRegistry::from_env();
    let mgr = registry.manager(&credential).await?;
    let res = run(&cli, &mgr).await;
    registry.clear().await;
    res
}

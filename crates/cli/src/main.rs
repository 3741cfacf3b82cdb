use std::io::Read;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use gantry_access::{spawn_rbac_invalidator, KubeBindingSource};
use gantry_api::{Call, Gateway, GatewayApi, GatewayConfig, RouteParams};
use gantry_core::{ApiObject, EventKind, Identity, ListOptions, WatchSpec};
use gantry_kubehub::KubeBackend;
use gantry_schema::{Column, SchemaView};
use gantry_store::{CLUSTER_TYPE, COUNT_TYPE, LOCAL_CLUSTER};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "gantryctl", version, about = "Gantry gateway CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace scope (default: every namespace you may see)
    #[arg(long = "ns", global = true, env = "GANTRY_NAMESPACE")]
    namespace: Option<String>,

    /// User to act as; access follows this identity's RBAC bindings
    #[arg(long = "as", global = true, env = "GANTRY_AS")]
    user: String,

    /// Group to act as; repeatable
    #[arg(long = "as-group", global = true)]
    groups: Vec<String>,

    /// Kinds the summary cache tracks, comma separated (overrides GANTRY_TRACK)
    #[arg(long = "track", global = true, value_delimiter = ',')]
    track: Option<Vec<String>>,

    /// Access set TTL in seconds (overrides GANTRY_ACCESS_TTL_SECS)
    #[arg(long = "access-ttl-secs", global = true)]
    access_ttl_secs: Option<u64>,

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
    /// Schemas visible to the caller, with the methods they may use
    Schemas,
    /// Fetch one object: `get pod ns1/web-0`, `get node n1`
    Get {
        #[arg(value_name = "TYPE")]
        type_name: String,
        /// `namespace/name`, or `name` (with --ns for namespaced types)
        id: String,
    },
    /// List a type: `ls pods`, `ls pods ns1`, `ls apps.deployments`
    Ls {
        #[arg(value_name = "TYPE")]
        type_name: String,
        /// Namespace for namespaced types, name otherwise
        nameorns: Option<String>,
        /// Label selector, e.g. `app=web`
        #[arg(short = 'l', long = "selector")]
        selector: Option<String>,
        #[arg(long = "limit")]
        limit: Option<u32>,
        /// Continue token from a previous page
        #[arg(long = "continue")]
        continue_token: Option<String>,
    },
    /// Delete one object
    Delete {
        #[arg(value_name = "TYPE")]
        type_name: String,
        id: String,
    },
    /// Stream events for a type until Ctrl-C
    Watch {
        #[arg(value_name = "TYPE")]
        type_name: String,
        /// Only this object name
        #[arg(long = "name")]
        name: Option<String>,
        #[arg(short = 'l', long = "selector")]
        selector: Option<String>,
    },
    /// Server-side apply a multi-document YAML file (`-` for stdin)
    Apply {
        #[arg(short = 'f', long = "file")]
        file: String,
    },
    /// Object counts per type and namespace, from the summary cache
    Counts {
        /// Seconds to let trackers fill the cache before reading
        #[arg(long = "wait-secs", default_value_t = 3)]
        wait_secs: u64,
    },
}

fn init_tracing() {
    let env = std::env::var("GANTRY_LOG").unwrap_or_else(|_| "warn".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("GANTRY_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid GANTRY_METRICS_ADDR; expected host:port");
        }
    }
}

fn config_from(cli: &Cli) -> Result<GatewayConfig> {
    let mut config = GatewayConfig::from_env()?;
    if let Some(track) = &cli.track {
        config.track = track.iter().filter(|t| !t.is_empty()).cloned().collect();
    }
    if let Some(secs) = cli.access_ttl_secs {
        config.access_ttl = Duration::from_secs(secs);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let mut config = config_from(&cli)?;
    if !matches!(cli.command, Commands::Counts { .. }) {
        // one-shot commands never read the summary cache
        config.track.clear();
    }

    let backend = Arc::new(KubeBackend::try_default().await?);
    let client = backend.admin_client();
    let bindings = Arc::new(KubeBindingSource::new(client.clone()));
    let backoff_max = config.watch_backoff_max;
    let gateway = Gateway::start(backend, bindings, config).await.context("starting gateway")?;
    let shutdown = CancellationToken::new();
    let invalidators = spawn_rbac_invalidator(client, Arc::clone(gateway.lookup()), backoff_max, shutdown.clone());

    let identity = Identity::new(cli.user.clone(), cli.groups.clone());
    let call = Call::new(identity.clone()).in_namespace(cli.namespace.clone());
    info!(identity = %identity, ns = ?cli.namespace, "gantryctl: gateway ready");

    let res = run(&cli, &gateway, &call).await;
    shutdown.cancel();
    for task in invalidators {
        task.abort();
    }
    res
}

async fn run(cli: &Cli, gateway: &Arc<Gateway>, call: &Call) -> Result<()> {
    match &cli.command {
        Commands::Schemas => {
            let view = gateway.resolve(&call.identity).await?;
            match cli.output {
                Output::Human => print_schemas(&view),
                Output::Json => {
                    let rows: Vec<_> = view
                        .iter()
                        .map(|s| {
                            let (collection, resource) = s.effective_methods();
                            serde_json::json!({
                                "id": s.id,
                                "pluralName": s.plural_id(),
                                "namespaced": s.namespaced,
                                "collectionMethods": collection,
                                "resourceMethods": resource,
                                "actions": s.actions.keys().collect::<Vec<_>>(),
                                "columns": s.columns,
                            })
                        })
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                }
            }
        }
        Commands::Get { type_name, id } => {
            let id = qualify(gateway, call, type_name, id).await?;
            let obj = gateway.by_id(call, type_name, &id).await?;
            print_object(cli.output, &obj)?;
        }
        Commands::Delete { type_name, id } => {
            let id = qualify(gateway, call, type_name, id).await?;
            let obj = gateway.delete(call, type_name, &id).await?;
            match cli.output {
                Output::Human => println!("deleted {} {}", obj.type_name, obj.id),
                Output::Json => println!("{}", serde_json::to_string_pretty(&obj)?),
            }
        }
        Commands::Ls { type_name, nameorns, selector, limit, continue_token } => {
            let view = gateway.resolve(&call.identity).await?;
            let mut params = RouteParams::new(type_name.clone());
            if let Some(v) = nameorns {
                params = params.with_nameorns(v.clone());
            }
            let route = params.resolve(&view);
            let call = call.for_route(&route).with_options(ListOptions {
                label_selector: selector.clone(),
                limit: *limit,
                continue_token: continue_token.clone(),
                ..Default::default()
            });
            if let Some(id) = route.id() {
                let obj = gateway.by_id(&call, type_name, &id).await?;
                return print_object(cli.output, &obj);
            }
            let list = gateway.list(&call, type_name).await?;
            match cli.output {
                Output::Human => {
                    let columns = view.lookup(type_name).map(|s| s.columns.clone()).unwrap_or_default();
                    print_table(&columns, &list.objects);
                    if let Some(token) = &list.continue_token {
                        eprintln!("more results: --continue {}", token);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&list)?),
            }
        }
        Commands::Watch { type_name, name, selector } => {
            let spec = WatchSpec {
                resource_type: type_name.clone(),
                namespace: call.namespace.clone(),
                name: name.clone(),
                label_selector: selector.clone(),
                resource_version: None,
            };
            info!(type_name = %type_name, "gantryctl: watch invoked");
            let mut feed = gateway.watch(call, spec).await?;
            loop {
                tokio::select! {
                    ev = feed.next() => {
                        let Some(ev) = ev else {
                            warn!("watch feed closed");
                            break;
                        };
                        match cli.output {
                            Output::Json => println!("{}", serde_json::to_string(&ev)?),
                            Output::Human => match ev.kind {
                                EventKind::Created => println!("+ {}", ev.id),
                                EventKind::Updated => println!("~ {}", ev.id),
                                EventKind::Deleted => println!("- {}", ev.id),
                                EventKind::Error => println!("! {}", ev.error.as_deref().unwrap_or("watch failed")),
                            },
                        }
                    }
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; closing watch");
                        feed.cancel();
                        break;
                    }
                }
            }
        }
        Commands::Apply { file } => {
            let yaml = read_input(file)?;
            let input = serde_json::json!({ "yaml": yaml, "defaultNamespace": call.namespace });
            let out = gateway.action(call, CLUSTER_TYPE, "apply", input).await?;
            match cli.output {
                Output::Human => {
                    for obj in out["objects"].as_array().into_iter().flatten() {
                        println!("applied {} {}", obj["type"].as_str().unwrap_or("-"), obj["id"].as_str().unwrap_or("-"));
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&out)?),
            }
        }
        Commands::Counts { wait_secs } => {
            if *wait_secs > 0 {
                let mut epochs = gateway.summary().subscribe_epoch();
                let deadline = tokio::time::Instant::now() + Duration::from_secs(*wait_secs);
                while tokio::time::timeout_at(deadline, epochs.changed()).await.is_ok_and(|r| r.is_ok()) {}
            }
            let obj = gateway.by_id(call, COUNT_TYPE, COUNT_TYPE).await?;
            match cli.output {
                Output::Human => {
                    println!("{:<40} {:>7} {:>7} {:>13}", "TYPE", "COUNT", "ERROR", "TRANSITIONING");
                    for (type_name, c) in obj.object["counts"].as_object().into_iter().flatten() {
                        let s = &c["summary"];
                        println!(
                            "{:<40} {:>7} {:>7} {:>13}",
                            type_name,
                            s["count"].as_u64().unwrap_or(0),
                            s["error"].as_u64().unwrap_or(0),
                            s["transitioning"].as_u64().unwrap_or(0)
                        );
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&obj.object)?),
            }
        }
    }
    Ok(())
}

/// Ids without a namespace pick up `--ns` for namespaced types.
async fn qualify(gateway: &Gateway, call: &Call, type_name: &str, id: &str) -> Result<String> {
    if id.contains('/') || (type_name == CLUSTER_TYPE && id == LOCAL_CLUSTER) {
        return Ok(id.to_string());
    }
    let view = gateway.resolve(&call.identity).await?;
    let namespaced = view.lookup(type_name).map_or(false, |s| s.namespaced);
    match (namespaced, call.namespace.as_deref()) {
        (true, Some(ns)) => Ok(format!("{}/{}", ns, id)),
        (true, None) => bail!("{} is namespaced: use namespace/name or --ns", type_name),
        (false, _) => Ok(id.to_string()),
    }
}

fn read_input(file: &str) -> Result<String> {
    if file == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf).context("reading stdin")?;
        Ok(buf)
    } else {
        std::fs::read_to_string(file).with_context(|| format!("reading {}", file))
    }
}

fn print_schemas(view: &SchemaView) {
    println!("{:<48} {:<10} {:<24} ACTIONS", "ID", "SCOPE", "METHODS");
    for s in view.iter() {
        let (collection, resource) = s.effective_methods();
        let methods: Vec<String> = collection
            .iter()
            .map(|m| format!("{:?}", m).to_uppercase())
            .chain(resource.iter().map(|m| format!("{:?}/id", m).to_uppercase()))
            .collect();
        let scope = if s.namespaced { "namespaced" } else { "cluster" };
        let actions: Vec<&str> = s.actions.keys().map(String::as_str).collect();
        println!("{:<48} {:<10} {:<24} {}", s.id, scope, methods.join(","), actions.join(","));
    }
}

fn print_object(output: Output, obj: &ApiObject) -> Result<()> {
    match output {
        Output::Human => println!("{}", serde_yaml::to_string(&obj.object)?),
        Output::Json => println!("{}", serde_json::to_string_pretty(obj)?),
    }
    Ok(())
}

fn print_table(columns: &[Column], objects: &[ApiObject]) {
    let columns: Vec<&Column> = columns.iter().filter(|c| c.field != "metadata.name" && c.field != "metadata.namespace").collect();
    let mut rows: Vec<Vec<String>> = Vec::with_capacity(objects.len() + 1);
    rows.push(std::iter::once("ID".to_string()).chain(columns.iter().map(|c| c.name.to_uppercase())).collect());
    for obj in objects {
        let mut row = vec![obj.id.clone()];
        for c in &columns {
            let cell = c.extract(&obj.object).unwrap_or_default();
            row.push(if c.type_name == "date" { render_age(&cell) } else { cell });
        }
        rows.push(row);
    }
    let widths: Vec<usize> = (0..rows[0].len()).map(|i| rows.iter().map(|r| r[i].len()).max().unwrap_or(0)).collect();
    for row in rows {
        let cells: Vec<String> = row.iter().zip(&widths).map(|(cell, w)| format!("{:<w$}", cell, w = *w)).collect();
        println!("{}", cells.join("   ").trim_end());
    }
}

fn render_age(timestamp: &str) -> String {
    let Ok(created) = chrono::DateTime::parse_from_rfc3339(timestamp) else { return "-".to_string() };
    let mut secs = (chrono::Utc::now().timestamp() - created.timestamp()).max(0) as u64;
    let days = secs / 86_400;
    secs %= 86_400;
    let hours = secs / 3600;
    secs %= 3600;
    let mins = secs / 60;
    secs %= 60;
    if days > 0 {
        format!("{}d{}h", days, hours)
    } else if hours > 0 {
        format!("{}h{}m", hours, mins)
    } else if mins > 0 {
        format!("{}m", mins)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ages_render_coarsest_units() {
        let ts = (chrono::Utc::now() - chrono::Duration::seconds(3 * 3600 + 120)).to_rfc3339();
        assert_eq!(render_age(&ts), "3h2m");
        assert_eq!(render_age("yesterday"), "-");
    }

    #[test]
    fn flags_parse_with_globals_after_subcommand() {
        let cli = Cli::try_parse_from(["gantryctl", "ls", "pods", "ns1", "-o", "json", "--as", "dev", "--as-group", "qa", "--track", "v1/Pod,apps/v1/Deployment"]).unwrap();
        assert_eq!(cli.output, Output::Json);
        assert_eq!(cli.user, "dev");
        assert_eq!(cli.groups, vec!["qa"]);
        assert_eq!(cli.track.as_deref(), Some(&["v1/Pod".to_string(), "apps/v1/Deployment".to_string()][..]));
        assert!(matches!(cli.command, Commands::Ls { ref nameorns, .. } if nameorns.as_deref() == Some("ns1")));
    }
}

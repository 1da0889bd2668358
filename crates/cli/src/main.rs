use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use spirereg_core::{RegistrationEntry, SpiffeId};
use spirereg_persist::{Observed, SqliteStore, StateStore};
use spirereg_reconcile::{Action, ApplyOutcome, DriftReport, EntryState, Manifest, Plan, ReconcileError, Reconciler};
use spirereg_registry::{AuthConfig, KubeExecAuth, ListFilter, RegistryClient};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "spireregctl", version, about = "Reconcile SPIRE registration entries")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Manifest file (YAML)
    #[arg(short = 'f', long = "file", global = true)]
    file: Option<PathBuf>,

    /// State database (default: ~/.spirereg/state.db)
    #[arg(long = "db", global = true, env = "SPIREREG_DB_PATH")]
    db: Option<String>,

    /// Per-RPC deadline in seconds; 0 disables it
    #[arg(long = "timeout-secs", global = true, env = "SPIREREG_TIMEOUT_SECS", default_value_t = 30)]
    timeout_secs: u64,

    /// Entries reconciled concurrently by plan, apply and drift
    #[arg(long = "parallelism", global = true, env = "SPIREREG_PARALLELISM", default_value_t = 4)]
    parallelism: usize,

    /// Namespace of the SPIRE server pod (kube-exec auth, overrides the manifest)
    #[arg(long = "namespace", global = true, requires = "label_selector")]
    namespace: Option<String>,

    /// Label selector of the SPIRE server pod (kube-exec auth)
    #[arg(long = "label-selector", global = true, requires = "namespace")]
    label_selector: Option<String>,

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
    /// Compose and validate a SPIFFE ID
    Id {
        /// Trust domain, e.g. "example.org"
        trust_domain: String,
        /// Path segments, e.g. "ns" "default" "sa" "web"
        segments: Vec<String>,
        /// Full path instead of segments, e.g. "/ns/default/sa/web"
        #[arg(long = "path", conflicts_with = "segments")]
        path: Option<String>,
    },
    /// Validate a manifest without contacting the server
    Validate,
    /// Show what apply would do
    Plan,
    /// Reconcile every manifest entry
    Apply {
        /// Delete entries whose manifest key is gone
        #[arg(long = "prune", action = ArgAction::SetTrue)]
        prune: bool,
    },
    /// Report differences between the manifest and the server (exit 2 on drift)
    Drift,
    /// Show one entry as the server has it
    Show { entry_id: String },
    /// List server entries
    Ls {
        #[arg(long = "parent-id")]
        parent_id: Option<String>,
        #[arg(long = "spiffe-id")]
        spiffe_id: Option<String>,
    },
    /// Delete an entry by manifest key or by server id
    Delete {
        key: Option<String>,
        #[arg(long = "entry-id", conflicts_with = "key", required_unless_present = "key")]
        entry_id: Option<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("SPIREREG_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("SPIREREG_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid SPIREREG_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_manifest(file: Option<&Path>) -> Result<Manifest> {
    let path = file.ok_or_else(|| anyhow!("a manifest is required (-f <file>)"))?;
    let yaml = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Manifest::from_yaml(&yaml).with_context(|| format!("loading {}", path.display()))
}

/// Flags win over the manifest's auth block.
fn resolve_auth(cli: &Cli, manifest: Option<&Manifest>) -> Result<AuthConfig> {
    if let (Some(ns), Some(sel)) = (&cli.namespace, &cli.label_selector) {
        return Ok(AuthConfig::KubeExec(KubeExecAuth::new(ns.clone(), sel.clone())));
    }
    match manifest {
        Some(m) => Ok(m.require_auth()?.clone()),
        None => bail!("no auth configured: pass --namespace and --label-selector, or -f with an auth block"),
    }
}

async fn reconciler(cli: &Cli, manifest: Option<&Manifest>) -> Result<Reconciler> {
    let auth = resolve_auth(cli, manifest)?;
    let transport = spirereg_registry::connect(&auth).await?;
    let mut client = RegistryClient::new(transport);
    if cli.timeout_secs > 0 {
        client = client.with_call_timeout(Duration::from_secs(cli.timeout_secs));
    }
    info!(auth = auth.kind(), "registry client ready");
    Ok(Reconciler::new(client))
}

fn open_store(cli: &Cli) -> Result<SqliteStore> {
    match cli.db.as_deref() {
        Some(path) => SqliteStore::open(path),
        None => SqliteStore::open_default(),
    }
}

/// Last observation per key, for the keys in `keys`.
fn prior<'a>(store: &SqliteStore, keys: impl IntoIterator<Item = &'a String>) -> Result<HashMap<String, Observed>> {
    let mut out = HashMap::new();
    for key in keys {
        if let Some(obs) = store.latest(key)? {
            out.insert(key.clone(), obs);
        }
    }
    Ok(out)
}

/// Plan against the server; when it cannot be reached, fall back to the
/// last stored observation and mark the row stale.
async fn plan_entry(rec: &Reconciler, key: String, desired: &RegistrationEntry, last: Option<&Observed>) -> PlanRow {
    match (rec.refresh(desired, last.map(|o| o.entry_id.as_str())).await, last) {
        (Err(e), Some(obs)) if e.is_retryable() => {
            warn!(key = %key, error = %e, observed_at = obs.ts, "server unreachable; planning against stored observation");
            let mut row = plan_row(key, rec.plan(desired, Some(&obs.entry)));
            row.stale = true;
            row
        }
        (res, _) => plan_row(key, res),
    }
}

/// Keys the store remembers that the manifest no longer has.
fn orphaned(store: &SqliteStore, manifest: &Manifest) -> Result<Vec<Observed>> {
    let mut out = Vec::new();
    for key in store.keys()? {
        if !manifest.entries.contains_key(&key) {
            if let Some(obs) = store.latest(&key)? {
                out.push(obs);
            }
        }
    }
    Ok(out)
}

/// Run `fut` unless Ctrl-C arrives first; in-flight registry calls are
/// then dropped.
async fn interruptible<F: Future>(fut: F) -> Result<F::Output> {
    tokio::select! {
        out = fut => Ok(out),
        _ = signal::ctrl_c() => {
            warn!("Ctrl-C received; abandoning in-flight registry calls");
            Err(anyhow!("interrupted"))
        }
    }
}

#[derive(Debug, Serialize)]
struct PlanRow {
    key: String,
    plan: Option<String>,
    entry_id: Option<String>,
    changes: Vec<String>,
    error: Option<String>,
    /// Planned against the stored observation, not the live server.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stale: bool,
}

#[derive(Debug, Serialize)]
struct ApplyRow {
    key: String,
    action: Option<Action>,
    state: Option<EntryState>,
    entry_id: Option<String>,
    revision: Option<i64>,
    error: Option<String>,
}

impl ApplyRow {
    fn from_result(key: String, res: &Result<ApplyOutcome, ReconcileError>) -> Self {
        match res {
            Ok(out) => Self {
                key,
                action: Some(out.action),
                state: Some(out.state),
                entry_id: out.entry_id().map(str::to_string),
                revision: out.entry.as_ref().map(|e| e.revision_number),
                error: None,
            },
            Err(e) => Self { key, action: None, state: None, entry_id: None, revision: None, error: Some(e.to_string()) },
        }
    }
}

#[derive(Debug, Serialize)]
struct DriftRow {
    key: String,
    report: Option<DriftReport>,
    error: Option<String>,
}

fn plan_row(key: String, res: Result<Plan, ReconcileError>) -> PlanRow {
    match res {
        Ok(p) => {
            let (entry_id, changes) = match &p {
                Plan::Update { observed, changes, .. } => {
                    (observed.entry_id.clone(), changes.iter().map(|f| f.to_string()).collect())
                }
                Plan::Replace { observed, .. } => (observed.entry_id.clone(), vec!["parent_id".to_string()]),
                Plan::Delete { entry_id } => (Some(entry_id.clone()), Vec::new()),
                Plan::NoOp { entry } => (entry.entry_id.clone(), Vec::new()),
                Plan::Create { .. } => (None, Vec::new()),
            };
            PlanRow { key, plan: Some(p.kind().to_string()), entry_id, changes, error: None, stale: false }
        }
        Err(e) => PlanRow { key, plan: None, entry_id: None, changes: Vec::new(), error: Some(e.to_string()), stale: false },
    }
}

fn fmt_set(items: impl IntoIterator<Item = String>) -> String {
    let v: Vec<String> = items.into_iter().collect();
    if v.is_empty() {
        "-".to_string()
    } else {
        v.join(", ")
    }
}

fn fmt_expiry(secs: i64) -> String {
    if secs == 0 {
        return "never".to_string();
    }
    chrono::DateTime::from_timestamp(secs, 0).map(|t| t.to_rfc3339()).unwrap_or_else(|| secs.to_string())
}

fn print_entry(e: &RegistrationEntry) {
    println!("entry_id:       {}", e.entry_id.as_deref().unwrap_or("-"));
    println!("spiffe_id:      {}", e.spiffe_id);
    println!("parent_id:      {}", e.parent_id);
    println!("selectors:      {}", fmt_set(e.selectors.iter().map(|s| s.to_string())));
    println!("ttl:            {}", if e.ttl_seconds == 0 { "default".to_string() } else { format!("{}s", e.ttl_seconds) });
    println!("federates_with: {}", fmt_set(e.federates_with.iter().map(|t| t.to_string())));
    println!("admin:          {}", e.admin);
    println!("downstream:     {}", e.downstream);
    println!("entry_expiry:   {}", fmt_expiry(e.entry_expiry));
    println!("dns_names:      {}", fmt_set(e.dns_names.iter().cloned()));
    println!("revision:       {}", e.revision_number);
}

fn json<T: Serialize>(v: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

fn failed<T>(rows: &[T], is_err: impl Fn(&T) -> bool) -> Result<()> {
    let n = rows.iter().filter(|r| is_err(r)).count();
    if n > 0 {
        bail!("{} of {} entries failed", n, rows.len());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Id { trust_domain, segments, path } => {
            let segs: Vec<String> = match path {
                Some(p) => {
                    let p = p.strip_prefix('/').unwrap_or(p);
                    if p.is_empty() { Vec::new() } else { p.split('/').map(str::to_string).collect() }
                }
                None => segments.clone(),
            };
            let id = SpiffeId::parse(trust_domain, &segs)?;
            match cli.output {
                Output::Human => println!("{}", id),
                Output::Json => json(&serde_json::json!({
                    "spiffe_id": id.to_string(),
                    "trust_domain": id.trust_domain(),
                    "path": id.path(),
                }))?,
            }
        }
        Commands::Validate => {
            let manifest = load_manifest(cli.file.as_deref())?;
            match cli.output {
                Output::Human => {
                    println!("auth: {}", manifest.auth.as_ref().map_or("(none)", AuthConfig::kind));
                    for (key, e) in &manifest.entries {
                        println!("ok  {:<20} {} <- {}", key, e.spiffe_id, e.parent_id);
                    }
                    println!("{} entries valid", manifest.entries.len());
                }
                Output::Json => json(&manifest.entries)?,
            }
        }
        Commands::Plan => {
            let manifest = load_manifest(cli.file.as_deref())?;
            let rec = reconciler(&cli, Some(&manifest)).await?;
            let store = open_store(&cli)?;
            let last = prior(&store, manifest.entries.keys())?;
            let mut rows: Vec<PlanRow> = interruptible(
                stream::iter(manifest.entries.iter().map(|(key, desired)| {
                    let rec = rec.clone();
                    let obs = last.get(key);
                    async move { plan_entry(&rec, key.clone(), desired, obs).await }
                }))
                .buffer_unordered(cli.parallelism.max(1))
                .collect(),
            )
            .await?;
            for obs in orphaned(&store, &manifest)? {
                rows.push(plan_row(obs.key.clone(), Ok(rec.plan_removal(&obs.entry_id))));
            }
            rows.sort_by(|a, b| a.key.cmp(&b.key));
            match cli.output {
                Output::Human => {
                    for r in &rows {
                        match (&r.plan, &r.error) {
                            (Some(p), _) if p == "delete" => {
                                println!("{:<8} {:<20} {} (with --prune)", p, r.key, r.entry_id.as_deref().unwrap_or("-"))
                            }
                            (Some(p), _) => println!(
                                "{:<8} {:<20} {} {}{}",
                                p,
                                r.key,
                                r.entry_id.as_deref().unwrap_or("-"),
                                r.changes.join(","),
                                if r.stale { " (stale)" } else { "" }
                            ),
                            (None, Some(e)) => println!("{:<8} {:<20} {}", "error", r.key, e),
                            (None, None) => {}
                        }
                    }
                }
                Output::Json => json(&rows)?,
            }
            failed(&rows, |r| r.error.is_some())?;
        }
        Commands::Apply { prune } => {
            let manifest = load_manifest(cli.file.as_deref())?;
            let rec = reconciler(&cli, Some(&manifest)).await?;
            let store = open_store(&cli)?;
            let last = prior(&store, manifest.entries.keys())?;
            let results: Vec<(String, Result<ApplyOutcome, ReconcileError>)> = interruptible(
                stream::iter(manifest.entries.iter().map(|(key, desired)| {
                    let rec = rec.clone();
                    let id = last.get(key).map(|o| o.entry_id.clone());
                    async move { (key.clone(), rec.reconcile(desired, id.as_deref()).await) }
                }))
                .buffer_unordered(cli.parallelism.max(1))
                .collect(),
            )
            .await?;

            let mut rows = Vec::with_capacity(results.len());
            for (key, res) in results {
                match &res {
                    Ok(out) => match out.entry.as_ref().and_then(|e| Observed::of(key.clone(), e)) {
                        Some(obs) => store.put(&obs)?,
                        None => {
                            store.forget(&key)?;
                        }
                    },
                    Err(e) => error!(key = %key, error = %e, "reconcile failed"),
                }
                rows.push(ApplyRow::from_result(key, &res));
            }
            if *prune {
                for obs in orphaned(&store, &manifest)? {
                    let res = interruptible(rec.apply(rec.plan_removal(&obs.entry_id))).await?;
                    if res.is_ok() {
                        store.forget(&obs.key)?;
                    }
                    rows.push(ApplyRow::from_result(obs.key.clone(), &res));
                }
            }
            rows.sort_by(|a, b| a.key.cmp(&b.key));
            match cli.output {
                Output::Human => {
                    for r in &rows {
                        match (&r.action, &r.error) {
                            (Some(a), _) => println!(
                                "{:<14} {:<20} {} rev={}",
                                a.to_string(),
                                r.key,
                                r.entry_id.as_deref().unwrap_or("-"),
                                r.revision.map_or("-".to_string(), |v| v.to_string())
                            ),
                            (None, Some(e)) => println!("{:<14} {:<20} {}", "error", r.key, e),
                            (None, None) => {}
                        }
                    }
                }
                Output::Json => json(&rows)?,
            }
            failed(&rows, |r| r.error.is_some())?;
        }
        Commands::Drift => {
            let manifest = load_manifest(cli.file.as_deref())?;
            let rec = reconciler(&cli, Some(&manifest)).await?;
            let store = open_store(&cli)?;
            let last = prior(&store, manifest.entries.keys())?;
            let mut rows: Vec<DriftRow> = interruptible(
                stream::iter(manifest.entries.iter().map(|(key, desired)| {
                    let rec = rec.clone();
                    let id = last.get(key).map(|o| o.entry_id.clone());
                    async move {
                        match rec.drift(desired, id.as_deref()).await {
                            Ok(report) => DriftRow { key: key.clone(), report: Some(report), error: None },
                            Err(e) => DriftRow { key: key.clone(), report: None, error: Some(e.to_string()) },
                        }
                    }
                }))
                .buffer_unordered(cli.parallelism.max(1))
                .collect(),
            )
            .await?;
            rows.sort_by(|a, b| a.key.cmp(&b.key));
            let drifted = rows.iter().filter(|r| r.report.as_ref().is_some_and(DriftReport::has_drift)).count();
            match cli.output {
                Output::Human => {
                    for r in &rows {
                        match (&r.report, &r.error) {
                            (Some(rep), _) if rep.state == EntryState::Absent => println!("missing {}", r.key),
                            (Some(rep), _) if rep.has_drift() => {
                                println!(
                                    "drift   {} ({}) +{} ~{} -{}",
                                    r.key,
                                    rep.entry_id.as_deref().unwrap_or("-"),
                                    rep.summary.adds,
                                    rep.summary.updates,
                                    rep.summary.removes
                                );
                                for c in &rep.changes {
                                    println!("    {}: {} -> {}", c.field, c.observed, c.desired);
                                }
                            }
                            (Some(_), _) => println!("ok      {}", r.key),
                            (None, Some(e)) => println!("error   {} {}", r.key, e),
                            (None, None) => {}
                        }
                    }
                }
                Output::Json => json(&rows)?,
            }
            failed(&rows, |r| r.error.is_some())?;
            if drifted > 0 {
                info!(drifted, "drift found");
                std::process::exit(2);
            }
        }
        Commands::Show { entry_id } => {
            let manifest = cli.file.as_deref().map(|p| load_manifest(Some(p))).transpose()?;
            let rec = reconciler(&cli, manifest.as_ref()).await?;
            let entry = interruptible(rec.observe(entry_id)).await??;
            match cli.output {
                Output::Human => print_entry(&entry),
                Output::Json => json(&entry)?,
            }
        }
        Commands::Ls { parent_id, spiffe_id } => {
            let manifest = cli.file.as_deref().map(|p| load_manifest(Some(p))).transpose()?;
            let rec = reconciler(&cli, manifest.as_ref()).await?;
            let canonical = |s: &String| -> Result<String> { Ok(SpiffeId::from_str(s)?.to_string()) };
            let filter = ListFilter {
                parent_id: parent_id.as_ref().map(canonical).transpose()?,
                spiffe_id: spiffe_id.as_ref().map(canonical).transpose()?,
            };
            let entries = interruptible(rec.client().list(&filter)).await??;
            match cli.output {
                Output::Human => {
                    for e in &entries {
                        println!(
                            "{:<38} {:<40} {:<40} rev={} {}",
                            e.entry_id.as_deref().unwrap_or("-"),
                            e.spiffe_id.to_string(),
                            e.parent_id.to_string(),
                            e.revision_number,
                            fmt_set(e.selectors.iter().map(|s| s.to_string()))
                        );
                    }
                }
                Output::Json => json(&entries)?,
            }
        }
        Commands::Delete { key, entry_id } => {
            let manifest = cli.file.as_deref().map(|p| load_manifest(Some(p))).transpose()?;
            let rec = reconciler(&cli, manifest.as_ref()).await?;
            let (target, store) = match (key, entry_id) {
                (_, Some(id)) => (id.clone(), None),
                (Some(k), None) => {
                    let store = open_store(&cli)?;
                    let obs = store.latest(k)?.ok_or_else(|| anyhow!("no recorded entry for key {}", k))?;
                    (obs.entry_id, Some(store))
                }
                (None, None) => bail!("pass a manifest key or --entry-id"),
            };
            let out = interruptible(rec.apply(rec.plan_removal(&target))).await??;
            if let (Some(store), Some(k)) = (store, key) {
                store.forget(k)?;
            }
            match cli.output {
                Output::Human => println!("{} {}", out.action, target),
                Output::Json => json(&out)?,
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use spirereg_core::{Selector, SelectorSet};
    use spirereg_registry::{Code, InMemoryRegistry, Op, RpcStatus};
    use std::sync::Arc;

    #[test]
    fn cli_definition_is_consistent() { Cli::command().debug_assert(); }

    #[test]
    fn delete_needs_key_or_entry_id() {
        assert!(Cli::try_parse_from(["spireregctl", "delete"]).is_err());
        assert!(Cli::try_parse_from(["spireregctl", "delete", "web", "--entry-id", "x"]).is_err());
        assert!(Cli::try_parse_from(["spireregctl", "delete", "--entry-id", "x"]).is_ok());
    }

    #[test]
    fn kube_exec_flags_come_in_pairs() {
        assert!(Cli::try_parse_from(["spireregctl", "--namespace", "spire", "ls"]).is_err());
        let cli = Cli::try_parse_from(["spireregctl", "ls", "--namespace", "spire", "--label-selector", "app=spire-server"]).unwrap();
        let auth = resolve_auth(&cli, None).unwrap();
        assert_eq!(auth.kind(), "kube_exec");
    }

    #[test]
    fn plan_rows_name_changed_fields() {
        let row = plan_row("web".into(), Ok(Plan::Delete { entry_id: "e1".into() }));
        assert_eq!(row.plan.as_deref(), Some("delete"));
        assert_eq!(row.entry_id.as_deref(), Some("e1"));
        let err = ReconcileError::Registry(spirereg_registry::RegistryError::Unavailable("down".into()));
        let row = plan_row("api".into(), Err(err));
        assert!(row.plan.is_none());
        assert_eq!(row.error.as_deref(), Some("unavailable: down"));
    }

    #[test]
    fn parallelism_is_shared_by_every_subcommand() {
        let cli = Cli::try_parse_from(["spireregctl", "plan", "--parallelism", "16"]).unwrap();
        assert_eq!(cli.parallelism, 16);
        let cli = Cli::try_parse_from(["spireregctl", "--parallelism", "2", "apply", "--prune"]).unwrap();
        assert_eq!(cli.parallelism, 2);
        assert!(matches!(cli.command, Commands::Apply { prune: true }));
    }

    fn web() -> RegistrationEntry {
        RegistrationEntry::new(
            "spiffe://example.org/web".parse().unwrap(),
            "spiffe://example.org/spire-agent".parse().unwrap(),
            SelectorSet::normalize([Selector::new("k8s", "ns:default")]).unwrap(),
        )
    }

    #[tokio::test]
    async fn unreachable_server_plans_against_stored_observation() {
        let reg = Arc::new(InMemoryRegistry::new());
        let rec = Reconciler::new(RegistryClient::new(reg.clone()));
        let stored = web().with_server_state("e1", 3);
        let obs = Observed::of("web", &stored).unwrap();
        let mut desired = web();
        desired.admin = true;

        reg.fail_next(Op::Get, RpcStatus::unavailable("connection refused"));
        let row = plan_entry(&rec, "web".into(), &desired, Some(&obs)).await;
        assert!(row.stale);
        assert_eq!(row.plan.as_deref(), Some("update"));
        assert_eq!(row.entry_id.as_deref(), Some("e1"));
        assert_eq!(row.changes, vec!["admin"]);

        let row = plan_entry(&rec, "web".into(), &desired, None).await;
        assert_eq!(row.plan.as_deref(), Some("create"));
        assert!(!row.stale);

        reg.fail_next(Op::Get, RpcStatus::new(Code::PermissionDenied, "denied"));
        let row = plan_entry(&rec, "web".into(), &desired, Some(&obs)).await;
        assert!(row.error.is_some());
        assert!(!row.stale);
    }

    #[test]
    fn expiry_renders_as_rfc3339() {
        assert_eq!(fmt_expiry(0), "never");
        assert_eq!(fmt_expiry(86_400), "1970-01-02T00:00:00+00:00");
    }
}

//! Kube-exec transport: reaches the SPIRE server on its local socket by
//! running `spire-server entry ...` inside the server pod.
//!
//! The pod is located by namespace + label selector on every call, so a
//! restarted server pod is picked up without reconnecting. The SPIRE CLI
//! has no revision-guarded update; the guard is emulated with a read just
//! before the update, which leaves a small window for concurrent writers.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, ListParams};
use kube::Client;
use serde::{Deserialize, Deserializer};
use spirereg_core::{WireEntry, WireSelector};
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::auth::KubeExecAuth;
use crate::error::RegistryError;
use crate::status::{Code, RpcStatus};
use crate::transport::{CreatedEntry, ListFilter, RegistryTransport};

pub struct KubeExecTransport {
    pods: Api<Pod>,
    auth: KubeExecAuth,
}

struct ExecOutput {
    stdout: Vec<u8>,
    stderr: String,
    success: bool,
}

impl ExecOutput {
    fn failure_status(&self) -> RpcStatus {
        RpcStatus::parse_grpc_error(&self.stderr).unwrap_or_else(|| RpcStatus::new(Code::Unknown, self.stderr.trim()))
    }
}

fn kube_status(e: kube::Error) -> RpcStatus { RpcStatus::unavailable(format!("kube: {}", e)) }

impl KubeExecTransport {
    /// Build a transport from the ambient kube config (in-cluster or
    /// `~/.kube/config`).
    pub async fn connect(auth: KubeExecAuth) -> Result<Self, RegistryError> {
        let client = Client::try_default()
            .await
            .map_err(|e| RegistryError::Unavailable(format!("kube client: {}", e)))?;
        Ok(Self::with_client(client, auth))
    }

    pub fn with_client(client: Client, auth: KubeExecAuth) -> Self {
        let pods = Api::namespaced(client, &auth.namespace);
        Self { pods, auth }
    }

    async fn server_pod(&self) -> Result<String, RpcStatus> {
        let lp = ListParams::default().labels(&self.auth.label_selectors);
        let list = self.pods.list(&lp).await.map_err(kube_status)?;
        list.items
            .into_iter()
            .find(|p| p.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running"))
            .and_then(|p| p.metadata.name)
            .ok_or_else(|| {
                RpcStatus::unavailable(format!(
                    "no running pod matches {:?} in namespace {}",
                    self.auth.label_selectors, self.auth.namespace
                ))
            })
    }

    fn command(&self, verb: &str, args: Vec<String>) -> Vec<String> {
        let mut cmd = vec![self.auth.server_binary.clone(), "entry".into(), verb.into()];
        if let Some(sock) = &self.auth.socket_path {
            cmd.push("-socketPath".into());
            cmd.push(sock.clone());
        }
        cmd.push("-output".into());
        cmd.push("json".into());
        cmd.extend(args);
        cmd
    }

    async fn run(&self, verb: &str, args: Vec<String>) -> Result<ExecOutput, RpcStatus> {
        let pod = self.server_pod().await?;
        let cmd = self.command(verb, args);
        let mut ap = AttachParams::default().stdin(false).stdout(true).stderr(true);
        if let Some(c) = &self.auth.container {
            ap = ap.container(c.clone());
        }
        debug!(pod = %pod, verb, "exec spire-server");
        let mut attached = self.pods.exec(&pod, cmd, &ap).await.map_err(kube_status)?;
        let mut stdout = attached.stdout().ok_or_else(|| RpcStatus::unavailable("exec: stdout not attached"))?;
        let mut stderr = attached.stderr().ok_or_else(|| RpcStatus::unavailable("exec: stderr not attached"))?;
        let status = attached.take_status();

        let (mut out, mut err) = (Vec::new(), Vec::new());
        let (r_out, r_err) = tokio::join!(stdout.read_to_end(&mut out), stderr.read_to_end(&mut err));
        r_out.and(r_err).map_err(|e| RpcStatus::unavailable(format!("exec stream: {}", e)))?;

        let exit = match status {
            Some(fut) => fut.await,
            None => None,
        };
        if let Err(e) = attached.join().await {
            warn!(pod = %pod, error = %e, "exec session did not close cleanly");
        }
        let success = exit.map_or(true, |s| s.status.as_deref() == Some("Success"));
        Ok(ExecOutput { stdout: out, stderr: String::from_utf8_lossy(&err).into_owned(), success })
    }

    async fn run_batch(&self, verb: &str, args: Vec<String>) -> Result<BatchResult, RpcStatus> {
        let out = self.run(verb, args).await?;
        match parse_batch(&out.stdout) {
            Ok(res) => Ok(res),
            Err(_) if !out.success => Err(out.failure_status()),
            Err(e) => Err(e),
        }
    }

    async fn run_show(&self, args: Vec<String>) -> Result<Vec<WireEntry>, RpcStatus> {
        let out = self.run("show", args).await?;
        if !out.success {
            return Err(out.failure_status());
        }
        parse_entries(&out.stdout)
    }
}

#[async_trait::async_trait]
impl RegistryTransport for KubeExecTransport {
    async fn create_entry(&self, entry: &WireEntry) -> Result<CreatedEntry, RpcStatus> {
        let res = self.run_batch("create", entry_args(entry)).await?;
        let created = res.entry.ok_or_else(|| RpcStatus::new(Code::Unknown, "create returned no entry"))?;
        Ok(CreatedEntry { id: created.id, revision_number: created.revision_number })
    }

    async fn get_entry(&self, id: &str) -> Result<WireEntry, RpcStatus> {
        self.run_show(vec!["-entryID".into(), id.into()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RpcStatus::not_found(format!("entry {} not found", id)))
    }

    async fn update_entry(&self, entry: &WireEntry) -> Result<i64, RpcStatus> {
        let current = self.get_entry(&entry.id).await?;
        if current.revision_number != entry.revision_number {
            return Err(RpcStatus::new(
                Code::FailedPrecondition,
                format!("revision mismatch for {}: current {}, supplied {}", entry.id, current.revision_number, entry.revision_number),
            ));
        }
        let mut args = vec!["-entryID".to_string(), entry.id.clone()];
        args.extend(entry_args(entry));
        let res = self.run_batch("update", args).await?;
        Ok(res.entry.map_or(current.revision_number + 1, |e| e.revision_number))
    }

    async fn delete_entry(&self, id: &str) -> Result<(), RpcStatus> {
        self.run_batch("delete", vec!["-entryID".into(), id.into()]).await.map(|_| ())
    }

    async fn list_entries(&self, filter: &ListFilter) -> Result<Vec<WireEntry>, RpcStatus> {
        let mut args = Vec::new();
        if let Some(p) = &filter.parent_id {
            args.push("-parentID".to_string());
            args.push(p.clone());
        }
        if let Some(s) = &filter.spiffe_id {
            args.push("-spiffeID".to_string());
            args.push(s.clone());
        }
        self.run_show(args).await
    }

    fn name(&self) -> &'static str { "kube-exec" }
}

/// Flags describing an entry for `entry create` / `entry update`. Zero TTL
/// and expiry are omitted so the server keeps its defaults.
fn entry_args(e: &WireEntry) -> Vec<String> {
    let mut args = vec!["-spiffeID".to_string(), e.spiffe_id.clone(), "-parentID".to_string(), e.parent_id.clone()];
    for s in &e.selectors {
        args.push("-selector".into());
        args.push(format!("{}:{}", s.kind, s.value));
    }
    if e.ttl > 0 {
        args.push("-x509SVIDTTL".into());
        args.push(e.ttl.to_string());
    }
    for td in &e.federates_with {
        args.push("-federatesWith".into());
        args.push(td.clone());
    }
    if e.admin {
        args.push("-admin".into());
    }
    if e.downstream {
        args.push("-downstream".into());
    }
    if e.entry_expiry > 0 {
        args.push("-entryExpiry".into());
        args.push(e.entry_expiry.to_string());
    }
    for d in &e.dns_names {
        args.push("-dns".into());
        args.push(d.clone());
    }
    // The CLI rewrites the whole entry, so fields set outside this tool
    // are passed back or the server resets them.
    if let Some(hint) = extension(e, &["hint"]).and_then(|v| v.as_str()).filter(|h| !h.is_empty()) {
        args.push("-hint".into());
        args.push(hint.to_string());
    }
    if let Some(ttl) = extension(e, &["jwt_svid_ttl", "jwtSvidTtl"]).and_then(json_i64).filter(|t| *t > 0) {
        args.push("-jwtSVIDTTL".into());
        args.push(ttl.to_string());
    }
    if extension(e, &["store_svid", "storeSvid"]).and_then(|v| v.as_bool()).unwrap_or(false) {
        args.push("-storeSVID".into());
    }
    args
}

fn extension<'a>(e: &'a WireEntry, names: &[&str]) -> Option<&'a serde_json::Value> {
    names.iter().find_map(|n| e.extra.get(*n))
}

/// protojson renders int64 as a string.
fn json_i64(v: &serde_json::Value) -> Option<i64> {
    v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

// ---- SPIRE CLI JSON (protojson: int64 may arrive as strings) ----

fn int_or_string<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Str(String),
    }
    match Raw::deserialize(d)? {
        Raw::Int(n) => Ok(n),
        Raw::Str(s) if s.is_empty() => Ok(0),
        Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Deserialize)]
struct SpireId {
    #[serde(alias = "trustDomain")]
    trust_domain: String,
    #[serde(default)]
    path: String,
}

impl SpireId {
    fn canonical(&self) -> String { format!("spiffe://{}{}", self.trust_domain, self.path) }
}

#[derive(Debug, Deserialize)]
struct SpireSelector {
    #[serde(rename = "type")]
    kind: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct SpireEntry {
    #[serde(default)]
    id: String,
    #[serde(alias = "spiffeId")]
    spiffe_id: SpireId,
    #[serde(alias = "parentId")]
    parent_id: SpireId,
    #[serde(default)]
    selectors: Vec<SpireSelector>,
    #[serde(default, alias = "x509SvidTtl", deserialize_with = "int_or_string")]
    x509_svid_ttl: i64,
    #[serde(default, alias = "federatesWith")]
    federates_with: Vec<String>,
    #[serde(default)]
    admin: bool,
    #[serde(default)]
    downstream: bool,
    #[serde(default, alias = "expiresAt", deserialize_with = "int_or_string")]
    expires_at: i64,
    #[serde(default, alias = "dnsNames")]
    dns_names: Vec<String>,
    #[serde(default, alias = "revisionNumber", deserialize_with = "int_or_string")]
    revision_number: i64,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_json::Value>,
}

impl SpireEntry {
    fn into_wire(self) -> Result<WireEntry, RpcStatus> {
        let ttl = i32::try_from(self.x509_svid_ttl)
            .map_err(|_| RpcStatus::new(Code::Unknown, format!("x509_svid_ttl out of range: {}", self.x509_svid_ttl)))?;
        Ok(WireEntry {
            id: self.id,
            spiffe_id: self.spiffe_id.canonical(),
            parent_id: self.parent_id.canonical(),
            selectors: self.selectors.into_iter().map(|s| WireSelector { kind: s.kind, value: s.value }).collect(),
            ttl,
            federates_with: self
                .federates_with
                .into_iter()
                .map(|td| if td.starts_with("spiffe://") { td } else { format!("spiffe://{}", td) })
                .collect(),
            admin: self.admin,
            downstream: self.downstream,
            entry_expiry: self.expires_at,
            dns_names: self.dns_names,
            revision_number: self.revision_number,
            extra: self.extra,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct SpireStatus {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct RawBatchResult {
    #[serde(default)]
    status: Option<SpireStatus>,
    #[serde(default)]
    entry: Option<SpireEntry>,
}

#[derive(Debug, Deserialize)]
struct RawBatch {
    #[serde(default)]
    results: Vec<RawBatchResult>,
}

#[derive(Debug)]
struct BatchResult {
    entry: Option<WireEntry>,
}

fn parse_batch(stdout: &[u8]) -> Result<BatchResult, RpcStatus> {
    let raw: RawBatch = serde_json::from_slice(stdout)
        .map_err(|e| RpcStatus::new(Code::Unknown, format!("unreadable spire-server output: {}", e)))?;
    let first = raw
        .results
        .into_iter()
        .next()
        .ok_or_else(|| RpcStatus::new(Code::Unknown, "spire-server returned no results"))?;
    let status = first.status.unwrap_or_default();
    if status.code != 0 {
        return Err(RpcStatus::new(Code::from_i32(status.code), status.message));
    }
    Ok(BatchResult { entry: first.entry.map(SpireEntry::into_wire).transpose()? })
}

fn parse_entries(stdout: &[u8]) -> Result<Vec<WireEntry>, RpcStatus> {
    let unreadable = |e: serde_json::Error| RpcStatus::new(Code::Unknown, format!("unreadable spire-server output: {}", e));
    let v: serde_json::Value = serde_json::from_slice(stdout).map_err(unreadable)?;
    let raw: Vec<SpireEntry> = match v.get("entries") {
        Some(list) => serde_json::from_value(list.clone()).map_err(unreadable)?,
        None if v.get("spiffe_id").is_some() || v.get("spiffeId").is_some() => {
            vec![serde_json::from_value(v).map_err(unreadable)?]
        }
        None => Vec::new(),
    };
    raw.into_iter().map(SpireEntry::into_wire).collect()
}

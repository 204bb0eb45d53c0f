//! Wire-level command argument validation and decoding.
//!
//! Commands arrive as a flat key/value map; this parser turns them into a
//! typed struct, enforcing size limits and rejecting malformed values. It
//! deliberately has two side effects: missing `ip`/`sid`/`ncbi_phid`
//! values are generated from the ambient request context and written back
//! into the map, and the resolved session/hit ids are pushed into that
//! context so downstream logging sees them without holding the struct.

use std::collections::BTreeMap;
use std::net::IpAddr;

use chrono::Duration;
use uuid::Uuid;

use crate::config::FieldLimits;
use crate::error::{QueueError, Result};
use crate::job::JobStatus;
use crate::protocol::job_key::decode_job_key;

const TRUNCATION_MARKER: &str = " [truncated]";

/// Ambient per-request state: who is calling and the request-tracing ids
/// resolved while parsing.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub peer_addr: Option<IpAddr>,
    /// Generate missing session/hit ids instead of leaving them empty.
    pub generate_ids: bool,
    pub session_id: Option<String>,
    pub hit_id: Option<String>,
}

impl RequestContext {
    pub fn new(peer_addr: Option<IpAddr>, generate_ids: bool) -> Self {
        Self {
            peer_addr,
            generate_ids,
            session_id: None,
            hit_id: None,
        }
    }
}

/// Typed form of the recognized wire parameters.
#[derive(Debug, Clone)]
pub struct CommandArguments {
    pub job_id: u32,
    pub auth_token: String,
    pub input: String,
    pub output: String,
    pub affinities: Vec<String>,
    pub add_affinities: Vec<String>,
    pub del_affinities: Vec<String>,
    pub groups: Vec<String>,
    pub status: Option<JobStatus>,
    pub port: u16,
    pub timeout: Duration,
    pub mask: u32,
    pub ip: String,
    pub sid: String,
    pub ncbi_phid: String,
    pub comment: String,
    pub description: String,
    pub progress_msg: String,
    pub job_return_code: i32,
    pub err_msg: String,
    pub qname: String,
    pub qclass: String,
    pub count: u32,
    pub start_after_job_id: u32,
    pub version: String,
    pub any_aff: bool,
    pub wnode_aff: bool,
    pub reader_aff: bool,
    pub exclusive_new_aff: bool,
    pub blacklist: bool,
    pub drain: bool,
    pub effective: bool,
    pub pullback: bool,
    pub no_retries: bool,
    pub need_progress_msg: bool,
    pub need_stolen: bool,
}

impl Default for CommandArguments {
    fn default() -> Self {
        Self {
            job_id: 0,
            auth_token: String::new(),
            input: String::new(),
            output: String::new(),
            affinities: Vec::new(),
            add_affinities: Vec::new(),
            del_affinities: Vec::new(),
            groups: Vec::new(),
            status: None,
            port: 0,
            timeout: Duration::zero(),
            mask: 0,
            ip: String::new(),
            sid: String::new(),
            ncbi_phid: String::new(),
            comment: String::new(),
            description: String::new(),
            progress_msg: String::new(),
            job_return_code: 0,
            err_msg: String::new(),
            qname: String::new(),
            qclass: String::new(),
            count: 0,
            start_after_job_id: 0,
            version: String::new(),
            any_aff: false,
            wnode_aff: false,
            reader_aff: false,
            exclusive_new_aff: false,
            blacklist: false,
            drain: false,
            effective: false,
            pullback: false,
            no_retries: false,
            need_progress_msg: false,
            need_stolen: false,
        }
    }
}

fn parse_or_zero<T: std::str::FromStr + Default>(value: &str) -> T {
    value.parse().unwrap_or_default()
}

fn parse_bool(field: &'static str, value: &str) -> Result<bool> {
    match value {
        "0" => Ok(false),
        "1" => Ok(true),
        other => Err(QueueError::InvalidParameter {
            field,
            message: format!("expected 0 or 1, got '{}'", other),
        }),
    }
}

fn check_size(field: &'static str, value: &str, limit: usize) -> Result<()> {
    if value.len() > limit {
        return Err(QueueError::DataTooLong {
            field,
            actual: value.len(),
            limit,
        });
    }
    Ok(())
}

/// Split a comma/tab-delimited list and validate each element against the
/// per-token size limit.
fn parse_token_list(field: &'static str, value: &str, limit: usize) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    for token in value.split([',', '\t']) {
        if token.is_empty() {
            continue;
        }
        check_size(field, token, limit)?;
        tokens.push(token.to_string());
    }
    Ok(tokens)
}

fn truncate_at_char_boundary(value: &str, mut at: usize) -> &str {
    while at > 0 && !value.is_char_boundary(at) {
        at -= 1;
    }
    &value[..at]
}

impl CommandArguments {
    /// Validate and decode the recognized keys of `params`.
    ///
    /// Auto-generated `ip` is written back into `params` so later logging
    /// of the raw parameters shows the resolved value.
    pub fn parse(
        params: &mut BTreeMap<String, String>,
        limits: &FieldLimits,
        ctx: &mut RequestContext,
    ) -> Result<Self> {
        let mut args = CommandArguments::default();

        if let Some(value) = params.get("job_key") {
            match decode_job_key(value) {
                Some(id) if id != 0 => args.job_id = id,
                _ => {
                    return Err(QueueError::InvalidParameter {
                        field: "job_key",
                        message: format!("cannot decode job key '{}'", value),
                    });
                }
            }
        }
        if let Some(value) = params.get("auth_token") {
            args.auth_token = value.clone();
        }

        if let Some(value) = params.get("input") {
            check_size("input", value, limits.input)?;
            args.input = value.clone();
        }
        if let Some(value) = params.get("output") {
            check_size("output", value, limits.output)?;
            args.output = value.clone();
        }
        if let Some(value) = params.get("description") {
            check_size("description", value, limits.description)?;
            args.description = value.clone();
        }
        if let Some(value) = params.get("progress_msg") {
            check_size("progress_msg", value, limits.progress_msg)?;
            args.progress_msg = value.clone();
        }
        if let Some(value) = params.get("comment") {
            args.comment = value.clone();
        }

        if let Some(value) = params.get("err_msg") {
            if value.len() > limits.err_msg {
                tracing::warn!(
                    actual = value.len(),
                    limit = limits.err_msg,
                    "err_msg over the limit, truncating"
                );
                let keep = limits.err_msg.saturating_sub(TRUNCATION_MARKER.len());
                let mut truncated = truncate_at_char_boundary(value, keep).to_string();
                truncated.push_str(TRUNCATION_MARKER);
                args.err_msg = truncated;
            } else {
                args.err_msg = value.clone();
            }
        }

        if let Some(value) = params.get("aff") {
            args.affinities = parse_token_list("aff", value, limits.token)?;
        }
        if let Some(value) = params.get("add") {
            args.add_affinities = parse_token_list("add", value, limits.token)?;
        }
        if let Some(value) = params.get("del") {
            args.del_affinities = parse_token_list("del", value, limits.token)?;
        }
        if let Some(value) = params.get("group") {
            args.groups = parse_token_list("group", value, limits.token)?;
        }

        if let Some(value) = params.get("status") {
            args.status = Some(value.parse::<JobStatus>()?);
        }

        if let Some(value) = params.get("port") {
            let port: u32 = parse_or_zero(value);
            if port > u16::MAX as u32 {
                return Err(QueueError::InvalidParameter {
                    field: "port",
                    message: format!("port {} is out of range", port),
                });
            }
            args.port = port as u16;
        }
        if let Some(value) = params.get("timeout") {
            args.timeout = Duration::seconds(parse_or_zero(value));
        }
        if let Some(value) = params.get("msk") {
            args.mask = parse_or_zero(value);
        }
        if let Some(value) = params.get("job_return_code") {
            args.job_return_code = parse_or_zero(value);
        }
        if let Some(value) = params.get("count") {
            args.count = parse_or_zero(value);
        }
        if let Some(value) = params.get("start_after") {
            args.start_after_job_id = decode_job_key(value).unwrap_or(0);
        }
        if let Some(value) = params.get("qname") {
            args.qname = value.clone();
        }
        if let Some(value) = params.get("qclass") {
            args.qclass = value.clone();
        }
        if let Some(value) = params.get("version") {
            args.version = value.clone();
        }

        if let Some(value) = params.get("any_aff") {
            args.any_aff = parse_bool("any_aff", value)?;
        }
        if let Some(value) = params.get("wnode_aff") {
            args.wnode_aff = parse_bool("wnode_aff", value)?;
        }
        if let Some(value) = params.get("reader_aff") {
            args.reader_aff = parse_bool("reader_aff", value)?;
        }
        if let Some(value) = params.get("exclusive_new_aff") {
            args.exclusive_new_aff = parse_bool("exclusive_new_aff", value)?;
        }
        if let Some(value) = params.get("blacklist") {
            args.blacklist = parse_bool("blacklist", value)?;
        }
        if let Some(value) = params.get("drain") {
            args.drain = parse_bool("drain", value)?;
        }
        if let Some(value) = params.get("effective") {
            args.effective = parse_bool("effective", value)?;
        }
        if let Some(value) = params.get("pullback") {
            args.pullback = parse_bool("pullback", value)?;
        }
        if let Some(value) = params.get("no_retries") {
            args.no_retries = parse_bool("no_retries", value)?;
        }
        if let Some(value) = params.get("need_progress_msg") {
            args.need_progress_msg = parse_bool("need_progress_msg", value)?;
        }
        if let Some(value) = params.get("need_stolen") {
            args.need_stolen = parse_bool("need_stolen", value)?;
        }

        args.resolve_client_info(params, limits, ctx)?;
        Ok(args)
    }

    /// First group token, or empty for "no group".
    pub fn group(&self) -> &str {
        self.groups.first().map(String::as_str).unwrap_or("")
    }

    /// First affinity token, or empty for "no affinity".
    pub fn affinity(&self) -> &str {
        self.affinities.first().map(String::as_str).unwrap_or("")
    }

    fn resolve_client_info(
        &mut self,
        params: &mut BTreeMap<String, String>,
        limits: &FieldLimits,
        ctx: &mut RequestContext,
    ) -> Result<()> {
        let supplied = params.get("ip").filter(|v| !v.is_empty()).cloned();
        match supplied {
            Some(value) => {
                check_size("ip", &value, limits.client_info)?;
                self.ip = value;
            }
            None => {
                if ctx.generate_ids {
                    if let Some(peer) = ctx.peer_addr {
                        self.ip = peer.to_string();
                        params.insert("ip".to_string(), self.ip.clone());
                    }
                }
            }
        }

        let supplied = params.get("sid").filter(|v| !v.is_empty()).cloned();
        match supplied {
            Some(value) => {
                check_size("sid", &value, limits.client_info)?;
                self.sid = value;
            }
            None => {
                if ctx.generate_ids {
                    self.sid = Uuid::new_v4().to_string();
                    params.insert("sid".to_string(), self.sid.clone());
                }
            }
        }
        if !self.sid.is_empty() {
            ctx.session_id = Some(self.sid.clone());
        }

        let supplied = params.get("ncbi_phid").filter(|v| !v.is_empty()).cloned();
        match supplied {
            Some(value) => {
                check_size("ncbi_phid", &value, limits.client_info)?;
                self.ncbi_phid = value;
            }
            None => {
                if ctx.generate_ids {
                    self.ncbi_phid = Uuid::new_v4().simple().to_string();
                    params.insert("ncbi_phid".to_string(), self.ncbi_phid.clone());
                }
            }
        }
        if !self.ncbi_phid.is_empty() {
            ctx.hit_id = Some(self.ncbi_phid.clone());
        }

        Ok(())
    }
}

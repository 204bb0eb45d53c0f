use std::fmt::Write;

use bitflags::bitflags;
use chrono::{DateTime, Duration, Utc};

use crate::config::QueueTimeouts;
use crate::job::Job;
use crate::protocol::job_key::make_job_key;
use crate::registry::{AffinityRegistry, GroupRegistry};

bitflags! {
    /// Independently toggleable field groups for `Job::print`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct JobFields: u32 {
        const ID                       = 1 << 0;
        const KEY                      = 1 << 1;
        const STATUS                   = 1 << 2;
        const LAST_TOUCH               = 1 << 3;
        const EXPIRATION               = 1 << 4;
        const TIMEOUT                  = 1 << 5;
        const RUN_TIMEOUT              = 1 << 6;
        const READ_TIMEOUT             = 1 << 7;
        const SUBM_NOTIF_PORT          = 1 << 8;
        const SUBM_NOTIF_TIMEOUT       = 1 << 9;
        const LISTENER_NOTIF           = 1 << 10;
        const EVENTS                   = 1 << 11;
        const RUN_COUNT                = 1 << 12;
        const READ_COUNT               = 1 << 13;
        const AFFINITY                 = 1 << 14;
        const GROUP                    = 1 << 15;
        const MASK                     = 1 << 16;
        const INPUT                    = 1 << 17;
        const OUTPUT                   = 1 << 18;
        const PROGRESS_MSG             = 1 << 19;
        const CLIENT_IP                = 1 << 20;
        const CLIENT_SID               = 1 << 21;
        const NCBI_PHID                = 1 << 22;
        const NEED_SUBM_PROGRESS_NOTIF = 1 << 23;
        const NEED_LSNR_PROGRESS_NOTIF = 1 << 24;
        const NEED_STOLEN_NOTIF        = 1 << 25;
    }
}

/// Everything a job rendering needs from its surroundings: the queue
/// identity for composite keys, the queue defaults for the expiration
/// line, and the registries for turning ids back into tokens.
pub struct PrintContext<'a> {
    pub queue_name: &'a str,
    pub host: &'a str,
    pub port: u16,
    pub timeouts: &'a QueueTimeouts,
    pub groups: &'a GroupRegistry,
    pub affinities: &'a AffinityRegistry,
}

const NOT_AVAILABLE: &str = "n/a";

/// Escape a string so it stays on one line and survives line-based tools:
/// control characters, quotes and backslashes become escape sequences.
pub fn escape_printable(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let code = c as u32;
                if code < 256 {
                    let _ = write!(out, "\\x{:02X}", code);
                } else {
                    let _ = write!(out, "\\u{{{:04X}}}", code);
                }
            }
            c => out.push(c),
        }
    }
    out
}

fn line(out: &mut String, field: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "OK:{}: {}", field, value);
}

fn string_line(out: &mut String, field: &str, value: &str) {
    if value.is_empty() {
        line(out, field, NOT_AVAILABLE);
    } else {
        line(out, field, format_args!("'{}'", escape_printable(value)));
    }
}

fn timeout_line(out: &mut String, field: &str, value: Duration) {
    if value.is_zero() {
        line(out, field, NOT_AVAILABLE);
    } else {
        line(out, field, format_args!("{}s", value.num_seconds()));
    }
}

fn instant(value: Option<DateTime<Utc>>) -> String {
    match value {
        Some(t) => t.to_rfc3339(),
        None => NOT_AVAILABLE.to_string(),
    }
}

impl Job {
    /// Render exactly the requested field groups, one `OK:<field>: <value>`
    /// line each. Absent values print as a literal `n/a` so downstream
    /// line parsers always see the same schema; each group is rendered by
    /// its own routine.
    pub fn print(&self, fields: JobFields, ctx: &PrintContext<'_>) -> String {
        let mut out = String::new();
        if fields.contains(JobFields::ID) {
            self.print_id(&mut out);
        }
        if fields.contains(JobFields::KEY) {
            self.print_key(&mut out, ctx);
        }
        if fields.contains(JobFields::STATUS) {
            self.print_status(&mut out);
        }
        if fields.contains(JobFields::LAST_TOUCH) {
            line(&mut out, "last_touch", self.last_touch.to_rfc3339());
        }
        if fields.contains(JobFields::EXPIRATION) {
            self.print_expiration(&mut out, ctx);
        }
        if fields.contains(JobFields::TIMEOUT) {
            timeout_line(&mut out, "timeout", self.timeouts.timeout);
        }
        if fields.contains(JobFields::RUN_TIMEOUT) {
            timeout_line(&mut out, "run_timeout", self.timeouts.run_timeout);
        }
        if fields.contains(JobFields::READ_TIMEOUT) {
            timeout_line(&mut out, "read_timeout", self.timeouts.read_timeout);
        }
        if fields.contains(JobFields::SUBM_NOTIF_PORT) {
            self.print_subm_notif_port(&mut out);
        }
        if fields.contains(JobFields::SUBM_NOTIF_TIMEOUT) {
            timeout_line(&mut out, "subm_notif_timeout", self.subm_notif_timeout);
        }
        if fields.contains(JobFields::LISTENER_NOTIF) {
            self.print_listener_notif(&mut out);
        }
        if fields.contains(JobFields::EVENTS) {
            self.print_events(&mut out);
        }
        if fields.contains(JobFields::RUN_COUNT) {
            line(&mut out, "run_counter", self.run_count);
        }
        if fields.contains(JobFields::READ_COUNT) {
            line(&mut out, "read_counter", self.read_count);
        }
        if fields.contains(JobFields::AFFINITY) {
            self.print_affinity(&mut out, ctx);
        }
        if fields.contains(JobFields::GROUP) {
            self.print_group(&mut out, ctx);
        }
        if fields.contains(JobFields::MASK) {
            line(&mut out, "mask", self.mask);
        }
        if fields.contains(JobFields::INPUT) {
            string_line(&mut out, "input", &self.input);
        }
        if fields.contains(JobFields::OUTPUT) {
            string_line(&mut out, "output", &self.output);
        }
        if fields.contains(JobFields::PROGRESS_MSG) {
            string_line(&mut out, "progress_msg", &self.progress_msg);
        }
        if fields.contains(JobFields::CLIENT_IP) {
            string_line(&mut out, "remote_client_ip", &self.client_ip);
        }
        if fields.contains(JobFields::CLIENT_SID) {
            string_line(&mut out, "remote_client_sid", &self.client_sid);
        }
        if fields.contains(JobFields::NCBI_PHID) {
            string_line(&mut out, "ncbi_phid", &self.ncbi_phid);
        }
        if fields.contains(JobFields::NEED_SUBM_PROGRESS_NOTIF) {
            line(
                &mut out,
                "need_subm_progress_msg_notif",
                self.need_subm_progress_msg_notif,
            );
        }
        if fields.contains(JobFields::NEED_LSNR_PROGRESS_NOTIF) {
            line(
                &mut out,
                "need_lsnr_progress_msg_notif",
                self.need_lsnr_progress_msg_notif,
            );
        }
        if fields.contains(JobFields::NEED_STOLEN_NOTIF) {
            line(&mut out, "need_stolen_notif", self.need_stolen_notif);
        }
        out
    }

    fn print_id(&self, out: &mut String) {
        line(out, "id", self.id);
    }

    fn print_key(&self, out: &mut String, ctx: &PrintContext<'_>) {
        line(out, "key", make_job_key(self.id, ctx.host, ctx.port));
    }

    fn print_status(&self, out: &mut String) {
        line(out, "status", self.status);
    }

    fn print_expiration(&self, out: &mut String, ctx: &PrintContext<'_>) {
        line(out, "expiration", self.expiration(ctx.timeouts).to_rfc3339());
    }

    fn print_subm_notif_port(&self, out: &mut String) {
        if self.subm_notif_port == 0 {
            line(out, "subm_notif_port", NOT_AVAILABLE);
        } else {
            line(out, "subm_notif_port", self.subm_notif_port);
        }
    }

    fn print_listener_notif(&self, out: &mut String) {
        if self.listener_notif_addr == 0 || self.listener_notif_port == 0 {
            line(out, "listener_notif", NOT_AVAILABLE);
        } else {
            let addr = std::net::Ipv4Addr::from(self.listener_notif_addr);
            line(
                out,
                "listener_notif",
                format_args!("{}:{}", addr, self.listener_notif_port),
            );
        }
        line(
            out,
            "listener_notif_expiration",
            instant(self.listener_notif_abstime),
        );
    }

    fn print_events(&self, out: &mut String) {
        if self.events().is_empty() {
            line(out, "events", NOT_AVAILABLE);
            return;
        }
        for (index, event) in self.events().iter().enumerate() {
            let _ = writeln!(
                out,
                "OK:event{}: kind={} status={} timestamp={} node_addr={} ret_code={} \
                 client_node='{}' client_session='{}' err_msg='{}'",
                index + 1,
                event.kind,
                event.status,
                instant(event.timestamp),
                event.node_addr,
                event.ret_code,
                escape_printable(&event.client_node),
                escape_printable(&event.client_session),
                escape_printable(&event.err_msg),
            );
        }
    }

    fn print_affinity(&self, out: &mut String, ctx: &PrintContext<'_>) {
        if self.affinity_id == 0 {
            line(out, "affinity", NOT_AVAILABLE);
            return;
        }
        match ctx.affinities.token(self.affinity_id) {
            Ok(token) => line(
                out,
                "affinity",
                format_args!("'{}'", escape_printable(&token)),
            ),
            Err(_) => line(out, "affinity", NOT_AVAILABLE),
        }
    }

    fn print_group(&self, out: &mut String, ctx: &PrintContext<'_>) {
        if self.group_id == 0 {
            line(out, "group", NOT_AVAILABLE);
            return;
        }
        match ctx.groups.token(self.group_id) {
            Ok(token) => line(out, "group", format_args!("'{}'", escape_printable(&token))),
            Err(_) => line(out, "group", NOT_AVAILABLE),
        }
    }
}

//! Call identity and admission key derivation.
//!
//! A [`CallIdentity`] describes one guarded call: which operation, who made
//! it, from where, and with what arguments. The [`KeyBuilder`] turns it into
//! deterministic store keys for rate limits and duplicate-submission locks.

mod builder;
mod client_ip;

pub use builder::KeyBuilder;
pub use client_ip::{resolve_client_ip, IP_HEADERS, UNKNOWN_IP};

use serde_json::Value;
use std::fmt;
use std::net::IpAddr;

/// Principal used in keys when a call carries no identity.
pub const ANONYMOUS: &str = "anonymous";

/// Transport-level facts about the caller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientInfo {
    /// Request headers in arrival order
    pub headers: Vec<(String, String)>,
    /// Address of the directly connected peer
    pub peer: Option<IpAddr>,
}

impl ClientInfo {
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_peer(mut self, peer: IpAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    /// First value of header `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Identity of a single guarded call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallIdentity {
    /// Name of the declaring type or service, e.g. `OrderController`
    pub declaring: String,
    pub method: String,
    /// Authenticated caller, if any
    pub principal: Option<String>,
    pub client: ClientInfo,
    /// Named arguments in declaration order
    pub args: Vec<(String, Value)>,
}

impl CallIdentity {
    pub fn new(declaring: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            declaring: declaring.into(),
            method: method.into(),
            principal: None,
            client: ClientInfo::default(),
            args: Vec::new(),
        }
    }

    /// Parse `Declaring.method`. The split happens at the last dot.
    pub fn from_operation(operation: &str) -> Option<Self> {
        let (declaring, method) = operation.rsplit_once('.')?;
        if declaring.is_empty() || method.is_empty() {
            return None;
        }
        Some(Self::new(declaring, method))
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    pub fn with_client(mut self, client: ClientInfo) -> Self {
        self.client = client;
        self
    }

    pub fn with_arg(mut self, name: impl Into<String>, value: Value) -> Self {
        self.args.push((name.into(), value));
        self
    }

    /// The operation name policies are registered under.
    pub fn operation(&self) -> String {
        format!("{}.{}", self.declaring, self.method)
    }

    /// The principal, or [`ANONYMOUS`] when absent or blank.
    pub fn principal_or_anonymous(&self) -> &str {
        match self.principal.as_deref().map(str::trim) {
            Some(p) if !p.is_empty() => p,
            _ => ANONYMOUS,
        }
    }

    pub fn arg(&self, name: &str) -> Option<&Value> {
        self.args.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

impl fmt::Display for CallIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.declaring, self.method)
    }
}

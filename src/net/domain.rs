// Babbling Brook splits a single site into several trust domains, each served
// from its own subdomain of the site's host. The client never shares an
// execution context with the others: the domus holds the user's private data,
// scientia and filter run untrusted rhythms, and suggestion, kindred and ring
// compute over the social graph. Messages may only flow between these
// subdomains of the one configured host; anything else is a foreign sender.

use std::fmt;

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};
use url::Url;

use super::error::Error;

/// One of the protocol's trust domains.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainKind {
    Client,
    /// The user's personal data store.
    Domus,
    Scientia,
    Filter,
    Suggestion,
    Kindred,
    Ring,
}

impl DomainKind {
    pub const ALL: [DomainKind; 7] = [
        DomainKind::Client,
        DomainKind::Domus,
        DomainKind::Scientia,
        DomainKind::Filter,
        DomainKind::Suggestion,
        DomainKind::Kindred,
        DomainKind::Ring,
    ];

    /// The subdomain label this domain is served from.
    pub fn label(&self) -> &'static str {
        match self {
            DomainKind::Client => "client",
            DomainKind::Domus => "domus",
            DomainKind::Scientia => "scientia",
            DomainKind::Filter => "filter",
            DomainKind::Suggestion => "suggestion",
            DomainKind::Kindred => "kindred",
            DomainKind::Ring => "ring",
        }
    }

    fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.label() == label)
    }
}

/// A concrete domain: a trust domain kind served under a host.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Domain {
    kind: DomainKind,
    host: String,
}

impl Domain {
    pub fn new(kind: DomainKind, host: impl Into<String>) -> Self {
        Self {
            kind,
            host: host.into().to_ascii_lowercase(),
        }
    }

    /// Parses a URL such as `https://domus.example.com/path`. Returns `None`
    /// if it has no host or the first label isn't a known trust domain. The
    /// scheme and port are not checked here; see [`DomainAllowList::resolve`].
    pub fn parse(origin: &str) -> Option<Self> {
        let url = Url::parse(origin).ok()?;
        Self::from_url(&url)
    }

    fn from_url(url: &Url) -> Option<Self> {
        let hostname = url.host_str()?;
        let (label, host) = hostname.split_once('.')?;
        if host.is_empty() {
            return None;
        }
        let kind = DomainKind::from_label(&label.to_ascii_lowercase())?;
        Some(Self::new(kind, host))
    }

    pub fn kind(&self) -> DomainKind {
        self.kind
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns true if this is the user's data store. Requests landing here
    /// take an extra hop and get a longer timeout budget.
    pub fn is_data_store(&self) -> bool {
        self.kind == DomainKind::Domus
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind.label(), self.host)
    }
}

/// The set of domains the bridge will talk to.
///
/// Inbound origins must match exactly: the configured scheme, a permitted
/// subdomain of the host, the configured port and nothing else.
#[derive(Clone, Debug)]
pub struct DomainAllowList {
    host: String,
    kinds: HashSet<DomainKind>,
    scheme: String,
    /// `None` is the scheme's default port.
    port: Option<u16>,
}

impl DomainAllowList {
    /// Allows every protocol subdomain of `host` over https.
    pub fn for_host(host: impl Into<String>) -> Self {
        Self::with_kinds(host, DomainKind::ALL)
    }

    /// Allows only the given subdomains of `host` over https.
    pub fn with_kinds(
        host: impl Into<String>,
        kinds: impl IntoIterator<Item = DomainKind>,
    ) -> Self {
        Self {
            host: host.into().to_ascii_lowercase(),
            kinds: kinds.into_iter().collect(),
            scheme: "https".to_string(),
            port: None,
        }
    }

    /// Expects origins on `scheme` instead of https.
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into().to_ascii_lowercase();
        self
    }

    /// Expects origins on a non-default port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns true if the domain is a permitted subdomain of our host.
    pub fn allows(&self, domain: &Domain) -> bool {
        domain.host == self.host && self.kinds.contains(&domain.kind)
    }

    /// The origin string `domain` presents when it posts to us.
    pub fn origin_of(&self, domain: &Domain) -> String {
        match self.port {
            Some(port) => format!("{}://{domain}:{port}", self.scheme),
            None => format!("{}://{domain}", self.scheme),
        }
    }

    /// Parses and validates a raw origin string from an inbound frame.
    pub fn resolve(&self, origin: &str) -> Result<Domain, Error> {
        let rejected = || Error::DomainRejected(origin.to_string());
        let url = Url::parse(origin).map_err(|_| rejected())?;
        if url.scheme() != self.scheme || url.port() != self.port {
            return Err(rejected());
        }
        // an origin is scheme, host and port; paths, credentials and stray
        // separators don't belong in one
        let serialized = url.origin().ascii_serialization();
        if !serialized.eq_ignore_ascii_case(origin.strip_suffix('/').unwrap_or(origin)) {
            return Err(rejected());
        }
        match Domain::from_url(&url) {
            Some(domain) if self.allows(&domain) => Ok(domain),
            _ => Err(rejected()),
        }
    }
}

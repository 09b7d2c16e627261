//! Handshake-time certificate resolution
//!
//! A [`CertificateResolver`] maps the server name a client asks for to the
//! certificate to present. Each binding owns a certificate source and caches
//! what the source produced until it goes stale:
//!
//! - static files are reloaded when their modification time changes,
//! - self-signed leaves are reissued when they come within the renewal margin
//!   of expiry (or when file-backed CA material changes),
//! - externally issued certificates are refetched at the issuer's `refresh_at`.
//!
//! Reissuance swaps the cached `Arc` atomically. Handshakes that arrive while a
//! reissue is in flight keep getting the previous certificate as long as it has
//! not expired.

use async_trait::async_trait;
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

use crate::ca::{CertificateAuthority, IssueError, Subject};
use crate::self_signed::{issue_leaf, LeafCertificate};
use crate::Certificate;

/// Reissue self-signed leaves this long before they expire
pub const DEFAULT_RENEWAL_MARGIN: Duration = Duration::days(30);

/// Upper bound for one issuance, and for waiting on someone else's
pub const DEFAULT_ISSUE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Certificate resolution errors
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("No certificate available: {0}")]
    NoCertificateAvailable(String),

    #[error("Certificate unavailable: {0}")]
    CertificateUnavailable(String),

    #[error("Host {0} is bound to more than one certificate source")]
    AmbiguousHostConfiguration(String),

    #[error("Certificate issuance failed: {0}")]
    Issue(#[from] IssueError),

    #[error("External issuer failed: {0}")]
    Issuer(String),

    #[error("TLS key error: {0}")]
    Tls(#[from] rustls::Error),
}

/// Certificate produced by an external issuer
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub certified_key: Arc<CertifiedKey>,
    pub not_after: OffsetDateTime,
    /// Ask the issuer again once this instant has passed
    pub refresh_at: OffsetDateTime,
}

/// External certificate issuer (ACME or anything else)
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn get_certificate(&self, server_name: &str) -> Result<IssuedCertificate, ResolveError>;
}

/// Where the CA of a self-signed binding comes from
#[derive(Debug, Clone)]
pub enum AuthoritySource {
    InMemory(CertificateAuthority),
    /// Reloaded whenever either file changes
    Files { cert_path: PathBuf, key_path: PathBuf },
}

/// Origin of the certificate for a binding
#[derive(Clone)]
pub enum CertificateSource {
    Static {
        cert_path: PathBuf,
        key_path: PathBuf,
    },
    SelfSigned {
        authority: AuthoritySource,
        subject: Subject,
        /// SANs of the issued leaf
        hosts: Vec<String>,
    },
    External(Arc<dyn CertificateIssuer>),
}

impl std::fmt::Debug for CertificateSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Static {
                cert_path,
                key_path,
            } => f
                .debug_struct("Static")
                .field("cert_path", cert_path)
                .field("key_path", key_path)
                .finish(),
            Self::SelfSigned {
                authority, hosts, ..
            } => f
                .debug_struct("SelfSigned")
                .field("authority", authority)
                .field("hosts", hosts)
                .finish(),
            Self::External(_) => f.debug_tuple("External").finish(),
        }
    }
}

/// Modification times of the files a certificate was built from
pub type FileStamp = Vec<SystemTime>;

/// A certificate as cached by the resolver
#[derive(Debug, Clone)]
pub struct CachedCertificate {
    pub certified_key: Arc<CertifiedKey>,
    pub not_after: OffsetDateTime,
    pub refresh_at: Option<OffsetDateTime>,
    pub file_stamp: Option<FileStamp>,
}

impl CachedCertificate {
    /// Wrap a self-signed leaf, e.g. one persisted by a previous run
    pub fn from_leaf(leaf: &LeafCertificate) -> Result<Self, ResolveError> {
        Ok(Self {
            certified_key: leaf.certified_key()?,
            not_after: leaf.not_after,
            refresh_at: None,
            file_stamp: None,
        })
    }

    fn is_valid_at(&self, now: OffsetDateTime) -> bool {
        now < self.not_after
    }
}

#[derive(Default)]
struct Slot {
    current: RwLock<Option<Arc<CachedCertificate>>>,
    issue_lock: tokio::sync::Mutex<()>,
}

impl Slot {
    fn load(&self) -> Option<Arc<CachedCertificate>> {
        self.current.read().ok().and_then(|current| current.clone())
    }

    fn store(&self, cached: Arc<CachedCertificate>) {
        if let Ok(mut current) = self.current.write() {
            *current = Some(cached);
        }
    }
}

struct Binding {
    label: String,
    source: CertificateSource,
    /// One slot per binding, except external sources which cache per server name
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

impl Binding {
    fn new(label: String, source: CertificateSource) -> Self {
        Self {
            label,
            source,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot_key(&self, server_name: &str) -> String {
        match self.source {
            CertificateSource::External(_) => server_name.to_string(),
            _ => String::new(),
        }
    }

    fn slot(&self, server_name: &str) -> Arc<Slot> {
        let key = self.slot_key(server_name);
        match self.slots.lock() {
            Ok(mut slots) => slots.entry(key).or_default().clone(),
            // Poisoned map: hand out an uncached slot
            Err(_) => Arc::new(Slot::default()),
        }
    }

    /// Drop `slot` from the map if it never produced a certificate
    fn discard_if_empty(&self, server_name: &str, slot: &Arc<Slot>) {
        if slot.load().is_some() {
            return;
        }
        let key = self.slot_key(server_name);
        if let Ok(mut slots) = self.slots.lock() {
            if slots.get(&key).is_some_and(|entry| Arc::ptr_eq(entry, slot)) {
                slots.remove(&key);
            }
        }
    }

    fn existing_slot(&self, server_name: &str) -> Option<Arc<Slot>> {
        let key = self.slot_key(server_name);
        self.slots.lock().ok()?.get(&key).cloned()
    }
}

/// Settings shared by every binding
#[derive(Debug, Clone, Copy)]
struct Policy {
    renewal_margin: Duration,
    issue_timeout: std::time::Duration,
}

/// Builder for [`CertificateResolver`]
pub struct ResolverBuilder {
    bindings: Vec<(Vec<String>, CertificateSource)>,
    default: Option<CertificateSource>,
    policy: Policy,
    allow_overlapping_hosts: bool,
}

impl Default for ResolverBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ResolverBuilder {
    pub fn new() -> Self {
        Self {
            bindings: Vec::new(),
            default: None,
            policy: Policy {
                renewal_margin: DEFAULT_RENEWAL_MARGIN,
                issue_timeout: DEFAULT_ISSUE_TIMEOUT,
            },
            allow_overlapping_hosts: false,
        }
    }

    /// Serve `source` for the given hosts
    pub fn bind<I, S>(mut self, hosts: I, source: CertificateSource) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let hosts = hosts.into_iter().map(Into::into).collect();
        self.bindings.push((hosts, source));
        self
    }

    /// Serve `source` when no binding matches (or the client sent no SNI)
    pub fn default_source(mut self, source: CertificateSource) -> Self {
        self.default = Some(source);
        self
    }

    pub fn renewal_margin(mut self, margin: Duration) -> Self {
        self.policy.renewal_margin = margin;
        self
    }

    pub fn issue_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.policy.issue_timeout = timeout;
        self
    }

    /// Keep the first binding for a duplicated host instead of failing
    pub fn allow_overlapping_hosts(mut self, allow: bool) -> Self {
        self.allow_overlapping_hosts = allow;
        self
    }

    pub fn build(self) -> Result<CertificateResolver, ResolveError> {
        let mut bindings = Vec::with_capacity(self.bindings.len());
        let mut by_host = HashMap::new();

        for (hosts, source) in self.bindings {
            let index = bindings.len();
            bindings.push(Arc::new(Binding::new(hosts.join(","), source)));

            for host in hosts {
                let host = normalize_host(&host);
                if let Some(&first) = by_host.get(&host) {
                    if first == index {
                        continue;
                    }
                    if !self.allow_overlapping_hosts {
                        return Err(ResolveError::AmbiguousHostConfiguration(host));
                    }
                    warn!(
                        "Host {} is bound more than once; keeping the first binding",
                        host
                    );
                    continue;
                }
                by_host.insert(host, index);
            }
        }

        let default = self
            .default
            .map(|source| Arc::new(Binding::new("<default>".to_string(), source)));

        Ok(CertificateResolver {
            bindings,
            by_host,
            default,
            policy: self.policy,
        })
    }
}

/// Selects, caches and refreshes the certificate for each handshake
pub struct CertificateResolver {
    bindings: Vec<Arc<Binding>>,
    by_host: HashMap<String, usize>,
    default: Option<Arc<Binding>>,
    policy: Policy,
}

impl CertificateResolver {
    pub fn builder() -> ResolverBuilder {
        ResolverBuilder::new()
    }

    /// Certificate to present for `server_name` (the SNI value, if any)
    pub async fn get_certificate(
        &self,
        server_name: Option<&str>,
    ) -> Result<Arc<CertifiedKey>, ResolveError> {
        let name = server_name.map(normalize_host).unwrap_or_default();
        let binding = self.select(&name).ok_or_else(|| {
            ResolveError::NoCertificateAvailable(format!("no binding for {:?}", server_name))
        })?;

        let cached = self.resolve(&binding, &name).await?;
        Ok(cached.certified_key.clone())
    }

    /// Currently cached certificate for `server_name`, without refreshing it
    pub fn cached(&self, server_name: Option<&str>) -> Option<Arc<CachedCertificate>> {
        let name = server_name.map(normalize_host).unwrap_or_default();
        self.select(&name)?.existing_slot(&name)?.load()
    }

    /// Install a certificate issued elsewhere; it is served until it goes stale
    pub fn preload(
        &self,
        server_name: Option<&str>,
        cached: CachedCertificate,
    ) -> Result<(), ResolveError> {
        let name = server_name.map(normalize_host).unwrap_or_default();
        let binding = self.select(&name).ok_or_else(|| {
            ResolveError::NoCertificateAvailable(format!("no binding for {:?}", server_name))
        })?;
        binding.slot(&name).store(Arc::new(cached));
        Ok(())
    }

    fn select(&self, name: &str) -> Option<Arc<Binding>> {
        self.by_host
            .get(name)
            .map(|&index| self.bindings[index].clone())
            .or_else(|| self.default.clone())
    }

    async fn resolve(
        &self,
        binding: &Binding,
        name: &str,
    ) -> Result<Arc<CachedCertificate>, ResolveError> {
        let slot = binding.slot(name);
        let previous = slot.load();

        if let Some(cached) = &previous {
            if self.is_fresh(binding, cached).await {
                return Ok(cached.clone());
            }
        }

        // Waiting for another issuance and issuing ourselves share one budget
        let deadline = tokio::time::Instant::now() + self.policy.issue_timeout;

        let _guard = match slot.issue_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                // Someone else is issuing; keep serving what we have meanwhile
                if let Some(cached) = &previous {
                    if cached.is_valid_at(OffsetDateTime::now_utc()) {
                        return Ok(cached.clone());
                    }
                }
                tokio::time::timeout_at(deadline, slot.issue_lock.lock())
                    .await
                    .map_err(|_| {
                        ResolveError::CertificateUnavailable(format!(
                            "timed out waiting for issuance for {}",
                            binding.label
                        ))
                    })?
            }
        };

        // The issuance we waited for may already have produced a fresh certificate
        let previous = slot.load();
        if let Some(cached) = &previous {
            if self.is_fresh(binding, cached).await {
                return Ok(cached.clone());
            }
        }

        let issuance = issue(&binding.source, name);
        let outcome = match tokio::time::timeout_at(deadline, issuance).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ResolveError::CertificateUnavailable(format!(
                "issuance for {} did not finish within {:?}",
                binding.label, self.policy.issue_timeout
            ))),
        };

        match outcome {
            Ok(cached) => {
                let cached = Arc::new(cached);
                slot.store(cached.clone());
                info!(
                    "Certificate for {} ready, valid until {}",
                    binding.label, cached.not_after
                );
                Ok(cached)
            }
            Err(e) => match previous {
                Some(cached) if cached.is_valid_at(OffsetDateTime::now_utc()) => {
                    warn!(
                        "Refreshing certificate for {} failed, serving previous one: {}",
                        binding.label, e
                    );
                    Ok(cached)
                }
                _ => {
                    binding.discard_if_empty(name, &slot);
                    Err(e)
                }
            },
        }
    }

    async fn is_fresh(&self, binding: &Binding, cached: &CachedCertificate) -> bool {
        let now = OffsetDateTime::now_utc();

        match &binding.source {
            CertificateSource::Static {
                cert_path,
                key_path,
            } => stamp_unchanged(cached, &[cert_path, key_path]).await,
            CertificateSource::SelfSigned { authority, .. } => {
                if now >= cached.not_after - self.policy.renewal_margin {
                    debug!("Certificate for {} is due for renewal", binding.label);
                    return false;
                }
                match authority {
                    AuthoritySource::InMemory(_) => true,
                    AuthoritySource::Files {
                        cert_path,
                        key_path,
                    } => stamp_unchanged(cached, &[cert_path, key_path]).await,
                }
            }
            CertificateSource::External(_) => match cached.refresh_at {
                Some(refresh_at) => now < refresh_at,
                None => cached.is_valid_at(now),
            },
        }
    }
}

async fn issue(source: &CertificateSource, name: &str) -> Result<CachedCertificate, ResolveError> {
    match source {
        CertificateSource::Static {
            cert_path,
            key_path,
        } => load_static(cert_path, key_path).await,
        CertificateSource::SelfSigned {
            authority,
            subject,
            hosts,
        } => issue_self_signed(authority, subject, hosts).await,
        CertificateSource::External(issuer) => {
            let issued = issuer.get_certificate(name).await?;
            Ok(CachedCertificate {
                certified_key: issued.certified_key,
                not_after: issued.not_after,
                refresh_at: Some(issued.refresh_at),
                file_stamp: None,
            })
        }
    }
}

async fn load_static(cert_path: &Path, key_path: &Path) -> Result<CachedCertificate, ResolveError> {
    let unavailable = |e: String| ResolveError::NoCertificateAvailable(e);

    let stamp = file_stamp(&[cert_path, key_path])
        .await
        .map_err(|e| unavailable(format!("{}", e)))?;

    let cert_pem = tokio::fs::read(cert_path)
        .await
        .map_err(|e| unavailable(format!("{}: {}", cert_path.display(), e)))?;
    let key_pem = tokio::fs::read(key_path)
        .await
        .map_err(|e| unavailable(format!("{}: {}", key_path.display(), e)))?;

    let certificate = Certificate::from_pem(&cert_pem, &key_pem)
        .map_err(|e| unavailable(format!("{}: {}", cert_path.display(), e)))?;
    let not_after = certificate
        .not_after()
        .map_err(|e| unavailable(format!("{}: {}", cert_path.display(), e)))?;

    debug!(
        "Loaded certificate from {} and {}",
        cert_path.display(),
        key_path.display()
    );

    let certified_key = certificate.certified_key()?;
    if let Err(rustls::Error::InconsistentKeys(rustls::InconsistentKeys::KeyMismatch)) =
        certified_key.keys_match()
    {
        return Err(unavailable(format!(
            "{} does not match the certificate in {}",
            key_path.display(),
            cert_path.display()
        )));
    }

    Ok(CachedCertificate {
        certified_key,
        not_after,
        refresh_at: None,
        file_stamp: Some(stamp),
    })
}

async fn issue_self_signed(
    authority: &AuthoritySource,
    subject: &Subject,
    hosts: &[String],
) -> Result<CachedCertificate, ResolveError> {
    let stamp = match authority {
        AuthoritySource::InMemory(_) => None,
        AuthoritySource::Files {
            cert_path,
            key_path,
        } => Some(
            file_stamp(&[cert_path, key_path])
                .await
                .map_err(|e| IssueError::InvalidCa(e.to_string()))?,
        ),
    };

    let authority = authority.clone();
    let subject = subject.clone();
    let hosts = hosts.to_vec();

    let leaf = tokio::task::spawn_blocking(move || {
        let ca = match authority {
            AuthoritySource::InMemory(ca) => ca,
            AuthoritySource::Files {
                cert_path,
                key_path,
            } => CertificateAuthority::load_from_files(cert_path, key_path)?,
        };
        issue_leaf(&ca, &subject, &hosts)
    })
    .await
    .map_err(|e| ResolveError::CertificateUnavailable(format!("issuer task failed: {}", e)))??;

    let mut cached = CachedCertificate::from_leaf(&leaf)?;
    cached.file_stamp = stamp;
    Ok(cached)
}

async fn file_stamp(paths: &[&Path]) -> std::io::Result<FileStamp> {
    let mut stamp = Vec::with_capacity(paths.len());
    for path in paths {
        let metadata = tokio::fs::metadata(path).await.map_err(|e| {
            std::io::Error::new(e.kind(), format!("{}: {}", path.display(), e))
        })?;
        stamp.push(metadata.modified()?);
    }
    Ok(stamp)
}

async fn stamp_unchanged(cached: &CachedCertificate, paths: &[&PathBuf]) -> bool {
    let paths: Vec<&Path> = paths.iter().map(|p| p.as_path()).collect();
    match (&cached.file_stamp, file_stamp(&paths).await) {
        (Some(previous), Ok(current)) => *previous == current,
        // Files that vanished keep the loaded certificate in service
        (Some(_), Err(_)) => true,
        (None, _) => false,
    }
}

/// Lowercase and strip a trailing dot
pub fn normalize_host(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}

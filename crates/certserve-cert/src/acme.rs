//! ACME issuer for automatic certificate provisioning via Let's Encrypt
//!
//! Certificates are obtained with the HTTP-01 challenge. Account credentials and
//! issued material are persisted through a [`CertCache`], so restarts reuse them
//! until they come within `renew_before` of expiry.

use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier,
    LetsEncrypt, NewAccount, NewOrder, Order, OrderStatus, RetryPolicy,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

use crate::challenge::{Http01Challenge, Http01ChallengeStore};
use crate::resolver::{normalize_host, CertificateIssuer, IssuedCertificate, ResolveError};
use crate::storage::{CertCache, StorageError};
use crate::Certificate;

/// Cache key holding the serialized account credentials
pub const ACCOUNT_CACHE_KEY: &str = "acme_account";

/// Renew certificates this long before they expire
pub const DEFAULT_RENEW_BEFORE: Duration = Duration::days(30);

/// Retry a failed renewal after this long while the old certificate is still valid
const RENEWAL_RETRY_INTERVAL: Duration = Duration::hours(1);

/// ACME errors
#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("Account creation failed: {0}")]
    AccountCreationFailed(String),

    #[error("Order creation failed: {0}")]
    OrderCreationFailed(String),

    #[error("Challenge failed: {0}")]
    ChallengeFailed(String),

    #[error("Certificate finalization failed: {0}")]
    FinalizationFailed(String),

    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    #[error("Host not allowed: {0}")]
    HostNotAllowed(String),

    #[error("HTTP-01 challenge not offered for {0}")]
    Http01NotSupported(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Certificate error: {0}")]
    CertGen(String),
}

/// ACME configuration
#[derive(Debug, Clone)]
pub struct AcmeConfig {
    /// Contact email for Let's Encrypt
    pub contact_email: String,
    /// Only these domains are issued for
    pub domains: Vec<String>,
    /// Use Let's Encrypt staging environment (for testing)
    pub use_staging: bool,
    /// Directory URL of another ACME server, overriding `use_staging`
    pub directory_url: Option<String>,
    /// PEM root CA for the ACME server's own TLS certificate (e.g. Pebble)
    pub root_ca_path: Option<PathBuf>,
    pub renew_before: Duration,
    /// How long to wait for an order to become ready, and for the certificate
    pub order_timeout: std::time::Duration,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            contact_email: String::new(),
            domains: Vec::new(),
            use_staging: false,
            directory_url: None,
            root_ca_path: None,
            renew_before: DEFAULT_RENEW_BEFORE,
            order_timeout: std::time::Duration::from_secs(90),
        }
    }
}

impl AcmeConfig {
    pub fn directory_url(&self) -> String {
        match &self.directory_url {
            Some(url) => url.clone(),
            None if self.use_staging => LetsEncrypt::Staging.url().to_string(),
            None => LetsEncrypt::Production.url().to_string(),
        }
    }
}

/// Certificate issuer backed by an ACME server
pub struct AcmeIssuer {
    config: AcmeConfig,
    cache: Arc<dyn CertCache>,
    challenges: Http01ChallengeStore,
    account: tokio::sync::Mutex<Option<Account>>,
    certificates: RwLock<HashMap<String, IssuedCertificate>>,
    domain_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl AcmeIssuer {
    pub fn new(
        config: AcmeConfig,
        cache: Arc<dyn CertCache>,
        challenges: Http01ChallengeStore,
    ) -> Self {
        Self {
            config,
            cache,
            challenges,
            account: tokio::sync::Mutex::new(None),
            certificates: RwLock::new(HashMap::new()),
            domain_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &AcmeConfig {
        &self.config
    }

    /// Store the HTTP-01 responder must answer from
    pub fn challenges(&self) -> &Http01ChallengeStore {
        &self.challenges
    }

    /// Certificate for `domain`: from memory, then from the cache, then a new order
    pub async fn certificate(&self, domain: &str) -> Result<IssuedCertificate, AcmeError> {
        let domain = normalize_host(domain);
        Self::validate_domain(&domain)?;
        if !self
            .config
            .domains
            .iter()
            .any(|allowed| normalize_host(allowed) == domain)
        {
            return Err(AcmeError::HostNotAllowed(domain));
        }

        let lock = self.domain_lock(&domain);
        let _guard = lock.lock().await;

        let now = OffsetDateTime::now_utc();
        let mut previous = None;

        if let Some(issued) = self.memory_lookup(&domain) {
            if now < issued.refresh_at {
                return Ok(issued);
            }
            previous = Some(issued);
        }

        if previous.is_none() {
            match self.cache.get(&domain).await {
                Ok(bytes) => match self.parse_material(&bytes, now) {
                    Ok(issued) if now < issued.not_after - self.config.renew_before => {
                        debug!("Using cached certificate for {}", domain);
                        self.remember(&domain, &issued);
                        return Ok(issued);
                    }
                    Ok(issued) => {
                        info!("Cached certificate for {} is due for renewal", domain);
                        previous = Some(issued);
                    }
                    Err(e) => {
                        warn!("Ignoring unreadable cached certificate for {}: {}", domain, e)
                    }
                },
                Err(StorageError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        match self.obtain(&domain).await {
            Ok(issued) => Ok(issued),
            Err(e) => match previous {
                Some(mut issued) if now < issued.not_after => {
                    warn!(
                        "Renewing certificate for {} failed, keeping the current one: {}",
                        domain, e
                    );
                    issued.refresh_at = (now + RENEWAL_RETRY_INTERVAL).min(issued.not_after);
                    self.remember(&domain, &issued);
                    Ok(issued)
                }
                _ => Err(e),
            },
        }
    }

    /// Order a new certificate and persist it
    async fn obtain(&self, domain: &str) -> Result<IssuedCertificate, AcmeError> {
        let (key_pem, chain_pem) = self.order_certificate(domain).await?;

        let mut material = key_pem;
        if !material.ends_with('\n') {
            material.push('\n');
        }
        material.push_str(&chain_pem);

        let issued = self.parse_material(material.as_bytes(), OffsetDateTime::now_utc())?;
        self.cache.put(domain, material.as_bytes()).await?;
        self.remember(domain, &issued);

        info!(
            "Obtained certificate for {} valid until {}",
            domain, issued.not_after
        );
        Ok(issued)
    }

    fn parse_material(
        &self,
        bytes: &[u8],
        now: OffsetDateTime,
    ) -> Result<IssuedCertificate, AcmeError> {
        let certificate =
            Certificate::from_pem(bytes, bytes).map_err(|e| AcmeError::CertGen(e.to_string()))?;
        let not_after = certificate
            .not_after()
            .map_err(|e| AcmeError::CertGen(e.to_string()))?;
        let certified_key = certificate
            .certified_key()
            .map_err(|e| AcmeError::CertGen(e.to_string()))?;

        Ok(IssuedCertificate {
            certified_key,
            not_after,
            refresh_at: refresh_instant(now, not_after, self.config.renew_before),
        })
    }

    fn memory_lookup(&self, domain: &str) -> Option<IssuedCertificate> {
        self.certificates.read().ok()?.get(domain).cloned()
    }

    fn remember(&self, domain: &str, issued: &IssuedCertificate) {
        if let Ok(mut certificates) = self.certificates.write() {
            certificates.insert(domain.to_string(), issued.clone());
        }
    }

    fn domain_lock(&self, domain: &str) -> Arc<tokio::sync::Mutex<()>> {
        match self.domain_locks.lock() {
            Ok(mut locks) => locks.entry(domain.to_string()).or_default().clone(),
            Err(_) => Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Load the account from the cache, or register a new one and store it
    async fn account(&self) -> Result<Account, AcmeError> {
        let mut account = self.account.lock().await;
        if let Some(account) = account.as_ref() {
            return Ok(account.clone());
        }

        let builder = match &self.config.root_ca_path {
            Some(path) => Account::builder_with_root(path),
            None => Account::builder(),
        }
        .map_err(|e| AcmeError::AccountCreationFailed(e.to_string()))?;

        let loaded = match self.cache.get(ACCOUNT_CACHE_KEY).await {
            Ok(bytes) => {
                let credentials: AccountCredentials = serde_json::from_slice(&bytes)
                    .map_err(|e| AcmeError::AccountCreationFailed(e.to_string()))?;
                debug!("Loaded ACME account from cache");
                builder
                    .from_credentials(credentials)
                    .await
                    .map_err(|e| AcmeError::AccountCreationFailed(e.to_string()))?
            }
            Err(StorageError::NotFound(_)) => {
                let contact = format!("mailto:{}", self.config.contact_email);
                let contacts: Vec<&str> = if self.config.contact_email.is_empty() {
                    Vec::new()
                } else {
                    vec![contact.as_str()]
                };

                let (created, credentials) = builder
                    .create(
                        &NewAccount {
                            contact: &contacts,
                            terms_of_service_agreed: true,
                            only_return_existing: false,
                        },
                        self.config.directory_url(),
                        None,
                    )
                    .await
                    .map_err(|e| AcmeError::AccountCreationFailed(e.to_string()))?;

                let json = serde_json::to_vec(&credentials)
                    .map_err(|e| AcmeError::AccountCreationFailed(e.to_string()))?;
                self.cache.put(ACCOUNT_CACHE_KEY, &json).await?;
                info!("Registered ACME account at {}", self.config.directory_url());
                created
            }
            Err(e) => return Err(e.into()),
        };

        *account = Some(loaded.clone());
        Ok(loaded)
    }

    /// Run one order; returns the private key PEM and the chain PEM
    async fn order_certificate(&self, domain: &str) -> Result<(String, String), AcmeError> {
        let account = self.account().await?;

        let identifiers = [Identifier::Dns(domain.to_string())];
        let mut order = account
            .new_order(&NewOrder::new(&identifiers))
            .await
            .map_err(|e| AcmeError::OrderCreationFailed(e.to_string()))?;
        info!("Created ACME order for {}", domain);

        let mut tokens = Vec::new();
        let result = self.complete_order(&mut order, domain, &mut tokens).await;

        for token in &tokens {
            self.challenges.remove(token);
        }

        result
    }

    async fn complete_order(
        &self,
        order: &mut Order,
        domain: &str,
        tokens: &mut Vec<String>,
    ) -> Result<(String, String), AcmeError> {
        {
            let mut authorizations = order.authorizations();
            while let Some(authz) = authorizations.next().await {
                let mut authz = authz.map_err(|e| AcmeError::ChallengeFailed(e.to_string()))?;
                match &authz.status {
                    AuthorizationStatus::Pending => {}
                    AuthorizationStatus::Valid => continue,
                    status => {
                        return Err(AcmeError::ChallengeFailed(format!(
                            "authorization for {} is {:?}",
                            domain, status
                        )))
                    }
                }

                let mut challenge = authz
                    .challenge(ChallengeType::Http01)
                    .ok_or_else(|| AcmeError::Http01NotSupported(domain.to_string()))?;

                let token = challenge.token.clone();
                self.challenges.insert(Http01Challenge {
                    token: token.clone(),
                    key_authorization: challenge.key_authorization().as_str().to_string(),
                });
                tokens.push(token);

                challenge
                    .set_ready()
                    .await
                    .map_err(|e| AcmeError::ChallengeFailed(e.to_string()))?;
                debug!("HTTP-01 challenge for {} is ready", domain);
            }
        }

        let retry_policy = RetryPolicy::new()
            .timeout(self.config.order_timeout)
            .initial_delay(std::time::Duration::from_secs(1));

        let status = order
            .poll_ready(&retry_policy)
            .await
            .map_err(|e| AcmeError::ChallengeFailed(e.to_string()))?;
        if !matches!(status, OrderStatus::Ready | OrderStatus::Valid) {
            return Err(AcmeError::ChallengeFailed(format!(
                "order for {} ended as {:?}",
                domain, status
            )));
        }

        let key_pem = order
            .finalize()
            .await
            .map_err(|e| AcmeError::FinalizationFailed(e.to_string()))?;
        let chain_pem = order
            .poll_certificate(&retry_policy)
            .await
            .map_err(|e| AcmeError::FinalizationFailed(e.to_string()))?;

        Ok((key_pem, chain_pem))
    }

    /// Validate domain name
    fn validate_domain(domain: &str) -> Result<(), AcmeError> {
        if domain.is_empty() {
            return Err(AcmeError::InvalidDomain(
                "Domain cannot be empty".to_string(),
            ));
        }

        if domain.contains(' ') {
            return Err(AcmeError::InvalidDomain(
                "Domain cannot contain spaces".to_string(),
            ));
        }

        if domain.starts_with('.') || domain.ends_with('.') {
            return Err(AcmeError::InvalidDomain(
                "Domain cannot start or end with a dot".to_string(),
            ));
        }

        if domain.parse::<std::net::IpAddr>().is_ok() {
            return Err(AcmeError::InvalidDomain(
                "HTTP-01 cannot validate IP addresses".to_string(),
            ));
        }

        Ok(())
    }
}

/// When to ask again: `renew_before` ahead of expiry, or halfway to expiry for
/// certificates shorter-lived than `renew_before`
pub fn refresh_instant(
    now: OffsetDateTime,
    not_after: OffsetDateTime,
    renew_before: Duration,
) -> OffsetDateTime {
    let planned = not_after - renew_before;
    if planned > now || not_after <= now {
        planned
    } else {
        now + (not_after - now) / 2
    }
}

#[async_trait]
impl CertificateIssuer for AcmeIssuer {
    async fn get_certificate(&self, server_name: &str) -> Result<IssuedCertificate, ResolveError> {
        self.certificate(server_name).await.map_err(|e| match e {
            AcmeError::HostNotAllowed(host) | AcmeError::InvalidDomain(host) => {
                ResolveError::NoCertificateAvailable(host)
            }
            other => ResolveError::Issuer(other.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::{generate_ca, Subject};
    use crate::self_signed::issue_leaf;
    use crate::storage::MemoryCache;

    fn issuer_for(domains: &[&str], cache: Arc<MemoryCache>) -> AcmeIssuer {
        let config = AcmeConfig {
            contact_email: "admin@example.com".to_string(),
            domains: domains.iter().map(|d| d.to_string()).collect(),
            // Nothing listens here; tests must not reach the network
            directory_url: Some("https://127.0.0.1:9/dir".to_string()),
            ..Default::default()
        };
        AcmeIssuer::new(config, cache, Http01ChallengeStore::new())
    }

    #[test]
    fn test_directory_url_selection() {
        let mut config = AcmeConfig::default();
        assert_eq!(config.directory_url(), LetsEncrypt::Production.url());

        config.use_staging = true;
        assert_eq!(config.directory_url(), LetsEncrypt::Staging.url());

        config.directory_url = Some("https://localhost:14000/dir".to_string());
        assert_eq!(config.directory_url(), "https://localhost:14000/dir");
    }

    #[test]
    fn test_validate_domain() {
        assert!(AcmeIssuer::validate_domain("example.com").is_ok());
        assert!(AcmeIssuer::validate_domain("sub.example.com").is_ok());
        assert!(AcmeIssuer::validate_domain("").is_err());
        assert!(AcmeIssuer::validate_domain("invalid domain.com").is_err());
        assert!(AcmeIssuer::validate_domain(".example.com").is_err());
        assert!(AcmeIssuer::validate_domain("10.0.0.1").is_err());
    }

    #[test]
    fn test_refresh_instant() {
        let now = OffsetDateTime::now_utc();

        let long_lived = now + Duration::days(90);
        assert_eq!(
            refresh_instant(now, long_lived, Duration::days(30)),
            now + Duration::days(60)
        );

        let short_lived = now + Duration::days(10);
        assert_eq!(
            refresh_instant(now, short_lived, Duration::days(30)),
            now + Duration::days(5)
        );
    }

    #[tokio::test]
    async fn test_host_not_allowed() {
        let issuer = issuer_for(&["example.test"], Arc::new(MemoryCache::new()));

        let result = issuer.certificate("evil.test").await;
        assert!(matches!(result, Err(AcmeError::HostNotAllowed(_))));

        let resolved = CertificateIssuer::get_certificate(&issuer, "evil.test").await;
        assert!(matches!(
            resolved,
            Err(ResolveError::NoCertificateAvailable(_))
        ));
    }

    #[tokio::test]
    async fn test_cached_material_is_reused() {
        let ca = generate_ca(&Subject::new("Test ACME CA")).unwrap();
        let leaf = issue_leaf(&ca, &ca.subject, &["example.test".to_string()]).unwrap();
        let material = format!("{}{}", leaf.key_pem(), leaf.chain_pem());

        let cache = Arc::new(MemoryCache::new());
        cache.put("example.test", material.as_bytes()).await.unwrap();

        let issuer = issuer_for(&["Example.Test"], cache.clone());
        let issued = issuer.certificate("EXAMPLE.test").await.unwrap();

        assert_eq!(issued.certified_key.cert.len(), 2);
        assert_eq!(issued.certified_key.cert[0], leaf.cert_der);
        assert_eq!(issued.not_after, leaf.not_after);
        assert_eq!(issued.refresh_at, leaf.not_after - DEFAULT_RENEW_BEFORE);

        // No account was needed
        assert!(matches!(
            cache.get(ACCOUNT_CACHE_KEY).await,
            Err(StorageError::NotFound(_))
        ));
        assert!(issuer.challenges().is_empty());
    }

    #[tokio::test]
    async fn test_failed_renewal_keeps_valid_certificate() {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let ca = generate_ca(&Subject::new("Test ACME CA")).unwrap();
        let leaf = issue_leaf(&ca, &ca.subject, &["example.test".to_string()]).unwrap();
        let material = format!("{}{}", leaf.key_pem(), leaf.chain_pem());

        let cache = Arc::new(MemoryCache::new());
        cache.put("example.test", material.as_bytes()).await.unwrap();

        let mut issuer = issuer_for(&["example.test"], cache);
        // Everything the cache holds is due for renewal
        issuer.config.renew_before = Duration::days(90);

        let before = OffsetDateTime::now_utc();
        let issued = issuer.certificate("example.test").await.unwrap();

        assert_eq!(issued.certified_key.cert[0], leaf.cert_der);
        assert!(issued.refresh_at <= before + RENEWAL_RETRY_INTERVAL + Duration::seconds(5));
        assert!(issuer.challenges().is_empty());
    }

    #[tokio::test]
    async fn test_failed_first_issuance_is_an_error() {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let issuer = issuer_for(&["example.test"], Arc::new(MemoryCache::new()));
        let result = issuer.certificate("example.test").await;

        assert!(matches!(result, Err(AcmeError::AccountCreationFailed(_))));
    }
}

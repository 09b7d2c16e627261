//! certserve CLI - HTTPS serving with static, self-signed or ACME certificates
//!
//! Generates a local CA and leaf certificates, and serves HTTPS with the
//! certificate picked per handshake from the client's server name.

use anyhow::{bail, Context, Result};
use axum::routing::get;
use axum::Router;
use certserve_cert::{
    generate_ca, issue_leaf, AcmeConfig, AcmeIssuer, AuthoritySource, CertificateAuthority,
    CertificateResolver, CertificateSource, Http01ChallengeStore, JsonFileCache, Subject,
};
use certserve_server_https::{http01, HttpsServer, HttpsServerConfig, RouterHandler};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// certserve - HTTPS with certificates chosen at handshake time
#[derive(Parser, Debug)]
#[command(name = "certserve")]
#[command(about = "certserve - HTTPS with certificates chosen at handshake time")]
#[command(version)]
struct Cli {
    /// Log level or filter directive (e.g. "debug", "certserve_cert=trace")
    #[arg(long, global = true, env = "CERTSERVE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a certificate authority and write it as PEM files
    GenerateCa {
        /// Output path of the CA certificate
        #[arg(long, env = "CERTSERVE_CA_CERT")]
        cert: PathBuf,

        /// Output path of the CA private key
        #[arg(long, env = "CERTSERVE_CA_KEY")]
        key: PathBuf,

        #[command(flatten)]
        subject: SubjectArgs,
    },

    /// Issue a leaf certificate signed by an existing CA
    GenerateCert {
        #[arg(long, env = "CERTSERVE_CA_CERT")]
        ca_cert: PathBuf,

        #[arg(long, env = "CERTSERVE_CA_KEY")]
        ca_key: PathBuf,

        /// Output path of the leaf certificate
        #[arg(long)]
        cert: PathBuf,

        /// Output path of the leaf private key
        #[arg(long)]
        key: PathBuf,

        /// DNS name or IP address to include (repeatable)
        #[arg(long = "host", required = true)]
        hosts: Vec<String>,

        #[command(flatten)]
        subject: SubjectArgs,
    },

    /// Serve HTTPS
    #[command(long_about = r#"
Serve HTTPS on --bind, choosing the certificate for every handshake from the
server name the client sends.

EXAMPLES:
  # Serve existing PEM files, reloaded when they change
  certserve serve --mode static --host example.test \
    --cert cert.pem --key key.pem

  # Local development with a CA generated on first start
  certserve serve --mode self-signed --host localhost --host 127.0.0.1 \
    --ca-cert ca.pem --ca-key ca-key.pem --bind 127.0.0.1:8443 --fallback

  # Let's Encrypt, answering HTTP-01 challenges on port 80
  certserve serve --mode acme --host example.com \
    --contact admin@example.com --cache certs.json

ENVIRONMENT VARIABLES:
  CERTSERVE_BIND         HTTPS listen address
  CERTSERVE_HTTP_BIND    HTTP listen address (acme mode)
  CERTSERVE_MODE         static, self-signed or acme
  CERTSERVE_CA_CERT      CA certificate path (self-signed mode)
  CERTSERVE_CA_KEY       CA key path (self-signed mode)
  CERTSERVE_ACME_CONTACT ACME account contact email
  CERTSERVE_ACME_CACHE   ACME account and certificate cache file
    "#)]
    Serve(Box<ServeArgs>),
}

#[derive(Args, Debug)]
struct SubjectArgs {
    #[arg(long, default_value = "certserve")]
    common_name: String,

    #[arg(long, default_value = "certserve")]
    organization: String,

    #[arg(long, default_value = "Development")]
    organizational_unit: String,

    /// Two-letter country code
    #[arg(long, default_value = "US")]
    country: String,

    #[arg(long, default_value = "California")]
    province: String,

    #[arg(long, default_value = "San Francisco")]
    locality: String,

    #[arg(long, default_value = "")]
    postal_code: String,

    #[arg(long, default_value = "")]
    street_address: String,
}

impl From<SubjectArgs> for Subject {
    fn from(args: SubjectArgs) -> Self {
        Subject {
            common_name: args.common_name,
            organization: args.organization,
            organizational_unit: args.organizational_unit,
            country: args.country,
            province: args.province,
            locality: args.locality,
            postal_code: args.postal_code,
            street_address: args.street_address,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Static,
    SelfSigned,
    Acme,
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// HTTPS listen address
    #[arg(long, env = "CERTSERVE_BIND", default_value = "0.0.0.0:443")]
    bind: SocketAddr,

    #[arg(long, value_enum, env = "CERTSERVE_MODE", default_value = "self-signed")]
    mode: Mode,

    /// Server name to serve (repeatable)
    #[arg(long = "host", required = true)]
    hosts: Vec<String>,

    /// Also present the certificate to clients that send no or an unknown server name
    #[arg(long)]
    fallback: bool,

    /// Certificate chain PEM (static mode)
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Private key PEM (static mode)
    #[arg(long)]
    key: Option<PathBuf>,

    /// CA certificate PEM, generated if both CA files are missing (self-signed mode)
    #[arg(long, env = "CERTSERVE_CA_CERT", default_value = "ca.pem")]
    ca_cert: PathBuf,

    /// CA private key PEM (self-signed mode)
    #[arg(long, env = "CERTSERVE_CA_KEY", default_value = "ca-key.pem")]
    ca_key: PathBuf,

    #[command(flatten)]
    subject: SubjectArgs,

    /// Account and certificate cache file (acme mode)
    #[arg(long, env = "CERTSERVE_ACME_CACHE", default_value = "certserve-cache.json")]
    cache: PathBuf,

    /// Contact email for the ACME account (acme mode)
    #[arg(long, env = "CERTSERVE_ACME_CONTACT")]
    contact: Option<String>,

    /// Use the Let's Encrypt staging environment
    #[arg(long)]
    staging: bool,

    /// ACME directory URL overriding Let's Encrypt
    #[arg(long, env = "CERTSERVE_ACME_DIRECTORY")]
    acme_directory: Option<String>,

    /// Plain HTTP listen address for challenges and redirects (acme mode)
    #[arg(long, env = "CERTSERVE_HTTP_BIND", default_value = "0.0.0.0:80")]
    http_bind: SocketAddr,

    /// Reissue certificates this many days before they expire
    #[arg(long, default_value = "30")]
    renewal_margin_days: u32,

    /// Fail a handshake when issuance takes longer than this
    #[arg(long, default_value = "30")]
    issue_timeout_secs: u64,

    /// Directory of static files to serve (a greeting page otherwise)
    #[arg(long)]
    root: Option<PathBuf>,
}

/// Setup logging with the specified filter
fn setup_logging(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn generate_ca_files(cert: PathBuf, key: PathBuf, subject: Subject) -> Result<()> {
    let ca = generate_ca(&subject).context("Failed to generate CA")?;
    ca.save_to_files(&cert, &key)
        .context("Failed to write CA files")?;

    info!("CA certificate written to {}", cert.display());
    info!("CA private key written to {}", key.display());
    Ok(())
}

fn generate_cert_files(
    ca_cert: PathBuf,
    ca_key: PathBuf,
    cert: PathBuf,
    key: PathBuf,
    hosts: Vec<String>,
    subject: Subject,
) -> Result<()> {
    let ca = CertificateAuthority::load_from_files(&ca_cert, &ca_key)
        .with_context(|| format!("Failed to load CA from {}", ca_cert.display()))?;
    let leaf = issue_leaf(&ca, &subject, &hosts).context("Failed to issue certificate")?;
    leaf.save_to_files(&cert, &key)
        .context("Failed to write certificate files")?;

    info!(
        "Certificate for {} written to {} (expires {})",
        hosts.join(", "),
        cert.display(),
        leaf.not_after
    );
    Ok(())
}

fn build_router(root: Option<PathBuf>) -> Router {
    let router = match root {
        Some(root) => {
            info!("Serving files from {}", root.display());
            Router::new().fallback_service(ServeDir::new(root))
        }
        None => Router::new().route("/", get(|| async { "certserve is running\n" })),
    };
    router.layer(TraceLayer::new_for_http())
}

async fn serve(args: ServeArgs) -> Result<()> {
    let mut http_task = None;

    let source = match args.mode {
        Mode::Static => {
            let (Some(cert_path), Some(key_path)) = (args.cert, args.key) else {
                bail!("--cert and --key are required in static mode");
            };
            info!("Serving certificate {}", cert_path.display());
            CertificateSource::Static {
                cert_path,
                key_path,
            }
        }
        Mode::SelfSigned => {
            let subject = Subject::from(args.subject);
            let ca = CertificateAuthority::load_or_generate(&args.ca_cert, &args.ca_key, &subject)
                .with_context(|| format!("Failed to prepare CA {}", args.ca_cert.display()))?;
            info!("Using CA {}", args.ca_cert.display());
            CertificateSource::SelfSigned {
                authority: AuthoritySource::Files {
                    cert_path: args.ca_cert,
                    key_path: args.ca_key,
                },
                subject: ca.subject,
                hosts: args.hosts.clone(),
            }
        }
        Mode::Acme => {
            let Some(contact_email) = args.contact else {
                bail!("--contact is required in acme mode");
            };
            if args.staging {
                warn!("Using Let's Encrypt staging; certificates will not be trusted");
            }

            let challenges = Http01ChallengeStore::new();
            let issuer = AcmeIssuer::new(
                AcmeConfig {
                    contact_email,
                    domains: args.hosts.clone(),
                    use_staging: args.staging,
                    directory_url: args.acme_directory,
                    renew_before: time::Duration::days(i64::from(args.renewal_margin_days)),
                    ..Default::default()
                },
                Arc::new(JsonFileCache::new(&args.cache)),
                challenges.clone(),
            );

            let http_router = http01::router(challenges, args.bind.port());
            let http_bind = args.http_bind;
            http_task = Some(tokio::spawn(async move {
                http01::serve_plain(http_bind, http_router).await
            }));

            CertificateSource::External(Arc::new(issuer))
        }
    };

    let mut builder = CertificateResolver::builder()
        .bind(args.hosts.clone(), source.clone())
        .renewal_margin(time::Duration::days(i64::from(args.renewal_margin_days)))
        .issue_timeout(Duration::from_secs(args.issue_timeout_secs));
    if args.fallback {
        builder = builder.default_source(source);
    }
    let resolver = Arc::new(
        builder
            .build()
            .context("Invalid certificate configuration")?,
    );

    let server = HttpsServer::new(
        HttpsServerConfig {
            bind_addr: args.bind,
            ..Default::default()
        },
        resolver,
        Arc::new(RouterHandler::new(build_router(args.root))),
    );
    let bound = server.bind().await?;
    info!(
        "Serving {} on https://{}",
        args.hosts.join(", "),
        bound.local_addr()
    );

    let https_task = tokio::spawn(bound.run());
    let http_task = async {
        match http_task {
            Some(task) => task.await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        result = https_task => {
            result.context("HTTPS server task panicked")??;
        }
        result = http_task => {
            if let Err(e) = result.context("HTTP server task panicked")? {
                error!("HTTP server stopped: {}", e);
                return Err(e.into());
            }
        }
    }

    info!("certserve stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level);

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("A rustls crypto provider was already installed");
    }

    match cli.command {
        Commands::GenerateCa { cert, key, subject } => {
            generate_ca_files(cert, key, subject.into())
        }
        Commands::GenerateCert {
            ca_cert,
            ca_key,
            cert,
            key,
            hosts,
            subject,
        } => generate_cert_files(ca_cert, ca_key, cert, key, hosts, subject.into()),
        Commands::Serve(args) => serve(*args).await,
    }
}

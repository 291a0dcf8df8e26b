//! Command line and runtime configuration

use std::path::PathBuf;

use clap::Parser;

use wirepact_common::telemetry::LogFormat;
use wirepact_common::DEFAULT_CA_NAME;

/// Default proxy sidecar image
pub const DEFAULT_ENVOY_IMAGE: &str = "envoyproxy/envoy-alpine:v1.20-latest";

/// Default port of the admission webhook server
pub const DEFAULT_WEBHOOK_PORT: u16 = 8443;

/// WirePact operator - enrolls workloads in the authentication mesh
#[derive(Parser, Debug)]
#[command(name = "wirepact-operator", version, about, long_about = None)]
pub struct Cli {
    /// Print CRD manifests and exit
    #[arg(long)]
    pub crd: bool,

    /// Namespace the operator and the CA workload live in
    ///
    /// Defaults to the namespace of the kube client configuration.
    #[arg(long, env = "WIREPACT_NAMESPACE")]
    pub namespace: Option<String>,

    /// Name of the CertificateAuthority participants get their PKI address from
    #[arg(long, env = "WIREPACT_CA_NAME", default_value = DEFAULT_CA_NAME)]
    pub ca_name: String,

    /// Image of the proxy sidecar
    #[arg(long, env = "WIREPACT_ENVOY_IMAGE", default_value = DEFAULT_ENVOY_IMAGE)]
    pub envoy_image: String,

    /// Port of the admission webhook server
    #[arg(long, env = "WIREPACT_WEBHOOK_PORT", default_value_t = DEFAULT_WEBHOOK_PORT)]
    pub webhook_port: u16,

    /// PEM certificate for the admission webhook server
    #[arg(long, env = "WIREPACT_WEBHOOK_CERT", requires = "webhook_key")]
    pub webhook_cert: Option<PathBuf>,

    /// PEM private key for the admission webhook server
    #[arg(long, env = "WIREPACT_WEBHOOK_KEY", requires = "webhook_cert")]
    pub webhook_key: Option<PathBuf>,

    /// Log output format (json or text)
    #[arg(long, env = "WIREPACT_LOG_FORMAT", default_value = "json")]
    pub log_format: LogFormat,
}

/// TLS material for the webhook server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WebhookTls {
    /// Certificate chain path
    pub cert: PathBuf,
    /// Private key path
    pub key: PathBuf,
}

/// Settings shared by controllers, webhook and background tasks
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Operator namespace
    pub namespace: String,
    /// CertificateAuthority to read the PKI address from
    pub ca_name: String,
    /// Proxy sidecar image
    pub envoy_image: String,
    /// Webhook listen port
    pub webhook_port: u16,
    /// Webhook TLS, `None` disables the webhook server
    pub webhook_tls: Option<WebhookTls>,
}

impl OperatorConfig {
    /// Resolve the CLI against the client's default namespace
    pub fn from_cli(cli: &Cli, default_namespace: &str) -> Self {
        let webhook_tls = match (&cli.webhook_cert, &cli.webhook_key) {
            (Some(cert), Some(key)) => Some(WebhookTls {
                cert: cert.clone(),
                key: key.clone(),
            }),
            _ => None,
        };
        Self {
            namespace: cli
                .namespace
                .clone()
                .filter(|ns| !ns.is_empty())
                .unwrap_or_else(|| default_namespace.to_string()),
            ca_name: cli.ca_name.clone(),
            envoy_image: cli.envoy_image.clone(),
            webhook_port: cli.webhook_port,
            webhook_tls,
        }
    }

    /// Defaults with the given namespace, for tests
    #[cfg(test)]
    pub fn for_testing(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            ca_name: DEFAULT_CA_NAME.to_string(),
            envoy_image: DEFAULT_ENVOY_IMAGE.to_string(),
            webhook_port: DEFAULT_WEBHOOK_PORT,
            webhook_tls: None,
        }
    }
}

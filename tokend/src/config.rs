// src/config.rs
// Runtime configuration for all pipeline stages, kept in one structure
// because we have few and simple components. The Kafka transport is
// configured from the environment; everything else comes from flags.

use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use log::info;
use rustls::{Certificate, OwnedTrustAnchor, PrivateKey, RootCertStore};

pub const ENV_KAFKA_CLIENT_CERT: &str = "KAFKA_CLIENT_CERT";
pub const ENV_KAFKA_CLIENT_KEY: &str = "KAFKA_CLIENT_KEY";
pub const ENV_KAFKA_INTER_CERT: &str = "KAFKA_INTERMEDIATE_CERT";
pub const ENV_KAFKA_INTER_CHAIN: &str = "KAFKA_INTERMEDIATE_CHAIN";
pub const ENV_KAFKA_ROOT_CERT: &str = "KAFKA_ROOT_CERT";
pub const ENV_KAFKA_BROKERS: &str = "KAFKA_BROKERS";
pub const ENV_KAFKA_TOPIC: &str = "KAFKA_TOPIC";

pub const DEFAULT_BATCH_PERIOD: Duration = Duration::from_secs(30);
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// The certificate of one of Amazon's root CAs. The certificate chain that
/// we encounter when connecting to our Kafka broker goes up to this CA. The
/// root certificates are available at:
/// https://www.amazontrust.com/repository/
const AMAZON_ROOT_CA_CERT: &str = "
-----BEGIN CERTIFICATE-----
MIID7zCCAtegAwIBAgIBADANBgkqhkiG9w0BAQsFADCBmDELMAkGA1UEBhMCVVMx
EDAOBgNVBAgTB0FyaXpvbmExEzARBgNVBAcTClNjb3R0c2RhbGUxJTAjBgNVBAoT
HFN0YXJmaWVsZCBUZWNobm9sb2dpZXMsIEluYy4xOzA5BgNVBAMTMlN0YXJmaWVs
ZCBTZXJ2aWNlcyBSb290IENlcnRpZmljYXRlIEF1dGhvcml0eSAtIEcyMB4XDTA5
MDkwMTAwMDAwMFoXDTM3MTIzMTIzNTk1OVowgZgxCzAJBgNVBAYTAlVTMRAwDgYD
VQQIEwdBcml6b25hMRMwEQYDVQQHEwpTY290dHNkYWxlMSUwIwYDVQQKExxTdGFy
ZmllbGQgVGVjaG5vbG9naWVzLCBJbmMuMTswOQYDVQQDEzJTdGFyZmllbGQgU2Vy
dmljZXMgUm9vdCBDZXJ0aWZpY2F0ZSBBdXRob3JpdHkgLSBHMjCCASIwDQYJKoZI
hvcNAQEBBQADggEPADCCAQoCggEBANUMOsQq+U7i9b4Zl1+OiFOxHz/Lz58gE20p
OsgPfTz3a3Y4Y9k2YKibXlwAgLIvWX/2h/klQ4bnaRtSmpDhcePYLQ1Ob/bISdm2
8xpWriu2dBTrz/sm4xq6HZYuajtYlIlHVv8loJNwU4PahHQUw2eeBGg6345AWh1K
Ts9DkTvnVtYAcMtS7nt9rjrnvDH5RfbCYM8TWQIrgMw0R9+53pBlbQLPLJGmpufe
hRhJfGZOozptqbXuNC66DQO4M99H67FrjSXZm86B0UVGMpZwh94CDklDhbZsc7tk
6mFBrMnUVN+HL8cisibMn1lUaJ/8viovxFUcdUBgF4UCVTmLfwUCAwEAAaNCMEAw
DwYDVR0TAQH/BAUwAwEB/zAOBgNVHQ8BAf8EBAMCAQYwHQYDVR0OBBYEFJxfAN+q
AdcwKziIorhtSpzyEZGDMA0GCSqGSIb3DQEBCwUAA4IBAQBLNqaEd2ndOxmfZyMI
bw5hyf2E3F/YNoHN2BtBLZ9g3ccaaNnRbobhiCPPE95Dz+I0swSdHynVv/heyNXB
ve6SbzJ08pGCL72CQnqtKrcgfU28elUSwhXqvfdqlS5sdJ/PHLTyxQGjhdByPq1z
qwubdQxtRbeOlKyWN7Wg0I8VRw7j6IPdj/3vQQF3zCepYoUz8jcI73HPdwbeyBkd
iEDPfUYd/x7H4c7/I9vG+o1VTqkC50cRRj70/b17KSa7qWFiNyi2LSr2EIZkyXCn
0q23KXB56jzaYyWf/Wi3MOxw+3WKt21gZ7IeyLnp2KhvAotnDU0mV3HaIPzBSlCN
sSi6
-----END CERTIFICATE-----";

/// Configuration for all pipeline stages.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub fwd_interval: Duration,
    pub key_expiry: Duration,
    pub kafka: Option<KafkaConfig>,
}

/// Configuration for the Kafka forwarder, loaded from the environment.
#[derive(Clone)]
pub struct KafkaConfig {
    pub batch_period: Duration,
    pub batch_size: usize,
    pub broker: String,
    pub topic: String,
    pub tls: Arc<rustls::ClientConfig>,
}

impl std::fmt::Debug for KafkaConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaConfig")
            .field("batch_period", &self.batch_period)
            .field("batch_size", &self.batch_size)
            .field("broker", &self.broker)
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

impl KafkaConfig {
    pub fn from_env() -> Result<Self> {
        let client_cert = required_env(ENV_KAFKA_CLIENT_CERT)?;
        let client_key = required_env(ENV_KAFKA_CLIENT_KEY)?;
        let inter_cert = required_env(ENV_KAFKA_INTER_CERT)?;
        let inter_chain = required_env(ENV_KAFKA_INTER_CHAIN)?;
        let root_cert = required_env(ENV_KAFKA_ROOT_CERT)?;
        let brokers = required_env(ENV_KAFKA_BROKERS)?;
        let topic = required_env(ENV_KAFKA_TOPIC)?;

        // If we're dealing with a comma-separated list of brokers, simply
        // select the first one.
        let broker = first_broker(&brokers);

        let tls = build_tls_config(
            &client_cert,
            &client_key,
            &[inter_cert, inter_chain, root_cert],
        )?;

        info!("Loaded Kafka config.");
        Ok(Self {
            batch_period: DEFAULT_BATCH_PERIOD,
            batch_size: DEFAULT_BATCH_SIZE,
            broker,
            topic,
            tls: Arc::new(tls),
        })
    }
}

fn required_env(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => bail!("environment variable unset: {name}"),
    }
}

fn first_broker(brokers: &str) -> String {
    brokers
        .split(',')
        .next()
        .unwrap_or_default()
        .trim()
        .to_string()
}

/// Builds a TLS client configuration for mutual authentication with the
/// broker: our client certificate plus a root store assembled from the
/// configured PEM files, the public webpki roots, and the bundled Amazon
/// root CA.
fn build_tls_config(
    cert_path: &str,
    key_path: &str,
    ca_paths: &[String],
) -> Result<rustls::ClientConfig> {
    let (cert_chain, key) = load_client_cert(cert_path, key_path)?;
    let roots = load_root_store(ca_paths)?;

    rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_client_auth_cert(cert_chain, key)
        .context("failed to build TLS client config")
}

fn load_client_cert(cert_path: &str, key_path: &str) -> Result<(Vec<Certificate>, PrivateKey)> {
    let cert_file = std::fs::File::open(cert_path)
        .with_context(|| format!("failed to open client certificate '{cert_path}'"))?;
    let mut cert_reader = BufReader::new(cert_file);
    let cert_chain: Vec<Certificate> = rustls_pemfile::certs(&mut cert_reader)
        .with_context(|| format!("failed to parse client certificate '{cert_path}'"))?
        .into_iter()
        .map(Certificate)
        .collect();
    if cert_chain.is_empty() {
        bail!("no certificates found in '{cert_path}'");
    }

    let key_file = std::fs::File::open(key_path)
        .with_context(|| format!("failed to open client key '{key_path}'"))?;
    let mut key_reader = BufReader::new(key_file);
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut key_reader)
        .with_context(|| format!("failed to parse client key '{key_path}'"))?;
    if keys.is_empty() {
        // Older deployments hand us PKCS#1 keys.
        let key_file = std::fs::File::open(key_path)?;
        let mut key_reader = BufReader::new(key_file);
        keys = rustls_pemfile::rsa_private_keys(&mut key_reader)
            .with_context(|| format!("failed to parse client key '{key_path}'"))?;
    }
    if keys.is_empty() {
        bail!("no private keys found in '{key_path}'");
    }

    Ok((cert_chain, PrivateKey(keys.remove(0))))
}

fn load_root_store(ca_paths: &[String]) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();

    // The public webpki roots stand in for the system certificate pool.
    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject.as_ref(),
            ta.spki.as_ref(),
            ta.name_constraints.as_ref().map(|nc| -> &[u8] { nc.as_ref() }),
        )
    }));

    for path in ca_paths {
        let pem = std::fs::read(path)
            .with_context(|| format!("failed to read CA certificate '{path}'"))?;
        add_pem_certs(&mut roots, &pem)
            .with_context(|| format!("failed to parse CA certificate '{path}'"))?;
    }

    add_pem_certs(&mut roots, AMAZON_ROOT_CA_CERT.as_bytes())
        .context("failed to parse the bundled Amazon root CA certificate")?;

    Ok(roots)
}

fn add_pem_certs(roots: &mut RootCertStore, pem: &[u8]) -> Result<()> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(pem))?;
    if certs.is_empty() {
        bail!("no PEM certificates found");
    }
    for der in certs {
        roots
            .add(&Certificate(der))
            .map_err(|e| anyhow!("failed to add certificate to root store: {e}"))?;
    }
    Ok(())
}

//! TLS certificate expiry inspection.

use std::sync::Arc;
use std::time::Duration;

use rustls::RootCertStore;
use rustls::pki_types::ServerName;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use x509_parser::prelude::FromDer;

use crate::error::ProbeError;

/// Result of inspecting one domain's certificate.
#[derive(Debug, Clone, Serialize)]
pub struct TlsCheckResult {
    pub domain: String,
    pub ok: bool,
    pub host: String,
    pub port: u16,
    pub not_after_ts: Option<i64>,
    pub days_remaining: Option<f64>,
    pub error: Option<String>,
}

/// `(host, port)` from an https URL; non-https URLs are not inspected.
#[must_use]
pub fn tls_target_from_url(url: &str) -> Option<(String, u16)> {
    let parsed = url::Url::parse(url.trim()).ok()?;
    if parsed.scheme() != "https" {
        return None;
    }
    let host = parsed.host_str()?.to_owned();
    Some((host, parsed.port().unwrap_or(443)))
}

fn tls_connector() -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

async fn leaf_not_after(host: &str, port: u16, timeout: Duration) -> Result<i64, ProbeError> {
    let server_name = ServerName::try_from(host.to_owned())
        .map_err(|e| ProbeError::Tls(format!("invalid server name: {e}")))?;

    let tcp = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| ProbeError::Tls(format!("connect timeout to {host}:{port}")))?
        .map_err(|e| ProbeError::Tls(format!("connect failed: {e}")))?;

    let tls = tokio::time::timeout(timeout, tls_connector().connect(server_name, tcp))
        .await
        .map_err(|_| ProbeError::Tls("handshake timeout".to_owned()))?
        .map_err(|e| ProbeError::Tls(format!("handshake failed: {e}")))?;

    let (_, conn) = tls.get_ref();
    let leaf = conn
        .peer_certificates()
        .and_then(|certs| certs.first())
        .ok_or_else(|| ProbeError::Tls("no peer certificate".to_owned()))?;

    let (_, cert) = x509_parser::certificate::X509Certificate::from_der(leaf.as_ref())
        .map_err(|e| ProbeError::Tls(format!("certificate parse failed: {e}")))?;
    Ok(cert.validity().not_after.timestamp())
}

/// Open a TLS connection and judge `notAfter` against `min_days_valid`.
pub async fn check_tls_cert(
    domain: &str,
    url: &str,
    min_days_valid: f64,
    timeout_seconds: f64,
    now_ts: f64,
) -> Option<TlsCheckResult> {
    let (host, port) = tls_target_from_url(url)?;
    let timeout = Duration::from_secs_f64(timeout_seconds.max(1.0));

    let result = match leaf_not_after(&host, port, timeout).await {
        Ok(not_after_ts) => {
            #[allow(clippy::cast_precision_loss)]
            let days_remaining = (not_after_ts as f64 - now_ts) / 86_400.0;
            let (ok, error) = if days_remaining < min_days_valid {
                (
                    false,
                    Some(format!(
                        "expires_soon: days_remaining={days_remaining:.2} < {min_days_valid:.2}"
                    )),
                )
            } else {
                (true, None)
            };
            TlsCheckResult {
                domain: domain.to_owned(),
                ok,
                host,
                port,
                not_after_ts: Some(not_after_ts),
                days_remaining: Some(days_remaining),
                error,
            }
        }
        Err(e) => TlsCheckResult {
            domain: domain.to_owned(),
            ok: false,
            host,
            port,
            not_after_ts: None,
            days_remaining: None,
            error: Some(e.to_string()),
        },
    };
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_https_urls_are_inspected() {
        assert_eq!(
            tls_target_from_url("https://app.example.net/path"),
            Some(("app.example.net".to_owned(), 443))
        );
        assert_eq!(
            tls_target_from_url("https://app.example.net:8443"),
            Some(("app.example.net".to_owned(), 8443))
        );
        assert_eq!(tls_target_from_url("http://plain.example.net"), None);
        assert_eq!(tls_target_from_url("not a url"), None);
    }

    #[tokio::test]
    async fn unreachable_host_reports_error() {
        let result = check_tls_cert("d", "https://127.0.0.1:1/", 14.0, 1.0, 0.0)
            .await
            .unwrap();
        assert!(!result.ok);
        assert!(result.error.is_some());
        assert_eq!(result.days_remaining, None);
    }
}

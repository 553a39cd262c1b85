//! Black-box SSRF guard checks against the public `SafeHttpClient` API, no
//! live network required: every case here is rejected before a socket is
//! ever opened.

use std::collections::HashSet;

use relay_core::error::Error;
use relay_core::http_client::SafeHttpClient;

fn client(allowlist: &[&str], allow_localhost: bool) -> SafeHttpClient {
    let allowlist: HashSet<String> = allowlist.iter().map(|h| h.to_string()).collect();
    SafeHttpClient::new(allowlist, allow_localhost).unwrap()
}

#[tokio::test]
async fn host_outside_allowlist_is_rejected() {
    let client = client(&["api.weather.gov"], false);
    let err = client.check_url("https://attacker.example/callback").await.unwrap_err();
    assert!(matches!(err, Error::HostNotAllowed(_)));
}

#[tokio::test]
async fn metadata_service_literal_ip_is_rejected_even_when_allowlisted() {
    let client = client(&["169.254.169.254"], false);
    let err = client
        .check_url("https://169.254.169.254/latest/meta-data/iam/security-credentials")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PrivateAddress(_)));
}

#[tokio::test]
async fn private_rfc1918_literal_is_rejected() {
    let client = client(&["10.0.0.5"], false);
    let err = client.check_url("https://10.0.0.5/internal").await.unwrap_err();
    assert!(matches!(err, Error::PrivateAddress(_)));
}

#[tokio::test]
async fn plain_http_is_rejected_even_for_an_allowlisted_host() {
    let client = client(&["api.weather.gov"], false);
    let err = client.check_url("http://api.weather.gov/gridpoints").await.unwrap_err();
    assert!(matches!(err, Error::HostNotAllowed(_)));
}

#[tokio::test]
async fn localhost_is_rejected_outside_dev() {
    let client = client(&[], false);
    let err = client.check_url("https://localhost/admin").await.unwrap_err();
    assert!(matches!(err, Error::HostNotAllowed(_)));
}

#[tokio::test]
async fn localhost_is_permitted_in_dev_mode() {
    let client = client(&[], true);
    assert!(client.check_url("https://localhost:8080/health").await.is_ok());
}

#[tokio::test]
async fn url_with_no_host_is_rejected() {
    let client = client(&["api.weather.gov"], false);
    assert!(client.check_url("not-a-url").await.is_err());
}

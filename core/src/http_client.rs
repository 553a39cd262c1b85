//! SSRF-hardened HTTP egress client (C2)
//!
//! Every outbound call in this crate -- the weather/golf web actions (C9),
//! OAuth token acquisition and JWKS fetch (C3) -- goes through
//! [`SafeHttpClient`]. The allowlist is supplied by the caller (course
//! catalog hosts plus `api.weather.gov`), never hardcoded here, and the
//! private-IP check runs on every call, including redirects, since an open
//! redirect is itself an SSRF bypass.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use reqwest::{Client, Method};

use crate::error::{Error, Result};

/// Cloud metadata endpoints, blocked even though they sometimes fall
/// outside the RFC1918/link-local ranges checked separately.
const METADATA_V4: Ipv4Addr = Ipv4Addr::new(169, 254, 169, 254);

const DEFAULT_TOTAL_TIMEOUT_SECS: u64 = 10;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Result of a successful egress call.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: reqwest::header::HeaderMap,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn text(&self) -> Result<String> {
        String::from_utf8(self.body.clone())
            .map_err(|e| Error::Internal(format!("response body is not valid utf-8: {e}")))
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| Error::Internal(format!("response body is not valid json: {e}")))
    }
}

/// SSRF-hardened wrapper around a single shared `reqwest::Client`.
pub struct SafeHttpClient {
    client: Client,
    /// Hosts this process is allowed to reach, beyond `localhost` in dev.
    allowlist: HashSet<String>,
    allow_localhost: bool,
}

impl SafeHttpClient {
    /// `allowlist` should be seeded from the course catalog hosts plus any
    /// fixed externally-reachable hosts (`api.weather.gov`). `allow_localhost`
    /// should only be set for local/dev deployments.
    pub fn new(allowlist: HashSet<String>, allow_localhost: bool) -> Result<Self> {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(DEFAULT_TOTAL_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
            .pool_max_idle_per_host(8)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            allowlist,
            allow_localhost,
        })
    }

    /// Pre-flight check run before every call: scheme, allowlist membership,
    /// and (after DNS resolution) private/loopback/link-local/metadata
    /// rejection.
    pub async fn check_url(&self, url: &str) -> Result<reqwest::Url> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| Error::InvalidPayload(format!("invalid URL {url}: {e}")))?;

        let host = parsed
            .host_str()
            .ok_or_else(|| Error::HostNotAllowed(format!("URL has no host: {url}")))?
            .to_string();

        if host == "localhost" || host == "127.0.0.1" {
            if !self.allow_localhost {
                return Err(Error::HostNotAllowed(format!(
                    "localhost egress disabled: {url}"
                )));
            }
        } else if parsed.scheme() != "https" {
            return Err(Error::HostNotAllowed(format!(
                "scheme must be https: {url}"
            )));
        }

        if !self.allow_localhost_host(&host) && !self.allowlist.contains(&host) {
            return Err(Error::HostNotAllowed(format!(
                "host not in allowlist: {host}"
            )));
        }

        // A dev-mode localhost hit is resolved to a loopback address by
        // definition, so it would otherwise trip the private-address check
        // just below -- it's allowed precisely because it's loopback.
        if self.allow_localhost_host(&host) {
            return Ok(parsed);
        }

        // Literal IP hosts are rejected outright: the allowlist names hosts,
        // not addresses, so only a private/metadata literal gets the more
        // specific `PrivateAddress` error -- anything else is just not a
        // permitted host.
        if let Ok(literal) = host.parse::<IpAddr>() {
            if is_blocked_ip(literal) {
                return Err(Error::PrivateAddress(format!(
                    "literal IP host resolves to a blocked range: {literal}"
                )));
            }
            return Err(Error::HostNotAllowed(format!(
                "literal IP hosts are not permitted: {host}"
            )));
        }

        let port = parsed.port_or_known_default().unwrap_or(443);
        let addrs = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|e| Error::HostNotAllowed(format!("DNS resolution failed for {host}: {e}")))?;

        let mut resolved_any = false;
        for addr in addrs {
            resolved_any = true;
            let ip = socket_addr_ip(addr);
            if is_blocked_ip(ip) {
                return Err(Error::PrivateAddress(format!(
                    "{host} resolves to a private/loopback/link-local/metadata address: {ip}"
                )));
            }
        }

        if !resolved_any {
            return Err(Error::HostNotAllowed(format!(
                "DNS resolution for {host} returned no addresses"
            )));
        }

        Ok(parsed)
    }

    fn allow_localhost_host(&self, host: &str) -> bool {
        self.allow_localhost && (host == "localhost" || host == "127.0.0.1")
    }

    /// Issue an egress request. Retries are applied only by the caller via
    /// C14's backoff helper -- this method makes exactly one attempt.
    pub async fn execute(
        &self,
        method: Method,
        url: &str,
        headers: reqwest::header::HeaderMap,
        body: Option<Vec<u8>>,
    ) -> Result<HttpResponse> {
        let checked_url = self.check_url(url).await?;

        let mut request = self.client.request(method, checked_url).headers(headers);
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request.send().await?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();

        if !(200..300).contains(&status) {
            return Err(Error::HttpStatus(status));
        }

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    pub async fn get(&self, url: &str, headers: reqwest::header::HeaderMap) -> Result<HttpResponse> {
        self.execute(Method::GET, url, headers, None).await
    }

    pub async fn post_json<T: serde::Serialize>(
        &self,
        url: &str,
        headers: reqwest::header::HeaderMap,
        body: &T,
    ) -> Result<HttpResponse> {
        let mut headers = headers;
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        let body = serde_json::to_vec(body)
            .map_err(|e| Error::Internal(format!("failed to serialize request body: {e}")))?;
        self.execute(Method::POST, url, headers, Some(body)).await
    }
}

fn socket_addr_ip(addr: SocketAddr) -> IpAddr {
    addr.ip()
}

/// RFC1918, loopback, link-local, IPv6 ULA/link-local, and cloud metadata
/// ranges are all rejected.
fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                || v4 == METADATA_V4
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || is_unique_local(v6)
                || is_unicast_link_local(v6)
                || is_ec2_metadata_v6(v6)
        }
    }
}

/// `fc00::/7`
fn is_unique_local(ip: Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xfe00) == 0xfc00
}

/// `fe80::/10`
fn is_unicast_link_local(ip: Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

/// `fd00:ec2::254`, the AWS IMDSv2 IPv6 metadata address.
fn is_ec2_metadata_v6(ip: Ipv6Addr) -> bool {
    ip.segments() == [0xfd00, 0x0ec2, 0, 0, 0, 0, 0, 0x0254]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_with_allowlist(hosts: &[&str]) -> SafeHttpClient {
        SafeHttpClient::new(hosts.iter().map(|h| h.to_string()).collect(), false).unwrap()
    }

    #[test]
    fn test_is_blocked_ip_rfc1918() {
        assert!(is_blocked_ip("10.0.0.5".parse().unwrap()));
        assert!(is_blocked_ip("172.16.0.5".parse().unwrap()));
        assert!(is_blocked_ip("192.168.1.1".parse().unwrap()));
    }

    #[test]
    fn test_is_blocked_ip_metadata() {
        assert!(is_blocked_ip("169.254.169.254".parse().unwrap()));
        assert!(is_blocked_ip("fd00:ec2::254".parse().unwrap()));
    }

    #[test]
    fn test_is_blocked_ip_loopback() {
        assert!(is_blocked_ip("127.0.0.1".parse().unwrap()));
        assert!(is_blocked_ip("::1".parse().unwrap()));
    }

    #[test]
    fn test_is_blocked_ip_public_address_allowed() {
        assert!(!is_blocked_ip("8.8.8.8".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_check_url_rejects_host_outside_allowlist() {
        let client = client_with_allowlist(&["api.weather.gov"]);
        let err = client
            .check_url("https://evil.example.com/path")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HostNotAllowed(_)));
    }

    #[tokio::test]
    async fn test_check_url_rejects_literal_private_ip() {
        let mut allowlist = HashSet::new();
        allowlist.insert("169.254.169.254".to_string());
        let client = SafeHttpClient::new(allowlist, false).unwrap();
        let err = client
            .check_url("https://169.254.169.254/latest/meta-data")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PrivateAddress(_)));
    }

    #[tokio::test]
    async fn test_check_url_rejects_non_https_scheme() {
        let client = client_with_allowlist(&["api.weather.gov"]);
        let err = client
            .check_url("http://api.weather.gov/path")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HostNotAllowed(_)));
    }
}

//! Server liveness probes.

use std::time::Duration;

use log::debug;
use url::Url;

/// Probe timeout when none is configured.
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(3);

/// Checks whether a server answers HTTP requests.
#[derive(Debug, Clone)]
pub struct HealthChecker {
    /// Bypasses proxies; used for servers on this machine
    local: reqwest::Client,
    remote: reqwest::Client,
    timeout: Duration,
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new(DEFAULT_HEALTH_TIMEOUT)
    }
}

impl HealthChecker {
    pub fn new(timeout: Duration) -> Self {
        let build = |builder: reqwest::ClientBuilder| {
            builder
                .timeout(timeout)
                .connect_timeout(timeout)
                .build()
                .unwrap_or_else(|e| {
                    debug!("[health] Falling back to default HTTP client: {}", e);
                    reqwest::Client::new()
                })
        };
        Self {
            local: build(reqwest::Client::builder().no_proxy()),
            remote: build(reqwest::Client::builder()),
            timeout,
        }
    }

    /// GET `url` and report whether it answered with a 2xx status.
    ///
    /// Refused connections, timeouts, DNS failures and error statuses all
    /// count as unreachable. Never fails.
    pub async fn check(&self, url: &Url) -> bool {
        let client = if is_loopback(url) {
            &self.local
        } else {
            &self.remote
        };
        let request = client.get(url.clone()).send();
        match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(response)) => {
                let ok = response.status().is_success();
                if !ok {
                    debug!("[health] {} answered {}", url, response.status());
                }
                ok
            }
            Ok(Err(e)) => {
                debug!("[health] {} unreachable: {}", url, e);
                false
            }
            Err(_) => {
                debug!("[health] {} timed out after {:?}", url, self.timeout);
                false
            }
        }
    }
}

fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(url::Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(url::Host::Ipv4(ip)) => ip.is_loopback(),
        Some(url::Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response per connection.
    async fn serve(status_line: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                    status_line
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        port
    }

    #[test]
    fn test_loopback_hosts() {
        assert!(is_loopback(&Url::parse("http://localhost:8888/").unwrap()));
        assert!(is_loopback(&Url::parse("http://127.0.0.1:8888/").unwrap()));
        assert!(is_loopback(&Url::parse("http://[::1]:8888/").unwrap()));
        assert!(!is_loopback(&Url::parse("https://hub.example.org/").unwrap()));
    }

    #[tokio::test]
    async fn test_dead_port_is_unreachable_within_timeout() {
        // Bind and drop to get a port nothing listens on.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let url = Url::parse(&format!("http://127.0.0.1:{}/lab", port)).unwrap();

        let start = Instant::now();
        assert!(!HealthChecker::default().check(&url).await);
        assert!(start.elapsed() <= DEFAULT_HEALTH_TIMEOUT + Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_ok_status_is_reachable() {
        let port = serve("200 OK").await;
        let url = Url::parse(&format!("http://127.0.0.1:{}/lab?token=t", port)).unwrap();
        assert!(HealthChecker::default().check(&url).await);
    }

    #[tokio::test]
    async fn test_error_status_is_unreachable() {
        let port = serve("403 Forbidden").await;
        let url = Url::parse(&format!("http://127.0.0.1:{}/lab", port)).unwrap();
        assert!(!HealthChecker::default().check(&url).await);
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let url = Url::parse(&format!("http://127.0.0.1:{}/", port)).unwrap();
        let checker = HealthChecker::new(Duration::from_millis(300));
        let start = Instant::now();
        assert!(!checker.check(&url).await);
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}

//! TCP health of the PhotoMesh Web API and Node ports.

use std::time::Duration;
use tokio::net::TcpStream;

pub const WEB_API_PORT: u16 = 8086;
pub const NODE_PORT: u16 = 8087;
pub const PORT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

pub const REMEDIATION: &str = "PhotoMesh network ports are not answering.\n\
1. From an administrator prompt reserve the URLs:\n\
   netsh http add urlacl url=http://+:8086/ user=Everyone\n\
   netsh http add urlacl url=http://+:8087/ user=Everyone\n\
2. Find what holds the ports: netstat -ano | findstr :8086  and  netstat -ano | findstr :8087\n\
3. Identify the owning process: tasklist /FI \"PID eq <pid>\"\n\
4. Close the conflicting process or restart PhotoMesh, then retry.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortStatus {
    pub label: &'static str,
    pub port: u16,
    pub open: bool,
}

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub host: String,
    pub ports: Vec<PortStatus>,
}

impl HealthReport {
    pub fn healthy(&self) -> bool {
        self.ports.iter().all(|p| p.open)
    }

    /// The fixed remediation text when any port is down.
    pub fn remediation(&self) -> Option<&'static str> {
        (!self.healthy()).then_some(REMEDIATION)
    }
}

/// True when a TCP connection to `host:port` completes within `timeout`.
/// A peer that accepts and immediately closes still counts as open.
pub async fn port_open(host: &str, port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

pub async fn network_health(host: &str) -> HealthReport {
    let (web, node) = tokio::join!(
        port_open(host, WEB_API_PORT, PORT_PROBE_TIMEOUT),
        port_open(host, NODE_PORT, PORT_PROBE_TIMEOUT),
    );
    let report = HealthReport {
        host: host.to_string(),
        ports: vec![
            PortStatus {
                label: "Web API",
                port: WEB_API_PORT,
                open: web,
            },
            PortStatus {
                label: "Node",
                port: NODE_PORT,
                open: node,
            },
        ],
    };
    for p in &report.ports {
        tracing::info!(host, port = p.port, label = p.label, open = p.open, "Port probe");
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn accept_then_close_counts_as_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((sock, _)) = listener.accept().await {
                drop(sock);
            }
        });
        assert!(port_open("127.0.0.1", port, PORT_PROBE_TIMEOUT).await);
    }

    #[tokio::test]
    async fn closed_port_is_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(!port_open("127.0.0.1", port, PORT_PROBE_TIMEOUT).await);
    }

    #[test]
    fn remediation_only_when_down() {
        let mut report = HealthReport {
            host: "127.0.0.1".into(),
            ports: vec![PortStatus {
                label: "Node",
                port: NODE_PORT,
                open: true,
            }],
        };
        assert!(report.remediation().is_none());
        report.ports[0].open = false;
        let text = report.remediation().unwrap();
        assert!(text.contains("urlacl"));
        assert!(text.contains("netstat"));
    }
}

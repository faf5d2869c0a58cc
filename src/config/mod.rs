use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

pub struct Config {
    pub server: ServerConfig,
    pub meeting: MeetingConfig,
    pub workspace: WorkspaceConfig,
    pub timeouts: TimeoutConfig,
}

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

pub struct MeetingConfig {
    /// Host account identities backing the resource pool, in slot order.
    pub hosts: Vec<String>,
    pub api_base: String,
    pub api_token: String,
}

pub struct WorkspaceConfig {
    pub api_base: String,
    pub api_token: String,
    /// Websocket base of the collaborative editor used for starter content.
    pub editor_ws_base: String,
    pub starter_code: String,
}

#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Meeting closes after its second participant never joined for this long.
    pub unused_meeting: Duration,
    /// Meeting closes after the last chat connection left for this long.
    pub idle_session: Duration,
    /// Meeting closes after reporting zero live attendees for this long.
    pub empty_meeting: Duration,
    /// Interval between admission-queue polls for a free host slot.
    pub queue_poll: Duration,
}

fn env_secs(name: &str, default: u64) -> Duration {
    Duration::from_secs(
        env::var(name)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default),
    )
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        Self {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("SERVER_PORT")
                    .unwrap_or_else(|_| "8010".to_string())
                    .parse()
                    .expect("Invalid SERVER_PORT"),
            },
            meeting: MeetingConfig {
                hosts: env::var("MEETING_HOSTS")
                    .unwrap_or_else(|_| "host1@pairup.dev".to_string())
                    .split(',')
                    .map(|h| h.trim().to_string())
                    .filter(|h| !h.is_empty())
                    .collect(),
                api_base: env::var("MEETING_API_BASE")
                    .unwrap_or_else(|_| "https://api.zoom.us/v2".to_string()),
                api_token: env::var("MEETING_API_TOKEN").unwrap_or_default(),
            },
            workspace: WorkspaceConfig {
                api_base: env::var("WORKSPACE_API_BASE")
                    .unwrap_or_else(|_| "http://127.0.0.1:8020/hub/api".to_string()),
                api_token: env::var("WORKSPACE_API_TOKEN").unwrap_or_default(),
                editor_ws_base: env::var("EDITOR_WS_BASE")
                    .unwrap_or_else(|_| "wss://rustpad.io/api/socket".to_string()),
                starter_code: env::var("STARTER_CODE")
                    .unwrap_or_else(|_| "print(\"Hello world!\")".to_string()),
            },
            timeouts: TimeoutConfig {
                unused_meeting: env_secs("UNUSED_MEETING_TIMEOUT", 120),
                idle_session: env_secs("IDLE_SESSION_TIMEOUT", 30),
                empty_meeting: env_secs("EMPTY_MEETING_TIMEOUT", 60),
                queue_poll: env_secs("QUEUE_POLL_INTERVAL", 3),
            },
        }
    }

    pub fn bind_address(&self) -> ([u8; 4], u16) {
        let ip_addr = self.parse_host_to_ipv4();
        (ip_addr.octets(), self.server.port)
    }

    fn parse_host_to_ipv4(&self) -> Ipv4Addr {
        // Try to parse as IP address first
        if let Ok(addr) = self.server.host.parse::<IpAddr>() {
            match addr {
                IpAddr::V4(ipv4) => return ipv4,
                IpAddr::V6(_) => {
                    tracing::warn!(
                        host = %self.server.host,
                        "IPv6 address provided but only IPv4 supported, using 0.0.0.0"
                    );
                    return Ipv4Addr::new(0, 0, 0, 0);
                }
            }
        }

        // Handle common hostnames
        match self.server.host.as_str() {
            "localhost" => Ipv4Addr::new(127, 0, 0, 1),
            "" | "0.0.0.0" => Ipv4Addr::new(0, 0, 0, 0),
            _ => {
                tracing::warn!(
                    host = %self.server.host,
                    "Unable to parse host as IPv4, using 0.0.0.0"
                );
                Ipv4Addr::new(0, 0, 0, 0)
            }
        }
    }
}

use clap::Parser;

/// Line-oriented chat relay server
#[derive(Parser, Clone, Debug)]
#[command(name = "chat-relay", version, about = "Line-oriented chat relay server")]
pub struct Config {
    /// Address to listen on
    #[arg(long, env = "CHAT_RELAY_BIND", default_value = "0.0.0.0")]
    pub bind: String,

    /// Port to listen on (0 picks an ephemeral port)
    #[arg(long, env = "CHAT_RELAY_PORT", default_value_t = 9999)]
    pub port: u16,

    /// Maximum number of concurrently connected clients.
    /// Further connections wait in the listen backlog until a slot frees up.
    #[arg(long, env = "CHAT_RELAY_MAX_CLIENTS", default_value_t = 1024)]
    pub max_clients: usize,

    /// Outbound lines queued per client before new ones are dropped
    #[arg(long, env = "CHAT_RELAY_OUTBOX_CAPACITY", default_value_t = 512)]
    pub outbox_capacity: usize,

    /// Emit structured JSON logs
    #[arg(long, env = "CHAT_RELAY_JSON_LOGS")]
    pub json_logs: bool,
}

impl Config {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_listen_on_9999() {
        let config = Config::parse_from(["chat-relay"]);
        assert_eq!(config.port, 9999);
        assert_eq!(config.listen_addr(), "0.0.0.0:9999");
        assert_eq!(config.max_clients, 1024);
        assert_eq!(config.outbox_capacity, 512);
        assert!(!config.json_logs);
    }

    #[test]
    fn flags_override_defaults() {
        let config = Config::parse_from([
            "chat-relay",
            "--bind",
            "127.0.0.1",
            "--port",
            "0",
            "--max-clients",
            "8",
        ]);
        assert_eq!(config.listen_addr(), "127.0.0.1:0");
        assert_eq!(config.max_clients, 8);
    }
}

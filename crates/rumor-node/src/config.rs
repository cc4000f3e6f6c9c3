use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone, Serialize)]
#[command(name = "rumor-node", about = "Gossip membership and broadcast agent")]
pub struct Config {
    /// Network family: tcp, tcp4 or tcp6.
    #[arg(long, default_value = "tcp")]
    pub net: String,

    /// Address the agent listens on and advertises to peers.
    #[arg(long, default_value = ":8424")]
    #[serde(rename = "address")]
    pub addr: String,

    /// Comma-separated bootstrap peer list (host:port).
    #[arg(long, value_delimiter = ',')]
    #[serde(skip)]
    pub peers: Vec<String>,

    /// Path to a JSON array of peer addresses; replaces --peers when set.
    #[arg(long = "peer-file")]
    #[serde(skip)]
    pub peer_file: Option<PathBuf>,

    /// Soft floor of the active view; the heal loop refills below this.
    #[arg(long = "min-aview-size", default_value_t = 3)]
    #[serde(rename = "active_view_min")]
    pub min_aview_size: usize,

    /// Hard cap of the active view.
    #[arg(long = "max-aview-size", default_value_t = 5)]
    #[serde(rename = "active_view_max")]
    pub max_aview_size: usize,

    /// Size of the passive view.
    #[arg(long = "pview-size", default_value_t = 30)]
    #[serde(rename = "passive_view")]
    pub pview_size: usize,

    /// Active-view nodes sampled into each shuffle.
    #[arg(long, default_value_t = 1)]
    pub ka: usize,

    /// Passive-view nodes sampled into each shuffle.
    #[arg(long, default_value_t = 3)]
    pub kp: usize,

    /// Active random walk length (ForwardJoin ttl bound).
    #[arg(long, default_value_t = 5)]
    pub arwl: u32,

    /// Passive random walk length (ForwardJoin passive-adoption ttl).
    #[arg(long, default_value_t = 3)]
    pub prwl: u32,

    /// Shuffle random walk length.
    #[arg(long, default_value_t = 5)]
    pub srwl: u32,

    /// User message life in milliseconds; older messages are dropped.
    #[arg(long = "msg-life", default_value_t = 5000)]
    #[serde(rename = "message_life")]
    pub msg_life: u64,

    /// Seconds between shuffle rounds.
    #[arg(long = "shuffle-duration", default_value_t = 5)]
    pub shuffle_duration: u64,

    /// Seconds between heal rounds.
    #[arg(long = "heal", default_value_t = 1)]
    #[serde(rename = "heal_duration")]
    pub heal: u64,

    /// Address of the REST server.
    #[arg(long = "rest-addr", default_value = ":9424")]
    pub rest_addr: String,

    /// Executable run with each delivered payload as its single argument.
    #[arg(long = "user-message-handler")]
    pub user_message_handler: Option<PathBuf>,

    /// Milliseconds a seen payload hash suppresses duplicates.
    #[arg(long = "purge-duration", default_value_t = 5000)]
    pub purge_duration: u64,

    /// Log verbosity; repeat for more detail. RUST_LOG overrides.
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    #[serde(skip)]
    pub verbose: u8,
}

impl Config {
    /// Resolve the peer file and validate what can be validated before the
    /// agent starts.
    pub fn finalize(mut self) -> anyhow::Result<Self> {
        if let Some(path) = &self.peer_file {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading peer file {}", path.display()))?;
            self.peers = serde_json::from_str(&raw)
                .with_context(|| format!("peer file {} is not a JSON string array", path.display()))?;
        }

        if !matches!(self.net.as_str(), "tcp" | "tcp4" | "tcp6") {
            anyhow::bail!("unsupported --net {:?}; expected tcp, tcp4 or tcp6", self.net);
        }

        if let Some(handler) = &self.user_message_handler {
            // Bare command names resolve through PATH at spawn time; explicit
            // paths must exist now.
            if handler.components().count() > 1 && !handler.is_file() {
                anyhow::bail!("user message handler {} not found", handler.display());
            }
        }

        Ok(self)
    }

    /// Bind address for the agent listener; `:port` shorthand is expanded
    /// against the configured network family.
    pub fn listen_addr(&self) -> String {
        expand_listen_addr(&self.addr, &self.net)
    }

    /// Bind address for the REST server.
    pub fn rest_listen_addr(&self) -> String {
        expand_listen_addr(&self.rest_addr, &self.net)
    }

    /// Default tracing filter derived from -v.
    pub fn log_filter(&self) -> String {
        let level = match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        format!("rumor_node={level},rumor_protocol={level}")
    }
}

fn expand_listen_addr(addr: &str, net: &str) -> String {
    match addr.strip_prefix(':') {
        Some(port) if net == "tcp6" => format!("[::]:{port}"),
        Some(port) => format!("0.0.0.0:{port}"),
        None => addr.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        Config::try_parse_from(std::iter::once("rumor-node").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_match_protocol_constants() {
        let cfg = parse(&[]);
        assert_eq!(cfg.net, "tcp");
        assert_eq!(cfg.addr, ":8424");
        assert_eq!(cfg.rest_addr, ":9424");
        assert_eq!(cfg.min_aview_size, 3);
        assert_eq!(cfg.max_aview_size, 5);
        assert_eq!(cfg.pview_size, 30);
        assert_eq!((cfg.ka, cfg.kp), (1, 3));
        assert_eq!((cfg.arwl, cfg.prwl, cfg.srwl), (5, 3, 5));
        assert_eq!(cfg.msg_life, 5000);
        assert_eq!(cfg.purge_duration, 5000);
        assert_eq!((cfg.shuffle_duration, cfg.heal), (5, 1));
    }

    #[test]
    fn peers_flag_splits_on_commas() {
        let cfg = parse(&["--peers", "a:1,b:2,c:3"]);
        assert_eq!(cfg.peers, vec!["a:1", "b:2", "c:3"]);
    }

    #[test]
    fn listen_addr_expands_port_shorthand() {
        let mut cfg = parse(&[]);
        assert_eq!(cfg.listen_addr(), "0.0.0.0:8424");
        assert_eq!(cfg.rest_listen_addr(), "0.0.0.0:9424");
        cfg.net = "tcp6".into();
        assert_eq!(cfg.listen_addr(), "[::]:8424");
        cfg.addr = "192.168.1.5:9000".into();
        assert_eq!(cfg.listen_addr(), "192.168.1.5:9000");
    }

    #[test]
    fn peer_file_replaces_peers_flag() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("rumor-peers-{}.json", std::process::id()));
        std::fs::write(&path, r#"["x:1", "y:2"]"#).unwrap();

        let mut cfg = parse(&["--peers", "a:1"]);
        cfg.peer_file = Some(path.clone());
        let cfg = cfg.finalize().unwrap();
        assert_eq!(cfg.peers, vec!["x:1", "y:2"]);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn bad_net_rejected() {
        let mut cfg = parse(&[]);
        cfg.net = "udp".into();
        assert!(cfg.finalize().is_err());
    }

    #[test]
    fn verbosity_maps_to_filter() {
        assert!(parse(&[]).log_filter().contains("info"));
        assert!(parse(&["-v"]).log_filter().contains("debug"));
        assert!(parse(&["-vv"]).log_filter().contains("trace"));
    }
}

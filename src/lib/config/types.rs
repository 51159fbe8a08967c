use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Container management backend
#[derive(Parser, Debug, Clone)]
#[command(name = "dockhand", version, about)]
pub struct Args {
    /// Address the HTTP/WebSocket server binds to
    #[arg(long, env = "DOCKHAND_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: String,

    /// Image copy tool executable
    #[arg(long, env = "DOCKHAND_COPY_TOOL", default_value = "skopeo")]
    pub copy_tool: String,

    /// Registry mirror hosts, newline or comma separated
    #[arg(long, env = "DOCKHAND_MIRROR_URLS", default_value = "")]
    pub mirror_urls: String,

    /// HTTP(S) proxy used by the proxy pull strategy
    #[arg(long, env = "DOCKHAND_PROXY_URL")]
    pub proxy_url: Option<String>,

    #[arg(long, default_value = "10")]
    pub mirror_timeout_secs: u64,

    #[arg(long, default_value = "30")]
    pub proxy_timeout_secs: u64,

    #[arg(long, default_value = "60")]
    pub direct_timeout_secs: u64,

    /// Idle time after which a binding to a dead session is dropped
    #[arg(long, default_value = "3600")]
    pub binding_ttl_secs: u64,

    #[arg(long, default_value = "300")]
    pub sweep_interval_secs: u64,
}

impl Args {
    pub fn pull_settings(&self) -> PullSettings {
        PullSettings {
            mirrors: parse_mirrors(&self.mirror_urls),
            proxy_url: self.proxy_url.clone().filter(|p| !p.trim().is_empty()),
            mirror_timeout_secs: self.mirror_timeout_secs,
            proxy_timeout_secs: self.proxy_timeout_secs,
            direct_timeout_secs: self.direct_timeout_secs,
        }
    }

    pub fn binding_ttl(&self) -> Duration {
        Duration::from_secs(self.binding_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Network settings consulted by every pull. Replaceable at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullSettings {
    pub mirrors: Vec<String>,
    pub proxy_url: Option<String>,
    pub mirror_timeout_secs: u64,
    pub proxy_timeout_secs: u64,
    pub direct_timeout_secs: u64,
}

impl Default for PullSettings {
    fn default() -> Self {
        PullSettings {
            mirrors: Vec::new(),
            proxy_url: None,
            mirror_timeout_secs: 10,
            proxy_timeout_secs: 30,
            direct_timeout_secs: 60,
        }
    }
}

/// Split a mirror list, dropping blanks, schemes and trailing slashes.
pub fn parse_mirrors(raw: &str) -> Vec<String> {
    raw.split(['\n', ','])
        .map(str::trim)
        .map(|m| {
            m.trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/')
        })
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirrors_are_split_and_cleaned() {
        let mirrors = parse_mirrors("https://mirror.a.io/\n\n  mirror.b.io ,http://c.io");
        assert_eq!(mirrors, vec!["mirror.a.io", "mirror.b.io", "c.io"]);
    }

    #[test]
    fn args_defaults_build_settings() {
        let args = Args::parse_from(["dockhand"]);
        let settings = args.pull_settings();
        assert!(settings.mirrors.is_empty());
        assert_eq!(settings.proxy_url, None);
        assert_eq!(settings, PullSettings::default());
    }

    #[test]
    fn blank_proxy_is_ignored() {
        let args = Args::parse_from(["dockhand", "--proxy-url", "  "]);
        assert_eq!(args.pull_settings().proxy_url, None);
    }
}

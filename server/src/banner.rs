//! Startup banner.

use crate::config::{Config, format_size};
use std::net::SocketAddr;

/// What the startup banner shows.
pub struct BannerConfig<'a> {
    pub version: &'a str,
    /// Bound listen address
    pub listen: SocketAddr,
    pub base_path: &'a str,
    pub max_recv_message_size: usize,
    pub max_send_message_size: Option<usize>,
    /// Registered service names
    pub services: &'a [&'a str],
}

impl<'a> BannerConfig<'a> {
    pub fn new(config: &'a Config, listen: SocketAddr, services: &'a [&'a str]) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            listen,
            base_path: &config.base_path,
            max_recv_message_size: config.max_recv_message_size,
            max_send_message_size: config.max_send_message_size,
            services,
        }
    }
}

/// Render the banner.
pub fn format_banner(config: &BannerConfig) -> String {
    let name = "rpcchan-server";
    let title = format!("{} v{}", name, config.version);

    let mut lines = vec![
        title.clone(),
        "=".repeat(title.len()),
        String::new(),
        format!("Listen:      http://{}{}", config.listen, config.base_path),
        format!(
            "Max recv:    {}",
            format_size(config.max_recv_message_size)
        ),
        format!(
            "Max send:    {}",
            config
                .max_send_message_size
                .map(format_size)
                .unwrap_or_else(|| "unlimited".to_string())
        ),
        String::new(),
        "Services:".to_string(),
    ];
    lines.extend(config.services.iter().map(|s| format!("  {}", s)));
    lines.push(String::new());

    lines.join("\n")
}

/// Print the startup banner to stdout.
pub fn print_banner(config: &BannerConfig) {
    println!("{}", format_banner(config));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_banner_contents() {
        let config = Config {
            base_path: "/rpc/".to_string(),
            ..Default::default()
        };
        let listen: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let services = ["a.Service", "b.Service"];
        let banner = format_banner(&BannerConfig::new(&config, listen, &services));

        assert!(banner.starts_with("rpcchan-server v"));
        assert!(banner.contains("http://127.0.0.1:9000/rpc/"));
        assert!(banner.contains("Max recv:    4 MB"));
        assert!(banner.contains("Max send:    unlimited"));
        assert!(banner.contains("  a.Service\n  b.Service"));
    }
}

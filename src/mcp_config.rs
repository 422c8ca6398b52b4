//! `mcp-config`: client configuration for the four query servers.
//!
//! Prints the `mcpServers` block to paste into an assistant's client config.
//! Each server is reached through a stdio-to-HTTP bridge (`mcp-remote` via
//! `npx` by default) pointing at the server's `/sse` endpoint.

use serde_json::{json, Map, Value};

use crate::config::Config;
use crate::models::MediaKind;

pub const DEFAULT_BRIDGE: &str = "npx";
pub const DEFAULT_CLIENT_HOST: &str = "localhost";

/// Build the `{ "mcpServers": { ... } }` document.
///
/// With the default `npx` bridge the args are `-y mcp-remote <url>`; any
/// other bridge command is invoked with the URL alone.
pub fn client_config(config: &Config, bridge: &str, host: &str) -> Value {
    let mut servers = Map::new();
    for kind in MediaKind::ALL {
        let url = format!("http://{}:{}/sse", host, config.servers.port_for(kind));
        let args = if bridge == DEFAULT_BRIDGE {
            json!(["-y", "mcp-remote", url])
        } else {
            json!([url])
        };
        servers.insert(
            format!("takeout-{}", kind.as_str()),
            json!({ "command": bridge, "args": args }),
        );
    }
    json!({ "mcpServers": servers })
}

pub fn run_mcp_config(config: &Config, bridge: Option<&str>, host: Option<&str>) -> anyhow::Result<()> {
    let value = client_config(
        config,
        bridge.unwrap_or(DEFAULT_BRIDGE),
        host.unwrap_or(DEFAULT_CLIENT_HOST),
    );
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_bridge_uses_mcp_remote() {
        let value = client_config(&Config::default(), DEFAULT_BRIDGE, DEFAULT_CLIENT_HOST);
        let servers = value["mcpServers"].as_object().unwrap();
        assert_eq!(servers.len(), 4);

        let images = &servers["takeout-images"];
        assert_eq!(images["command"], "npx");
        assert_eq!(
            images["args"],
            json!(["-y", "mcp-remote", "http://localhost:8082/sse"])
        );
        assert_eq!(servers["takeout-documents"]["args"][2], "http://localhost:8083/sse");
        assert_eq!(servers["takeout-audio"]["args"][2], "http://localhost:8080/sse");
        assert_eq!(servers["takeout-video"]["args"][2], "http://localhost:8081/sse");
    }

    #[test]
    fn custom_bridge_and_ports() {
        let mut config = Config::default();
        config.servers.audio_port = 9100;
        let value = client_config(&config, "mcp-remote", "10.0.0.5");
        assert_eq!(
            value["mcpServers"]["takeout-audio"],
            json!({ "command": "mcp-remote", "args": ["http://10.0.0.5:9100/sse"] })
        );
    }
}

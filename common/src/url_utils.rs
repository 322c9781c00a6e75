use anyhow::{anyhow, bail};
use std::net::SocketAddr;
use url::Url;

/// Validates a node endpoint and returns it normalised, without a trailing slash.
pub fn sanitize_url(url: &str) -> anyhow::Result<String> {
    let url = url.trim();
    if url.is_empty() {
        bail!("URL cannot be empty");
    }
    if url.contains(['\0', '\r', '\n']) {
        bail!("URL contains invalid control characters");
    }

    let parsed = Url::parse(url).map_err(|e| anyhow!("Invalid URL format: {}", e))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => bail!("Unsupported URL scheme: {}", other),
    }

    Ok(parsed.to_string().trim_end_matches('/').to_string())
}

pub fn parse_socket_addr(listen: &str) -> anyhow::Result<SocketAddr> {
    let url = if listen.starts_with("http://") || listen.starts_with("https://") {
        Url::parse(listen)?
    } else {
        Url::parse(&format!("http://{}", listen))?
    };

    let host = url
        .host_str()
        .ok_or(anyhow!("missing host in listen address"))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = url.port().unwrap_or(80);

    let addr: SocketAddr = if host.contains(':') {
        format!("[{}]:{}", host, port).parse()?
    } else {
        format!("{}:{}", host, port).parse()?
    };
    Ok(addr)
}

/// A statically configured storage node: `id=url[,capacity_bytes]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    pub id: String,
    pub endpoint: String,
    pub capacity_bytes: Option<u64>,
}

pub fn parse_node_spec(raw: &str) -> anyhow::Result<NodeSpec> {
    let (id, rest) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("node spec must look like id=url[,capacity]: {}", raw))?;
    let id = id.trim();
    if id.is_empty() {
        bail!("node id cannot be empty: {}", raw);
    }

    let (endpoint, capacity_bytes) = match rest.split_once(',') {
        Some((url, cap)) => {
            let cap: u64 = cap
                .trim()
                .parse()
                .map_err(|e| anyhow!("bad capacity in node spec {}: {}", raw, e))?;
            (url, Some(cap))
        }
        None => (rest, None),
    };

    Ok(NodeSpec {
        id: id.to_string(),
        endpoint: sanitize_url(endpoint)?,
        capacity_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_trailing_slash() {
        assert_eq!(
            sanitize_url(" http://127.0.0.1:9001/ ").unwrap(),
            "http://127.0.0.1:9001"
        );
        assert!(sanitize_url("ftp://host").is_err());
        assert!(sanitize_url("").is_err());
    }

    #[test]
    fn parses_listen_addresses() {
        assert_eq!(
            parse_socket_addr("0.0.0.0:8080").unwrap().to_string(),
            "0.0.0.0:8080"
        );
        assert_eq!(
            parse_socket_addr("http://127.0.0.1:9000").unwrap().port(),
            9000
        );
    }

    #[test]
    fn parses_node_specs() {
        let spec = parse_node_spec("node1=http://10.0.0.1:9001,1073741824").unwrap();
        assert_eq!(spec.id, "node1");
        assert_eq!(spec.endpoint, "http://10.0.0.1:9001");
        assert_eq!(spec.capacity_bytes, Some(1 << 30));

        let spec = parse_node_spec("node2=http://10.0.0.2:9001").unwrap();
        assert_eq!(spec.capacity_bytes, None);

        assert!(parse_node_spec("http://nohost").is_err());
        assert!(parse_node_spec("=http://x:1").is_err());
        assert!(parse_node_spec("n=http://x:1,lots").is_err());
    }
}

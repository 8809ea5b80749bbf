//! Server address parsing: `host`, `host:port`, `[v6]:port`, `ferry://host[:port]`

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDest {
    pub host: String,
    pub port: u16,
}

pub fn parse_server_addr(input: &str, default_port: u16) -> Option<RemoteDest> {
    let s_trim = input.trim();
    let lower = s_trim.to_ascii_lowercase();
    let mut rest = if lower.starts_with("ferry://") {
        &s_trim["ferry://".len()..]
    } else if lower.contains("://") {
        return None;
    } else {
        s_trim
    };
    if let Some((hp, _)) = rest.split_once('/') {
        rest = hp;
    }
    if rest.is_empty() {
        return None;
    }

    // Bracketed IPv6 literal
    if let Some(inner) = rest.strip_prefix('[') {
        let (host, after) = inner.split_once(']')?;
        let port = match after.strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None if after.is_empty() => default_port,
            None => return None,
        };
        return Some(RemoteDest {
            host: host.to_string(),
            port,
        });
    }

    let (host, port) = match rest.split_once(':') {
        // Bare IPv6 literal without a port
        Some(_) if rest.matches(':').count() > 1 => (rest, default_port),
        Some((h, pr)) => (h, pr.parse().ok()?),
        None => (rest, default_port),
    };
    if host.is_empty() {
        return None;
    }
    Some(RemoteDest {
        host: host.to_string(),
        port,
    })
}

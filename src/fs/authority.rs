use std::fmt;

use serde::{Deserialize, Serialize};

use crate::bytes::ByteString;
use crate::error::{FsError, Result};

/// 连接描述，每个后端按它区分文件系统实例
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Authority {
    /// 本地（或特权本地）文件系统
    Local,
    Network {
        host: String,
        port: u16,
        user: Option<String>,
    },
    /// 归档内的文件系统，`archive` 是外层文件的 URI
    Archive { archive: String },
}

impl Authority {
    pub fn network(host: impl Into<String>, port: u16, user: Option<&str>) -> Self {
        Authority::Network {
            host: host.into(),
            port,
            user: user.map(str::to_string),
        }
    }

    pub fn archive(outer_uri: impl Into<String>) -> Self {
        Authority::Archive {
            archive: outer_uri.into(),
        }
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Authority::Local => write!(f, "local"),
            Authority::Network { host, port, user } => match user {
                Some(user) => write!(f, "{}@{}:{}", user, host, port),
                None => write!(f, "{}:{}", host, port),
            },
            Authority::Archive { archive } => write!(f, "{}", archive),
        }
    }
}

/// 对路径字节做百分号编码，保留 `/`
pub fn encode_path(path: &[u8]) -> String {
    path.split(|&b| b == b'/')
        .map(|segment| urlencoding::encode_binary(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

pub fn decode_path(encoded: &str) -> ByteString {
    ByteString::from(urlencoding::decode_binary(encoded.as_bytes()).into_owned())
}

/// 从层级 URI 中拆出 `//user@host:port` 前缀
pub fn parse_network(rest: &str, default_port: u16) -> Result<(Authority, ByteString)> {
    let rest = rest
        .strip_prefix("//")
        .ok_or_else(|| FsError::InvalidPath(format!("missing authority: {}", rest)))?;
    let (authority, path) = match rest.find('/') {
        Some(index) => rest.split_at(index),
        None => (rest, "/"),
    };
    let (user, host_port) = match authority.rsplit_once('@') {
        Some((user, host_port)) => (Some(urlencoding::decode(user).map_err(|e| FsError::InvalidPath(e.to_string()))?.into_owned()), host_port),
        None => (None, authority),
    };
    let (host, port) = match host_port.rsplit_once(':') {
        Some((host, port)) => (
            host,
            port.parse::<u16>()
                .map_err(|_| FsError::InvalidPath(format!("invalid port: {}", port)))?,
        ),
        None => (host_port, default_port),
    };
    if host.is_empty() {
        return Err(FsError::InvalidPath(format!("missing host: {}", rest)));
    }
    Ok((
        Authority::Network {
            host: host.to_string(),
            port,
            user,
        },
        decode_path(path),
    ))
}

pub fn format_network(scheme: &str, authority: &Authority, path: &[u8], default_port: u16) -> String {
    let mut uri = format!("{}://", scheme);
    if let Authority::Network { host, port, user } = authority {
        if let Some(user) = user {
            uri.push_str(&urlencoding::encode(user));
            uri.push('@');
        }
        uri.push_str(host);
        if *port != default_port {
            uri.push_str(&format!(":{}", port));
        }
    }
    uri.push_str(&encode_path(path));
    uri
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_round_trip() {
        let uri_rest = "//alice@example.org:2222/home/alice/caf%C3%A9";
        let (authority, path) = parse_network(uri_rest, 22).unwrap();
        assert_eq!(authority, Authority::network("example.org", 2222, Some("alice")));
        assert_eq!(path.as_bytes(), "/home/alice/café".as_bytes());
        assert_eq!(
            format_network("sftp", &authority, &path, 22),
            format!("sftp:{}", uri_rest)
        );
    }

    #[test]
    fn test_default_port_omitted() {
        let (authority, path) = parse_network("//host", 21).unwrap();
        assert_eq!(authority, Authority::network("host", 21, None));
        assert_eq!(path.as_bytes(), b"/");
        assert_eq!(format_network("ftp", &authority, &path, 21), "ftp://host/");
    }

    #[test]
    fn test_invalid_bytes_survive_encoding() {
        let raw: &[u8] = b"/a b/\xff\xfe";
        assert_eq!(decode_path(&encode_path(raw)).as_bytes(), raw);
    }

    #[test]
    fn test_bad_port() {
        assert!(parse_network("//host:99999/x", 22).is_err());
        assert!(parse_network("host/x", 22).is_err());
    }
}

// Minimal scheme://host:port address type.
use std::fmt;
use std::str::FromStr;

#[derive(thiserror::Error, Debug)]
#[error("invalid url: {0}")]
pub struct InvalidUrl(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    scheme: String,
    host: String,
    port: u16,
}

impl Url {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            port,
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Same address with the port replaced; used to report the bound port
    /// after listening on port 0.
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            port,
            ..self.clone()
        }
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

impl FromStr for Url {
    type Err = InvalidUrl;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = input
            .split_once("://")
            .ok_or_else(|| InvalidUrl(input.into()))?;
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| InvalidUrl(input.into()))?;
        if scheme.is_empty() || host.is_empty() {
            return Err(InvalidUrl(input.into()));
        }
        let port = port.parse().map_err(|_| InvalidUrl(input.into()))?;
        Ok(Self::new(scheme, host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trip() {
        let url: Url = "tcp://127.0.0.1:9559".parse().expect("parse");
        assert_eq!(url.scheme(), "tcp");
        assert_eq!(url.host(), "127.0.0.1");
        assert_eq!(url.port(), 9559);
        assert_eq!(url.to_string(), "tcp://127.0.0.1:9559");
    }

    #[test]
    fn rejects_missing_scheme_or_port() {
        assert!("127.0.0.1:9559".parse::<Url>().is_err());
        assert!("tcp://127.0.0.1".parse::<Url>().is_err());
        assert!("tcp://127.0.0.1:notaport".parse::<Url>().is_err());
    }

    #[test]
    fn with_port_keeps_scheme_and_host() {
        let url: Url = "tcp://0.0.0.0:0".parse().expect("parse");
        let bound = url.with_port(4242);
        assert_eq!(bound.to_string(), "tcp://0.0.0.0:4242");
    }
}

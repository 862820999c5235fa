//! A client's request to verify a certificate it received from a server.
//!
//! Payload: `DER(cert) || "<hostname>|<ip>|<port>"`. The DER structure
//! delimits itself; the host field is whatever the declared length leaves
//! after it.

use std::io::Read;
use std::net::IpAddr;
use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;
use x509_parser::certificate::X509Certificate;
use x509_parser::parse_x509_certificate;

use crate::codec::{ip_octets, read_full, read_header_of, FrameError, MessageType};

/// Hostnames are stored in a 2048 character `host:port` column.
pub const MIN_HOSTNAME_LEN: usize = 4;
pub const MAX_HOSTNAME_LEN: usize = 2041;

// RFC 952 / RFC 1123 host names.
const HOSTNAME_PATTERN: &str =
    r"^(([a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9\-]*[a-zA-Z0-9])\.)*([A-Za-z]|[A-Za-z][A-Za-z0-9\-]*[A-Za-z0-9])$";

fn hostname_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(HOSTNAME_PATTERN).expect("hostname pattern compiles"))
}

#[derive(Debug, Error)]
pub enum CertVerifyRequestError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("certificate could not be decoded: {0}")]
    CertificateDecode(String),
    #[error("host field is not \"name|ip|port\": {0}")]
    MalformedHostField(String),
    #[error("invalid hostname: {0}")]
    InvalidHostname(String),
    #[error("invalid host ip: {0}")]
    InvalidHostIp(String),
    #[error("port outside 1..=65535: {0}")]
    InvalidPort(String),
}

pub fn is_valid_hostname(name: &str) -> bool {
    (MIN_HOSTNAME_LEN..=MAX_HOSTNAME_LEN).contains(&name.len()) && hostname_regex().is_match(name)
}

/// Literal addresses only; names and shorthand forms such as `127.1` fail.
pub fn parse_host_ip(s: &str) -> Result<IpAddr, CertVerifyRequestError> {
    s.parse().map_err(|_| CertVerifyRequestError::InvalidHostIp(s.to_string()))
}

pub fn parse_port(s: &str) -> Result<u16, CertVerifyRequestError> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CertVerifyRequestError::InvalidPort(s.to_string()));
    }
    let port: i64 = s.parse().map_err(|_| CertVerifyRequestError::InvalidPort(s.to_string()))?;
    if port > 0 && port < 65536 {
        Ok(port as u16)
    } else {
        Err(CertVerifyRequestError::InvalidPort(s.to_string()))
    }
}

/// Length of the DER certificate at the head of `bytes`.
fn certificate_len(bytes: &[u8]) -> Result<usize, CertVerifyRequestError> {
    match parse_x509_certificate(bytes) {
        Ok((rest, _)) => Ok(bytes.len() - rest.len()),
        Err(e) => Err(CertVerifyRequestError::CertificateDecode(e.to_string())),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertVerifyRequest {
    cert_der: Vec<u8>,
    host_name: String,
    host_ip: IpAddr,
    host_port: u16,
    /// Sender of the request, as seen by the transport.
    remote_addr: IpAddr,
    /// Local interface that received it.
    local_addr: IpAddr,
}

impl CertVerifyRequest {
    /// Validated construction; `cert_der` must be exactly one DER certificate.
    pub fn new(
        cert_der: Vec<u8>,
        host_name: String,
        host_ip: IpAddr,
        host_port: u16,
        remote_addr: IpAddr,
        local_addr: IpAddr,
    ) -> Result<Self, CertVerifyRequestError> {
        if certificate_len(&cert_der)? != cert_der.len() {
            return Err(CertVerifyRequestError::CertificateDecode("trailing bytes after certificate".into()));
        }
        if !is_valid_hostname(&host_name) {
            return Err(CertVerifyRequestError::InvalidHostname(host_name));
        }
        if host_port == 0 {
            return Err(CertVerifyRequestError::InvalidPort(host_port.to_string()));
        }
        Ok(CertVerifyRequest { cert_der, host_name, host_ip, host_port, remote_addr, local_addr })
    }

    /// Read one framed request from `reader`.
    pub fn decode<R: Read + ?Sized>(
        reader: &mut R,
        remote_addr: IpAddr,
        local_addr: IpAddr,
    ) -> Result<Self, CertVerifyRequestError> {
        let header = read_header_of(reader, MessageType::CertVerifyRequest)?;
        let mut payload = vec![0u8; header.payload_len()];
        read_full(reader, &mut payload, "certificate verify request")?;

        // The host field is the `length - 3 - der_len` bytes after the certificate.
        let der_len = certificate_len(&payload)?;
        let host_field = std::str::from_utf8(&payload[der_len..])
            .map_err(|_| CertVerifyRequestError::MalformedHostField("not valid UTF-8".into()))?;

        let parts: Vec<&str> = host_field.split('|').collect();
        let [name, ip, port] = parts.as_slice() else {
            return Err(CertVerifyRequestError::MalformedHostField(host_field.to_string()));
        };
        let host_name = name.to_string();
        if !is_valid_hostname(&host_name) {
            return Err(CertVerifyRequestError::InvalidHostname(host_name));
        }
        let host_ip = parse_host_ip(ip)?;
        let host_port = parse_port(port)?;

        payload.truncate(der_len);
        debug!(host = %host_name, %host_ip, host_port, %remote_addr, "decoded certificate verify request");
        Ok(CertVerifyRequest {
            cert_der: payload,
            host_name,
            host_ip,
            host_port,
            remote_addr,
            local_addr,
        })
    }

    pub fn write_content(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.cert_der);
        out.extend_from_slice(format!("{}|{}|{}", self.host_name, self.host_ip, self.host_port).as_bytes());
    }

    /// Deduplication key: SHA-256 over the content followed by the remote and
    /// local address octets.
    pub fn hash(&self) -> [u8; 32] {
        let mut content = Vec::with_capacity(self.cert_der.len() + self.host_name.len() + 64);
        self.write_content(&mut content);
        let mut sha = Sha256::new();
        sha.update(&content);
        sha.update(ip_octets(&self.remote_addr));
        sha.update(ip_octets(&self.local_addr));
        sha.finalize().into()
    }

    pub fn certificate(&self) -> Result<X509Certificate<'_>, CertVerifyRequestError> {
        parse_x509_certificate(&self.cert_der)
            .map(|(_, cert)| cert)
            .map_err(|e| CertVerifyRequestError::CertificateDecode(e.to_string()))
    }

    pub fn cert_der(&self) -> &[u8] {
        &self.cert_der
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn host_ip(&self) -> IpAddr {
        self.host_ip
    }

    pub fn host_port(&self) -> u16 {
        self.host_port
    }

    pub fn remote_addr(&self) -> IpAddr {
        self.remote_addr
    }

    pub fn local_addr(&self) -> IpAddr {
        self.local_addr
    }
}

//! HMAC-SHA256 over a client's public IP.
//!
//! The server hands the tag out with a PublicIpNotification; a client proves
//! the first hop of a reported trace by echoing it back.

use std::net::IpAddr;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::codec::ip_octets;

type HmacSha256 = Hmac<Sha256>;

fn keyed(key: &[u8], ip: &IpAddr) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC key size is always valid");
    mac.update(&ip_octets(ip));
    mac
}

pub fn public_ip_hmac(key: &[u8], ip: &IpAddr) -> [u8; 32] {
    let mut tag = [0u8; 32];
    tag.copy_from_slice(&keyed(key, ip).finalize().into_bytes());
    tag
}

/// Constant-time check of a client-supplied tag.
pub fn verify_public_ip_hmac(key: &[u8], ip: &IpAddr, tag: &[u8; 32]) -> bool {
    keyed(key, ip).verify_slice(tag).is_ok()
}

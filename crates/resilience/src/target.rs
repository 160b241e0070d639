//! Downstream target address validation.
//!
//! Runs before any network activity: targets must use secure transport and
//! must not point at loopback or private-network addresses, so a
//! misconfigured target cannot turn the service into an open relay.

use std::net::{Ipv4Addr, Ipv6Addr};

use url::{Host, Url};

use crate::error::TargetValidationError;

/// Validate a resolved downstream target address.
pub fn validate_target(url: &Url) -> Result<(), TargetValidationError> {
    if url.scheme() != "https" {
        return Err(TargetValidationError::InsecureTransport(url.to_string()));
    }

    match url.host() {
        None => Err(TargetValidationError::MissingHost(url.to_string())),
        Some(Host::Domain(domain)) => {
            if domain.eq_ignore_ascii_case("localhost") || domain.to_ascii_lowercase().ends_with(".localhost") {
                return Err(TargetValidationError::Loopback(url.to_string()));
            }

            Ok(())
        }
        Some(Host::Ipv4(ip)) => validate_ipv4(url, ip),
        Some(Host::Ipv6(ip)) => validate_ipv6(url, ip),
    }
}

fn validate_ipv4(url: &Url, ip: Ipv4Addr) -> Result<(), TargetValidationError> {
    if ip.is_loopback() {
        return Err(TargetValidationError::Loopback(url.to_string()));
    }

    if ip.is_private() || ip.is_link_local() || ip.is_unspecified() || ip.is_broadcast() {
        return Err(TargetValidationError::PrivateNetwork(url.to_string()));
    }

    Ok(())
}

fn validate_ipv6(url: &Url, ip: Ipv6Addr) -> Result<(), TargetValidationError> {
    if ip.is_loopback() {
        return Err(TargetValidationError::Loopback(url.to_string()));
    }

    let segments = ip.segments();
    // fc00::/7 unique local, fe80::/10 link local.
    let unique_local = (segments[0] & 0xfe00) == 0xfc00;
    let link_local = (segments[0] & 0xffc0) == 0xfe80;

    if ip.is_unspecified() || unique_local || link_local {
        return Err(TargetValidationError::PrivateNetwork(url.to_string()));
    }

    if let Some(mapped) = ip.to_ipv4_mapped() {
        return validate_ipv4(url, mapped);
    }

    Ok(())
}

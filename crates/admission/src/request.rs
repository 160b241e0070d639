//! Caller identity inputs for partitioning admission state.

use std::net::IpAddr;

/// Partition key used when no identity attribute is available at all.
const ANONYMOUS_PARTITION: &str = "anonymous";

/// Identity attributes of a request, used to derive its partition key.
#[derive(Debug, Clone, Default)]
pub struct AdmitRequest {
    /// Authenticated caller identity, when present.
    pub identity: Option<String>,
    /// Request-scoped identity attribute (for example an API key id).
    pub attribute: Option<String>,
    /// Remote IP address of the request origin.
    pub ip: Option<IpAddr>,
}

impl AdmitRequest {
    /// Create a new builder for an admission request.
    pub fn builder() -> AdmitRequestBuilder {
        AdmitRequestBuilder::default()
    }

    /// Derive the partition key: authenticated identity first, then the
    /// request-scoped attribute, then the remote IP, falling back to a
    /// literal anonymous partition.
    pub fn partition_key(&self) -> String {
        if let Some(identity) = &self.identity {
            return format!("id:{identity}");
        }

        if let Some(attribute) = &self.attribute {
            return format!("attr:{attribute}");
        }

        if let Some(ip) = self.ip {
            return format!("ip:{ip}");
        }

        ANONYMOUS_PARTITION.to_string()
    }
}

/// Builder for creating admission requests.
#[derive(Debug, Default)]
pub struct AdmitRequestBuilder {
    identity: Option<String>,
    attribute: Option<String>,
    ip: Option<IpAddr>,
}

impl AdmitRequestBuilder {
    /// Set the authenticated caller identity.
    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    /// Set the request-scoped identity attribute.
    pub fn attribute(mut self, attribute: impl Into<String>) -> Self {
        self.attribute = Some(attribute.into());
        self
    }

    /// Set the remote IP address.
    pub fn ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    /// Build the admission request.
    pub fn build(self) -> AdmitRequest {
        AdmitRequest {
            identity: self.identity,
            attribute: self.attribute,
            ip: self.ip,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_takes_priority_over_ip() {
        let request = AdmitRequest::builder()
            .identity("user-1")
            .ip("10.0.0.1".parse().unwrap())
            .build();

        assert_eq!(request.partition_key(), "id:user-1");
    }

    #[test]
    fn attribute_used_when_no_identity() {
        let request = AdmitRequest::builder()
            .attribute("key-9")
            .ip("10.0.0.1".parse().unwrap())
            .build();

        assert_eq!(request.partition_key(), "attr:key-9");
    }

    #[test]
    fn ip_used_when_nothing_else() {
        let request = AdmitRequest::builder().ip("10.0.0.1".parse().unwrap()).build();

        assert_eq!(request.partition_key(), "ip:10.0.0.1");
    }

    #[test]
    fn anonymous_fallback() {
        assert_eq!(AdmitRequest::default().partition_key(), "anonymous");
    }
}

//! Service type table
//!
//! Every worker type the supervisor can launch. Children are this same
//! executable re-invoked under the service name (optionally with the
//! `confined-` prefix when running in a user namespace).

/// The worker types of the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceType {
    Tcp,
    Udp,
    Relp,
    Store,
}

/// Network services the supervisor launches when configured
pub const NETWORK_SERVICES: [ServiceType; 3] =
    [ServiceType::Tcp, ServiceType::Udp, ServiceType::Relp];

impl ServiceType {
    /// Process name the child runs under
    pub fn name(self) -> &'static str {
        match self {
            ServiceType::Tcp => "skewer-tcp",
            ServiceType::Udp => "skewer-udp",
            ServiceType::Relp => "skewer-relp",
            ServiceType::Store => "skewer-store",
        }
    }

    /// The `protocol` value of the syslog configs this service consumes
    pub fn protocol(self) -> &'static str {
        match self {
            ServiceType::Tcp => "tcp",
            ServiceType::Udp => "udp",
            ServiceType::Relp => "relp",
            ServiceType::Store => "",
        }
    }

    /// Recognise a child invocation from its argv0
    pub fn from_process_name(name: &str) -> Option<ServiceType> {
        let name = name.strip_prefix("confined-").unwrap_or(name);
        match name {
            "skewer-tcp" => Some(ServiceType::Tcp),
            "skewer-udp" => Some(ServiceType::Udp),
            "skewer-relp" => Some(ServiceType::Relp),
            "skewer-store" => Some(ServiceType::Store),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_names_roundtrip() {
        for typ in [
            ServiceType::Tcp,
            ServiceType::Udp,
            ServiceType::Relp,
            ServiceType::Store,
        ] {
            assert_eq!(ServiceType::from_process_name(typ.name()), Some(typ));
            let confined = format!("confined-{}", typ.name());
            assert_eq!(ServiceType::from_process_name(&confined), Some(typ));
        }
        assert_eq!(ServiceType::from_process_name("skewer"), None);
        assert_eq!(ServiceType::from_process_name("bash"), None);
    }
}

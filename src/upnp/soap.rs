use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::errors::MonitorError;

pub const SERVICE_NAMESPACE: &str = "urn:schemas-upnp-org:service:WANIPConnection:1";

pub const CONTENT_TYPE: &str = "text/xml; charset=\"utf-8\"";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("TCP"),
            Protocol::Udp => f.write_str("UDP"),
        }
    }
}

impl FromStr for Protocol {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TCP" => Ok(Protocol::Tcp),
            "UDP" => Ok(Protocol::Udp),
            other => Err(MonitorError::config(format!(
                "unknown protocol '{}'",
                other
            ))
            .with_suggestion("Use TCP or UDP")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub external_port: u16,
    pub protocol: Protocol,
    pub internal_port: u16,
    pub internal_client: Ipv4Addr,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortMappingAction {
    Add(PortMapping),
    Delete { external_port: u16, protocol: Protocol },
}

impl PortMappingAction {
    pub fn name(&self) -> &'static str {
        match self {
            PortMappingAction::Add(_) => "AddPortMapping",
            PortMappingAction::Delete { .. } => "DeletePortMapping",
        }
    }

    /// Value of the `SOAPAction` header, quotes included.
    pub fn soap_action(&self) -> String {
        format!("\"{}#{}\"", SERVICE_NAMESPACE, self.name())
    }

    fn arguments(&self) -> Vec<(&'static str, String)> {
        match self {
            PortMappingAction::Add(mapping) => vec![
                ("NewRemoteHost", String::new()),
                ("NewExternalPort", mapping.external_port.to_string()),
                ("NewProtocol", mapping.protocol.to_string()),
                ("NewInternalPort", mapping.internal_port.to_string()),
                ("NewInternalClient", mapping.internal_client.to_string()),
                ("NewEnabled", "1".to_string()),
                ("NewPortMappingDescription", escape(&mapping.description)),
                // Zero leases never expire
                ("NewLeaseDuration", "0".to_string()),
            ],
            PortMappingAction::Delete { external_port, protocol } => vec![
                ("NewRemoteHost", String::new()),
                ("NewExternalPort", external_port.to_string()),
                ("NewProtocol", protocol.to_string()),
            ],
        }
    }

    /// SOAP 1.1 envelope invoking this action.
    pub fn envelope(&self) -> String {
        let arguments: String = self
            .arguments()
            .into_iter()
            .map(|(name, value)| format!("<{name}>{value}</{name}>"))
            .collect();

        format!(
            "<s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" \
             s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\">\
             <s:Body><u:{action} xmlns:u=\"{ns}\">{arguments}</u:{action}></s:Body>\
             </s:Envelope>",
            action = self.name(),
            ns = SERVICE_NAMESPACE,
            arguments = arguments
        )
    }
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add() -> PortMappingAction {
        PortMappingAction::Add(PortMapping {
            external_port: 8080,
            protocol: "tcp".parse().unwrap(),
            internal_port: 80,
            internal_client: Ipv4Addr::new(192, 168, 1, 20),
            description: "web <dev>".to_string(),
        })
    }

    #[test]
    fn test_add_envelope_argument_order() {
        let envelope = add().envelope();

        let order = [
            "<NewRemoteHost></NewRemoteHost>",
            "<NewExternalPort>8080</NewExternalPort>",
            "<NewProtocol>TCP</NewProtocol>",
            "<NewInternalPort>80</NewInternalPort>",
            "<NewInternalClient>192.168.1.20</NewInternalClient>",
            "<NewEnabled>1</NewEnabled>",
            "<NewPortMappingDescription>web &lt;dev&gt;</NewPortMappingDescription>",
            "<NewLeaseDuration>0</NewLeaseDuration>",
        ];
        let positions: Vec<usize> = order
            .iter()
            .map(|part| envelope.find(part).unwrap_or_else(|| panic!("missing {}", part)))
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));

        assert!(envelope.contains(
            "<u:AddPortMapping xmlns:u=\"urn:schemas-upnp-org:service:WANIPConnection:1\">"
        ));
        assert!(envelope.ends_with("</u:AddPortMapping></s:Body></s:Envelope>"));
    }

    #[test]
    fn test_delete_envelope() {
        let action = PortMappingAction::Delete {
            external_port: 25565,
            protocol: Protocol::Udp,
        };

        assert_eq!(
            action.soap_action(),
            "\"urn:schemas-upnp-org:service:WANIPConnection:1#DeletePortMapping\""
        );
        assert!(action.envelope().contains(
            "<NewRemoteHost></NewRemoteHost><NewExternalPort>25565</NewExternalPort><NewProtocol>UDP</NewProtocol></u:DeletePortMapping>"
        ));
    }

    #[test]
    fn test_protocol_parse() {
        assert_eq!("udp".parse::<Protocol>().unwrap(), Protocol::Udp);
        assert!("sctp".parse::<Protocol>().is_err());
    }
}

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

pub const SSDP_ADDR: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(239, 255, 255, 250), 1900));

pub const SEARCH_TARGET: &str = "urn:schemas-upnp-org:device:InternetGatewayDevice:1";

/// M-SEARCH datagram for an Internet gateway.
pub fn search_request() -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST:239.255.255.250:1900\r\n\
         ST:{}\r\n\
         MAN:\"ssdp:discover\"\r\n\
         MX:2\r\n\r\n",
        SEARCH_TARGET
    )
}

/// Value of the `LOCATION` header of an SSDP reply, matched
/// case-insensitively.
pub fn location(response: &str) -> Option<&str> {
    response.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("location") {
            let value = value.trim();
            (!value.is_empty()).then_some(value)
        } else {
            None
        }
    })
}

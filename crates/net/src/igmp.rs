//! IGMP hook points. Group membership is tracked by the interface; message
//! generation and the IGMPv1 compatibility timer are not modelled.

use crate::wire::Ipv4Header;

use std::net::Ipv4Addr;

/// Inbound IGMP messages are accepted and dropped.
pub(crate) fn process_message(iface: &str, header: &Ipv4Header, message: &[u8]) {
    tracing::trace!(
        "IGMP: {} ignoring {} byte message from {} to {}",
        iface,
        message.len(),
        header.src,
        header.dst
    );
}

/// Called when the first member joins `group` on an interface.
pub(crate) fn report_join(iface: &str, group: Ipv4Addr) {
    tracing::debug!("IGMP: {} joined {}", iface, group);
}

/// Called when the last member leaves `group` on an interface.
pub(crate) fn report_leave(iface: &str, group: Ipv4Addr) {
    tracing::debug!("IGMP: {} left {}", iface, group);
}

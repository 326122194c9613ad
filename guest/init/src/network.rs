//! Guest network configuration over ioctl and rtnetlink.
//!
//! The guest image carries no `ip` binary guarantee, so addresses and the
//! default route are programmed directly through the kernel interfaces.

use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;

use chv_core::error::{ChvError, Result};
use chv_core::network::Ipv4Cidr;
use tracing::{debug, info};

/// Bring up `lo` and `ifname`, assign `address` and route everything via `gateway`.
pub fn configure(ifname: &str, address: Ipv4Cidr, gateway: Ipv4Addr) -> Result<()> {
    info!("Bringing up loopback interface");
    set_interface_up("lo")?;

    if !interface_exists(ifname) {
        return Err(ChvError::NetworkSetup(format!(
            "interface {} not found",
            ifname
        )));
    }

    info!(ifname, ip = %address, "Assigning address");
    add_address(ifname, address)?;
    set_interface_up(ifname)?;

    info!(ifname, gateway = %gateway, "Adding default route");
    add_default_route(ifname, gateway)?;
    Ok(())
}

fn interface_exists(name: &str) -> bool {
    Path::new("/sys/class/net").join(name).exists()
}

fn os_error(what: impl std::fmt::Display) -> ChvError {
    ChvError::NetworkSetup(format!("{}: {}", what, std::io::Error::last_os_error()))
}

fn socket(domain: libc::c_int, ty: libc::c_int, protocol: libc::c_int) -> Result<OwnedFd> {
    let fd = unsafe { libc::socket(domain, ty | libc::SOCK_CLOEXEC, protocol) };
    if fd < 0 {
        return Err(os_error("socket"));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn ifreq(name: &str) -> Result<libc::ifreq> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() >= libc::IFNAMSIZ || bytes.contains(&0) {
        return Err(ChvError::NetworkSetup(format!(
            "invalid interface name {:?}",
            name
        )));
    }

    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    for (dst, src) in ifr.ifr_name.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    Ok(ifr)
}

/// Set IFF_UP via SIOCGIFFLAGS/SIOCSIFFLAGS.
fn set_interface_up(name: &str) -> Result<()> {
    let sock = socket(libc::AF_INET, libc::SOCK_DGRAM, 0)?;
    let mut ifr = ifreq(name)?;

    if unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCGIFFLAGS as _, &mut ifr) } < 0 {
        return Err(os_error(format_args!("SIOCGIFFLAGS {}", name)));
    }

    unsafe {
        ifr.ifr_ifru.ifru_flags |= libc::IFF_UP as libc::c_short;
    }

    if unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCSIFFLAGS as _, &ifr) } < 0 {
        return Err(os_error(format_args!("SIOCSIFFLAGS {}", name)));
    }

    debug!(ifname = name, "Interface up");
    Ok(())
}

/// Assign address and netmask via SIOCSIFADDR + SIOCSIFNETMASK.
fn add_address(ifname: &str, address: Ipv4Cidr) -> Result<()> {
    let sock = socket(libc::AF_INET, libc::SOCK_DGRAM, 0)?;
    let mut ifr = ifreq(ifname)?;

    set_ifru_addr(&mut ifr, address.address());
    if unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCSIFADDR as _, &ifr) } < 0 {
        return Err(os_error(format_args!(
            "SIOCSIFADDR {} {}",
            ifname,
            address.address()
        )));
    }

    set_ifru_addr(&mut ifr, address.netmask());
    if unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCSIFNETMASK as _, &ifr) } < 0 {
        return Err(os_error(format_args!(
            "SIOCSIFNETMASK {} /{}",
            ifname,
            address.prefix_len()
        )));
    }

    Ok(())
}

fn set_ifru_addr(ifr: &mut libc::ifreq, ip: Ipv4Addr) {
    let addr = sockaddr_in(ip);
    unsafe {
        std::ptr::copy_nonoverlapping(
            &addr as *const libc::sockaddr_in as *const u8,
            &mut ifr.ifr_ifru as *mut _ as *mut u8,
            std::mem::size_of::<libc::sockaddr_in>(),
        );
    }
}

fn sockaddr_in(ip: Ipv4Addr) -> libc::sockaddr_in {
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_addr.s_addr = u32::from(ip).to_be();
    addr
}

/// Add `default via gateway dev ifname` with RTM_NEWROUTE and wait for the ACK.
fn add_default_route(ifname: &str, gateway: Ipv4Addr) -> Result<()> {
    let name = std::ffi::CString::new(ifname)
        .map_err(|_| ChvError::NetworkSetup(format!("invalid interface name {:?}", ifname)))?;
    let oif = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if oif == 0 {
        return Err(os_error(format_args!("if_nametoindex {}", ifname)));
    }

    let sock = socket(libc::AF_NETLINK, libc::SOCK_RAW, libc::NETLINK_ROUTE)?;

    let mut sa: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
    sa.nl_family = libc::AF_NETLINK as libc::sa_family_t;
    if unsafe {
        libc::bind(
            sock.as_raw_fd(),
            &sa as *const libc::sockaddr_nl as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        )
    } < 0
    {
        return Err(os_error("bind netlink socket"));
    }

    let msg = route_message(gateway, oif, 1);
    let sent = unsafe { libc::send(sock.as_raw_fd(), msg.as_ptr() as *const _, msg.len(), 0) };
    if sent < 0 {
        return Err(os_error(format_args!("RTM_NEWROUTE via {}", gateway)));
    }

    let mut ack = [0u8; 512];
    let received =
        unsafe { libc::recv(sock.as_raw_fd(), ack.as_mut_ptr() as *mut _, ack.len(), 0) };
    if received < 0 {
        return Err(os_error("netlink ACK"));
    }

    parse_ack(&ack[..received as usize])
        .map_err(|e| ChvError::NetworkSetup(format!("default route via {}: {}", gateway, e)))
}

#[repr(C)]
struct RtMsg {
    rtm_family: u8,
    rtm_dst_len: u8,
    rtm_src_len: u8,
    rtm_tos: u8,
    rtm_table: u8,
    rtm_protocol: u8,
    rtm_scope: u8,
    rtm_type: u8,
    rtm_flags: u32,
}

#[repr(C)]
struct RtAttr {
    rta_len: u16,
    rta_type: u16,
}

const NLMSG_HDR_LEN: usize = std::mem::size_of::<libc::nlmsghdr>();
const RTMSG_LEN: usize = std::mem::size_of::<RtMsg>();
/// rtattr header followed by a 4-byte payload.
const RTA_U32_LEN: usize = std::mem::size_of::<RtAttr>() + 4;

/// Encode RTM_NEWROUTE for a default route with RTA_GATEWAY and RTA_OIF.
#[allow(clippy::unnecessary_cast)]
fn route_message(gateway: Ipv4Addr, oif: u32, seq: u32) -> Vec<u8> {
    let len = NLMSG_HDR_LEN + RTMSG_LEN + 2 * RTA_U32_LEN;
    let mut buf = vec![0u8; len];

    let header = libc::nlmsghdr {
        nlmsg_len: len as u32,
        nlmsg_type: libc::RTM_NEWROUTE,
        nlmsg_flags: (libc::NLM_F_REQUEST | libc::NLM_F_ACK | libc::NLM_F_CREATE | libc::NLM_F_EXCL)
            as u16,
        nlmsg_seq: seq,
        nlmsg_pid: 0,
    };
    let rtm = RtMsg {
        rtm_family: libc::AF_INET as u8,
        rtm_dst_len: 0,
        rtm_src_len: 0,
        rtm_tos: 0,
        rtm_table: libc::RT_TABLE_MAIN as u8,
        rtm_protocol: libc::RTPROT_BOOT as u8,
        rtm_scope: libc::RT_SCOPE_UNIVERSE as u8,
        rtm_type: libc::RTN_UNICAST as u8,
        rtm_flags: 0,
    };

    unsafe {
        std::ptr::write_unaligned(buf.as_mut_ptr() as *mut libc::nlmsghdr, header);
        std::ptr::write_unaligned(buf.as_mut_ptr().add(NLMSG_HDR_LEN) as *mut RtMsg, rtm);
    }

    let mut offset = NLMSG_HDR_LEN + RTMSG_LEN;
    for (rta_type, payload) in [
        (libc::RTA_GATEWAY as u16, gateway.octets()),
        (libc::RTA_OIF as u16, oif.to_ne_bytes()),
    ] {
        let attr = RtAttr {
            rta_len: RTA_U32_LEN as u16,
            rta_type,
        };
        unsafe {
            std::ptr::write_unaligned(buf.as_mut_ptr().add(offset) as *mut RtAttr, attr);
        }
        buf[offset + 4..offset + 8].copy_from_slice(&payload);
        offset += RTA_U32_LEN;
    }

    buf
}

/// Interpret the kernel's NLMSG_ERROR reply. An existing route counts as success.
fn parse_ack(buf: &[u8]) -> std::result::Result<(), std::io::Error> {
    if buf.len() < NLMSG_HDR_LEN + 4 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "short netlink reply",
        ));
    }

    let msg_type = u16::from_ne_bytes([buf[4], buf[5]]);
    if msg_type != libc::NLMSG_ERROR as u16 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unexpected netlink message type {}", msg_type),
        ));
    }

    let code = i32::from_ne_bytes([
        buf[NLMSG_HDR_LEN],
        buf[NLMSG_HDR_LEN + 1],
        buf[NLMSG_HDR_LEN + 2],
        buf[NLMSG_HDR_LEN + 3],
    ]);
    match -code {
        0 => Ok(()),
        libc::EEXIST => {
            info!("Default route already present");
            Ok(())
        }
        errno => Err(std::io::Error::from_raw_os_error(errno)),
    }
}

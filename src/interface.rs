//! 로컬 네트워크 인터페이스 조회 / 멀티캐스트 그룹 가입
//!
//! - 그룹 멤버 ID 기본값은 로컬 유니캐스트 주소에서 유도
//! - IPv4는 주소 4바이트 전체, IPv6는 마지막 4바이트를 네트워크 바이트 순서로 읽는다

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

use socket2::Socket;
use tracing::{debug, warn};

use crate::message::MemberId;
use crate::{Error, Result};

/// 네트워크 인터페이스 정보
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
    pub name: String,
    pub index: u32,
    pub is_loopback: bool,
    pub multicast: bool,
    pub addresses: Vec<IpAddr>,
}

impl NetworkInterface {
    /// 주소 체계가 같은 첫 유니캐스트 주소
    pub fn first_address(&self, v4: bool) -> Option<IpAddr> {
        self.addresses
            .iter()
            .copied()
            .find(|addr| addr.is_ipv4() == v4 && !addr.is_loopback())
    }
}

/// 로컬 인터페이스 목록
#[cfg(unix)]
pub fn interfaces() -> Result<Vec<NetworkInterface>> {
    use nix::ifaddrs::getifaddrs;
    use nix::net::if_::{if_nametoindex, InterfaceFlags};

    let mut result: Vec<NetworkInterface> = Vec::new();
    for entry in getifaddrs().map_err(std::io::Error::from)? {
        let address = entry.address.as_ref().and_then(sockaddr_to_ip);
        let position = match result.iter().position(|i| i.name == entry.interface_name) {
            Some(pos) => pos,
            None => {
                let index = if_nametoindex(entry.interface_name.as_str()).unwrap_or(0);
                result.push(NetworkInterface {
                    name: entry.interface_name.clone(),
                    index,
                    is_loopback: entry.flags.contains(InterfaceFlags::IFF_LOOPBACK),
                    multicast: entry.flags.contains(InterfaceFlags::IFF_MULTICAST),
                    addresses: Vec::new(),
                });
                result.len() - 1
            }
        };
        if let Some(address) = address {
            result[position].addresses.push(address);
        }
    }
    Ok(result)
}

#[cfg(unix)]
fn sockaddr_to_ip(addr: &nix::sys::socket::SockaddrStorage) -> Option<IpAddr> {
    if let Some(v4) = addr.as_sockaddr_in() {
        return Some(IpAddr::V4(*SocketAddrV4::from(*v4).ip()));
    }
    addr.as_sockaddr_in6().map(|v6| IpAddr::V6(*SocketAddrV6::from(*v6).ip()))
}

#[cfg(not(unix))]
pub fn interfaces() -> Result<Vec<NetworkInterface>> {
    Ok(Vec::new())
}

/// 주소에서 그룹 멤버 ID 유도
pub fn member_id_from_addr(addr: IpAddr) -> MemberId {
    match addr {
        IpAddr::V4(v4) => u32::from_be_bytes(v4.octets()),
        IpAddr::V6(v6) => {
            let o = v6.octets();
            u32::from_be_bytes([o[12], o[13], o[14], o[15]])
        }
    }
}

/// 그룹 멤버 ID 결정
///
/// 지정된 ID가 있으면 그대로, 아니면 지정 인터페이스(또는 멀티캐스트 가능한 첫
/// 비-loopback 인터페이스)의 같은 주소 체계 주소에서 유도한다.
pub fn resolve_member_id(
    fixed: Option<MemberId>,
    interface_name: Option<&str>,
    v4: bool,
) -> Result<MemberId> {
    if let Some(id) = fixed {
        return Ok(id);
    }
    let all = interfaces()?;
    let address = match interface_name {
        Some(name) => all
            .iter()
            .find(|i| i.name == name)
            .and_then(|i| i.first_address(v4)),
        None => all
            .iter()
            .filter(|i| !i.is_loopback && i.multicast)
            .find_map(|i| i.first_address(v4)),
    };
    address.map(member_id_from_addr).ok_or(Error::MemberIdUnknown)
}

/// 이름으로 찾은 인터페이스의 주소 (송신 인터페이스 지정용)
pub fn interface_address(name: &str, v4: bool) -> Option<(IpAddr, u32)> {
    let all = interfaces().ok()?;
    let intf = all.into_iter().find(|i| i.name == name)?;
    Some((intf.first_address(v4)?, intf.index))
}

/// 모든 비-loopback 인터페이스에서 멀티캐스트 그룹 가입
///
/// 실패한 인터페이스는 건너뛰고, 하나도 가입하지 못하면 기본 인터페이스로 한 번 더 시도한다.
pub fn join_multicast(socket: &Socket, group: IpAddr) -> Result<usize> {
    let mut joined = 0usize;
    for intf in interfaces()?.into_iter().filter(|i| !i.is_loopback) {
        match group {
            IpAddr::V4(group_v4) => {
                for addr in intf.addresses.iter().filter_map(|a| match a {
                    IpAddr::V4(v4) if !v4.is_loopback() => Some(*v4),
                    _ => None,
                }) {
                    match socket.join_multicast_v4(&group_v4, &addr) {
                        Ok(()) => {
                            debug!("멀티캐스트 가입: {} via {}", group_v4, addr);
                            joined += 1;
                        }
                        Err(e) => warn!("멀티캐스트 가입 실패: {} via {}: {}", group_v4, addr, e),
                    }
                }
            }
            IpAddr::V6(group_v6) => {
                let has_v6 = intf.addresses.iter().any(|a| a.is_ipv6() && !a.is_loopback());
                if has_v6 {
                    match socket.join_multicast_v6(&group_v6, intf.index) {
                        Ok(()) => {
                            debug!("멀티캐스트 가입: {} via {}", group_v6, intf.name);
                            joined += 1;
                        }
                        Err(e) => {
                            warn!("멀티캐스트 가입 실패: {} via {}: {}", group_v6, intf.name, e)
                        }
                    }
                }
            }
        }
    }

    if joined == 0 {
        match group {
            IpAddr::V4(group_v4) => socket.join_multicast_v4(&group_v4, &Ipv4Addr::UNSPECIFIED)?,
            IpAddr::V6(group_v6) => socket.join_multicast_v6(&group_v6, 0)?,
        }
        joined = 1;
    }
    Ok(joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_id_from_addr() {
        let v4: IpAddr = "192.168.1.20".parse().unwrap();
        assert_eq!(member_id_from_addr(v4), 0xC0A8_0114);

        let v6: IpAddr = "fe80::1:c0a8:0114".parse().unwrap();
        assert_eq!(member_id_from_addr(v6), 0xC0A8_0114);
    }

    #[test]
    fn test_fixed_member_id_wins() {
        assert_eq!(resolve_member_id(Some(42), Some("no-such-if"), true).unwrap(), 42);
    }

    #[test]
    fn test_unknown_interface() {
        let result = resolve_member_id(None, Some("no-such-interface-0"), true);
        assert!(matches!(result, Err(Error::MemberIdUnknown)));
    }

    #[cfg(unix)]
    #[test]
    fn test_interfaces_lists_loopback() {
        let all = interfaces().unwrap();
        let lo = all.iter().find(|i| i.is_loopback).unwrap();
        assert!(lo.index > 0);
        assert!(lo.addresses.iter().any(|a| a.is_loopback()));
        // 주소 여러 개인 인터페이스도 한 항목으로 묶인다
        let mut names: Vec<&str> = all.iter().map(|i| i.name.as_str()).collect();
        names.dedup();
        assert_eq!(names.len(), all.len());
    }
}

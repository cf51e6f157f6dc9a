//! Raw HCI access: chip identification and vendor quirks.

use libc::{AF_BLUETOOTH, SOCK_RAW};
use std::{
    io::{Error, ErrorKind, Result},
    os::unix::io::AsRawFd,
    time::Duration,
};

use crate::{
    sock::{self, OwnedFd},
    sys,
};

/// Local controller version snapshot.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct HciVersion {
    /// Bluetooth SIG company identifier of the chip manufacturer.
    pub manufacturer: u16,
    /// HCI specification version.
    pub hci_ver: u8,
    /// Manufacturer HCI revision.
    pub hci_rev: u16,
    /// LMP specification version.
    pub lmp_ver: u8,
    /// Manufacturer LMP subversion.
    pub lmp_subver: u16,
}

impl HciVersion {
    /// Whether the controller is a Broadcom chip.
    pub fn is_broadcom(&self) -> bool {
        self.manufacturer == sys::COMPANY_BROADCOM
    }

    /// Whether the controller is a Realtek chip.
    pub fn is_realtek(&self) -> bool {
        self.manufacturer == sys::COMPANY_REALTEK
    }
}

fn open_raw(dev: u16) -> Result<OwnedFd> {
    let fd = sock::socket(AF_BLUETOOTH, SOCK_RAW, sys::BTPROTO_HCI)?;
    let sa = sys::sockaddr_hci {
        hci_family: AF_BLUETOOTH as _,
        hci_dev: dev,
        hci_channel: sys::HCI_CHANNEL_RAW,
    };
    if unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &sa as *const _ as *const libc::sockaddr,
            std::mem::size_of::<sys::sockaddr_hci>() as libc::socklen_t,
        )
    } == -1
    {
        return Err(Error::last_os_error());
    }
    Ok(fd)
}

/// Query the kernel device information for the given HCI index.
pub fn dev_info(dev: u16) -> Result<sys::hci_dev_info> {
    let fd = open_raw(dev)?;
    let mut info = sys::hci_dev_info { dev_id: dev, ..Default::default() };
    if unsafe { libc::ioctl(fd.as_raw_fd(), sys::HCIGETDEVINFO, &mut info as *mut _) } == -1 {
        return Err(Error::last_os_error());
    }
    Ok(info)
}

/// Issue one HCI command and wait for its command-complete event.
fn hci_request(fd: &OwnedFd, opcode: u16, params: &[u8], timeout: Duration) -> Result<Vec<u8>> {
    let mut filter = sys::hci_filter::default();
    filter.type_mask = 1 << sys::HCI_EVENT_PKT as u32;
    filter.event_mask[(sys::EVT_CMD_COMPLETE as usize) / 32] |= 1 << (sys::EVT_CMD_COMPLETE as u32 % 32);
    filter.opcode = opcode.to_le();
    sock::setsockopt(fd, sys::SOL_HCI, sys::HCI_FILTER, &filter)?;

    let mut packet = Vec::with_capacity(4 + params.len());
    packet.push(sys::HCI_COMMAND_PKT);
    packet.extend_from_slice(&opcode.to_le_bytes());
    packet.push(params.len() as u8);
    packet.extend_from_slice(params);
    sock::write(fd.as_raw_fd(), &packet)?;

    let mut buf = [0u8; 260];
    loop {
        let mut fds = [sock::poll_in(fd.as_raw_fd())];
        match sock::poll(&mut fds, Some(timeout))? {
            0 => return Err(Error::from(ErrorKind::TimedOut)),
            _ => (),
        }
        let len = match sock::read(fd.as_raw_fd(), &mut buf) {
            Ok(len) => len,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
            Err(err) => return Err(err),
        };
        // [pkt type, event, plen, ncmd, opcode16, params...]
        if len < 7 || buf[0] != sys::HCI_EVENT_PKT || buf[1] != sys::EVT_CMD_COMPLETE {
            continue;
        }
        if u16::from_le_bytes([buf[4], buf[5]]) != opcode {
            continue;
        }
        return Ok(buf[6..len].to_vec());
    }
}

/// Read the local controller version.
pub fn local_version(dev: u16) -> Result<HciVersion> {
    let fd = open_raw(dev)?;
    let opcode = sys::hci_opcode(sys::OGF_INFO_PARAM, sys::OCF_READ_LOCAL_VERSION);
    let reply = hci_request(&fd, opcode, &[], Duration::from_millis(1000))?;
    // [status, hci_ver, hci_rev16, lmp_ver, manufacturer16, lmp_subver16]
    if reply.len() < 9 || reply[0] != 0 {
        return Err(Error::new(ErrorKind::InvalidData, "read local version failed"));
    }
    Ok(HciVersion {
        hci_ver: reply[1],
        hci_rev: u16::from_le_bytes([reply[2], reply[3]]),
        lmp_ver: reply[4],
        manufacturer: u16::from_le_bytes([reply[5], reply[6]]),
        lmp_subver: u16::from_le_bytes([reply[7], reply[8]]),
    })
}

/// Broadcom vendor quirk: route SCO over the HCI transport instead of the
/// chip's PCM pins. Without this the audio never reaches the host.
pub fn bcm_sco_route_to_transport(dev: u16) -> Result<()> {
    let fd = open_raw(dev)?;
    let read_opcode = sys::hci_opcode(sys::OGF_VENDOR_CMD, sys::OCF_BCM_READ_SCO_PCM_INT_PARAM);
    // [status, routing, clock_rate, frame_type, sync_mode, clock_mode]
    let mut params = match hci_request(&fd, read_opcode, &[], Duration::from_millis(1000)) {
        Ok(reply) if reply.len() >= 6 && reply[0] == 0 => reply[1..6].to_vec(),
        _ => vec![0, 0, 0, 0, 0],
    };
    // Routing 1 selects the transport.
    if params[0] == 1 {
        return Ok(());
    }
    params[0] = 1;
    let write_opcode = sys::hci_opcode(sys::OGF_VENDOR_CMD, sys::OCF_BCM_WRITE_SCO_PCM_INT_PARAM);
    let reply = hci_request(&fd, write_opcode, &params, Duration::from_millis(1000))?;
    if reply.first().copied().unwrap_or(1) != 0 {
        return Err(Error::new(ErrorKind::Other, "vendor SCO routing rejected"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_packing() {
        assert_eq!(
            sys::hci_opcode(sys::OGF_INFO_PARAM, sys::OCF_READ_LOCAL_VERSION),
            0x1001
        );
        assert_eq!(sys::hci_opcode(sys::OGF_VENDOR_CMD, 0x001c), 0xfc1c);
    }

    #[test]
    fn chip_identification() {
        let v = HciVersion { manufacturer: 15, hci_ver: 6, hci_rev: 0, lmp_ver: 6, lmp_subver: 0 };
        assert!(v.is_broadcom());
        assert!(!v.is_realtek());
    }
}

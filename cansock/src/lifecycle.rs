//! Socket lifecycle
//!
//! Creation and configuration of the transmit socket and of receive sockets.
//! A socket is only handed out once fully configured and bound; on any
//! failure the partly configured descriptor is closed when the `CanSocket`
//! drops.

use std::os::unix::io::AsRawFd;

use socket2::SockAddr;

use crate::config::InterfaceConfig;
use crate::error::{CanError, ErrorCode, Result};
use crate::socket::{interface_addr, Buffer, BufferNegotiation, CanSocket, CANFD_LINK_MTU};
use crate::types::CanFilter;

/// A configured transmit socket and what the kernel granted it
#[derive(Debug)]
pub(crate) struct TxSetup {
    pub socket: CanSocket,
    /// Interface address every socket of the interface binds to
    pub addr: SockAddr,
    /// Negotiated send buffer size, 0 if none was requested
    pub buf_len: usize,
}

/// A configured receive socket
#[derive(Debug)]
pub(crate) struct RxSetup {
    pub socket: CanSocket,
    /// Negotiated receive buffer size, 0 if none was requested
    pub buf_len: usize,
}

fn enable_fd_frames(socket: &CanSocket, ifname: &str) -> Result<()> {
    let mtu = socket.link_mtu(ifname).map_err(|e| {
        log::error!("{}: ioctl SIOCGIFMTU failed: {}", ifname, e);
        CanError::os(ErrorCode::Siocgifmtu, e)
    })?;
    if mtu != CANFD_LINK_MTU {
        log::error!("{}: CAN FD mtu not supported (mtu {})", ifname, mtu);
        return Err(ErrorCode::NotCanfd.into());
    }
    socket.set_fd_frames().map_err(|e| {
        log::error!("{}: setsockopt CAN_RAW_FD_FRAMES failed: {}", ifname, e);
        CanError::os(ErrorCode::SetsockoptCanfd, e)
    })
}

fn negotiate(socket: &CanSocket, ifname: &str, which: Buffer, len: usize) -> Result<usize> {
    match socket.negotiate_buffer(which, len) {
        BufferNegotiation::Negotiated { size, forced } => {
            if !forced {
                log::warn!(
                    "{}: {:?} buffer force request refused, best-effort size {}",
                    ifname,
                    which,
                    size
                );
            } else {
                log::debug!("{}: {:?} buffer size {}", ifname, which, size);
            }
            Ok(size)
        }
        BufferNegotiation::SetFailed(e) => {
            log::error!("{}: {}: {}", ifname, which.set_error(), e);
            Err(CanError::os(which.set_error(), e))
        }
        BufferNegotiation::GetFailed(e) => {
            log::error!("{}: {}: {}", ifname, which.get_error(), e);
            Err(CanError::os(which.get_error(), e))
        }
    }
}

fn install_error_mask(socket: &CanSocket, ifname: &str, mask: u32) -> Result<()> {
    if mask == 0 {
        return Ok(());
    }
    socket.set_error_mask(mask).map_err(|e| {
        log::error!("{}: setsockopt CAN_RAW_ERR_FILTER failed: {}", ifname, e);
        CanError::os(ErrorCode::SetsockoptErrFilter, e)
    })
}

/// Create, configure and bind the transmit socket
///
/// The socket admits no data frames; it is read only to surface error
/// frames for the transmissions it makes.
pub(crate) fn open_tx(ifname: &str, config: &InterfaceConfig) -> Result<TxSetup> {
    let socket = CanSocket::new().map_err(|e| {
        log::error!("{}: unable to create tx socket: {}", ifname, e);
        CanError::os(ErrorCode::TxSktCreate, e)
    })?;

    let addr = interface_addr(ifname).map_err(|e| {
        log::error!("{}: unable to get interface index: {}", ifname, e);
        CanError::os(ErrorCode::IfrIdx, e)
    })?;

    socket
        .set_nonblocking()
        .map_err(|e| CanError::os(ErrorCode::SetNonblocking, e))?;

    if config.canfd_enabled {
        enable_fd_frames(&socket, ifname)?;
    }

    socket.set_filters(&[]).map_err(|e| {
        log::error!("{}: setsockopt CAN_RAW_FILTER failed: {}", ifname, e);
        CanError::os(ErrorCode::SetsockoptRawFilter, e)
    })?;

    let buf_len = if config.tx_buf_len > 0 {
        negotiate(&socket, ifname, Buffer::Send, config.tx_buf_len)?
    } else {
        0
    };

    install_error_mask(&socket, ifname, config.error_mask)?;

    socket.bind(&addr).map_err(|e| {
        log::error!("{}: tx socket bind failed: {}", ifname, e);
        CanError::os(ErrorCode::TxSktBind, e)
    })?;

    log::debug!("{}: tx socket ready (fd {})", ifname, socket.as_raw_fd());
    Ok(TxSetup {
        socket,
        addr,
        buf_len,
    })
}

/// Create, configure and bind a receive socket admitting `filters`
pub(crate) fn open_rx(
    ifname: &str,
    addr: &SockAddr,
    config: &InterfaceConfig,
    filters: &[CanFilter],
) -> Result<RxSetup> {
    let socket = CanSocket::new().map_err(|e| {
        log::error!("{}: unable to create rx socket: {}", ifname, e);
        CanError::os(ErrorCode::RxSktCreate, e)
    })?;

    socket
        .set_nonblocking()
        .map_err(|e| CanError::os(ErrorCode::SetNonblocking, e))?;

    if config.process_header {
        socket.set_timestamping(config.hw_timestamp).map_err(|e| {
            log::info!(
                "{}: setsockopt {} not supported: {}",
                ifname,
                if config.hw_timestamp {
                    "SO_TIMESTAMPING"
                } else {
                    "SO_TIMESTAMP"
                },
                e
            );
            CanError::os(ErrorCode::SetsockoptTimestamp, e)
        })?;
        socket.set_rxq_ovfl().map_err(|e| {
            log::error!("{}: setsockopt SO_RXQ_OVFL failed: {}", ifname, e);
            CanError::os(ErrorCode::SetsockoptRxqOvfl, e)
        })?;
    }

    if config.canfd_enabled {
        enable_fd_frames(&socket, ifname)?;
    }

    let buf_len = if config.rx_buf_len > 0 {
        negotiate(&socket, ifname, Buffer::Receive, config.rx_buf_len)?
    } else {
        0
    };

    install_error_mask(&socket, ifname, config.error_mask)?;

    socket.set_filters(filters).map_err(|e| {
        log::error!("{}: setsockopt CAN_RAW_FILTER failed: {}", ifname, e);
        CanError::os(ErrorCode::SetsockoptRawFilter, e)
    })?;

    socket.bind(addr).map_err(|e| {
        log::error!("{}: rx socket bind failed: {}", ifname, e);
        CanError::os(ErrorCode::RxSktBind, e)
    })?;

    log::debug!(
        "{}: rx socket ready (fd {}, {} filters)",
        ifname,
        socket.as_raw_fd(),
        filters.len()
    );
    Ok(RxSetup { socket, buf_len })
}

//! Transmit path

use crate::dlc::normalize_len;
use crate::error::{CanError, ErrorCode, Result};
use crate::socket::CanSocket;
use crate::types::{CanFrame, CANFD_MTU, CAN_MTU};

/// Wire size and normalised copy of `frame`
///
/// FD frames have their length rounded up to the next valid DLC size and
/// occupy the full FD MTU; classic frames pass through unchanged.
pub(crate) fn prepare(frame: &CanFrame, canfd: bool) -> (CanFrame, usize) {
    let mut out = *frame;
    if canfd {
        out.set_len(normalize_len(frame.len()));
        (out, CANFD_MTU)
    } else {
        (out, CAN_MTU)
    }
}

/// Write one frame on the transmit socket
pub(crate) fn transmit(socket: &CanSocket, ifname: &str, canfd: bool, frame: &CanFrame) -> Result<()> {
    let (out, mtu) = prepare(frame, canfd);

    match socket.write_frame(&out, mtu) {
        Ok(written) if written < mtu => {
            log::error!("{}: incomplete frame written ({}/{})", ifname, written, mtu);
            Err(ErrorCode::IncompFrame.into())
        }
        Ok(_) => {
            log::trace!("{}: tx {}", ifname, out);
            Ok(())
        }
        Err(e) => match e.raw_os_error() {
            // tx queue full, expected under load
            Some(libc::ENOBUFS) | Some(libc::EAGAIN) => Err(CanError::os(ErrorCode::TxRetryLater, e)),
            _ => {
                log::error!("{}: socket write failed: {}", ifname, e);
                Err(CanError::os(ErrorCode::TxSktWr, e))
            }
        },
    }
}

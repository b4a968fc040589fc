//! Wait-set of one interface
//!
//! Tracks the transmit descriptor and owns every open receive socket.
//! Removing a receive socket hands ownership back to the caller, so closing
//! is just dropping it. The transmit socket itself lives outside the lock.

use std::collections::BTreeMap;
use std::os::unix::io::{AsRawFd, RawFd};

use crate::socket::CanSocket;

#[derive(Debug, Default)]
pub(crate) struct WaitSet {
    tx: Option<RawFd>,
    rx: BTreeMap<RawFd, CanSocket>,
}

impl WaitSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_tx(&mut self, fd: RawFd) {
        self.tx = Some(fd);
    }

    pub fn tx_fd(&self) -> Option<RawFd> {
        self.tx
    }

    /// Take ownership of an open receive socket, returning its descriptor
    pub fn insert_rx(&mut self, socket: CanSocket) -> RawFd {
        let fd = socket.as_raw_fd();
        self.rx.insert(fd, socket);
        fd
    }

    pub fn remove_rx(&mut self, fd: RawFd) -> Option<CanSocket> {
        self.rx.remove(&fd)
    }

    #[cfg(test)]
    pub fn contains_rx(&self, fd: RawFd) -> bool {
        self.rx.contains_key(&fd)
    }

    /// Receive descriptors in ascending order
    pub fn rx_fds(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.rx.keys().copied()
    }

    #[cfg(test)]
    pub fn rx_len(&self) -> usize {
        self.rx.len()
    }

    /// Largest descriptor in the set, -1 when empty
    pub fn max_fd(&self) -> RawFd {
        let rx_max = self.rx.keys().next_back().copied().unwrap_or(-1);
        rx_max.max(self.tx_fd().unwrap_or(-1))
    }

    /// Snapshot for `poll(2)`: receive sockets, then the transmit socket,
    /// then `extra` if given
    pub fn pollfds(&self, extra: Option<RawFd>) -> Vec<libc::pollfd> {
        self.rx_fds()
            .chain(self.tx_fd())
            .chain(extra)
            .map(|fd| libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            })
            .collect()
    }

    /// Drop every receive socket and forget the transmit descriptor
    pub fn clear(&mut self) {
        self.rx.clear();
        self.tx = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use socket2::{Domain, Socket, Type};

    #[test]
    fn test_empty_set() {
        let set = WaitSet::new();
        assert_eq!(set.max_fd(), -1);
        assert_eq!(set.tx_fd(), None);
        assert!(set.pollfds(None).is_empty());
        assert_eq!(set.pollfds(Some(3)).len(), 1);
    }

    #[test]
    fn test_tx_descriptor_polled_after_rx() {
        let mut set = WaitSet::new();
        set.set_tx(42);
        assert_eq!(set.max_fd(), 42);

        let fds: Vec<RawFd> = set.pollfds(Some(7)).iter().map(|p| p.fd).collect();
        assert_eq!(fds, vec![42, 7]);
    }

    #[test]
    fn test_max_fd_tracks_removal() {
        let (a, b) = Socket::pair(Domain::UNIX, Type::DGRAM, None).unwrap();
        let (a, b) = (CanSocket::from(a), CanSocket::from(b));

        let mut set = WaitSet::new();
        let fd_a = set.insert_rx(a);
        let fd_b = set.insert_rx(b);
        assert_eq!(set.max_fd(), fd_a.max(fd_b));

        let top = fd_a.max(fd_b);
        let low = fd_a.min(fd_b);
        assert!(set.remove_rx(top).is_some());
        assert_eq!(set.max_fd(), low);
        assert!(!set.contains_rx(top));

        let fds: Vec<RawFd> = set.pollfds(None).iter().map(|p| p.fd).collect();
        assert_eq!(fds, vec![low]);

        set.clear();
        assert_eq!(set.rx_len(), 0);
        assert_eq!(set.max_fd(), -1);
    }
}

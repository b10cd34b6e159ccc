//! The seam between the protocol stack and NIC drivers.

use crate::NetError;
use crate::types::MacAddr;

/// A polled Ethernet device.
///
/// The stack transmits complete frames and polls for received ones; drivers
/// deliver each pending frame to the sink callback. `poll` is callable from
/// interrupt context and from the bounded spin-poll loops.
pub trait NetDevice: Send + Sync {
    /// The device's hardware address.
    fn mac(&self) -> MacAddr;

    /// Queues one Ethernet frame for transmission.
    ///
    /// # Errors
    ///
    /// [`NetError::DeviceError`] when the TX ring is full or the link is
    /// down, [`NetError::InvalidArgument`] for oversized frames.
    fn transmit(&self, frame: &[u8]) -> Result<(), NetError>;

    /// Drains received frames, handing each to `sink`.
    fn poll(&self, sink: &mut dyn FnMut(&[u8]));
}

#[cfg(test)]
pub mod test {
    //! A scripted device for protocol tests.
    //!
    //! Captures everything the stack transmits, lets tests inject inbound
    //! frames, and optionally runs a responder closure that turns each
    //! transmitted frame into zero or more replies (a one-closure network
    //! peer). Every `poll` advances the global tick counter by one so the
    //! bounded spin-polls make progress under test.

    use alloc::boxed::Box;
    use alloc::collections::VecDeque;
    use alloc::vec::Vec;

    use muon_core::sync::SpinLock;
    use muon_core::time;

    use super::{MacAddr, NetDevice, NetError};

    /// Responder: transmitted frame in, reply frames out.
    pub type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

    struct Inner {
        sent: Vec<Vec<u8>>,
        rx: VecDeque<Vec<u8>>,
        responder: Option<Responder>,
    }

    /// The scripted test device.
    pub struct TestDevice {
        mac: MacAddr,
        inner: SpinLock<Inner>,
    }

    impl TestDevice {
        /// A device with the canonical QEMU test MAC.
        pub fn new() -> Self {
            Self {
                mac: MacAddr([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]),
                inner: SpinLock::new(Inner {
                    sent: Vec::new(),
                    rx: VecDeque::new(),
                    responder: None,
                }),
            }
        }

        /// Installs a responder that reacts to transmitted frames.
        pub fn set_responder(&self, responder: Responder) {
            self.inner.lock().responder = Some(responder);
        }

        /// Queues an inbound frame for the next poll.
        pub fn inject(&self, frame: Vec<u8>) {
            self.inner.lock().rx.push_back(frame);
        }

        /// Everything transmitted so far.
        pub fn sent(&self) -> Vec<Vec<u8>> {
            self.inner.lock().sent.clone()
        }

        /// Number of transmitted frames.
        pub fn sent_count(&self) -> usize {
            self.inner.lock().sent.len()
        }
    }

    impl NetDevice for TestDevice {
        fn mac(&self) -> MacAddr {
            self.mac
        }

        fn transmit(&self, frame: &[u8]) -> Result<(), NetError> {
            let mut inner = self.inner.lock();
            inner.sent.push(frame.to_vec());
            if let Some(mut responder) = inner.responder.take() {
                let replies = responder(frame);
                inner.responder = Some(responder);
                inner.rx.extend(replies);
            }
            Ok(())
        }

        fn poll(&self, sink: &mut dyn FnMut(&[u8])) {
            // Simulated time: one tick per poll keeps timeouts finite.
            time::advance(1);
            loop {
                let frame = self.inner.lock().rx.pop_front();
                match frame {
                    Some(f) => sink(&f),
                    None => break,
                }
            }
        }
    }
}

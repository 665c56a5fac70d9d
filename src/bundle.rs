//! Packet bundle: batch of outbound packets sent together to the same set of
//! destination addresses as one datagram.

use std::fmt;
use std::mem;
use std::net::SocketAddr;
use std::slice;

use crate::utils::GridError;

use bytes::{BufMut, Bytes, BytesMut};

use tokio::net::UdpSocket;

/// A transport packet that knows its serialized length up front.
pub trait Packet: fmt::Debug + Send {
    /// Estimated number of bytes `write()` produces.
    fn length(&self) -> usize;

    /// Serializes the packet onto `buf`.
    fn write(&self, buf: &mut BytesMut) -> Result<(), GridError>;
}

/// Opaque payload packet, serialized as a u32 length prefix then the bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    payload: Bytes,
}

impl RawPacket {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        RawPacket {
            payload: payload.into(),
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

impl Packet for RawPacket {
    fn length(&self) -> usize {
        4 + self.payload.len()
    }

    fn write(&self, buf: &mut BytesMut) -> Result<(), GridError> {
        let Ok(len) = u32::try_from(self.payload.len()) else {
            return logged_err!(
                "raw packet payload too large: {} bytes",
                self.payload.len()
            );
        };
        buf.put_u32(len);
        buf.put_slice(&self.payload);
        Ok(())
    }
}

/// Small-collection holder: nothing, a single value, or a growable list.
/// Keeps insertion order.
#[derive(Debug, Clone)]
pub enum Lite<T> {
    Empty,
    One(T),
    Many(Vec<T>),
}

impl<T> Lite<T> {
    pub fn push(&mut self, value: T) {
        *self = match mem::take(self) {
            Lite::Empty => Lite::One(value),
            Lite::One(first) => Lite::Many(vec![first, value]),
            Lite::Many(mut values) => {
                values.push(value);
                Lite::Many(values)
            }
        };
    }

    pub fn as_slice(&self) -> &[T] {
        match self {
            Lite::Empty => &[],
            Lite::One(value) => slice::from_ref(value),
            Lite::Many(values) => values,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> slice::Iter<'_, T> {
        self.as_slice().iter()
    }
}

impl<T> Default for Lite<T> {
    fn default() -> Self {
        Lite::Empty
    }
}

impl<T> IntoIterator for Lite<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        match self {
            Lite::Empty => vec![].into_iter(),
            Lite::One(value) => vec![value].into_iter(),
            Lite::Many(values) => values.into_iter(),
        }
    }
}

impl<T: PartialEq> PartialEq for Lite<T> {
    /// Element-wise, order-sensitive equality.
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl<T: Eq> Eq for Lite<T> {}

/// A batch of packets for one send to one or more destinations.
#[derive(Debug)]
pub struct PacketBundle<P> {
    packets: Lite<P>,
    addresses: Lite<SocketAddr>,

    /// Running estimate of the serialized length.
    length: usize,

    /// Cap on `length` when merging bundles.
    max_length: usize,
}

impl<P: Packet> PacketBundle<P> {
    pub fn new(max_length: usize) -> Self {
        PacketBundle {
            packets: Lite::Empty,
            addresses: Lite::Empty,
            length: 0,
            max_length,
        }
    }

    pub fn add_packet(&mut self, packet: P) {
        self.length += packet.length();
        self.packets.push(packet);
    }

    pub fn add_destination(&mut self, addr: SocketAddr) {
        self.addresses.push(addr);
    }

    pub fn add_destinations(
        &mut self,
        addrs: impl IntoIterator<Item = SocketAddr>,
    ) {
        for addr in addrs {
            self.addresses.push(addr);
        }
    }

    pub fn packets(&self) -> &[P] {
        self.packets.as_slice()
    }

    pub fn destinations(&self) -> &[SocketAddr] {
        self.addresses.as_slice()
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Moves all packets of `other` into this bundle, if both go to the same
    /// destinations in the same order and the result stays within the
    /// smaller of the two maximum lengths. Returns true if merged.
    pub fn append(&mut self, other: &mut Self) -> bool {
        // order-sensitive on purpose; cheaper than a set comparison
        if self.addresses != other.addresses {
            return false;
        }
        let total = self.length + other.length;
        if total > self.max_length.min(other.max_length) {
            return false;
        }

        for packet in mem::take(&mut other.packets) {
            self.packets.push(packet);
        }
        self.length = total;
        other.length = 0;
        true
    }

    /// Serializes all packets in order onto `buf`. Returns the number of
    /// bytes written. Writing more than the estimated length is a sizing bug
    /// upstream and is reported as an error. On any error `buf` is left as
    /// it was before the call.
    pub fn write(&self, buf: &mut BytesMut) -> Result<usize, GridError> {
        let start = buf.len();
        buf.reserve(self.length);
        for packet in self.packets.iter() {
            if let Err(e) = packet.write(buf) {
                buf.truncate(start);
                return Err(e);
            }
        }

        let written = buf.len() - start;
        if written > self.length {
            buf.truncate(start);
            return logged_err!(
                "bundle wrote {} bytes over its estimated length {}: packets {:?}, destinations {:?}",
                written,
                self.length,
                self.packets(),
                self.destinations()
            );
        }
        Ok(written)
    }

    /// Serializes the bundle once and sends it as one datagram to every
    /// destination. Returns the number of datagrams sent.
    pub async fn send(&self, socket: &UdpSocket) -> Result<usize, GridError> {
        let mut buf = BytesMut::with_capacity(self.length);
        self.write(&mut buf)?;
        for addr in self.addresses.iter() {
            socket.send_to(&buf, addr).await?;
        }
        Ok(self.addresses.len())
    }
}

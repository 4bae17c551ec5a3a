//! IPv4 fragmentation and reassembly.
//!
//! Outbound datagrams larger than the link MTU are split into fragments whose
//! payload sizes are multiples of 8 bytes. Inbound fragments are rebuilt with
//! the RFC 815 hole-descriptor algorithm, one bounded slot per datagram in
//! flight; the hole list of each slot is a small fixed-capacity array kept in
//! ascending order.

use crate::error::{NetError, Result};
use crate::stats::IpStats;
use crate::wire::{IPV4_FLAG_MF, IPV4_MIN_HEADER_LEN, Ipv4Header};

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

/// Hole descriptors per reassembly slot. Each arriving fragment adds at most
/// one net hole, so this bounds how finely a datagram may be split while in
/// flight.
pub const MAX_HOLES: usize = 16;

/// Largest IPv4 header, options included.
const MAX_HEADER_LEN: usize = 60;

/// Upper bound of the initial hole: the datagram end is not yet known.
const INFINITY: usize = usize::MAX;

/// Split `payload` into fragments that fit `mtu` and hand each one to `send`
/// together with its flags/fragment-offset field.
///
/// Stops at the first send failure; fragments already handed over are not
/// recalled.
pub fn fragment_datagram<F>(payload: &[u8], mtu: usize, mut send: F) -> Result<usize>
where
    F: FnMut(u16, &[u8]) -> Result<()>,
{
    let mut max_fragment = mtu.saturating_sub(IPV4_MIN_HEADER_LEN);
    max_fragment -= max_fragment % 8;
    if max_fragment == 0 {
        return Err(NetError::MessageTooLong);
    }

    let mut offset = 0;
    let mut count = 0;
    while offset < payload.len() {
        let remaining = payload.len() - offset;
        let (length, flags) = if remaining <= max_fragment {
            (remaining, 0)
        } else {
            (max_fragment, IPV4_FLAG_MF)
        };
        let field = flags | ((offset / 8) as u16);
        send(field, &payload[offset..offset + length])?;
        offset += length;
        count += 1;
    }
    Ok(count)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Hole {
    first: usize,
    /// Exclusive.
    last: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FragmentKey {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    identification: u16,
    protocol: u8,
}

impl FragmentKey {
    fn of(header: &Ipv4Header) -> Self {
        Self {
            src: header.src,
            dst: header.dst,
            identification: header.identification,
            protocol: header.protocol,
        }
    }
}

struct ReassemblySlot {
    key: FragmentKey,
    timestamp: Instant,
    /// Header of fragment zero once it has arrived, else of the first
    /// fragment seen.
    header: heapless::Vec<u8, MAX_HEADER_LEN>,
    /// Payload bytes, `payload.len()` being the highest offset seen so far.
    payload: Vec<u8>,
    holes: heapless::Vec<Hole, MAX_HOLES>,
}

impl ReassemblySlot {
    fn new(key: FragmentKey, header: &[u8], now: Instant) -> Option<Self> {
        let mut slot = Self {
            key,
            timestamp: now,
            header: heapless::Vec::from_slice(header).ok()?,
            payload: Vec::new(),
            holes: heapless::Vec::new(),
        };
        slot.holes
            .push(Hole {
                first: 0,
                last: INFINITY,
            })
            .ok()?;
        Some(slot)
    }

    /// Remove every hole the range `[first, last)` touches, re-inserting the
    /// uncovered remainders in place.
    fn fill(&mut self, first: usize, last: usize, more_fragments: bool) -> Result<()> {
        let mut i = 0;
        while i < self.holes.len() {
            let hole = self.holes[i];
            if first < hole.last && last > hole.first {
                self.holes.remove(i);
                if first > hole.first {
                    self.holes
                        .insert(
                            i,
                            Hole {
                                first: hole.first,
                                last: first,
                            },
                        )
                        .map_err(|_| NetError::OutOfResources)?;
                    i += 1;
                }
                if last < hole.last && more_fragments {
                    self.holes
                        .insert(
                            i,
                            Hole {
                                first: last,
                                last: hole.last,
                            },
                        )
                        .map_err(|_| NetError::OutOfResources)?;
                    i += 1;
                }
            } else {
                i += 1;
            }
        }
        Ok(())
    }

    fn into_datagram(self) -> Vec<u8> {
        let mut datagram = Vec::with_capacity(self.header.len() + self.payload.len());
        datagram.extend_from_slice(&self.header);
        datagram.extend_from_slice(&self.payload);
        let total = datagram.len().min(usize::from(u16::MAX)) as u16;
        Ipv4Header::set_total_length(&mut datagram, total);
        Ipv4Header::set_fragment(&mut datagram, 0);
        Ipv4Header::clear_checksum(&mut datagram);
        datagram
    }
}

/// Fixed pool of reassembly slots belonging to one interface.
pub struct Reassembler {
    slots: Box<[Option<ReassemblySlot>]>,
    max_datagram_size: usize,
    ttl: Duration,
}

impl Reassembler {
    pub fn new(slot_count: usize, max_datagram_size: usize, ttl: Duration) -> Self {
        Self {
            slots: (0..slot_count).map(|_| None).collect(),
            max_datagram_size,
            ttl,
        }
    }

    /// Number of datagrams currently being reassembled.
    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Drop every partially reassembled datagram.
    pub fn flush(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
    }

    /// Feed one fragment. `packet` holds the header and exactly
    /// `total_length` bytes. Returns the rebuilt datagram once the last hole
    /// closes.
    pub fn process(
        &mut self,
        header: &Ipv4Header,
        packet: &[u8],
        now: Instant,
        stats: &mut IpStats,
    ) -> Option<Vec<u8>> {
        stats.reasm_reqds += 1;

        let header_len = header.header_len();
        let data = &packet[header_len..];
        let more_fragments = header.more_fragments();

        if more_fragments && data.len() % 8 != 0 {
            tracing::debug!(
                "IPv4: dropping fragment id {} with unaligned length {}",
                header.identification,
                data.len()
            );
            stats.reasm_fails += 1;
            return None;
        }

        let data_first = usize::from(header.fragment_offset()) * 8;
        let data_last = data_first + data.len();

        let Some(index) = self.find_or_allocate(header, &packet[..header_len], now) else {
            tracing::debug!(
                "IPv4: reassembly queue full, dropping fragment id {} from {}",
                header.identification,
                header.src
            );
            stats.reasm_fails += 1;
            return None;
        };

        match self.merge(index, header, packet, data_first, data_last, more_fragments) {
            Ok(true) => {
                let slot = self.slots[index].take()?;
                stats.reasm_oks += 1;
                Some(slot.into_datagram())
            }
            Ok(false) => None,
            Err(e) => {
                tracing::debug!(
                    "IPv4: reassembly of id {} from {} failed: {}",
                    header.identification,
                    header.src,
                    e
                );
                self.slots[index] = None;
                stats.reasm_fails += 1;
                None
            }
        }
    }

    fn find_or_allocate(&mut self, header: &Ipv4Header, raw_header: &[u8], now: Instant) -> Option<usize> {
        let key = FragmentKey::of(header);
        if let Some(index) = self
            .slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.key == key))
        {
            return Some(index);
        }

        let index = self.slots.iter().position(|s| s.is_none())?;
        self.slots[index] = Some(ReassemblySlot::new(key, raw_header, now)?);
        Some(index)
    }

    /// Returns `Ok(true)` when the datagram is complete.
    fn merge(
        &mut self,
        index: usize,
        header: &Ipv4Header,
        packet: &[u8],
        data_first: usize,
        data_last: usize,
        more_fragments: bool,
    ) -> Result<bool> {
        let max = self.max_datagram_size;
        let slot = self.slots[index]
            .as_mut()
            .ok_or(NetError::InvalidState)?;
        let header_len = header.header_len();

        // The header of the rebuilt datagram always comes from fragment zero.
        if header.fragment_offset() == 0 {
            if header_len + slot.payload.len() > max {
                return Err(NetError::MessageTooLong);
            }
            slot.header =
                heapless::Vec::from_slice(&packet[..header_len]).map_err(|_| NetError::InvalidHeader)?;
        }

        if data_last > slot.payload.len() {
            if slot.header.len() + data_last > max {
                return Err(NetError::MessageTooLong);
            }
            slot.payload.resize(data_last, 0);
        }

        slot.fill(data_first, data_last, more_fragments)?;
        slot.payload[data_first..data_last].copy_from_slice(&packet[header_len..]);

        Ok(slot.holes.is_empty())
    }

    /// Evict slots older than the reassembly TTL.
    ///
    /// For each evicted datagram whose fragment zero had arrived, returns the
    /// header plus the contiguous payload prefix so the caller can quote it
    /// in an ICMP Time Exceeded message.
    pub fn expire(&mut self, now: Instant, stats: &mut IpStats) -> Vec<Vec<u8>> {
        let mut partials = Vec::new();
        for entry in self.slots.iter_mut() {
            let expired = entry
                .as_ref()
                .is_some_and(|slot| now.saturating_duration_since(slot.timestamp) >= self.ttl);
            if !expired {
                continue;
            }
            let Some(slot) = entry.take() else {
                continue;
            };
            stats.reasm_fails += 1;
            tracing::debug!(
                "IPv4: reassembly timeout for id {} from {}",
                slot.key.identification,
                slot.key.src
            );

            if let Some(hole) = slot.holes.first()
                && hole.first > 0
            {
                let prefix = hole.first.min(slot.payload.len());
                let mut partial = Vec::with_capacity(slot.header.len() + prefix);
                partial.extend_from_slice(&slot.header);
                partial.extend_from_slice(&slot.payload[..prefix]);
                partials.push(partial);
            }
        }
        partials
    }
}

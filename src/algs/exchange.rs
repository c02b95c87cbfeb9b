//! Tagged length-then-body exchanges.
//!
//! Every round runs in two steps on its own [`RoundTags`]: first a fixed
//! 8-byte length message to every peer (zero when there is nothing to say),
//! then a body message to the peers with a non-zero length. Both steps post
//! all receives before any send, and every posted handle is drained before
//! returning, even when an error has already been recorded.

use std::collections::BTreeMap;

use crate::algs::communicator::{CommTag, Communicator, RoundTags, Wait};
use crate::algs::wire::{WireLen, cast_slice, cast_slice_mut};
use crate::redist_error::RedistError;

/// Exchange body lengths with every peer in `peers` (symmetric).
/// Returns a map `peer → incoming length` once all receives have completed.
pub fn exchange_lengths<C>(
    comm: &C,
    tag: CommTag,
    outgoing: &BTreeMap<usize, Vec<u8>>,
    peers: &[usize],
) -> Result<BTreeMap<usize, usize>, RedistError>
where
    C: Communicator,
{
    let mut maybe_err = None;

    // 1) post all receives
    let mut recvs = Vec::with_capacity(peers.len());
    for &nbr in peers {
        let mut hdr = WireLen::new(0);
        match comm.irecv_result(
            nbr,
            tag.as_u16(),
            cast_slice_mut(std::slice::from_mut(&mut hdr)),
        ) {
            Ok(h) => recvs.push((nbr, h)),
            Err(e) => {
                maybe_err.get_or_insert(e);
            }
        }
    }

    // 2) post all sends; peers still expect a header after a local failure
    let mut pending_sends = Vec::with_capacity(peers.len());
    for &nbr in peers {
        let len = WireLen::new(outgoing.get(&nbr).map_or(0, Vec::len));
        match comm.isend_result(nbr, tag.as_u16(), cast_slice(std::slice::from_ref(&len))) {
            Ok(h) => pending_sends.push(h),
            Err(e) => {
                maybe_err.get_or_insert(e);
            }
        }
    }

    // 3) wait for all recvs, collect lengths (but do not early-return)
    let mut lengths = BTreeMap::new();
    for (nbr, h) in recvs {
        match h.wait() {
            Some(data) if data.len() == std::mem::size_of::<WireLen>() => {
                let mut hdr = WireLen::new(0);
                cast_slice_mut(std::slice::from_mut(&mut hdr)).copy_from_slice(&data);
                lengths.insert(nbr, hdr.get());
            }
            Some(data) => {
                maybe_err.get_or_insert(RedistError::BufferSizeMismatch {
                    neighbor: nbr,
                    expected: std::mem::size_of::<WireLen>(),
                    got: data.len(),
                });
            }
            None => {
                maybe_err.get_or_insert(RedistError::comm(
                    nbr,
                    format!("failed to receive length header (tag {:#06x})", tag.as_u16()),
                ));
            }
        }
    }

    // 4) always drain all send handles before returning
    for send in pending_sends {
        let _ = send.wait();
    }

    match maybe_err {
        Some(err) => Err(err),
        None => Ok(lengths),
    }
}

/// Exchange bodies whose lengths were agreed by [`exchange_lengths`].
pub fn exchange_bodies<C>(
    comm: &C,
    tag: CommTag,
    outgoing: &BTreeMap<usize, Vec<u8>>,
    incoming_lengths: &BTreeMap<usize, usize>,
) -> Result<BTreeMap<usize, Vec<u8>>, RedistError>
where
    C: Communicator,
{
    let mut maybe_err = None;

    let mut recvs = Vec::new();
    for (&nbr, &len) in incoming_lengths.iter().filter(|(_, l)| **l > 0) {
        let mut buffer = vec![0u8; len];
        match comm.irecv_result(nbr, tag.as_u16(), &mut buffer) {
            Ok(h) => recvs.push((nbr, len, h)),
            Err(e) => {
                maybe_err.get_or_insert(e);
            }
        }
    }

    let mut pending_sends = Vec::new();
    for (&nbr, body) in outgoing.iter().filter(|(_, b)| !b.is_empty()) {
        match comm.isend_result(nbr, tag.as_u16(), body) {
            Ok(h) => pending_sends.push(h),
            Err(e) => {
                maybe_err.get_or_insert(e);
            }
        }
    }

    let mut bodies = BTreeMap::new();
    for (nbr, len, h) in recvs {
        match h.wait() {
            Some(data) if data.len() == len => {
                bodies.insert(nbr, data);
            }
            Some(data) => {
                maybe_err.get_or_insert(RedistError::BufferSizeMismatch {
                    neighbor: nbr,
                    expected: len,
                    got: data.len(),
                });
            }
            None => {
                maybe_err.get_or_insert(RedistError::comm(
                    nbr,
                    format!("no body received (tag {:#06x})", tag.as_u16()),
                ));
            }
        }
    }

    for send in pending_sends {
        let _ = send.wait();
    }

    match maybe_err {
        Some(err) => Err(err),
        None => Ok(bodies),
    }
}

/// One full round with every other worker: lengths, then bodies.
///
/// `outgoing` maps destination rank to bytes; absent or empty entries send
/// nothing. The result maps source rank to the bytes it sent (sources that
/// sent nothing are absent).
pub fn execute_round<C>(
    comm: &C,
    tags: RoundTags,
    outgoing: &BTreeMap<usize, Vec<u8>>,
) -> Result<BTreeMap<usize, Vec<u8>>, RedistError>
where
    C: Communicator,
{
    let (me, size) = (comm.rank(), comm.size());
    if let Some(&dest) = outgoing.keys().find(|&&d| d >= size || d == me) {
        return Err(if dest == me {
            RedistError::InvalidConfig(format!("rank {me} scheduled a message to itself"))
        } else {
            RedistError::RankOutOfRange { rank: dest, size }
        });
    }
    let peers: Vec<usize> = (0..size).filter(|&r| r != me).collect();
    let lengths = exchange_lengths(comm, tags.len, outgoing, &peers)?;
    let bodies = exchange_bodies(comm, tags.body, outgoing, &lengths)?;
    log::trace!(
        "rank {me}: round {:?} sent to {} peers, received from {}",
        tags.len.round,
        outgoing.values().filter(|b| !b.is_empty()).count(),
        bodies.len()
    );
    Ok(bodies)
}

/// Point-to-point framed send (length, then body if non-empty).
pub fn send_framed<C>(comm: &C, tags: RoundTags, dest: usize, body: &[u8]) -> Result<(), RedistError>
where
    C: Communicator,
{
    let len = WireLen::new(body.len());
    let h_len = comm.isend_result(dest, tags.len.as_u16(), cast_slice(std::slice::from_ref(&len)))?;
    let h_body = if body.is_empty() {
        None
    } else {
        match comm.isend_result(dest, tags.body.as_u16(), body) {
            Ok(h) => Some(h),
            Err(e) => {
                let _ = h_len.wait();
                return Err(e);
            }
        }
    };
    let _ = h_len.wait();
    if let Some(h) = h_body {
        let _ = h.wait();
    }
    Ok(())
}

/// Point-to-point framed receive matching [`send_framed`].
pub fn recv_framed<C>(comm: &C, tags: RoundTags, src: usize) -> Result<Vec<u8>, RedistError>
where
    C: Communicator,
{
    let mut hdr = WireLen::new(0);
    let raw = comm
        .irecv_result(src, tags.len.as_u16(), cast_slice_mut(std::slice::from_mut(&mut hdr)))?
        .wait()
        .ok_or_else(|| RedistError::comm(src, "failed to receive length header"))?;
    if raw.len() != std::mem::size_of::<WireLen>() {
        return Err(RedistError::BufferSizeMismatch {
            neighbor: src,
            expected: std::mem::size_of::<WireLen>(),
            got: raw.len(),
        });
    }
    cast_slice_mut(std::slice::from_mut(&mut hdr)).copy_from_slice(&raw);
    let len = hdr.get();
    if len == 0 {
        return Ok(Vec::new());
    }
    let mut buffer = vec![0u8; len];
    let body = comm
        .irecv_result(src, tags.body.as_u16(), &mut buffer)?
        .wait()
        .ok_or_else(|| RedistError::comm(src, "failed to receive body"))?;
    if body.len() != len {
        return Err(RedistError::BufferSizeMismatch {
            neighbor: src,
            expected: len,
            got: body.len(),
        });
    }
    Ok(body)
}

/// Every worker's bytes, indexed by rank.
pub fn allgather_bytes<C>(comm: &C, tags: RoundTags, mine: Vec<u8>) -> Result<Vec<Vec<u8>>, RedistError>
where
    C: Communicator,
{
    let me = comm.rank();
    let outgoing: BTreeMap<usize, Vec<u8>> = (0..comm.size())
        .filter(|&r| r != me)
        .map(|r| (r, mine.clone()))
        .collect();
    let mut incoming = execute_round(comm, tags, &outgoing)?;
    Ok((0..comm.size())
        .map(|r| {
            if r == me {
                mine.clone()
            } else {
                incoming.remove(&r).unwrap_or_default()
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{NoComm, RayonComm, Round};

    #[test]
    fn zero_peers_ok() {
        let out = BTreeMap::new();
        let tags = RoundTags::new(0, Round::Transfer);
        assert!(execute_round(&NoComm, tags, &out).unwrap().is_empty());
        assert_eq!(allgather_bytes(&NoComm, tags, vec![1, 2]).unwrap(), vec![vec![1, 2]]);
    }

    #[test]
    fn self_message_is_rejected_before_posting() {
        let world = RayonComm::world(2);
        let mut out = BTreeMap::new();
        out.insert(0usize, vec![1u8]);
        let err = execute_round(&world[0], RoundTags::new(0, Round::Transfer), &out).unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(world[0].mailbox().pending(), 0);
    }

    #[test]
    fn framed_roundtrip_including_empty() {
        let world = RayonComm::world(2);
        let tags = RoundTags::new(4, Round::Reduce);
        send_framed(&world[0], tags, 1, b"abc").unwrap();
        send_framed(&world[0], tags, 1, b"").unwrap();
        assert_eq!(recv_framed(&world[1], tags, 0).unwrap(), b"abc");
        assert!(recv_framed(&world[1], tags, 0).unwrap().is_empty());
    }
}

//! All-to-all exchange of POD records: counts first, then payloads.
//!
//! Used by the peer-set builder. Every rank exchanges a [`WireCount`] with
//! every other rank, then payloads flow only between ranks with a non-zero
//! count. Both stages post all receives before any send and drain every send
//! handle before returning, even on error.

use bytemuck::Pod;

use crate::algs::communicator::{CommTag, Communicator, Wait};
use crate::algs::wire::{WireCount, cast_slice, cast_slice_mut, decode_records};
use crate::scatter_error::ScatterError;

/// Number of tags consumed by one call of [`exchange_records`].
pub const EXCHANGE_TAGS: u16 = 2;

/// Exchange the number of records each rank will send to each other rank.
///
/// `counts[p]` is what this rank sends to `p`; the result holds what `p`
/// sends here. The caller's own slot is copied through.
pub fn exchange_counts<C: Communicator>(
    comm: &C,
    tag: CommTag,
    counts: &[usize],
) -> Result<Vec<usize>, ScatterError> {
    let (me, n) = (comm.rank(), comm.size());
    if counts.len() != n {
        return Err(ScatterError::size("exchange counts", n, counts.len()));
    }

    // 1) post all receives
    let mut recvs = Vec::with_capacity(n.saturating_sub(1));
    for peer in (0..n).filter(|&p| p != me) {
        let mut cnt = WireCount::new(0);
        let h = comm.irecv(
            peer,
            tag.as_u16(),
            cast_slice_mut(std::slice::from_mut(&mut cnt)),
        );
        recvs.push((peer, h));
    }

    // 2) post all sends
    let mut pending_sends = Vec::with_capacity(n.saturating_sub(1));
    for peer in (0..n).filter(|&p| p != me) {
        let count = WireCount::new(counts[peer]);
        pending_sends.push(comm.isend(
            peer,
            tag.as_u16(),
            cast_slice(std::slice::from_ref(&count)),
        ));
    }

    // 3) wait for all recvs (but do not early-return)
    let mut incoming = vec![0usize; n];
    incoming[me] = counts[me];
    let mut maybe_err = None;
    for (peer, h) in recvs {
        match h.wait() {
            Some(data) if data.len() == std::mem::size_of::<WireCount>() => {
                let mut cnt = WireCount::new(0);
                cast_slice_mut(std::slice::from_mut(&mut cnt)).copy_from_slice(&data);
                incoming[peer] = cnt.get();
            }
            Some(data) if maybe_err.is_none() => {
                maybe_err = Some(ScatterError::comm(
                    peer,
                    format!(
                        "expected {} bytes for count header, got {}",
                        std::mem::size_of::<WireCount>(),
                        data.len()
                    ),
                ));
            }
            None if maybe_err.is_none() => {
                maybe_err = Some(ScatterError::comm(
                    peer,
                    format!("failed to receive count from rank {peer}"),
                ));
            }
            _ => {}
        }
    }

    // 4) always drain sends
    for send in pending_sends {
        let _ = send.wait();
    }

    match maybe_err {
        Some(err) => Err(err),
        None => Ok(incoming),
    }
}

/// Send `outgoing[p]` to every rank `p` and collect what every rank sent here.
///
/// Consumes tags `tag` and `tag.offset(1)`. `result[me]` is `outgoing[me]`.
pub fn exchange_records<C: Communicator, R: Pod>(
    comm: &C,
    tag: CommTag,
    outgoing: &[Vec<R>],
) -> Result<Vec<Vec<R>>, ScatterError> {
    let (me, n) = (comm.rank(), comm.size());
    let counts: Vec<usize> = outgoing.iter().map(Vec::len).collect();
    let incoming_counts = exchange_counts(comm, tag, &counts)?;
    let data_tag = tag.offset(1).as_u16();
    let rec = std::mem::size_of::<R>();

    let mut recvs = Vec::new();
    for peer in (0..n).filter(|&p| p != me && incoming_counts[p] > 0) {
        let mut buf = vec![0u8; incoming_counts[peer] * rec];
        let h = comm.irecv(peer, data_tag, &mut buf);
        recvs.push((peer, h));
    }

    let mut pending_sends = Vec::new();
    for peer in (0..n).filter(|&p| p != me && !outgoing[p].is_empty()) {
        pending_sends.push(comm.isend(peer, data_tag, cast_slice(&outgoing[peer])));
    }

    let mut incoming: Vec<Vec<R>> = vec![Vec::new(); n];
    incoming[me] = outgoing[me].clone();
    let mut maybe_err = None;
    for (peer, h) in recvs {
        let expected = incoming_counts[peer] * rec;
        match h.wait() {
            Some(data) if data.len() == expected => match decode_records::<R>(&data) {
                Ok(records) => incoming[peer] = records,
                Err(msg) => {
                    if maybe_err.is_none() {
                        maybe_err = Some(ScatterError::comm(peer, msg));
                    }
                }
            },
            Some(data) if maybe_err.is_none() => {
                maybe_err = Some(ScatterError::comm(
                    peer,
                    format!("expected {expected} bytes, got {}", data.len()),
                ));
            }
            None if maybe_err.is_none() => {
                maybe_err = Some(ScatterError::comm(
                    peer,
                    format!("failed to receive records from rank {peer}"),
                ));
            }
            _ => {}
        }
    }

    for send in pending_sends {
        let _ = send.wait();
    }

    match maybe_err {
        Some(err) => Err(err),
        None => Ok(incoming),
    }
}

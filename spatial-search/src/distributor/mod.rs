//! Personalized all-to-all exchanges of variable sized data between the ranks of a process group.
//!
//! Every rank knows how many items it sends to which rank, but not how many items it receives.
//! [Distributor::create_plan] learns the receive counts through one round of metadata exchange and
//! the resulting [Plan] drives any number of [Distributor::exchange] calls with the same pattern.
//! Both operations are collectives: every rank of the group must call them in the same order.

mod local;
#[cfg(feature = "mpi")]
mod mpi_transport;

pub use local::*;
#[cfg(feature = "mpi")]
pub use mpi_transport::*;

use log::{debug, error, trace};
use serde::{de::DeserializeOwned, Serialize};

use crate::{Error, Result};

/// The collective message passing of a process group.
pub trait Transport {
    /// Returns the rank of the calling process within the group.
    fn rank(&self) -> usize;

    /// Returns the number of processes in the group.
    fn size(&self) -> usize;

    /// Sends `send_counts[r]` to every rank r and returns the counts received from every rank,
    /// ordered by source rank.
    ///
    /// # Arguments
    /// * `send_counts` - One count per rank of the group.
    fn all_to_all_counts(&self, send_counts: &[u64]) -> Result<Vec<u64>>;

    /// Sends contiguous chunks of bytes to every rank and receives the chunks of every rank.
    /// Returns the number of received bytes.
    ///
    /// # Arguments
    /// * `send` - The chunks ordered by ascending destination rank.
    /// * `send_counts` - The chunk size in bytes per destination rank.
    /// * `recv` - Receives the chunks ordered by ascending source rank.
    /// * `recv_counts` - The expected chunk size in bytes per source rank.
    fn all_to_all_bytes(
        &self,
        send: &[u8],
        send_counts: &[usize],
        recv: &mut [u8],
        recv_counts: &[usize],
    ) -> Result<usize>;
}

impl<T: Transport + ?Sized> Transport for &T {
    #[inline]
    fn rank(&self) -> usize {
        (**self).rank()
    }

    #[inline]
    fn size(&self) -> usize {
        (**self).size()
    }

    #[inline]
    fn all_to_all_counts(&self, send_counts: &[u64]) -> Result<Vec<u64>> {
        (**self).all_to_all_counts(send_counts)
    }

    #[inline]
    fn all_to_all_bytes(
        &self,
        send: &[u8],
        send_counts: &[usize],
        recv: &mut [u8],
        recv_counts: &[usize],
    ) -> Result<usize> {
        (**self).all_to_all_bytes(send, send_counts, recv, recv_counts)
    }
}

/// The communication plan of a rank, i.e., how many items flow to and from every rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    /// The number of items sent to every rank.
    lengths_to: Vec<usize>,

    /// The number of items received from every rank.
    lengths_from: Vec<usize>,

    /// The item indices grouped by ascending destination rank, stable within a destination.
    send_order: Vec<usize>,

    /// True if the items already are grouped by ascending destination rank.
    is_grouped: bool,

    total_receive_length: usize,
}

impl Plan {
    /// Returns the number of items sent to every rank.
    #[inline]
    pub fn lengths_to(&self) -> &[usize] {
        &self.lengths_to
    }

    /// Returns the number of items received from every rank.
    #[inline]
    pub fn lengths_from(&self) -> &[usize] {
        &self.lengths_from
    }

    /// Returns the ranks that receive at least one item, ascending.
    pub fn procs_to(&self) -> Vec<usize> {
        nonzero_ranks(&self.lengths_to)
    }

    /// Returns the ranks that send at least one item, ascending.
    pub fn procs_from(&self) -> Vec<usize> {
        nonzero_ranks(&self.lengths_from)
    }

    /// Returns the number of ranks this rank sends items to, itself included.
    #[inline]
    pub fn num_sends(&self) -> usize {
        self.lengths_to.iter().filter(|&&l| l > 0).count()
    }

    /// Returns the number of ranks this rank receives items from, itself included.
    #[inline]
    pub fn num_receives(&self) -> usize {
        self.lengths_from.iter().filter(|&&l| l > 0).count()
    }

    /// Returns the total number of items sent.
    #[inline]
    pub fn total_send_length(&self) -> usize {
        self.send_order.len()
    }

    /// Returns the total number of items received.
    #[inline]
    pub fn total_receive_length(&self) -> usize {
        debug_assert_eq!(
            self.total_receive_length,
            self.lengths_from.iter().sum::<usize>()
        );

        self.total_receive_length
    }

    /// Returns the size of the receive buffer in bytes for the given item size.
    #[inline]
    pub fn receive_buffer_size(&self, item_size: usize) -> usize {
        self.total_receive_length() * item_size
    }
}

fn nonzero_ranks(lengths: &[usize]) -> Vec<usize> {
    lengths
        .iter()
        .enumerate()
        .filter(|(_, &l)| l > 0)
        .map(|(r, _)| r)
        .collect()
}

/// Performs the personalized all-to-all exchanges over the given transport.
pub struct Distributor<T: Transport> {
    transport: T,
}

impl<T: Transport> Distributor<T> {
    /// Creates a new distributor over the given transport.
    ///
    /// # Arguments
    /// * `transport` - The transport of the process group.
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Returns the underlying transport.
    #[inline]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Creates the communication plan for sending item i to `destination_ranks[i]`.
    /// Collective: every rank of the group must call it, even without items to send.
    ///
    /// # Arguments
    /// * `destination_ranks` - The destination rank of every item.
    pub fn create_plan(&self, destination_ranks: &[usize]) -> Result<Plan> {
        let size = self.transport.size();

        // validate before communicating anything
        if let Some(&rank) = destination_ranks.iter().find(|&&r| r >= size) {
            error!(
                "Rank {}: invalid destination rank {} for a group of size {}",
                self.transport.rank(),
                rank,
                size
            );
            return Err(Error::InvalidRank { rank, size });
        }

        let mut lengths_to = vec![0usize; size];
        for &r in destination_ranks.iter() {
            lengths_to[r] += 1;
        }

        // counting sort of the items by their destination
        let mut offsets: Vec<usize> = lengths_to
            .iter()
            .scan(0, |acc, &l| {
                let offset = *acc;
                *acc += l;
                Some(offset)
            })
            .collect();
        let mut send_order = vec![0usize; destination_ranks.len()];
        for (i, &r) in destination_ranks.iter().enumerate() {
            send_order[offsets[r]] = i;
            offsets[r] += 1;
        }
        let is_grouped = destination_ranks.windows(2).all(|w| w[0] <= w[1]);

        let counts: Vec<u64> = lengths_to.iter().map(|&l| l as u64).collect();
        let received = self.transport.all_to_all_counts(&counts)?;
        if received.len() != size {
            error!("Received {} counts from {} ranks", received.len(), size);
            return Err(Error::Communication(format!(
                "expected {} receive counts, got {}",
                size,
                received.len()
            )));
        }

        let lengths_from: Vec<usize> = received.into_iter().map(|c| c as usize).collect();
        let total_receive_length = lengths_from.iter().sum();

        debug!(
            "Rank {}: plan sends {} items to {:?}, receives {} items",
            self.transport.rank(),
            send_order.len(),
            lengths_to,
            total_receive_length
        );

        Ok(Plan {
            lengths_to,
            lengths_from,
            send_order,
            is_grouped,
            total_receive_length,
        })
    }

    /// Sends the items of fixed size to their destinations and receives the items of the other
    /// ranks. Collective: every rank of the group must call it with its own plan.
    ///
    /// # Arguments
    /// * `plan` - The plan created from the destinations of the items.
    /// * `send` - The items in the order of the destinations used to create the plan.
    /// * `item_size` - The size of a single item in bytes.
    /// * `recv` - Receives the items grouped by ascending source rank. Must have the size
    ///   [Plan::receive_buffer_size].
    pub fn exchange(
        &self,
        plan: &Plan,
        send: &[u8],
        item_size: usize,
        recv: &mut [u8],
    ) -> Result<()> {
        self.check_plan(plan)?;
        check_size(plan.total_send_length() * item_size, send.len())?;
        check_size(plan.receive_buffer_size(item_size), recv.len())?;

        let packed;
        let send = if plan.is_grouped {
            send
        } else {
            packed = pack_items(send, item_size, &plan.send_order);
            packed.as_slice()
        };

        let send_counts: Vec<usize> = plan.lengths_to.iter().map(|l| l * item_size).collect();
        let recv_counts: Vec<usize> = plan.lengths_from.iter().map(|l| l * item_size).collect();

        let num_received = self
            .transport
            .all_to_all_bytes(send, &send_counts, recv, &recv_counts)?;

        if num_received != recv.len() {
            error!(
                "Rank {}: received {} bytes, the plan announced {}",
                self.transport.rank(),
                num_received,
                recv.len()
            );
            return Err(Error::Communication(format!(
                "received {} bytes instead of {}",
                num_received,
                recv.len()
            )));
        }

        trace!(
            "Rank {}: exchanged {} bytes for {} bytes",
            self.transport.rank(),
            send.len(),
            num_received
        );

        Ok(())
    }

    /// Sends serializable items to their destinations and returns the received items grouped by
    /// ascending source rank. The encoded size may vary between items; the encoded sizes travel
    /// through the plan ahead of the payload. Collective like [Distributor::exchange].
    ///
    /// # Arguments
    /// * `plan` - The plan created from the destinations of the items.
    /// * `items` - The items in the order of the destinations used to create the plan.
    pub fn exchange_items<I>(&self, plan: &Plan, items: &[I]) -> Result<Vec<I>>
    where
        I: Serialize + DeserializeOwned,
    {
        self.check_plan(plan)?;
        check_size(plan.total_send_length(), items.len())?;

        let encoded: Vec<Vec<u8>> = items
            .iter()
            .map(|item| bincode::serialize(item))
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::SerializationError(Box::new(e)))?;

        // first round: the encoded sizes of the items
        const LEN_SIZE: usize = std::mem::size_of::<u64>();
        let lengths: Vec<u8> = encoded
            .iter()
            .flat_map(|e| (e.len() as u64).to_le_bytes())
            .collect();
        let mut received_lengths = vec![0u8; plan.receive_buffer_size(LEN_SIZE)];
        self.exchange(plan, &lengths, LEN_SIZE, &mut received_lengths)?;
        let received_lengths: Vec<usize> = received_lengths
            .chunks_exact(LEN_SIZE)
            .map(|c| {
                let mut bytes = [0u8; LEN_SIZE];
                bytes.copy_from_slice(c);
                u64::from_le_bytes(bytes) as usize
            })
            .collect();

        // second round: the payload
        let mut send_counts = vec![0usize; plan.lengths_to.len()];
        let mut payload = Vec::with_capacity(encoded.iter().map(|e| e.len()).sum());
        let mut position = 0;
        for (rank, &length) in plan.lengths_to.iter().enumerate() {
            for &i in plan.send_order[position..position + length].iter() {
                send_counts[rank] += encoded[i].len();
                payload.extend_from_slice(&encoded[i]);
            }
            position += length;
        }

        let mut recv_counts = vec![0usize; plan.lengths_from.len()];
        let mut position = 0;
        for (rank, &length) in plan.lengths_from.iter().enumerate() {
            recv_counts[rank] = received_lengths[position..position + length].iter().sum();
            position += length;
        }

        let mut received = vec![0u8; recv_counts.iter().sum()];
        let num_received =
            self.transport
                .all_to_all_bytes(&payload, &send_counts, &mut received, &recv_counts)?;
        check_size(received.len(), num_received)
            .map_err(|_| Error::Communication("incomplete payload".to_owned()))?;

        let mut result = Vec::with_capacity(received_lengths.len());
        let mut offset = 0;
        for length in received_lengths {
            let item: I = bincode::deserialize(&received[offset..offset + length])
                .map_err(|e| Error::DeserializationError(Box::new(e)))?;
            result.push(item);
            offset += length;
        }

        Ok(result)
    }

    /// Makes sure the plan has been created for a group of the size of the transport.
    fn check_plan(&self, plan: &Plan) -> Result<()> {
        let size = self.transport.size();
        if plan.lengths_to.len() != size || plan.lengths_from.len() != size {
            error!(
                "Plan for {} ranks used in a group of {} ranks",
                plan.lengths_to.len(),
                size
            );
            return Err(Error::SizeMismatch {
                expected: size,
                actual: plan.lengths_to.len(),
            });
        }

        Ok(())
    }
}

#[inline]
fn check_size(expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        error!("Size mismatch: expected {}, got {}", expected, actual);
        return Err(Error::SizeMismatch { expected, actual });
    }

    Ok(())
}

/// Checks the chunk sizes of an all-to-all exchange against the group size and the buffers.
/// Returns the total number of bytes to receive.
///
/// # Arguments
/// * `size` - The size of the process group.
/// * `send` - The send buffer.
/// * `send_counts` - The chunk size in bytes per destination rank.
/// * `recv` - The receive buffer.
/// * `recv_counts` - The chunk size in bytes per source rank.
pub(crate) fn check_chunks(
    size: usize,
    send: &[u8],
    send_counts: &[usize],
    recv: &[u8],
    recv_counts: &[usize],
) -> Result<usize> {
    if send_counts.len() != size {
        return Err(Error::SizeMismatch {
            expected: size,
            actual: send_counts.len(),
        });
    }
    if recv_counts.len() != size {
        return Err(Error::SizeMismatch {
            expected: size,
            actual: recv_counts.len(),
        });
    }

    check_size(send_counts.iter().sum(), send.len())?;

    let recv_total: usize = recv_counts.iter().sum();
    if recv_total > recv.len() {
        error!(
            "Receive buffer of {} bytes for {} bytes",
            recv.len(),
            recv_total
        );
        return Err(Error::SizeMismatch {
            expected: recv_total,
            actual: recv.len(),
        });
    }

    Ok(recv_total)
}

/// Copies the items into a new buffer in the given order.
fn pack_items(items: &[u8], item_size: usize, order: &[usize]) -> Vec<u8> {
    let mut packed = Vec::with_capacity(items.len());
    for &i in order.iter() {
        packed.extend_from_slice(&items[i * item_size..(i + 1) * item_size]);
    }

    packed
}

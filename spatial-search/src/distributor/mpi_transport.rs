//! The transport over an MPI communicator.

use log::error;
use mpi::{
    datatype::{Partition, PartitionMut},
    traits::*,
    Count,
};

use crate::{Error, Result};

use super::{check_chunks, Transport};

/// Runs the collectives of the distributor on an MPI communicator.
pub struct MpiTransport<C: Communicator> {
    comm: C,
}

impl<C: Communicator> MpiTransport<C> {
    /// Creates a new transport on the given communicator.
    ///
    /// # Arguments
    /// * `comm` - The communicator of the process group, e.g., the world communicator.
    pub fn new(comm: C) -> Self {
        Self { comm }
    }
}

fn to_counts(counts: &[usize]) -> Result<Vec<Count>> {
    counts
        .iter()
        .map(|&c| {
            Count::try_from(c).map_err(|_| {
                error!("Chunk of {} bytes exceeds the MPI count range", c);
                Error::Communication(format!("chunk of {} bytes too large for MPI", c))
            })
        })
        .collect()
}

fn displacements(counts: &[Count]) -> Vec<Count> {
    counts
        .iter()
        .scan(0, |acc, &c| {
            let displ = *acc;
            *acc += c;
            Some(displ)
        })
        .collect()
}

impl<C: Communicator> Transport for MpiTransport<C> {
    #[inline]
    fn rank(&self) -> usize {
        self.comm.rank() as usize
    }

    #[inline]
    fn size(&self) -> usize {
        self.comm.size() as usize
    }

    fn all_to_all_counts(&self, send_counts: &[u64]) -> Result<Vec<u64>> {
        let size = self.size();
        if send_counts.len() != size {
            return Err(Error::SizeMismatch {
                expected: size,
                actual: send_counts.len(),
            });
        }

        let mut recv = vec![0u64; size];
        self.comm.all_to_all_into(send_counts, &mut recv[..]);

        Ok(recv)
    }

    fn all_to_all_bytes(
        &self,
        send: &[u8],
        send_counts: &[usize],
        recv: &mut [u8],
        recv_counts: &[usize],
    ) -> Result<usize> {
        let num_received = check_chunks(self.size(), send, send_counts, recv, recv_counts)?;

        let send_counts = to_counts(send_counts)?;
        let recv_counts = to_counts(recv_counts)?;
        let send_displs = displacements(&send_counts);
        let recv_displs = displacements(&recv_counts);

        // chunk sizes differing from the peers' send counts are an MPI error, hence the announced
        // bytes have arrived once the collective returns
        let send_partition = Partition::new(send, &send_counts[..], &send_displs[..]);
        let mut recv_partition =
            PartitionMut::new(&mut recv[..num_received], &recv_counts[..], &recv_displs[..]);
        self.comm
            .all_to_all_varcount_into(&send_partition, &mut recv_partition);

        Ok(num_received)
    }
}

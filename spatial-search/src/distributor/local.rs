use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex, MutexGuard},
};

use log::{error, trace};

use crate::{Error, Result};

use super::{check_chunks, Transport};

/// The queued messages of all pairs of ranks.
struct Mailbox {
    /// The message queue from src to dst is at `dst * size + src`.
    queues: Vec<VecDeque<Vec<u8>>>,

    /// Marks the ranks whose transport has been dropped.
    departed: Vec<bool>,
}

struct Shared {
    size: usize,
    mailbox: Mutex<Mailbox>,
    arrived: Condvar,
}

/// A process group of threads within the current process. Messages between every pair of ranks
/// are delivered in order.
pub struct LocalGroup;

impl LocalGroup {
    /// Creates the transports of a group of the given size. Transport r has rank r and is meant
    /// to be moved into its own thread.
    ///
    /// # Arguments
    /// * `size` - The number of ranks in the group.
    pub fn create(size: usize) -> Vec<LocalTransport> {
        let shared = Arc::new(Shared {
            size,
            mailbox: Mutex::new(Mailbox {
                queues: vec![VecDeque::new(); size * size],
                departed: vec![false; size],
            }),
            arrived: Condvar::new(),
        });

        (0..size)
            .map(|rank| LocalTransport {
                rank,
                shared: shared.clone(),
            })
            .collect()
    }
}

/// A single rank of a [LocalGroup].
pub struct LocalTransport {
    rank: usize,
    shared: Arc<Shared>,
}

impl LocalTransport {
    /// Returns the number of messages that have been sent to this rank but not yet received.
    pub fn pending_messages(&self) -> usize {
        match self.lock() {
            Ok(mailbox) => {
                let size = self.shared.size;
                mailbox.queues[self.rank * size..(self.rank + 1) * size]
                    .iter()
                    .map(|q| q.len())
                    .sum()
            }
            Err(_) => 0,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Mailbox>> {
        self.shared.mailbox.lock().map_err(|_| {
            error!("Rank {}: mailbox poisoned", self.rank);
            Error::Communication("mailbox poisoned by a panicking rank".to_owned())
        })
    }

    /// Posts one message to every rank.
    fn post(&self, messages: Vec<Vec<u8>>) -> Result<()> {
        let size = self.shared.size;
        {
            let mut mailbox = self.lock()?;
            for (dst, message) in messages.into_iter().enumerate() {
                mailbox.queues[dst * size + self.rank].push_back(message);
            }
        }
        self.shared.arrived.notify_all();

        Ok(())
    }

    /// Waits for one message from every rank and returns them ordered by source rank.
    fn collect(&self) -> Result<Vec<Vec<u8>>> {
        let size = self.shared.size;
        let inbox = self.rank * size;

        let mut mailbox = self.lock()?;
        loop {
            if mailbox.queues[inbox..inbox + size].iter().all(|q| !q.is_empty()) {
                break;
            }

            let missing = (0..size).find(|&src| {
                mailbox.queues[inbox + src].is_empty() && mailbox.departed[src]
            });
            if let Some(src) = missing {
                error!("Rank {}: rank {} left the group", self.rank, src);
                return Err(Error::Communication(format!(
                    "rank {} left the group before sending",
                    src
                )));
            }

            mailbox = self
                .shared
                .arrived
                .wait(mailbox)
                .map_err(|_| Error::Communication("mailbox poisoned".to_owned()))?;
        }

        let mut messages = Vec::with_capacity(size);
        for src in 0..size {
            // non-empty, checked above
            messages.push(mailbox.queues[inbox + src].pop_front().unwrap_or_default());
        }

        Ok(messages)
    }
}

impl Transport for LocalTransport {
    #[inline]
    fn rank(&self) -> usize {
        self.rank
    }

    #[inline]
    fn size(&self) -> usize {
        self.shared.size
    }

    fn all_to_all_counts(&self, send_counts: &[u64]) -> Result<Vec<u64>> {
        if send_counts.len() != self.shared.size {
            return Err(Error::SizeMismatch {
                expected: self.shared.size,
                actual: send_counts.len(),
            });
        }

        self.post(send_counts.iter().map(|c| c.to_le_bytes().to_vec()).collect())?;

        self.collect()?
            .into_iter()
            .map(|m| {
                let bytes: [u8; 8] = m.as_slice().try_into().map_err(|_| {
                    Error::Communication(format!("malformed count of {} bytes", m.len()))
                })?;
                Ok(u64::from_le_bytes(bytes))
            })
            .collect()
    }

    fn all_to_all_bytes(
        &self,
        send: &[u8],
        send_counts: &[usize],
        recv: &mut [u8],
        recv_counts: &[usize],
    ) -> Result<usize> {
        let size = self.shared.size;
        check_chunks(size, send, send_counts, recv, recv_counts)?;

        let mut messages = Vec::with_capacity(size);
        let mut offset = 0;
        for &count in send_counts.iter() {
            messages.push(send[offset..offset + count].to_vec());
            offset += count;
        }
        self.post(messages)?;

        let mut offset = 0;
        for (src, (message, &count)) in self.collect()?.iter().zip(recv_counts).enumerate() {
            if message.len() != count {
                error!(
                    "Rank {}: expected {} bytes from rank {}, got {}",
                    self.rank,
                    count,
                    src,
                    message.len()
                );
                return Err(Error::Communication(format!(
                    "expected {} bytes from rank {}, got {}",
                    count,
                    src,
                    message.len()
                )));
            }

            recv[offset..offset + count].copy_from_slice(message);
            offset += count;
        }

        trace!("Rank {}: received {} bytes", self.rank, offset);

        Ok(offset)
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        if let Ok(mut mailbox) = self.shared.mailbox.lock() {
            mailbox.departed[self.rank] = true;
        }
        self.shared.arrived.notify_all();
    }
}

#[cfg(test)]
mod test {
    use std::thread;

    use super::*;

    #[test]
    fn test_counts() {
        let transports = LocalGroup::create(3);
        let received: Vec<Vec<u64>> = thread::scope(|s| {
            let handles: Vec<_> = transports
                .iter()
                .map(|t| {
                    s.spawn(move || {
                        let counts: Vec<u64> =
                            (0..3).map(|dst| (10 * t.rank() + dst) as u64).collect();
                        t.all_to_all_counts(&counts).unwrap()
                    })
                })
                .collect();

            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for (rank, counts) in received.iter().enumerate() {
            let expected: Vec<u64> = (0..3).map(|src| (10 * src + rank) as u64).collect();
            assert_eq!(counts, &expected);
        }

        assert!(transports.iter().all(|t| t.pending_messages() == 0));
    }

    #[test]
    fn test_single_rank() {
        let transports = LocalGroup::create(1);
        let t = &transports[0];

        assert_eq!(t.all_to_all_counts(&[5]).unwrap(), vec![5]);

        let mut recv = [0u8; 3];
        assert_eq!(t.all_to_all_bytes(&[1, 2, 3], &[3], &mut recv, &[3]).unwrap(), 3);
        assert_eq!(recv, [1, 2, 3]);
    }

    #[test]
    fn test_buffer_size_mismatch() {
        let transports = LocalGroup::create(1);
        let t = &transports[0];

        let mut recv = [0u8; 2];
        assert!(matches!(
            t.all_to_all_bytes(&[1, 2, 3], &[3], &mut recv, &[3]),
            Err(Error::SizeMismatch {
                expected: 3,
                actual: 2
            })
        ));

        let mut recv = [0u8; 5];
        assert!(matches!(
            t.all_to_all_bytes(&[1, 2], &[3], &mut recv, &[5]),
            Err(Error::SizeMismatch {
                expected: 3,
                actual: 2
            })
        ));

        assert_eq!(t.pending_messages(), 0);
    }
}

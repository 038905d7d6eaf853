/*
 * Typed Message Queues
 *
 * A bounded ring of fixed-size slots addressed by a numeric key.
 * Senders block on not_full while the ring is at capacity; receivers
 * block on not_empty while it is drained. A positive receive type
 * selects the first matching message anywhere in the ring; extraction
 * from the middle compacts by shifting the earlier entries forward one
 * slot so the head stays aligned.
 */

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use crate::error::{KernelError, Result};
use crate::ipc::Timeout;
use crate::kernel::Kernel;
use crate::sync::{sync_id, CondvarId, MutexId};
use crate::task::WaitOutcome;

sync_id!(
    /// Handle of a message queue
    MsgqId,
    "Msgq"
);

pub(crate) struct MsgQueue {
    pub key: u32,
    pub max_msgs: usize,
    pub max_size: usize,
    pub head: usize,
    pub count: usize,
    /// max_msgs slots of max_size bytes
    pub buf: Vec<u8>,
    /// Parallel slot metadata: (type, length)
    pub meta: Vec<(i64, usize)>,
    pub lock: MutexId,
    pub not_full: CondvarId,
    pub not_empty: CondvarId,
}

impl MsgQueue {
    fn slot(&self, logical: usize) -> usize {
        (self.head + logical) % self.max_msgs
    }
}

impl Kernel {
    /// Create a queue under `key`
    ///
    /// # Arguments
    /// * `max_msgs` - Ring capacity in messages
    /// * `max_size` - Largest message payload in bytes
    pub fn msgq_create(&self, key: u32, max_msgs: usize, max_size: usize) -> Result<MsgqId> {
        if max_msgs == 0 || max_size == 0 {
            return Err(KernelError::InvalidArgument);
        }
        {
            let ipc = self.ipc.lock();
            if ipc.msgqs.values().any(|q| q.key == key) {
                return Err(KernelError::AlreadyExists);
            }
        }
        let lock = self.mutex_create("msgq")?;
        let not_full = self.cond_create("msgq_not_full")?;
        let not_empty = self.cond_create("msgq_not_empty")?;

        let mut ipc = self.ipc.lock();
        let id = ipc.alloc_id()?;
        ipc.msgqs.insert(
            id,
            MsgQueue {
                key,
                max_msgs,
                max_size,
                head: 0,
                count: 0,
                buf: vec![0u8; max_msgs * max_size],
                meta: vec![(0, 0); max_msgs],
                lock,
                not_full,
                not_empty,
            },
        );
        ipc.stats.msg_queues += 1;
        log::debug!("created message queue key={} as Msgq({})", key, id);
        Ok(MsgqId(id))
    }

    /// Look up the queue created under `key`
    pub fn msgq_open(&self, key: u32) -> Result<MsgqId> {
        self.ipc
            .lock()
            .msgqs
            .iter()
            .find(|(_, q)| q.key == key)
            .map(|(&id, _)| MsgqId(id))
            .ok_or(KernelError::NotFound)
    }

    fn msgq_parts(&self, id: MsgqId) -> Result<(MutexId, CondvarId, CondvarId, usize, usize)> {
        let ipc = self.ipc.lock();
        let q = ipc.msgqs.get(&id.0).ok_or(KernelError::NotFound)?;
        Ok((q.lock, q.not_full, q.not_empty, q.max_msgs, q.max_size))
    }

    /// Wait on `cond` under `lock` according to `timeout`
    ///
    /// Returns WouldBlock/TimedOut with the mutex released.
    fn ipc_wait(&self, cond: CondvarId, lock: MutexId, timeout: Timeout) -> Result<()> {
        match timeout {
            Timeout::NonBlocking => {
                self.mutex_unlock(lock)?;
                Err(KernelError::WouldBlock)
            }
            Timeout::Forever => self.cond_wait(cond, lock),
            Timeout::Until(deadline) => {
                let now = self.now_ticks();
                if now >= deadline {
                    self.mutex_unlock(lock)?;
                    return Err(KernelError::TimedOut);
                }
                match self.cond_timedwait(cond, lock, deadline - now)? {
                    // The loop around us re-checks the predicate; a
                    // timeout only fails once the deadline has passed.
                    WaitOutcome::Completed | WaitOutcome::TimedOut => Ok(()),
                }
            }
        }
    }

    /// Send a message of `mtype` (positive)
    ///
    /// Blocks while the ring is full, subject to `timeout_ms`
    /// (0 = non-blocking, u64::MAX = forever).
    pub fn msgq_send(
        &self,
        id: MsgqId,
        mtype: i64,
        data: &[u8],
        timeout_ms: u64,
    ) -> Result<()> {
        if mtype <= 0 {
            return Err(KernelError::InvalidArgument);
        }
        let (lock, not_full, not_empty, max_msgs, max_size) = self.msgq_parts(id)?;
        if data.len() > max_size {
            return Err(KernelError::InvalidArgument);
        }
        let timeout = self.resolve_timeout(timeout_ms);

        self.mutex_lock(lock)?;
        loop {
            let full = {
                let ipc = self.ipc.lock();
                let q = ipc.msgqs.get(&id.0).ok_or(KernelError::NotFound)?;
                q.count >= max_msgs
            };
            if !full {
                break;
            }
            if let Timeout::Until(deadline) = timeout {
                if self.now_ticks() >= deadline {
                    self.mutex_unlock(lock)?;
                    return Err(KernelError::TimedOut);
                }
            }
            self.ipc_wait(not_full, lock, timeout)?;
        }

        {
            let mut ipc = self.ipc.lock();
            let q = ipc.msgqs.get_mut(&id.0).ok_or(KernelError::NotFound)?;
            let slot = q.slot(q.count);
            let base = slot * q.max_size;
            q.buf[base..base + data.len()].copy_from_slice(data);
            q.meta[slot] = (mtype, data.len());
            q.count += 1;
            ipc.stats.msg_sends += 1;
        }
        self.cond_signal(not_empty)?;
        self.mutex_unlock(lock)
    }

    /// Receive a message
    ///
    /// `want_type` 0 takes the head; a positive value takes the first
    /// matching message in the ring. Blocks while the ring is empty,
    /// subject to `timeout_ms`.
    ///
    /// # Returns
    /// The payload length and the message type.
    pub fn msgq_receive(
        &self,
        id: MsgqId,
        buf: &mut [u8],
        want_type: i64,
        timeout_ms: u64,
    ) -> Result<(usize, i64)> {
        if want_type < 0 {
            return Err(KernelError::InvalidArgument);
        }
        let (lock, not_full, not_empty, _max_msgs, _max_size) = self.msgq_parts(id)?;
        let timeout = self.resolve_timeout(timeout_ms);

        self.mutex_lock(lock)?;
        loop {
            let empty = {
                let ipc = self.ipc.lock();
                let q = ipc.msgqs.get(&id.0).ok_or(KernelError::NotFound)?;
                q.count == 0
            };
            if !empty {
                break;
            }
            if let Timeout::Until(deadline) = timeout {
                if self.now_ticks() >= deadline {
                    self.mutex_unlock(lock)?;
                    return Err(KernelError::TimedOut);
                }
            }
            self.ipc_wait(not_empty, lock, timeout)?;
        }

        let taken = {
            let mut ipc = self.ipc.lock();
            let q = ipc.msgqs.get_mut(&id.0).ok_or(KernelError::NotFound)?;

            // Find the first message of the wanted type.
            let mut found = None;
            for logical in 0..q.count {
                let slot = q.slot(logical);
                if want_type == 0 || q.meta[slot].0 == want_type {
                    found = Some(logical);
                    break;
                }
            }
            match found {
                None => Err(KernelError::NotFound),
                Some(logical) => {
                    let slot = q.slot(logical);
                    let (mtype, len) = q.meta[slot];
                    if buf.len() < len {
                        Err(KernelError::InvalidArgument)
                    } else {
                        let base = slot * q.max_size;
                        buf[..len].copy_from_slice(&q.buf[base..base + len]);

                        // Shift the earlier entries forward one slot so
                        // the head stays aligned, then advance it.
                        let mut dst = logical;
                        while dst > 0 {
                            let to = q.slot(dst);
                            let from = q.slot(dst - 1);
                            let (to_base, from_base) = (to * q.max_size, from * q.max_size);
                            let max_size = q.max_size;
                            q.buf.copy_within(from_base..from_base + max_size, to_base);
                            q.meta[to] = q.meta[from];
                            dst -= 1;
                        }
                        q.head = (q.head + 1) % q.max_msgs;
                        q.count -= 1;
                        ipc.stats.msg_receives += 1;
                        Ok((len, mtype))
                    }
                }
            }
        };

        match taken {
            Ok(result) => {
                self.cond_signal(not_full)?;
                self.mutex_unlock(lock)?;
                Ok(result)
            }
            Err(e) => {
                self.mutex_unlock(lock)?;
                Err(e)
            }
        }
    }

    /// Number of messages waiting in the ring
    pub fn msgq_count(&self, id: MsgqId) -> Result<usize> {
        self.ipc
            .lock()
            .msgqs
            .get(&id.0)
            .map(|q| q.count)
            .ok_or(KernelError::NotFound)
    }

    /// Destroy a queue; fails while any task is inside send or receive
    pub fn msgq_delete(&self, id: MsgqId) -> Result<()> {
        let (lock, not_full, not_empty, _, _) = self.msgq_parts(id)?;
        self.cond_destroy(not_full)?;
        self.cond_destroy(not_empty)?;
        self.mutex_destroy(lock)?;
        let mut ipc = self.ipc.lock();
        ipc.msgqs.remove(&id.0);
        ipc.stats.msg_queues -= 1;
        Ok(())
    }
}

/*
 * Pipes
 *
 * A byte ring shared by a read handle and a write handle. Writers
 * deliver every byte, blocking while the ring is full; readers return
 * as soon as any data is available. Closing the read side turns further
 * writes into BrokenPipe; closing the write side drains to EOF (a
 * zero-length read). Closing is idempotent, and the ring is freed when
 * the second side closes.
 */

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::sync::{sync_id, CondvarId, MutexId};

sync_id!(
    /// Handle of one end of a pipe
    PipeFd,
    "PipeFd"
);

/// Which side of the pipe an fd refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeEnd {
    Read,
    Write,
}

pub(crate) struct Pipe {
    pub buf: Vec<u8>,
    pub read_pos: usize,
    pub count: usize,
    pub lock: MutexId,
    pub not_full: CondvarId,
    pub not_empty: CondvarId,
    pub reader_closed: bool,
    pub writer_closed: bool,
    pub read_fd: u32,
    pub write_fd: u32,
}

impl Pipe {
    fn write_pos(&self) -> usize {
        (self.read_pos + self.count) % self.buf.len()
    }
}

impl Kernel {
    /// Create a pipe
    ///
    /// # Returns
    /// The (read, write) handle pair over one ring buffer.
    pub fn pipe_create(&self) -> Result<(PipeFd, PipeFd)> {
        let lock = self.mutex_create("pipe")?;
        let not_full = self.cond_create("pipe_not_full")?;
        let not_empty = self.cond_create("pipe_not_empty")?;
        let capacity = self.config.pipe_capacity;

        let mut ipc = self.ipc.lock();
        let id = ipc.alloc_id()?;
        let read_fd = ipc.alloc_fd();
        let write_fd = ipc.alloc_fd();
        ipc.pipes.insert(
            id,
            Pipe {
                buf: vec![0u8; capacity],
                read_pos: 0,
                count: 0,
                lock,
                not_full,
                not_empty,
                reader_closed: false,
                writer_closed: false,
                read_fd,
                write_fd,
            },
        );
        ipc.fds.insert(read_fd, (id, PipeEnd::Read));
        ipc.fds.insert(write_fd, (id, PipeEnd::Write));
        ipc.stats.pipes += 1;
        log::debug!(
            "created pipe {} (read PipeFd({}), write PipeFd({}))",
            id,
            read_fd,
            write_fd
        );
        Ok((PipeFd(read_fd), PipeFd(write_fd)))
    }

    fn pipe_for(&self, fd: PipeFd, want: PipeEnd) -> Result<(u32, MutexId, CondvarId, CondvarId)> {
        let ipc = self.ipc.lock();
        let &(id, end) = ipc.fds.get(&fd.0).ok_or(KernelError::NotFound)?;
        if end != want {
            return Err(KernelError::InvalidArgument);
        }
        let pipe = ipc.pipes.get(&id).ok_or(KernelError::NotFound)?;
        Ok((id, pipe.lock, pipe.not_full, pipe.not_empty))
    }

    /// Write all of `data`, blocking while the ring is full
    ///
    /// Fails with BrokenPipe once the read side is closed.
    pub fn pipe_write(&self, fd: PipeFd, data: &[u8]) -> Result<usize> {
        let (id, lock, not_full, not_empty) = self.pipe_for(fd, PipeEnd::Write)?;

        enum WriteStep {
            Wrote(usize),
            Full,
            Broken,
            UseAfterClose,
        }

        self.mutex_lock(lock)?;
        let mut written = 0;
        while written < data.len() {
            // The registry lock is released before any call that can
            // switch context.
            let step = {
                let mut ipc = self.ipc.lock();
                let Some(pipe) = ipc.pipes.get_mut(&id) else {
                    break;
                };
                if pipe.writer_closed {
                    WriteStep::UseAfterClose
                } else if pipe.reader_closed {
                    WriteStep::Broken
                } else {
                    let capacity = pipe.buf.len();
                    let space = capacity - pipe.count;
                    let chunk = space.min(data.len() - written);
                    if chunk == 0 {
                        WriteStep::Full
                    } else {
                        // Two-part ring copy.
                        let write_pos = pipe.write_pos();
                        let first = chunk.min(capacity - write_pos);
                        pipe.buf[write_pos..write_pos + first]
                            .copy_from_slice(&data[written..written + first]);
                        let rest = chunk - first;
                        if rest > 0 {
                            pipe.buf[..rest]
                                .copy_from_slice(&data[written + first..written + chunk]);
                        }
                        pipe.count += chunk;
                        WriteStep::Wrote(chunk)
                    }
                }
            };

            match step {
                WriteStep::Wrote(chunk) => {
                    written += chunk;
                    self.cond_signal(not_empty)?;
                }
                // Ring full: wait for the reader to drain some bytes.
                WriteStep::Full => self.cond_wait(not_full, lock)?,
                WriteStep::Broken => {
                    self.mutex_unlock(lock)?;
                    return Err(KernelError::BrokenPipe);
                }
                WriteStep::UseAfterClose => {
                    self.mutex_unlock(lock)?;
                    return Err(KernelError::InvalidState);
                }
            }
        }
        self.ipc.lock().stats.pipe_writes += 1;
        self.mutex_unlock(lock)?;
        Ok(written)
    }

    /// Read into `buf`, blocking only while the ring is empty
    ///
    /// # Returns
    /// Bytes read; 0 means end-of-file (write side closed and drained).
    pub fn pipe_read(&self, fd: PipeFd, buf: &mut [u8]) -> Result<usize> {
        let (id, lock, not_full, not_empty) = self.pipe_for(fd, PipeEnd::Read)?;
        if buf.is_empty() {
            return Err(KernelError::InvalidArgument);
        }

        enum ReadStep {
            Got(usize),
            Eof,
            UseAfterClose,
            Wait,
        }

        self.mutex_lock(lock)?;
        loop {
            let step = {
                let mut ipc = self.ipc.lock();
                let pipe = match ipc.pipes.get_mut(&id) {
                    Some(pipe) => pipe,
                    None => {
                        drop(ipc);
                        self.mutex_unlock(lock)?;
                        return Err(KernelError::NotFound);
                    }
                };
                if pipe.reader_closed {
                    ReadStep::UseAfterClose
                } else if pipe.count > 0 {
                    let capacity = pipe.buf.len();
                    let chunk = pipe.count.min(buf.len());
                    let first = chunk.min(capacity - pipe.read_pos);
                    buf[..first]
                        .copy_from_slice(&pipe.buf[pipe.read_pos..pipe.read_pos + first]);
                    let rest = chunk - first;
                    if rest > 0 {
                        buf[first..chunk].copy_from_slice(&pipe.buf[..rest]);
                    }
                    pipe.read_pos = (pipe.read_pos + chunk) % capacity;
                    pipe.count -= chunk;
                    ipc.stats.pipe_reads += 1;
                    ReadStep::Got(chunk)
                } else if pipe.writer_closed {
                    ReadStep::Eof
                } else {
                    ReadStep::Wait
                }
            };

            match step {
                ReadStep::Got(chunk) => {
                    self.cond_signal(not_full)?;
                    self.mutex_unlock(lock)?;
                    return Ok(chunk);
                }
                ReadStep::Eof => {
                    self.mutex_unlock(lock)?;
                    return Ok(0);
                }
                ReadStep::UseAfterClose => {
                    self.mutex_unlock(lock)?;
                    return Err(KernelError::InvalidState);
                }
                ReadStep::Wait => self.cond_wait(not_empty, lock)?,
            }
        }
    }

    /// Close one side; idempotent, and the pipe is freed when both
    /// sides are closed
    pub fn pipe_close(&self, fd: PipeFd) -> Result<()> {
        let (id, lock, not_full, not_empty, both_closed) = {
            let mut ipc = self.ipc.lock();
            let &(id, end) = ipc.fds.get(&fd.0).ok_or(KernelError::NotFound)?;
            let pipe = ipc.pipes.get_mut(&id).ok_or(KernelError::NotFound)?;
            match end {
                PipeEnd::Read => pipe.reader_closed = true,
                PipeEnd::Write => pipe.writer_closed = true,
            }
            let both = pipe.reader_closed && pipe.writer_closed;
            (id, pipe.lock, pipe.not_full, pipe.not_empty, both)
        };

        // Wake the peers so they observe the closure promptly.
        self.cond_broadcast(not_full)?;
        self.cond_broadcast(not_empty)?;
        log::debug!("closed PipeFd({})", fd.0);

        if both_closed {
            // Last side out frees the ring and its primitives.
            let cleanup = self
                .cond_destroy(not_full)
                .and_then(|_| self.cond_destroy(not_empty))
                .and_then(|_| self.mutex_destroy(lock));
            match cleanup {
                Ok(()) => {
                    let mut ipc = self.ipc.lock();
                    if let Some(pipe) = ipc.pipes.remove(&id) {
                        ipc.fds.remove(&pipe.read_fd);
                        ipc.fds.remove(&pipe.write_fd);
                    }
                    ipc.stats.pipes -= 1;
                }
                Err(e) => {
                    // Someone is still inside a pipe call; they were
                    // woken above and the next close attempt finishes
                    // the job.
                    log::debug!("pipe {}: cleanup deferred ({})", id, e);
                }
            }
        }
        Ok(())
    }
}

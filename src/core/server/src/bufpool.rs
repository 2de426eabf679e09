// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Per-worker buffer loans. Each worker keeps at most one spare read pipe
//! and one spare write pipe; a connection entering a new command borrows
//! them (or allocates) and hands them back once they are drained. Amortizes
//! buffer allocation across all of a worker's connections, since at any
//! moment almost all of them are idle and bufferless.

use buffer::Pipe;

/// How a loan request was satisfied.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BufferLoan {
    /// The connection already had a (possibly partial) buffer.
    Existing,
    /// The pool's spare buffer was handed over.
    Loaned,
    /// A new buffer was allocated.
    Allocated,
}

pub struct BufferPool {
    read: Option<Pipe>,
    write: Option<Pipe>,
    target_size: usize,
    /// Number of pipes this pool may still allocate, or `None` for
    /// unbounded. Exhaustion makes `loan` fail, which the caller must treat
    /// as fatal for the connection.
    budget: Option<usize>,
}

impl BufferPool {
    pub fn new(target_size: usize) -> Self {
        Self {
            read: None,
            write: None,
            target_size,
            budget: None,
        }
    }

    pub fn with_budget(target_size: usize, budget: usize) -> Self {
        Self {
            read: None,
            write: None,
            target_size,
            budget: Some(budget),
        }
    }

    fn loan_single(
        slot: &mut Option<Pipe>,
        conn_buf: &mut Option<Pipe>,
        target_size: usize,
        budget: &mut Option<usize>,
    ) -> Result<BufferLoan, ()> {
        // already have a (partial) buffer - nothing to do
        if conn_buf.is_some() {
            return Ok(BufferLoan::Existing);
        }

        if let Some(pipe) = slot.take() {
            *conn_buf = Some(pipe);
            return Ok(BufferLoan::Loaned);
        }

        if let Some(remaining) = budget {
            if *remaining == 0 {
                return Err(());
            }
            *remaining -= 1;
        }

        *conn_buf = Some(Pipe::new(target_size));
        Ok(BufferLoan::Allocated)
    }

    /// Ensure the connection holds a read and a write pipe. On failure
    /// nothing is counted for the missing buffer, so accounting is not
    /// skewed, and the caller must close the connection.
    pub fn loan(
        &mut self,
        read: &mut Option<Pipe>,
        write: &mut Option<Pipe>,
    ) -> Result<(BufferLoan, BufferLoan), ()> {
        let r = Self::loan_single(&mut self.read, read, self.target_size, &mut self.budget)?;
        let w = Self::loan_single(&mut self.write, write, self.target_size, &mut self.budget)?;
        Ok((r, w))
    }

    fn return_single(slot: &mut Option<Pipe>, conn_buf: &mut Option<Pipe>, budget: &mut Option<usize>) {
        if conn_buf.as_ref().map(|p| p.is_empty()).unwrap_or(false) {
            if slot.is_some() {
                // already have a spare, drop this one
                *conn_buf = None;
                if let Some(remaining) = budget {
                    *remaining += 1;
                }
            } else {
                *slot = conn_buf.take();
            }
        }
    }

    /// Take back whichever of the connection's pipes are drained. Pipes with
    /// residual bytes stay with the connection.
    pub fn maybe_return(&mut self, read: &mut Option<Pipe>, write: &mut Option<Pipe>) {
        Self::return_single(&mut self.read, read, &mut self.budget);
        Self::return_single(&mut self.write, write, &mut self.budget);
    }

    #[cfg(test)]
    fn spare_count(&self) -> usize {
        self.read.is_some() as usize + self.write.is_some() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loan_allocates_then_reuses() {
        let mut pool = BufferPool::new(1024);
        let mut read = None;
        let mut write = None;

        let (r, w) = pool.loan(&mut read, &mut write).expect("loan failed");
        assert_eq!(r, BufferLoan::Allocated);
        assert_eq!(w, BufferLoan::Allocated);
        assert!(read.is_some() && write.is_some());

        // a second loan sees the existing buffers
        let (r, w) = pool.loan(&mut read, &mut write).expect("loan failed");
        assert_eq!(r, BufferLoan::Existing);
        assert_eq!(w, BufferLoan::Existing);

        // returning empty buffers stocks the pool
        pool.maybe_return(&mut read, &mut write);
        assert!(read.is_none() && write.is_none());
        assert_eq!(pool.spare_count(), 2);

        // the next loan is satisfied from the pool
        let (r, w) = pool.loan(&mut read, &mut write).expect("loan failed");
        assert_eq!(r, BufferLoan::Loaned);
        assert_eq!(w, BufferLoan::Loaned);
        assert_eq!(pool.spare_count(), 0);
    }

    #[test]
    fn non_empty_buffers_stay_with_connection() {
        let mut pool = BufferPool::new(1024);
        let mut read = None;
        let mut write = None;
        pool.loan(&mut read, &mut write).expect("loan failed");

        use buffer::BufMut;
        read.as_mut().unwrap().put_slice(b"partial frame");

        pool.maybe_return(&mut read, &mut write);
        assert!(read.is_some(), "partial read pipe must not be returned");
        assert!(write.is_none());
        assert_eq!(pool.spare_count(), 1);
    }

    #[test]
    fn pool_holds_at_most_one_of_each() {
        let mut pool = BufferPool::new(1024);

        let mut read_a = None;
        let mut write_a = None;
        let mut read_b = None;
        let mut write_b = None;

        pool.loan(&mut read_a, &mut write_a).expect("loan failed");
        pool.loan(&mut read_b, &mut write_b).expect("loan failed");

        pool.maybe_return(&mut read_a, &mut write_a);
        pool.maybe_return(&mut read_b, &mut write_b);

        // the second return found the slots occupied and dropped its pipes
        assert_eq!(pool.spare_count(), 2);
    }

    #[test]
    fn budget_exhaustion_fails_loan() {
        let mut pool = BufferPool::with_budget(1024, 1);
        let mut read = None;
        let mut write = None;

        // the budget covers only one of the two pipes
        assert!(pool.loan(&mut read, &mut write).is_err());
    }
}

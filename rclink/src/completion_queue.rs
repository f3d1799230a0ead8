use std::sync::Arc;

use rdma_shim::{RawCq, WorkCompletion};

use crate::context::{Context, ContextRef};
use crate::ControlpathError::CreationError;
use crate::{ControlpathError, DatapathError};

/// An abstraction completion queue (CQ)
#[derive(Debug)]
pub struct CompletionQueue {
    _ctx: Arc<Context>,
    cq: RawCq,
    depth: u32,
}

impl CompletionQueue {
    /// We don't need complex CQ handler as the callback;
    /// completions are always polled.
    ///
    /// `max_cq_entries` is the maximum size of the completion queue
    ///
    /// # Errors:
    /// - `CreationError` : This error meaning there is something wrong
    /// when creating completion queue with the given context and arguments.
    /// Check them carefully if they are valid and legal.
    ///
    pub fn create(context: &ContextRef, max_cq_entries: u32) -> Result<Self, ControlpathError> {
        let cq = RawCq::create(context.raw(), max_cq_entries).map_err(|err| {
            crate::log::error!("failed to create CQ with {} entries", max_cq_entries);
            CreationError("CQ", err)
        })?;
        Ok(Self {
            _ctx: context.clone(),
            cq,
            depth: max_cq_entries,
        })
    }

    /// Poll multiple completions from the CQ
    /// This call takes &self, because the provider serializes the
    /// underlying poll.
    #[inline]
    pub fn poll<'c>(
        &self,
        completions: &'c mut [WorkCompletion],
    ) -> Result<&'c mut [WorkCompletion], DatapathError> {
        let n = self
            .cq
            .poll(completions)
            .map_err(DatapathError::PollCQError)?;
        Ok(&mut completions[0..n])
    }

    #[inline]
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub(crate) fn raw(&self) -> &RawCq {
        &self.cq
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn cq_can_create() {
        let ctx = crate::UDriver::create()
            .expect("failed to query device")
            .devices()
            .iter()
            .next()
            .expect("no rdma device available")
            .open_context()
            .expect("failed to create RDMA context");

        let cq = super::CompletionQueue::create(&ctx, crate::consts::CQ_DEPTH).unwrap();
        assert_eq!(cq.depth(), 2);

        let mut wcs = [rdma_shim::WorkCompletion::default(); 4];
        assert!(cq.poll(&mut wcs).unwrap().is_empty());

        assert!(super::CompletionQueue::create(&ctx, 0).is_err());
    }
}

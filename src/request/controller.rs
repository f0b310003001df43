//! Programmatic control over one in-flight request.

use std::sync::Arc;

use super::{registry::RequestRegistry, RequestId};

/// Handle for inspecting and steering an active request. Obtained from
/// [`RequestSet::get_request_controller`](super::RequestSet::get_request_controller); stays
/// valid after the request finishes but then all operations report the request as gone.
#[derive(Clone)]
pub struct RequestController {
    registry: Arc<RequestRegistry>,
    request_id: RequestId,
}

impl RequestController {
    pub(crate) fn new(registry: Arc<RequestRegistry>, request_id: RequestId) -> Self {
        Self {
            registry,
            request_id,
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Runs `f` over the request's packed context bytes. `None` when the request is no
    /// longer active.
    pub fn context_blob<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let context = self.registry.context(self.request_id)?;
        let bytes = context.lock().unwrap();
        Some(f(&bytes))
    }

    /// Resumes every handler task of the request that is currently suspended, making the
    /// dispatcher method it suspended in surface `code`. Returns whether the request was
    /// active.
    pub fn resume_suspended_handlers(&self, code: i32) -> bool {
        self.registry.resume_suspended(self.request_id, code)
    }

    /// Visits the opaque working buffer of every handler instance, keyed by its slot index.
    /// Returns whether the request was active.
    pub fn access_request_working_data(
        &self,
        mut visitor: impl FnMut(usize, &mut Vec<u8>),
    ) -> bool {
        self.registry
            .visit_working_data(self.request_id, &mut visitor)
    }
}

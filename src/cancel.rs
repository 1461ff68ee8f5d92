//! Caller-supplied cancellation and deadlines.
//!
//! Every operation in this crate is a future; dropping it aborts the
//! in-flight request and releases its connection. [`OpScope`] packages that
//! into an explicit token + deadline so callers get `Canceled` /
//! `DeadlineExceeded` errors instead of a silently dropped future.

use crate::errors::{Error, Result};
use std::{future::Future, time::Duration};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, Default)]
pub struct OpScope {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl OpScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scope that is canceled whenever `token` is.
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Give up once `timeout` has elapsed from now.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Child scope: canceled with this one, may carry a tighter deadline.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Drive `fut` to completion unless the scope is canceled or its deadline
    /// passes first, in which case `fut` is dropped.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.token.is_cancelled() {
            return Err(Error::Canceled);
        }
        let guarded = async {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => Err(Error::Canceled),
                res = fut => res,
            }
        };
        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, guarded)
                .await
                .unwrap_or(Err(Error::DeadlineExceeded)),
            None => guarded.await,
        }
    }
}

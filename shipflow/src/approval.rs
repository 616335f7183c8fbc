//! Manual approval gate.
//!
//! An approval blocks its stage until an external decision arrives. No
//! timeout is enforced here; escalation belongs to whoever resolves tokens.

use crate::errors::ShipflowError;
use crate::utils::{now, Timestamp};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info};
use uuid::Uuid;

/// Handle identifying one pending approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PendingToken(pub Uuid);

impl fmt::Display for PendingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What an approver is asked to decide on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Token to pass to `resolve`.
    pub token: PendingToken,
    /// The run awaiting the decision.
    pub run_id: Uuid,
    /// The gated stage.
    pub stage: String,
    /// The approval action.
    pub action: String,
    /// Optional message for the approver.
    pub message: Option<String>,
    /// When the request was made.
    pub requested_at: Timestamp,
}

/// A registered request and the receiver its decision arrives on.
///
/// The receiver errors if the request is withdrawn without a decision.
#[derive(Debug)]
pub struct PendingApproval {
    /// The request as registered.
    pub request: ApprovalRequest,
    /// Resolves to the decision.
    pub decision: oneshot::Receiver<bool>,
}

/// Collaborator that parks approval actions until a human decides.
pub trait ApprovalGate: Send + Sync {
    /// Registers a request and returns immediately.
    fn notify(
        &self,
        run_id: Uuid,
        stage: &str,
        action: &str,
        message: Option<&str>,
    ) -> PendingApproval;

    /// Withdraws a request without a decision. Returns false if unknown.
    fn withdraw(&self, token: PendingToken) -> bool;
}

struct Entry {
    request: ApprovalRequest,
    response_tx: oneshot::Sender<bool>,
}

/// In-process approval gate.
#[derive(Default)]
pub struct ApprovalService {
    requests: RwLock<HashMap<PendingToken, Entry>>,
    arrived: Notify,
}

impl ApprovalService {
    /// Creates an empty service.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers a decision.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if the token is unknown or already resolved.
    pub fn resolve(&self, token: PendingToken, approved: bool) -> Result<ApprovalRequest, ShipflowError> {
        let entry = self.requests.write().remove(&token).ok_or_else(|| {
            ShipflowError::InvalidTransition(format!("no pending approval for token {token}"))
        })?;
        info!(
            run_id = %entry.request.run_id,
            stage = %entry.request.stage,
            action = %entry.request.action,
            approved,
            "Approval resolved"
        );
        // The waiter may have gone away (run cancelled); the decision is still consumed.
        let _ = entry.response_tx.send(approved);
        Ok(entry.request)
    }

    /// Approves a pending request.
    ///
    /// # Errors
    ///
    /// See [`Self::resolve`].
    pub fn approve(&self, token: PendingToken) -> Result<ApprovalRequest, ShipflowError> {
        self.resolve(token, true)
    }

    /// Rejects a pending request.
    ///
    /// # Errors
    ///
    /// See [`Self::resolve`].
    pub fn reject(&self, token: PendingToken) -> Result<ApprovalRequest, ShipflowError> {
        self.resolve(token, false)
    }

    /// Returns the number of pending requests.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.requests.read().len()
    }

    /// Lists pending requests, oldest first.
    #[must_use]
    pub fn pending_requests(&self) -> Vec<ApprovalRequest> {
        let mut requests: Vec<_> = self
            .requests
            .read()
            .values()
            .map(|e| e.request.clone())
            .collect();
        requests.sort_by_key(|r| r.requested_at);
        requests
    }

    /// Waits until at least one request is pending and returns all of them.
    pub async fn wait_for_pending(&self) -> Vec<ApprovalRequest> {
        loop {
            let arrived = self.arrived.notified();
            let pending = self.pending_requests();
            if !pending.is_empty() {
                return pending;
            }
            arrived.await;
        }
    }
}

impl ApprovalGate for ApprovalService {
    fn notify(
        &self,
        run_id: Uuid,
        stage: &str,
        action: &str,
        message: Option<&str>,
    ) -> PendingApproval {
        let (tx, rx) = oneshot::channel();
        let request = ApprovalRequest {
            token: PendingToken(Uuid::new_v4()),
            run_id,
            stage: stage.to_string(),
            action: action.to_string(),
            message: message.map(str::to_string),
            requested_at: now(),
        };
        debug!(run_id = %run_id, stage, action, token = %request.token, "Approval requested");
        self.requests.write().insert(
            request.token,
            Entry {
                request: request.clone(),
                response_tx: tx,
            },
        );
        self.arrived.notify_waiters();

        PendingApproval {
            request,
            decision: rx,
        }
    }

    fn withdraw(&self, token: PendingToken) -> bool {
        let withdrawn = self.requests.write().remove(&token).is_some();
        if withdrawn {
            debug!(token = %token, "Approval request withdrawn");
        }
        withdrawn
    }
}

impl fmt::Debug for ApprovalService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApprovalService")
            .field("pending_count", &self.pending_count())
            .finish()
    }
}

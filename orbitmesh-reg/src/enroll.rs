//  ENROLL.rs
//    by OrbitMesh contributors
//
//  Description:
//!   Implements the enrollment flow for first contact from new nodes:
//!   the single, reusable bootstrap token (regenerable, hash-stored) and
//!   the enrollment records that park registrations until an operator
//!   approves them, unless auto-approval is on.
//

use chrono::{DateTime, Utc};
use enum_debug::EnumDebug;
use log::info;
use parking_lot::RwLock;
use rand::distributions::Alphanumeric;
use rand::{Rng as _, thread_rng};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use dashmap::DashMap;

pub use crate::errors::EnrollError as Error;


/***** CONSTANTS *****/
/// The length of a freshly generated bootstrap token secret.
const TOKEN_SECRET_LEN: usize = 48;





/***** HELPER FUNCTIONS *****/
/// Hashes a token secret for storage and comparison.
#[inline]
fn hash_secret(secret: &str) -> String { hex::encode(Sha256::digest(secret.as_bytes())) }





/***** AUXILLARY *****/
/// The states an enrollment can be in.
#[derive(Clone, Copy, Debug, EnumDebug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    /// Waiting for an operator decision.
    Pending,
    /// Approved; the node may register.
    Approved,
    /// Rejected by an operator.
    Rejected,
    /// The request sat unapproved for too long.
    Expired,
    /// The node is blocked from enrolling again.
    Blocked,
    /// The enrollment attempt itself failed (e.g., bad token).
    Failed,
}

/// The outcome of presenting credentials at registration time.
#[derive(Clone, Debug, EnumDebug, Eq, PartialEq)]
pub enum EnrollmentDecision {
    /// The node may register right away.
    Approved,
    /// The node must wait for an operator; the enrollment id is returned.
    Pending { enrollment_id: String },
    /// The node is denied.
    Denied { reason: String },
}





/***** LIBRARY *****/
/// The single, reusable bootstrap token that authenticates first contact. Only the hash of the
/// secret is ever stored.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BootstrapToken {
    /// Stable id of the token record.
    pub id: String,
    /// Hex-encoded SHA-256 of the current secret.
    pub hash: String,
    /// Whether the token is accepted at all.
    pub is_enabled: bool,
    /// Whether a valid token skips the operator approval step.
    pub auto_approve: bool,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the secret was last regenerated.
    pub last_regenerated_at: Option<DateTime<Utc>>,
}
impl BootstrapToken {
    /// Creates a fresh, enabled token record together with its plaintext secret.
    ///
    /// # Returns
    /// The record and the one-time-visible plaintext secret.
    pub fn generate() -> (Self, String) {
        let secret: String = thread_rng().sample_iter(&Alphanumeric).take(TOKEN_SECRET_LEN).map(char::from).collect();
        let token: Self = Self {
            id: uuid::Uuid::new_v4().to_string(),
            hash: hash_secret(&secret),
            is_enabled: true,
            auto_approve: false,
            created_at: Utc::now(),
            last_regenerated_at: None,
        };
        (token, secret)
    }

    /// Replaces the secret, invalidating the old one.
    ///
    /// # Returns
    /// The new plaintext secret (shown to the operator exactly once).
    pub fn regenerate(&mut self) -> String {
        let secret: String = thread_rng().sample_iter(&Alphanumeric).take(TOKEN_SECRET_LEN).map(char::from).collect();
        self.hash = hash_secret(&secret);
        self.last_regenerated_at = Some(Utc::now());
        secret
    }

    /// Verifies a presented secret against the stored hash.
    ///
    /// # Returns
    /// True only if the token is enabled and the secret matches.
    #[inline]
    pub fn verify(&self, secret: &str) -> bool { self.is_enabled && hash_secret(secret) == self.hash }
}



/// One node's enrollment request.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Enrollment {
    /// Unique id of the enrollment record.
    pub id: String,
    /// The id the node wants to register under.
    pub node_id: String,
    /// The node's self-reported name.
    pub node_name: String,
    /// The node's public key, for later mutual authentication.
    pub public_key: Option<String>,
    /// The capabilities the node wants to advertise.
    pub requested_capabilities: Vec<String>,
    /// Current state of the request.
    pub status: EnrollmentStatus,
    /// When the request arrived.
    pub requested_at: DateTime<Utc>,
    /// When the request was decided, if it was.
    pub decided_at: Option<DateTime<Utc>>,
}



/// Manages the bootstrap token and the enrollment records.
#[derive(Debug)]
pub struct EnrollmentService {
    /// The one reusable bootstrap token.
    token: RwLock<BootstrapToken>,
    /// All enrollment records, keyed by enrollment id.
    enrollments: DashMap<String, Enrollment>,
}
impl EnrollmentService {
    /// Constructor for the EnrollmentService, generating a fresh bootstrap token.
    ///
    /// # Returns
    /// The service plus the initial plaintext secret (to be logged or shown once).
    pub fn new() -> (Self, String) {
        let (token, secret): (BootstrapToken, String) = BootstrapToken::generate();
        (Self { token: RwLock::new(token), enrollments: DashMap::new() }, secret)
    }

    /// Returns a snapshot of the bootstrap token record (hash included, secret never stored).
    #[inline]
    pub fn token(&self) -> BootstrapToken { self.token.read().clone() }

    /// Regenerates the bootstrap token secret.
    ///
    /// # Returns
    /// The new plaintext secret.
    pub fn regenerate_token(&self) -> String {
        let secret: String = self.token.write().regenerate();
        info!("Bootstrap token regenerated");
        secret
    }

    /// Enables or disables the bootstrap token.
    #[inline]
    pub fn set_token_enabled(&self, enabled: bool) { self.token.write().is_enabled = enabled; }

    /// Sets whether a valid token skips operator approval.
    #[inline]
    pub fn set_auto_approve(&self, auto_approve: bool) { self.token.write().auto_approve = auto_approve; }

    /// Handles the credentials presented by a registering node.
    ///
    /// A node that was previously blocked is always denied. Otherwise, a valid bootstrap token
    /// either approves immediately (auto-approve) or parks the node in a pending enrollment.
    ///
    /// # Arguments
    /// - `node_id`: The id the node wants to register under.
    /// - `node_name`: The node's self-reported name.
    /// - `requested_capabilities`: The capability names it wants to advertise.
    /// - `secret`: The bootstrap-token secret it presented, if any.
    ///
    /// # Returns
    /// The [`EnrollmentDecision`] for this registration.
    pub fn handle_registration(&self, node_id: &str, node_name: &str, requested_capabilities: Vec<String>, secret: Option<&str>) -> EnrollmentDecision {
        // Blocked nodes stay blocked, valid token or not
        if self.enrollments.iter().any(|entry| entry.node_id == node_id && entry.status == EnrollmentStatus::Blocked) {
            return EnrollmentDecision::Denied { reason: format!("Node '{node_id}' is blocked") };
        }

        // An earlier approval stands
        if self.enrollments.iter().any(|entry| entry.node_id == node_id && entry.status == EnrollmentStatus::Approved) {
            return EnrollmentDecision::Approved;
        }

        // Everything else needs a valid token
        let (valid, auto_approve): (bool, bool) = {
            let token = self.token.read();
            (secret.map(|secret| token.verify(secret)).unwrap_or(false), token.auto_approve)
        };
        if !valid {
            self.record(node_id, node_name, requested_capabilities, EnrollmentStatus::Failed);
            return EnrollmentDecision::Denied { reason: "Invalid or missing bootstrap token".into() };
        }

        if auto_approve {
            self.record(node_id, node_name, requested_capabilities, EnrollmentStatus::Approved);
            EnrollmentDecision::Approved
        } else {
            let enrollment_id: String = self.record(node_id, node_name, requested_capabilities, EnrollmentStatus::Pending);
            EnrollmentDecision::Pending { enrollment_id }
        }
    }

    /// Stores a new enrollment record with the given status.
    fn record(&self, node_id: &str, node_name: &str, requested_capabilities: Vec<String>, status: EnrollmentStatus) -> String {
        let id: String = uuid::Uuid::new_v4().to_string();
        let decided: bool = status != EnrollmentStatus::Pending;
        self.enrollments.insert(id.clone(), Enrollment {
            id: id.clone(),
            node_id: node_id.into(),
            node_name: node_name.into(),
            public_key: None,
            requested_capabilities,
            status,
            requested_at: Utc::now(),
            decided_at: if decided { Some(Utc::now()) } else { None },
        });
        id
    }

    /// Decides a pending enrollment.
    ///
    /// # Arguments
    /// - `enrollment_id`: The enrollment to decide.
    /// - `status`: The decision (`Approved`, `Rejected` or `Blocked`).
    ///
    /// # Errors
    /// This function errors if the enrollment is unknown or not pending.
    pub fn decide(&self, enrollment_id: &str, status: EnrollmentStatus) -> Result<Enrollment, Error> {
        let mut entry = match self.enrollments.get_mut(enrollment_id) {
            Some(entry) => entry,
            None => {
                return Err(Error::UnknownEnrollment { id: enrollment_id.into() });
            },
        };
        if entry.status != EnrollmentStatus::Pending {
            return Err(Error::IllegalDecision { id: enrollment_id.into(), status: entry.status });
        }

        entry.status = status;
        entry.decided_at = Some(Utc::now());
        info!("Enrollment '{}' for node '{}' decided: {:?}", enrollment_id, entry.node_id, status);
        Ok(entry.clone())
    }

    /// Returns a clone of the given enrollment.
    #[inline]
    pub fn get(&self, enrollment_id: &str) -> Option<Enrollment> { self.enrollments.get(enrollment_id).map(|entry| entry.clone()) }

    /// Returns clones of all enrollments, newest first.
    pub fn list(&self) -> Vec<Enrollment> {
        let mut all: Vec<Enrollment> = self.enrollments.iter().map(|entry| entry.clone()).collect();
        all.sort_by(|lhs, rhs| rhs.requested_at.cmp(&lhs.requested_at));
        all
    }
}





/***** TESTS *****/
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_verify_and_regenerate() {
        let (mut token, secret): (BootstrapToken, String) = BootstrapToken::generate();
        assert!(token.verify(&secret));
        assert!(!token.verify("wrong"));

        // Disabling rejects even the right secret
        token.is_enabled = false;
        assert!(!token.verify(&secret));
        token.is_enabled = true;

        // Regeneration invalidates the old secret
        let fresh: String = token.regenerate();
        assert!(!token.verify(&secret));
        assert!(token.verify(&fresh));
        assert!(token.last_regenerated_at.is_some());
    }

    #[test]
    fn test_registration_without_token_is_denied() {
        let (service, _secret): (EnrollmentService, String) = EnrollmentService::new();
        let decision: EnrollmentDecision = service.handle_registration("n1", "node-1", vec![], None);
        assert!(matches!(decision, EnrollmentDecision::Denied { .. }));
        assert_eq!(service.list()[0].status, EnrollmentStatus::Failed);
    }

    #[test]
    fn test_auto_approve_flow() {
        let (service, secret): (EnrollmentService, String) = EnrollmentService::new();
        service.set_auto_approve(true);
        let decision: EnrollmentDecision = service.handle_registration("n1", "node-1", vec!["shell".into()], Some(&secret));
        assert_eq!(decision, EnrollmentDecision::Approved);
        // The approval is remembered for re-registration, even without the token
        let decision: EnrollmentDecision = service.handle_registration("n1", "node-1", vec![], None);
        assert_eq!(decision, EnrollmentDecision::Approved);
    }

    #[test]
    fn test_manual_approval_flow() {
        let (service, secret): (EnrollmentService, String) = EnrollmentService::new();
        let decision: EnrollmentDecision = service.handle_registration("n1", "node-1", vec![], Some(&secret));
        let enrollment_id: String = match decision {
            EnrollmentDecision::Pending { enrollment_id } => enrollment_id,
            other => panic!("Expected Pending, got {other:?}"),
        };

        // Until decided, the node keeps waiting
        service.decide(&enrollment_id, EnrollmentStatus::Approved).unwrap();
        let decision: EnrollmentDecision = service.handle_registration("n1", "node-1", vec![], Some(&secret));
        assert_eq!(decision, EnrollmentDecision::Approved);

        // Deciding twice is illegal
        assert!(matches!(service.decide(&enrollment_id, EnrollmentStatus::Rejected), Err(Error::IllegalDecision { .. })));
    }

    #[test]
    fn test_blocked_node_stays_blocked() {
        let (service, secret): (EnrollmentService, String) = EnrollmentService::new();
        let decision: EnrollmentDecision = service.handle_registration("n1", "node-1", vec![], Some(&secret));
        let enrollment_id: String = match decision {
            EnrollmentDecision::Pending { enrollment_id } => enrollment_id,
            other => panic!("Expected Pending, got {other:?}"),
        };
        service.decide(&enrollment_id, EnrollmentStatus::Blocked).unwrap();

        let decision: EnrollmentDecision = service.handle_registration("n1", "node-1", vec![], Some(&secret));
        assert!(matches!(decision, EnrollmentDecision::Denied { .. }));
    }
}

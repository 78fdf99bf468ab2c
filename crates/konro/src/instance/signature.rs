//! # Instance Signature
//!
//! A [`Signature`] is the equivalence key used to decide whether two
//! instance declarations may share an execution thread. Equality is a
//! *consumable* relation: once a signature has been used to satisfy a
//! pairing it is disabled so it cannot be reused, after which it compares
//! unequal to everything, including itself.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::InstanceGroup;

/// Equivalence key over an instance's declared group configuration and
/// device id, with a match-enabled flag.
///
/// Two signatures are equal iff both are match-enabled, their device ids are
/// equal, and their group configurations are equivalent in the fields that
/// affect runtime behavior. Disabling matching on either side forces
/// inequality under all scenarios; this is how signatures that have already
/// been matched are filtered out of later pairings.
#[derive(Debug)]
pub struct Signature {
    group: InstanceGroup,
    device_id: i32,
    /// Cannot match another signature if false
    can_match: AtomicBool,
}

impl Signature {
    /// Creates a match-enabled signature for one declared replica.
    pub fn new(group: InstanceGroup, device_id: i32) -> Self {
        Self {
            group,
            device_id,
            can_match: AtomicBool::new(true),
        }
    }

    pub fn device_id(&self) -> i32 {
        self.device_id
    }

    pub fn group(&self) -> &InstanceGroup {
        &self.group
    }

    pub fn can_match(&self) -> bool {
        self.can_match.load(Ordering::SeqCst)
    }

    pub fn enable_matching(&self) {
        self.can_match.store(true, Ordering::SeqCst);
    }

    pub fn disable_matching(&self) {
        self.can_match.store(false, Ordering::SeqCst);
    }
}

impl Clone for Signature {
    fn clone(&self) -> Self {
        Self {
            group: self.group.clone(),
            device_id: self.device_id,
            can_match: AtomicBool::new(self.can_match()),
        }
    }
}

impl PartialEq for Signature {
    fn eq(&self, other: &Self) -> bool {
        self.can_match()
            && other.can_match()
            && self.device_id == other.device_id
            && equivalent_in_instance_config(&self.group, &other.group)
    }
}

/// Whether two group declarations would produce interchangeable runtime
/// behavior.
///
/// Name, replica count, and the declared device list are excluded: identity
/// and cardinality do not change how an instance behaves, and the concrete
/// device binding is already part of the signature key.
fn equivalent_in_instance_config(lhs: &InstanceGroup, rhs: &InstanceGroup) -> bool {
    lhs.kind == rhs.kind
        && lhs.passive == rhs.passive
        && lhs.profile == rhs.profile
        && lhs.host_policy == rhs.host_policy
        && lhs.rate_limiter == rhs.rate_limiter
        && lhs.secondary_devices == rhs.secondary_devices
}

//! Hash position of an identity within a test.
//!
//! A position is a number in `[0, 1)` derived from SHA1 of the test's hash
//! salt followed by the identity. It depends on nothing else, so every client
//! computes the same position for the same identity without coordination.
//!
//! Tests whose type is RANDOM, or whose salt starts with
//! [`RANDOM_SALT_PREFIX`], draw a fresh position on every call instead.

use abmatrix_validation::{TestDefinition, TestType};
use sha1::{Digest, Sha1};

/// Salts starting with this are shared by linked tests and hashed without the test name.
pub const LINKED_SALT_PREFIX: &str = "&";

/// Salts starting with this re-randomize on every resolution.
pub const RANDOM_SALT_PREFIX: &str = "random:";

const POSITION_SCALE: f64 = 4_294_967_296.0; // 2^32

/// Hash input for a test: linked salts stand alone, others are scoped to the test name.
pub fn hash_salt(test_name: &str, salt: &str) -> String {
    if salt.starts_with(LINKED_SALT_PREFIX) {
        salt.to_string()
    } else {
        format!("{test_name}|{salt}")
    }
}

pub fn is_randomized(def: &TestDefinition) -> bool {
    def.test_type == TestType::Random || def.salt.starts_with(RANDOM_SALT_PREFIX)
}

/// Deterministic position of `identity` for a test.
pub fn position(identity: &str, test_name: &str, salt: &str) -> f64 {
    let mut hasher = Sha1::new();
    hasher.update(hash_salt(test_name, salt).as_bytes());
    hasher.update(identity.as_bytes());
    let digest = hasher.finalize();

    let word = u32::from_be_bytes([digest[12], digest[13], digest[14], digest[15]]);
    f64::from(word) / POSITION_SCALE
}

/// Assigns positions for one test, honoring its random mode.
#[derive(Debug, Clone)]
pub struct HashAssigner {
    test_name: String,
    salt: String,
    randomized: bool,
}

impl HashAssigner {
    pub fn new(test_name: &str, def: &TestDefinition) -> Self {
        Self {
            test_name: test_name.to_string(),
            salt: def.salt.clone(),
            randomized: is_randomized(def),
        }
    }

    pub fn is_randomized(&self) -> bool {
        self.randomized
    }

    /// Position for this request. Randomized tests ignore `identity`.
    pub fn position(&self, identity: Option<&str>) -> f64 {
        match identity {
            Some(identity) if !self.randomized => position(identity, &self.test_name, &self.salt),
            _ => fastrand::f64(),
        }
    }
}

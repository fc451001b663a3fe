use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Sortable unique id, used to name index generations and scratch files.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Hash, PartialOrd, Ord)]
pub struct Eid(String);

impl Display for Eid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Eid {
    #[inline]
    pub fn new() -> Eid {
        Eid(rusty_ulid::generate_ulid_string())
    }
}

impl Default for Eid {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_ids_are_unique_and_sortable() {
        let a = Eid::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = Eid::new();
        assert_ne!(a, b);
        assert!(a < b);
        assert_eq!(a.to_string().len(), 26);
    }
}

//! Identifier and seed generation.

use rand::Rng;

/// Generate a fresh task identifier (UUID v4, hyphenated).
pub fn new_task_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Generate a random generation seed different from `previous`.
pub fn fresh_seed(previous: Option<u64>) -> u64 {
    let mut rng = rand::rng();
    loop {
        let seed = u64::from(rng.random::<u32>());
        if Some(seed) != previous {
            return seed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_are_unique() {
        assert_ne!(new_task_id(), new_task_id());
    }

    #[test]
    fn fresh_seed_never_repeats_previous() {
        for _ in 0..100 {
            let old = fresh_seed(None);
            assert_ne!(fresh_seed(Some(old)), old);
        }
    }
}

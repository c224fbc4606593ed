use std::collections::HashMap;

use uuid::Uuid;

/// Deterministic identifier source for one import run.
///
/// The same base name always hashes to the same UUIDv5; repeats within the
/// run get `-2`, `-3`, ... suffixes so no two records collide.
#[derive(Debug, Default)]
pub struct IdGenerator {
    seen: HashMap<Uuid, usize>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self, base: &str) -> String {
        let id = Uuid::new_v5(&Uuid::NAMESPACE_URL, base.trim().as_bytes());
        let count = self.seen.entry(id).or_insert(0);
        *count += 1;
        if *count == 1 {
            id.to_string()
        } else {
            format!("{id}-{count}")
        }
    }
}

use rand::Rng;
use std::collections::HashSet;

use crate::error::InstancerError;

/// Picks host ports for new instances by sampling the configured range
/// at random and rejecting collisions. Attempts are bounded so a nearly
/// full range surfaces `PortExhausted` instead of spinning.
///
/// Callers must hold the instance store lock across allocate + insert,
/// otherwise two concurrent starts can pick the same port.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    start: u16,
    end: u16,
    max_attempts: u32,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16, max_attempts: u32) -> Self {
        assert!(start <= end, "port range is inverted");
        Self {
            start,
            end,
            max_attempts,
        }
    }

    pub fn allocate(
        &self,
        server_id: i32,
        in_use: &HashSet<u16>,
    ) -> Result<u16, InstancerError> {
        let mut rng = rand::thread_rng();

        for _ in 0..self.max_attempts {
            let candidate = rng.gen_range(self.start..=self.end);
            if !in_use.contains(&candidate) {
                return Ok(candidate);
            }
        }

        Err(InstancerError::PortExhausted {
            server_id,
            attempts: self.max_attempts,
        })
    }
}

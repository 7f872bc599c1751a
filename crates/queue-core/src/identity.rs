// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker instance identity (spec.md §3.2).
//!
//! A `WorkerInstance` id is the only coordination primitive between workers:
//! there is no registry, no leader, no gossip. It only needs to be stable
//! for the lifetime of the process and collision-resistant across
//! containers sharing a host.

use std::time::{SystemTime, UNIX_EPOCH};

/// Build a worker instance id, preferring an explicit override (spec.md §6.2
/// `APP_INSTANCE_ID`) and otherwise deriving `<host>-<random>` from the OS
/// hostname and a process-unique token.
pub fn worker_instance_id(override_id: Option<&str>) -> String {
    if let Some(id) = override_id {
        return id.to_string();
    }

    let host = gethostname::gethostname()
        .into_string()
        .unwrap_or_else(|_| "unknown-host".to_string());

    format!("{host}-{}", random_token())
}

fn random_token() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let pid = std::process::id() as u64;
    format!("{:x}", nanos ^ pid.rotate_left(32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_id_is_used_verbatim() {
        assert_eq!(worker_instance_id(Some("fixed-id")), "fixed-id");
    }

    #[test]
    fn generated_id_contains_a_host_and_a_token() {
        let id = worker_instance_id(None);
        assert!(id.contains('-'));
        assert!(id.len() > "unknown-host-".len());
    }

    #[test]
    fn generated_ids_are_distinct_across_calls() {
        let a = worker_instance_id(None);
        std::thread::sleep(std::time::Duration::from_millis(1));
        let b = worker_instance_id(None);
        assert_ne!(a, b);
    }
}

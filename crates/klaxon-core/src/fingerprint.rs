//! Stable event fingerprinting.
//!
//! The fingerprint identifies "the same underlying problem" across raw
//! events and is the alert deduplication key, so it must be reproducible
//! across restarts and across language runtimes: SHA-256 over the four
//! identity fields joined with `|` in the order
//! `item | resource_id | resource_type | alert_source`.

use klaxon_types::Event;
use sha2::{Digest, Sha256};

/// Compute the content fingerprint for the given identity fields.
pub fn event_fingerprint(
    item: &str,
    resource_id: &str,
    resource_type: &str,
    alert_source: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(item.as_bytes());
    hasher.update(b"|");
    hasher.update(resource_id.as_bytes());
    hasher.update(b"|");
    hasher.update(resource_type.as_bytes());
    hasher.update(b"|");
    hasher.update(alert_source.as_bytes());
    hex_digest(hasher)
}

/// Fingerprint derived from an event's own identity fields.
pub fn fingerprint_for(event: &Event) -> String {
    event_fingerprint(
        &event.item,
        &event.resource_id,
        &event.resource_type,
        &event.source_name,
    )
}

/// Key for per-session state entries: `{fingerprint}:{session_id}`.
///
/// The fingerprint is fixed-width hex, so the `:` separator cannot collide
/// with fingerprint content.
pub fn session_key(fingerprint: &str, session_id: u64) -> String {
    format!("{fingerprint}:{session_id}")
}

fn hex_digest(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn fingerprint_is_deterministic() {
        let a = event_fingerprint("cpu_usage", "host-1", "host", "zabbix");
        let b = event_fingerprint("cpu_usage", "host-1", "host", "zabbix");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn distinct_fields_do_not_collide_on_concatenation() {
        // "ab" + "c" vs "a" + "bc" must differ thanks to the separator.
        let a = event_fingerprint("ab", "c", "t", "s");
        let b = event_fingerprint("a", "bc", "t", "s");
        assert_ne!(a, b);
    }

    #[test]
    fn session_keys_embed_the_sequence_number() {
        let fp = event_fingerprint("disk", "host-2", "host", "prom");
        assert_eq!(session_key(&fp, 3), format!("{fp}:3"));
        assert_ne!(session_key(&fp, 3), session_key(&fp, 4));
    }

    proptest! {
        #[test]
        fn fingerprint_idempotent_for_arbitrary_inputs(
            item in ".{0,32}",
            resource_id in ".{0,32}",
            resource_type in ".{0,16}",
            source in ".{0,16}",
        ) {
            let first = event_fingerprint(&item, &resource_id, &resource_type, &source);
            let second = event_fingerprint(&item, &resource_id, &resource_type, &source);
            prop_assert_eq!(first, second);
        }
    }
}

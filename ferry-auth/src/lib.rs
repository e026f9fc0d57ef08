//! Credential store and packet authentication for the collectd protocol.
//!
//! The collectd network protocol can sign packets with HMAC-SHA256 or encrypt them with
//! AES-256-OFB, both based on shared secrets per user. The [`AuthStore`] holds these secrets and
//! picks up changes to the credential file without a restart. The [`CryptoGate`] enforces the
//! minimum [`SecurityLevel`] of a listener and unwraps frames before they are decoded.
#![warn(missing_docs)]

mod gate;
mod store;

pub use self::gate::*;
pub use self::store::*;

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;
    use std::time::Duration;

    use ferry_collectd::RawValue;
    use ferry_collectd::testutils::PacketBuilder;

    use super::*;

    #[tokio::test]
    async fn test_hot_reload_accepts_new_user() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("passwd");
        fs::write(&path, "alice: wonderland\n").unwrap();

        let store = Arc::new(AuthStore::open(&path).unwrap());
        let gate = CryptoGate::new(SecurityLevel::Sign, Some(store.clone()));

        let frame = PacketBuilder::new()
            .host("web01")
            .type_name("gauge")
            .values(&[RawValue::Gauge(1.0)])
            .build_signed("bob", "builder");

        assert_eq!(
            gate.gate(&frame),
            Err(GateError::UnknownUser("bob".to_owned()))
        );

        let watcher = tokio::spawn(store.clone().watch(Duration::from_millis(10)));
        fs::write(&path, "alice: wonderland\nbob: builder\n").unwrap();

        let mut accepted = false;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if gate.gate(&frame).is_ok() {
                accepted = true;
                break;
            }
        }

        watcher.abort();
        assert!(accepted);
    }
}

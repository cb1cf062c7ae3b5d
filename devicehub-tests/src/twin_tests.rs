//! Twin reconciliation round-trip tests, driven over the mock broker the
//! way a device and an application would interleave.

#[cfg(test)]
mod tests {
    use crate::helpers::HubFixture;
    use devicehub_core::{topics, TwinAccepted, TwinDelta, TwinUpdateRequest};
    use serde_json::json;
    use std::time::Duration;

    const UUID: &str = "9205255a-7a56-43b1-8b51-3b2a83fca4a1";

    fn update(value: serde_json::Value) -> TwinUpdateRequest {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_reconciliation_scenario() {
        let hub = HubFixture::new(false).await;

        // Device reports its state, then fetches the twin
        hub.twin
            .apply_update(UUID, update(json!({ "reported": { "x": 1 } })))
            .await
            .unwrap();
        hub.twin.handle_get(UUID).await;

        let accepted = hub
            .mqtt
            .published_on(&topics::twin_update_accepted(UUID))
            .await;
        let fetched: TwinAccepted = serde_json::from_slice(accepted.last().unwrap()).unwrap();
        assert_eq!(fetched.reported.version, 1);
        assert_eq!(fetched.reported.doc["x"], 1);

        // Application raises the desired state; the device gets a delta
        hub.twin
            .apply_update(UUID, update(json!({ "desired": { "x": 2 } })))
            .await
            .unwrap();

        let deltas = hub.mqtt.published_on(&topics::twin_update_delta(UUID)).await;
        let delta: TwinDelta = serde_json::from_slice(deltas.last().unwrap()).unwrap();
        assert_eq!(delta.delta["x"], 2);
        assert_eq!(delta.desired_version, 2);
        assert_eq!(delta.reported_version, 1);

        // Device converges; no further delta is published
        hub.mqtt.clear_published().await;
        hub.twin
            .apply_update(UUID, update(json!({ "reported": { "x": 2 } })))
            .await
            .unwrap();
        assert!(hub
            .mqtt
            .published_on(&topics::twin_update_delta(UUID))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_versions_monotonic_across_interleaved_updates() {
        let hub = HubFixture::new(false).await;

        let mut last_version = 0;
        for i in 0..5 {
            let accepted = hub
                .twin
                .apply_update(UUID, update(json!({ "reported": { "count": i } })))
                .await
                .unwrap();
            let version = accepted.updated.reported.unwrap();
            assert_eq!(version, last_version + 1);
            last_version = version;
        }
    }

    #[tokio::test]
    async fn test_mqtt_driven_flow() {
        let hub = HubFixture::new(false).await;
        hub.twin.start().await.unwrap();

        hub.mqtt
            .inject_message(
                &topics::twin_update(UUID),
                &serde_json::to_vec(&json!({ "reported": { "fw": "1.4.0" } })).unwrap(),
            )
            .await
            .unwrap();
        hub.mqtt
            .inject_message(&topics::twin_get(UUID), b"")
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;

        let accepted = hub
            .mqtt
            .published_on(&topics::twin_update_accepted(UUID))
            .await;
        assert_eq!(accepted.len(), 2);
        let fetched: TwinAccepted = serde_json::from_slice(accepted.last().unwrap()).unwrap();
        assert_eq!(fetched.reported.doc["fw"], "1.4.0");
    }

    #[tokio::test]
    async fn test_rejected_update_leaves_documents_untouched() {
        let hub = HubFixture::new(false).await;

        hub.twin
            .apply_update(UUID, update(json!({ "reported": { "x": 1 } })))
            .await
            .unwrap();

        hub.twin
            .handle_update(
                UUID,
                &serde_json::to_vec(&json!({ "reported": "not an object" })).unwrap(),
            )
            .await;

        let pair = hub.store.twin_get(UUID).await.unwrap();
        assert_eq!(pair.reported.version, 1);
        assert_eq!(pair.reported.doc["x"], 1);
    }
}

use crate::config::DbusMode;
use crate::engine::EngineStatus;
use sentinel_core::EnrollmentStore;
use std::sync::Arc;
use tokio::sync::watch;
use zbus::interface;

pub const BUS_NAME: &str = "org.sentinel.Sentinel1";
pub const OBJECT_PATH: &str = "/org/sentinel/Sentinel1";

/// Read-mostly D-Bus surface of the daemon.
///
/// Bus name: org.sentinel.Sentinel1
/// Object path: /org/sentinel/Sentinel1
pub struct SentinelService {
    status: watch::Receiver<EngineStatus>,
    store: Arc<EnrollmentStore>,
}

impl SentinelService {
    pub fn new(status: watch::Receiver<EngineStatus>, store: Arc<EnrollmentStore>) -> Self {
        Self { status, store }
    }

    fn status_json(&self) -> serde_json::Value {
        let status = self.status.borrow().clone();
        let gallery = self.store.snapshot();
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "engine": status,
            "identities": gallery.len(),
            "enrollment_path": self.store.path().map(|p| p.display().to_string()),
        })
    }
}

#[interface(name = "org.sentinel.Sentinel1")]
impl SentinelService {
    /// Engine phase, fault, counters and enrollment summary as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(self.status_json().to_string())
    }

    /// Most recent decision as JSON, or `null` before the first one.
    async fn last_decision(&self) -> zbus::fdo::Result<String> {
        let last = self.status.borrow().last_decision.clone();
        serde_json::to_string(&last).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Enrolled identities (without embeddings) as JSON.
    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        let gallery = self.store.snapshot();
        let list: Vec<_> = gallery
            .identities()
            .iter()
            .map(|i| {
                serde_json::json!({
                    "identity_id": i.identity_id,
                    "display_name": i.display_name,
                    "references": i.reference_embeddings.len(),
                })
            })
            .collect();
        Ok(serde_json::Value::from(list).to_string())
    }

    /// Re-read the enrollment file. Sessions already running keep their snapshot.
    async fn reload(&self) -> zbus::fdo::Result<u32> {
        tracing::info!("enrollment reload requested");
        match self.store.reload() {
            Ok(count) => Ok(count as u32),
            Err(e) => {
                tracing::warn!(error = %e, "enrollment reload failed, keeping previous set");
                Err(zbus::fdo::Error::Failed(e.to_string()))
            }
        }
    }
}

/// Claim the bus name and export the service.
pub async fn serve(mode: DbusMode, service: SentinelService) -> zbus::Result<Option<zbus::Connection>> {
    let builder = match mode {
        DbusMode::Off => return Ok(None),
        DbusMode::System => zbus::connection::Builder::system()?,
        DbusMode::Session => zbus::connection::Builder::session()?,
    };
    let conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await?;
    Ok(Some(conn))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_core::{Decision, Embedding, EnrolledIdentity};

    fn service() -> (watch::Sender<EngineStatus>, SentinelService) {
        let store = Arc::new(
            EnrollmentStore::in_memory(vec![EnrolledIdentity {
                identity_id: "alice".into(),
                display_name: "Alice".into(),
                reference_embeddings: vec![Embedding::new(vec![1.0, 0.0]), Embedding::new(vec![0.0, 1.0])],
            }])
            .unwrap(),
        );
        let (tx, rx) = watch::channel(EngineStatus::default());
        (tx, SentinelService::new(rx, store))
    }

    #[tokio::test]
    async fn test_status_reports_phase_and_counts() {
        let (tx, svc) = service();
        tx.send_modify(|s| s.unauthorized = 4);
        let v: serde_json::Value = serde_json::from_str(&svc.status().await.unwrap()).unwrap();
        assert_eq!(v["engine"]["phase"], "idle");
        assert_eq!(v["engine"]["unauthorized"], 4);
        assert_eq!(v["identities"], 1);
    }

    #[tokio::test]
    async fn test_last_decision_roundtrip() {
        let (tx, svc) = service();
        assert_eq!(svc.last_decision().await.unwrap(), "null");

        tx.send_modify(|s| s.last_decision = Some(Decision::unauthorized(7, 3, Some(0.82))));
        let v: serde_json::Value = serde_json::from_str(&svc.last_decision().await.unwrap()).unwrap();
        assert_eq!(v["session_id"], 7);
        assert_eq!(v["outcome"], "unauthorized");
    }

    #[tokio::test]
    async fn test_list_identities_hides_embeddings() {
        let (_tx, svc) = service();
        let v: serde_json::Value = serde_json::from_str(&svc.list_identities().await.unwrap()).unwrap();
        assert_eq!(v[0]["identity_id"], "alice");
        assert_eq!(v[0]["references"], 2);
        assert!(v[0].get("reference_embeddings").is_none());
    }

    #[tokio::test]
    async fn test_reload_without_file_fails() {
        let (_tx, svc) = service();
        assert!(svc.reload().await.is_err());
    }
}

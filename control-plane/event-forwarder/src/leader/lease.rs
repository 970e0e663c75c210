use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::{
    Client,
    api::{Api, PostParams},
};
use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::LeadershipWriter;

#[derive(Debug, Clone)]
pub struct LeaseConfig {
    pub name: String,
    pub namespace: String,
    pub identity: String,
    pub lease_duration: Duration,
    pub renew_interval: Duration,
    pub release_on_cancel: bool,
}

/// What to do with an existing lease on this round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseDecision {
    /// We hold it; bump `renewTime`.
    Renew,
    /// Vacant or expired; take it over.
    Acquire,
    /// Someone else holds a live lease.
    Follow { holder: String },
}

pub fn decide(lease: &Lease, identity: &str, now: DateTime<Utc>) -> LeaseDecision {
    let spec = lease.spec.as_ref();
    let holder = spec
        .and_then(|s| s.holder_identity.as_deref())
        .unwrap_or_default();
    if holder == identity {
        LeaseDecision::Renew
    } else if holder.is_empty() || is_expired(spec, now) {
        LeaseDecision::Acquire
    } else {
        LeaseDecision::Follow {
            holder: holder.to_string(),
        }
    }
}

fn is_expired(spec: Option<&LeaseSpec>, now: DateTime<Utc>) -> bool {
    let Some(spec) = spec else {
        return true;
    };
    let Some(last) = spec.renew_time.as_ref().or(spec.acquire_time.as_ref())
    else {
        return true;
    };
    let secs = i64::from(spec.lease_duration_seconds.unwrap_or(0).max(0));
    last.0 + chrono::Duration::seconds(secs) < now
}

/// `$POD_NAME` or `$HOSTNAME` plus a random suffix, so a restarted pod never
/// mistakes its predecessor's lease for its own.
pub fn default_identity() -> String {
    let host = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "event-forwarder".to_string());
    let suffix: u32 = rand::rng().random();
    format!("{host}_{suffix:08x}")
}

fn is_conflict(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 409)
}

/// Leader election over a `coordination.k8s.io/v1` Lease.
pub struct LeaseElector {
    api: Api<Lease>,
    cfg: LeaseConfig,
    writer: LeadershipWriter,
}

impl LeaseElector {
    pub fn new(client: Client, cfg: LeaseConfig, writer: LeadershipWriter) -> Self {
        let api = Api::namespaced(client, &cfg.namespace);
        Self { api, cfg, writer }
    }

    /// Acquire and renew until `shutdown` fires.
    ///
    /// Each round is bounded by the time left on our own lease, so a hung
    /// API server cannot keep this replica leading past the point where
    /// others consider the lease expired.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(lease = %self.cfg.name, namespace = %self.cfg.namespace, identity = %self.cfg.identity, "leader election started");
        let mut last_renew: Option<Instant> = None;
        loop {
            let deadline = self.round_deadline(last_renew);
            let round = tokio::select! {
                _ = shutdown.cancelled() => break,
                r = tokio::time::timeout(deadline, self.try_acquire_or_renew()) => r,
            };
            match round {
                Ok(Ok(true)) => {
                    last_renew = Some(Instant::now());
                    self.writer.set_leader(true);
                }
                Ok(Ok(false)) => {
                    last_renew = None;
                    self.writer.set_leader(false);
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "lease update failed");
                    self.step_down_if_stale(&mut last_renew);
                }
                Err(_) => {
                    warn!(timeout_ms = deadline.as_millis() as u64, "lease update timed out");
                    self.step_down_if_stale(&mut last_renew);
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.cfg.renew_interval) => {}
            }
        }

        if self.writer.is_leader() {
            self.writer.set_leader(false);
            if self.cfg.release_on_cancel
                && tokio::time::timeout(self.cfg.lease_duration, self.release())
                    .await
                    .is_err()
            {
                warn!("lease release timed out");
            }
        }
    }

    /// Time budget for one acquire/renew round: whatever is left of our
    /// lease while leading, a full lease duration otherwise.
    fn round_deadline(&self, last_renew: Option<Instant>) -> Duration {
        match last_renew {
            Some(at) => self.cfg.lease_duration.saturating_sub(at.elapsed()),
            None => self.cfg.lease_duration,
        }
    }

    fn step_down_if_stale(&self, last_renew: &mut Option<Instant>) {
        if let Some(at) = *last_renew {
            if at.elapsed() >= self.cfg.lease_duration {
                warn!("lease not renewed within its duration; stepping down");
                *last_renew = None;
                self.writer.set_leader(false);
            }
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, kube::Error> {
        let now = Utc::now();
        let Some(mut lease) = self.api.get_opt(&self.cfg.name).await? else {
            return self.create(now).await;
        };

        let decision = decide(&lease, &self.cfg.identity, now);
        let prev = lease.spec.take().unwrap_or_default();
        let spec = match decision {
            LeaseDecision::Renew => LeaseSpec {
                renew_time: Some(MicroTime(now)),
                lease_duration_seconds: Some(self.duration_secs()),
                ..prev
            },
            LeaseDecision::Acquire => {
                info!(previous = ?prev.holder_identity, "taking over lease");
                LeaseSpec {
                    holder_identity: Some(self.cfg.identity.clone()),
                    acquire_time: Some(MicroTime(now)),
                    renew_time: Some(MicroTime(now)),
                    lease_duration_seconds: Some(self.duration_secs()),
                    lease_transitions: Some(prev.lease_transitions.unwrap_or(0) + 1),
                    ..prev
                }
            }
            LeaseDecision::Follow { holder } => {
                trace!(%holder, "lease held elsewhere");
                return Ok(false);
            }
        };
        lease.spec = Some(spec);

        // resourceVersion from the read makes this a compare-and-swap.
        match self
            .api
            .replace(&self.cfg.name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_conflict(&e) => {
                debug!("lost lease update race");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn create(&self, now: DateTime<Utc>) -> Result<bool, kube::Error> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.cfg.name.clone()),
                namespace: Some(self.cfg.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.cfg.identity.clone()),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_duration_seconds: Some(self.duration_secs()),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        };
        match self.api.create(&PostParams::default(), &lease).await {
            Ok(_) => {
                info!(lease = %self.cfg.name, "lease created");
                Ok(true)
            }
            Err(e) if is_conflict(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Clear the holder so a standby can take over without waiting out the
    /// lease duration.
    async fn release(&self) {
        let mut lease = match self.api.get_opt(&self.cfg.name).await {
            Ok(Some(lease)) => lease,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "could not read lease for release");
                return;
            }
        };
        let Some(spec) = lease.spec.as_mut() else {
            return;
        };
        if spec.holder_identity.as_deref() != Some(self.cfg.identity.as_str()) {
            return;
        }
        spec.holder_identity = None;
        spec.lease_duration_seconds = Some(1);
        spec.renew_time = Some(MicroTime(Utc::now()));
        match self
            .api
            .replace(&self.cfg.name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => info!(lease = %self.cfg.name, "lease released"),
            Err(e) => warn!(error = %e, "lease release failed"),
        }
    }

    fn duration_secs(&self) -> i32 {
        i32::try_from(self.cfg.lease_duration.as_secs()).unwrap_or(i32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn lease(holder: Option<&str>, renewed: Option<i64>, duration: i32) -> Lease {
        Lease {
            spec: Some(LeaseSpec {
                holder_identity: holder.map(str::to_string),
                renew_time: renewed.map(|s| MicroTime(at(s))),
                lease_duration_seconds: Some(duration),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn renews_own_lease() {
        let l = lease(Some("me"), Some(1000), 15);
        assert_eq!(decide(&l, "me", at(1005)), LeaseDecision::Renew);
        // Even when expired, our own lease is simply renewed.
        assert_eq!(decide(&l, "me", at(5000)), LeaseDecision::Renew);
    }

    #[test]
    fn follows_live_lease_of_other() {
        let l = lease(Some("other"), Some(1000), 15);
        assert_eq!(
            decide(&l, "me", at(1015)),
            LeaseDecision::Follow {
                holder: "other".into()
            }
        );
    }

    #[test]
    fn acquires_expired_lease() {
        let l = lease(Some("other"), Some(1000), 15);
        assert_eq!(decide(&l, "me", at(1016)), LeaseDecision::Acquire);
    }

    #[test]
    fn acquires_vacant_or_specless_lease() {
        assert_eq!(
            decide(&lease(None, Some(1000), 15), "me", at(1001)),
            LeaseDecision::Acquire
        );
        assert_eq!(
            decide(&lease(Some(""), Some(1000), 15), "me", at(1001)),
            LeaseDecision::Acquire
        );
        assert_eq!(decide(&Lease::default(), "me", at(0)), LeaseDecision::Acquire);
    }

    #[test]
    fn lease_without_timestamps_counts_as_expired() {
        let l = lease(Some("other"), None, 15);
        assert_eq!(decide(&l, "me", at(0)), LeaseDecision::Acquire);
    }

    mod elector {
        use super::*;
        use crate::leader::{LeaderState, Leadership};
        use chrono::SecondsFormat;
        use serde_json::{Value, json};
        use wiremock::{
            Mock, MockServer, ResponseTemplate,
            matchers::{method, path},
        };

        const LEASES: &str = "/apis/coordination.k8s.io/v1/namespaces/default/leases";
        const LEASE: &str =
            "/apis/coordination.k8s.io/v1/namespaces/default/leases/forwarder-leader";

        fn client_for(server: &MockServer) -> Client {
            let _ = rustls::crypto::CryptoProvider::install_default(
                rustls::crypto::aws_lc_rs::default_provider(),
            );
            let config = kube::Config::new(server.uri().parse().unwrap());
            Client::try_from(config).unwrap()
        }

        fn cfg() -> LeaseConfig {
            LeaseConfig {
                name: "forwarder-leader".into(),
                namespace: "default".into(),
                identity: "me".into(),
                lease_duration: Duration::from_secs(2),
                renew_interval: Duration::from_millis(500),
                release_on_cancel: true,
            }
        }

        fn lease_json(holder: &str) -> Value {
            let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
            json!({
                "apiVersion": "coordination.k8s.io/v1",
                "kind": "Lease",
                "metadata": {
                    "name": "forwarder-leader",
                    "namespace": "default",
                    "resourceVersion": "1"
                },
                "spec": {
                    "holderIdentity": holder,
                    "acquireTime": now,
                    "renewTime": now,
                    "leaseDurationSeconds": 2,
                    "leaseTransitions": 0
                }
            })
        }

        async fn mount_create(server: &MockServer) {
            Mock::given(method("GET"))
                .and(path(LEASE))
                .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                    "kind": "Status",
                    "apiVersion": "v1",
                    "metadata": {},
                    "status": "Failure",
                    "message": "leases.coordination.k8s.io \"forwarder-leader\" not found",
                    "reason": "NotFound",
                    "code": 404
                })))
                .up_to_n_times(1)
                .mount(server)
                .await;
            Mock::given(method("POST"))
                .and(path(LEASES))
                .respond_with(ResponseTemplate::new(201).set_body_json(lease_json("me")))
                .mount(server)
                .await;
        }

        async fn eventually(cond: impl Fn() -> bool, within: Duration) {
            let start = Instant::now();
            while start.elapsed() < within {
                if cond() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            panic!("condition not reached within {within:?}");
        }

        #[tokio::test]
        async fn steps_down_when_api_server_hangs() {
            let server = MockServer::start().await;
            mount_create(&server).await;
            Mock::given(method("GET"))
                .and(path(LEASE))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_json(lease_json("me"))
                        .set_delay(Duration::from_secs(20)),
                )
                .mount(&server)
                .await;

            let (writer, state) = LeaderState::channel();
            let shutdown = CancellationToken::new();
            let runner = tokio::spawn(
                LeaseElector::new(client_for(&server), cfg(), writer)
                    .run(shutdown.clone()),
            );

            eventually(|| state.is_leader(), Duration::from_secs(2)).await;
            let acquired = Instant::now();

            eventually(|| !state.is_leader(), Duration::from_secs(4)).await;
            assert!(
                acquired.elapsed() < Duration::from_secs(3),
                "stepped down after {:?}",
                acquired.elapsed()
            );

            shutdown.cancel();
            tokio::time::timeout(Duration::from_secs(1), runner)
                .await
                .expect("elector stops on shutdown")
                .unwrap();
        }

        #[tokio::test]
        async fn renews_then_releases_on_shutdown() {
            let server = MockServer::start().await;
            mount_create(&server).await;
            Mock::given(method("GET"))
                .and(path(LEASE))
                .respond_with(ResponseTemplate::new(200).set_body_json(lease_json("me")))
                .mount(&server)
                .await;
            Mock::given(method("PUT"))
                .and(path(LEASE))
                .respond_with(ResponseTemplate::new(200).set_body_json(lease_json("me")))
                .mount(&server)
                .await;

            let (writer, state) = LeaderState::channel();
            let shutdown = CancellationToken::new();
            let runner = tokio::spawn(
                LeaseElector::new(client_for(&server), cfg(), writer)
                    .run(shutdown.clone()),
            );

            eventually(|| state.is_leader(), Duration::from_secs(2)).await;
            tokio::time::sleep(Duration::from_millis(1200)).await;
            assert!(state.is_leader(), "renewals keep leadership");

            shutdown.cancel();
            tokio::time::timeout(Duration::from_secs(3), runner)
                .await
                .expect("elector stops on shutdown")
                .unwrap();
            assert!(!state.is_leader());

            let puts: Vec<Value> = server
                .received_requests()
                .await
                .unwrap_or_default()
                .iter()
                .filter(|r| r.method.as_str() == "PUT")
                .map(|r| serde_json::from_slice(&r.body).unwrap())
                .collect();
            assert!(puts.len() >= 2, "expected renewals and a release");
            let renewal = &puts[0];
            assert_eq!(renewal["spec"]["holderIdentity"], "me");
            let release = puts.last().unwrap();
            assert!(release["spec"].get("holderIdentity").is_none());
        }
    }

    #[test]
    fn identity_has_random_suffix() {
        let a = default_identity();
        let b = default_identity();
        assert!(a.contains('_'));
        assert_ne!(a, b);
    }
}

#[cfg(test)]
mod tests {
    use crate::config::IntakeSettings;
    use crate::intake::{IntakeReport, IntakeRouter};
    use crate::pull::PullWorker;
    use async_trait::async_trait;
    use eventcache_core::batch::batch_channel;
    use eventcache_core::{BatchSender, Event, PersistSummary, QueryRouter, QuerySpec, StorageService};
    use mockall::predicate::*;
    use mockall::*;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::watch;
    use tokio_test::{assert_err, assert_ok};
    use tonic::{Code, Status};

    mock! {
        pub Storage {}
        #[async_trait]
        impl StorageService for Storage {
            fn kind(&self) -> &'static str;
            async fn start(&self) -> Result<(), Status>;
            async fn stop(&self) -> Result<(), Status>;
            async fn persist(&self, events: Vec<Event>) -> Result<PersistSummary, Status>;
            async fn query(&self, spec: &QuerySpec, sink: BatchSender) -> Result<(), Status>;
        }
    }

    fn reading(sid: &str, second: u32) -> Value {
        json!({
            "SID": sid,
            "timestamp": format!("2024-03-01T12:00:{second:02}Z"),
            "temperature": 20 + second,
        })
    }

    fn accepting_cache() -> MockStorage {
        let mut cache = MockStorage::new();
        cache.expect_kind().return_const("mock-cache");
        cache.expect_persist().returning(|events| {
            Ok(PersistSummary {
                persisted: events.len(),
                failed: 0,
            })
        });
        cache
    }

    fn settings() -> IntakeSettings {
        IntakeSettings {
            max_batch_size: 10,
            max_time_millis: 5000,
            mailbox_capacity: 16,
        }
    }

    #[tokio::test]
    async fn test_intake_caches_only_valid_events_once() {
        let mut cache = MockStorage::new();
        cache
            .expect_persist()
            .withf(|events: &Vec<Event>| {
                events.len() == 2 && events.iter().all(|e| e.sid() == "sensor-1")
            })
            .times(1)
            .returning(|events| {
                Ok(PersistSummary {
                    persisted: events.len(),
                    failed: 0,
                })
            });

        let mut intake = IntakeRouter::new(&settings(), Arc::new(cache));
        let report = intake
            .accept(vec![
                reading("sensor-1", 0),
                json!({"timestamp": "2024-03-01T12:00:00Z"}),
                json!({"SID": "sensor-1"}),
                reading("sensor-1", 1),
                json!("not an event"),
            ])
            .await;

        assert_eq!(
            report,
            IntakeReport {
                received: 5,
                accepted: 2,
                rejected: 3,
            }
        );
        let stats = intake.stats();
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.rejected, 3);
    }

    #[tokio::test]
    async fn test_cache_failure_keeps_events_queued() {
        let mut cache = MockStorage::new();
        cache.expect_kind().return_const("mock-cache");
        cache
            .expect_persist()
            .times(1)
            .returning(|_| Err(Status::unavailable("cache is down")));

        let mut intake = IntakeRouter::new(&settings(), Arc::new(cache));
        let report = intake
            .accept(vec![reading("sensor-1", 0), reading("sensor-1", 1)])
            .await;
        assert_eq!(report.accepted, 2);
        assert_eq!(intake.stats().persist_failures, 1);

        let drained = intake.drain_next();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].fields()["temperature"], json!(20));
        assert_eq!(intake.stats().queued, 0);
    }

    #[tokio::test]
    async fn test_empty_batch_skips_cache() {
        let mut cache = MockStorage::new();
        cache.expect_persist().never();

        let mut intake = IntakeRouter::new(&settings(), Arc::new(cache));
        let report = intake.accept(vec![json!({"SID": 7})]).await;
        assert_eq!(report.accepted, 0);
        assert!(intake.drain_next().is_empty());
    }

    #[tokio::test]
    async fn test_drained_batches_are_bounded() {
        let mut intake = IntakeRouter::new(&settings(), Arc::new(accepting_cache()));
        let events: Vec<Value> = (0..25).map(|n| reading("sensor-1", n)).collect();
        intake.accept(events).await;

        assert_eq!(intake.drain_next().len(), 10);
        assert_eq!(intake.drain_next().len(), 10);
        assert_eq!(intake.drain_next().len(), 5);
        assert!(intake.drain_next().is_empty());
    }

    #[tokio::test]
    async fn test_handle_round_trip() {
        let intake = IntakeRouter::new(&settings(), Arc::new(accepting_cache()));
        let (handle, task) = intake.spawn(4);

        let report = assert_ok!(handle.accept(vec![reading("a", 0), reading("a", 1)]).await);
        assert_eq!(report.accepted, 2);
        assert_eq!(assert_ok!(handle.stats().await).queued, 2);

        let pulled = assert_ok!(handle.pull().await);
        assert_eq!(pulled.len(), 2);
        assert!(assert_ok!(handle.pull().await).is_empty());

        drop(handle);
        assert_ok!(task.await);
    }

    #[tokio::test]
    async fn test_handle_fails_after_shutdown() {
        let intake = IntakeRouter::new(&settings(), Arc::new(accepting_cache()));
        let (handle, task) = intake.spawn(4);
        assert_ok!(handle.accept(vec![reading("a", 0)]).await);

        let stats = assert_ok!(handle.shutdown().await);
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.queued, 1);
        assert_ok!(task.await);

        let status = assert_err!(handle.pull().await);
        assert_eq!(status.code(), Code::Unavailable);
    }

    #[tokio::test]
    async fn test_router_keeps_cache_answer() {
        let mut cache = MockStorage::new();
        cache.expect_kind().return_const("mock-cache");
        cache.expect_query().times(1).returning(|_, _| Ok(()));
        let mut store = MockStorage::new();
        store.expect_query().never();

        let router = QueryRouter::new(Arc::new(cache), Arc::new(store));
        let (sender, _receiver) = batch_channel("router-cache");
        assert_ok!(router.query(&QuerySpec::latest(["a"]), sender).await);
    }

    #[tokio::test]
    async fn test_router_falls_back_with_same_query() {
        let spec = QuerySpec::from_bounds(
            vec!["a".to_string(), "b".to_string()],
            Some("2024-03-01T12:00:00Z"),
            Some("2024-03-01T13:00:00Z"),
        )
        .unwrap();

        let mut cache = MockStorage::new();
        cache.expect_kind().return_const("mock-cache");
        cache
            .expect_query()
            .times(1)
            .returning(|_, _| Err(Status::not_found("Range not cached")));
        let mut store = MockStorage::new();
        store.expect_kind().return_const("mock-store");
        store
            .expect_query()
            .with(eq(spec.clone()), always())
            .times(1)
            .returning(|_, _| Ok(()));

        let router = QueryRouter::new(Arc::new(cache), Arc::new(store));
        let (sender, _receiver) = batch_channel("router-fallback");
        assert_ok!(router.query(&spec, sender).await);
    }

    #[tokio::test]
    async fn test_router_returns_store_error() {
        let mut cache = MockStorage::new();
        cache.expect_kind().return_const("mock-cache");
        cache
            .expect_query()
            .returning(|_, _| Err(Status::internal("broken")));
        let mut store = MockStorage::new();
        store.expect_kind().return_const("mock-store");
        store
            .expect_query()
            .times(1)
            .returning(|_, _| Err(Status::failed_precondition("store is not running")));

        let router = QueryRouter::new(Arc::new(cache), Arc::new(store));
        let (sender, _receiver) = batch_channel("router-error");
        let status = assert_err!(router.query(&QuerySpec::latest(["a"]), sender).await);
        assert_eq!(status.code(), Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn test_pull_once_writes_to_store() {
        let (intake, task) = IntakeRouter::new(&settings(), Arc::new(accepting_cache())).spawn(4);
        assert_ok!(intake.accept(vec![reading("a", 0), reading("a", 1), reading("a", 2)]).await);

        let mut store = MockStorage::new();
        store.expect_kind().return_const("mock-store");
        store
            .expect_persist()
            .withf(|events: &Vec<Event>| events.len() == 3)
            .times(1)
            .returning(|events| {
                Ok(PersistSummary {
                    persisted: events.len(),
                    failed: 0,
                })
            });

        let worker = PullWorker::new(intake.clone(), Arc::new(store), Duration::from_millis(10));
        assert_eq!(assert_ok!(worker.pull_once().await), 3);
        assert_eq!(assert_ok!(worker.pull_once().await), 0);

        drop(worker);
        drop(intake);
        assert_ok!(task.await);
    }

    #[tokio::test]
    async fn test_store_failure_is_not_retried() {
        let (intake, _task) = IntakeRouter::new(&settings(), Arc::new(accepting_cache())).spawn(4);
        assert_ok!(intake.accept(vec![reading("a", 0)]).await);

        let mut store = MockStorage::new();
        store.expect_kind().return_const("mock-store");
        store
            .expect_persist()
            .times(1)
            .returning(|_| Err(Status::internal("disk full")));

        let worker = PullWorker::new(intake.clone(), Arc::new(store), Duration::from_millis(10));
        assert_eq!(assert_ok!(worker.pull_once().await), 1);
        assert_eq!(assert_ok!(intake.stats().await).queued, 0);
    }

    #[tokio::test]
    async fn test_worker_drains_until_shutdown() {
        let (intake, _task) = IntakeRouter::new(&settings(), Arc::new(accepting_cache())).spawn(4);
        assert_ok!(intake.accept(vec![reading("a", 0), reading("b", 1)]).await);

        let mut store = MockStorage::new();
        store.expect_kind().return_const("mock-store");
        store.expect_persist().times(2).returning(|events| {
            Ok(PersistSummary {
                persisted: events.len(),
                failed: 0,
            })
        });

        let (stop, stopped) = watch::channel(false);
        let writer = PullWorker::new(intake.clone(), Arc::new(store), Duration::from_millis(5))
            .spawn(stopped);

        while assert_ok!(intake.stats().await).queued > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // Both persists must have returned before the writer asks again.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_ok!(stop.send(true));
        assert_ok!(writer.await);
    }
}

//! Inbound processing for an agent: unsolicited data lands in the local
//! store and wakes the transfer methods that depend on it.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use telemetra_core::message::{HookToUri, RequestData};
use telemetra_core::{Message, Metric, Payload, Sample, TimeUuid};
use telemetra_sched::TransferMethodsIndex;
use telemetra_store::LocalStore;
use tracing::{debug, info, warn};

use crate::session::{InboundHandler, Session};

pub struct AgentHandler {
    store: Arc<LocalStore>,
    index: TransferMethodsIndex,
    hook_timeout: Duration,
}

impl AgentHandler {
    pub fn new(store: Arc<LocalStore>, index: TransferMethodsIndex) -> Self {
        AgentHandler {
            store,
            index,
            hook_timeout: Duration::from_secs(30),
        }
    }

    /// Stores samples and notifies the scheduler once for the batch.
    fn ingest(&self, samples: Vec<Sample>, in_reply_to: Option<TimeUuid>) -> usize {
        let mut updated: Vec<Metric> = Vec::new();
        let mut newest: Option<TimeUuid> = None;
        for sample in samples {
            match self.store.insert(&sample) {
                Ok(true) => {
                    if !updated.contains(sample.metric()) {
                        updated.push(sample.metric().clone());
                    }
                    newest = newest.max(Some(sample.t()));
                }
                Ok(false) => {}
                Err(err) => warn!(error = %err, "processing.sample_rejected"),
            }
        }
        let Some(t) = newest else {
            return 0;
        };
        self.store.maybe_purge();
        self.index.metrics_updated(t, &updated, in_reply_to).len()
    }

    async fn resync(&self, session: &Session) {
        for (metric, last) in self.store.unsynced_metrics() {
            let hooked = match HookToUri::new(metric.uri()) {
                Ok(hook) => session
                    .send_immediate(Message::new(hook), self.hook_timeout)
                    .await
                    .map(|reply| is_success(&reply))
                    .unwrap_or(false),
                Err(err) => {
                    warn!(error = %err, "processing.rehook_invalid");
                    false
                }
            };
            if !hooked {
                warn!(uri = %metric.uri(), "processing.rehook_failed");
                continue;
            }
            let request = match RequestData::new(metric.uri(), last, None, None) {
                Ok(request) => request,
                Err(err) => {
                    warn!(error = %err, "processing.resync_invalid");
                    continue;
                }
            };
            match session.request_data(request).await {
                Ok(replies) => {
                    let complete = replies.last().map(is_success).unwrap_or(false);
                    for reply in replies {
                        self.handle(reply).await;
                    }
                    if complete {
                        self.store.mark_synced(&metric);
                    }
                    info!(uri = %metric.uri(), complete, "processing.resynced");
                }
                Err(err) => warn!(uri = %metric.uri(), error = %err, "processing.resync_failed"),
            }
        }
    }

    async fn handle(&self, message: Message) {
        let irt = message.in_reply_to();
        match message.into_payload() {
            Payload::SendDsData(data) => {
                self.ingest(vec![data.to_sample()], irt);
            }
            Payload::SendDpData(data) => {
                self.ingest(vec![data.to_sample()], irt);
            }
            Payload::SendMultiData(data) => {
                self.ingest(data.to_samples(), irt);
            }
            Payload::SendDataInterval(interval) => {
                let launched = self.ingest(interval.samples_oldest_first(), irt);
                self.store.mark_synced(interval.metric());
                debug!(
                    uri = %interval.metric().uri(),
                    rows = interval.data().len(),
                    launched,
                    "processing.interval_received"
                );
            }
            Payload::GenericResponse(response) => {
                debug!(
                    status = response.status(),
                    error = response.error(),
                    "processing.unmatched_response"
                );
            }
            other => debug!(action = %other.action(), "processing.ignored"),
        }
    }
}

fn is_success(message: &Message) -> bool {
    matches!(message.payload(), Payload::GenericResponse(response) if response.is_success())
}

impl InboundHandler for AgentHandler {
    fn process(&self, message: Message) -> BoxFuture<'_, ()> {
        self.handle(message).boxed()
    }

    fn on_disconnect(&self) {
        self.store.mark_unsynced();
    }

    fn on_reconnect<'a>(&'a self, session: &'a Session) -> BoxFuture<'a, ()> {
        self.resync(session).boxed()
    }

    fn on_close(&self) {
        self.index.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use telemetra_core::message::{GenericResponse, SendDataInterval, SendDpData};
    use telemetra_core::{MetricKind, SampleValue, SendOptions, TieBreak, Uplink};
    use telemetra_sched::{IndexConfig, Schedule, TransferMethod};

    use crate::session::{SessionConfig, SessionState};
    use crate::testing::{eventually, next_end, FakeAuthenticator, FakeConnector};

    /// Acknowledges everything.
    struct AckUplink;

    impl Uplink for AckUplink {
        fn send_message(&self, message: Message, _options: SendOptions) -> BoxFuture<'_, Option<Message>> {
            async move {
                let ok = GenericResponse::new(200, 0, None).expect("response");
                Some(Message::reply(ok, message.sequence()))
            }
            .boxed()
        }
    }

    fn at(micros: i64) -> TimeUuid {
        TimeUuid::from_micros(micros, TieBreak::Random).expect("timeuuid")
    }

    fn value(text: &str) -> SampleValue {
        SampleValue::parse(MetricKind::Datapoint, text).expect("value")
    }

    async fn agent(counter: Arc<AtomicUsize>, uplink: Arc<dyn Uplink>) -> (AgentHandler, Arc<LocalStore>) {
        let store = Arc::new(LocalStore::new("alice"));
        let index = TransferMethodsIndex::with_config(store.clone(), uplink, IndexConfig::default());
        let cpu = Metric::datapoint("bob:host.cpu").expect("metric");
        let job = TransferMethod::new("watch", move |_ctx| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Vec::new())
            }
        })
        .schedule(Schedule::on_update([cpu]));
        index.add(job, true).await;
        (AgentHandler::new(store.clone(), index), store)
    }

    #[tokio::test]
    async fn data_is_stored_and_wakes_jobs() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (handler, store) = agent(counter.clone(), Arc::new(AckUplink)).await;
        let cpu = Metric::datapoint("bob:host.cpu").expect("metric");
        let message = Message::new(SendDpData::new("bob:host.cpu", at(10), "3.5").expect("dp"));
        handler.process(message.clone()).await;
        handler.process(message).await;
        assert_eq!(store.len(&cpu), 1);
        assert!(eventually(|| counter.load(Ordering::SeqCst) == 1).await);
    }

    #[tokio::test]
    async fn intervals_are_stored_and_mark_the_metric_synced() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (handler, store) = agent(counter.clone(), Arc::new(AckUplink)).await;
        let cpu = Metric::datapoint("bob:host.cpu").expect("metric");
        assert!(!store.is_synced(&cpu));
        let interval = SendDataInterval::new(
            cpu.clone(),
            at(1),
            at(30),
            vec![(at(30), value("3")), (at(20), value("2")), (at(10), value("1"))],
        )
        .expect("interval");
        handler.process(Message::new(interval)).await;
        assert_eq!(store.len(&cpu), 3);
        assert!(store.is_synced(&cpu));
        assert!(eventually(|| counter.load(Ordering::SeqCst) == 1).await);
    }

    #[tokio::test]
    async fn disconnect_marks_unsynced_and_close_stops_the_index() {
        let (handler, store) = agent(Arc::new(AtomicUsize::new(0)), Arc::new(AckUplink)).await;
        let cpu = Metric::datapoint("bob:host.cpu").expect("metric");
        store.mark_synced(&cpu);
        handler.on_disconnect();
        assert_eq!(store.unsynced_metrics().len(), 1);
        handler.on_close();
    }

    #[tokio::test]
    async fn reconnect_rehooks_and_requests_missing_data() {
        let auth = Arc::new(FakeAuthenticator::default());
        let (connector, mut ends) = FakeConnector::new();
        let config = SessionConfig {
            reconnect_delay: Duration::from_millis(20),
            ..SessionConfig::default()
        };
        let session = Session::new(config, auth, connector);
        let counter = Arc::new(AtomicUsize::new(0));
        let (handler, store) = agent(counter, Arc::new(AckUplink)).await;
        let cpu = Metric::datapoint("bob:host.cpu").expect("metric");
        let last = at(100);
        store
            .insert(&Sample::new(cpu.clone(), last, value("1")).expect("sample"))
            .expect("insert");
        session.set_handler(Arc::new(handler));
        session.login().await.expect("login");
        drop(next_end(&mut ends).await);

        let mut end = next_end(&mut ends).await;
        let hook = end.recv().await;
        let Payload::HookToUri(hook_payload) = hook.payload() else {
            panic!("expected a hook, got {:?}", hook.action());
        };
        assert_eq!(hook_payload.uri(), "bob:host.cpu");
        end.send(Message::reply(
            GenericResponse::new(200, 0, None).expect("response"),
            hook.sequence(),
        ))
        .await;

        let request = end.recv().await;
        let Payload::RequestData(request_payload) = request.payload() else {
            panic!("expected a data request, got {:?}", request.action());
        };
        assert_eq!(request_payload.start(), Some(last));
        let interval = SendDataInterval::new(cpu.clone(), last, at(300), vec![(at(200), value("2"))])
            .expect("interval");
        end.send(Message::reply(interval, request.sequence())).await;
        end.send(Message::reply(
            GenericResponse::new(200, 0, None).expect("response"),
            request.sequence(),
        ))
        .await;

        assert_eq!(session.wait_for(SessionState::Connected).await, SessionState::Connected);
        assert_eq!(store.len(&cpu), 2);
        assert!(store.is_synced(&cpu));
        assert!(store.unsynced_metrics().is_empty());
        session.close().await;
    }
}

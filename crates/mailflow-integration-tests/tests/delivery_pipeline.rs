//! End-to-end pipeline tests: submission through delivery, retry, and
//! dead-letter isolation, on a manually advanced clock.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use mailflow_core::message::{EmailMessage, EmailRequest, METADATA_FAILURE_REASON};
use mailflow_core::routing::{QueueRouter, QueueTopology};
use mailflow_core::status::{DeliveryStatus, StatusError, StatusStore};
use mailflow_core::submission::{SenderDefaults, SubmissionService};
use mailflow_core::template::{Template, TemplateError, TemplateRenderer, TemplateStore};
use mailflow_core::transport::{Transport, TransportError};
use mailflow_core::worker::DeliveryWorker;
use mailflow_core::{DeliveryOutcome, EventId, PipelineMetrics, SubmissionStatus};
use mailflow_runtime::{BrokerClient, InMemoryBroker, ManualClock, QueueName};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

// ============================================================================
// Pipeline Doubles
// ============================================================================

/// Template store backed by a fixed in-memory set
struct StaticTemplates {
    templates: HashMap<(String, String), Template>,
}

impl StaticTemplates {
    fn new() -> Self {
        Self {
            templates: HashMap::new(),
        }
    }

    fn with(mut self, template_id: &str, locale: &str, subject: &str, html: &str) -> Self {
        self.templates.insert(
            (template_id.to_string(), locale.to_string()),
            Template {
                template_id: template_id.to_string(),
                locale: locale.to_string(),
                subject: subject.to_string(),
                html_body: html.to_string(),
                text_body: None,
                version: None,
            },
        );
        self
    }
}

#[async_trait]
impl TemplateStore for StaticTemplates {
    async fn fetch(
        &self,
        template_id: &str,
        locale: &str,
    ) -> Result<Option<Template>, TemplateError> {
        Ok(self
            .templates
            .get(&(template_id.to_string(), locale.to_string()))
            .cloned())
    }
}

/// Status store that accepts everything and remembers nothing
struct NullStatusStore;

#[async_trait]
impl StatusStore for NullStatusStore {
    async fn log_submission(&self, _record: &DeliveryStatus) -> Result<(), StatusError> {
        Ok(())
    }

    async fn get_status(&self, _event_id: &EventId) -> Result<Option<DeliveryStatus>, StatusError> {
        Ok(None)
    }
}

/// Transport that fails its first `fail_times` calls with a transient error
struct CountingTransport {
    fail_times: u32,
    calls: AtomicU32,
}

impl CountingTransport {
    fn failing(fail_times: u32) -> Self {
        Self {
            fail_times,
            calls: AtomicU32::new(0),
        }
    }

    fn reliable() -> Self {
        Self::failing(0)
    }

    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for CountingTransport {
    fn provider_name(&self) -> &str {
        "counting"
    }

    async fn send(&self, _message: &EmailMessage) -> Result<DeliveryOutcome, TransportError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_times {
            Err(TransportError::transient("counting", "provider unreachable"))
        } else {
            Ok(DeliveryOutcome {
                provider: "counting".to_string(),
                provider_message_id: Some(format!("msg-{call}")),
                duration: std::time::Duration::ZERO,
            })
        }
    }
}

// ============================================================================
// Pipeline Harness
// ============================================================================

struct Pipeline {
    submission: SubmissionService,
    worker: DeliveryWorker,
    broker: Arc<InMemoryBroker>,
    topology: QueueTopology,
    clock: Arc<ManualClock>,
    metrics: Arc<PipelineMetrics>,
    transport: Arc<CountingTransport>,
}

fn pipeline(templates: StaticTemplates, transport: CountingTransport) -> Pipeline {
    let topology = QueueTopology::standard();
    let clock = Arc::new(ManualClock::new());
    let broker = Arc::new(InMemoryBroker::with_clock(
        topology.broker_config(),
        clock.clone(),
    ));
    let router = Arc::new(QueueRouter::new(broker.clone(), topology.clone()));
    let renderer = Arc::new(TemplateRenderer::new(Arc::new(templates), "et"));
    let metrics = Arc::new(PipelineMetrics::new().unwrap());
    let transport = Arc::new(transport);

    let submission = SubmissionService::with_clock(
        renderer,
        router.clone(),
        Arc::new(NullStatusStore),
        SenderDefaults {
            from: "teavitus@example.ee".to_string(),
            reply_to: None,
            default_locale: "et".to_string(),
        },
        clock.clone(),
    );

    let worker = DeliveryWorker::with_clock(
        broker.clone(),
        router,
        transport.clone(),
        metrics.clone(),
        clock.clone(),
        Duration::zero(),
    );

    Pipeline {
        submission,
        worker,
        broker,
        topology,
        clock,
        metrics,
        transport,
    }
}

fn request(event_id: &str, priority: Option<&str>) -> EmailRequest {
    EmailRequest {
        event_id: Some(event_id.to_string()),
        event_type: "appointment_reminder".to_string(),
        recipient_email: "citizen@example.ee".to_string(),
        recipient_name: Some("Mari Maasikas".to_string()),
        template_id: Some("appointment".to_string()),
        template_data: Some(HashMap::from([(
            "name".to_string(),
            serde_json::Value::String("Mari".to_string()),
        )])),
        priority: priority.map(str::to_string),
        locale: None,
        metadata: None,
        scheduled_for: None,
    }
}

fn default_templates() -> StaticTemplates {
    StaticTemplates::new().with(
        "appointment",
        "et",
        "Meeldetuletus: {{name}}",
        "<p>Tere, {{name}}!</p>",
    )
}

impl Pipeline {
    async fn depth(&self, queue: &QueueName) -> usize {
        self.broker.queue_depth(queue).await.unwrap()
    }

    async fn dequeue_decoded(&self, queue: &QueueName) -> EmailMessage {
        let received = self
            .broker
            .receive_message(queue, Duration::zero())
            .await
            .unwrap()
            .expect("queue should hold a message");
        serde_json::from_slice(&received.body).unwrap()
    }

    /// Drive one failed cycle, then let the backoff elapse
    async fn fail_one_cycle(&self) {
        assert!(self.worker.poll_once().await.unwrap());
        // Longest backoff is 60s; overshoot so the retry always re-enters
        self.clock.advance(Duration::seconds(61));
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_submission_renders_and_delivers() {
    let p = pipeline(default_templates(), CountingTransport::reliable());

    let receipt = p
        .submission
        .submit(request("evt-1", None))
        .await
        .unwrap();
    assert_eq!(receipt.status, SubmissionStatus::Queued);

    // Inspect the rendered message on the queue, then deliver it
    let message = p.dequeue_decoded(&p.topology.primary).await;
    assert_eq!(message.content.subject, "Meeldetuletus: Mari");
    assert_eq!(message.content.html_body, "<p>Tere, Mari!</p>");
    assert_eq!(message.from, "teavitus@example.ee");

    // The dequeue above locked the message; wait out the visibility timeout
    p.clock.advance(Duration::seconds(31));
    assert!(p.worker.poll_once().await.unwrap());

    assert_eq!(p.transport.call_count(), 1);
    assert_eq!(p.depth(&p.topology.primary).await, 0);
    assert_eq!(p.depth(&p.topology.retry).await, 0);
    assert_eq!(p.depth(&p.topology.dead_letter).await, 0);
}

#[tokio::test]
async fn test_duplicate_event_delivers_once() {
    let p = pipeline(default_templates(), CountingTransport::reliable());

    let first = p.submission.submit(request("evt-1", None)).await.unwrap();
    let second = p.submission.submit(request("evt-1", None)).await.unwrap();

    assert_eq!(first.status, SubmissionStatus::Queued);
    assert_eq!(second.status, SubmissionStatus::Duplicate);

    assert!(p.worker.poll_once().await.unwrap());
    assert!(!p.worker.poll_once().await.unwrap());
    assert_eq!(p.transport.call_count(), 1);
}

#[tokio::test]
async fn test_transient_failure_recovers_on_retry() {
    let p = pipeline(default_templates(), CountingTransport::failing(1));

    p.submission.submit(request("evt-1", None)).await.unwrap();

    p.fail_one_cycle().await;
    assert!(p.worker.poll_once().await.unwrap());

    assert_eq!(p.transport.call_count(), 2);
    assert_eq!(p.depth(&p.topology.dead_letter).await, 0);
    assert_eq!(
        p.metrics
            .emails_sent
            .with_label_values(&["counting", "appointment_reminder"])
            .get(),
        1
    );
}

#[tokio::test]
async fn test_critical_message_exhausts_five_retries_then_dead_letters() {
    let p = pipeline(default_templates(), CountingTransport::failing(u32::MAX));

    p.submission
        .submit(request("evt-critical", Some("critical")))
        .await
        .unwrap();

    // Five failed delivery cycles; the fifth exhausts the budget
    for _ in 0..4 {
        p.fail_one_cycle().await;
    }
    assert!(p.worker.poll_once().await.unwrap());

    assert_eq!(p.transport.call_count(), 5);
    assert_eq!(p.depth(&p.topology.primary).await, 0);
    assert_eq!(p.depth(&p.topology.retry).await, 0);
    assert_eq!(p.depth(&p.topology.dead_letter).await, 1);

    let dead = p.dequeue_decoded(&p.topology.dead_letter).await;
    assert_eq!(dead.retry_count, 5);
    assert_eq!(dead.max_retries, 5);
    assert_eq!(dead.attempt_count, 5);
    assert!(dead
        .metadata
        .get(METADATA_FAILURE_REASON)
        .unwrap()
        .contains("retries exhausted"));
    assert_eq!(p.metrics.emails_dead_lettered.get(), 1);

    // A sixth delivery cycle never happens
    let long_after = Duration::seconds(300);
    p.clock.advance(long_after);
    assert!(!p.worker.poll_once().await.unwrap());
    assert_eq!(p.transport.call_count(), 5);
}

#[tokio::test]
async fn test_low_priority_dead_letters_after_single_retry() {
    let p = pipeline(default_templates(), CountingTransport::failing(u32::MAX));

    p.submission
        .submit(request("evt-low", Some("low")))
        .await
        .unwrap();

    assert!(p.worker.poll_once().await.unwrap());

    // One failed cycle spends the whole budget
    assert_eq!(p.transport.call_count(), 1);
    assert_eq!(p.depth(&p.topology.retry).await, 0);
    assert_eq!(p.depth(&p.topology.dead_letter).await, 1);

    let dead = p.dequeue_decoded(&p.topology.dead_letter).await;
    assert_eq!(dead.retry_count, 1);
    assert_eq!(dead.max_retries, 1);
}

#[tokio::test]
async fn test_scheduled_submission_waits_until_due() {
    let p = pipeline(default_templates(), CountingTransport::reliable());

    let mut req = request("evt-scheduled", None);
    req.scheduled_for = Some(Utc::now() + Duration::hours(1));
    p.submission.submit(req).await.unwrap();

    // Dequeued before it is due: parked without a delivery attempt
    assert!(p.worker.poll_once().await.unwrap());
    assert_eq!(p.transport.call_count(), 0);
    assert_eq!(p.depth(&p.topology.retry).await, 1);

    p.clock.advance(Duration::hours(1) + Duration::seconds(1));
    assert!(p.worker.poll_once().await.unwrap());
    assert_eq!(p.transport.call_count(), 1);
}

#[tokio::test]
async fn test_locale_falls_back_to_default() {
    let p = pipeline(default_templates(), CountingTransport::reliable());

    let mut req = request("evt-ru", None);
    req.locale = Some("ru".to_string());
    p.submission.submit(req).await.unwrap();

    // No Russian template exists; the Estonian default renders instead
    let message = p.dequeue_decoded(&p.topology.primary).await;
    assert_eq!(message.locale, "ru");
    assert_eq!(message.content.subject, "Meeldetuletus: Mari");
}

#[tokio::test]
async fn test_higher_priority_delivered_first() {
    let p = pipeline(default_templates(), CountingTransport::reliable());

    let mut low = request("evt-low", Some("low"));
    low.recipient_email = "low@example.ee".to_string();
    let mut critical = request("evt-critical", Some("critical"));
    critical.recipient_email = "critical@example.ee".to_string();

    p.submission.submit(low).await.unwrap();
    p.submission.submit(critical).await.unwrap();

    let first = p.dequeue_decoded(&p.topology.primary).await;
    assert_eq!(first.to, "critical@example.ee");
}

#[tokio::test]
async fn test_unconsumed_primary_message_expires_into_dead_letter_queue() {
    let p = pipeline(default_templates(), CountingTransport::reliable());

    // Critical policy allows 60 seconds on the primary queue
    p.submission
        .submit(request("evt-stale", Some("critical")))
        .await
        .unwrap();

    p.clock.advance(Duration::seconds(61));

    assert_eq!(p.depth(&p.topology.primary).await, 0);
    assert_eq!(p.depth(&p.topology.dead_letter).await, 1);
    assert_eq!(p.transport.call_count(), 0);
}

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use telemetry_relay::config::{
    Config, KafkaConfig, PostgresConfig, RelayConfig, RetryConfig, StoreConfig,
};
use telemetry_relay::kafka::MessageSink;
use telemetry_relay::postgres::{EventTime, Record, RecordKey, StoreGateway};
use telemetry_relay::{Error, Result};
use tokio::time::Instant;

/// Get test configuration from environment variables
pub fn get_test_config(table: &str) -> Config {
    // Use TEST_ prefix for test environment variables
    let postgres = PostgresConfig {
        host: env::var("TEST_PG_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: env::var("TEST_PG_PORT")
            .unwrap_or_else(|_| "5432".to_string())
            .parse()
            .unwrap_or(5432),
        database: env::var("TEST_PG_DATABASE").unwrap_or_else(|_| "postgres".to_string()),
        username: env::var("TEST_PG_USERNAME").unwrap_or_else(|_| "postgres".to_string()),
        password: env::var("TEST_PG_PASSWORD").unwrap_or_else(|_| "postgres".to_string()),
        pool_size: 4,
        connect_timeout_secs: 10,
    };

    let store = StoreConfig {
        table: table.to_string(),
        columns: vec![
            "device".to_string(),
            "humidity".to_string(),
            "temperature".to_string(),
        ],
        ..StoreConfig::default()
    };

    let kafka = KafkaConfig {
        brokers: env::var("TEST_KAFKA_BROKERS")
            .unwrap_or_else(|_| "localhost:9092".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .collect(),
        topic: env::var("TEST_KAFKA_TOPIC").unwrap_or_else(|_| "iot-data-test".to_string()),
        acks: "all".to_string(),
        compression: "none".to_string(),
        linger_ms: 0, // Immediate sending for tests
        message_timeout_ms: 5000,
        partitioner: "consistent_random".to_string(),
    };

    let relay = RelayConfig {
        poll_interval_ms: 200,
        batch_size: 10,
        max_in_flight: 4,
        drain_timeout_secs: 5,
        store_backoff_ms: 500,
        retry: RetryConfig::default(),
    };

    Config {
        postgres,
        store,
        kafka,
        relay,
    }
}

/// A telemetry reading taken at 10:`minute` on 2024-05-01.
pub fn telemetry_record(minute: u32, humidity: f64) -> Record {
    let ts = NaiveDate::from_ymd_opt(2024, 5, 1)
        .unwrap()
        .and_hms_opt(10, minute, 0)
        .unwrap();
    record_at(EventTime::Naive(ts), humidity)
}

pub fn record_at(timestamp: EventTime, humidity: f64) -> Record {
    let mut fields = Map::new();
    fields.insert("device".to_string(), json!("inv-07"));
    fields.insert("humidity".to_string(), json!(humidity));
    Record::new(timestamp, fields)
}

struct Row {
    record: Record,
    sent: bool,
}

/// In-memory telemetry table honoring the sent flag and timestamp order.
pub struct MemoryStore {
    rows: Mutex<Vec<Row>>,
    fetch_times: Mutex<Vec<Instant>>,
    fetch_limits: Mutex<Vec<usize>>,
    failing_fetches: AtomicUsize,
}

impl MemoryStore {
    pub fn with_records(records: Vec<Record>) -> Arc<Self> {
        Arc::new(Self {
            rows: Mutex::new(
                records
                    .into_iter()
                    .map(|record| Row {
                        record,
                        sent: false,
                    })
                    .collect(),
            ),
            fetch_times: Mutex::new(Vec::new()),
            fetch_limits: Mutex::new(Vec::new()),
            failing_fetches: AtomicUsize::new(0),
        })
    }

    /// The next `n` fetches fail as if the database were down.
    pub fn fail_next_fetches(&self, n: usize) {
        self.failing_fetches.store(n, Ordering::SeqCst);
    }

    pub fn fetch_times(&self) -> Vec<Instant> {
        self.fetch_times.lock().unwrap().clone()
    }

    pub fn fetch_limits(&self) -> Vec<usize> {
        self.fetch_limits.lock().unwrap().clone()
    }

    pub fn is_sent(&self, key: &RecordKey) -> bool {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .any(|row| &row.record.key == key && row.sent)
    }

    pub fn sent_count(&self) -> usize {
        self.rows.lock().unwrap().iter().filter(|row| row.sent).count()
    }

    pub fn remove(&self, key: &RecordKey) {
        self.rows.lock().unwrap().retain(|row| &row.record.key != key);
    }
}

#[async_trait]
impl StoreGateway for MemoryStore {
    async fn fetch_unprocessed_batch(&self, limit: usize) -> Result<Vec<Record>> {
        self.fetch_times.lock().unwrap().push(Instant::now());
        self.fetch_limits.lock().unwrap().push(limit);

        let failing = self.failing_fetches.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_fetches.store(failing - 1, Ordering::SeqCst);
            return Err(Error::StoreUnavailable {
                message: "connection refused".to_string(),
            });
        }

        let rows = self.rows.lock().unwrap();
        let mut pending: Vec<Record> = rows
            .iter()
            .filter(|row| !row.sent)
            .map(|row| row.record.clone())
            .collect();
        pending.sort_by_key(|record| record.timestamp);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn mark_sent(&self, record: &Record) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        match rows.iter_mut().find(|row| row.record.key == record.key) {
            Some(row) => {
                row.sent = true;
                Ok(())
            }
            None => Err(Error::RecordNotFound {
                key: record.key.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Ack,
    Fail,
}

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub key: String,
    pub payload: Value,
    pub at: Instant,
}

/// Broker double: plays a script of acks and failures, then falls back to a
/// default step. Records every attempt and every accepted message.
pub struct FakeBroker {
    script: Mutex<VecDeque<Step>>,
    default_step: Step,
    latency: Duration,
    attempts: Mutex<Vec<(String, Instant)>>,
    messages: Mutex<Vec<SentMessage>>,
    current: AtomicUsize,
    max_concurrent: AtomicUsize,
}

impl FakeBroker {
    pub fn new(script: Vec<Step>, default_step: Step) -> Arc<Self> {
        Self::with_latency(script, default_step, Duration::ZERO)
    }

    pub fn with_latency(script: Vec<Step>, default_step: Step, latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            default_step,
            latency,
            attempts: Mutex::new(Vec::new()),
            messages: Mutex::new(Vec::new()),
            current: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
        })
    }

    pub fn always_ack() -> Arc<Self> {
        Self::new(Vec::new(), Step::Ack)
    }

    pub fn always_fail() -> Arc<Self> {
        Self::new(Vec::new(), Step::Fail)
    }

    pub fn attempts(&self) -> Vec<(String, Instant)> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn messages(&self) -> Vec<SentMessage> {
        self.messages.lock().unwrap().clone()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageSink for FakeBroker {
    async fn send(&self, key: &str, payload: &[u8]) -> Result<()> {
        self.attempts
            .lock()
            .unwrap()
            .push((key.to_string(), Instant::now()));

        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.current.fetch_sub(1, Ordering::SeqCst);

        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.default_step);

        match step {
            Step::Ack => {
                self.messages.lock().unwrap().push(SentMessage {
                    key: key.to_string(),
                    payload: serde_json::from_slice(payload)?,
                    at: Instant::now(),
                });
                Ok(())
            }
            Step::Fail => Err(Error::BrokerUnavailable {
                message: "broker not available".to_string(),
            }),
        }
    }
}

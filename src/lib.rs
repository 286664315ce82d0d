pub mod bus;
pub mod cdc;
pub mod config;
pub mod deletion;
pub mod devops;
pub mod error;
pub mod fingerprint;
pub mod health;
pub mod ingest;
pub mod match_engine;
pub mod merge_engine;
pub mod model;
pub mod normalize;
pub mod observability;
pub mod relationship;
pub mod sink;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::bus::consumer::{run_consumer_loop, ConsumerMetrics};
use crate::bus::kafka::{KafkaConsumer, KafkaPublisher};
use crate::bus::{EventPublisher, NullPublisher};
use crate::cdc::{CdcDispatcher, CdcEnvelope};
use crate::config::Settings;
use crate::deletion::DeletionEngine;
use crate::ingest::{ExecutionCompletedEvent, ExplicitDeleteMessage, IngestProcessor, IngestRepo, MappedRecordEnvelope};
use crate::match_engine::{MatchConfig, MatchEngine};
use crate::merge_engine::MergeEngine;
use crate::relationship::RelationshipResolver;
use crate::sink::{AgeGraphSink, GraphSink};

/// Start the resolution service: connects to Postgres, wires the
/// ingest/CDC/match/merge/relationship/deletion pipeline onto the
/// configured bus topics, and serves a minimal `/health` and `/metrics`
/// surface. Errors are logged rather than returned so `main` can call this
/// without changing its signature, matching the teacher's `run()` shape.
pub async fn run() {
	let obs_state = match crate::observability::init_observability().await {
		Ok(s) => s,
		Err(e) => {
			eprintln!("warning: failed to initialize observability: {}", e);
			crate::observability::ObservabilityState::default()
		}
	};

	let settings = match crate::config::load() {
		Ok(s) => s,
		Err(e) => {
			eprintln!("warning: failed to load config: {}", e);
			crate::config::Settings::default()
		}
	};

	let Some(database_url) = settings.database_url.clone() else {
		error!("HMD_DATABASE_URL is not set; cannot start");
		return;
	};

	let pool = match connect_with_retry(&database_url).await {
		Ok(p) => p,
		Err(e) => {
			error!(error = %e, "failed to connect to database");
			return;
		}
	};

	let metrics = obs_state.metrics.clone();
	let match_config = match_config_from_settings(&settings);

	let sink: Arc<dyn GraphSink> = Arc::new(AgeGraphSink::new(pool.clone(), settings.age_graph.clone()));
	let resolver = Arc::new(RelationshipResolver::new(pool.clone(), sink.clone(), metrics.clone()));
	let merge_engine = Arc::new(MergeEngine::new(pool.clone(), resolver.clone(), sink.clone(), metrics.clone()));
	let match_engine = Arc::new(MatchEngine::new(pool.clone(), match_config, metrics.clone()));
	let deletion_engine = Arc::new(DeletionEngine::new(pool.clone(), metrics.clone()));
	let ingest_repo = IngestRepo::new(pool.clone());
	let processor = Arc::new(IngestProcessor::new(
		ingest_repo.clone(),
		deletion_engine.clone(),
		resolver.clone(),
		metrics.clone(),
	));

	let publisher: Arc<dyn EventPublisher> = match &settings.kafka_bootstrap_servers {
		Some(servers) => match KafkaPublisher::new(servers, settings.topic_outbound_events.clone()) {
			Ok(p) => Arc::new(p),
			Err(e) => {
				warn!(error = %e, "failed to create kafka publisher, falling back to null publisher");
				Arc::new(NullPublisher)
			}
		},
		None => {
			warn!("HMD_KAFKA_BOOTSTRAP_SERVERS not set; outbound events will be dropped");
			Arc::new(NullPublisher)
		}
	};

	let dispatcher = Arc::new(CdcDispatcher::new(
		ingest_repo.clone(),
		match_engine.clone(),
		merge_engine.clone(),
		resolver.clone(),
		publisher.clone(),
		metrics.clone(),
	));

	let (shutdown_tx, shutdown_rx) = watch::channel(false);

	let consumer_metrics = if let Some(bootstrap) = settings.kafka_bootstrap_servers.clone() {
		spawn_consumers(&settings, bootstrap, processor, dispatcher, shutdown_rx.clone())
	} else {
		warn!("no kafka bootstrap servers configured; bus consumers are disabled, serving health/metrics only");
		Vec::new()
	};

	let app_state = crate::state::AppState {
		pool: pool.clone(),
		sink: sink.clone(),
		metrics: obs_state.metrics.clone(),
		consumer_metrics: Arc::new(consumer_metrics),
	};

	let app = Router::new()
		.route("/health", get(|| async { "OK" }))
		.route("/health/db", get(crate::health::db_health))
		.route(
			"/metrics",
			get(|axum::extract::State(state): axum::extract::State<crate::state::AppState>| async move {
				let mut body = state.metrics.encode();
				for (topic, metrics) in state.consumer_metrics.iter() {
					body.push_str(&metrics.to_prometheus_text(topic));
				}
				body
			}),
		)
		.with_state(app_state);

	let bind_addr = format!("{}:{}", settings.host, settings.port);
	let listener = match TcpListener::bind(&bind_addr).await {
		Ok(l) => l,
		Err(e) => {
			error!(addr = %bind_addr, error = %e, "failed to bind health/metrics listener");
			return;
		}
	};

	info!(addr = %bind_addr, "heimdall listening (GET /health, /health/db, /metrics)");

	if let Err(e) = axum::serve(listener, app).await {
		error!(error = %e, "health/metrics server exited");
	}

	let _ = shutdown_tx.send(true);
}

/// Map the configured match tunables onto the engine's runtime
/// [`MatchConfig`]. SPEC_FULL.md §4.9.
fn match_config_from_settings(settings: &Settings) -> MatchConfig {
	MatchConfig {
		candidate_cap_per_rule: settings.match_candidate_cap_per_rule,
		min_match_score: settings.match_min_score,
		auto_merge_threshold: settings.match_auto_merge_threshold,
		max_candidates: settings.match_max_candidates,
	}
}

/// Run pending versioned SQL migrations (`migrations/`) against
/// `database_url`. Backs the `heimdall migrate` CLI subcommand.
/// SPEC_FULL.md §1 "ambient stack".
pub async fn run_migrations(database_url: &str) -> anyhow::Result<()> {
	let pool = connect_with_retry(database_url).await?;
	sqlx::migrate!("./migrations").run(&pool).await?;
	Ok(())
}

/// Re-drive the match/merge/relationship pipeline over every currently
/// active staged record for `tenant_id`, as if each had just arrived over
/// the CDC topic. Backs the `heimdall replay-backlog` CLI subcommand
/// (SPEC_FULL.md §1 "operational tasks"). Returns the number of staged
/// records processed.
pub async fn replay_tenant_backlog(database_url: &str, tenant_id: &str) -> anyhow::Result<usize> {
	let pool = connect_with_retry(database_url).await?;
	let settings = crate::config::load().unwrap_or_default();
	let metrics = crate::observability::init_metrics()?;
	let match_config = match_config_from_settings(&settings);

	let sink: Arc<dyn GraphSink> = Arc::new(AgeGraphSink::new(pool.clone(), settings.age_graph.clone()));
	let resolver = Arc::new(RelationshipResolver::new(pool.clone(), sink.clone(), metrics.clone()));
	let merge_engine = MergeEngine::new(pool.clone(), resolver.clone(), sink.clone(), metrics.clone());
	let match_engine = MatchEngine::new(pool.clone(), match_config, metrics.clone());
	let ingest_repo = IngestRepo::new(pool.clone());

	let records = ingest_repo.active_staged_records_for_tenant(tenant_id).await?;
	let mut processed = 0;
	for record in &records {
		match_engine.index_record(record).await?;
		let matches = match_engine.find_matches(record).await?;
		let outcome = merge_engine.merge_with_matches(record, &matches).await?;
		resolver
			.resolve_late_endpoints(
				tenant_id,
				&record.entity_type,
				&record.source_id,
				&record.integration,
				record.id,
				outcome.merged.id,
			)
			.await
			.ok();
		processed += 1;
	}
	Ok(processed)
}

async fn connect_with_retry(database_url: &str) -> anyhow::Result<sqlx::PgPool> {
	let max_retries: u32 = std::env::var("HMD_DB_CONNECT_RETRIES")
		.ok()
		.and_then(|s| s.parse().ok())
		.unwrap_or(60);
	let backoff_ms: u64 = std::env::var("HMD_DB_CONNECT_BACKOFF_MS")
		.ok()
		.and_then(|s| s.parse().ok())
		.unwrap_or(1000);

	let mut last_err = None;
	for attempt in 1..=max_retries {
		match PgPoolOptions::new().max_connections(10).connect(database_url).await {
			Ok(pool) => return Ok(pool),
			Err(e) => {
				warn!(attempt, max_retries, error = %e, "database connect attempt failed");
				last_err = Some(e);
				if attempt < max_retries {
					tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
				}
			}
		}
	}
	Err(anyhow::anyhow!(
		"failed to connect after {max_retries} attempts: {}",
		last_err.map(|e| e.to_string()).unwrap_or_default()
	))
}

/// Spawn one background consumer task per inbound topic. Each task runs
/// `bus::consumer::run_consumer_loop` against its own `KafkaConsumer`
/// (separate consumer group suffix per topic) until `shutdown` fires.
/// Returns each topic's label paired with the `ConsumerMetrics` handle it
/// was given, so `/metrics` can render them alongside the registry.
fn spawn_consumers(
	settings: &Settings,
	bootstrap: String,
	processor: Arc<IngestProcessor>,
	dispatcher: Arc<CdcDispatcher>,
	shutdown: watch::Receiver<bool>,
) -> Vec<(String, Arc<ConsumerMetrics>)> {
	let group = settings.kafka_group_id.clone();
	let pool_size = settings.worker_pool_size;
	let channel_capacity = settings.worker_channel_capacity;
	let mut handles = Vec::new();

	{
		let bootstrap = bootstrap.clone();
		let group_id = format!("{group}-mapped-records");
		let topic = settings.topic_mapped_records.clone();
		let processor = processor.clone();
		let shutdown = shutdown.clone();
		let metrics = Arc::new(ConsumerMetrics::default());
		handles.push(("mapped-records".to_string(), metrics.clone()));
		tokio::spawn(async move {
			let process = move |msg: MappedRecordEnvelope| {
				let processor = processor.clone();
				async move {
					if msg.is_relationship() {
						processor.process_relationship(&msg).await?;
					} else {
						processor.process_record(&msg).await?;
					}
					Ok(())
				}
			};
			if let Err(e) = spawn_topic_consumer(
				"mapped-records", &bootstrap, &group_id, &topic, pool_size, channel_capacity, metrics, shutdown, process,
			)
			.await
			{
				error!(error = %e, "mapped-records consumer failed to start");
			}
		});
	}

	{
		let bootstrap = bootstrap.clone();
		let group_id = format!("{group}-explicit-delete");
		let topic = settings.topic_explicit_delete.clone();
		let processor = processor.clone();
		let shutdown = shutdown.clone();
		let metrics = Arc::new(ConsumerMetrics::default());
		handles.push(("explicit-delete".to_string(), metrics.clone()));
		tokio::spawn(async move {
			let process = move |msg: ExplicitDeleteMessage| {
				let processor = processor.clone();
				async move {
					processor.process_explicit_delete(&msg).await?;
					Ok(())
				}
			};
			if let Err(e) = spawn_topic_consumer(
				"explicit-delete", &bootstrap, &group_id, &topic, pool_size, channel_capacity, metrics, shutdown, process,
			)
			.await
			{
				error!(error = %e, "explicit-delete consumer failed to start");
			}
		});
	}

	{
		let bootstrap = bootstrap.clone();
		let group_id = format!("{group}-execution-completed");
		let topic = settings.topic_execution_completed.clone();
		let processor = processor.clone();
		let shutdown = shutdown.clone();
		let metrics = Arc::new(ConsumerMetrics::default());
		handles.push(("execution-completed".to_string(), metrics.clone()));
		tokio::spawn(async move {
			let process = move |evt: ExecutionCompletedEvent| {
				let processor = processor.clone();
				async move {
					processor.process_execution_completed(&evt).await?;
					Ok(())
				}
			};
			if let Err(e) = spawn_topic_consumer(
				"execution-completed", &bootstrap, &group_id, &topic, pool_size, channel_capacity, metrics, shutdown, process,
			)
			.await
			{
				error!(error = %e, "execution-completed consumer failed to start");
			}
		});
	}

	{
		let bootstrap = bootstrap.clone();
		let group_id = format!("{group}-cdc-staged-entities");
		let topic = settings.topic_cdc_staged_entities.clone();
		let dispatcher = dispatcher.clone();
		let shutdown = shutdown.clone();
		let metrics = Arc::new(ConsumerMetrics::default());
		handles.push(("cdc-staged-entities".to_string(), metrics.clone()));
		tokio::spawn(async move {
			let process = move |envelope: CdcEnvelope| {
				let dispatcher = dispatcher.clone();
				async move { dispatch_cdc(dispatcher.dispatch_staged_entity(envelope).await) }
			};
			if let Err(e) = spawn_topic_consumer(
				"cdc-staged-entities", &bootstrap, &group_id, &topic, pool_size, channel_capacity, metrics, shutdown, process,
			)
			.await
			{
				error!(error = %e, "cdc-staged-entities consumer failed to start");
			}
		});
	}

	{
		let group_id = format!("{group}-cdc-staged-relationships");
		let topic = settings.topic_cdc_staged_relationships.clone();
		let dispatcher = dispatcher.clone();
		let metrics = Arc::new(ConsumerMetrics::default());
		handles.push(("cdc-staged-relationships".to_string(), metrics.clone()));
		tokio::spawn(async move {
			let process = move |envelope: CdcEnvelope| {
				let dispatcher = dispatcher.clone();
				async move { dispatch_cdc(dispatcher.dispatch_staged_relationship(envelope).await) }
			};
			if let Err(e) = spawn_topic_consumer(
				"cdc-staged-relationships", &bootstrap, &group_id, &topic, pool_size, channel_capacity, metrics, shutdown, process,
			)
			.await
			{
				error!(error = %e, "cdc-staged-relationships consumer failed to start");
			}
		});
	}

	handles
}

/// Map a `CdcError` to whether the offset should be committed despite the
/// failure. Validation and permanently-unparseable payloads are dropped
/// (committed); transient and logical-conflict failures are retried by
/// leaving the offset uncommitted. SPEC_FULL.md §7.
fn dispatch_cdc(result: Result<(), crate::error::CdcError>) -> anyhow::Result<()> {
	match result {
		Ok(()) => Ok(()),
		Err(e) => match e.class() {
			crate::error::ErrorClass::Validation | crate::error::ErrorClass::PermanentProcessing => {
				warn!(error = %e, "dropping unprocessable CDC event");
				Ok(())
			}
			crate::error::ErrorClass::Transient | crate::error::ErrorClass::LogicalConflict => Err(e.into()),
		},
	}
}

/// Generic single-topic consumer: polls one deserialized message at a
/// time from its own `KafkaConsumer`, runs `process`, and commits the
/// offset only once `process` returns `Ok`. Built on
/// `bus::consumer::run_consumer_loop`'s poll/backoff shape.
async fn spawn_topic_consumer<T, P, Fut>(
	label: &'static str,
	bootstrap: &str,
	group_id: &str,
	topic: &str,
	worker_pool_size: usize,
	worker_channel_capacity: usize,
	metrics: Arc<ConsumerMetrics>,
	shutdown: watch::Receiver<bool>,
	process: P,
) -> anyhow::Result<()>
where
	T: serde::de::DeserializeOwned + Send + 'static,
	P: Fn(T) -> Fut + Send + Sync + 'static,
	Fut: std::future::Future<Output = anyhow::Result<()>> + Send,
{
	let consumer = Arc::new(KafkaConsumer::new(bootstrap, group_id, &[topic])?);
	let process = Arc::new(process);

	let poll_consumer = consumer.clone();
	let commit_consumer = consumer.clone();

	run_consumer_loop(
		label,
		metrics.clone(),
		move || {
			let c = poll_consumer.clone();
			async move {
				match c.poll_one::<T>().await? {
					Some(pair) => Ok(vec![pair]),
					None => Ok(vec![]),
				}
			}
		},
		move |(value, owned): (T, rdkafka::message::OwnedMessage)| {
			let c = commit_consumer.clone();
			let process = process.clone();
			async move {
				process(value).await?;
				c.commit(&owned)?;
				Ok(())
			}
		},
		worker_pool_size,
		worker_channel_capacity,
		shutdown,
	)
	.await;

	Ok(())
}

//! relay demo flows
//!
//! ```text
//! relay-cli [retry|circuit-breaker|split-aggregate|poller|all]
//! ```
//!
//! `RELAY_CONFIG` に JSON 設定ファイルのパスを渡せます（なければデフォルト + `RELAY_*`）。
//! ログは `RUST_LOG` で調整します。

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relay_core::aggregate::{PARTIAL_HEADER, collect_payloads};
use relay_core::app::{
    Endpoint, EndpointGroup, FlowBuilder, Poller, RecoveryAdvice, Stage, configure_with,
};
use relay_core::config::FlowConfig;
use relay_core::impls::TracingEventSink;
use relay_core::ports::{EventSink, MessageHandler, MessageSource};
use relay_core::{FlowError, GuardPolicy, Message, ReceiveTimeout, register};

#[derive(Debug, Deserialize)]
struct Greeting {
    name: String,
}

/// Fails the first `n` calls, then greets.
struct FlakyGreeter {
    remaining_failures: AtomicU32,
}

impl FlakyGreeter {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl MessageHandler for FlakyGreeter {
    async fn handle(&self, message: Message) -> Result<Message, FlowError> {
        let greeting: Greeting =
            serde_json::from_value(message.payload().clone()).map_err(FlowError::transform)?;

        let left = self.remaining_failures.load(Ordering::SeqCst);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(FlowError::transient(format!("intentional failure (left={left})")));
        }

        Ok(message.with_payload(json!(format!("Hello, {}!", greeting.name))))
    }
}

/// Fails whenever the payload says so.
struct Downstream;

#[async_trait]
impl MessageHandler for Downstream {
    async fn handle(&self, message: Message) -> Result<Message, FlowError> {
        match message.payload()["status"].as_str() {
            Some("fail") => Err(FlowError::infrastructure("downstream unavailable")),
            _ => Ok(message.with_payload(json!({ "accepted": message.payload()["order"] }))),
        }
    }
}

/// Prices one order line; lines for "slow" items are lost on purpose.
struct Pricing;

#[async_trait]
impl MessageHandler for Pricing {
    async fn handle(&self, message: Message) -> Result<Message, FlowError> {
        let item = message.payload()["item"].as_str().unwrap_or_default().to_string();
        if item == "slow" {
            return Err(FlowError::transient(format!("no price for {item}")));
        }
        let qty = message.payload()["qty"].as_u64().unwrap_or(1);
        Ok(message.with_payload(json!({ "item": item, "total": qty * 250 })))
    }
}

struct Ticker(AtomicU64);

#[async_trait]
impl MessageSource for Ticker {
    async fn poll(&self) -> Result<Option<Message>, FlowError> {
        let n = self.0.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Message::new(json!({ "tick": n }))))
    }
}

async fn retry_demo(config: &FlowConfig) -> anyhow::Result<()> {
    info!("--- retry ---");
    let listener: Arc<dyn EventSink> = Arc::new(TracingEventSink);
    let greeter = register(
        Arc::new(FlakyGreeter::new(2)),
        GuardPolicy::new("greeter").with_retry(config.retry_policy()),
        listener,
    );

    let flow = FlowBuilder::new("retry-demo")
        .channel(config.channel("requests"))
        .channel(config.channel("replies"))
        .channel(config.channel("errors"))
        .stage(
            Stage::new("greeter", Arc::new(greeter))
                .from("requests")
                .to("replies")
                .errors_to("errors"),
        )
        .build()?;
    let requests = flow.channel("requests").context("requests channel")?;
    let replies = flow.channel("replies").context("replies channel")?;
    let running = flow.start();

    let request = Message::new(json!({ "name": "relay" }));
    info!(message_id = %request.id(), "sending request");
    requests.send(request).await?;

    let reply = replies.receive(Duration::from_secs(60)).await?;
    info!(reply = %reply.payload(), "received reply");

    info!(status = ?running.status().await, "flow status");
    running.shutdown_and_join().await;
    Ok(())
}

async fn circuit_breaker_demo(config: &FlowConfig) -> anyhow::Result<()> {
    info!("--- circuit breaker ---");
    let guarded = Arc::new(register(
        Arc::new(Downstream),
        GuardPolicy::new("downstream").with_breaker(config.breaker_config()),
        Arc::new(TracingEventSink),
    ));
    let breaker = guarded.breaker().cloned().context("breaker configured")?;

    let successes = Arc::new(config.channel("successes"));
    let advised = RecoveryAdvice::new(guarded, |m: &Message, err: &FlowError| {
        m.with_payload(json!({ "order": m.payload()["order"], "recovered": err.to_string() }))
    })
    .with_success_channel(successes.clone());

    let threshold = config.breaker.failure_threshold;
    let statuses = (0..threshold)
        .map(|_| "fail")
        .chain(["ok", "ok"])
        .enumerate();
    for (order, status) in statuses {
        let out = advised
            .handle(Message::new(json!({ "order": order, "status": status })))
            .await?;
        info!(order, status, result = %out.payload(), state = ?breaker.state(), "call finished");
    }

    info!(
        reset_timeout = ?config.breaker_config().reset_timeout,
        "waiting for the breaker to half-open"
    );
    tokio::time::sleep(config.breaker_config().reset_timeout).await;

    let out = advised
        .handle(Message::new(json!({ "order": "trial", "status": "ok" })))
        .await?;
    info!(result = %out.payload(), state = ?breaker.state(), "trial call finished");
    info!(successes = successes.len().await, "success channel");
    Ok(())
}

async fn split_aggregate_demo(config: &FlowConfig) -> anyhow::Result<()> {
    info!("--- splitter / aggregator / reaper ---");
    let aggregated = Arc::new(config.channel("aggregated"));
    let split_aggregate = configure_with(
        Arc::new(|order: &Message| -> Result<Vec<serde_json::Value>, FlowError> {
            match order.payload()["lines"].as_array() {
                Some(lines) => Ok(lines.clone()),
                None => Err(FlowError::transform("order has no lines")),
            }
        }),
        collect_payloads(),
        config.aggregator_config(),
        aggregated.clone(),
        Arc::new(TracingEventSink),
    );
    let reaper = split_aggregate.start_reaper(config.reaper_interval());

    let lines = Arc::new(config.channel("lines"));
    let priced = Arc::new(config.channel("priced"));
    let pricing = EndpointGroup::spawn(
        2,
        Endpoint::new("pricing", lines.clone(), Arc::new(Pricing)).to(priced.clone()),
    );

    let complete = Message::new(json!({ "lines": [
        { "item": "apple", "qty": 2 },
        { "item": "pear", "qty": 1 },
        { "item": "plum", "qty": 4 },
    ]}));
    let incomplete = Message::new(json!({ "lines": [
        { "item": "apple", "qty": 1 },
        { "item": "slow", "qty": 1 },
        { "item": "fig", "qty": 3 },
    ]}));
    split_aggregate.scatter(&complete, &lines).await?;
    split_aggregate.scatter(&incomplete, &lines).await?;

    // feed priced lines back into the aggregator until both groups are done
    let deadline = config.aggregator_config().group_timeout + config.reaper_interval() * 2;
    info!(?deadline, "waiting for aggregated output");
    let started = tokio::time::Instant::now();
    let mut outputs = 0;
    while outputs < 2 && started.elapsed() < deadline {
        tokio::select! {
            part = priced.receive(ReceiveTimeout::After(Duration::from_millis(100))) => {
                if let Ok(part) = part {
                    split_aggregate.aggregate(part).await?;
                }
            }
            done = aggregated.receive(ReceiveTimeout::After(Duration::from_millis(100))) => {
                if let Ok(done) = done {
                    outputs += 1;
                    info!(result = %done.payload(), partial = done.header(PARTIAL_HEADER).is_some(), "aggregated");
                }
            }
        }
    }
    if outputs < 2 {
        warn!(outputs, "not every group produced output (expiry policy is discard)");
    }

    info!(stats = ?split_aggregate.aggregator().stats().await, "aggregator stats");
    pricing.shutdown_and_join().await;
    reaper.shutdown_and_join().await;
    Ok(())
}

async fn poller_demo(config: &FlowConfig) -> anyhow::Result<()> {
    info!("--- dynamic poller ---");
    let ticks = Arc::new(config.channel("ticks"));
    let poller = Poller::spawn(
        Arc::new(Ticker(AtomicU64::new(0))),
        ticks.clone(),
        Duration::from_millis(200),
    );

    for _ in 0..3 {
        let tick = ticks.receive(ReceiveTimeout::Forever).await?;
        info!(tick = %tick.payload(), interval = ?poller.interval(), "polled");
    }
    poller.set_interval(Duration::from_millis(600));
    for _ in 0..2 {
        let tick = ticks.receive(ReceiveTimeout::Forever).await?;
        info!(tick = %tick.payload(), interval = ?poller.interval(), "polled");
    }

    poller.shutdown_and_join().await;
    Ok(())
}

fn load_config() -> anyhow::Result<FlowConfig> {
    match std::env::var("RELAY_CONFIG") {
        Ok(path) => FlowConfig::load(&path).with_context(|| format!("loading {path}")),
        Err(_) => Ok(FlowConfig::from_env()?),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "relay_core=info,relay_cli=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config()?;
    let demo = std::env::args().nth(1).unwrap_or_else(|| "all".into());

    match demo.as_str() {
        "retry" => retry_demo(&config).await?,
        "circuit-breaker" => circuit_breaker_demo(&config).await?,
        "split-aggregate" => split_aggregate_demo(&config).await?,
        "poller" => poller_demo(&config).await?,
        "all" => {
            retry_demo(&config).await?;
            circuit_breaker_demo(&config).await?;
            split_aggregate_demo(&config).await?;
            poller_demo(&config).await?;
        }
        other => bail!("unknown demo '{other}' (expected retry, circuit-breaker, split-aggregate, poller or all)"),
    }
    Ok(())
}

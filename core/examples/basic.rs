//! Basic client usage example
//!
//! Run with `RUST_LOG=rest_breaker=debug` to see the hook output.

use bytes::Bytes;
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use rest_breaker::{
    BufferedBody, CircuitBreaker, FnTransport, ManualClock, RequestContext, RestClient,
    TracingHook, TransportResponse,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[tokio::main]
async fn main() -> rest_breaker::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("=== Rest Breaker Basic Example ===\n");

    // Simulated upstream that fails until marked healthy
    let healthy = Arc::new(AtomicBool::new(true));
    let upstream = healthy.clone();
    let transport = FnTransport::new(move |_| {
        let status = if upstream.load(Ordering::SeqCst) {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        async move {
            Ok(Some(TransportResponse::new(
                status,
                BufferedBody::new(Bytes::from_static(br#"{"status": "paid"}"#)),
            )))
        }
    });

    let clock = Arc::new(ManualClock::new());
    let client = RestClient::builder(transport)
        .circuit_breaker(
            CircuitBreaker::builder("payment_api")
                .active(true)
                .path("/pay")
                .timeout_secs(5)
                .clock(clock.clone())
                .ready_to_trip(|counts| counts.consecutive_failures >= 3)
                .on_open(|name| println!("🔴 Circuit '{}' opened!", name))
                .on_close(|name| println!("🟢 Circuit '{}' closed!", name))
                .on_half_open(|name| println!("🟡 Circuit '{}' half-open, testing...", name)),
        )
        .hook(TracingHook::new("payments"))
        .build()?;

    let ctx = RequestContext::new();
    let target = "http://payments.local/pay";
    let breaker = client.circuit_breaker().cloned().ok_or_else(|| {
        rest_breaker::Error::Config("client was built without a breaker".to_string())
    })?;

    println!("Initial state: {}\n", breaker.state_name());

    println!("--- Successful calls ---");
    for i in 1..=2 {
        match client.get(&ctx, &format!("req-{i}"), target, HeaderMap::new()).await {
            Ok(envelope) => {
                let body = envelope.body().map(|b| &b[..]).unwrap_or_default();
                println!("✓ {}", String::from_utf8_lossy(body));
            }
            Err(e) => println!("✗ Error: {}", e),
        }
    }
    println!("State: {}\n", breaker.state_name());

    println!("--- Triggering failures ---");
    healthy.store(false, Ordering::SeqCst);
    for i in 3..=5 {
        match client.get(&ctx, &format!("req-{i}"), target, HeaderMap::new()).await {
            Ok(_) => println!("✓ Success"),
            Err(e) => println!("✗ {}", e),
        }
    }
    println!("State: {} (circuit opened)\n", breaker.state_name());

    println!("--- Attempting call while open ---");
    match client.get(&ctx, "req-6", target, HeaderMap::new()).await {
        Ok(_) => println!("✓ Success"),
        Err(e) => println!("✗ {}", e),
    }
    println!();

    println!("--- Recovery after cooldown ---");
    healthy.store(true, Ordering::SeqCst);
    clock.advance_secs(5.0);
    match client.get(&ctx, "req-7", target, HeaderMap::new()).await {
        Ok(envelope) => {
            let body: serde_json::Value = envelope.json()?;
            println!("✓ {}", body);
        }
        Err(e) => println!("✗ {}", e),
    }
    println!("State: {}", breaker.state_name());

    let counts = breaker.counts();
    println!(
        "Counts: requests={} successes={} failures={}",
        counts.requests, counts.total_successes, counts.total_failures
    );

    Ok(())
}

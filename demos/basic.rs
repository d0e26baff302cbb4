use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use switchgear::{Action, Config, Failure, Outcome, Switchgear};

// Custom error type that implements Error trait
#[derive(Debug)]
struct ServiceError(String);

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Service error: {}", self.0)
    }
}

impl Error for ServiceError {}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Open after 3 failures in a row, allow a trial call every second
    let switchgear = Switchgear::new(
        Config::builder()
            .default_timeout(Duration::from_millis(200))
            .max_consecutive_failures(3)
            .circuit_open_time(Duration::from_secs(1))
            .build()
            .expect("valid configuration"),
    );

    // The service fails its calls 3 to 8, then recovers
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let action = Action::builder(move || {
        let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
        if (3..=8).contains(&call) {
            Err(ServiceError("External service error".to_string()))
        } else {
            Ok(format!("Success #{}", call))
        }
    })
    .group("external-service")
    .open_fallback(|cause| match cause {
        Some(cause) => format!("Cached response (circuit open after: {})", cause),
        None => "Cached response".to_string(),
    })
    .build();

    for i in 1..=15 {
        println!("\nAttempt {}: ", i);

        match switchgear.execute(&action) {
            Outcome::Value(result) => println!("Call produced: {}", result),
            Outcome::Failed(Failure::Timeout(err)) => println!("Call timed out: {}", err),
            Outcome::Failed(err) => println!("Call failed with error: {}", err),
            Outcome::Empty => println!("Call produced nothing"),
        }

        // Add a small delay between calls
        thread::sleep(Duration::from_millis(300));
    }

    println!(
        "\nThe service was called {} times for 15 attempts",
        calls.load(Ordering::SeqCst)
    );

    // Fan out several calls and collect them together
    let lookups: Vec<Action<u32>> = (1..=4)
        .map(|n| {
            Action::builder(move || {
                thread::sleep(Duration::from_millis(50));
                Ok::<_, ServiceError>(n * n)
            })
            .group("lookups")
            .build()
        })
        .collect();
    let squares: Vec<_> = switchgear
        .execute_in_parallel(&lookups)
        .into_iter()
        .filter_map(Outcome::into_value)
        .collect();
    println!("Parallel lookups: {:?}", squares);
}
